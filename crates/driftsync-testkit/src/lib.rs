//! # driftsync-testkit
//!
//! Testing utilities for the driftsync engine.
//!
//! ## Overview
//!
//! - **Generators**: proptest strategies for timestamps, owners, changes,
//!   and bounded wall-clock walks
//! - **Fixtures**: deterministic replica and relay setups (seeded RNGs,
//!   manual clocks, in-memory transports) for scenario tests
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use driftsync_testkit::generators::timestamp;
//!
//! proptest! {
//!     #[test]
//!     fn codec_roundtrips(ts in timestamp()) {
//!         let bytes = ts.encode();
//!         prop_assert_eq!(driftsync::Timestamp::decode(&bytes).unwrap(), ts);
//!     }
//! }
//! ```
//!
//! ## Scenario Fixtures
//!
//! ```rust,ignore
//! use driftsync_testkit::fixtures::{TestRelay, TestReplica};
//!
//! let a = TestReplica::new(1, 10_000);
//! let b = a.sibling(2);
//! let relay = TestRelay::new();
//! relay.sync(&a, 100).await?;
//! relay.sync(&b, 101).await?;
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{TestRelay, TestReplica};
