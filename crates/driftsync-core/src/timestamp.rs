//! Hybrid logical clock timestamps.
//!
//! A [`Timestamp`] combines 48 bits of wall time, a 16-bit logical counter,
//! and an 8-byte per-device node id. The triple is totally ordered and the
//! 16-byte big-endian encoding preserves that order under `memcmp`, which
//! is what lets storage index timestamps as raw blobs and lets the
//! reconciliation protocol treat the key space as a byte interval.
//!
//! **The encoding is FROZEN.** Changing it breaks every persisted log and
//! every peer on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::types::{NodeId, NODE_ID_LEN};

/// Encoded size of a timestamp in bytes.
pub const TIMESTAMP_LEN: usize = 16;

/// Largest representable physical time (48 bits of milliseconds).
pub const MAX_MILLIS: u64 = (1 << 48) - 1;

/// Largest counter value within one millisecond.
pub const MAX_COUNTER: u16 = u16::MAX;

/// Default clock-drift tolerance in milliseconds (5 minutes).
pub const DEFAULT_MAX_DRIFT_MS: u64 = 5 * 60 * 1000;

/// A hybrid logical clock timestamp.
///
/// Ordered by `(millis, counter, node_id)`; the derived order equals
/// `memcmp` on [`Timestamp::encode`] output.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    millis: u64,
    counter: u16,
    node_id: NodeId,
}

impl Timestamp {
    /// Create a timestamp, validating the 48-bit millis bound.
    pub fn new(millis: u64, counter: u16, node_id: NodeId) -> Result<Self> {
        if millis > MAX_MILLIS {
            return Err(CoreError::MillisOutOfRange(millis));
        }
        Ok(Self {
            millis,
            counter,
            node_id,
        })
    }

    /// Physical component in Unix milliseconds.
    pub const fn millis(&self) -> u64 {
        self.millis
    }

    /// Logical counter within the millisecond.
    pub const fn counter(&self) -> u16 {
        self.counter
    }

    /// Originating device.
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The smallest timestamp. Lower bound of the full key space.
    pub const ZERO: Self = Self {
        millis: 0,
        counter: 0,
        node_id: NodeId::ZERO,
    };

    /// The largest timestamp. Used as the exclusive upper bound of the
    /// full key space; never produced by a clock.
    pub const MAX: Self = Self {
        millis: MAX_MILLIS,
        counter: MAX_COUNTER,
        node_id: NodeId::MAX,
    };

    /// Encode to the frozen 16-byte big-endian form.
    pub fn encode(&self) -> [u8; TIMESTAMP_LEN] {
        let mut out = [0u8; TIMESTAMP_LEN];
        out[..6].copy_from_slice(&self.millis.to_be_bytes()[2..]);
        out[6..8].copy_from_slice(&self.counter.to_be_bytes());
        out[8..].copy_from_slice(self.node_id.as_bytes());
        out
    }

    /// Decode from the 16-byte form. Every 16-byte value is a valid
    /// timestamp, so this only fails on length.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; TIMESTAMP_LEN] =
            bytes
                .try_into()
                .map_err(|_| CoreError::LengthOverflow {
                    len: bytes.len(),
                    max: TIMESTAMP_LEN,
                })?;
        let mut millis_bytes = [0u8; 8];
        millis_bytes[2..].copy_from_slice(&arr[..6]);
        let mut node = [0u8; NODE_ID_LEN];
        node.copy_from_slice(&arr[8..]);
        Ok(Self {
            millis: u64::from_be_bytes(millis_bytes),
            counter: u16::from_be_bytes([arr[6], arr[7]]),
            node_id: NodeId::from_bytes(node),
        })
    }

    /// The next timestamp in encoding order, or `None` at [`Timestamp::MAX`].
    ///
    /// Used by the reconciler to turn an inclusive list bound into an
    /// exclusive range bound.
    pub fn successor(&self) -> Option<Self> {
        let mut bytes = self.encode();
        for b in bytes.iter_mut().rev() {
            if *b == 0xff {
                *b = 0;
            } else {
                *b += 1;
                return Some(Self::decode(&bytes).expect("16 bytes always decode"));
            }
        }
        None
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Timestamp({}:{}:{})",
            self.millis, self.counter, self.node_id
        )
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.encode()))
    }
}

/// A half-open interval `[lo, hi)` over the timestamp key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampRange {
    /// Inclusive lower bound.
    pub lo: Timestamp,
    /// Exclusive upper bound.
    pub hi: Timestamp,
}

impl TimestampRange {
    /// Create a range. `lo > hi` is normalized to the empty range at `lo`.
    pub fn new(lo: Timestamp, hi: Timestamp) -> Self {
        if lo > hi {
            Self { lo, hi: lo }
        } else {
            Self { lo, hi }
        }
    }

    /// The full key space `[ZERO, MAX)`.
    pub const FULL: Self = Self {
        lo: Timestamp::ZERO,
        hi: Timestamp::MAX,
    };

    /// Whether the range contains no keys.
    pub fn is_empty(&self) -> bool {
        self.lo >= self.hi
    }

    /// Whether `t` lies inside the range.
    pub fn contains(&self, t: &Timestamp) -> bool {
        *t >= self.lo && *t < self.hi
    }
}

/// Per-device hybrid logical clock state.
///
/// `send` and `receive` are pure with respect to the environment: the wall
/// clock is an explicit argument, so deterministic tests drive time
/// directly.
#[derive(Debug, Clone)]
pub struct Hlc {
    last: Timestamp,
    max_drift_ms: u64,
}

impl Hlc {
    /// Create a clock for a device with the default drift tolerance.
    pub fn new(node_id: NodeId) -> Self {
        Self::with_max_drift(node_id, DEFAULT_MAX_DRIFT_MS)
    }

    /// Create a clock with an explicit drift tolerance.
    pub fn with_max_drift(node_id: NodeId, max_drift_ms: u64) -> Self {
        Self {
            last: Timestamp {
                millis: 0,
                counter: 0,
                node_id,
            },
            max_drift_ms,
        }
    }

    /// Restore a clock from a persisted timestamp.
    pub fn from_last(last: Timestamp, max_drift_ms: u64) -> Self {
        Self { last, max_drift_ms }
    }

    /// The most recent timestamp this clock produced or merged.
    pub fn last(&self) -> Timestamp {
        self.last
    }

    /// Produce a timestamp strictly greater than every previous one from
    /// this clock.
    ///
    /// Fails with [`CoreError::ClockDrift`] when the logical time has run
    /// more than `max_drift_ms` ahead of `wall_ms`, and with
    /// [`CoreError::CounterOverflow`] when more than 65535 timestamps are
    /// drawn within one millisecond.
    pub fn send(&mut self, wall_ms: u64) -> Result<Timestamp> {
        let millis = self.last.millis.max(wall_ms);
        self.check_drift(millis, wall_ms)?;

        let counter = if millis == self.last.millis {
            self.last
                .counter
                .checked_add(1)
                .ok_or(CoreError::CounterOverflow)?
        } else {
            0
        };

        self.last = Timestamp::new(millis, counter, self.last.node_id)?;
        Ok(self.last)
    }

    /// Merge a remote timestamp observed at wall time `wall_ms`, advancing
    /// the local clock past it.
    ///
    /// Fails with [`CoreError::ClockDrift`] when the remote timestamp is
    /// further than `max_drift_ms` ahead of the local wall clock.
    pub fn receive(&mut self, remote: Timestamp, wall_ms: u64) -> Result<Timestamp> {
        if remote.millis > wall_ms && remote.millis - wall_ms > self.max_drift_ms {
            return Err(CoreError::ClockDrift {
                drift_ms: remote.millis - wall_ms,
            });
        }

        let millis = self.last.millis.max(remote.millis).max(wall_ms);
        self.check_drift(millis, wall_ms)?;

        let counter = if millis == self.last.millis && millis == remote.millis {
            self.last
                .counter
                .max(remote.counter)
                .checked_add(1)
                .ok_or(CoreError::CounterOverflow)?
        } else if millis == self.last.millis {
            self.last
                .counter
                .checked_add(1)
                .ok_or(CoreError::CounterOverflow)?
        } else if millis == remote.millis {
            remote
                .counter
                .checked_add(1)
                .ok_or(CoreError::CounterOverflow)?
        } else {
            0
        };

        self.last = Timestamp::new(millis, counter, self.last.node_id)?;
        Ok(self.last)
    }

    fn check_drift(&self, millis: u64, wall_ms: u64) -> Result<()> {
        if millis > wall_ms && millis - wall_ms > self.max_drift_ms {
            return Err(CoreError::ClockDrift {
                drift_ms: millis - wall_ms,
            });
        }
        Ok(())
    }
}
