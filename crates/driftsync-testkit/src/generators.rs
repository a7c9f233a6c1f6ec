//! Proptest generators for property-based testing.

use std::collections::BTreeSet;

use proptest::prelude::*;

use driftsync_core::{
    Change, NodeId, OwnerId, Timestamp, Value, MAX_MILLIS, NODE_ID_LEN, OWNER_ID_LEN,
};

/// Generate a random node id.
pub fn node_id() -> impl Strategy<Value = NodeId> {
    any::<[u8; NODE_ID_LEN]>().prop_map(NodeId::from_bytes)
}

/// Generate a random owner id.
pub fn owner_id() -> impl Strategy<Value = OwnerId> {
    any::<[u8; OWNER_ID_LEN]>().prop_map(OwnerId::from_bytes)
}

/// Generate a valid timestamp.
pub fn timestamp() -> impl Strategy<Value = Timestamp> {
    (0..=MAX_MILLIS, any::<u16>(), node_id())
        .prop_map(|(millis, counter, node)| Timestamp::new(millis, counter, node).unwrap())
}

/// Generate a set of distinct timestamps.
pub fn timestamp_set(max: usize) -> impl Strategy<Value = BTreeSet<Timestamp>> {
    prop::collection::btree_set(timestamp(), 0..=max)
}

/// Generate a scalar cell value.
pub fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Int),
        // Finite floats only; NaN breaks equality-based round-trip checks.
        (-1e12f64..1e12).prop_map(Value::Real),
        "[a-zA-Z0-9 ]{0,32}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
    ]
}

/// Generate an identifier-ish name.
pub fn name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,15}".prop_map(String::from)
}

/// Generate a row-column change.
pub fn change() -> impl Strategy<Value = Change> {
    (name(), name(), name(), value())
        .prop_map(|(table, row, column, value)| Change::new(table, row, column, value))
}

/// Generate a bounded random walk of wall-clock readings.
///
/// Steps stay within ±1 s of the previous reading, far inside the drift
/// window, so clock operations on the walk never fail.
pub fn wall_walk(len: usize) -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(-1000i64..=1000, 1..=len).prop_map(|deltas| {
        let mut wall: u64 = 1_000_000_000;
        deltas
            .into_iter()
            .map(|d| {
                wall = wall.saturating_add_signed(d);
                wall
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::{codec, Hlc};
    use driftsync_store::Fingerprint;

    proptest! {
        #[test]
        fn prop_send_outputs_strictly_increase(node in node_id(), walk in wall_walk(100)) {
            let mut hlc = Hlc::new(node);
            let mut prev: Option<Timestamp> = None;
            for wall in walk {
                let ts = hlc.send(wall).unwrap();
                if let Some(prev) = prev {
                    prop_assert!(ts > prev);
                    prop_assert!(ts.encode() > prev.encode());
                }
                prev = Some(ts);
            }
        }

        #[test]
        fn prop_receive_preserves_causality(
            node_a in node_id(),
            node_b in node_id(),
            walk in wall_walk(20),
            // Close enough to the walk that no drift check can trip.
            wall_b in 999_950_000u64..1_000_150_000,
        ) {
            prop_assume!(node_a != node_b);
            let mut a = Hlc::new(node_a);
            let mut b = Hlc::new(node_b);

            let mut sent = Timestamp::ZERO;
            for wall in walk {
                sent = a.send(wall).unwrap();
            }
            let merged = b.receive(sent, wall_b).unwrap();
            prop_assert!(merged > sent);
            let next = b.send(wall_b).unwrap();
            prop_assert!(next > sent);
        }

        #[test]
        fn prop_timestamp_codec_roundtrip(ts in timestamp()) {
            let bytes = ts.encode();
            prop_assert_eq!(Timestamp::decode(&bytes).unwrap(), ts);
        }

        #[test]
        fn prop_compare_equals_memcmp(a in timestamp(), b in timestamp()) {
            prop_assert_eq!(a.cmp(&b), a.encode().cmp(&b.encode()));
        }

        #[test]
        fn prop_fingerprint_linear_under_split(set in timestamp_set(60), pivot in timestamp()) {
            let left: Vec<_> = set.iter().filter(|ts| **ts < pivot).collect();
            let right: Vec<_> = set.iter().filter(|ts| **ts >= pivot).collect();
            let combined = Fingerprint::of_timestamps(left.into_iter())
                ^ Fingerprint::of_timestamps(right.into_iter());
            prop_assert_eq!(combined, Fingerprint::of_timestamps(set.iter()));
        }

        #[test]
        fn prop_fingerprint_distinguishes_sets(set in timestamp_set(30), extra in timestamp()) {
            prop_assume!(!set.contains(&extra));
            let mut larger = set.clone();
            larger.insert(extra);
            prop_assert_ne!(
                Fingerprint::of_timestamps(set.iter()),
                Fingerprint::of_timestamps(larger.iter())
            );
        }

        #[test]
        fn prop_change_codec_roundtrip(change in change()) {
            let bytes = change.to_bytes();
            prop_assert_eq!(Change::from_bytes(&bytes).unwrap(), change);
        }

        #[test]
        fn prop_padme_bound(len in 2u64..2_000_000) {
            let padded = codec::padme_size(len);
            prop_assert!(padded >= len);
            let e = 63 - u64::from(len.leading_zeros());
            let s = 64 - u64::from(e.leading_zeros());
            prop_assert!(padded - len < (1u64 << (e - s)).max(1));
        }

        #[test]
        fn prop_padded_frames_recover_payload(payload in prop::collection::vec(any::<u8>(), 0..2048), seed in any::<u64>()) {
            use rand::SeedableRng;
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            let frame = codec::pad_frame(&payload, &mut rng).unwrap();
            prop_assert_eq!(codec::unpad_frame(&frame).unwrap(), &payload[..]);
        }
    }
}
