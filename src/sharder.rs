//! Bucketing: mapping a bucketing key onto the `[0, 10000)` traffic space.
use std::io::Cursor;

use murmur3::murmur3_32;

use crate::datafile::TrafficAllocation;

/// Seed shared by every SDK of the family. Changing it reshuffles all users.
const HASH_SEED: u32 = 1;

/// Size of the bucketing space.
pub const MAX_TRAFFIC_VALUE: u32 = 10_000;

/// 2^32, the number of distinct 32-bit hash values.
const MAX_HASH_VALUE: f64 = 4_294_967_296.0;

pub trait Sharder {
    /// Map `bucketing_key` for the given entity into `[0, MAX_TRAFFIC_VALUE)`.
    fn bucket_value(&self, bucketing_key: &str, entity_id: &str) -> u32;
}

/// The default (and only) production sharder: MurmurHash3 x86_32 over `bucketing_key` followed by
/// `entity_id`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MurmurSharder;

impl Sharder for MurmurSharder {
    fn bucket_value(&self, bucketing_key: &str, entity_id: &str) -> u32 {
        let input = format!("{bucketing_key}{entity_id}");
        // Reading from an in-memory cursor cannot fail.
        let hash = murmur3_32(&mut Cursor::new(input.as_bytes()), HASH_SEED).unwrap_or_default();
        let ratio = hash as f64 / MAX_HASH_VALUE;
        (ratio * MAX_TRAFFIC_VALUE as f64) as u32
    }
}

/// Find the entity in `allocation` that `bucket_value` falls into.
///
/// Returns `None` if the value is past the last bound or the matching slot has an empty entity id
/// (holdback traffic).
pub fn find_entity(allocation: &[TrafficAllocation], bucket_value: u32) -> Option<&str> {
    allocation
        .iter()
        .find(|slot| bucket_value < slot.end_of_range)
        .map(|slot| slot.entity_id.as_str())
        .filter(|entity_id| !entity_id.is_empty())
}

/// Bucket `bucketing_key` into one of the entities of `allocation`.
///
/// `entity_id` is the id of the allocation owner (experiment or group) and salts the hash, so that
/// the same user lands in independent buckets across experiments.
pub fn bucket<'a, S: Sharder + ?Sized>(
    sharder: &S,
    bucketing_key: &str,
    entity_id: &str,
    allocation: &'a [TrafficAllocation],
) -> Option<&'a str> {
    let value = sharder.bucket_value(bucketing_key, entity_id);
    let entity = find_entity(allocation, value);
    log::trace!(target: "splitkit",
                bucketing_key,
                entity_id,
                bucket_value = value,
                assigned = entity.unwrap_or("");
                "bucketed");
    entity
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Sharder that always returns the same value.
    pub(crate) struct FixedSharder(pub u32);

    impl Sharder for FixedSharder {
        fn bucket_value(&self, _bucketing_key: &str, _entity_id: &str) -> u32 {
            self.0
        }
    }

    fn allocation(slots: &[(&str, u32)]) -> Vec<TrafficAllocation> {
        slots
            .iter()
            .map(|(entity_id, end_of_range)| TrafficAllocation {
                entity_id: entity_id.to_string(),
                end_of_range: *end_of_range,
            })
            .collect()
    }

    #[test]
    fn murmur_matches_reference_values() {
        // Reference values for MurmurHash3 x86_32 with seed 1, shared across SDKs.
        assert_eq!(
            murmur3_32(&mut Cursor::new(b"".as_slice()), HASH_SEED).unwrap(),
            0x514e28b7
        );
        assert_eq!(
            murmur3_32(&mut Cursor::new(b"".as_slice()), 0).unwrap(),
            0
        );
    }

    #[test]
    fn bucketing_key_is_hashed_before_entity_id() {
        let hash = murmur3_32(&mut Cursor::new(b"ppid11886780721".as_slice()), HASH_SEED).unwrap();
        let expected = (hash as f64 / MAX_HASH_VALUE * MAX_TRAFFIC_VALUE as f64) as u32;

        assert_eq!(MurmurSharder.bucket_value("ppid1", "1886780721"), expected);
        assert_ne!(
            MurmurSharder.bucket_value("ppid1", "1886780721"),
            MurmurSharder.bucket_value("1886780721", "ppid1")
        );
    }

    #[test]
    fn bucket_value_is_deterministic() {
        let first = MurmurSharder.bucket_value("ppid1", "1886780721");
        for _ in 0..100 {
            assert_eq!(MurmurSharder.bucket_value("ppid1", "1886780721"), first);
        }
        assert!(first < MAX_TRAFFIC_VALUE);
    }

    #[test]
    fn bucket_value_depends_on_entity() {
        let values = (0..50)
            .map(|i| MurmurSharder.bucket_value("user", &format!("exp{i}")))
            .collect::<std::collections::HashSet<_>>();
        assert!(values.len() > 1);
    }

    #[test]
    fn bucket_values_cover_range() {
        for i in 0..1000 {
            let value = MurmurSharder.bucket_value(&format!("user-{i}"), "exp");
            assert!(value < MAX_TRAFFIC_VALUE);
        }
    }

    #[test]
    fn picks_first_slot_above_value() {
        let allocation = allocation(&[("a", 5000), ("b", 10000)]);
        assert_eq!(bucket(&FixedSharder(3000), "u", "exp1", &allocation), Some("a"));
        assert_eq!(bucket(&FixedSharder(7000), "u", "exp1", &allocation), Some("b"));
        assert_eq!(bucket(&FixedSharder(0), "u", "exp1", &allocation), Some("a"));
        assert_eq!(bucket(&FixedSharder(4999), "u", "exp1", &allocation), Some("a"));
        assert_eq!(bucket(&FixedSharder(5000), "u", "exp1", &allocation), Some("b"));
    }

    #[test]
    fn holdback_traffic_is_not_bucketed() {
        let allocation = allocation(&[("a", 2500), ("b", 5000)]);
        assert_eq!(bucket(&FixedSharder(5000), "u", "exp1", &allocation), None);
        assert_eq!(bucket(&FixedSharder(9999), "u", "exp1", &allocation), None);
    }

    #[test]
    fn empty_entity_is_holdback() {
        let allocation = allocation(&[("", 5000), ("b", 10000)]);
        assert_eq!(bucket(&FixedSharder(10), "u", "exp1", &allocation), None);
        assert_eq!(bucket(&FixedSharder(6000), "u", "exp1", &allocation), Some("b"));
    }

    #[test]
    fn empty_allocation_is_never_bucketed() {
        assert_eq!(bucket(&FixedSharder(0), "u", "exp1", &[]), None);
    }

    #[test]
    fn murmur_bucketing_is_stable_for_allocation() {
        let allocation = allocation(&[("a", 5000), ("b", 10000)]);
        let first = bucket(&MurmurSharder, "user-42", "exp1", &allocation);
        assert!(first.is_some());
        assert_eq!(bucket(&MurmurSharder, "user-42", "exp1", &allocation), first);
    }
}
