//! Run-identifier derivation.
//!
//! Two id schemes live here. `deterministic_id` derives run ids purely from
//! the broadcast event id and the entity id, so every worker computes the
//! same WorkflowRun/JobRun id without a coordinator and redelivery of an
//! event is idempotent by construction. `IdGenerator` is a snowflake
//! variant for rows that only ever get written by one worker
//! (run-dependency rows), where global agreement is not needed.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{FlowmeshError, Result};

/// Custom epoch for snowflake ids: 2024-01-01 00:00:00 UTC.
const EPOCH_MS: i64 = 1_704_067_200_000;

const NODE_ID_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_NODE_ID: u64 = (1 << NODE_ID_BITS) - 1;
const MAX_SEQUENCE: u64 = (1 << SEQUENCE_BITS) - 1;

/// Stable 64-bit hash of a byte string (FNV-1a). Used wherever a hash must
/// agree across processes; the std `Hasher` is randomly seeded and cannot
/// be used for anything that feeds cluster-wide agreement.
pub fn stable_hash64(bytes: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Derive a run id from a broadcast event id and an entity id.
///
/// The event id is hashed, run through an avalanche round, mixed with the
/// entity id and finalized with a second avalanche. The sign bit is
/// cleared so ids are always positive. Pure: same inputs give the same
/// output on every process and restart.
pub fn deterministic_id(event_id: &str, entity_id: i64) -> i64 {
    let mut h = stable_hash64(event_id.as_bytes());
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;

    let mut mixed = h ^ (entity_id as u64);
    mixed = mixed.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    mixed ^= mixed >> 30;
    mixed = mixed.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    mixed ^= mixed >> 27;
    mixed = mixed.wrapping_mul(0x94d0_49bb_1331_11eb);
    mixed ^= mixed >> 31;

    (mixed & (i64::MAX as u64)) as i64
}

#[derive(Debug)]
struct GeneratorState {
    last_timestamp: i64,
    sequence: u64,
}

/// Snowflake-variant id generator.
///
/// 64-bit layout: 1 sign bit (always 0), 41-bit millisecond timestamp,
/// 10-bit node id, 12-bit per-millisecond sequence. The node id is derived
/// from the worker's advertise address so no configuration is needed.
#[derive(Debug)]
pub struct IdGenerator {
    node_id: u64,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    pub fn new(node_id: u64) -> Result<Self> {
        if node_id > MAX_NODE_ID {
            return Err(FlowmeshError::InvalidConfig(format!(
                "node id must be in 0..={MAX_NODE_ID}, got {node_id}"
            )));
        }
        Ok(Self {
            node_id,
            state: Mutex::new(GeneratorState {
                last_timestamp: -1,
                sequence: 0,
            }),
        })
    }

    /// Derive the node id from the worker address.
    pub fn from_address(addr: &str) -> Self {
        let node_id = stable_hash64(addr.as_bytes()) & MAX_NODE_ID;
        // SAFETY: masked into range above
        Self::new(node_id).expect("masked node id is in range")
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    /// Generate the next id. Tolerates clock regressions of up to 5ms by
    /// waiting; larger regressions are refused rather than risking
    /// duplicate ids.
    pub fn next_id(&self) -> Result<i64> {
        let mut state = self.state.lock().map_err(|_| {
            FlowmeshError::Internal("id generator lock poisoned".to_string())
        })?;

        let mut now = now_millis();
        if now < state.last_timestamp {
            let offset = state.last_timestamp - now;
            if offset > 5 {
                return Err(FlowmeshError::Internal(format!(
                    "clock moved backwards by {offset}ms, refusing to generate ids"
                )));
            }
            now = wait_until(state.last_timestamp);
        }

        if now == state.last_timestamp {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                now = wait_until(state.last_timestamp + 1);
            }
        } else {
            state.sequence = 0;
        }
        state.last_timestamp = now;

        let ts = (now - EPOCH_MS) as u64;
        Ok(((ts << (NODE_ID_BITS + SEQUENCE_BITS)) | (self.node_id << SEQUENCE_BITS) | state.sequence)
            as i64)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn wait_until(target: i64) -> i64 {
    let mut now = now_millis();
    while now < target {
        std::hint::spin_loop();
        now = now_millis();
    }
    now
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn deterministic_id_is_pure() {
        let a = deterministic_id("evt-4d1c", 42);
        let b = deterministic_id("evt-4d1c", 42);
        assert_eq!(a, b);
    }

    #[test]
    fn deterministic_id_is_positive() {
        for entity in [0i64, 1, -1, i64::MAX, i64::MIN, 123_456_789] {
            assert!(deterministic_id("some-event", entity) >= 0);
        }
    }

    #[test]
    fn deterministic_id_differs_by_event_and_entity() {
        let base = deterministic_id("evt-a", 1);
        assert_ne!(base, deterministic_id("evt-b", 1));
        assert_ne!(base, deterministic_id("evt-a", 2));
    }

    #[test]
    fn stable_hash_is_stable() {
        assert_eq!(stable_hash64(b"flowmesh"), stable_hash64(b"flowmesh"));
        assert_ne!(stable_hash64(b"flowmesh"), stable_hash64(b"flowmesg"));
    }

    #[test]
    fn generator_ids_are_unique_and_increasing() {
        let gen = IdGenerator::new(7).unwrap();
        let mut seen = HashSet::new();
        let mut prev = 0;
        for _ in 0..5000 {
            let id = gen.next_id().unwrap();
            assert!(id > prev);
            assert!(seen.insert(id));
            prev = id;
        }
    }

    #[test]
    fn generator_rejects_out_of_range_node() {
        assert!(IdGenerator::new(1024).is_err());
    }

    #[test]
    fn generator_node_id_from_address_is_stable() {
        let a = IdGenerator::from_address("10.0.0.1:7450");
        let b = IdGenerator::from_address("10.0.0.1:7450");
        assert_eq!(a.node_id(), b.node_id());
        assert!(a.node_id() <= MAX_NODE_ID);
    }
}
