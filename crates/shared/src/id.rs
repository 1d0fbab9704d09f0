//! Time-ordered id generation for order / subscription / transaction numbers
//!
//! Order numbers are minted before any call to a payment vendor so that a
//! failed checkout is always attributable to a specific order row. They must
//! therefore be globally unique and sortable by creation time. The layout is
//! snowflake-style: 41 bits of milliseconds since a fixed epoch, 10 bits of
//! per-process node id, 12 bits of sequence within the millisecond.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// 2024-01-01T00:00:00Z
const EPOCH_MS: u64 = 1_704_067_200_000;

const NODE_BITS: u64 = 10;
const SEQ_BITS: u64 = 12;
const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;

/// Snowflake-style generator for time-ordered decimal id strings.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    node: u64,
    // high bits: last issued timestamp (ms since EPOCH_MS), low SEQ_BITS: sequence
    state: AtomicU64,
}

impl SnowflakeGenerator {
    /// Create a generator with a random node id.
    pub fn new() -> Self {
        // uuid provides the process entropy; no dedicated rng needed here
        let entropy = uuid::Uuid::new_v4().as_u128() as u64;
        Self::with_node(entropy & NODE_MASK)
    }

    /// Create a generator with an explicit node id (low 10 bits are used).
    pub fn with_node(node: u64) -> Self {
        Self {
            node: node & NODE_MASK,
            state: AtomicU64::new(0),
        }
    }

    /// Mint the next id as a decimal string.
    pub fn next_id(&self) -> String {
        let (ts, seq) = self.next_parts();
        let id = (ts << (NODE_BITS + SEQ_BITS)) | (self.node << SEQ_BITS) | seq;
        id.to_string()
    }

    fn next_parts(&self) -> (u64, u64) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            let last_ts = current >> SEQ_BITS;
            let last_seq = current & SEQ_MASK;

            let now = now_ms();
            let (ts, seq) = if now > last_ts {
                (now, 0)
            } else if last_seq < SEQ_MASK {
                // same millisecond (or clock went backwards): bump the sequence
                (last_ts, last_seq + 1)
            } else {
                // sequence exhausted within the millisecond: move to the next one
                (last_ts + 1, 0)
            };

            let next = (ts << SEQ_BITS) | seq;
            if self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return (ts, seq);
            }
        }
    }
}

impl Default for SnowflakeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
        .saturating_sub(EPOCH_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_unique() {
        let gen = SnowflakeGenerator::with_node(7);
        let ids: HashSet<String> = (0..10_000).map(|_| gen.next_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let gen = SnowflakeGenerator::with_node(7);
        let mut prev: u64 = 0;
        for _ in 0..10_000 {
            let id: u64 = gen.next_id().parse().unwrap();
            assert!(id > prev, "ids must be strictly increasing");
            prev = id;
        }
    }

    #[test]
    fn test_node_id_is_masked() {
        let gen = SnowflakeGenerator::with_node(u64::MAX);
        assert_eq!(gen.node, NODE_MASK);
    }

    #[test]
    fn test_concurrent_generation_is_collision_free() {
        use std::sync::Arc;

        let gen = Arc::new(SnowflakeGenerator::with_node(3));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gen = Arc::clone(&gen);
            handles.push(std::thread::spawn(move || {
                (0..2_000).map(|_| gen.next_id()).collect::<Vec<_>>()
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "duplicate id under concurrency");
            }
        }
    }
}
