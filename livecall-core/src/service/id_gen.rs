//! Room id generation
//!
//! Snowflake layout: 41-bit milliseconds since [`EPOCH_MS`], 10-bit worker id,
//! 12-bit sequence. The 64-bit value is rendered in base62.

use parking_lot::Mutex;

/// 2024-01-01T00:00:00Z
pub const EPOCH_MS: i64 = 1_704_067_200_000;

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_WORKER: u64 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

pub trait RoomIdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

#[derive(Debug)]
pub struct SnowflakeIdGenerator {
    worker_id: u64,
    state: Mutex<(u64, u64)>,
}

impl SnowflakeIdGenerator {
    /// Worker ids above 1023 are masked down.
    #[must_use]
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: u64::from(worker_id) & MAX_WORKER,
            state: Mutex::new((0, 0)),
        }
    }

    /// Use `configured` when set, else a worker id hashed from `node_id`.
    #[must_use]
    pub fn for_node(configured: Option<u16>, node_id: &str) -> Self {
        Self::new(configured.unwrap_or_else(|| worker_id_from_node(node_id)))
    }

    fn next_raw(&self) -> u64 {
        let now = u64::try_from(crate::models::now_millis() - EPOCH_MS).unwrap_or(0);
        let mut state = self.state.lock();
        let (last_ms, sequence) = *state;

        // never step backwards; on sequence overflow borrow the next millisecond
        let (ms, seq) = if now > last_ms {
            (now, 0)
        } else {
            let seq = (sequence + 1) & SEQUENCE_MASK;
            if seq == 0 {
                (last_ms + 1, 0)
            } else {
                (last_ms, seq)
            }
        };
        *state = (ms, seq);

        (ms << (WORKER_BITS + SEQUENCE_BITS)) | (self.worker_id << SEQUENCE_BITS) | seq
    }
}

impl RoomIdGenerator for SnowflakeIdGenerator {
    fn next_id(&self) -> String {
        base62(self.next_raw())
    }
}

/// FNV-1a of the node id, folded into the worker id range.
#[must_use]
pub fn worker_id_from_node(node_id: &str) -> u16 {
    let hash = node_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        });
    let folded = (hash ^ (hash >> 32) ^ (hash >> 16)) & MAX_WORKER;
    u16::try_from(folded).unwrap_or(0)
}

#[must_use]
pub fn base62(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::with_capacity(11);
    while value > 0 {
        digits.push(BASE62[(value % 62) as usize]);
        value /= 62;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_unique_under_burst() {
        let gen = SnowflakeIdGenerator::new(7);
        let ids: HashSet<String> = (0..10_000).map(|_| gen.next_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_worker_id_embedded() {
        let gen = SnowflakeIdGenerator::new(5);
        let raw = gen.next_raw();
        assert_eq!((raw >> SEQUENCE_BITS) & MAX_WORKER, 5);
    }

    #[test]
    fn test_worker_id_from_node() {
        let a = worker_id_from_node("host-a_10.0.0.1-x1Y2z3");
        assert_eq!(a, worker_id_from_node("host-a_10.0.0.1-x1Y2z3"));
        assert!(u64::from(a) <= MAX_WORKER);

        let ids: HashSet<u16> = (0..64).map(|n| worker_id_from_node(&format!("node_10.0.0.{n}-abc"))).collect();
        assert!(ids.len() > 48, "only {} distinct worker ids", ids.len());
    }

    #[test]
    fn test_unset_worker_id_differs_between_nodes() {
        let a = SnowflakeIdGenerator::for_node(None, "host-a_10.0.0.1-Qw3rTy");
        let b = SnowflakeIdGenerator::for_node(None, "host-b_10.0.0.2-Zx9vBn");
        assert_ne!(a.worker_id, b.worker_id);
        // same millisecond and sequence still yields distinct ids
        assert_ne!((a.next_raw() >> SEQUENCE_BITS) & MAX_WORKER, (b.next_raw() >> SEQUENCE_BITS) & MAX_WORKER);

        let pinned = SnowflakeIdGenerator::for_node(Some(9), "host-a_10.0.0.1-Qw3rTy");
        assert_eq!(pinned.worker_id, 9);
    }

    #[test]
    fn test_raw_ids_increase() {
        let gen = SnowflakeIdGenerator::new(1);
        let a = gen.next_raw();
        let b = gen.next_raw();
        assert!(b > a);
    }

    #[test]
    fn test_base62() {
        assert_eq!(base62(0), "0");
        assert_eq!(base62(61), "z");
        assert_eq!(base62(62), "10");
        assert!(base62(u64::MAX).chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
