use keel::time;
use std::thread;
use std::time::Duration;

pub const MAX_TS: u64 = 0x1ff_ffff_ffff;
pub const MAX_NODE_ID: u64 = 0xff;
pub const MAX_CORE_ID: u64 = 0x3f;
pub const MAX_SEQUENCE: u64 = 0x1ff;

const NODE_ID_SHIFT: u64 = 6 + 9;
const CORE_ID_SHIFT: u64 = 9;
const TS_SHIFT: u64 = 8 + 6 + 9;

/// Serial number generator for overlay packets.
///
/// A snowflake variant: `timestamp(41) ∥ node_id(8) ∥ core_id(6) ∥ seq(9)`,
/// with the timestamp in milliseconds. A single generator is strictly
/// monotonic; generators with distinct `(node_id, core_id)` pairs can never
/// collide, which is what makes serial numbers cluster-unique without any
/// coordination beyond core id assignment.
///
/// Each worker owns a private generator; sharing one across workers is never
/// required and never supported.
pub struct IdGenerator {
    node_id: u64,
    core_id: u64,
    last_ts: u64,
    sequence: u64,
}

impl IdGenerator {
    pub fn new(node_id: u64, core_id: u64) -> IdGenerator {
        if node_id > MAX_NODE_ID {
            panic!("node_id overflows: {} > {}", node_id, MAX_NODE_ID);
        }

        if core_id > MAX_CORE_ID {
            panic!("core_id overflows: {} > {}", core_id, MAX_CORE_ID);
        }

        IdGenerator {
            node_id,
            core_id,
            last_ts: time::timestamp_millis(),
            sequence: 0,
        }
    }

    /// Generates the next serial number, sleeping into the next millisecond
    /// when the 9-bit sequence for the current one is exhausted.
    pub fn gen(&mut self) -> u64 {
        let (sequence, ts) = self.next_sequence();

        (ts & MAX_TS) << TS_SHIFT | self.node_id << NODE_ID_SHIFT | self.core_id << CORE_ID_SHIFT | sequence
    }

    fn next_sequence(&mut self) -> (u64, u64) {
        let ts = time::timestamp_millis();

        // A clock stepping backwards is treated as the current millisecond
        // continuing, which keeps the output strictly monotonic.
        if ts <= self.last_ts {
            if self.sequence < MAX_SEQUENCE {
                self.sequence += 1;
            } else {
                self.last_ts = self.sleep_to_next_millisecond();
                self.sequence = 0;
            }
        } else {
            self.sequence = 0;
            self.last_ts = ts;
        }

        (self.sequence, self.last_ts)
    }

    fn sleep_to_next_millisecond(&self) -> u64 {
        loop {
            let ts = time::timestamp_millis();

            if ts > self.last_ts {
                return ts;
            }

            thread::sleep(Duration::from_micros(100));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_burst_uniqueness_and_width() {
        let mut idgen = IdGenerator::new(1, 1);
        let mut seen = HashSet::with_capacity(1_000_000);

        for _ in 0..1_000_000 {
            let id = idgen.gen();

            assert!(seen.insert(id), "duplicate id {}", id);
            assert_eq!(format!("{:b}", id).len(), 64);
        }
    }

    #[test]
    fn test_strictly_monotonic() {
        let mut idgen = IdGenerator::new(3, 7);
        let mut last = 0u64;

        for _ in 0..10_000 {
            let id = idgen.gen();

            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_distinct_cores_never_collide() {
        let mut a = IdGenerator::new(1, 1);
        let mut b = IdGenerator::new(1, 2);

        let ids_a: HashSet<u64> = (0..20_000).map(|_| a.gen()).collect();
        let ids_b: HashSet<u64> = (0..20_000).map(|_| b.gen()).collect();

        assert!(ids_a.is_disjoint(&ids_b));
    }

    #[test]
    fn test_bit_layout() {
        let mut idgen = IdGenerator::new(0xff, 0x3f);
        let id = idgen.gen();

        assert_eq!(id >> 15 & 0xff, 0xff);
        assert_eq!(id >> 9 & 0x3f, 0x3f);
    }

    #[test]
    #[should_panic(expected = "node_id overflows")]
    fn test_node_id_overflow() {
        let _ = IdGenerator::new(0x100, 0);
    }

    #[test]
    #[should_panic(expected = "core_id overflows")]
    fn test_core_id_overflow() {
        let _ = IdGenerator::new(0, 0x40);
    }
}
