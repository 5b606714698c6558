//! Request-ID generation.
//!
//! IDs embed the low 16 bits of the node ID in the high bits and a
//! millisecond timestamp plus counter in the low 48, so concurrent nodes
//! produce disjoint ID spaces and a single node never repeats an ID during
//! its lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const TS_BITS: u32 = 40;
const CNT_BITS: u32 = 8;
const SUFFIX_BITS: u32 = TS_BITS + CNT_BITS;

pub struct IdGenerator {
    prefix: u64,
    suffix: AtomicU64,
}

impl IdGenerator {
    pub fn new(node_id: u64, now: SystemTime) -> Self {
        let ms = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        IdGenerator {
            prefix: (node_id & 0xffff) << SUFFIX_BITS,
            suffix: AtomicU64::new((ms & ((1 << TS_BITS) - 1)) << CNT_BITS),
        }
    }

    pub fn next(&self) -> u64 {
        let suffix = self.suffix.fetch_add(1, Ordering::Relaxed) + 1;
        self.prefix | (suffix & ((1 << SUFFIX_BITS) - 1))
    }
}
