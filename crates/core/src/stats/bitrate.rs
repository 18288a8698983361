//! Interval bit-rate averaging.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::time::Millis;

/// Accumulates bytes and turns them into bits per second once per interval.
///
/// `record` is called from the receive path and `update` from the delivery
/// pass, so the counters are atomics rather than living under the stream lock.
#[derive(Debug)]
pub struct BitRateMeter {
    interval: Millis,
    bytes: AtomicU64,
    last_update: AtomicI64,
    bits_per_second: AtomicU64,
}

impl BitRateMeter {
    pub fn new(interval: Millis, now: Millis) -> Self {
        Self {
            interval: interval.max(1),
            bytes: AtomicU64::new(0),
            last_update: AtomicI64::new(now),
            bits_per_second: AtomicU64::new(0),
        }
    }

    pub fn record(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Close the interval if it has elapsed. Returns true when the rate changed.
    pub fn update(&self, now: Millis) -> bool {
        let last = self.last_update.load(Ordering::Acquire);
        let elapsed = now - last;
        if elapsed < self.interval {
            return false;
        }
        if self
            .last_update
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // another caller closed this interval
            return false;
        }
        let bytes = self.bytes.swap(0, Ordering::Relaxed);
        let bps = bytes * 8 * 1000 / elapsed as u64;
        self.bits_per_second.store(bps, Ordering::Relaxed);
        true
    }

    pub fn bits_per_second(&self) -> u64 {
        self.bits_per_second.load(Ordering::Relaxed)
    }
}
