//! Kernel clock.
//!
//! Microsecond monotonic time since boot, plus a settable wall-clock
//! offset. `gettime` reports both; `settime` only ever moves the offset,
//! never the raw clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

pub struct Clock {
    boot: Instant,
    offs_us: AtomicI64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
            offs_us: AtomicI64::new(0),
        }
    }

    /// Microseconds since boot.
    pub fn raw_us(&self) -> u64 {
        self.boot.elapsed().as_micros() as u64
    }

    pub fn offs_us(&self) -> i64 {
        self.offs_us.load(Ordering::SeqCst)
    }

    pub fn set_offs_us(&self, offs: i64) {
        self.offs_us.store(offs, Ordering::SeqCst);
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
