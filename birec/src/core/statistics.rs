//! Rolling throughput counters backing the task status view.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// Counts units (bytes, messages) and derives a smoothed per-second rate.
#[derive(Debug)]
pub struct RateCounter {
    count: AtomicU64,
    window: Mutex<RateWindow>,
}

#[derive(Debug)]
struct RateWindow {
    last_instant: Instant,
    last_count: u64,
    rate: f64,
}

impl Default for RateCounter {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            window: Mutex::new(RateWindow {
                last_instant: Instant::now(),
                last_count: 0,
                rate: 0.0,
            }),
        }
    }
}

impl RateCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, units: u64) {
        self.count.fetch_add(units, Ordering::Relaxed);
    }

    /// Replace the running total (used when the dumper reports absolute
    /// byte counts).
    pub fn set(&self, total: u64) {
        self.count.store(total, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Current rate in units/second, sampled against the previous call.
    pub fn rate(&self) -> f64 {
        let mut window = self.window.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(window.last_instant).as_secs_f64();
        // Keep the previous sample when polled faster than once a second.
        if elapsed < 1.0 {
            return window.rate;
        }
        let count = self.count();
        let delta = count.saturating_sub(window.last_count);
        window.rate = delta as f64 / elapsed;
        window.last_instant = now;
        window.last_count = count;
        window.rate
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        let mut window = self.window.lock();
        window.last_instant = Instant::now();
        window.last_count = 0;
        window.rate = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_accumulates() {
        let counter = RateCounter::new();
        counter.add(10);
        counter.add(5);
        assert_eq!(counter.count(), 15);

        counter.set(100);
        assert_eq!(counter.count(), 100);

        counter.reset();
        assert_eq!(counter.count(), 0);
    }
}
