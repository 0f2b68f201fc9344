//! Measured sleeps.
//!
//! Short sleeps on small boards routinely overshoot, sometimes by several
//! times the requested duration. Every pacing sleep goes through
//! [`Pacer::sleep_us`] so the overshoot shows up in telemetry.

use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Sleeps at least this long skip measurement.
pub const COARSE_SLEEP_US: u64 = 1_000_000;

/// Shortest sleep worth taking; anything shorter is spun through.
pub const MIN_SLEEP_US: u64 = 200;

/// Margin kept for the work fetch before the next task is due.
pub const SLEEP_MARGIN_US: u64 = 50;

const OVERSHOOT_HIGH: f64 = 1.5;
const OVERSHOOT_LOW: f64 = 1.1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SleepBucket {
    pub count: u64,
    /// Total requested, in microseconds.
    pub requested_us: u64,
    /// Sum of actual/requested ratios.
    pub factor_sum: f64,
}

impl SleepBucket {
    fn add(&mut self, requested_us: u64, factor: f64) {
        self.count += 1;
        self.requested_us += requested_us;
        self.factor_sum += factor;
    }

    pub fn average_factor(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.factor_sum / self.count as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SleepStats {
    /// Overshoot below 1.1x.
    pub on_time: SleepBucket,
    /// Overshoot in [1.1x, 1.5x).
    pub late: SleepBucket,
    /// Overshoot of 1.5x or more.
    pub very_late: SleepBucket,
    /// Sleeps that returned early.
    pub early: u64,
    /// Coarse sleeps, not measured.
    pub coarse: u64,
}

impl SleepStats {
    pub fn record(&mut self, requested_us: u64, actual_us: u64) {
        if actual_us < requested_us {
            self.early += 1;
        }
        let factor = actual_us as f64 / requested_us.max(1) as f64;
        if factor >= OVERSHOOT_HIGH {
            self.very_late.add(requested_us, factor);
        } else if factor >= OVERSHOOT_LOW {
            self.late.add(requested_us, factor);
        } else {
            self.on_time.add(requested_us, factor);
        }
    }
}

#[derive(Debug, Default)]
pub struct Pacer {
    stats: Mutex<SleepStats>,
}

impl Pacer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleep_us(&self, us: u64) {
        if us >= COARSE_SLEEP_US {
            thread::sleep(Duration::from_millis(us / 1000));
            self.stats.lock().coarse += 1;
            return;
        }
        let start = Instant::now();
        thread::sleep(Duration::from_micros(us));
        let actual = start.elapsed().as_micros() as u64;
        self.stats.lock().record(us, actual);
    }

    pub fn sleep_ms(&self, ms: u64) {
        self.sleep_us(ms * 1000);
    }

    pub fn snapshot(&self) -> SleepStats {
        *self.stats.lock()
    }
}
