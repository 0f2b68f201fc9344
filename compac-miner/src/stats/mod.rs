//! Time-bucketed statistics that drive tuning decisions.
//!
//! All rings are anchored to wall-clock time so that a clock stepping
//! backwards is noticed and wipes them, rather than silently producing
//! negative intervals.

pub mod hashrate;
pub mod jobs;
pub mod ring;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

pub use hashrate::HashrateStats;
pub use jobs::JobStats;
pub use ring::{Bucket, TimeRing};

/// Wall-clock instant with microsecond resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn now() -> Self {
        let micros = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since) => since.as_micros() as i64,
            Err(before) => -(before.duration().as_micros() as i64),
        };
        Timestamp(micros)
    }

    pub const fn from_micros(micros: i64) -> Self {
        Timestamp(micros)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Timestamp(secs * 1_000_000)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Timestamp((secs * 1e6) as i64)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    /// Whole seconds, rounded towards negative infinity.
    pub const fn secs(self) -> i64 {
        self.0.div_euclid(1_000_000)
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1e6
    }

    /// Seconds from `earlier` to `self`; negative if `earlier` is later.
    pub fn secs_since(self, earlier: Timestamp) -> f64 {
        (self.0 - earlier.0) as f64 / 1e6
    }

    pub fn millis_since(self, earlier: Timestamp) -> f64 {
        (self.0 - earlier.0) as f64 / 1e3
    }

    pub fn add_millis(self, millis: i64) -> Self {
        Timestamp(self.0 + millis * 1_000)
    }
}
