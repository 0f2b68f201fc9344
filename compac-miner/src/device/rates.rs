//! Timing model derived from the chain's frequency.

use serde::Serialize;

use super::chip::ChipRecord;
use super::{Device, DeviceState};
use crate::stats::Timestamp;
use crate::stats::hashrate::{CHIP_BUCKET_SECS, CHIP_DEPTH, HASHES_PER_DIFF};
use crate::tracing::prelude::*;

/// Nonce search space, in hashes.
const FULLSCAN_HASHES: f64 = 4_294_967_295.0;

/// Work units per chip-core-MHz.
const WU_DIVISOR: f64 = 71.6;

/// Multiples of the expected nonce interval tolerated before the chain
/// counts as quiet.
const NONCE_LIMIT_FACTOR: f64 = 20.0;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Rates {
    /// Nominal hashes per second for the chain.
    pub hashrate: f64,
    /// Expected work units per minute.
    pub wu: f64,
    pub wu_max: f64,
    pub fullscan_ms: f64,
    pub fullscan_us: u64,
    /// Pacing multiplier actually in use.
    pub wait_factor: f64,
    /// Configured pacing multiplier, before the midstate adjustment.
    pub wait_factor0: f64,
    /// Time between tasks, in microseconds.
    pub max_task_wait_us: u64,
    /// Expected milliseconds between nonces.
    pub nonce_expect_ms: f64,
    /// Milliseconds without a nonce that count as a plateau.
    pub nonce_limit_ms: f64,
    pub hr_scale: f64,
    pub last_update: Timestamp,
}

impl Rates {
    pub fn new(wait_factor: f64, hr_scale: f64) -> Self {
        Self {
            wait_factor0: wait_factor,
            wait_factor: wait_factor,
            hr_scale,
            ..Default::default()
        }
    }
}

impl DeviceState {
    /// Recomputes the timing model. Leaves everything untouched while any
    /// chip runs at zero, since no model makes sense then.
    pub(crate) fn update_rates(&mut self, cores: u32, boost: bool, now: Timestamp) {
        self.rates.last_update = now;
        let chips = self.chips.len();
        if chips == 0
            || self.freq.current == 0.0
            || self.chips.iter().any(|chip| chip.frequency == 0.0)
        {
            return;
        }

        let cores = f64::from(cores);
        let scale = self.rates.hr_scale;
        let mut total = 0.0f64;
        for chip in self.chips.iter_mut() {
            chip.hashrate = f64::from(chip.frequency) * cores * 1e6 * scale;
            chip.fullscan_ms = 1000.0 * scale * FULLSCAN_HASHES / chip.hashrate;
            chip.fullscan_us = (1e6 * scale * FULLSCAN_HASHES / chip.hashrate) as u64;
            total += f64::from(chip.frequency);
        }

        let average = (total / chips as f64) as f32;
        if average != self.freq.current {
            info!(from = self.freq.current, to = average, "Frequency updated");
            self.freq.current = average;
            self.rates.wu_max = 0.0;
        }

        let chips = chips as f64;
        let frequency = f64::from(self.freq.current);
        let rates = &mut self.rates;
        rates.wu = chips * frequency * cores / WU_DIVISOR * scale;
        rates.hashrate = chips * frequency * cores * 1e6 * scale;
        rates.fullscan_ms = 1000.0 * scale * FULLSCAN_HASHES / rates.hashrate;
        rates.fullscan_us = (1e6 * scale * FULLSCAN_HASHES / rates.hashrate) as u64;

        rates.wait_factor = rates.wait_factor0;
        if boost {
            rates.wait_factor *= self.midstates as f64;
        }
        let estimate = (rates.wait_factor * rates.fullscan_us as f64) as u64;
        rates.max_task_wait_us = estimate.clamp(1, (3 * rates.fullscan_us).max(1));

        // The lead-chip check covers the whole chain, so the expected
        // interval is not scaled by chip count.
        let difficulty = self.ticket.difficulty;
        if difficulty == 0 {
            rates.nonce_expect_ms = 0.0;
        } else {
            rates.nonce_expect_ms = rates.fullscan_ms * f64::from(difficulty);
            rates.nonce_limit_ms = rates.nonce_expect_ms * NONCE_LIMIT_FACTOR;
        }

        debug!(
            fullscan_ms = rates.fullscan_ms,
            max_task_wait_us = rates.max_task_wait_us,
            nonce_limit_ms = rates.nonce_limit_ms,
            "Rates"
        );
    }
}

impl Device {
    pub fn update_rates(&self) {
        let boost = self.boosting();
        self.inner
            .lock()
            .update_rates(self.family.cores(), boost, Timestamp::now());
    }
}

/// Share of expected nonces a chip delivered over its nonce ring, in
/// percent.
///
/// The window is the full ring minus the still-filling bucket, plus the
/// time elapsed in it, so a chip performing as expected climbs towards
/// 100 % as the ring fills.
pub fn noncepercent(
    chip: &ChipRecord,
    nonces: u64,
    cores: u32,
    hr_scale: f64,
    work_diff: u32,
    now: Timestamp,
) -> f64 {
    let bucket = CHIP_BUCKET_SECS as f64;
    let secs = bucket * (CHIP_DEPTH - 1) as f64
        + now.secs().rem_euclid(CHIP_BUCKET_SECS) as f64
        + (now.as_micros().rem_euclid(1_000_000)) as f64 / 1e6;
    let hashes_per_sec = f64::from(chip.frequency) * f64::from(cores) * hr_scale * 1e6;
    let nonces_per_sec = hashes_per_sec / (HASHES_PER_DIFF - 1.0) / f64::from(work_diff.max(1));
    let expected = nonces_per_sec * secs;
    if expected <= 0.0 {
        return 0.0;
    }
    100.0 * nonces as f64 / expected
}
