//! Hashrate ring and the per-chip nonce rings that share its lock.
//!
//! The hashrate ring holds one bucket per second for the last minute. Each
//! bucket remembers the summed difficulty of the nonces it saw and the time
//! and difficulty of its first and last nonce, so the rate can be taken over
//! the span the samples actually cover.
//!
//! Per-chip rings only count nonces, in ten minute buckets, and back the
//! per-chip nonce percentage.

use serde::Serialize;

use super::Timestamp;
use super::ring::{Bucket, TimeRing};

/// One-second buckets kept by the hashrate ring.
pub const RATE_DEPTH: usize = 61;

/// Forward jump, in seconds, that clears the hashrate ring.
pub const RATE_WIPE_SECS: usize = RATE_DEPTH - 1;

/// Nonces needed before the rate is trusted for ramping.
pub const RATE_MIN_NONCES: u64 = 58;

/// Nonces that make the ring count as full for tuning.
pub const RATE_FULL_NONCES: u64 = 180;

pub const CHIP_DEPTH: usize = 6;
pub const CHIP_BUCKET_SECS: i64 = 600;

/// Nonce difficulty is scaled by this to count hashes.
pub const HASHES_PER_DIFF: f64 = 4_294_967_296.0;

#[derive(Debug, Default)]
pub struct RateBucket {
    pub difficulty: u64,
    pub first: Timestamp,
    pub first_difficulty: u64,
    pub last: Timestamp,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RateTotals {
    pub difficulty: u64,
}

impl Bucket for RateBucket {
    type Totals = RateTotals;

    fn retire(&self, totals: &mut RateTotals) {
        totals.difficulty -= self.difficulty;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RateSummary {
    pub zero_delta_secs: f64,
    pub history: usize,
    pub nonces: u64,
    pub difficulty: u64,
    pub ghs: f64,
}

#[derive(Debug)]
pub struct HashrateStats {
    ring: TimeRing<RateBucket>,
    chips: Vec<TimeRing<()>>,
}

fn chip_ring() -> TimeRing<()> {
    TimeRing::new(CHIP_DEPTH, CHIP_BUCKET_SECS, CHIP_DEPTH)
}

impl HashrateStats {
    pub fn new(chips: usize) -> Self {
        Self {
            ring: TimeRing::new(RATE_DEPTH, 1, RATE_WIPE_SECS),
            chips: (0..chips).map(|_| chip_ring()).collect(),
        }
    }

    /// Resizes the per-chip rings after enumeration. Every chip ring starts
    /// over.
    pub fn set_chip_count(&mut self, chips: usize) {
        self.chips = (0..chips).map(|_| chip_ring()).collect();
    }

    pub fn chip_count(&self) -> usize {
        self.chips.len()
    }

    pub fn advance(&mut self, now: Timestamp) {
        let anchoring = self.ring.anchor_secs().is_none();
        self.ring.advance(now.secs());
        if anchoring {
            for chip in &mut self.chips {
                chip.advance(now.secs());
            }
        }
    }

    /// Clears the hashrate ring and every chip ring.
    pub fn wipe(&mut self, now: Timestamp) {
        self.ring.wipe(now.secs());
        for chip in &mut self.chips {
            chip.wipe(now.secs());
        }
    }

    /// Records an accepted nonce. `chip` is given only when nonces can be
    /// attributed reliably.
    pub fn record(&mut self, now: Timestamp, difficulty: u32, chip: Option<usize>) {
        self.advance(now);
        let difficulty = u64::from(difficulty);
        self.ring.record(now.secs(), |bucket, totals, count| {
            if count == 0 {
                bucket.first = now;
                bucket.first_difficulty = difficulty;
            }
            bucket.last = now;
            bucket.difficulty += difficulty;
            totals.difficulty += difficulty;
        });

        if let Some(ring) = chip.and_then(|c| self.chips.get_mut(c)) {
            ring.record(now.secs(), |_, _, _| {});
        }
    }

    /// Hashrate in MH/s over the span covered by the ring.
    ///
    /// The first nonce of the oldest bucket marks the start of the span, so
    /// its difficulty is left out. With no oldest bucket the span starts a
    /// full ring before the current slot. The span ends at the newest nonce,
    /// or at `now` when the last two slots are empty.
    pub fn rate_mhs(&mut self, now: Timestamp) -> f64 {
        if self.ring.totals().difficulty == 0 || self.ring.samples() < 2 {
            return 0.0;
        }
        self.advance(now);
        if self.ring.samples() < 2 {
            return 0.0;
        }

        let oldest = self.ring.slot(self.ring.history());
        let (skipped, start) = if oldest.count != 0 {
            (oldest.bucket.first_difficulty, oldest.bucket.first)
        } else {
            let anchor = self.ring.anchor_secs().unwrap_or_else(|| now.secs());
            (0, Timestamp::from_secs(anchor - RATE_WIPE_SECS as i64))
        };
        let end = [self.ring.slot(0), self.ring.slot(1)]
            .into_iter()
            .find(|slot| slot.count != 0)
            .map_or(now, |slot| slot.bucket.last);

        let elapsed = end.secs_since(start);
        if elapsed <= 0.0 {
            return 0.0;
        }
        let difficulty = self.ring.totals().difficulty.saturating_sub(skipped);
        difficulty as f64 * HASHES_PER_DIFF / elapsed / 1e6
    }

    pub fn nonces(&self) -> u64 {
        self.ring.samples()
    }

    pub fn difficulty(&self) -> u64 {
        self.ring.totals().difficulty
    }

    pub fn history(&self) -> usize {
        self.ring.history()
    }

    /// Enough history to judge the hashrate: a full minute or plenty of
    /// nonces.
    pub fn is_settled(&self) -> bool {
        self.history() == RATE_DEPTH - 1 || self.nonces() > RATE_FULL_NONCES
    }

    /// Nonces from `chip` over the chip ring window, after expiring old
    /// buckets.
    pub fn chip_nonces(&mut self, chip: usize, now: Timestamp) -> u64 {
        match self.chips.get_mut(chip) {
            Some(ring) => {
                ring.advance(now.secs());
                ring.samples()
            }
            None => 0,
        }
    }

    /// Per-bucket nonce counts for `chip`, newest first.
    pub fn chip_ranges(&self, chip: usize) -> Vec<u64> {
        self.chips
            .get(chip)
            .map(|ring| ring.recent().map(|slot| slot.count).collect())
            .unwrap_or_default()
    }

    pub fn summary(&mut self, now: Timestamp) -> RateSummary {
        let mhs = self.rate_mhs(now);
        RateSummary {
            zero_delta_secs: self
                .ring
                .anchor_secs()
                .map_or(0.0, |anchor| now.secs_since(Timestamp::from_secs(anchor))),
            history: self.history(),
            nonces: self.nonces(),
            difficulty: self.difficulty(),
            ghs: mhs / 1e3,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let difficulty: u64 = self.ring.recent().map(|s| s.bucket.difficulty).sum();
        self.ring.bucket_sum() == self.ring.samples() && difficulty == self.difficulty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: f64) -> Timestamp {
        Timestamp::from_secs_f64(secs)
    }

    #[test]
    fn should_report_zero_without_samples() {
        let mut stats = HashrateStats::new(1);
        assert_eq!(stats.rate_mhs(at(1000.0)), 0.0);
    }

    #[test]
    fn should_report_zero_with_single_sample() {
        let mut stats = HashrateStats::new(1);
        stats.record(at(1000.0), 64, Some(0));
        assert_eq!(stats.rate_mhs(at(1001.0)), 0.0);
    }

    #[test]
    fn should_measure_rate_over_covered_span() {
        let mut stats = HashrateStats::new(1);
        stats.record(at(1000.0), 1, None);
        stats.record(at(1010.0), 1, None);
        stats.record(at(1020.0), 2, None);

        // The first nonce opens the span and is not counted.
        let expect = 3.0 * HASHES_PER_DIFF / 20.0 / 1e6;
        let rate = stats.rate_mhs(at(1020.5));
        assert!((rate - expect).abs() < 1e-6, "{rate} != {expect}");
        assert!(stats.is_consistent());
    }

    #[test]
    fn should_end_span_at_now_when_recent_slots_empty() {
        let mut stats = HashrateStats::new(1);
        stats.record(at(1000.0), 4, None);
        stats.record(at(1000.5), 4, None);

        let expect = 4.0 * HASHES_PER_DIFF / 10.0 / 1e6;
        let rate = stats.rate_mhs(at(1010.0));
        assert!((rate - expect).abs() < 1e-6, "{rate} != {expect}");
    }

    #[test]
    fn should_wipe_chip_rings_with_hashrate() {
        let mut stats = HashrateStats::new(2);
        stats.record(at(5000.0), 8, Some(1));
        assert_eq!(stats.chip_nonces(1, at(5000.0)), 1);
        stats.wipe(at(5001.0));
        assert_eq!(stats.nonces(), 0);
        assert_eq!(stats.difficulty(), 0);
        assert_eq!(stats.chip_nonces(1, at(5001.0)), 0);
    }

    #[test]
    fn should_count_chip_nonces_across_window() {
        let mut stats = HashrateStats::new(1);
        stats.record(at(6000.0), 1, Some(0));
        stats.record(at(6700.0), 1, Some(0));
        assert_eq!(stats.chip_nonces(0, at(6700.0)), 2);
        assert_eq!(stats.chip_ranges(0)[..2], [1, 1]);
        // Six ten-minute buckets later the first nonce has aged out.
        assert_eq!(stats.chip_nonces(0, at(6000.0 + 3600.0)), 1);
    }

    #[test]
    fn should_settle_after_full_minute() {
        let mut stats = HashrateStats::new(1);
        for t in 0..=60 {
            stats.record(at(2000.0 + f64::from(t)), 1, None);
        }
        assert_eq!(stats.history(), RATE_DEPTH - 1);
        assert!(stats.is_settled());
    }
}
