//! Fixed-depth ring of time buckets.
//!
//! A [`TimeRing`] splits time into slots of `width` seconds and keeps the
//! most recent `depth` of them. Before anything is recorded the ring is
//! advanced to the current slot, expiring the buckets that fell out of the
//! window:
//!
//! ```text
//!   anchor slot ──┐
//!                 v
//!   [ b3 ][ b4 ][ b0 ][ b1 ][ b2 ]      offset = 2, history = 4
//!                 ^
//!              current
//! ```
//!
//! Advancing by `n` slots, with `0 < n < wipe_span`, steps the offset `n`
//! times, retiring and clearing the bucket it lands on. A jump of
//! `wipe_span` slots or more, or any jump backwards, wipes the ring instead.
//! The running sample count and the bucket type's own totals always equal
//! the sum over live buckets.

use std::fmt;

/// Payload of one ring bucket.
pub trait Bucket: Default + fmt::Debug {
    /// Aggregates kept across all live buckets, beyond the sample count.
    type Totals: Default + fmt::Debug;

    /// Removes this bucket's contribution from the totals.
    fn retire(&self, totals: &mut Self::Totals);
}

impl Bucket for () {
    type Totals = ();

    fn retire(&self, _totals: &mut ()) {}
}

/// A bucket and the number of samples recorded into it.
#[derive(Debug, Default)]
pub struct Slot<B> {
    pub count: u64,
    pub bucket: B,
}

/// What [`TimeRing::advance`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Still in the current slot.
    Unchanged,
    /// First use; the ring is now anchored.
    Anchored,
    /// Moved forward this many slots, expiring one bucket per slot.
    Expired(usize),
    /// Time moved backwards or too far forwards; everything was cleared.
    Wiped,
}

#[derive(Debug)]
pub struct TimeRing<B: Bucket> {
    slots: Box<[Slot<B>]>,
    width_secs: i64,
    wipe_span: i64,
    anchor: Option<i64>,
    offset: usize,
    history: usize,
    samples: u64,
    totals: B::Totals,
}

impl<B: Bucket> TimeRing<B> {
    /// A ring of `depth` buckets, each `width_secs` wide. Forward jumps of
    /// `wipe_span` slots or more clear the ring.
    pub fn new(depth: usize, width_secs: i64, wipe_span: usize) -> Self {
        let depth = depth.max(1);
        Self {
            slots: (0..depth).map(|_| Slot::default()).collect(),
            width_secs: width_secs.max(1),
            wipe_span: wipe_span.clamp(1, depth) as i64,
            anchor: None,
            offset: 0,
            history: 0,
            samples: 0,
            totals: B::Totals::default(),
        }
    }

    fn slot_of(&self, now_secs: i64) -> i64 {
        now_secs.div_euclid(self.width_secs)
    }

    /// Brings the ring up to `now_secs`, expiring buckets that aged out.
    /// Calling it again with the same time changes nothing.
    pub fn advance(&mut self, now_secs: i64) -> Advance {
        let slot = self.slot_of(now_secs);
        let outcome = match self.anchor {
            None => {
                self.anchor = Some(slot);
                Advance::Anchored
            }
            Some(anchor) if anchor == slot => Advance::Unchanged,
            Some(anchor) => {
                let delta = slot - anchor;
                if delta < 0 || delta >= self.wipe_span {
                    self.clear(slot);
                    Advance::Wiped
                } else {
                    self.anchor = Some(slot);
                    let steps = delta as usize;
                    for _ in 0..steps {
                        self.step();
                    }
                    Advance::Expired(steps)
                }
            }
        };

        if self.samples == 0 {
            self.history = 0;
        }
        outcome
    }

    fn step(&mut self) {
        let depth = self.slots.len();
        self.offset = (self.offset + 1) % depth;
        let expired = std::mem::take(&mut self.slots[self.offset]);
        self.samples -= expired.count;
        expired.bucket.retire(&mut self.totals);
        if self.history < depth - 1 {
            self.history += 1;
        }
    }

    fn clear(&mut self, slot: i64) {
        self.slots.iter_mut().for_each(|s| *s = Slot::default());
        self.totals = B::Totals::default();
        self.samples = 0;
        self.offset = 0;
        self.history = 0;
        self.anchor = Some(slot);
    }

    /// Zeroes every bucket and re-anchors at `now_secs`.
    pub fn wipe(&mut self, now_secs: i64) {
        let slot = self.slot_of(now_secs);
        self.clear(slot);
    }

    /// Advances to `now_secs` and lets `record` update the current bucket.
    /// `record` is told how many samples the bucket already holds.
    pub fn record<F>(&mut self, now_secs: i64, record: F) -> Advance
    where
        F: FnOnce(&mut B, &mut B::Totals, u64),
    {
        let outcome = self.advance(now_secs);
        let slot = &mut self.slots[self.offset];
        record(&mut slot.bucket, &mut self.totals, slot.count);
        slot.count += 1;
        self.samples += 1;
        outcome
    }

    /// The slot `back` steps behind the current one.
    pub fn slot(&self, back: usize) -> &Slot<B> {
        let depth = self.slots.len();
        &self.slots[(self.offset + depth - back % depth) % depth]
    }

    /// Slots from newest to oldest.
    pub fn recent(&self) -> impl Iterator<Item = &Slot<B>> + '_ {
        (0..self.slots.len()).map(|back| self.slot(back))
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn totals(&self) -> &B::Totals {
        &self.totals
    }

    /// Number of whole slots behind the current one that hold live data.
    pub fn history(&self) -> usize {
        self.history
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Start of the current slot in seconds, once anchored.
    pub fn anchor_secs(&self) -> Option<i64> {
        self.anchor.map(|slot| slot * self.width_secs)
    }

    #[cfg(test)]
    pub(crate) fn bucket_sum(&self) -> u64 {
        self.slots.iter().map(|s| s.count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Weight(u64);

    impl Bucket for Weight {
        type Totals = u64;

        fn retire(&self, totals: &mut u64) {
            *totals -= self.0;
        }
    }

    fn add(ring: &mut TimeRing<Weight>, now: i64, weight: u64) {
        ring.record(now, |bucket, total, _| {
            bucket.0 += weight;
            *total += weight;
        });
    }

    fn weight_sum(ring: &TimeRing<Weight>) -> u64 {
        ring.recent().map(|s| s.bucket.0).sum()
    }

    #[test]
    fn should_anchor_on_first_use() {
        let mut ring: TimeRing<()> = TimeRing::new(6, 600, 6);
        assert_eq!(ring.advance(1200), Advance::Anchored);
        assert_eq!(ring.anchor_secs(), Some(1200));
    }

    #[test]
    fn should_not_mutate_when_advanced_twice_to_same_time() {
        let mut ring = TimeRing::<Weight>::new(5, 1, 4);
        add(&mut ring, 100, 3);
        add(&mut ring, 102, 4);
        assert_eq!(ring.advance(103), Advance::Expired(1));
        let (offset, history, samples) = (ring.offset(), ring.history(), ring.samples());

        assert_eq!(ring.advance(103), Advance::Unchanged);
        assert_eq!(ring.offset(), offset);
        assert_eq!(ring.history(), history);
        assert_eq!(ring.samples(), samples);
        assert_eq!(*ring.totals(), 7);
    }

    #[test]
    fn should_zero_everything_on_wipe() {
        let mut ring = TimeRing::<Weight>::new(5, 1, 4);
        for t in 0..20 {
            add(&mut ring, 100 + t / 3, 2);
        }
        ring.wipe(200);
        assert_eq!(ring.samples(), 0);
        assert_eq!(*ring.totals(), 0);
        assert_eq!(ring.history(), 0);
        assert!(ring.recent().all(|s| s.count == 0 && s.bucket.0 == 0));
        assert_eq!(ring.anchor_secs(), Some(200));
    }

    #[test]
    fn should_keep_totals_consistent_under_monotonic_time() {
        let mut ring = TimeRing::<Weight>::new(61, 1, 60);
        let mut now = 1_000;
        for i in 0..500u64 {
            // Steps of 0..=60 seconds, never beyond the wipe span.
            now += (i * 7919) as i64 % 61;
            add(&mut ring, now, i % 5 + 1);
            assert_eq!(ring.bucket_sum(), ring.samples());
            assert_eq!(weight_sum(&ring), *ring.totals());
        }
    }

    #[test]
    fn should_expire_exactly_aged_buckets() {
        let mut ring = TimeRing::<Weight>::new(5, 1, 4);
        add(&mut ring, 10, 1);
        add(&mut ring, 11, 2);
        add(&mut ring, 12, 4);
        assert_eq!(ring.advance(14), Advance::Expired(2));
        assert_eq!(*ring.totals(), 7);
        assert_eq!(ring.advance(15), Advance::Expired(1));
        // Slot 10 is gone, 11 and 12 survive.
        assert_eq!(*ring.totals(), 6);
        assert_eq!(ring.samples(), 2);
        assert_eq!(ring.history(), 4);
    }

    #[test]
    fn should_wipe_on_backward_jump() {
        let mut ring = TimeRing::<Weight>::new(5, 1, 4);
        add(&mut ring, 10, 1);
        assert_eq!(ring.advance(9), Advance::Wiped);
        assert_eq!(ring.samples(), 0);
    }

    #[test]
    fn should_wipe_on_jump_beyond_span() {
        let mut ring = TimeRing::<Weight>::new(5, 1, 4);
        add(&mut ring, 10, 1);
        add(&mut ring, 11, 1);
        assert_eq!(ring.advance(15), Advance::Wiped);
        assert_eq!(*ring.totals(), 0);
    }

    #[test]
    fn should_cap_history_at_depth() {
        let mut ring = TimeRing::<Weight>::new(3, 1, 2);
        for t in 0..10 {
            add(&mut ring, t, 1);
        }
        assert_eq!(ring.history(), 2);
        assert_eq!(ring.samples(), 3);
    }

    #[test]
    fn should_forget_history_when_empty() {
        let mut ring = TimeRing::<Weight>::new(5, 60, 4);
        add(&mut ring, 0, 1);
        ring.advance(180);
        assert_eq!(ring.samples(), 1);
        ring.advance(239);
        assert_eq!(ring.history(), 3);
        ring.advance(240);
        assert_eq!(ring.samples(), 1);
        // Bucket 0 only expires after a full ring turn.
        ring.advance(300);
        assert_eq!(ring.samples(), 0);
        assert_eq!(ring.history(), 0);
    }

    #[test]
    fn should_find_slots_behind_current() {
        let mut ring = TimeRing::<Weight>::new(4, 1, 3);
        add(&mut ring, 0, 1);
        add(&mut ring, 1, 2);
        add(&mut ring, 2, 3);
        assert_eq!(ring.slot(0).bucket.0, 3);
        assert_eq!(ring.slot(1).bucket.0, 2);
        assert_eq!(ring.slot(2).bucket.0, 1);
        assert_eq!(ring.slot(3).count, 0);
    }
}
