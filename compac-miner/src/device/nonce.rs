//! Nonce resolution.
//!
//! The listener pushes every frame that may carry a nonce onto a
//! [`NonceQueue`]; a dedicated worker matches each one to the work it was
//! found for, checks it, and submits it upstream. Hashing stays off the
//! receive path, so a burst of nonces never stalls the serial reads.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::slots::ROLLBACK;
use super::ticket::TicketVerdict;
use super::{Device, MiningState};
use crate::asic::bm1397::protocol::Response;
use crate::stats::Timestamp;
use crate::tracing::prelude::*;
use crate::work::{Solution, Work};

/// A frame waiting for resolution, stamped when it was read.
#[derive(Debug, Clone)]
pub struct NonceCandidate {
    pub frame: Bytes,
    pub when: Timestamp,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    /// Waits that ended without a candidate arriving.
    pub timeouts: u64,
    /// Waits ended by a push.
    pub triggers: u64,
    /// Candidates dropped because the queue was full.
    pub dropped: u64,
}

/// Bounded parser → worker channel.
#[derive(Debug)]
pub struct NonceQueue {
    queue: Mutex<VecDeque<NonceCandidate>>,
    ready: Condvar,
    capacity: usize,
    timeouts: AtomicU64,
    triggers: AtomicU64,
    dropped: AtomicU64,
}

impl NonceQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            ready: Condvar::new(),
            capacity: capacity.max(1),
            timeouts: AtomicU64::new(0),
            triggers: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queues a candidate and wakes the worker. A full queue drops the new
    /// candidate and returns false.
    pub fn push(&self, candidate: NonceCandidate) -> bool {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        queue.push_back(candidate);
        drop(queue);
        self.ready.notify_one();
        true
    }

    /// Next candidate, waiting at most `wait` for one to arrive.
    pub fn next(&self, wait: Duration) -> Option<NonceCandidate> {
        let mut queue = self.queue.lock();
        if let Some(candidate) = queue.pop_front() {
            return Some(candidate);
        }
        if self.ready.wait_for(&mut queue, wait).timed_out() {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.triggers.fetch_add(1, Ordering::Relaxed);
        }
        queue.pop_front()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.len(),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            triggers: self.triggers.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NonceOutcome {
    /// Same nonce as the chip's previous one.
    Duplicate,
    /// No work in flight produces this nonce.
    HardwareError,
    Accepted { difficulty: f64 },
    /// Valid, but upstream refused it.
    Rejected,
    /// No chips on the chain to attribute it to.
    Dropped,
}

/// What the lookup under the primary lock found.
struct Match {
    work: Arc<Work>,
    midstate: usize,
    share_difficulty: f64,
    device_difficulty: u32,
    verdict: TicketVerdict,
}

impl Device {
    /// Resolves queued candidates until shutdown.
    pub(crate) fn run_nonce_worker(&self) {
        let wait = Duration::from_millis(self.config.nonce_wait_ms.max(1));
        while !self.is_shutdown() {
            if let Some(candidate) = self.nonces.next(wait) {
                self.resolve_nonce(&candidate);
            }
        }
        debug!(port = self.port(), "Nonce worker exiting");
    }

    pub(crate) fn resolve_nonce(&self, candidate: &NonceCandidate) -> NonceOutcome {
        let rx = Response(&candidate.frame);
        let nonce = rx.nonce();
        let job_id = rx.job_id();
        let now = Timestamp::now();

        let mut inner = self.inner.lock();
        inner.counters.nonces += 1;
        inner.counters.nonce_bytes[usize::from(rx.nonce_byte())] += 1;

        let chips = inner.chips.len();
        if chips == 0 {
            return NonceOutcome::Dropped;
        }
        let mapped = inner.nonce_map.is_some();
        let mut chip = match &inner.nonce_map {
            Some(map) => usize::from(map[usize::from(rx.nonce_byte())]),
            None => self
                .family
                .chip_for_nonce_byte(rx.fallback_chip_byte(), chips),
        };
        if chip >= chips {
            error!(port = self.port(), chip, chips, "Nonce chip out of range");
            chip = chips - 1;
        }

        if inner.chips[chip].is_duplicate(nonce) {
            inner.counters.dups += 1;
            inner.counters.dups_all += 1;
            inner.counters.dups_reset += 1;
            inner.timers.last_dup = Some(now);
            let record = &mut inner.chips[chip];
            record.duplicates += 1;
            record.total_duplicates += 1;
            let first = inner.counters.dups == 1;
            drop(inner);
            if first {
                self.state.transition(MiningState::Mining, MiningState::MiningDups);
            }
            trace!(port = self.port(), chip, nonce = format_args!("{nonce:08x}"), "Duplicate");
            return NonceOutcome::Duplicate;
        }

        inner.counters.prev_nonce = nonce;
        inner.chips[chip].last_nonce_value = Some(nonce);

        let boost = inner.boosting(self.config.noboost);
        let midstates = if boost { inner.midstates } else { 1 };

        let mut found = None;
        let exact = job_id & 0xfc;
        let exact_midstate = if boost { usize::from(job_id & 3) } else { 0 };
        if let Some(work) = inner.slots.lookup(exact) {
            if let Some(diff) = work.test_nonce(nonce, exact_midstate) {
                found = Some((work.clone(), exact_midstate, diff));
            }
        }
        if found.is_none() {
            let mut offset_hit = None;
            'rollback: for (i, &offset) in ROLLBACK.iter().enumerate() {
                let slot = inner.slots.rolled(offset) & 0xfc;
                let Some(work) = inner.slots.lookup(slot) else {
                    continue;
                };
                for midstate in 0..midstates {
                    if slot | midstate as u8 == job_id {
                        continue;
                    }
                    if let Some(diff) = work.test_nonce(nonce, midstate) {
                        found = Some((work.clone(), midstate, diff));
                        offset_hit = Some(i);
                        break 'rollback;
                    }
                }
            }
            if let Some(i) = offset_hit {
                inner.counters.cur_off[i] += 1;
            }
        }

        let Some((work, midstate, share_difficulty)) = found else {
            inner.counters.hw_errors += 1;
            inner.timers.last_hw_error = Some(now);
            drop(inner);
            debug!(
                port = self.port(),
                chip,
                job_id = format_args!("{job_id:#04x}"),
                nonce = format_args!("{nonce:08x}"),
                "Nonce matches no work"
            );
            self.work_source.hardware_error();
            return NonceOutcome::HardwareError;
        };

        let verdict = inner.ticket.check_nonce(share_difficulty);
        let found = Match {
            work,
            midstate,
            share_difficulty,
            device_difficulty: inner.ticket.difficulty,
            verdict,
        };
        let (difficulty, failures) = (inner.ticket.difficulty, inner.ticket.failures);
        // Reselect before any other nonce is checked against the failed ticket.
        let reselected = match verdict {
            TicketVerdict::Retry | TicketVerdict::GiveUp => {
                let entry = self.select_ticket(&mut inner, 0.0, true);
                if verdict == TicketVerdict::GiveUp {
                    inner.ticket.settle();
                }
                entry
            }
            _ => None,
        };
        drop(inner);

        match verdict {
            TicketVerdict::Retry | TicketVerdict::GiveUp => {
                warn!(
                    port = self.port(),
                    difficulty,
                    failures,
                    give_up = verdict == TicketVerdict::GiveUp,
                    "Ticket check failed, reselecting"
                );
                if let Some(entry) = reselected {
                    self.announce_ticket(entry, 0.0, true);
                }
            }
            TicketVerdict::Confirmed => {
                info!(port = self.port(), difficulty, "Ticket confirmed");
            }
            TicketVerdict::Idle | TicketVerdict::Pending => {}
        }
        self.submit(chip, mapped, nonce, found, candidate.when)
    }

    fn submit(
        &self,
        chip: usize,
        mapped: bool,
        nonce: u32,
        found: Match,
        when: Timestamp,
    ) -> NonceOutcome {
        let version = found
            .work
            .versions()
            .get(found.midstate)
            .copied()
            .unwrap_or_default();
        let solution = Solution {
            nonce,
            midstate: found.midstate,
            version,
            share_difficulty: found.share_difficulty,
            device_difficulty: found.device_difficulty,
        };
        if !self.work_source.submit(&found.work, &solution) {
            return NonceOutcome::Rejected;
        }

        let now = Timestamp::now();
        let difficulty = found.device_difficulty.max(1);
        {
            let mut inner = self.inner.lock();
            inner.timers.last_nonce = now;
            inner.counters.xhashes += u64::from(difficulty);
            inner.counters.hashes += f64::from(difficulty) * f64::from(0xffff_ffffu32);
            inner.counters.accepted += 1;
            inner.counters.dups = 0;
            if let Some(record) = inner.chips.get_mut(chip) {
                record.last_nonce = now;
                record.nonces += 1;
                record.duplicates = 0;
            }
        }
        self.hashrate
            .lock()
            .record(when, difficulty, mapped.then_some(chip));
        NonceOutcome::Accepted {
            difficulty: found.share_difficulty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{RecordingSource, fixture, fixture_with, with_chips};
    use crate::device::ticket::{TICKET_DELAY, TICKET_TABLE};
    use crate::work::tests::{GENESIS_NONCE, genesis};

    /// Nonce response frame. The worker does not look at the CRC byte.
    fn nonce_frame(nonce: u32, job_id: u8) -> Bytes {
        let mut frame = vec![0xaa, 0x55];
        frame.extend_from_slice(&nonce.to_be_bytes());
        frame.extend_from_slice(&[0x00, job_id, 0x80]);
        Bytes::from(frame)
    }

    fn candidate(nonce: u32, job_id: u8) -> NonceCandidate {
        NonceCandidate {
            frame: nonce_frame(nonce, job_id),
            when: Timestamp::now(),
        }
    }

    /// One chip at ticket difficulty 1 with genesis work installed.
    fn mining_device(f: &crate::device::tests::Fixture) -> u8 {
        with_chips(&f.device, 1);
        let mut inner = f.device.inner.lock();
        inner.ticket.apply(1.0, 1, true);
        inner.nonce_map = f.device.family.nonce_byte_map(1);
        let (job_id, _) = inner.slots.install(Arc::new(genesis()));
        drop(inner);
        f.device.set_state(MiningState::Mining);
        job_id
    }

    #[test]
    fn should_accept_valid_nonce_and_record_difficulty() {
        let f = fixture();
        let job_id = mining_device(&f);

        let outcome = f.device.resolve_nonce(&candidate(GENESIS_NONCE, job_id));

        assert!(matches!(outcome, NonceOutcome::Accepted { .. }));
        let inner = f.device.inner.lock();
        assert_eq!(inner.counters.accepted, 1);
        assert_eq!(inner.counters.dups, 0);
        assert_eq!(inner.counters.xhashes, 1);
        assert_eq!(inner.chips[0].nonces, 1);
        drop(inner);
        assert_eq!(f.device.hashrate.lock().difficulty(), 1);
        let submitted = f.source.submitted.lock();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].nonce, GENESIS_NONCE);
        assert_eq!(submitted[0].device_difficulty, 1);
    }

    #[test]
    fn should_reselect_ticket_when_check_fails() {
        let f = fixture();
        let job_id = mining_device(&f);
        {
            let mut inner = f.device.inner.lock();
            let entry = TICKET_TABLE[inner.ticket.number];
            inner.ticket.work = entry.nonces_count + TICKET_DELAY - 1;
        }

        let outcome = f.device.resolve_nonce(&candidate(GENESIS_NONCE, job_id));

        assert!(matches!(outcome, NonceOutcome::Accepted { .. }));
        let inner = f.device.inner.lock();
        assert_eq!(inner.ticket.failures, 1);
        assert_eq!(inner.ticket.difficulty, 16);
        assert_eq!(inner.ticket.work, 0);
        assert!(!inner.ticket.validated);
        drop(inner);
        let written = f.transport.written();
        let mask = written.last().expect("ticket mask");
        assert_eq!(mask[..6], [0x55, 0xaa, 0x51, 0x09, 0x00, 0x14]);
        assert_eq!(mask[9], 0xf0);
        assert_eq!(f.source.submitted.lock().len(), 1);
    }

    #[test]
    fn should_flag_first_duplicate_only() {
        let f = fixture();
        let job_id = mining_device(&f);
        f.device.resolve_nonce(&candidate(GENESIS_NONCE, job_id));

        assert_eq!(
            f.device.resolve_nonce(&candidate(GENESIS_NONCE, job_id)),
            NonceOutcome::Duplicate
        );
        assert_eq!(f.device.state(), MiningState::MiningDups);

        f.device.set_state(MiningState::Mining);
        f.device.resolve_nonce(&candidate(GENESIS_NONCE, job_id));
        assert_eq!(f.device.state(), MiningState::Mining);

        let inner = f.device.inner.lock();
        assert_eq!(inner.counters.dups, 2);
        assert_eq!(inner.counters.dups_all, 2);
        assert_eq!(inner.counters.accepted, 1);
        assert_eq!(inner.chips[0].total_duplicates, 2);
    }

    #[test]
    fn should_find_nonce_tagged_with_later_job() {
        let f = fixture();
        let job_id = mining_device(&f);
        // Newer work went out after the nonce's job.
        f.device
            .inner
            .lock()
            .slots
            .install(Arc::new(Work::new([0; crate::work::HEADER_LEN])));

        let tagged = f.device.inner.lock().slots.current();
        assert_ne!(tagged, job_id);
        let outcome = f.device.resolve_nonce(&candidate(GENESIS_NONCE, tagged));

        assert!(matches!(outcome, NonceOutcome::Accepted { .. }));
        assert_eq!(f.device.inner.lock().counters.cur_off[1], 1);
    }

    #[test]
    fn should_count_hardware_error_when_nothing_matches() {
        let f = fixture();
        let job_id = mining_device(&f);

        let outcome = f.device.resolve_nonce(&candidate(GENESIS_NONCE ^ 1, job_id));

        assert_eq!(outcome, NonceOutcome::HardwareError);
        assert_eq!(f.device.inner.lock().counters.hw_errors, 1);
        assert_eq!(*f.source.hw_errors.lock(), 1);
        assert!(f.source.submitted.lock().is_empty());
    }

    #[test]
    fn should_not_count_rejected_shares() {
        let f = fixture_with(RecordingSource {
            reject: true,
            ..Default::default()
        });
        let job_id = mining_device(&f);

        assert_eq!(
            f.device.resolve_nonce(&candidate(GENESIS_NONCE, job_id)),
            NonceOutcome::Rejected
        );
        assert_eq!(f.device.inner.lock().counters.accepted, 0);
        assert_eq!(f.device.hashrate.lock().difficulty(), 0);
    }

    #[test]
    fn should_drop_candidates_past_capacity() {
        let queue = NonceQueue::new(2);
        assert!(queue.push(candidate(1, 0x10)));
        assert!(queue.push(candidate(2, 0x10)));
        assert!(!queue.push(candidate(3, 0x10)));
        assert_eq!(queue.stats().dropped, 1);

        let first = queue.next(Duration::from_millis(1)).expect("candidate");
        assert_eq!(Response(&first.frame).nonce(), 1);
    }

    #[test]
    fn should_time_out_on_idle_queue() {
        let queue = NonceQueue::new(4);
        assert!(queue.next(Duration::from_millis(2)).is_none());
        assert_eq!(queue.stats().timeouts, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn should_wake_waiting_worker() {
        let queue = Arc::new(NonceQueue::new(4));
        let worker = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.next(Duration::from_secs(5)))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.push(candidate(7, 0x10));
        let got = worker.join().expect("worker");
        assert!(got.is_some());
    }
}
