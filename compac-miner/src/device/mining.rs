//! Mining loop: keeps the chain supplied with one task per full-scan
//! interval.
//!
//! Each pass either sleeps towards the next task deadline or fetches work,
//! installs it in the next job slot and writes the task. Frequency
//! supervision runs from here too, once the chain has mined for a while
//! after a reset.

use std::sync::Arc;
use std::time::Instant;

use super::frequency::SupervisorClock;
use super::pacing::{MIN_SLEEP_US, SLEEP_MARGIN_US};
use super::{Device, MiningState};
use crate::asic::bm1397::protocol::{Command, FrameCodec, Task};
use crate::stats::Timestamp;
use crate::stats::hashrate::RATE_MIN_NONCES;
use crate::tracing::prelude::*;
use crate::work::Work;

/// Statistics need this much data after a reset before anything is tuned.
const SUPERVISE_AFTER_RESET_SECS: f64 = 10.0;

const ROLLING_INTERVAL_SECS: f64 = 1.0;
const FREQUENCY_CHECK_MS: f64 = 20.0;
const RATES_REFRESH_SECS: f64 = 5.0;

/// Headroom kept between a pacing sleep and the task deadline.
const PACING_HEADROOM_US: i64 = 300;
const PACING_SLICE_MAX_US: i64 = 1000;
const PACING_SLICE_CAP_US: i64 = 100_000;

/// Overruns shorter than this are not counted.
const OVERRUN_MIN_US: i64 = 10;

/// Midstate count announced in busy tasks while boosting.
const BUSY_BOOST_MIDSTATES: u8 = 4;

const MINING_NICENESS: i32 = -15;

/// State the mining loop carries between passes.
#[derive(Debug)]
pub struct MiningLoop {
    pub(crate) clock: SupervisorClock,
    /// Work evicted from its slot, completed on the next pass.
    pub(crate) old_work: Option<Arc<Work>>,
    sleep_us: i64,
}

impl MiningLoop {
    pub fn new(now: Timestamp) -> Self {
        Self {
            clock: SupervisorClock::new(now),
            old_work: None,
            sleep_us: 100,
        }
    }
}

/// What one pass of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningStep {
    /// Not mining, or no chip has a frequency.
    Idle,
    /// Slept towards the next task deadline.
    Paced,
    /// No work, but the pool is up; chips fill in with duplicates.
    AwaitingWork,
    Sent { busy: bool },
    WriteFailed,
}

impl Device {
    pub(crate) fn run_mining(&self) {
        raise_priority(self.port());
        let mut mining = MiningLoop::new(Timestamp::now());
        while !self.is_shutdown() {
            self.mining_step(&mut mining);
        }
        if let Some(work) = mining.old_work.take() {
            self.work_source.work_completed(work);
        }
        debug!(port = self.port(), "Mining loop exiting");
    }

    pub(crate) fn mining_step(&self, mining: &mut MiningLoop) -> MiningStep {
        if let Some(work) = mining.old_work.take() {
            self.work_source.work_completed(work);
        }

        if !self.state().is_mining() || !self.chips_known() {
            self.pacer.sleep_ms(10);
            return MiningStep::Idle;
        }

        let now = Timestamp::now();
        let (update_work, last_task, max_wait) = {
            let inner = self.inner.lock();
            (
                inner.update_work,
                inner.timers.last_task,
                inner.rates.max_task_wait_us as i64,
            )
        };
        if !update_work {
            let left = max_wait - (now.as_micros() - last_task.as_micros());
            if left > 0 {
                let slice = mining
                    .sleep_us
                    .min(left - PACING_HEADROOM_US)
                    .min(PACING_SLICE_MAX_US);
                if slice >= MIN_SLEEP_US as i64 {
                    self.pacer.sleep_us(slice as u64);
                    return MiningStep::Paced;
                }
            }
        }

        let (max_wait, last_reset) = {
            let mut inner = self.inner.lock();
            inner.update_work = false;
            (inner.rates.max_task_wait_us, inner.timers.last_reset)
        };
        mining.sleep_us = ((max_wait as f64 / 20.0).ceil() as i64).clamp(1, PACING_SLICE_CAP_US);

        self.track_work_units(now);

        if now.secs_since(last_reset) > SUPERVISE_AFTER_RESET_SECS {
            self.update_rolling(now, &mut mining.clock);
            let updated = self.supervise_frequency(now, &mut mining.clock);
            if !self.state().is_mining() {
                return MiningStep::Idle;
            }
            self.check_frequency_updated(now, updated, &mut mining.clock);
        }

        let has_freq = self
            .inner
            .lock()
            .chips
            .iter()
            .any(|chip| chip.frequency != 0.0);
        if !has_freq {
            self.pacer.sleep_ms(10);
            return MiningStep::Idle;
        }

        self.sleep_before_fetch();

        let fetch_start = Instant::now();
        let work = self.work_source.next_work();
        let fetch_us = fetch_start.elapsed().as_secs_f64() * 1e6;

        let had_work = work.is_some();
        let task = match work {
            Some(work) => self.install_work(Arc::new(work), fetch_us, mining),
            None => {
                if self.work_source.pool_active() {
                    self.pacer.sleep_ms(1);
                    self.inner.lock().loop_stats.last_was_busy = true;
                    return MiningStep::AwaitingWork;
                }
                self.busy_task()
            }
        };

        let now = Timestamp::now();
        let frame = FrameCodec::frame(&Command::Task(task));
        trace!(port = self.port(), frame = %hex::encode(&frame), "TASK");
        let job_added = match self.transport().write(&frame) {
            Err(e) => {
                self.write_failed(&e);
                return MiningStep::WriteFailed;
            }
            Ok(written) if written != frame.len() => {
                self.short_write(written, frame.len());
                false
            }
            Ok(_) => {
                self.jobs.lock().record(now);
                true
            }
        };

        self.pacer.sleep_us(u64::from(self.usb_prop_us()));

        let last_update = {
            let mut inner = self.inner.lock();
            let since = now.millis_since(inner.timers.last_task);
            inner.loop_stats.task_ms = (inner.loop_stats.task_ms * 9.0 + since) / 10.0;
            inner.timers.last_task = now;
            inner.timers.first_task.get_or_insert(now);
            inner.counters.tasks += 1;
            inner.rates.last_update
        };
        if had_work && job_added && now.secs_since(last_update) > RATES_REFRESH_SECS {
            self.update_rates();
        }

        MiningStep::Sent { busy: !had_work }
    }

    /// Sleeps most of the time left before the task is due, keeping back
    /// what a work fetch usually takes.
    fn sleep_before_fetch(&self) {
        let (num, avg, last_task, max_wait, busy) = {
            let inner = self.inner.lock();
            (
                inner.loop_stats.work_usec_num,
                inner.loop_stats.work_usec_avg,
                inner.timers.last_task,
                inner.rates.max_task_wait_us as i64,
                inner.loop_stats.last_was_busy,
            )
        };
        if num <= 1 || busy {
            return;
        }
        let now = Timestamp::now();
        let left = max_wait - (now.as_micros() - last_task.as_micros());
        if left > 0 {
            let left = left - (avg as i64 + SLEEP_MARGIN_US as i64);
            if left >= MIN_SLEEP_US as i64 {
                self.pacer.sleep_us(left as u64);
            }
        } else if left <= -OVERRUN_MIN_US {
            self.inner.lock().loop_stats.over1.add(left.unsigned_abs());
        }
    }

    /// Puts fetched work into the next slot and builds its task.
    fn install_work(&self, work: Arc<Work>, fetch_us: f64, mining: &mut MiningLoop) -> Task {
        let now = Timestamp::now();
        let mut inner = self.inner.lock();

        let stats = &mut inner.loop_stats;
        if stats.work_usec_num == 0 {
            stats.work_usec_avg = fetch_us;
        } else if fetch_us < stats.work_usec_avg / 2.0 {
            stats.work_usec_avg = (stats.work_usec_avg + fetch_us) / 2.0;
        } else if stats.work_usec_num > 5 && fetch_us / 3.0 < stats.work_usec_avg {
            stats.work_usec_avg = (stats.work_usec_avg * 9.0 + fetch_us) / 10.0;
        }
        stats.work_usec_num += 1;
        stats.last_was_busy = false;

        let left = inner.rates.max_task_wait_us as i64
            - (now.as_micros() - inner.timers.last_task.as_micros());
        if left <= -OVERRUN_MIN_US {
            inner.loop_stats.over2.add(left.unsigned_abs());
        }

        inner.vmask = work.rolls_version();
        let boost = inner.boosting(self.config.noboost);
        inner.midstates = if boost {
            work.midstates().len().clamp(1, self.family.max_midstates())
        } else {
            1
        };
        let midstates = inner.midstates;

        let (job_id, evicted) = inner.slots.install(work.clone());
        mining.old_work = evicted;

        Task {
            job_id,
            midstate_count: midstates as u8,
            len: self.family.task_len(midstates),
            header_tail: Some(work.header_tail()),
            midstates: work.midstates()[..midstates].to_vec(),
        }
    }

    /// Filler task for when no work is available and the pool is down.
    fn busy_task(&self) -> Task {
        let now = Timestamp::now();
        let mut inner = self.inner.lock();
        inner.counters.busy_work += 1;
        inner.loop_stats.last_was_busy = true;
        inner.timers.monitor = now;
        let boost = inner.boosting(self.config.noboost);
        let midstates = if boost { inner.midstates } else { 1 };
        let announced = if boost { BUSY_BOOST_MIDSTATES } else { 1 };
        let task = Task::idle(
            inner.slots.current(),
            announced,
            self.family.task_len(midstates),
        );
        drop(inner);
        info!(port = self.port(), "Busy");
        task
    }

    /// Work units per minute since mining started, and its high-water mark.
    fn track_work_units(&self, now: Timestamp) {
        let mut inner = self.inner.lock();
        let runtime = now.secs_since(inner.timers.start_time);
        if runtime <= 0.0 {
            return;
        }
        let diff1 = inner.counters.hashes / f64::from(u32::MAX);
        let wu = diff1 / runtime * 60.0;
        if wu > inner.rates.wu_max {
            inner.rates.wu_max = wu;
        }
        inner.loop_stats.eff_wu = if inner.rates.wu > 0.0 {
            (100.0 * wu / inner.rates.wu).min(100.0)
        } else {
            0.0
        };
    }

    /// Rolling hashrate, efficiency and the computed-frequency estimate.
    fn update_rolling(&self, now: Timestamp, clock: &mut SupervisorClock) {
        if now.secs_since(clock.last_rolling) >= ROLLING_INTERVAL_SECS {
            let mut hashrate = self.hashrate.lock();
            if hashrate.nonces() > RATE_MIN_NONCES + 1 {
                clock.last_rolling = now;
                let mhs = hashrate.rate_mhs(now);
                drop(hashrate);
                self.inner.lock().loop_stats.rolling_mhs = mhs;
            }
        }

        let mut inner = self.inner.lock();
        let rolling_mhs = inner.loop_stats.rolling_mhs;
        let nominal = inner.rates.hashrate;
        inner.loop_stats.eff_gs = if nominal > 0.0 {
            (100.0 * rolling_mhs * 1e6 / nominal).min(100.0)
        } else {
            0.0
        };
        let chips = inner.chips.len();
        if inner
            .freq
            .update_computed(rolling_mhs, self.family.cores(), chips, now)
        {
            info!(
                port = self.port(),
                computed = inner.freq.computed,
                ghs = rolling_mhs / 1e3,
                "Computed frequency raised"
            );
        }
    }

    /// Clears the changed-frequency mark of the first chip that has one.
    fn check_frequency_updated(&self, now: Timestamp, updated: bool, clock: &mut SupervisorClock) {
        if updated || now.millis_since(clock.last_frequency_check) <= FREQUENCY_CHECK_MS {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.freq.lock {
            return;
        }
        clock.last_frequency_check = now;
        if let Some(chip) = inner.chips.iter_mut().find(|chip| chip.frequency_updated) {
            chip.frequency_updated = false;
        }
    }
}

/// Best effort; mining still works at normal priority.
fn raise_priority(port: &str) {
    match rustix::process::nice(MINING_NICENESS) {
        Ok(niceness) => debug!(port, niceness, "Mining thread priority"),
        Err(e) => debug!(port, error = %e, "Could not raise mining thread priority"),
    }
}
