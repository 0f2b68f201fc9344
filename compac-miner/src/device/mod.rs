//! Device context for one chip chain.
//!
//! A [`Device`] is shared by the listener, mining, nonce and control
//! threads. Its protocol state lives in an atomic so every thread can poll
//! it without locking. Everything else sits behind one of three locks:
//!
//! - `inner` guards the counters, work slots, ticket and frequency state.
//! - `hashrate` guards the hashrate and per-chip rings.
//! - `jobs` guards the job-timing ring.
//!
//! No code path holds `inner` while taking a ring lock. Helpers that need
//! both copy what they need out of `inner` first.

pub mod bringup;
pub mod chip;
pub mod frequency;
pub mod listener;
pub mod mining;
pub mod nonce;
pub mod pacing;
pub mod rates;
pub mod slots;
pub mod state;
pub mod ticket;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

pub use frequency::FrequencyTarget;
pub use state::{AtomicMiningState, MiningState};

use self::chip::ChipRecord;
use self::frequency::FrequencyState;
use self::nonce::NonceQueue;
use self::pacing::Pacer;
use self::rates::Rates;
use self::slots::{ROLLBACK, WorkSlots};
use self::ticket::{TicketEntry, TicketState};
use crate::asic::bm1397::protocol::{Command, FrameCodec};
use crate::asic::{Bm1397, ChipFamily};
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use crate::registry::{PortRegistry, PrepareOutcome};
use crate::stats::{HashrateStats, JobStats, Timestamp};
use crate::tracing::prelude::*;
use crate::transport::{INIT_BAUD, Transport, TransportError};
use crate::work::WorkSource;

/// Write errors are logged at most this often.
const WRITE_ERROR_LOG_INTERVAL_SECS: f64 = 5.0;

#[derive(Debug, Clone, Serialize)]
pub struct Counters {
    /// Nonce candidates taken off the queue.
    pub nonces: u64,
    pub accepted: u64,
    /// Duplicates since the last accepted nonce.
    pub dups: u64,
    pub dups_all: u64,
    /// Duplicates since the last reset.
    pub dups_reset: u64,
    pub hw_errors: u64,
    pub busy_work: u64,
    pub tasks: u64,
    pub fail_count: u64,
    pub short_writes: u64,
    /// Difficulty accepted since the last hashes report.
    pub xhashes: u64,
    pub hashes: f64,
    /// Nonces per value of the chip-selecting nonce byte.
    pub nonce_bytes: Vec<u64>,
    /// Successful matches per roll-back offset.
    pub cur_off: [u64; ROLLBACK.len()],
    pub prev_nonce: u32,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            nonces: 0,
            accepted: 0,
            dups: 0,
            dups_all: 0,
            dups_reset: 0,
            hw_errors: 0,
            busy_work: 0,
            tasks: 0,
            fail_count: 0,
            short_writes: 0,
            xhashes: 0,
            hashes: 0.0,
            nonce_bytes: vec![0; 256],
            cur_off: [0; ROLLBACK.len()],
            prev_nonce: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Timers {
    pub start_time: Timestamp,
    pub last_reset: Timestamp,
    /// Last frequency or plateau event the supervisor acted on.
    pub monitor: Timestamp,
    pub last_task: Timestamp,
    pub first_task: Option<Timestamp>,
    pub last_nonce: Timestamp,
    pub last_dup: Option<Timestamp>,
    pub last_hw_error: Option<Timestamp>,
    pub last_write_error: Option<Timestamp>,
    pub last_ticket_attempt: Option<Timestamp>,
}

impl Timers {
    fn new(now: Timestamp) -> Self {
        Self {
            start_time: now,
            last_reset: now,
            monitor: now,
            last_task: now,
            first_task: None,
            last_nonce: now,
            last_dup: None,
            last_hw_error: None,
            last_write_error: None,
            last_ticket_attempt: None,
        }
    }
}

/// Task scheduling overruns: how often, and by how much in total.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Overrun {
    pub count: u64,
    pub total_us: u64,
}

impl Overrun {
    pub fn add(&mut self, us: u64) {
        self.count += 1;
        self.total_us += us;
    }
}

/// Timing the mining loop measures about itself.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopStats {
    /// EWMA of the interval between tasks.
    pub task_ms: f64,
    /// Average time to fetch a work item.
    pub work_usec_avg: f64,
    pub work_usec_num: u64,
    /// Task due before the pre-fetch sleep.
    pub over1: Overrun,
    /// Task due after fetching work.
    pub over2: Overrun,
    pub rolling_mhs: f64,
    /// Measured over nominal hashrate, in percent.
    pub eff_gs: f64,
    /// Measured over expected work units, in percent.
    pub eff_wu: f64,
    pub last_was_busy: bool,
}

/// Mutable device state behind the primary lock.
#[derive(Debug)]
pub struct DeviceState {
    pub chips: Vec<ChipRecord>,
    pub freq: FrequencyState,
    pub ticket: TicketState,
    pub slots: WorkSlots,
    pub rates: Rates,
    pub counters: Counters,
    pub timers: Timers,
    pub loop_stats: LoopStats,
    /// Current work rolls the header version.
    pub vmask: bool,
    pub midstates: usize,
    /// Nonce byte to chip, when the topology has a known layout.
    pub nonce_map: Option<Box<[u8; 256]>>,
    /// Job id reached while warming cores up.
    pub ramping: u32,
    /// Set when the mining loop must treat the next task as new work.
    pub update_work: bool,
}

impl DeviceState {
    fn new(config: &DriverConfig, family: &dyn ChipFamily, now: Timestamp) -> Self {
        Self {
            chips: Vec::new(),
            freq: FrequencyState::new(config, family),
            ticket: TicketState::default(),
            slots: WorkSlots::new(family.job_ids()),
            rates: Rates::new(
                f64::from(config.wait_factor),
                config.ident.hashrate_scale(),
            ),
            counters: Counters::default(),
            timers: Timers::new(now),
            loop_stats: LoopStats::default(),
            vmask: false,
            midstates: 1,
            nonce_map: None,
            ramping: 0,
            update_work: false,
        }
    }

    pub fn boosting(&self, noboost: bool) -> bool {
        !noboost && self.vmask
    }

    pub fn chips_x_cores(&self, cores: u32) -> u32 {
        self.chips.len() as u32 * cores
    }
}

/// One chip chain behind one serial port.
pub struct Device {
    pub(crate) config: DriverConfig,
    pub(crate) family: &'static dyn ChipFamily,
    transport: Arc<dyn Transport>,
    pub(crate) work_source: Arc<dyn WorkSource>,
    registry: Arc<PortRegistry>,
    pub(crate) state: AtomicMiningState,
    pub(crate) inner: Mutex<DeviceState>,
    pub(crate) hashrate: Mutex<HashrateStats>,
    pub(crate) jobs: Mutex<JobStats>,
    pub(crate) pacer: Pacer,
    pub(crate) nonces: NonceQueue,
    usb_prop_us: AtomicU32,
}

impl Device {
    pub fn new(
        config: &DriverConfig,
        transport: Arc<dyn Transport>,
        work_source: Arc<dyn WorkSource>,
        registry: Arc<PortRegistry>,
    ) -> Self {
        let config = config.normalized();
        let family: &'static dyn ChipFamily = &Bm1397;
        let now = Timestamp::now();
        Self {
            inner: Mutex::new(DeviceState::new(&config, family, now)),
            hashrate: Mutex::new(HashrateStats::new(0)),
            jobs: Mutex::new(JobStats::new()),
            pacer: Pacer::new(),
            nonces: NonceQueue::new(config.nonce_queue_capacity),
            usb_prop_us: AtomicU32::new(config.usb_prop_us),
            state: AtomicMiningState::new(MiningState::Init),
            family,
            transport,
            work_source,
            registry,
            config,
        }
    }

    pub fn port(&self) -> &str {
        self.transport.port_id()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn state(&self) -> MiningState {
        self.state.load()
    }

    pub fn set_state(&self, state: MiningState) {
        let previous = self.state.store(state);
        if previous != state && previous != MiningState::Shutdown {
            info!(port = self.port(), from = %previous, to = %state, "State");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.is_shutdown()
    }

    pub fn usb_prop_us(&self) -> u32 {
        self.usb_prop_us.load(Ordering::Relaxed)
    }

    pub fn set_usb_prop_us(&self, us: u32) {
        self.usb_prop_us.store(us, Ordering::Relaxed);
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub(crate) fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.config.read_timeout_ms)
    }

    pub(crate) fn boosting(&self) -> bool {
        self.inner.lock().boosting(self.config.noboost)
    }

    pub(crate) fn chips_known(&self) -> bool {
        !self.inner.lock().chips.is_empty()
    }

    /// Sleeps in slices of the read timeout so a shutdown is noticed.
    /// Returns false if the device shut down meanwhile.
    pub(crate) fn pause_ms(&self, ms: u64) -> bool {
        let slice = self.config.read_timeout_ms.max(1);
        let mut left = ms;
        while left > 0 {
            if self.is_shutdown() {
                return false;
            }
            let chunk = left.min(slice);
            self.pacer.sleep_ms(chunk);
            left -= chunk;
        }
        !self.is_shutdown()
    }

    /// Frames and writes a command, then waits out the adapter's
    /// propagation delay. A failed write resets the device.
    pub(crate) fn send(&self, command: Command) -> bool {
        let frame = FrameCodec::frame(&command);
        trace!(port = self.port(), frame = %hex::encode(&frame), "TX");
        let ok = match self.transport.write(&frame) {
            Ok(written) if written == frame.len() => true,
            Ok(written) => {
                self.short_write(written, frame.len());
                false
            }
            Err(e) => {
                self.write_failed(&e);
                false
            }
        };
        self.pacer.sleep_us(u64::from(self.usb_prop_us()));
        ok
    }

    pub(crate) fn short_write(&self, written: usize, expected: usize) {
        let now = Timestamp::now();
        let mut inner = self.inner.lock();
        inner.counters.short_writes += 1;
        let quiet = inner
            .timers
            .last_write_error
            .is_none_or(|last| now.secs_since(last) > WRITE_ERROR_LOG_INTERVAL_SECS);
        if quiet {
            inner.timers.last_write_error = Some(now);
            warn!(port = self.port(), written, expected, "Short write");
        }
    }

    pub(crate) fn write_failed(&self, e: &TransportError) {
        let now = Timestamp::now();
        {
            let mut inner = self.inner.lock();
            let quiet = inner
                .timers
                .last_write_error
                .is_none_or(|last| now.secs_since(last) > WRITE_ERROR_LOG_INTERVAL_SECS);
            if quiet {
                inner.timers.last_write_error = Some(now);
                warn!(port = self.port(), error = %e, "Write failed, resetting");
            }
        }
        if !self.is_shutdown() {
            self.set_state(MiningState::Reset);
        }
    }

    /// Drains whatever the chips already sent.
    pub(crate) fn flush_buffer(&self) {
        let mut buf = [0u8; 512];
        let mut drained = 0;
        loop {
            match self.transport.read(&mut buf, Duration::from_millis(1)) {
                Ok(0) | Err(_) => break,
                Ok(n) => drained += n,
            }
            if self.is_shutdown() {
                break;
            }
        }
        if drained > 0 {
            debug!(port = self.port(), drained, "Flushed receive buffer");
        }
    }

    /// Forgets every task in flight.
    pub(crate) fn flush_work(&self) {
        self.flush_buffer();
        let mut inner = self.inner.lock();
        inner.slots.deactivate_all();
        inner.update_work = true;
    }

    /// Pulses the chain reset line with the host back at the boot baud rate.
    pub(crate) fn toggle_reset(&self) {
        let transport = self.transport.as_ref();
        let steps = [
            transport.set_baud_rate(INIT_BAUD),
            transport.purge(),
            transport.set_reset(false),
        ];
        for result in steps {
            if let Err(e) = result {
                warn!(port = self.port(), error = %e, "Reset line");
            }
        }
        self.pacer.sleep_ms(30);
        if let Err(e) = transport.set_reset(true) {
            warn!(port = self.port(), error = %e, "Reset line");
        }
        self.pacer.sleep_ms(1000);
        if let Err(e) = transport.set_reset(false) {
            warn!(port = self.port(), error = %e, "Reset line");
        }
        self.pacer.sleep_ms(200);
        self.inner.lock().timers.last_reset = Timestamp::now();
    }

    /// Counts an init attempt with the registry and applies its policy.
    pub(crate) fn prepare(&self) -> Result<()> {
        match self.registry.record_init(self.port()) {
            PrepareOutcome::Ready { attempt } => {
                debug!(port = self.port(), attempt, "Prepare");
                Ok(())
            }
            PrepareOutcome::Backoff(delay) => {
                let attempts = self.registry.init_count(self.port());
                warn!(port = self.port(), attempts, ?delay, "Repeated init, backing off");
                self.pause_ms(delay.as_millis() as u64);
                Ok(())
            }
            PrepareOutcome::Reopen => {
                warn!(port = self.port(), "Repeated init, reopening port");
                Err(Error::ReopenRequested(self.port().to_string()))
            }
            PrepareOutcome::Disable { attempts } => {
                error!(port = self.port(), attempts, "Too many init attempts, disabling");
                Err(Error::PortDisabled {
                    port: self.port().to_string(),
                    attempts,
                })
            }
        }
    }

    /// Chip count settled; the port is healthy again.
    pub(crate) fn clear_registry(&self) {
        self.registry.clear(self.port());
    }

    /// Selects the ticket for `diff` and tells the chips. Ring statistics
    /// start over, since nonces at the old mask no longer compare.
    pub(crate) fn set_ticket(&self, diff: f64, force: bool) {
        let entry = {
            let mut inner = self.inner.lock();
            self.select_ticket(&mut inner, diff, force)
        };
        if let Some(entry) = entry {
            self.announce_ticket(entry, diff, force);
        }
    }

    /// Ticket selection for callers already holding `inner`. The returned
    /// entry goes to [`Device::announce_ticket`] once the lock is released.
    pub(crate) fn select_ticket(
        &self,
        inner: &mut DeviceState,
        diff: f64,
        force: bool,
    ) -> Option<TicketEntry> {
        let chips_x_cores = inner.chips_x_cores(self.family.cores());
        let entry = inner.ticket.apply(diff, chips_x_cores, force);
        if entry.is_some() {
            inner.timers.last_ticket_attempt = Some(Timestamp::now());
        }
        entry
    }

    pub(crate) fn announce_ticket(&self, entry: TicketEntry, diff: f64, force: bool) {
        self.send(Command::ticket_mask(entry.mask));
        self.pause_ms(if force { 20 } else { 10 });
        warn!(
            port = self.port(),
            difficulty = entry.work_diff,
            mask = format_args!("{:#04x}", entry.mask),
            requested = diff,
            "Ticket set"
        );

        let now = Timestamp::now();
        self.hashrate.lock().wipe(now);
        self.jobs.lock().wipe(now);
        self.inner.lock().freq.computed = 0.0;
    }

    /// Difficulty accepted since the last call, as hashes.
    pub(crate) fn take_hashes(&self) -> u64 {
        let xhashes = std::mem::take(&mut self.inner.lock().counters.xhashes);
        xhashes.saturating_mul(0xffff_ffff)
    }
}
