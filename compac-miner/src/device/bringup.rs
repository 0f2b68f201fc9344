//! Control thread: drives the chain from reset to mining and back.
//!
//! The listener and nonce worker move the state forward on their own when
//! frames arrive; everything that has to happen on a timer or that writes
//! long command sequences happens here.

use super::{Device, FrequencyTarget, MiningState};
use crate::asic::bm1397::protocol::{Command, Task, register};
use crate::error::Result;
use crate::stats::Timestamp;
use crate::tracing::prelude::*;
use crate::transport::MINING_BAUD;

/// Chip count gives up this long after the reset.
const CHIP_COUNT_WINDOW_SECS: f64 = 5.0;

/// Broadcast register writes after addressing, with the pause after each.
const CLOCK_SETUP: [(u8, [u8; 4], u64); 4] = [
    (register::CLOCK_ORDER_CONTROL0, [0x00, 0x00, 0x00, 0x00], 10),
    (register::CLOCK_ORDER_CONTROL1, [0x00, 0x00, 0x00, 0x00], 100),
    (register::ORDERED_CLOCK_ENABLE, [0x00, 0x00, 0x00, 0x01], 50),
    (register::CORE_REGISTER_CONTROL, [0x80, 0x00, 0x80, 0x74], 100),
];

const PLL3_VALUE: [u8; 4] = [0xc0, 0x70, 0x01, 0x11];
const FAST_UART_VALUE: [u8; 4] = [0x06, 0x00, 0x00, 0x0f];

/// Baud divider for 1.5 Mbaud.
const MISC_CONTROL_VALUE: [u8; 4] = [0x00, 0x00, 0x61, 0x31];

impl Device {
    /// Runs control steps until shutdown. Returns the administrative
    /// condition that stopped the device, if any.
    pub(crate) fn run_control(&self) -> Result<()> {
        if let Err(e) = self.prepare() {
            self.set_state(MiningState::Shutdown);
            return Err(e);
        }
        while !self.is_shutdown() {
            if let Err(e) = self.control_step() {
                self.set_state(MiningState::Shutdown);
                return Err(e);
            }
        }
        debug!(port = self.port(), "Control exiting");
        Ok(())
    }

    /// One pass of the state machine.
    pub(crate) fn control_step(&self) -> Result<()> {
        let now = Timestamp::now();
        match self.state() {
            MiningState::Init => {
                self.init_step();
                return Ok(());
            }
            MiningState::ChipCount | MiningState::ChipCountXx => {
                let last_reset = self.inner.lock().timers.last_reset;
                if now.secs_since(last_reset) > CHIP_COUNT_WINDOW_SECS {
                    info!(port = self.port(), "No chips found");
                    self.set_state(MiningState::Reset);
                    return Ok(());
                }
                self.pause_ms(10);
            }
            MiningState::ChipCountOk => {
                self.pause_ms(50);
                if self.send_chain_init() {
                    self.state
                        .transition(MiningState::ChipCountOk, MiningState::OpenCore);
                }
                return Ok(());
            }
            MiningState::OpenCore => {
                self.open_core_step(now);
                return Ok(());
            }
            MiningState::OpenCoreOk => {
                self.start_mining(now);
                return Ok(());
            }
            MiningState::Reset => {
                self.reset_step()?;
                return Ok(());
            }
            MiningState::MiningDups => {
                self.state
                    .transition(MiningState::MiningDups, MiningState::Mining);
            }
            MiningState::Mining | MiningState::Shutdown => {}
        }

        let hashes = self.take_hashes();
        if hashes > 0 {
            self.work_source.hashes_done(hashes);
        }
        self.pause_ms(1);
        Ok(())
    }

    fn init_step(&self) {
        self.pause_ms(50);
        self.flush_buffer();
        {
            let mut inner = self.inner.lock();
            inner.chips.clear();
            inner.nonce_map = None;
            inner.ramping = 0;
            if inner.freq.start > inner.freq.requested {
                inner.freq.start = inner.freq.requested;
            }
        }
        self.hashrate.lock().set_chip_count(0);
        self.state.transition(MiningState::Init, MiningState::ChipCount);
    }

    /// Sends the chain setup that follows a chip count: addressing, clock
    /// and core setup, ticket, baud switch and the start frequency. Returns
    /// false if a reset or shutdown interrupted it.
    pub(crate) fn send_chain_init(&self) -> bool {
        for _ in 0..3 {
            if !self.init_command(Command::ChainInactive, 100) {
                return false;
            }
        }

        let chips = self.inner.lock().chips.len();
        for chip in 0..chips {
            let chip_address = self.family.chip_address(chip, chips);
            if !self.init_command(Command::SetChipAddress { chip_address }, 10) {
                return false;
            }
        }

        for (register, value, pause) in CLOCK_SETUP {
            if !self.init_command(Command::write_all(register, value), pause) {
                return false;
            }
        }

        self.set_ticket(0.0, true);

        for _ in 0..2 {
            if !self.init_command(Command::write_all(register::PLL3_PARAMETER, PLL3_VALUE), 50) {
                return false;
            }
        }
        if !self.init_command(
            Command::write_all(register::FAST_UART_CONFIGURATION, FAST_UART_VALUE),
            100,
        ) {
            return false;
        }
        if !self.init_command(
            Command::write_all(register::MISC_CONTROL, MISC_CONTROL_VALUE),
            10,
        ) {
            return false;
        }

        if let Err(e) = self.transport().set_baud_rate(MINING_BAUD) {
            warn!(port = self.port(), error = %e, "Baud switch failed, resetting");
            self.set_state(MiningState::Reset);
            return false;
        }
        self.pause_ms(10);

        let frequency = self.inner.lock().freq.current;
        self.calc_freq(frequency, FrequencyTarget::All);
        self.pause_ms(20);
        info!(port = self.port(), chips, frequency, "Chain initialized");
        self.state() == MiningState::ChipCountOk
    }

    fn init_command(&self, command: Command, pause_ms: u64) -> bool {
        self.send(command) && self.pause_ms(pause_ms)
    }

    /// Feeds idle tasks so every core has a job before real work arrives.
    fn open_core_step(&self, now: Timestamp) {
        let (task, done) = {
            let mut inner = self.inner.lock();
            let ids = self.family.job_ids();
            let job_id = (inner.ramping % (u32::from(ids.max) + 1)) as u8;
            inner.slots.set_current(job_id);
            let task = Task::idle(job_id, 1, self.family.task_len(1));
            let done = inner.ramping > self.family.cores() * u32::from(ids.step);
            if !done {
                inner.ramping += u32::from(ids.step);
                let since = now.millis_since(inner.timers.last_task);
                inner.loop_stats.task_ms = (inner.loop_stats.task_ms * 9.0 + since) / 10.0;
                inner.timers.last_task = now;
            }
            (task, done)
        };

        self.send(Command::Task(task));
        if done {
            self.state
                .transition(MiningState::OpenCore, MiningState::OpenCoreOk);
        } else {
            self.pause_ms(10);
        }
    }

    fn start_mining(&self, now: Timestamp) {
        info!(port = self.port(), "Start work");
        {
            let mut inner = self.inner.lock();
            let chips = inner.chips.len();
            inner.nonce_map = self.family.nonce_byte_map(chips);
            inner.timers.start_time = now;
            inner.timers.monitor = now;
            inner.timers.last_dup = None;
            inner.timers.last_nonce = now;
            inner.freq.last_adjust = Some(now);
        }
        self.flush_buffer();
        self.update_rates();
        self.inner.lock().update_work = true;
        self.state
            .transition(MiningState::OpenCoreOk, MiningState::Mining);
    }

    fn reset_step(&self) -> Result<()> {
        warn!(port = self.port(), "Resetting");
        self.flush_work();
        self.nonces.clear();
        self.toggle_reset();
        self.prepare()?;

        let now = Timestamp::now();
        {
            let mut inner = self.inner.lock();
            inner.counters.fail_count += 1;
            inner.counters.dups_reset = 0;
            inner.timers.last_reset = now;
            inner.freq.tune_limit = now;
            inner.freq.computed = 0.0;
        }
        self.hashrate.lock().wipe(now);
        self.jobs.lock().wipe(now);
        self.state.transition(MiningState::Reset, MiningState::Init);
        Ok(())
    }

    /// Stops the chip clocks and holds the chain in reset.
    pub(crate) fn power_down(&self) {
        info!(port = self.port(), "Shutting down");
        self.calc_freq(0.0, FrequencyTarget::All);
        self.toggle_reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{fixture, with_chips};
    use crate::error::Error;
    use crate::transport::INIT_BAUD;

    #[test]
    fn should_give_up_chip_count_after_window() {
        let f = fixture();
        f.device.set_state(MiningState::ChipCount);
        f.device.inner.lock().timers.last_reset = Timestamp::now().add_millis(-6_000);

        f.device.control_step().expect("step");

        assert_eq!(f.device.state(), MiningState::Reset);
    }

    #[test]
    fn should_wait_for_chips_within_window() {
        let f = fixture();
        f.device.set_state(MiningState::ChipCount);
        f.device.control_step().expect("step");
        assert_eq!(f.device.state(), MiningState::ChipCount);
    }

    #[test]
    fn should_return_to_init_after_reset() {
        let f = fixture();
        with_chips(&f.device, 1);
        f.device.set_state(MiningState::Reset);

        f.device.control_step().expect("step");

        assert_eq!(f.device.state(), MiningState::Init);
        assert_eq!(f.device.inner.lock().counters.fail_count, 1);
        assert_eq!(f.transport.resets(), vec![false, true, false]);
        assert_eq!(f.transport.bauds(), vec![INIT_BAUD]);
        assert_eq!(f.registry.init_count("ttyTEST0"), 1);
    }

    #[test]
    fn should_surface_port_disable_from_reset() {
        let f = fixture();
        for _ in 0..11 {
            f.registry.record_init("ttyTEST0");
        }
        f.device.set_state(MiningState::Reset);
        assert!(matches!(
            f.device.control_step(),
            Err(Error::PortDisabled { attempts: 12, .. })
        ));
    }

    #[test]
    fn should_clear_chips_on_init() {
        let f = fixture();
        with_chips(&f.device, 2);
        f.device.control_step().expect("step");
        assert_eq!(f.device.state(), MiningState::ChipCount);
        assert!(!f.device.chips_known());
    }

    #[test]
    fn should_send_chain_init_sequence() {
        let f = fixture();
        with_chips(&f.device, 1);
        f.device.set_state(MiningState::ChipCountOk);

        f.device.control_step().expect("step");

        assert_eq!(f.device.state(), MiningState::OpenCore);
        let written = f.transport.written();
        let inactive = [0x55, 0xaa, 0x53, 0x05, 0x00, 0x00, 0x03];
        assert!(written[..3].iter().all(|frame| frame[..] == inactive));
        assert_eq!(written[3][..5], [0x55, 0xaa, 0x40, 0x05, 0x00]);
        // Clock setup, ticket mask, PLL3 twice, UART, baud.
        let registers: Vec<u8> = written[4..13].iter().map(|frame| frame[5]).collect();
        assert_eq!(
            registers,
            [0x80, 0x84, 0x20, 0x3c, 0x14, 0x68, 0x68, 0x28, 0x18]
        );
        assert_eq!(f.transport.bauds(), vec![MINING_BAUD]);
        // Divider and PLL writes, then the read-back request.
        assert_eq!(
            written.last().expect("frames")[..],
            [0x55, 0xaa, 0x52, 0x05, 0x00, 0x08, 0x07]
        );
        assert_eq!(f.device.inner.lock().ticket.difficulty, 16);
    }

    #[test]
    fn should_finish_core_warmup() {
        let f = fixture();
        with_chips(&f.device, 1);
        f.device.set_state(MiningState::OpenCore);

        f.device.control_step().expect("step");
        assert_eq!(f.device.state(), MiningState::OpenCore);
        assert_eq!(f.device.inner.lock().ramping, 4);

        f.device.inner.lock().ramping = 672 * 4 + 1;
        f.device.control_step().expect("step");
        assert_eq!(f.device.state(), MiningState::OpenCoreOk);
        let written = f.transport.written();
        let task = written.last().expect("task");
        assert_eq!(task[2], 0x21);
        assert!(task[10..22].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn should_start_mining_with_nonce_map() {
        let f = fixture();
        with_chips(&f.device, 1);
        f.device.set_state(MiningState::OpenCoreOk);

        f.device.control_step().expect("step");

        assert_eq!(f.device.state(), MiningState::Mining);
        let inner = f.device.inner.lock();
        assert!(inner.nonce_map.is_some());
        assert!(inner.update_work);
        assert!(inner.rates.max_task_wait_us > 0);
    }

    #[test]
    fn should_clear_duplicate_marker_and_report_hashes() {
        let f = fixture();
        f.device.set_state(MiningState::MiningDups);
        f.device.inner.lock().counters.xhashes = 2;

        f.device.control_step().expect("step");

        assert_eq!(f.device.state(), MiningState::Mining);
        assert_eq!(*f.source.hashes.lock(), 2 * 0xffff_ffff);
    }
}
