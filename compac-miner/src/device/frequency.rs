//! Frequency control: PLL programming, ramp-up, tuning and plateau
//! detection.

use std::time::Duration;

use serde::Serialize;

use super::chip::{ChipHealth, ChipRecord};
use super::{Device, MiningState};
use crate::asic::bm1397::ceil_steps;
use crate::asic::bm1397::protocol::{Command, register};
use crate::asic::{ChipFamily, PllDividers, PllPlan};
use crate::config::DriverConfig;
use crate::stats::Timestamp;
use crate::tracing::prelude::*;

/// Frequency assumed when a request cannot be programmed.
pub const FALLBACK_FREQ: f32 = 200.0;

/// Frequencies are kept on multiples of this (MHz).
pub const FREQ_BASE: f32 = 5.0;

/// Lowest frequency tuning will back off to (MHz).
pub const MIN_FREQ: f32 = 25.0;

pub const RAMP_TIME: Duration = Duration::from_secs(5 * 60);
pub const PLATEAU_INTERVAL: Duration = Duration::from_secs(5);
pub const TUNE_INTERVAL: Duration = Duration::from_secs(2 * 60);
pub const RAMP_INTERVAL: Duration = Duration::from_secs(1);

/// A plateau older than this since the last frequency change is not held
/// against the frequency.
const PLATEAU_GRACE: Duration = Duration::from_secs(30 * 60);

/// Plateaus that feed the failure high-water mark.
const PLATEAU_CAPTURE: u32 = 3;

/// Unanswered frequency sets tolerated before a chip counts as stuck.
const MAX_FREQUENCY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyTarget {
    All,
    Chip(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlateauKind {
    /// The lead chip went quiet for far longer than expected.
    NoNonce,
    /// Frequency sets keep going unanswered.
    FrequencySet,
    /// The chip never answered a frequency set.
    NoFrequencyReply,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plateau {
    pub kind: PlateauKind,
    pub chip: usize,
    pub reset: bool,
    pub requested: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TuneDecision {
    Hold,
    /// Hashrate too low for the frequency: restart from this frequency.
    LowHashrate { restart_at: f32 },
    StepUp(f32),
}

#[derive(Debug, Clone, Serialize)]
pub struct FrequencyState {
    /// Frequency the chain runs at (MHz).
    pub current: f32,
    /// Target the ramp heads for.
    pub requested: f32,
    /// Ceiling tuning may climb back to.
    pub selected: f32,
    pub start: f32,
    pub default: f32,
    /// Lower bound estimated from the measured hashrate.
    pub computed: f32,
    /// Request that could not be programmed; not retried.
    pub fail: Option<f32>,
    /// Highest frequency seen failing in the first plateaus.
    pub fail_high: f32,
    /// Disables ramping, tuning and set-failure plateaus.
    pub lock: bool,
    pub step: f32,
    pub min: f32,
    pub base: f32,
    pub band: (f32, f32),
    pub ghrequire: f32,
    pub plateau_reset: u32,
    pub last_adjust: Option<Timestamp>,
    pub last_computed_increase: Option<Timestamp>,
    pub tune_limit: Timestamp,
    pub last_tune_up: Timestamp,
}

impl FrequencyState {
    /// Frequency plan for a freshly opened device.
    pub fn new(config: &DriverConfig, family: &dyn ChipFamily) -> Self {
        let mut state = Self {
            current: 0.0,
            requested: 0.0,
            selected: 0.0,
            start: 0.0,
            default: 0.0,
            computed: 0.0,
            fail: None,
            fail_high: 0.0,
            lock: false,
            step: 0.0,
            min: MIN_FREQ,
            base: FREQ_BASE,
            band: family.frequency_band(),
            ghrequire: config.ghrequire,
            plateau_reset: 0,
            last_adjust: None,
            last_computed_increase: None,
            tune_limit: Timestamp::default(),
            last_tune_up: Timestamp::default(),
        };

        let requested = state.limit(config.target_freq(), false);
        let mut start = state.limit(config.start_freq, false).max(state.band.0);
        if start == state.band.0 {
            start = config.ident.default_start_freq();
        }
        let requested = requested.max(start);
        let start = start.min(requested);

        state.requested = state.round(requested);
        state.selected = state.requested;
        state.start = state.round(start);
        state.current = state.start;
        state.default = state.start;
        // The old 6.25 MHz default step maps onto the base.
        let step = if config.step_freq == 6.25 {
            state.base
        } else {
            config.step_freq
        };
        state.step = state.round(step);
        state
    }

    /// Rounds up to the next multiple of the base.
    pub fn round(&self, frequency: f32) -> f32 {
        self.base * ceil_steps(f64::from(frequency / self.base)) as f32
    }

    /// Clamps into the chip band. Zero passes through when `zero` is set, to
    /// allow powering down.
    pub fn limit(&self, frequency: f32, zero: bool) -> f32 {
        if zero && frequency == 0.0 {
            0.0
        } else {
            frequency.clamp(self.band.0, self.band.1)
        }
    }

    /// Next ramp frequency, if the ramp should move.
    pub fn ramp_step(&self, nonces: u64, min_nonces: u64) -> Option<f32> {
        (self.current < self.requested && nonces > min_nonces)
            .then(|| (self.current + self.step).min(self.requested))
    }

    /// Raises the computed-frequency estimate from a measured hashrate.
    pub fn update_computed(&mut self, mhs: f64, cores: u32, chips: usize, now: Timestamp) -> bool {
        if chips == 0 || cores == 0 {
            return false;
        }
        let computed = self.limit((mhs / f64::from(cores) / chips as f64) as f32, true);
        if computed > self.computed && computed <= self.current {
            self.computed = computed;
            self.last_computed_increase = Some(now);
            return true;
        }
        false
    }

    /// Steady-state tuning against the measured hashrate.
    ///
    /// `mhs` must come from a settled hashrate ring.
    pub fn tune(
        &mut self,
        mhs: f64,
        nominal_mhs: f64,
        tune_minutes: u32,
        last_reset: Timestamp,
        now: Timestamp,
    ) -> TuneDecision {
        if mhs < nominal_mhs * f64::from(self.ghrequire) {
            let mut lower = self.round(self.current - self.base * 2.0);
            if lower < self.min {
                lower = self.round(self.min);
            }
            self.requested = self.requested.min(lower);
            self.start = self.start.min(lower);
            return TuneDecision::LowHashrate {
                restart_at: self.start,
            };
        }

        self.tune_limit = now;
        let window = f64::from(tune_minutes) * 60.0;
        if tune_minutes == 0
            || self.requested >= self.selected
            || now.secs_since(last_reset) < window
            || now.secs_since(self.last_tune_up) < window
        {
            return TuneDecision::Hold;
        }

        self.last_tune_up = now;
        let higher = self.round(self.current + self.base);
        if higher <= self.selected {
            self.requested = self.requested.max(higher);
            TuneDecision::StepUp(higher)
        } else {
            TuneDecision::Hold
        }
    }

    /// Looks for a chip that stopped tracking its frequency.
    ///
    /// Only the lead chip is checked for missing nonces, since nonces are
    /// counted for the chain as a whole. The first plateau found is acted
    /// on and the rest of the chain is not checked.
    pub fn detect_plateau(
        &mut self,
        chips: &mut [ChipRecord],
        family: &dyn ChipFamily,
        nonce_limit_ms: f64,
        last_nonce: Timestamp,
        now: Timestamp,
    ) -> Option<Plateau> {
        let has_freq = chips.iter().any(|chip| chip.frequency != 0.0);

        for (i, chip) in chips.iter_mut().enumerate() {
            let mut kind = None;

            if has_freq
                && i == 0
                && nonce_limit_ms > 0.0
                && now.millis_since(last_nonce) > nonce_limit_ms
            {
                kind = Some(PlateauKind::NoNonce);
                error!(
                    chip = i,
                    quiet_ms = now.millis_since(last_nonce),
                    limit_ms = nonce_limit_ms,
                    lock = self.lock,
                    "Nonces missing"
                );
                self.lock = false;
            }

            if !self.lock && chip.frequency_attempts > MAX_FREQUENCY_ATTEMPTS {
                kind = Some(PlateauKind::FrequencySet);
            }

            if family.expects_frequency_reply()
                && !self.lock
                && chip.awaiting_reply
                && chip
                    .last_frequency_set
                    .is_some_and(|set| now.secs_since(set) > PLATEAU_INTERVAL.as_secs_f64())
            {
                kind = Some(PlateauKind::NoFrequencyReply);
            }

            let Some(kind) = kind else { continue };

            let mut requested = self.requested;
            if self.plateau_reset < PLATEAU_CAPTURE {
                self.fail_high = self.fail_high.max(self.current - self.base);
                warn!(
                    chip = i,
                    plateau = self.plateau_reset + 1,
                    fail_high = self.fail_high,
                    "Chip plateau"
                );
            }
            if self.plateau_reset >= 2 {
                let recent = self
                    .last_adjust
                    .is_some_and(|adjust| now.secs_since(adjust) <= PLATEAU_GRACE.as_secs_f64());
                if recent {
                    self.fail_high -= self.base;
                }
                requested = self.limit(self.round(self.fail_high), true);
            }
            self.plateau_reset += 1;
            chip.set_health(ChipHealth::HalfDead, now);
            if kind != PlateauKind::NoNonce {
                chip.frequency_attempts = 0;
            }

            let reset = kind == PlateauKind::NoNonce || family.resets_on_any_plateau();
            if requested != self.requested {
                warn!(
                    ?kind,
                    chip = i,
                    reset,
                    from = self.requested,
                    to = requested,
                    "Plateau, adjusting target frequency"
                );
                self.requested = requested;
            } else if reset {
                warn!(?kind, chip = i, frequency = self.requested, "Plateau, resetting");
            }

            return Some(Plateau {
                kind,
                chip: i,
                reset,
                requested: self.requested,
            });
        }
        None
    }
}

impl Device {
    /// Programs the PLL of every chip, or of one.
    ///
    /// Sends the divider write and then the PLL write, twice each, and
    /// finally asks every chip to read back its PLL so replies can be
    /// matched to the set.
    pub fn calc_freq(&self, frequency: f32, target: FrequencyTarget) {
        let now = Timestamp::now();
        let (address, dividers, actual) = {
            let mut inner = self.inner.lock();
            let chips = inner.chips.len();

            // Power down always goes to every chip.
            let target = if frequency == 0.0 {
                FrequencyTarget::All
            } else {
                target
            };
            if let FrequencyTarget::Chip(chip) = target {
                if chip >= chips {
                    error!(chip, frequency, "Invalid chip for frequency set");
                    return;
                }
            }
            if frequency != 0.0 && inner.freq.fail == Some(frequency) {
                return;
            }

            let (dividers, actual) = match self.family.pll_plan(inner.freq.limit(frequency, true)) {
                PllPlan::PowerDown => (PllDividers::POWER_DOWN, 0.0),
                PllPlan::Set { dividers, actual } => (dividers, actual),
                PllPlan::OutOfRange => {
                    inner.freq.fail = Some(frequency);
                    warn!(
                        frequency,
                        reported = FALLBACK_FREQ,
                        "No PLL settings for frequency"
                    );
                    return;
                }
            };

            let address = match target {
                FrequencyTarget::All => {
                    for chip in inner.chips.iter_mut() {
                        chip.frequency_sent(frequency, now);
                    }
                    inner.freq.current = frequency;
                    None
                }
                FrequencyTarget::Chip(chip) => {
                    inner.chips[chip].frequency_sent(frequency, now);
                    Some(self.family.chip_address(chip, chips))
                }
            };
            (address, dividers, actual)
        };

        for _ in 0..2 {
            self.pause_ms(10);
            self.send(Command::pll_divider(address));
        }
        for _ in 0..2 {
            self.pause_ms(10);
            self.send(Command::pll(address, dividers));
        }
        self.pause_ms(10);

        match address {
            None => warn!(
                chip = "all",
                frequency,
                actual,
                fb_div = dividers.fb_div,
                ref_div = dividers.ref_div,
                post_div1 = dividers.post_div1,
                post_div2 = dividers.post_div2,
                "Setting frequency"
            ),
            Some(address) => warn!(
                chip = address,
                frequency,
                actual,
                fb_div = dividers.fb_div,
                ref_div = dividers.ref_div,
                post_div1 = dividers.post_div1,
                post_div2 = dividers.post_div2,
                "Setting frequency"
            ),
        }

        self.send(Command::read_all(register::PLL0_PARAMETER));
    }

    /// Sets every chip and restarts rate bookkeeping at the new frequency.
    pub fn set_frequency(&self, frequency: f32) {
        self.calc_freq(frequency, FrequencyTarget::All);
        self.update_rates();

        let now = Timestamp::now();
        self.hashrate.lock().wipe(now);
        self.inner.lock().freq.computed = 0.0;
    }

    /// Moves the whole chain to `frequency`, stamping the change on every
    /// chip.
    pub fn change_freq_any(&self, frequency: f32) {
        let now = Timestamp::now();
        let previous = {
            let mut inner = self.inner.lock();
            inner.freq.last_adjust = Some(now);
            inner.timers.monitor = now;
            for chip in inner.chips.iter_mut() {
                chip.last_frequency_adjust = Some(now);
                chip.frequency_updated = true;
            }
            inner.freq.current
        };
        if !self.chips_known() {
            return;
        }
        self.set_frequency(frequency);
        warn!(from = previous, to = frequency, "New frequency");
    }

    /// Matches a PLL read-back to its chip. Returns whether the frame was a
    /// valid frequency reply.
    pub(crate) fn frequency_reply(&self, address: u8, dividers: PllDividers, now: Timestamp) -> bool {
        let mut inner = self.inner.lock();
        let chips = inner.chips.len();
        let chip = self.family.chip_index(address, chips);
        let Some(record) = inner.chips.get_mut(chip) else {
            return false;
        };
        let frequency = dividers.frequency(self.family.freq_multiplier());
        record.frequency_replied(frequency, now);
        trace!(chip, frequency, "Frequency reply");
        true
    }

    /// Plateau check, ramp and tuning, run from the mining loop.
    pub(crate) fn supervise_frequency(&self, now: Timestamp, clock: &mut SupervisorClock) -> bool {
        let mut plateau = None;

        if now.secs_since(clock.last_plateau_check) > PLATEAU_INTERVAL.as_secs_f64() {
            clock.last_plateau_check = now;
            let mut inner = self.inner.lock();
            let nonce_limit = inner.rates.nonce_limit_ms;
            let last_nonce = inner.timers.last_nonce;
            let inner = &mut *inner;
            plateau = inner.freq.detect_plateau(
                &mut inner.chips,
                self.family,
                nonce_limit,
                last_nonce,
                now,
            );
            if plateau.is_some() {
                inner.timers.monitor = now;
            }
        }

        if plateau.is_some_and(|plateau| plateau.reset) {
            self.set_state(MiningState::Reset);
        }

        let (lock, last_reset, current, requested) = {
            let inner = self.inner.lock();
            (
                inner.freq.lock,
                inner.timers.last_reset,
                inner.freq.current,
                inner.freq.requested,
            )
        };

        let mut updated = false;
        if !lock && now.secs_since(last_reset) < RAMP_TIME.as_secs_f64() {
            if plateau.is_none()
                && now.secs_since(clock.last_movement) > RAMP_INTERVAL.as_secs_f64()
                && current < requested
            {
                let nonces = self.hashrate.lock().nonces();
                let step = self
                    .inner
                    .lock()
                    .freq
                    .ramp_step(nonces, crate::stats::hashrate::RATE_MIN_NONCES);
                if let Some(frequency) = step {
                    self.change_freq_any(frequency);
                    clock.last_movement = now;
                    updated = true;
                }
            }
        } else {
            updated = self.tune_frequency(now);
        }
        updated
    }

    fn tune_frequency(&self, now: Timestamp) -> bool {
        let (lock, tune_limit) = {
            let inner = self.inner.lock();
            (inner.freq.lock, inner.freq.tune_limit)
        };
        if lock || now.secs_since(tune_limit) < TUNE_INTERVAL.as_secs_f64() {
            return false;
        }

        let (mhs, settled) = {
            let mut hashrate = self.hashrate.lock();
            let mhs = hashrate.rate_mhs(now);
            (mhs, hashrate.is_settled())
        };
        if !settled {
            return false;
        }

        let decision = {
            let mut inner = self.inner.lock();
            let nominal =
                f64::from(inner.freq.current) * f64::from(self.family.cores()) * inner.chips.len() as f64;
            let last_reset = inner.timers.last_reset;
            let previous = inner.freq.current;
            let decision = inner
                .freq
                .tune(mhs, nominal, self.config.tune2, last_reset, now);
            match decision {
                TuneDecision::LowHashrate { restart_at } => warn!(
                    ghs = mhs / 1e3,
                    nominal_ghs = nominal / 1e3,
                    required_ghs = nominal * f64::from(inner.freq.ghrequire) / 1e3,
                    from = previous,
                    to = restart_at,
                    "Hashrate low, resetting"
                ),
                TuneDecision::StepUp(to) => {
                    warn!(ghs = mhs / 1e3, from = previous, to, "Tune up attempt")
                }
                TuneDecision::Hold => {}
            }
            decision
        };

        match decision {
            TuneDecision::LowHashrate { restart_at } => {
                self.change_freq_any(restart_at);
                self.set_state(MiningState::Reset);
                true
            }
            TuneDecision::StepUp(frequency) => {
                self.change_freq_any(frequency);
                true
            }
            TuneDecision::Hold => false,
        }
    }
}

/// Timers owned by the mining loop for its periodic checks.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorClock {
    pub last_plateau_check: Timestamp,
    pub last_movement: Timestamp,
    pub last_rolling: Timestamp,
    pub last_frequency_check: Timestamp,
}

impl SupervisorClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            last_plateau_check: now,
            last_movement: Timestamp::default(),
            last_rolling: Timestamp::default(),
            last_frequency_check: Timestamp::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asic::Bm1397;
    use crate::config::BoardIdent;
    use test_case::test_case;

    fn state(config: DriverConfig) -> FrequencyState {
        FrequencyState::new(&config.normalized(), &Bm1397)
    }

    #[test]
    fn should_plan_gsf_defaults() {
        let freq = state(DriverConfig::default());
        assert_eq!(freq.requested, 200.0);
        assert_eq!(freq.selected, 200.0);
        assert_eq!(freq.start, 200.0);
        assert_eq!(freq.current, 200.0);
        assert_eq!(freq.step, 5.0);
    }

    #[test]
    fn should_plan_gsfm_defaults() {
        let freq = state(DriverConfig {
            ident: BoardIdent::Gsfm,
            ..Default::default()
        });
        assert_eq!(freq.requested, 450.0);
        assert_eq!(freq.start, 400.0);
    }

    #[test]
    fn should_raise_target_to_start() {
        let freq = state(DriverConfig {
            gsf_freq: 300.0,
            start_freq: 350.0,
            ..Default::default()
        });
        assert_eq!(freq.start, 350.0);
        assert_eq!(freq.requested, 350.0);
        assert_eq!(freq.selected, 350.0);
    }

    #[test]
    fn should_round_odd_targets_up() {
        let freq = state(DriverConfig {
            gsf_freq: 251.0,
            start_freq: 101.0,
            ..Default::default()
        });
        assert_eq!(freq.requested, 255.0);
        assert_eq!(freq.start, 105.0);
    }

    #[test_case(0.0, true, 0.0; "power down allowed")]
    #[test_case(0.0, false, 100.0; "power down clamped")]
    #[test_case(50.0, true, 100.0; "below band")]
    #[test_case(1200.0, true, 800.0; "above band")]
    fn should_limit_to_band(given: f32, zero: bool, expected: f32) {
        assert_eq!(state(DriverConfig::default()).limit(given, zero), expected);
    }

    #[test]
    fn should_ramp_towards_target_without_overshoot() {
        let mut freq = state(DriverConfig::default());
        freq.current = 195.0;
        assert_eq!(freq.ramp_step(10, 58), None);
        assert_eq!(freq.ramp_step(59, 58), Some(200.0));
        freq.current = 200.0;
        assert_eq!(freq.ramp_step(59, 58), None);
    }

    #[test]
    fn should_back_off_when_hashrate_low() {
        let mut freq = state(DriverConfig::default());
        let now = Timestamp::from_secs(10_000);
        let decision = freq.tune(50_000.0, 134_400.0, 0, Timestamp::from_secs(0), now);
        assert_eq!(decision, TuneDecision::LowHashrate { restart_at: 190.0 });
        assert_eq!(freq.requested, 190.0);
        assert_eq!(freq.start, 190.0);
    }

    #[test]
    fn should_step_up_after_tune_window() {
        let mut freq = state(DriverConfig::default());
        freq.requested = 190.0;
        freq.current = 190.0;
        let now = Timestamp::from_secs(10_000);
        let decision = freq.tune(134_400.0, 134_400.0, 30, Timestamp::from_secs(0), now);
        assert_eq!(decision, TuneDecision::StepUp(195.0));
        assert_eq!(freq.requested, 195.0);
        assert_eq!(freq.last_tune_up, now);

        // Cooldown applies from the last attempt.
        let soon = Timestamp::from_secs(10_060);
        assert_eq!(
            freq.tune(134_400.0, 134_400.0, 30, Timestamp::from_secs(0), soon),
            TuneDecision::Hold
        );
    }

    #[test]
    fn should_hold_when_tuning_disabled() {
        let mut freq = state(DriverConfig::default());
        freq.requested = 190.0;
        let now = Timestamp::from_secs(10_000);
        assert_eq!(
            freq.tune(134_400.0, 134_400.0, 0, Timestamp::from_secs(0), now),
            TuneDecision::Hold
        );
        assert_eq!(freq.tune_limit, now);
    }

    fn chips(n: usize, now: Timestamp) -> Vec<ChipRecord> {
        (0..n).map(|_| ChipRecord::new(200.0, now)).collect()
    }

    #[test]
    fn should_reset_when_lead_chip_goes_quiet() {
        let mut freq = state(DriverConfig::default());
        freq.lock = true;
        let start = Timestamp::from_secs(1000);
        let mut chips = chips(2, start);
        let now = start.add_millis(5_000);

        let plateau = freq
            .detect_plateau(&mut chips, &Bm1397, 1_000.0, start, now)
            .expect("plateau");
        assert_eq!(plateau.kind, PlateauKind::NoNonce);
        assert_eq!(plateau.chip, 0);
        assert!(plateau.reset);
        assert!(!freq.lock);
        assert_eq!(chips[0].health, ChipHealth::HalfDead);
        assert_eq!(freq.fail_high, 195.0);
        assert_eq!(freq.plateau_reset, 1);
    }

    #[test]
    fn should_ignore_quiet_chain_without_limit() {
        let mut freq = state(DriverConfig::default());
        let start = Timestamp::from_secs(1000);
        let mut chips = chips(1, start);
        let now = start.add_millis(60_000);
        assert!(freq.detect_plateau(&mut chips, &Bm1397, 0.0, start, now).is_none());
    }

    #[test]
    fn should_flag_unanswered_frequency_sets() {
        let mut freq = state(DriverConfig::default());
        let now = Timestamp::from_secs(1000);
        let mut chips = chips(3, now);
        chips[1].frequency_attempts = 4;

        let plateau = freq
            .detect_plateau(&mut chips, &Bm1397, 0.0, now, now)
            .expect("plateau");
        assert_eq!(plateau.kind, PlateauKind::FrequencySet);
        assert_eq!(plateau.chip, 1);
        assert!(plateau.reset);
        assert_eq!(chips[1].frequency_attempts, 0);
    }

    #[test]
    fn should_step_back_from_failure_high_after_repeated_plateaus() {
        let mut freq = state(DriverConfig::default());
        let now = Timestamp::from_secs(100_000);
        freq.plateau_reset = 2;
        freq.fail_high = 250.0;
        freq.current = 240.0;
        freq.requested = 260.0;
        freq.last_adjust = Some(now.add_millis(-60_000));
        let mut chips = chips(1, now);
        chips[0].frequency_attempts = 4;

        let plateau = freq
            .detect_plateau(&mut chips, &Bm1397, 0.0, now, now)
            .expect("plateau");
        assert_eq!(freq.fail_high, 245.0);
        assert_eq!(plateau.requested, 245.0);
        assert_eq!(freq.requested, 245.0);
        assert_eq!(freq.plateau_reset, 3);
    }

    #[test]
    fn should_overlook_plateau_long_after_adjust() {
        let mut freq = state(DriverConfig::default());
        let now = Timestamp::from_secs(100_000);
        freq.plateau_reset = 3;
        freq.fail_high = 250.0;
        freq.last_adjust = Some(now.add_millis(-31 * 60_000));
        let mut chips = chips(1, now);
        chips[0].frequency_attempts = 4;

        let plateau = freq
            .detect_plateau(&mut chips, &Bm1397, 0.0, now, now)
            .expect("plateau");
        assert_eq!(freq.fail_high, 250.0);
        assert_eq!(plateau.requested, 250.0);
    }

    #[test]
    fn should_raise_computed_estimate_only_up_to_current() {
        let mut freq = state(DriverConfig::default());
        let now = Timestamp::from_secs(1000);
        assert!(freq.update_computed(150.0 * 672.0, 672, 1, now));
        assert_eq!(freq.computed, 150.0);
        assert!(!freq.update_computed(140.0 * 672.0, 672, 1, now));
        assert!(!freq.update_computed(250.0 * 672.0, 672, 1, now));
        assert_eq!(freq.computed, 150.0);
    }
}
