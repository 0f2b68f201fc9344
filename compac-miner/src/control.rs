//! Runtime tunables.
//!
//! An option name and an optional setting string come in from whatever
//! management surface the host runs, and are parsed into a
//! [`ControlCommand`] and applied to a running [`Device`]. Numeric settings
//! are read leniently: the leading number is used and anything unparsable
//! counts as zero. Out-of-range values are clamped, never rejected.

use crate::config::{GHREQUIRE_RANGE, USB_PROP_RANGE, WAIT_FACTOR_RANGE};
use crate::device::{Device, FrequencyTarget, MiningState};
use crate::tracing::prelude::*;

/// Reply to the `help` option.
pub const HELP: &str = "reset freq: 0-1200 chip: N:0-800 target: 0-1200 lockfreq unlockfreq \
                        waitfactor: 0.01-2.0 usbprop: 200-1000 require: 0.0-0.8";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlError {
    #[error("missing freq")]
    MissingFreq,

    #[error("missing chip:freq")]
    MissingChipFreq,

    #[error("not chip:freq")]
    NotChipFreq,

    #[error("invalid chip {0}")]
    InvalidChip(i64),

    #[error("missing value")]
    MissingValue,

    #[error("missing usec")]
    MissingUsec,

    #[error("Unknown option: {0}")]
    UnknownOption(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    Help,
    Reset,
    /// Move every chip to this frequency.
    Freq(f32),
    Chip { chip: i64, freq: f32 },
    /// New ramp and tuning target.
    Target(f32),
    LockFreq,
    UnlockFreq,
    WaitFactor(f32),
    UsbProp(i64),
    Require(f32),
}

impl ControlCommand {
    /// Parses an option and its setting. Option names are case-insensitive.
    pub fn parse(option: &str, setting: Option<&str>) -> Result<Self, ControlError> {
        let setting = setting.filter(|s| !s.is_empty());
        let option_lc = option.to_ascii_lowercase();
        let command = match option_lc.as_str() {
            "help" => ControlCommand::Help,
            "reset" => ControlCommand::Reset,
            "freq" => {
                let setting = setting.ok_or(ControlError::MissingFreq)?;
                ControlCommand::Freq(leading_float(setting) as f32)
            }
            "chip" => {
                let setting = setting.ok_or(ControlError::MissingChipFreq)?;
                let (chip, freq) = setting.split_once(':').ok_or(ControlError::NotChipFreq)?;
                if chip.is_empty() || freq.is_empty() {
                    return Err(ControlError::NotChipFreq);
                }
                ControlCommand::Chip {
                    chip: leading_int(chip),
                    freq: leading_float(freq) as f32,
                }
            }
            "target" => {
                let setting = setting.ok_or(ControlError::MissingFreq)?;
                ControlCommand::Target(leading_float(setting) as f32)
            }
            "lockfreq" => ControlCommand::LockFreq,
            "unlockfreq" => ControlCommand::UnlockFreq,
            "waitfactor" => {
                let setting = setting.ok_or(ControlError::MissingValue)?;
                ControlCommand::WaitFactor(leading_float(setting) as f32)
            }
            "usbprop" => {
                let setting = setting.ok_or(ControlError::MissingUsec)?;
                ControlCommand::UsbProp(leading_int(setting))
            }
            "require" => {
                let setting = setting.ok_or(ControlError::MissingValue)?;
                ControlCommand::Require(leading_float(setting) as f32)
            }
            _ => return Err(ControlError::UnknownOption(option.to_string())),
        };
        Ok(command)
    }
}

/// Parses and applies one option. Returns the reply text, if the option
/// has one.
pub fn apply(
    device: &Device,
    option: &str,
    setting: Option<&str>,
) -> Result<Option<String>, ControlError> {
    let command = ControlCommand::parse(option, setting)?;
    execute(device, command)
}

pub fn execute(device: &Device, command: ControlCommand) -> Result<Option<String>, ControlError> {
    debug!(port = device.port(), ?command, "Control");
    match command {
        ControlCommand::Help => return Ok(Some(HELP.to_string())),
        ControlCommand::Reset => device.set_state(MiningState::Reset),
        ControlCommand::Freq(freq) => {
            let freq = chain_freq(device, freq);
            device.change_freq_any(freq);
        }
        ControlCommand::Chip { chip, freq } => {
            let chips = device.inner.lock().chips.len();
            let index = usize::try_from(chip)
                .ok()
                .filter(|&index| index < chips)
                .ok_or(ControlError::InvalidChip(chip))?;
            let freq = chain_freq(device, freq);
            device.calc_freq(freq, FrequencyTarget::Chip(index));
        }
        ControlCommand::Target(freq) => {
            let freq = chain_freq(device, freq);
            device.inner.lock().freq.requested = freq;
            info!(port = device.port(), target = freq, "Target frequency");
        }
        ControlCommand::LockFreq => device.inner.lock().freq.lock = true,
        ControlCommand::UnlockFreq => device.inner.lock().freq.lock = false,
        ControlCommand::WaitFactor(factor) => {
            let factor = factor.clamp(WAIT_FACTOR_RANGE.0, WAIT_FACTOR_RANGE.1);
            device.inner.lock().rates.wait_factor0 = f64::from(factor);
            device.update_rates();
        }
        ControlCommand::UsbProp(us) => {
            let us = us.clamp(i64::from(USB_PROP_RANGE.0), i64::from(USB_PROP_RANGE.1));
            device.set_usb_prop_us(us as u32);
        }
        ControlCommand::Require(fraction) => {
            let fraction = fraction.clamp(GHREQUIRE_RANGE.0, GHREQUIRE_RANGE.1);
            device.inner.lock().freq.ghrequire = fraction;
            device.update_rates();
        }
    }
    Ok(None)
}

/// Clamps into the chip band (zero allowed) and rounds up to the base.
fn chain_freq(device: &Device, freq: f32) -> f32 {
    let inner = device.inner.lock();
    inner.freq.round(inner.freq.limit(freq, true))
}

/// Value of the longest numeric prefix, after leading whitespace.
fn leading_float(s: &str) -> f64 {
    let s = s.trim_start();
    let mut end = 0;
    let mut seen_dot = false;
    let mut seen_exp = false;
    let bytes = s.as_bytes();
    while end < bytes.len() {
        let b = bytes[end];
        let ok = match b {
            b'0'..=b'9' => true,
            b'+' | b'-' => end == 0 || matches!(bytes[end - 1], b'e' | b'E'),
            b'.' => !seen_dot && !seen_exp,
            b'e' | b'E' => !seen_exp && end > 0,
            _ => false,
        };
        if !ok {
            break;
        }
        seen_dot |= b == b'.';
        seen_exp |= matches!(b, b'e' | b'E');
        end += 1;
    }
    // Trailing exponent or sign characters are not part of the number.
    (1..=end)
        .rev()
        .find_map(|len| s[..len].parse().ok())
        .unwrap_or(0.0)
}

fn leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let digits = s
        .char_indices()
        .take_while(|&(i, c)| c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+')))
        .count();
    s[..digits].parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::device::tests::{fixture, with_chips};

    #[test_case("freq", None, ControlError::MissingFreq; "freq without value")]
    #[test_case("target", Some(""), ControlError::MissingFreq; "target with empty value")]
    #[test_case("chip", None, ControlError::MissingChipFreq; "chip without value")]
    #[test_case("chip", Some("400"), ControlError::NotChipFreq; "chip without colon")]
    #[test_case("chip", Some(":400"), ControlError::NotChipFreq; "chip without index")]
    #[test_case("chip", Some("1:"), ControlError::NotChipFreq; "chip without freq")]
    #[test_case("waitfactor", None, ControlError::MissingValue; "waitfactor without value")]
    #[test_case("require", None, ControlError::MissingValue; "require without value")]
    #[test_case("usbprop", None, ControlError::MissingUsec; "usbprop without value")]
    #[test_case("overclock", Some("9"), ControlError::UnknownOption("overclock".into()); "unknown option")]
    fn should_reject_malformed_options(option: &str, setting: Option<&str>, expected: ControlError) {
        assert_eq!(ControlCommand::parse(option, setting), Err(expected));
    }

    #[test]
    fn should_describe_errors_for_the_caller() {
        assert_eq!(ControlError::InvalidChip(3).to_string(), "invalid chip 3");
        assert_eq!(
            ControlError::UnknownOption("Foo".into()).to_string(),
            "Unknown option: Foo"
        );
    }

    #[test_case("FREQ", Some("500"), ControlCommand::Freq(500.0); "case insensitive")]
    #[test_case("chip", Some("2:425.5"), ControlCommand::Chip { chip: 2, freq: 425.5 }; "chip and freq")]
    #[test_case("usbprop", Some("350us"), ControlCommand::UsbProp(350); "trailing text ignored")]
    #[test_case("waitfactor", Some("abc"), ControlCommand::WaitFactor(0.0); "garbage reads as zero")]
    #[test_case("LockFreq", None, ControlCommand::LockFreq; "lock")]
    fn should_parse_options(option: &str, setting: Option<&str>, expected: ControlCommand) {
        assert_eq!(ControlCommand::parse(option, setting), Ok(expected));
    }

    #[test_case("1e3x", 1000.0)]
    #[test_case("  -2.5", -2.5)]
    #[test_case("7e", 7.0)]
    #[test_case("", 0.0)]
    fn should_read_leading_number(text: &str, expected: f64) {
        assert_eq!(leading_float(text), expected);
    }

    #[test]
    fn should_answer_help() {
        let f = fixture();
        assert_eq!(
            apply(&f.device, "help", None),
            Ok(Some(HELP.to_string()))
        );
    }

    #[test]
    fn should_reject_chip_outside_chain_without_changes() {
        let f = fixture();
        with_chips(&f.device, 2);
        assert_eq!(
            apply(&f.device, "chip", Some("2:400")),
            Err(ControlError::InvalidChip(2))
        );
        assert_eq!(
            apply(&f.device, "chip", Some("-1:400")),
            Err(ControlError::InvalidChip(-1))
        );
        assert!(f.transport.written().is_empty());
    }

    #[test]
    fn should_clamp_pacing_tunables() {
        let f = fixture();
        apply(&f.device, "usbprop", Some("5000")).expect("usbprop");
        assert_eq!(f.device.usb_prop_us(), 1000);
        apply(&f.device, "usbprop", Some("10")).expect("usbprop");
        assert_eq!(f.device.usb_prop_us(), 200);

        apply(&f.device, "waitfactor", Some("9")).expect("waitfactor");
        apply(&f.device, "require", Some("0.95")).expect("require");
        let inner = f.device.inner.lock();
        assert_eq!(inner.rates.wait_factor0, 2.0);
        assert_eq!(inner.freq.ghrequire, 0.8);
    }

    #[test]
    fn should_round_target_onto_base() {
        let f = fixture();
        apply(&f.device, "target", Some("402")).expect("target");
        assert_eq!(f.device.inner.lock().freq.requested, 405.0);
    }

    #[test]
    fn should_toggle_frequency_lock() {
        let f = fixture();
        apply(&f.device, "lockfreq", None).expect("lock");
        assert!(f.device.inner.lock().freq.lock);
        apply(&f.device, "unlockfreq", None).expect("unlock");
        assert!(!f.device.inner.lock().freq.lock);
    }

    #[test]
    fn should_request_reset() {
        let f = fixture();
        f.device.set_state(MiningState::Mining);
        apply(&f.device, "reset", None).expect("reset");
        assert_eq!(f.device.state(), MiningState::Reset);
    }

    #[test]
    fn should_program_single_chip() {
        let f = fixture();
        with_chips(&f.device, 2);
        apply(&f.device, "chip", Some("1:400")).expect("chip");
        let inner = f.device.inner.lock();
        assert_eq!(inner.chips[1].frequency, 400.0);
        assert!(!f.transport.written().is_empty());
    }
}
