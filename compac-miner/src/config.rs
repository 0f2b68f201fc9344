//! Driver tunables.
//!
//! Every field has a default, so a config file only needs to name what it
//! changes. Values are clamped by [`DriverConfig::normalized`] before a
//! device sees them.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Board flavour. Both carry BM1397 chips; they differ in default clocks
/// and in how raw chip throughput maps to reported hashrate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardIdent {
    #[default]
    Gsf,
    Gsfm,
}

impl BoardIdent {
    /// Factor from nominal chip throughput to real throughput.
    pub fn hashrate_scale(self) -> f64 {
        match self {
            BoardIdent::Gsf => 52.5 / 67.2,
            BoardIdent::Gsfm => 1.0,
        }
    }

    /// Start frequency used when none above the band floor is configured.
    pub fn default_start_freq(self) -> f32 {
        match self {
            BoardIdent::Gsf => 200.0,
            BoardIdent::Gsfm => 400.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Serial device path.
    pub port: String,

    pub ident: BoardIdent,

    /// Target frequency for GSF boards (MHz).
    pub gsf_freq: f32,

    /// Target frequency for GSFM boards (MHz).
    pub r909_freq: f32,

    /// Frequency the chips are brought up at before ramping (MHz).
    pub start_freq: f32,

    /// Ramp step (MHz). Rounded up to the 5 MHz base.
    pub step_freq: f32,

    /// Minutes between steady-state tuning passes. Zero disables tuning.
    pub tune2: u32,

    /// Task pacing multiplier over the full-scan time.
    pub wait_factor: f32,

    pub noboost: bool,

    /// Pause after every write, in microseconds.
    pub usb_prop_us: u32,

    /// Fraction of the nominal hashrate below which tuning backs off.
    pub ghrequire: f32,

    pub expected_chips: usize,

    /// Receive poll interval. Bounds how long threads take to notice a
    /// shutdown.
    pub read_timeout_ms: u64,

    pub nonce_wait_ms: u64,

    pub nonce_queue_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            port: String::from("/dev/ttyUSB0"),
            ident: BoardIdent::Gsf,
            gsf_freq: 200.0,
            r909_freq: 450.0,
            start_freq: 100.0,
            step_freq: 6.25,
            tune2: 0,
            wait_factor: 0.5,
            noboost: false,
            usb_prop_us: 1000,
            ghrequire: 0.65,
            expected_chips: 1,
            read_timeout_ms: 20,
            nonce_wait_ms: 42,
            nonce_queue_capacity: 1024,
        }
    }
}

pub const WAIT_FACTOR_RANGE: (f32, f32) = (0.01, 2.0);
pub const USB_PROP_RANGE: (u32, u32) = (200, 1000);
pub const GHREQUIRE_RANGE: (f32, f32) = (0.0, 0.8);

/// Smallest non-zero tuning interval, in minutes.
const MIN_TUNE_MINUTES: u32 = 30;

impl DriverConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: DriverConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config.normalized())
    }

    fn validate(&self) -> Result<()> {
        if self.port.is_empty() {
            return Err(Error::Config("port must not be empty".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(Error::Config("read_timeout_ms must be positive".into()));
        }
        if self.nonce_queue_capacity == 0 {
            return Err(Error::Config("nonce_queue_capacity must be positive".into()));
        }
        Ok(())
    }

    /// Copy with every tunable clamped to the range the driver accepts.
    pub fn normalized(&self) -> Self {
        let mut config = self.clone();
        config.wait_factor = config
            .wait_factor
            .clamp(WAIT_FACTOR_RANGE.0, WAIT_FACTOR_RANGE.1);
        config.usb_prop_us = config.usb_prop_us.clamp(USB_PROP_RANGE.0, USB_PROP_RANGE.1);
        config.ghrequire = config.ghrequire.clamp(GHREQUIRE_RANGE.0, GHREQUIRE_RANGE.1);
        config.start_freq = config.start_freq.max(25.0);
        config.step_freq = config.step_freq.max(1.0);
        if config.tune2 != 0 && config.tune2 < MIN_TUNE_MINUTES {
            config.tune2 = MIN_TUNE_MINUTES;
        }
        config.expected_chips = config.expected_chips.max(1);
        config.read_timeout_ms = config.read_timeout_ms.max(1);
        config.nonce_queue_capacity = config.nonce_queue_capacity.max(1);
        config
    }

    /// Frequency target for the configured board.
    pub fn target_freq(&self) -> f32 {
        match self.ident {
            BoardIdent::Gsf => self.gsf_freq,
            BoardIdent::Gsfm => self.r909_freq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn should_fill_missing_fields_with_defaults() {
        let config: DriverConfig =
            serde_json::from_str(r#"{"port": "/dev/ttyACM3", "ident": "gsfm"}"#).unwrap();
        assert_eq!(config.port, "/dev/ttyACM3");
        assert_eq!(config.ident, BoardIdent::Gsfm);
        assert_eq!(config.target_freq(), 450.0);
        assert_eq!(config.nonce_wait_ms, 42);
    }

    #[test_case(0.001, 0.01; "wait factor floor")]
    #[test_case(5.0, 2.0; "wait factor ceiling")]
    #[test_case(0.7, 0.7; "wait factor kept")]
    fn should_clamp_wait_factor(given: f32, expected: f32) {
        let config = DriverConfig {
            wait_factor: given,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.wait_factor, expected);
    }

    #[test_case(0, 0; "disabled")]
    #[test_case(5, 30; "raised")]
    #[test_case(45, 45; "kept")]
    fn should_raise_short_tune_interval(given: u32, expected: u32) {
        let config = DriverConfig {
            tune2: given,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.tune2, expected);
    }

    #[test]
    fn should_clamp_usb_prop_and_ghrequire() {
        let config = DriverConfig {
            usb_prop_us: 50,
            ghrequire: 0.95,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.usb_prop_us, 200);
        assert_eq!(config.ghrequire, 0.8);
    }

    #[test]
    fn should_reject_unknown_ident() {
        assert!(serde_json::from_str::<DriverConfig>(r#"{"ident": "r606"}"#).is_err());
    }
}
