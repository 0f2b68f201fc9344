//! The BM1397 family as wired on GekkoScience Compac F style sticks.

pub mod crc;
pub mod protocol;

use super::{ChipFamily, JobIds, PllDividers, PllPlan, sealed};

/// Number of hashing cores on a BM1397.
pub const CORES: u32 = 672;

/// Response frame length, preamble included.
pub const RESPONSE_LEN: usize = 9;

/// Task frame length for a single midstate, without the preamble.
pub const TASK_LEN: usize = 54;

pub const MIDSTATES: usize = 4;

pub const JOB_IDS: JobIds = JobIds {
    min: 0x10,
    max: 0x7f,
    step: 4,
};

/// PLL reference multiplier in MHz.
pub const FREQ_MULT: f32 = 25.0;

pub const MIN_FREQ: f32 = 100.0;
pub const MAX_FREQ: f32 = 800.0;

// Feedback divider limits keep the VCO inside 400..=6000 MHz.
const FB_DIV_MIN: f64 = 16.0;
const FB_DIV_MAX: f64 = 240.0;

/// Chip id reported in the register 0 read during enumeration.
pub const CHIP_ID: [u8; 2] = [0x13, 0x97];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bm1397;

impl sealed::Sealed for Bm1397 {}

impl ChipFamily for Bm1397 {
    fn name(&self) -> &'static str {
        "BM1397"
    }

    fn cores(&self) -> u32 {
        CORES
    }

    fn response_len(&self) -> usize {
        RESPONSE_LEN
    }

    fn task_len(&self, midstates: usize) -> usize {
        TASK_LEN + 32 * midstates.clamp(1, MIDSTATES).saturating_sub(1)
    }

    fn max_midstates(&self) -> usize {
        MIDSTATES
    }

    fn job_ids(&self) -> JobIds {
        JOB_IDS
    }

    fn freq_multiplier(&self) -> f32 {
        FREQ_MULT
    }

    fn frequency_band(&self) -> (f32, f32) {
        (MIN_FREQ, MAX_FREQ)
    }

    fn pll_plan(&self, frequency: f32) -> PllPlan {
        if frequency == 0.0 {
            return PllPlan::PowerDown;
        }

        // Pick post dividers that keep the VCO near 2500-5000 MHz.
        let ref_div: u8 = if frequency >= 500.0 { 1 } else { 2 };
        let post_div1: u8 = if frequency >= 500.0 {
            1
        } else if frequency <= 150.0 {
            3
        } else if frequency <= 250.0 {
            2
        } else {
            1
        };
        let post_div2: u8 = 5;

        let divisor = f64::from(ref_div) * f64::from(post_div1) * f64::from(post_div2);
        let mult = f64::from(FREQ_MULT);
        let steps = ceil_steps(f64::from(frequency) * divisor / mult);
        if !(FB_DIV_MIN..=FB_DIV_MAX).contains(&steps) {
            return PllPlan::OutOfRange;
        }

        let dividers = PllDividers {
            fb_div: steps as u8,
            ref_div,
            post_div1,
            post_div2,
        };
        PllPlan::Set {
            dividers,
            actual: (steps * mult / divisor) as f32,
        }
    }

    fn chip_address(&self, index: usize, chips: usize) -> u8 {
        (chip_spacing(chips) * index % 0x100) as u8
    }

    fn chip_index(&self, address: u8, chips: usize) -> usize {
        usize::from(address) / chip_spacing(chips)
    }

    fn chip_for_nonce_byte(&self, byte: u8, chips: usize) -> usize {
        let chips = chips.max(1);
        (usize::from(byte) / (0x100 / chips)).min(chips - 1)
    }

    fn nonce_byte_map(&self, chips: usize) -> Option<Box<[u8; 256]>> {
        match chips {
            1 => Some(Box::new([0; 256])),
            6 => {
                // Each chip owns a contiguous share of every quarter of the
                // byte range.
                let share = chip_spacing(chips) as f64 / 4.0;
                let mut map = Box::new([0u8; 256]);
                for quarter in 0..4 {
                    for offset in 0..64 {
                        let chip = ((offset as f64 / share) as usize).min(chips - 1);
                        map[quarter * 64 + offset] = chip as u8;
                    }
                }
                Some(map)
            }
            _ => None,
        }
    }

    fn is_chip_identity(&self, frame: &[u8]) -> bool {
        frame.len() >= 4 && frame[2..4] == CHIP_ID
    }

    fn expects_frequency_reply(&self) -> bool {
        false
    }

    fn resets_on_any_plateau(&self) -> bool {
        true
    }
}

/// Address distance between neighbouring chips.
fn chip_spacing(chips: usize) -> usize {
    0x100 / chips.clamp(1, 0x100)
}

/// Rounds up to a whole number of steps, ignoring float noise just above an
/// integer.
pub(crate) fn ceil_steps(value: f64) -> f64 {
    (value - 1e-6).ceil()
}
