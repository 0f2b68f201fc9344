//! Chip-family strategies.
//!
//! Everything that differs between ASIC families lives behind [`ChipFamily`]:
//! frame sizes, PLL divisor computation, and how chips are addressed on the
//! chain. A device picks its family once at construction and the rest of the
//! driver asks the strategy instead of branching on a chip type.
//!
//! The trait is sealed. Supporting a new family means adding a module here,
//! not implementing the trait downstream.

pub mod bm1397;

use std::fmt;

pub use bm1397::Bm1397;

/// Rolling range of job ids a family accepts in task frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobIds {
    pub min: u8,
    pub max: u8,
    pub step: u8,
}

/// Divider settings for a chip PLL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PllDividers {
    /// Feedback divider; the VCO runs at this times the reference multiplier.
    pub fb_div: u8,
    pub ref_div: u8,
    pub post_div1: u8,
    pub post_div2: u8,
}

impl PllDividers {
    /// Settings that stop the clock.
    pub const POWER_DOWN: Self = Self {
        fb_div: 0,
        ref_div: 1,
        post_div1: 1,
        post_div2: 1,
    };

    /// Output frequency in MHz for a reference multiplier.
    pub fn frequency(&self, multiplier: f32) -> f32 {
        multiplier * f32::from(self.fb_div)
            / f32::from(self.ref_div)
            / f32::from(self.post_div1)
            / f32::from(self.post_div2)
    }

    /// VCO frequency in MHz.
    pub fn vco(&self, multiplier: f32) -> f32 {
        multiplier * f32::from(self.fb_div)
    }
}

/// Outcome of converting a frequency request into PLL settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PllPlan {
    /// Stop the clock on every chip.
    PowerDown,
    /// Program these dividers; `actual` is the frequency they produce.
    Set { dividers: PllDividers, actual: f32 },
    /// No divider combination keeps the VCO in range.
    OutOfRange,
}

mod sealed {
    pub trait Sealed {}
}

pub trait ChipFamily: sealed::Sealed + fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Hashing cores per chip.
    fn cores(&self) -> u32;

    /// Length of every response frame, preamble included.
    fn response_len(&self) -> usize;

    /// Length of a task frame body for the given midstate count, without the
    /// preamble.
    fn task_len(&self, midstates: usize) -> usize;

    /// Midstates a single task can carry with AsicBoost.
    fn max_midstates(&self) -> usize;

    fn job_ids(&self) -> JobIds;

    /// Reference clock multiplier for PLL settings, in MHz.
    fn freq_multiplier(&self) -> f32;

    /// Inclusive range of frequencies the chips accept, in MHz.
    fn frequency_band(&self) -> (f32, f32);

    fn pll_plan(&self, frequency: f32) -> PllPlan;

    /// Protocol address of chip `index` on a chain of `chips`.
    fn chip_address(&self, index: usize, chips: usize) -> u8;

    /// Inverse of [`chip_address`](Self::chip_address).
    fn chip_index(&self, address: u8, chips: usize) -> usize;

    /// Chip that most likely produced a nonce, judged from the nonce byte the
    /// chips partition their search space by. Used when no learned map exists.
    fn chip_for_nonce_byte(&self, byte: u8, chips: usize) -> usize;

    /// Nonce-byte to chip map for the chain topologies that have one.
    fn nonce_byte_map(&self, chips: usize) -> Option<Box<[u8; 256]>>;

    fn is_chip_identity(&self, frame: &[u8]) -> bool;

    /// Whether chips answer a frequency set on their own. Families that do
    /// are considered stuck when a set goes unanswered.
    fn expects_frequency_reply(&self) -> bool;

    /// Whether any plateau forces a reset, instead of only a missing-nonce one.
    fn resets_on_any_plateau(&self) -> bool;
}
