use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;
use strum::{Display, FromRepr, IntoStaticStr};

/// Protocol state of a chip chain.
///
/// ```text
/// Init -> ChipCount -> ChipCountXx -> ChipCountOk -> OpenCore -> OpenCoreOk -> Mining
///                \________________________________________________________/   |  ^
///                                      faults                           MiningDups
///                                        v
///                                      Reset -> Init
/// ```
///
/// `Shutdown` is terminal; every thread exits once it observes it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, FromRepr, Serialize,
)]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MiningState {
    Init,
    ChipCount,
    /// Chip count requested, identity frames being collected.
    ChipCountXx,
    ChipCountOk,
    OpenCore,
    OpenCoreOk,
    Mining,
    /// Mining, and a duplicate nonce was seen. Cleared on the next control
    /// step.
    MiningDups,
    Reset,
    Shutdown,
}

impl MiningState {
    pub fn is_mining(self) -> bool {
        matches!(self, MiningState::Mining | MiningState::MiningDups)
    }
}

/// The protocol state, shared by every device thread.
///
/// Reads are lock-free so that loops can poll it at every blocking
/// boundary. Once `Shutdown` is stored no other state replaces it.
#[derive(Debug)]
pub struct AtomicMiningState(AtomicU8);

impl AtomicMiningState {
    pub fn new(state: MiningState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> MiningState {
        MiningState::from_repr(self.0.load(Ordering::Acquire)).unwrap_or(MiningState::Shutdown)
    }

    /// Stores `state` unless the device is shutting down. Returns the state
    /// that was replaced.
    pub fn store(&self, state: MiningState) -> MiningState {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != MiningState::Shutdown as u8).then_some(state as u8)
            })
            .unwrap_or(MiningState::Shutdown as u8);
        MiningState::from_repr(previous).unwrap_or(MiningState::Shutdown)
    }

    /// Moves from `from` to `to` only if nothing else changed the state in
    /// between.
    pub fn transition(&self, from: MiningState, to: MiningState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_shutdown(&self) -> bool {
        self.load() == MiningState::Shutdown
    }
}
