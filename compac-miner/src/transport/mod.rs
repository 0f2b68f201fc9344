//! Byte transport to the chip chain.
//!
//! The driver sees the adapter as a half-duplex byte pipe with a reset line.
//! [`SerialTransport`] drives a USB serial adapter; tests script one in
//! memory.

mod serial;

#[cfg(test)]
pub(crate) mod mock;

use std::io;
use std::time::Duration;

pub use serial::SerialTransport;

/// Baud rate chips come out of reset at.
pub const INIT_BAUD: u32 = 115_200;

/// Baud rate after the chain has been switched over.
pub const MINING_BAUD: u32 = 1_500_000;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("device disconnected")]
    Disconnected,
}

pub trait Transport: Send + Sync {
    /// Stable identity of the physical port, used to key the init registry.
    fn port_id(&self) -> &str;

    /// Writes `bytes`, returning how many went out.
    fn write(&self, bytes: &[u8]) -> Result<usize, TransportError>;

    /// Reads whatever arrives within `timeout`. Zero bytes means silence.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Drives the chain reset line; `true` holds the chips in reset.
    fn set_reset(&self, asserted: bool) -> Result<(), TransportError>;

    /// Drops anything buffered in either direction.
    fn purge(&self) -> Result<(), TransportError>;

    fn set_baud_rate(&self, baud: u32) -> Result<(), TransportError>;
}
