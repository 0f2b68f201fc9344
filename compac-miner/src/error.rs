//! Error types surfaced by the driver.
//!
//! Hardware anomalies never appear here; they are absorbed by the protocol
//! state machine and at worst cause a device reset. What remains are the
//! conditions a device manager has to act on.

use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration file: {0}")]
    ConfigFile(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("port {port} disabled after {attempts} initialization attempts")]
    PortDisabled { port: String, attempts: u32 },

    #[error("port {0} must be reopened")]
    ReopenRequested(String),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
