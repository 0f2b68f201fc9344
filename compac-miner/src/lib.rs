//! Driver and control plane for BM1397 chip chains behind a serial adapter.
//!
//! The crate is organized leaf to root:
//!
//! - [`asic`] knows the wire format and the per-family constants.
//! - [`stats`] holds the time-bucketed rings that feed control decisions.
//! - [`device`] owns the device context and the long-running threads that
//!   bring a chain up, keep it fed with work, and resolve its nonces.
//! - [`driver`] starts and stops those threads.
//!
//! Hardware access goes through [`transport::Transport`] and work arrives
//! through [`work::WorkSource`], so everything above those seams can be
//! exercised without a device attached.

pub mod asic;
pub mod config;
pub mod control;
pub mod device;
pub mod driver;
pub mod error;
pub mod registry;
pub mod stats;
pub mod telemetry;
pub mod tracing;
pub mod transport;
pub mod work;
