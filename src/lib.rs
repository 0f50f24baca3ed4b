//! A gateway between De Dietrich Diematic heating regulators and a message bus.
//!
//! The regulator is reached through a serial to TCP adapter and speaks a
//! Modbus RTU dialect. This crate polls its registers, turns them into named
//! and scaled measurements, and queues parameter writes coming from the bus.
//!
//! ## Layers
//!
//! - [`protocol`]: frame encoding, checksum and reply validation.
//! - [`registers`]: the static register layout and writable parameters.
//! - [`link`]: one TCP session with its receive activity and the single
//!   pending request.
//! - [`poller`]: the poll cycle and the single-slot write queue.
//! - [`gateway`]: reconnect supervision and the interfaces towards the bus.
//!
//! ## Quick Start
//!
//! ```no_run
//! use diematic_lib::gateway::{DeviceGateway, GatewayConfig, MeasurementSink};
//! use diematic_lib::registers::Measurement;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Print;
//!
//! impl MeasurementSink for Print {
//!     fn publish(&self, measurement: &Measurement) {
//!         println!("{measurement}");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = DeviceGateway::new(GatewayConfig::new("192.168.1.7:88"), Print);
//!     let report = gateway.poll_once(&CancellationToken::new()).await?;
//!     println!("{} values read", report.published);
//!     Ok(())
//! }
//! ```

mod error;
pub mod gateway;
pub mod link;
pub mod poller;
pub mod protocol;
pub mod registers;

pub use error::{Error, Result};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the guard of a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
