//! Driver-level error kinds
//!
//! Every failure is resolved at the call that detected it and returned
//! synchronously. Nothing in the driver retries; that policy belongs to the caller.

use crate::transport::ble::DeviceAddress;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("GATT service initialization failed: {0}")]
    InitializationFailure(String),
    #[error("GATT service registration failed: {0}")]
    RegistrationFailure(String),
    #[error("GATT server is not started")]
    NotStarted,
    #[error("Device {0} is disconnected")]
    DeviceDisconnected(DeviceAddress),
    #[error("Writer characteristic is not available")]
    CharacteristicUnavailable,
    #[error("Notification rejected: {0}")]
    NotifyRejected(String),
    #[error("Chunk {chunk} not acknowledged within {timeout:?}")]
    AckTimeout { chunk: usize, timeout: Duration },
    #[error("Wait interrupted: {0}")]
    InterruptedWait(String),
}
