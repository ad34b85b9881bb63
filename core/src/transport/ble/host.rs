/// Host Bluetooth stack abstraction
///
/// Implementers wrap the platform's asynchronous peripheral API (Android
/// `BluetoothGattServer`, CoreBluetooth `CBPeripheralManager`, BlueZ). Calls
/// here only *submit* work; completions are reported back through the
/// `ServerEvents` handle passed to `open_gatt_server`, on the host's own
/// threads. A handle belongs to one opened server; after that server is
/// closed its answers are ignored.

use super::bridge::ServerEvents;
use super::gatt::{GattCharacteristic, GattService};
use super::registry::DeviceAddress;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by the host stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Not supported by this host: {0}")]
    Unsupported(String),
    #[error("Rejected by host: {0}")]
    Rejected(String),
    #[error("Host I/O error: {0}")]
    Io(String),
}

/// Entry point into the platform stack
#[cfg_attr(test, mockall::automock)]
pub trait HostBluetoothStack: Send + Sync {
    /// Open a GATT server whose callbacks go to `events`
    fn open_gatt_server(
        &self,
        events: ServerEvents,
    ) -> Result<Arc<dyn GattServerHandle>, HostError>;

    /// Start listening for connection-oriented channels.
    ///
    /// Hosts without L2CAP CoC support keep the default.
    fn listen_l2cap(&self) -> Result<Box<dyn L2capListener>, HostError> {
        Err(HostError::Unsupported("L2CAP channels".to_string()))
    }
}

/// An open GATT server
#[cfg_attr(test, mockall::automock)]
pub trait GattServerHandle: Send + Sync {
    /// Submit the service for registration; completion arrives via
    /// `ServerEvents::on_service_added`
    fn add_service(&self, service: &GattService) -> Result<(), HostError>;

    /// Push `value` to one connected device; delivery is confirmed via
    /// `ServerEvents::on_notification_sent`
    fn notify_characteristic_changed(
        &self,
        device: &DeviceAddress,
        characteristic: &GattCharacteristic,
        value: &[u8],
        confirm: bool,
    ) -> Result<(), HostError>;

    /// Close the server and unregister its services
    fn close(&self);
}

/// A listening L2CAP connection-oriented channel
#[cfg_attr(test, mockall::automock)]
pub trait L2capListener: Send {
    /// Protocol/Service Multiplexer peers connect to
    fn psm(&self) -> u16;

    fn close(&mut self) -> Result<(), HostError>;
}
