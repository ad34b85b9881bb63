//! Connected remote devices as seen by the peripheral.
//!
//! The registry owns every `PeerDevice`; the driver only reads them. Host
//! callbacks (through the event bridge) are the only writers.

use super::gatt::DEFAULT_ATT_MTU;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

/// Bluetooth device address, normalized to upper case ("AA:BB:CC:DD:EE:FF")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: &str) -> Self {
        Self(address.trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

/// What the central asked for through the client-configuration descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationMode {
    Disabled,
    Notify,
    Indicate,
}

impl NotificationMode {
    /// Decode a CCC descriptor value (little-endian bit field)
    pub fn from_ccc_value(value: &[u8]) -> Option<Self> {
        match value {
            [0x00, 0x00] => Some(NotificationMode::Disabled),
            [0x01, 0x00] => Some(NotificationMode::Notify),
            [0x02, 0x00] => Some(NotificationMode::Indicate),
            _ => None,
        }
    }
}

struct DeviceState {
    address: DeviceAddress,
    mtu: AtomicU16,
    server_connected: AtomicBool,
    remote_peer_id: Mutex<Option<Vec<u8>>>,
    notifications: Mutex<NotificationMode>,
}

/// Shared, read-only view of one remote device
#[derive(Clone)]
pub struct PeerDevice {
    state: Arc<DeviceState>,
}

impl PeerDevice {
    fn new(address: DeviceAddress) -> Self {
        Self {
            state: Arc::new(DeviceState {
                address,
                mtu: AtomicU16::new(DEFAULT_ATT_MTU),
                server_connected: AtomicBool::new(false),
                remote_peer_id: Mutex::new(None),
                notifications: Mutex::new(NotificationMode::Disabled),
            }),
        }
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.state.address
    }

    /// Negotiated ATT MTU (23 until the central negotiates a larger one)
    pub fn mtu(&self) -> u16 {
        self.state.mtu.load(Ordering::Acquire)
    }

    pub fn is_server_disconnected(&self) -> bool {
        !self.state.server_connected.load(Ordering::Acquire)
    }

    /// Identifier the remote peer wrote into the identity characteristic
    pub fn remote_peer_id(&self) -> Option<Vec<u8>> {
        self.state.remote_peer_id.lock().clone()
    }

    pub fn notifications_enabled(&self) -> NotificationMode {
        *self.state.notifications.lock()
    }

    fn set_connected(&self, connected: bool) {
        self.state.server_connected.store(connected, Ordering::Release);
    }

    fn set_mtu(&self, mtu: u16) {
        self.state.mtu.store(mtu, Ordering::Release);
    }
}

impl fmt::Debug for PeerDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerDevice")
            .field("address", self.address())
            .field("mtu", &self.mtu())
            .field("connected", &!self.is_server_disconnected())
            .finish()
    }
}

/// Address → device table
#[derive(Default)]
pub struct ConnectionRegistry {
    devices: RwLock<HashMap<DeviceAddress, PeerDevice>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<PeerDevice> {
        self.devices.read().get(address).cloned()
    }

    /// Devices currently connected to the server
    pub fn connected(&self) -> Vec<PeerDevice> {
        self.devices
            .read()
            .values()
            .filter(|d| !d.is_server_disconnected())
            .cloned()
            .collect()
    }

    fn entry(&self, address: &DeviceAddress) -> PeerDevice {
        if let Some(device) = self.get(address) {
            return device;
        }
        self.devices
            .write()
            .entry(address.clone())
            .or_insert_with(|| PeerDevice::new(address.clone()))
            .clone()
    }

    /// Record a connection state change, creating the entry on first sight
    pub fn set_connected(&self, address: &DeviceAddress, connected: bool) -> PeerDevice {
        let device = self.entry(address);
        device.set_connected(connected);
        if !connected {
            // A fresh link renegotiates MTU and subscriptions
            device.set_mtu(DEFAULT_ATT_MTU);
            *device.state.notifications.lock() = NotificationMode::Disabled;
        }
        device
    }

    pub fn set_mtu(&self, address: &DeviceAddress, mtu: u16) -> PeerDevice {
        let device = self.entry(address);
        device.set_mtu(mtu.max(DEFAULT_ATT_MTU));
        device
    }

    pub fn set_remote_peer_id(&self, address: &DeviceAddress, peer_id: &[u8]) -> PeerDevice {
        let device = self.entry(address);
        *device.state.remote_peer_id.lock() = Some(peer_id.to_vec());
        device
    }

    pub fn set_notification_mode(
        &self,
        address: &DeviceAddress,
        mode: NotificationMode,
    ) -> PeerDevice {
        let device = self.entry(address);
        *device.state.notifications.lock() = mode;
        device
    }
}
