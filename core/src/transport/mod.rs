// Transport module: BLE peripheral link

pub mod ble;

pub use ble::{
    DeviceAddress, EventBridge, GattServer, GattServerHandle, HostBluetoothStack, HostError,
    L2capListener, LoopbackHost, PeerDevice, ServerEvents,
};
