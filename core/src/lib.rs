// BLE Link: peripheral GATT transport for the mesh
//
// Lets a node exchange raw message bytes with nearby peers when there is no IP
// network: advertises a GATT service, exchanges peer identity, and pushes
// payloads through an MTU-sized, acknowledged notification stream.
//
// Discovery, framing above raw bytes and routing live elsewhere.

pub mod config;
pub mod error;
pub mod logging;
pub mod transport;

pub use config::{ConfigError, DriverConfig};
pub use error::DriverError;
pub use logging::init_logging;
pub use transport::ble::{
    ConnectionRegistry, DeviceAddress, EventBridge, GattServer, HostBluetoothStack,
    InboundChunk, LifecycleState, LoopbackHost, PeerDevice, ServerEvents,
};
