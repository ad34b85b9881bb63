/// BLE (Bluetooth Low Energy) peripheral transport
///
/// This module exposes the mesh node as a GATT peripheral so nearby peers can
/// exchange raw message bytes without an IP network. It includes:
///
/// - **gatt**: the service definition (identity + writer characteristics, CCC descriptor)
/// - **gate**: one-shot wait gates bridging host callbacks to blocking calls
/// - **host**: the platform stack abstraction the driver talks to
/// - **registry**: connected devices and their negotiated MTU
/// - **bridge**: converts host callbacks into gate signals and registry updates
/// - **server**: service lifecycle (initialize / start / stop)
/// - **writer**: MTU-aware fragmentation with per-chunk acknowledgement
/// - **loopback**: in-memory host used by tests and the CLI
///
/// Platform code (Kotlin/Swift) implements `HostBluetoothStack` and forwards its
/// callbacks to the `ServerEvents` handle of the server it opened. Everything
/// here runs without BLE hardware.

pub mod bridge;
pub mod gate;
pub mod gatt;
pub mod host;
pub mod loopback;
pub mod registry;
pub mod server;
pub mod writer;

pub use bridge::{EventBridge, InboundChunk, ServerEvents};
pub use gate::{one_shot, GateError, GateSignal, GateWaiter};
pub use gatt::{
    CharacteristicProperties, GattCharacteristic, GattDescriptor, GattError, GattService,
    GattStatus, ATT_HEADER_SIZE, CCC_DESCRIPTOR_UUID, DEFAULT_ATT_MTU,
    MAX_ATTRIBUTE_VALUE_LEN, PEER_ID_CHARACTERISTIC_UUID, SERVICE_UUID,
    WRITER_CHARACTERISTIC_UUID,
};
pub use host::{GattServerHandle, HostBluetoothStack, HostError, L2capListener};
pub use loopback::{AckPolicy, LoopbackHost, RegistrationBehavior, SentNotification};
pub use registry::{ConnectionRegistry, DeviceAddress, NotificationMode, PeerDevice};
pub use server::{GattServer, LifecycleState};
pub use writer::{chunks_for_mtu, effective_chunk_size, WriteOperation, WriteOutcome};
