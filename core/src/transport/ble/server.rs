//! GATT server lifecycle.
//!
//! `GattServer` owns the service definition and the host's server handle. The
//! host registers services asynchronously, so `start()` arms a one-shot gate,
//! submits the service, and blocks (bounded by the configured timeout) until
//! the event bridge reports the outcome.
//!
//! All lifecycle data lives in one `ServerState` behind a single mutex and is
//! only changed through its transition methods. No host call and no gate wait
//! happens while that mutex is held.
//!
//! ```text
//! Uninitialized ──initialize──▶ Initializing ──start──▶ Registering ──added──▶ Started
//!       ▲                                                                         │
//!       └─────────────────────────────── Stopped ◀──────────────stop─────────────┘
//! ```

use super::bridge::{EventBridge, ServerEvents};
use super::gate::{GateError, GateWaiter};
use super::gatt::{GattCharacteristic, GattService, PEER_ID_CHARACTERISTIC_UUID, WRITER_CHARACTERISTIC_UUID};
use super::host::{GattServerHandle, HostBluetoothStack, HostError, L2capListener};
use super::registry::{ConnectionRegistry, DeviceAddress, PeerDevice};
use crate::config::{ConfigError, DriverConfig};
use crate::error::DriverError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where the server is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No service built
    Uninitialized,
    /// Service built, registration gate armed
    Initializing,
    /// Service submitted to the host, waiting for its answer
    Registering,
    /// Service registered; writes are accepted
    Started,
    /// Teardown in progress
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Registering => write!(f, "Registering"),
            Self::Started => write!(f, "Started"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Resources handed back by a reset, released outside the guard
struct Released {
    generation: u64,
    server: Option<Arc<dyn GattServerHandle>>,
    l2cap: Option<Box<dyn L2capListener>>,
}

struct ServerState {
    lifecycle: LifecycleState,
    /// Bumped on every reset; stale start/write attempts compare against it
    generation: u64,
    service: Option<Arc<GattService>>,
    writer: Option<Arc<GattCharacteristic>>,
    registration: Option<GateWaiter<bool>>,
    server: Option<Arc<dyn GattServerHandle>>,
    l2cap: Option<Box<dyn L2capListener>>,
}

impl ServerState {
    fn new() -> Self {
        Self {
            lifecycle: LifecycleState::Uninitialized,
            generation: 0,
            service: None,
            writer: None,
            registration: None,
            server: None,
            l2cap: None,
        }
    }

    /// Uninitialized/Stopped → Initializing
    fn initialized(
        &mut self,
        service: Arc<GattService>,
        writer: Arc<GattCharacteristic>,
        registration: GateWaiter<bool>,
    ) {
        self.service = Some(service);
        self.writer = Some(writer);
        self.registration = Some(registration);
        self.lifecycle = LifecycleState::Initializing;
    }

    /// Initializing → Registering; hands the registration gate to the caller
    fn claim_registration(&mut self) -> Option<(Arc<GattService>, GateWaiter<bool>, u64)> {
        if self.lifecycle != LifecycleState::Initializing {
            return None;
        }
        let service = self.service.clone()?;
        let waiter = self.registration.take()?;
        self.lifecycle = LifecycleState::Registering;
        Some((service, waiter, self.generation))
    }

    /// Attach the opened server to the registration in flight
    fn attach_server(
        &mut self,
        generation: u64,
        server: Arc<dyn GattServerHandle>,
        l2cap: Option<Box<dyn L2capListener>>,
    ) -> Result<(), Released> {
        if self.generation != generation || self.lifecycle != LifecycleState::Registering {
            return Err(Released {
                generation,
                server: Some(server),
                l2cap,
            });
        }
        self.server = Some(server);
        self.l2cap = l2cap;
        Ok(())
    }

    /// Registering → Started
    fn registered(&mut self, generation: u64) -> bool {
        if self.generation != generation || self.lifecycle != LifecycleState::Registering {
            return false;
        }
        self.lifecycle = LifecycleState::Started;
        true
    }

    /// Any → Stopped, dropping the service and taking the host resources
    fn reset(&mut self) -> Released {
        self.generation += 1;
        self.lifecycle = LifecycleState::Stopped;
        self.service = None;
        self.writer = None;
        self.registration = None;
        Released {
            generation: self.generation,
            server: self.server.take(),
            l2cap: self.l2cap.take(),
        }
    }

    /// Stopped → Uninitialized, unless someone re-initialized meanwhile
    fn cleared(&mut self, generation: u64) {
        if self.generation == generation && self.lifecycle == LifecycleState::Stopped {
            self.lifecycle = LifecycleState::Uninitialized;
        }
    }
}

/// What a writer captures at the start of a call
pub(super) struct WriteSnapshot {
    pub(super) generation: u64,
    pub(super) server: Option<Arc<dyn GattServerHandle>>,
    pub(super) writer: Option<Arc<GattCharacteristic>>,
}

/// Peripheral GATT server for the mesh BLE link
pub struct GattServer {
    pub(super) config: DriverConfig,
    host: Arc<dyn HostBluetoothStack>,
    pub(super) bridge: Arc<EventBridge>,
    state: Mutex<ServerState>,
    device_locks: Mutex<HashMap<DeviceAddress, Arc<Mutex<()>>>>,
    next_op: AtomicU64,
}

impl GattServer {
    /// Create a server bound to `host`; device state is read from `registry`
    pub fn new(
        host: Arc<dyn HostBluetoothStack>,
        registry: Arc<ConnectionRegistry>,
        config: DriverConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            host,
            bridge: Arc::new(EventBridge::new(registry)),
            state: Mutex::new(ServerState::new()),
            device_locks: Mutex::new(HashMap::new()),
            next_op: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// The bridge the host reports its callbacks to
    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.bridge
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.bridge.registry()
    }

    pub fn peer_device(&self, address: &DeviceAddress) -> Option<PeerDevice> {
        self.registry().get(address)
    }

    pub fn state(&self) -> LifecycleState {
        self.state.lock().lifecycle
    }

    pub fn is_started(&self) -> bool {
        self.state() == LifecycleState::Started
    }

    /// The service currently built, if any
    pub fn service(&self) -> Option<Arc<GattService>> {
        self.state.lock().service.clone()
    }

    /// PSM of the L2CAP listener; `None` when the host has none
    pub fn l2cap_psm(&self) -> Option<u16> {
        self.state.lock().l2cap.as_ref().map(|l| l.psm())
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Build the service definition and arm the registration gate.
    ///
    /// No-op unless the server is Uninitialized (or Stopped).
    pub fn initialize(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        match state.lifecycle {
            LifecycleState::Uninitialized | LifecycleState::Stopped => {}
            other => {
                debug!("initialize: nothing to do in state {}", other);
                return Ok(());
            }
        }

        info!("Initializing GATT service");
        let service = GattService::build_mesh_service().map_err(|e| {
            error!("GATT service setup failed: {}", e);
            DriverError::InitializationFailure(e.to_string())
        })?;
        let writer = service
            .characteristic(WRITER_CHARACTERISTIC_UUID)
            .ok_or_else(|| {
                DriverError::InitializationFailure("writer characteristic missing".to_string())
            })?;

        let registration = self.bridge.arm_registration(state.generation);
        state.initialized(Arc::new(service), writer, registration);
        Ok(())
    }

    /// Register the service with the host and block until it is live.
    ///
    /// Returns immediately if already started. On any failure every resource
    /// acquired by this call is released and the server is left Uninitialized,
    /// so the caller may retry.
    pub fn start(&self, local_peer_id: &[u8]) -> Result<(), DriverError> {
        info!("GATT server start requested");
        if self.is_started() {
            info!("GATT server already started");
            return Ok(());
        }

        self.initialize()?;

        let (service, registration, generation) = {
            let mut state = self.state.lock();
            match state.lifecycle {
                LifecycleState::Started => return Ok(()),
                LifecycleState::Registering => {
                    return Err(DriverError::RegistrationFailure(
                        "registration already in progress".to_string(),
                    ))
                }
                _ => {}
            }

            if let Some(peer_id) = state
                .service
                .as_ref()
                .and_then(|s| s.characteristic(PEER_ID_CHARACTERISTIC_UUID))
            {
                peer_id.set_value(local_peer_id).map_err(|e| {
                    error!("Cannot store local peer id: {}", e);
                    DriverError::InitializationFailure(e.to_string())
                })?;
            }

            state.claim_registration().ok_or_else(|| {
                DriverError::RegistrationFailure(format!(
                    "cannot register from state {}",
                    state.lifecycle
                ))
            })?
        };

        self.bridge.set_local_peer_id(local_peer_id);

        let events = ServerEvents::new(self.bridge.clone(), generation);
        let server = match self.host.open_gatt_server(events) {
            Ok(server) => server,
            Err(e) => {
                error!("Cannot open GATT server: {}", e);
                self.abort_start(generation);
                return Err(DriverError::RegistrationFailure(e.to_string()));
            }
        };

        let l2cap = self.listen_l2cap();

        let attached = self
            .state
            .lock()
            .attach_server(generation, server.clone(), l2cap);
        if let Err(released) = attached {
            warn!("GATT server stopped while starting");
            self.release(released);
            return Err(DriverError::InterruptedWait(
                "server stopped during start".to_string(),
            ));
        }

        if let Err(e) = server.add_service(&service) {
            error!("Cannot add GATT service: {}", e);
            self.abort_start(generation);
            return Err(DriverError::RegistrationFailure(e.to_string()));
        }

        let timeout = self.config.registration_timeout();
        match registration.wait_timeout(timeout) {
            Ok(true) => {
                if self.state.lock().registered(generation) {
                    info!("GATT server started");
                    Ok(())
                } else {
                    warn!("GATT service registered after the server was stopped");
                    Err(DriverError::InterruptedWait(
                        "server stopped during start".to_string(),
                    ))
                }
            }
            Ok(false) => {
                error!("Host rejected the GATT service");
                self.abort_start(generation);
                Err(DriverError::RegistrationFailure(
                    "host rejected the service".to_string(),
                ))
            }
            Err(GateError::TimedOut(_)) => {
                error!("GATT service registration timed out after {:?}", timeout);
                self.abort_start(generation);
                Err(DriverError::RegistrationFailure(format!(
                    "no answer from host within {:?}",
                    timeout
                )))
            }
            Err(GateError::Abandoned) => {
                warn!("GATT service registration wait interrupted");
                self.abort_start(generation);
                Err(DriverError::InterruptedWait(
                    "registration abandoned".to_string(),
                ))
            }
        }
    }

    /// Tear the server down. Always leaves the instance reusable; release
    /// errors are logged, never returned.
    pub fn stop(&self) {
        info!("GATT server stop requested");
        let released = {
            let mut state = self.state.lock();
            if state.lifecycle == LifecycleState::Uninitialized {
                debug!("GATT server not initialized, nothing to stop");
                return;
            }
            if state.lifecycle != LifecycleState::Started {
                debug!("Stopping GATT server from state {}", state.lifecycle);
            }
            // Retired under the state lock: a concurrent start() cannot arm
            // its gate in between
            let retired = state.generation;
            let released = state.reset();
            if self.bridge.retire(retired) {
                debug!("Abandoned pending service registration");
            }
            let interrupted = self.bridge.abandon_all_acks();
            if interrupted > 0 {
                warn!("Interrupted {} in-flight write(s)", interrupted);
            }
            released
        };

        let generation = released.generation;
        self.release(released);
        self.state.lock().cleared(generation);
        info!("GATT server stopped");
    }

    // ------------------------------------------------------------------------
    // INTERNALS
    // ------------------------------------------------------------------------

    fn listen_l2cap(&self) -> Option<Box<dyn L2capListener>> {
        if !self.config.enable_l2cap {
            return None;
        }
        match self.host.listen_l2cap() {
            Ok(listener) => {
                info!("Listening for L2CAP channels on PSM {}", listener.psm());
                Some(listener)
            }
            Err(HostError::Unsupported(what)) => {
                debug!("No L2CAP listener: {} unsupported", what);
                None
            }
            Err(e) => {
                error!("Cannot listen for L2CAP channels: {}", e);
                None
            }
        }
    }

    /// Reset after a failed start, if nothing else reset the state first
    fn abort_start(&self, generation: u64) {
        let released = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            let released = state.reset();
            self.bridge.retire(generation);
            released
        };
        let current = released.generation;
        self.release(released);
        self.state.lock().cleared(current);
    }

    fn release(&self, released: Released) {
        if let Some(mut l2cap) = released.l2cap {
            debug!("Closing L2CAP listener (PSM {})", l2cap.psm());
            if let Err(e) = l2cap.close() {
                error!("Cannot close L2CAP listener: {}", e);
            }
        }
        if let Some(server) = released.server {
            server.close();
        }
    }

    pub(super) fn write_snapshot(&self) -> WriteSnapshot {
        let state = self.state.lock();
        let started = state.lifecycle == LifecycleState::Started;
        WriteSnapshot {
            generation: state.generation,
            server: state.server.clone().filter(|_| started),
            writer: state.writer.clone(),
        }
    }

    /// Whether the server captured at `generation` is still the live one
    pub(super) fn is_live(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.generation == generation && state.lifecycle == LifecycleState::Started
    }

    pub(super) fn device_lock(&self, address: &DeviceAddress) -> Arc<Mutex<()>> {
        self.device_locks
            .lock()
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the lock for `address` once no writer holds or waits on it
    pub(super) fn prune_device_lock(&self, address: &DeviceAddress) {
        let mut locks = self.device_locks.lock();
        if locks
            .get(address)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(address);
        }
    }

    #[cfg(test)]
    pub(super) fn tracked_device_locks(&self) -> usize {
        self.device_locks.lock().len()
    }

    pub(super) fn next_op_seq(&self) -> u64 {
        self.next_op.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ble::host::{MockGattServerHandle, MockHostBluetoothStack, MockL2capListener};
    use std::sync::atomic::AtomicBool;

    fn server_with(host: MockHostBluetoothStack, config: DriverConfig) -> GattServer {
        GattServer::new(Arc::new(host), Arc::new(ConnectionRegistry::new()), config)
            .expect("Valid config")
    }

    fn quick_config() -> DriverConfig {
        DriverConfig::default()
            .with_registration_timeout_ms(100)
            .with_l2cap(false)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = GattServer::new(
            Arc::new(MockHostBluetoothStack::new()),
            Arc::new(ConnectionRegistry::new()),
            DriverConfig::default().with_ack_timeout_ms(0),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_initialize_builds_empty_service() {
        let server = server_with(MockHostBluetoothStack::new(), quick_config());
        assert_eq!(server.state(), LifecycleState::Uninitialized);
        assert!(server.service().is_none());

        server.initialize().expect("Initialize");
        assert_eq!(server.state(), LifecycleState::Initializing);
        let service = server.service().expect("Service built");
        assert!(service
            .characteristics()
            .iter()
            .all(|c| c.value().is_empty()));

        // Second call keeps the same service object
        server.initialize().expect("Initialize again");
        assert!(Arc::ptr_eq(&service, &server.service().expect("Service")));
    }

    #[test]
    fn test_open_failure_releases_everything() {
        let mut host = MockHostBluetoothStack::new();
        host.expect_open_gatt_server()
            .times(1)
            .returning(|_| Err(HostError::Rejected("adapter off".to_string())));

        let server = server_with(host, quick_config());
        let result = server.start(b"peer-a");
        assert_eq!(
            result,
            Err(DriverError::RegistrationFailure(
                "Rejected by host: adapter off".to_string()
            ))
        );
        assert_eq!(server.state(), LifecycleState::Uninitialized);
        assert!(server.service().is_none());
    }

    #[test]
    fn test_add_service_failure_closes_server() {
        let closed = Arc::new(AtomicBool::new(false));
        let closed_flag = closed.clone();

        let mut host = MockHostBluetoothStack::new();
        host.expect_open_gatt_server().times(1).returning(move |_| {
            let mut handle = MockGattServerHandle::new();
            handle
                .expect_add_service()
                .returning(|_| Err(HostError::Rejected("too many services".to_string())));
            let flag = closed_flag.clone();
            handle
                .expect_close()
                .times(1)
                .returning(move || flag.store(true, Ordering::SeqCst));
            Ok(Arc::new(handle) as Arc<dyn GattServerHandle>)
        });

        let server = server_with(host, quick_config());
        assert!(matches!(
            server.start(b"peer-a"),
            Err(DriverError::RegistrationFailure(_))
        ));
        assert!(closed.load(Ordering::SeqCst));
        assert!(!server.is_started());
    }

    #[test]
    fn test_registration_success_through_bridge() {
        let mut host = MockHostBluetoothStack::new();
        host.expect_open_gatt_server().times(1).returning(|events| {
            let mut handle = MockGattServerHandle::new();
            // Host answers synchronously; the armed gate holds the result
            handle.expect_add_service().returning(move |_| {
                events.on_service_added(true);
                Ok(())
            });
            handle.expect_close().returning(|| ());
            Ok(Arc::new(handle) as Arc<dyn GattServerHandle>)
        });

        let server = server_with(host, quick_config());
        server.start(b"peer-a").expect("Start");
        assert!(server.is_started());
        assert_eq!(server.bridge().local_peer_id(), b"peer-a".to_vec());

        // Idempotent: the mock allows exactly one open
        server.start(b"peer-a").expect("Second start");

        server.stop();
        assert_eq!(server.state(), LifecycleState::Uninitialized);
    }

    #[test]
    fn test_l2cap_listener_lifecycle() {
        let mut host = MockHostBluetoothStack::new();
        host.expect_open_gatt_server().returning(|events| {
            let mut handle = MockGattServerHandle::new();
            handle.expect_add_service().returning(move |_| {
                events.on_service_added(true);
                Ok(())
            });
            handle.expect_close().returning(|| ());
            Ok(Arc::new(handle) as Arc<dyn GattServerHandle>)
        });
        host.expect_listen_l2cap().times(1).returning(|| {
            let mut listener = MockL2capListener::new();
            listener.expect_psm().return_const(0x0081u16);
            // Close failure must not escape stop()
            listener
                .expect_close()
                .times(1)
                .returning(|| Err(HostError::Io("socket already closed".to_string())));
            Ok(Box::new(listener) as Box<dyn L2capListener>)
        });

        let server = server_with(host, quick_config().with_l2cap(true));
        server.start(b"peer-a").expect("Start");
        assert_eq!(server.l2cap_psm(), Some(0x0081));

        server.stop();
        assert_eq!(server.l2cap_psm(), None);
        assert_eq!(server.state(), LifecycleState::Uninitialized);
    }

    #[test]
    fn test_closed_server_cannot_complete_retry() {
        let opened: Arc<Mutex<Vec<ServerEvents>>> = Arc::new(Mutex::new(Vec::new()));
        let slot = opened.clone();

        let mut host = MockHostBluetoothStack::new();
        host.expect_open_gatt_server().times(2).returning(move |events| {
            slot.lock().push(events);
            let previous = slot.clone();
            let mut handle = MockGattServerHandle::new();
            handle.expect_add_service().returning(move |_| {
                // The first server answers only once the retry is waiting
                let servers = previous.lock();
                if servers.len() > 1 {
                    servers[0].on_service_added(true);
                }
                Ok(())
            });
            handle.expect_close().returning(|| ());
            Ok(Arc::new(handle) as Arc<dyn GattServerHandle>)
        });

        let server = server_with(host, quick_config());
        assert!(matches!(
            server.start(b"peer-a"),
            Err(DriverError::RegistrationFailure(_))
        ));

        match server.start(b"peer-a") {
            Err(DriverError::RegistrationFailure(msg)) => {
                assert!(msg.contains("no answer"), "got {}", msg)
            }
            other => panic!("Expected RegistrationFailure, got {:?}", other),
        }
        assert!(!server.is_started());
        let generations: Vec<u64> = opened.lock().iter().map(|e| e.generation()).collect();
        assert_eq!(generations.len(), 2);
        assert_ne!(generations[0], generations[1]);
    }

    #[test]
    fn test_stop_keeps_gate_armed_by_later_start() {
        let server = server_with(MockHostBluetoothStack::new(), quick_config());
        server.initialize().expect("Initialize");
        let armed = server.state.lock().generation;
        server.stop();

        // Re-initialized after the stop; a repeated stop of the old
        // generation must not touch the new gate
        server.initialize().expect("Initialize again");
        let current = server.state.lock().generation;
        assert_ne!(armed, current);
        assert!(!server.bridge().retire(armed));
        assert!(server.bridge().is_live(current));
    }

    #[test]
    fn test_stop_when_uninitialized_is_noop() {
        let server = server_with(MockHostBluetoothStack::new(), quick_config());
        server.stop();
        assert_eq!(server.state(), LifecycleState::Uninitialized);
    }
}
