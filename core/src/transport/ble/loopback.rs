//! In-memory host stack.
//!
//! `LoopbackHost` behaves like a platform BLE stack without a radio: it
//! answers registrations and confirms notifications from its own threads,
//! after a configurable delay, and can be told to misbehave (reject, stay
//! silent, drop, fail or hold back a given chunk). It also plays the remote centrals,
//! so tests and the CLI can connect, negotiate MTU, read and write.

use super::bridge::ServerEvents;
use super::gatt::{GattCharacteristic, GattService, GattStatus};
use super::host::{GattServerHandle, HostBluetoothStack, HostError, L2capListener};
use super::registry::{DeviceAddress, PeerDevice};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// How the loopback answers a service registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationBehavior {
    Accept,
    /// Submission accepted, then reported as failed
    Reject,
    /// Submission accepted, no answer ever
    NeverAnswer,
    /// `add_service` itself fails
    RefuseSubmit,
}

/// How the loopback treats notifications. Chunk indices count per device,
/// from 0, across the whole life of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    AckAll,
    /// Accept the notification but never confirm it
    DropChunk(usize),
    /// Confirm with a failure status
    FailChunk(usize),
    /// Refuse the notify call
    RejectChunk(usize),
    /// Confirm after this delay instead of the host's usual one
    DelayChunk(usize, Duration),
}

/// A notification the host accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub device: DeviceAddress,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

struct LoopbackState {
    registration: RegistrationBehavior,
    ack_policy: AckPolicy,
    delay: Duration,
    l2cap_psm: Option<u16>,
    events: Option<ServerEvents>,
    sent: Vec<SentNotification>,
    notify_counts: HashMap<DeviceAddress, usize>,
    servers_opened: usize,
    servers_closed: usize,
    services_added: usize,
    l2cap_closed: usize,
}

#[derive(Clone)]
pub struct LoopbackHost {
    state: Arc<Mutex<LoopbackState>>,
}

impl Default for LoopbackHost {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopbackState {
                registration: RegistrationBehavior::Accept,
                ack_policy: AckPolicy::AckAll,
                delay: Duration::from_millis(5),
                l2cap_psm: None,
                events: None,
                sent: Vec::new(),
                notify_counts: HashMap::new(),
                servers_opened: 0,
                servers_closed: 0,
                services_added: 0,
                l2cap_closed: 0,
            })),
        }
    }

    /// Advertise L2CAP support on `psm`
    pub fn with_l2cap(self, psm: u16) -> Self {
        self.state.lock().l2cap_psm = Some(psm);
        self
    }

    /// Delay before each asynchronous answer
    pub fn with_delay(self, delay: Duration) -> Self {
        self.state.lock().delay = delay;
        self
    }

    /// Change the answer delay; applies to answers scheduled from now on
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    pub fn set_registration(&self, behavior: RegistrationBehavior) {
        self.state.lock().registration = behavior;
    }

    pub fn set_ack_policy(&self, policy: AckPolicy) {
        self.state.lock().ack_policy = policy;
    }

    // ------------------------------------------------------------------------
    // OBSERVATION
    // ------------------------------------------------------------------------

    pub fn sent(&self) -> Vec<SentNotification> {
        self.state.lock().sent.clone()
    }

    /// Values notified to `address`, in order
    pub fn sent_to(&self, address: &DeviceAddress) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|n| &n.device == address)
            .map(|n| n.value.clone())
            .collect()
    }

    pub fn servers_opened(&self) -> usize {
        self.state.lock().servers_opened
    }

    pub fn servers_closed(&self) -> usize {
        self.state.lock().servers_closed
    }

    pub fn services_added(&self) -> usize {
        self.state.lock().services_added
    }

    pub fn l2cap_closed(&self) -> usize {
        self.state.lock().l2cap_closed
    }

    // ------------------------------------------------------------------------
    // SIMULATED CENTRALS
    // ------------------------------------------------------------------------

    /// Callbacks of the most recently opened server
    fn events(&self) -> Option<ServerEvents> {
        self.state.lock().events.clone()
    }

    /// Connect a central and negotiate `mtu`; `None` before any server is open
    pub fn connect_central(&self, address: &str, mtu: u16) -> Option<PeerDevice> {
        let events = self.events()?;
        let address = DeviceAddress::new(address);
        events.on_connection_state_change(&address, true);
        events.on_mtu_changed(&address, mtu);
        events.registry().get(&address)
    }

    pub fn disconnect_central(&self, address: &DeviceAddress) {
        if let Some(events) = self.events() {
            events.on_connection_state_change(address, false);
        }
    }

    pub fn central_read(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
        offset: usize,
    ) -> Option<Result<Vec<u8>, GattStatus>> {
        let events = self.events()?;
        Some(events.on_characteristic_read_request(address, characteristic, offset))
    }

    pub fn central_write(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
        value: &[u8],
    ) -> Option<GattStatus> {
        let events = self.events()?;
        Some(events.on_characteristic_write_request(address, characteristic, value))
    }
}

impl HostBluetoothStack for LoopbackHost {
    fn open_gatt_server(
        &self,
        events: ServerEvents,
    ) -> Result<Arc<dyn GattServerHandle>, HostError> {
        let mut state = self.state.lock();
        state.events = Some(events.clone());
        state.servers_opened += 1;
        debug!(
            "Loopback GATT server #{} opened (generation {})",
            state.servers_opened,
            events.generation()
        );
        Ok(Arc::new(LoopbackServer {
            host: self.clone(),
            events,
        }))
    }

    fn listen_l2cap(&self) -> Result<Box<dyn L2capListener>, HostError> {
        match self.state.lock().l2cap_psm {
            Some(psm) => Ok(Box::new(LoopbackL2cap {
                host: self.clone(),
                psm,
            })),
            None => Err(HostError::Unsupported("L2CAP channels".to_string())),
        }
    }
}

struct LoopbackServer {
    host: LoopbackHost,
    events: ServerEvents,
}

impl LoopbackServer {
    /// Answer through this server's callbacks after the host delay
    fn later(&self, task: impl FnOnce(&ServerEvents) + Send + 'static) {
        let delay = self.host.state.lock().delay;
        self.later_by(delay, task);
    }

    fn later_by(&self, delay: Duration, task: impl FnOnce(&ServerEvents) + Send + 'static) {
        let events = self.events.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            task(&events);
        });
    }
}

impl GattServerHandle for LoopbackServer {
    fn add_service(&self, service: &GattService) -> Result<(), HostError> {
        let behavior = {
            let mut state = self.host.state.lock();
            state.services_added += 1;
            state.registration
        };
        debug!("Loopback add_service {} ({:?})", service.uuid(), behavior);
        match behavior {
            RegistrationBehavior::Accept => self.later(|e| e.on_service_added(true)),
            RegistrationBehavior::Reject => self.later(|e| e.on_service_added(false)),
            RegistrationBehavior::NeverAnswer => {}
            RegistrationBehavior::RefuseSubmit => {
                return Err(HostError::Rejected("service not accepted".to_string()))
            }
        }
        Ok(())
    }

    fn notify_characteristic_changed(
        &self,
        device: &DeviceAddress,
        characteristic: &GattCharacteristic,
        value: &[u8],
        _confirm: bool,
    ) -> Result<(), HostError> {
        let reply = {
            let mut state = self.host.state.lock();
            let count = state.notify_counts.entry(device.clone()).or_insert(0);
            let index = *count;
            *count += 1;

            let reply = match state.ack_policy {
                AckPolicy::RejectChunk(k) if k == index => {
                    return Err(HostError::Rejected("notification queue full".to_string()))
                }
                AckPolicy::DropChunk(k) if k == index => None,
                AckPolicy::FailChunk(k) if k == index => Some((GattStatus::Failure, state.delay)),
                AckPolicy::DelayChunk(k, delay) if k == index => Some((GattStatus::Success, delay)),
                _ => Some((GattStatus::Success, state.delay)),
            };
            state.sent.push(SentNotification {
                device: device.clone(),
                characteristic: characteristic.uuid(),
                value: value.to_vec(),
            });
            reply
        };

        if let Some((status, delay)) = reply {
            let device = device.clone();
            self.later_by(delay, move |e| e.on_notification_sent(&device, status));
        }
        Ok(())
    }

    fn close(&self) {
        let mut state = self.host.state.lock();
        state.servers_closed += 1;
        debug!("Loopback GATT server closed ({} total)", state.servers_closed);
    }
}

struct LoopbackL2cap {
    host: LoopbackHost,
    psm: u16,
}

impl L2capListener for LoopbackL2cap {
    fn psm(&self) -> u16 {
        self.psm
    }

    fn close(&mut self) -> Result<(), HostError> {
        self.host.state.lock().l2cap_closed += 1;
        Ok(())
    }
}
