//! Event bridge between the host stack's callbacks and the blocking driver.
//!
//! The host calls the `on_*` methods from its own threads. Lifecycle and
//! delivery callbacks resolve one-shot gates the driver is blocked on; the
//! peer-facing read/write callbacks serve the identity exchange and hand
//! inbound bytes to the layer above.
//!
//! Acknowledgement gates are keyed by device and tagged with the operation's
//! sequence id, so a confirmation for one peer can never release a writer
//! waiting on another. A chunk whose wait timed out leaves an orphan behind:
//! its confirmation may still arrive, and it must not be credited to the
//! chunk sent after it.
//!
//! The host never sees the bridge directly. Each opened server gets a
//! `ServerEvents` handle stamped with the server generation, and answers from
//! a server that has since been stopped are dropped.

use super::gate::{one_shot, GateSignal, GateWaiter};
use super::gatt::{GattStatus, CCC_DESCRIPTOR_UUID, PEER_ID_CHARACTERISTIC_UUID, WRITER_CHARACTERISTIC_UUID};
use super::registry::{ConnectionRegistry, DeviceAddress, NotificationMode};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Bytes a central wrote into the writer characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundChunk {
    pub address: DeviceAddress,
    pub data: Vec<u8>,
}

struct PendingAck {
    seq: u64,
    signal: GateSignal<GattStatus>,
}

/// Confirmation bookkeeping for one device
#[derive(Default)]
struct DeviceAcks {
    pending: Option<PendingAck>,
    /// Deadlines of timed-out chunks whose confirmation is still owed
    orphans: VecDeque<Instant>,
}

impl DeviceAcks {
    fn expire_orphans(&mut self, now: Instant) {
        while self.orphans.front().is_some_and(|deadline| *deadline <= now) {
            self.orphans.pop_front();
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_none() && self.orphans.is_empty()
    }
}

/// What a confirmation turned out to answer
enum Delivery {
    Current(PendingAck),
    Late,
    Unexpected,
}

/// Registration gate plus the generation whose answers are still wanted
#[derive(Default)]
struct RegistrationSlot {
    live: Option<u64>,
    pending: Option<GateSignal<bool>>,
}

pub struct EventBridge {
    registry: Arc<ConnectionRegistry>,
    local_peer_id: Mutex<Vec<u8>>,
    registration: Mutex<RegistrationSlot>,
    acks: Mutex<HashMap<DeviceAddress, DeviceAcks>>,
    inbound: Mutex<Option<UnboundedSender<InboundChunk>>>,
}

impl EventBridge {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            local_peer_id: Mutex::new(Vec::new()),
            registration: Mutex::new(RegistrationSlot::default()),
            acks: Mutex::new(HashMap::new()),
            inbound: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Route data written by centrals to `tx`
    pub fn set_inbound_channel(&self, tx: UnboundedSender<InboundChunk>) {
        *self.inbound.lock() = Some(tx);
    }

    pub fn local_peer_id(&self) -> Vec<u8> {
        self.local_peer_id.lock().clone()
    }

    pub(crate) fn set_local_peer_id(&self, peer_id: &[u8]) {
        *self.local_peer_id.lock() = peer_id.to_vec();
    }

    // ------------------------------------------------------------------------
    // GATES (driver side)
    // ------------------------------------------------------------------------

    /// Arm a fresh registration gate for `generation`. A previously armed
    /// one is abandoned.
    pub(crate) fn arm_registration(&self, generation: u64) -> GateWaiter<bool> {
        let (signal, waiter) = one_shot();
        let previous = {
            let mut slot = self.registration.lock();
            slot.live = Some(generation);
            slot.pending.replace(signal)
        };
        drop(previous);
        waiter
    }

    /// Stop listening to `generation`, abandoning its registration gate if
    /// still armed. Leaves a newer generation alone. Returns true if a gate
    /// was abandoned.
    pub(crate) fn retire(&self, generation: u64) -> bool {
        let previous = {
            let mut slot = self.registration.lock();
            if slot.live != Some(generation) {
                return false;
            }
            slot.live = None;
            slot.pending.take()
        };
        previous.is_some()
    }

    /// Whether answers stamped with `generation` are still wanted
    pub(crate) fn is_live(&self, generation: u64) -> bool {
        self.registration.lock().live == Some(generation)
    }

    pub(crate) fn arm_ack(&self, address: &DeviceAddress, seq: u64) -> GateWaiter<GattStatus> {
        let (signal, waiter) = one_shot();
        let previous = self
            .acks
            .lock()
            .entry(address.clone())
            .or_default()
            .pending
            .replace(PendingAck { seq, signal });
        if let Some(previous) = previous {
            warn!(
                "Replacing pending ack for {} (op {} → op {})",
                address, previous.seq, seq
            );
        }
        waiter
    }

    /// Remove the pending ack for `address` if it still belongs to `seq`.
    /// Used when the host refused the notification, so no confirmation is owed.
    pub(crate) fn disarm_ack(&self, address: &DeviceAddress, seq: u64) {
        let removed = {
            let mut acks = self.acks.lock();
            let Some(entry) = acks.get_mut(address) else {
                return;
            };
            if entry.pending.as_ref().map(|p| p.seq) != Some(seq) {
                return;
            }
            let removed = entry.pending.take();
            if entry.is_idle() {
                acks.remove(address);
            }
            removed
        };
        drop(removed);
    }

    /// Give up on `seq` after its wait timed out. Its confirmation is still
    /// owed and will be discarded if it turns up within `grace`. Returns true
    /// if `seq` was the pending ack.
    pub(crate) fn orphan_ack(&self, address: &DeviceAddress, seq: u64, grace: Duration) -> bool {
        let removed = {
            let mut acks = self.acks.lock();
            let Some(entry) = acks.get_mut(address) else {
                return false;
            };
            if entry.pending.as_ref().map(|p| p.seq) != Some(seq) {
                return false;
            }
            entry.orphans.push_back(Instant::now() + grace);
            entry.pending.take()
        };
        drop(removed);
        true
    }

    /// Abandon every pending ack so in-flight writers stop waiting. Owed
    /// confirmations are forgotten too.
    pub(crate) fn abandon_all_acks(&self) -> usize {
        let drained: Vec<_> = self.acks.lock().drain().collect();
        drained
            .iter()
            .filter(|(_, entry)| entry.pending.is_some())
            .count()
    }

    // ------------------------------------------------------------------------
    // HOST CALLBACKS
    // ------------------------------------------------------------------------

    /// Service registration for `generation` finished
    pub(crate) fn service_added(&self, generation: u64, success: bool) {
        let pending = {
            let mut slot = self.registration.lock();
            if slot.live != Some(generation) {
                None
            } else {
                Some(slot.pending.take())
            }
        };
        match pending {
            Some(Some(signal)) => {
                info!("GATT service registration completed: success={}", success);
                signal.fire(success);
            }
            Some(None) => warn!("Service registration result with no pending start"),
            None => debug!(
                "Ignoring registration result from stopped server (generation {})",
                generation
            ),
        }
    }

    /// A notification/indication to `address` was delivered (or failed)
    pub(crate) fn notification_sent(&self, address: &DeviceAddress, status: GattStatus) {
        trace!("Notification sent to {}: {:?}", address, status);
        let resolved = {
            let mut acks = self.acks.lock();
            match acks.get_mut(address) {
                None => None,
                Some(entry) => {
                    entry.expire_orphans(Instant::now());
                    let resolved = if entry.orphans.pop_front().is_some() {
                        Delivery::Late
                    } else {
                        match entry.pending.take() {
                            Some(pending) => Delivery::Current(pending),
                            None => Delivery::Unexpected,
                        }
                    };
                    if entry.is_idle() {
                        acks.remove(address);
                    }
                    Some(resolved)
                }
            }
        };
        match resolved {
            Some(Delivery::Current(pending)) => pending.signal.fire(status),
            Some(Delivery::Late) => debug!(
                "Discarding late confirmation from {} for a timed-out chunk ({:?})",
                address, status
            ),
            Some(Delivery::Unexpected) | None => debug!(
                "Ignoring notification confirmation from {} with no pending write",
                address
            ),
        }
    }

    pub fn on_connection_state_change(&self, address: &DeviceAddress, connected: bool) {
        info!(
            "Device {} {}",
            address,
            if connected { "connected" } else { "disconnected" }
        );
        self.registry.set_connected(address, connected);
        if !connected {
            let removed = self.acks.lock().remove(address);
            if let Some(pending) = removed.and_then(|entry| entry.pending) {
                debug!("Abandoning pending ack op {} for {}", pending.seq, address);
            }
        }
    }

    pub fn on_mtu_changed(&self, address: &DeviceAddress, mtu: u16) {
        debug!("MTU for {} changed to {}", address, mtu);
        self.registry.set_mtu(address, mtu);
    }

    /// A central reads a characteristic
    pub fn on_characteristic_read_request(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
        offset: usize,
    ) -> Result<Vec<u8>, GattStatus> {
        if characteristic != PEER_ID_CHARACTERISTIC_UUID {
            warn!("Read of {} from {} not permitted", characteristic, address);
            return Err(GattStatus::ReadNotPermitted);
        }
        let peer_id = self.local_peer_id.lock();
        if offset > peer_id.len() {
            return Err(GattStatus::InvalidOffset);
        }
        debug!("Serving local peer id to {} (offset {})", address, offset);
        Ok(peer_id[offset..].to_vec())
    }

    /// A central writes a characteristic
    pub fn on_characteristic_write_request(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
        value: &[u8],
    ) -> GattStatus {
        if characteristic == PEER_ID_CHARACTERISTIC_UUID {
            info!("Received peer id from {} ({} bytes)", address, value.len());
            self.registry.set_remote_peer_id(address, value);
            return GattStatus::Success;
        }

        if characteristic == WRITER_CHARACTERISTIC_UUID {
            trace!(
                "Inbound chunk from {}: hex={} length={}",
                address,
                hex::encode(value),
                value.len()
            );
            let inbound = self.inbound.lock();
            match inbound.as_ref() {
                Some(tx) => {
                    let chunk = InboundChunk {
                        address: address.clone(),
                        data: value.to_vec(),
                    };
                    if tx.send(chunk).is_err() {
                        warn!("Inbound receiver dropped; discarding chunk from {}", address);
                    }
                }
                None => warn!("No inbound channel; discarding chunk from {}", address),
            }
            return GattStatus::Success;
        }

        warn!("Write to unknown characteristic {} from {}", characteristic, address);
        GattStatus::RequestNotSupported
    }

    /// A central writes a descriptor (subscription changes)
    pub fn on_descriptor_write_request(
        &self,
        address: &DeviceAddress,
        descriptor: Uuid,
        value: &[u8],
    ) -> GattStatus {
        if descriptor != CCC_DESCRIPTOR_UUID {
            return GattStatus::RequestNotSupported;
        }
        match NotificationMode::from_ccc_value(value) {
            Some(mode) => {
                debug!("{} set notification mode {:?}", address, mode);
                self.registry.set_notification_mode(address, mode);
                GattStatus::Success
            }
            None => GattStatus::WriteNotPermitted,
        }
    }
}

/// Callback handle for one opened GATT server.
///
/// Handed to the host by `open_gatt_server`. Registration and delivery
/// answers are stamped with the generation of the server that produced them,
/// so a server closed by `stop()` cannot complete a later `start()`.
#[derive(Clone)]
pub struct ServerEvents {
    bridge: Arc<EventBridge>,
    generation: u64,
}

impl ServerEvents {
    pub(crate) fn new(bridge: Arc<EventBridge>, generation: u64) -> Self {
        Self { bridge, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.bridge.registry()
    }

    /// Service registration finished
    pub fn on_service_added(&self, success: bool) {
        self.bridge.service_added(self.generation, success);
    }

    /// A notification/indication to `address` was delivered (or failed)
    pub fn on_notification_sent(&self, address: &DeviceAddress, status: GattStatus) {
        if !self.bridge.is_live(self.generation) {
            debug!(
                "Ignoring confirmation from {} on stopped server (generation {})",
                address, self.generation
            );
            return;
        }
        self.bridge.notification_sent(address, status);
    }

    pub fn on_connection_state_change(&self, address: &DeviceAddress, connected: bool) {
        self.bridge.on_connection_state_change(address, connected);
    }

    pub fn on_mtu_changed(&self, address: &DeviceAddress, mtu: u16) {
        self.bridge.on_mtu_changed(address, mtu);
    }

    pub fn on_characteristic_read_request(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
        offset: usize,
    ) -> Result<Vec<u8>, GattStatus> {
        self.bridge
            .on_characteristic_read_request(address, characteristic, offset)
    }

    pub fn on_characteristic_write_request(
        &self,
        address: &DeviceAddress,
        characteristic: Uuid,
        value: &[u8],
    ) -> GattStatus {
        self.bridge
            .on_characteristic_write_request(address, characteristic, value)
    }

    pub fn on_descriptor_write_request(
        &self,
        address: &DeviceAddress,
        descriptor: Uuid,
        value: &[u8],
    ) -> GattStatus {
        self.bridge
            .on_descriptor_write_request(address, descriptor, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ble::gate::GateError;
    use std::time::Duration;

    fn bridge() -> EventBridge {
        EventBridge::new(Arc::new(ConnectionRegistry::new()))
    }

    const GRACE: Duration = Duration::from_secs(5);

    #[test]
    fn test_registration_gate_fires_once() {
        let bridge = Arc::new(bridge());
        let waiter = bridge.arm_registration(1);
        let events = ServerEvents::new(bridge.clone(), 1);
        events.on_service_added(true);
        assert_eq!(waiter.wait_timeout(Duration::from_secs(1)), Ok(true));

        // A late duplicate callback finds nothing armed
        events.on_service_added(false);
        assert!(!bridge.retire(1));
    }

    #[test]
    fn test_retire_wakes_waiter() {
        let bridge = bridge();
        let waiter = bridge.arm_registration(3);
        assert!(bridge.retire(3));
        assert!(!bridge.is_live(3));
        assert_eq!(
            waiter.wait_timeout(Duration::from_secs(1)),
            Err(GateError::Abandoned)
        );
    }

    #[test]
    fn test_retire_leaves_newer_generation_armed() {
        let bridge = Arc::new(bridge());
        let waiter = bridge.arm_registration(1);

        // A stop of generation 0 lands after generation 1 armed its gate
        assert!(!bridge.retire(0));
        ServerEvents::new(bridge.clone(), 1).on_service_added(true);
        assert_eq!(waiter.wait_timeout(Duration::from_secs(1)), Ok(true));
    }

    #[test]
    fn test_stale_registration_answer_ignored() {
        let bridge = Arc::new(bridge());
        let stale = ServerEvents::new(bridge.clone(), 0);
        let waiter = bridge.arm_registration(1);

        stale.on_service_added(true);
        assert_eq!(
            waiter.wait_timeout(Duration::from_millis(30)),
            Err(GateError::TimedOut(Duration::from_millis(30)))
        );

        let waiter = bridge.arm_registration(1);
        stale.on_service_added(true);
        ServerEvents::new(bridge.clone(), 1).on_service_added(false);
        assert_eq!(waiter.wait_timeout(Duration::from_secs(1)), Ok(false));
    }

    #[test]
    fn test_stale_confirmation_ignored() {
        let bridge = Arc::new(bridge());
        let device = DeviceAddress::new("AA:00:00:00:00:01");
        let _registration = bridge.arm_registration(2);
        let waiter = bridge.arm_ack(&device, 9);

        ServerEvents::new(bridge.clone(), 1).on_notification_sent(&device, GattStatus::Failure);
        ServerEvents::new(bridge.clone(), 2).on_notification_sent(&device, GattStatus::Success);
        assert_eq!(
            waiter.wait_timeout(Duration::from_secs(1)),
            Ok(GattStatus::Success)
        );
    }

    #[test]
    fn test_ack_routed_by_device() {
        let bridge = bridge();
        let alice = DeviceAddress::new("AA:00:00:00:00:01");
        let bob = DeviceAddress::new("BB:00:00:00:00:02");

        let alice_waiter = bridge.arm_ack(&alice, 1);
        let bob_waiter = bridge.arm_ack(&bob, 2);

        bridge.notification_sent(&bob, GattStatus::Success);
        assert_eq!(
            bob_waiter.wait_timeout(Duration::from_secs(1)),
            Ok(GattStatus::Success)
        );
        // Bob's confirmation did not touch Alice's gate
        assert_eq!(
            alice_waiter.wait_timeout(Duration::from_millis(30)),
            Err(GateError::TimedOut(Duration::from_millis(30)))
        );
    }

    #[test]
    fn test_disarm_only_matching_op() {
        let bridge = bridge();
        let device = DeviceAddress::new("AA:00:00:00:00:01");
        let waiter = bridge.arm_ack(&device, 5);

        bridge.disarm_ack(&device, 4);
        bridge.notification_sent(&device, GattStatus::Success);
        assert_eq!(
            waiter.wait_timeout(Duration::from_secs(1)),
            Ok(GattStatus::Success)
        );
    }

    #[test]
    fn test_late_confirmation_not_credited_to_next_chunk() {
        let bridge = bridge();
        let device = DeviceAddress::new("AA:00:00:00:00:01");

        let first = bridge.arm_ack(&device, 1);
        assert_eq!(
            first.wait_timeout(Duration::from_millis(10)),
            Err(GateError::TimedOut(Duration::from_millis(10)))
        );
        assert!(bridge.orphan_ack(&device, 1, GRACE));
        assert!(!bridge.orphan_ack(&device, 1, GRACE));

        let second = bridge.arm_ack(&device, 2);
        // Confirmation for op 1 arrives first and is swallowed
        bridge.notification_sent(&device, GattStatus::Failure);
        assert_eq!(
            second.wait_timeout(Duration::from_millis(30)),
            Err(GateError::TimedOut(Duration::from_millis(30)))
        );

        let third = bridge.arm_ack(&device, 3);
        bridge.notification_sent(&device, GattStatus::Success);
        assert_eq!(
            third.wait_timeout(Duration::from_secs(1)),
            Ok(GattStatus::Success)
        );
    }

    #[test]
    fn test_owed_confirmation_expires() {
        let bridge = bridge();
        let device = DeviceAddress::new("AA:00:00:00:00:01");

        let _first = bridge.arm_ack(&device, 1);
        assert!(bridge.orphan_ack(&device, 1, Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(30));

        // Past its grace period the lost confirmation is no longer expected
        let second = bridge.arm_ack(&device, 2);
        bridge.notification_sent(&device, GattStatus::Success);
        assert_eq!(
            second.wait_timeout(Duration::from_secs(1)),
            Ok(GattStatus::Success)
        );
    }

    #[test]
    fn test_disconnect_forgets_owed_confirmations() {
        let bridge = bridge();
        let device = DeviceAddress::new("AA:00:00:00:00:01");
        bridge.on_connection_state_change(&device, true);

        let _first = bridge.arm_ack(&device, 1);
        assert!(bridge.orphan_ack(&device, 1, GRACE));
        bridge.on_connection_state_change(&device, false);
        bridge.on_connection_state_change(&device, true);

        let next = bridge.arm_ack(&device, 2);
        bridge.notification_sent(&device, GattStatus::Success);
        assert_eq!(
            next.wait_timeout(Duration::from_secs(1)),
            Ok(GattStatus::Success)
        );
    }

    #[test]
    fn test_abandon_all_counts_only_waiting_writers() {
        let bridge = bridge();
        let alice = DeviceAddress::new("AA:00:00:00:00:01");
        let bob = DeviceAddress::new("BB:00:00:00:00:02");

        let waiter = bridge.arm_ack(&alice, 1);
        let _timed_out = bridge.arm_ack(&bob, 2);
        assert!(bridge.orphan_ack(&bob, 2, GRACE));

        assert_eq!(bridge.abandon_all_acks(), 1);
        assert_eq!(
            waiter.wait_timeout(Duration::from_secs(1)),
            Err(GateError::Abandoned)
        );
    }

    #[test]
    fn test_disconnect_abandons_pending_ack() {
        let bridge = bridge();
        let device = DeviceAddress::new("AA:00:00:00:00:01");
        bridge.on_connection_state_change(&device, true);
        let waiter = bridge.arm_ack(&device, 1);

        bridge.on_connection_state_change(&device, false);
        assert_eq!(
            waiter.wait_timeout(Duration::from_secs(1)),
            Err(GateError::Abandoned)
        );
        assert!(bridge
            .registry()
            .get(&device)
            .expect("Known device")
            .is_server_disconnected());
    }

    #[test]
    fn test_peer_id_read_with_offset() {
        let bridge = bridge();
        let device = DeviceAddress::new("AA:00:00:00:00:01");
        bridge.set_local_peer_id(b"12D3KooW");

        assert_eq!(
            bridge.on_characteristic_read_request(&device, PEER_ID_CHARACTERISTIC_UUID, 0),
            Ok(b"12D3KooW".to_vec())
        );
        assert_eq!(
            bridge.on_characteristic_read_request(&device, PEER_ID_CHARACTERISTIC_UUID, 4),
            Ok(b"KooW".to_vec())
        );
        assert_eq!(
            bridge.on_characteristic_read_request(&device, PEER_ID_CHARACTERISTIC_UUID, 9),
            Err(GattStatus::InvalidOffset)
        );
        assert_eq!(
            bridge.on_characteristic_read_request(&device, WRITER_CHARACTERISTIC_UUID, 0),
            Err(GattStatus::ReadNotPermitted)
        );
    }

    #[test]
    fn test_peer_id_write_recorded() {
        let bridge = bridge();
        let device = DeviceAddress::new("AA:00:00:00:00:01");
        let status =
            bridge.on_characteristic_write_request(&device, PEER_ID_CHARACTERISTIC_UUID, b"remote");
        assert!(status.is_success());
        assert_eq!(
            bridge.registry().get(&device).and_then(|d| d.remote_peer_id()),
            Some(b"remote".to_vec())
        );
    }

    #[test]
    fn test_inbound_chunk_forwarded() {
        let bridge = bridge();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bridge.set_inbound_channel(tx);
        let device = DeviceAddress::new("AA:00:00:00:00:01");

        let status =
            bridge.on_characteristic_write_request(&device, WRITER_CHARACTERISTIC_UUID, &[1, 2, 3]);
        assert!(status.is_success());
        assert_eq!(
            rx.try_recv().expect("Chunk forwarded"),
            InboundChunk {
                address: device,
                data: vec![1, 2, 3]
            }
        );
    }

    #[test]
    fn test_unknown_characteristic_write() {
        let bridge = bridge();
        let device = DeviceAddress::new("AA:00:00:00:00:01");
        assert_eq!(
            bridge.on_characteristic_write_request(&device, Uuid::nil(), b"x"),
            GattStatus::RequestNotSupported
        );
    }

    #[test]
    fn test_ccc_descriptor_write() {
        let bridge = bridge();
        let device = DeviceAddress::new("AA:00:00:00:00:01");
        assert!(bridge
            .on_descriptor_write_request(&device, CCC_DESCRIPTOR_UUID, &[0x02, 0x00])
            .is_success());
        assert_eq!(
            bridge
                .registry()
                .get(&device)
                .map(|d| d.notifications_enabled()),
            Some(NotificationMode::Indicate)
        );
        assert_eq!(
            bridge.on_descriptor_write_request(&device, CCC_DESCRIPTOR_UUID, &[0xFF]),
            GattStatus::WriteNotPermitted
        );
    }
}
