/// Fragmented, flow-controlled notification writer
///
/// A payload is cut into chunks of `MTU - 3` bytes and pushed to one device a
/// chunk at a time. Each chunk is written into the writer characteristic,
/// notified with confirmation, and must be acknowledged before the next one
/// goes out. The first failing chunk aborts the whole call; chunks already
/// delivered are not retracted.

use super::gate::GateError;
use super::gatt::{GattCharacteristic, ATT_HEADER_SIZE, DEFAULT_ATT_MTU, MAX_ATTRIBUTE_VALUE_LEN};
use super::host::GattServerHandle;
use super::registry::{DeviceAddress, PeerDevice};
use super::server::GattServer;
use crate::error::DriverError;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Payload bytes that fit in one notification on a link with this MTU
pub fn effective_chunk_size(mtu: u16) -> usize {
    (usize::from(mtu.max(DEFAULT_ATT_MTU)) - ATT_HEADER_SIZE).min(MAX_ATTRIBUTE_VALUE_LEN)
}

/// Split `payload` the way `write_and_notify` sends it
pub fn chunks_for_mtu(payload: &[u8], mtu: u16) -> std::slice::Chunks<'_, u8> {
    payload.chunks(effective_chunk_size(mtu))
}

/// Resolution of one chunk send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Pending,
    Acknowledged,
    Rejected,
    TimedOut,
    Interrupted,
}

/// One chunk in flight; lives only for the duration of its send
#[derive(Debug)]
pub struct WriteOperation {
    pub seq: u64,
    pub device: DeviceAddress,
    pub chunk_index: usize,
    pub len: usize,
    pub issued_at: Instant,
    pub outcome: WriteOutcome,
}

impl WriteOperation {
    fn new(seq: u64, device: DeviceAddress, chunk_index: usize, len: usize) -> Self {
        Self {
            seq,
            device,
            chunk_index,
            len,
            issued_at: Instant::now(),
            outcome: WriteOutcome::Pending,
        }
    }

    fn resolve(&mut self, outcome: WriteOutcome) {
        self.outcome = outcome;
        trace!(
            "op {} chunk {} to {}: {:?} after {:?}",
            self.seq,
            self.chunk_index,
            self.device,
            outcome,
            self.issued_at.elapsed()
        );
    }
}

impl GattServer {
    /// Send `payload` to `device` as a sequence of acknowledged notifications.
    ///
    /// Preconditions are checked in order: server started, device connected,
    /// writer characteristic present. An empty payload succeeds without
    /// sending anything. Calls to the same device are serialized; calls to
    /// different devices run concurrently.
    pub fn write_and_notify(&self, device: &PeerDevice, payload: &[u8]) -> Result<(), DriverError> {
        let address = device.address();
        trace!(
            "writeAndNotify: device={} hex={} length={}",
            address,
            hex::encode(payload),
            payload.len()
        );

        let snapshot = self.write_snapshot();
        let server = snapshot.server.ok_or_else(|| {
            error!("writeAndNotify: GATT server is not running");
            DriverError::NotStarted
        })?;

        if device.is_server_disconnected() {
            error!("writeAndNotify: device {} is disconnected", address);
            return Err(DriverError::DeviceDisconnected(address.clone()));
        }

        let writer = snapshot.writer.ok_or_else(|| {
            error!("writeAndNotify: writer characteristic is not initialized");
            DriverError::CharacteristicUnavailable
        })?;

        if payload.is_empty() {
            debug!("writeAndNotify: empty payload for {}, nothing to send", address);
            return Ok(());
        }

        let device_lock = self.device_lock(address);
        let result = {
            let _serialized = device_lock.lock();
            self.send_chunks(snapshot.generation, server.as_ref(), &writer, device, payload)
        };
        drop(device_lock);
        self.prune_device_lock(address);
        result
    }

    fn send_chunks(
        &self,
        generation: u64,
        server: &dyn GattServerHandle,
        writer: &GattCharacteristic,
        device: &PeerDevice,
        payload: &[u8],
    ) -> Result<(), DriverError> {
        let address = device.address();
        let mtu = device.mtu();
        let chunk_size = effective_chunk_size(mtu);
        let total = payload.len().div_ceil(chunk_size);
        debug!(
            "writeAndNotify: {} bytes to {} as {} chunk(s) of <= {} (MTU {})",
            payload.len(),
            address,
            total,
            chunk_size,
            mtu
        );

        for (index, chunk) in payload.chunks(chunk_size).enumerate() {
            if !self.is_live(generation) {
                warn!(
                    "writeAndNotify: server stopped after {}/{} chunks to {}",
                    index, total, address
                );
                return Err(DriverError::NotStarted);
            }
            self.send_chunk(server, writer, address, index, chunk)?;
        }

        Ok(())
    }

    fn send_chunk(
        &self,
        server: &dyn GattServerHandle,
        writer: &GattCharacteristic,
        address: &DeviceAddress,
        index: usize,
        chunk: &[u8],
    ) -> Result<(), DriverError> {
        let mut op = WriteOperation::new(self.next_op_seq(), address.clone(), index, chunk.len());
        trace!(
            "writeAndNotify: chunk {} to {}: hex={} length={}",
            index,
            address,
            hex::encode(chunk),
            op.len
        );

        if let Err(e) = writer.set_value(chunk) {
            error!("writeAndNotify: set characteristic failed: {}", e);
            op.resolve(WriteOutcome::Rejected);
            return Err(DriverError::NotifyRejected(e.to_string()));
        }

        // Armed before notifying so a fast confirmation cannot be missed
        let ack = self.bridge.arm_ack(address, op.seq);

        if let Err(e) = server.notify_characteristic_changed(address, writer, chunk, true) {
            error!("writeAndNotify: notify failed for device {}: {}", address, e);
            self.bridge.disarm_ack(address, op.seq);
            op.resolve(WriteOutcome::Rejected);
            return Err(DriverError::NotifyRejected(e.to_string()));
        }

        let timeout = self.config.ack_timeout();
        match ack.wait_timeout(timeout) {
            Ok(status) if status.is_success() => {
                op.resolve(WriteOutcome::Acknowledged);
                Ok(())
            }
            Ok(status) => {
                error!(
                    "writeAndNotify: delivery of chunk {} to {} failed with status {:#x}",
                    index,
                    address,
                    status.code()
                );
                op.resolve(WriteOutcome::Rejected);
                Err(DriverError::NotifyRejected(format!(
                    "delivery failed with status {:?}",
                    status
                )))
            }
            Err(GateError::TimedOut(_)) => {
                error!(
                    "writeAndNotify: device={}: chunk {} not acknowledged within {:?}",
                    address, index, timeout
                );
                // The confirmation may still arrive; it must not release the next chunk
                self.bridge.orphan_ack(address, op.seq, timeout);
                op.resolve(WriteOutcome::TimedOut);
                Err(DriverError::AckTimeout {
                    chunk: index,
                    timeout,
                })
            }
            Err(GateError::Abandoned) => {
                error!("writeAndNotify: device={}: wait interrupted", address);
                op.resolve(WriteOutcome::Interrupted);
                Err(DriverError::InterruptedWait(format!(
                    "acknowledgement for chunk {} abandoned",
                    index
                )))
            }
        }
    }
}
