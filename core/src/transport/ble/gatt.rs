/// GATT service definition for the mesh BLE link
///
/// One primary service with two characteristics: the peer-identity
/// characteristic (read/write) and the writer characteristic (write/notify)
/// carrying payload chunks, with its client-configuration descriptor.

use parking_lot::Mutex;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// GATT service UUID (0x4240)
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_4240_0000_1000_8000_0080_5F9B_34FB);

/// Characteristic used for peer identity exchange (0x4241)
pub const PEER_ID_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_4241_0000_1000_8000_0080_5F9B_34FB);

/// Characteristic used for data exchange (0x4242)
pub const WRITER_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_4242_0000_1000_8000_0080_5F9B_34FB);

/// Standard Client Characteristic Configuration descriptor (0x2902)
pub const CCC_DESCRIPTOR_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5F9B_34FB);

/// ATT reserves 3 bytes of every packet (opcode + handle)
pub const ATT_HEADER_SIZE: usize = 3;

/// MTU every link starts with before negotiation
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Largest attribute value ATT allows
pub const MAX_ATTRIBUTE_VALUE_LEN: usize = 512;

/// Errors for GATT service construction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Value of {len} bytes exceeds attribute limit of {max}")]
    ValueTooLong { len: usize, max: usize },
    #[error("Characteristic {0} already present in service")]
    DuplicateCharacteristic(Uuid),
    #[error("Characteristic {0} not found")]
    MissingCharacteristic(Uuid),
}

/// Characteristic property bits, as advertised in the characteristic declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const READ: Self = Self(0x02);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Status codes returned to a remote central
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    ReadNotPermitted,
    WriteNotPermitted,
    RequestNotSupported,
    InvalidOffset,
    Failure,
}

impl GattStatus {
    /// ATT error code (0x0101 is the platform "generic failure")
    pub fn code(&self) -> u16 {
        match self {
            GattStatus::Success => 0x00,
            GattStatus::ReadNotPermitted => 0x02,
            GattStatus::WriteNotPermitted => 0x03,
            GattStatus::RequestNotSupported => 0x06,
            GattStatus::InvalidOffset => 0x07,
            GattStatus::Failure => 0x0101,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == GattStatus::Success
    }
}

/// A descriptor attached to a characteristic
pub struct GattDescriptor {
    uuid: Uuid,
    value: Mutex<Vec<u8>>,
}

impl GattDescriptor {
    pub fn new(uuid: Uuid, initial: &[u8]) -> Self {
        Self {
            uuid,
            value: Mutex::new(initial.to_vec()),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn value(&self) -> Vec<u8> {
        self.value.lock().clone()
    }
}

/// A characteristic with its current value and descriptors
pub struct GattCharacteristic {
    uuid: Uuid,
    properties: CharacteristicProperties,
    value: Mutex<Vec<u8>>,
    descriptors: Vec<GattDescriptor>,
}

impl GattCharacteristic {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            value: Mutex::new(Vec::new()),
            descriptors: Vec::new(),
        }
    }

    /// Attach a descriptor (only possible while building)
    pub fn with_descriptor(mut self, descriptor: GattDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    pub fn descriptor(&self, uuid: Uuid) -> Option<&GattDescriptor> {
        self.descriptors.iter().find(|d| d.uuid == uuid)
    }

    /// Replace the value; fails if it cannot fit in one attribute
    pub fn set_value(&self, value: &[u8]) -> Result<(), GattError> {
        if value.len() > MAX_ATTRIBUTE_VALUE_LEN {
            return Err(GattError::ValueTooLong {
                len: value.len(),
                max: MAX_ATTRIBUTE_VALUE_LEN,
            });
        }
        let mut current = self.value.lock();
        current.clear();
        current.extend_from_slice(value);
        Ok(())
    }

    pub fn value(&self) -> Vec<u8> {
        self.value.lock().clone()
    }
}

impl fmt::Debug for GattCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattCharacteristic")
            .field("uuid", &self.uuid)
            .field("properties", &self.properties)
            .field("value_len", &self.value.lock().len())
            .finish()
    }
}

/// The primary service published by the peripheral
#[derive(Debug)]
pub struct GattService {
    uuid: Uuid,
    characteristics: Vec<Arc<GattCharacteristic>>,
}

impl GattService {
    /// Create an empty primary service
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            characteristics: Vec::new(),
        }
    }

    /// Build the mesh service: identity + writer characteristics, both empty
    pub fn build_mesh_service() -> Result<Self, GattError> {
        let peer_id = GattCharacteristic::new(
            PEER_ID_CHARACTERISTIC_UUID,
            CharacteristicProperties::READ | CharacteristicProperties::WRITE,
        );
        let writer = GattCharacteristic::new(
            WRITER_CHARACTERISTIC_UUID,
            CharacteristicProperties::WRITE | CharacteristicProperties::NOTIFY,
        )
        .with_descriptor(GattDescriptor::new(CCC_DESCRIPTOR_UUID, &[0x00, 0x00]));

        peer_id.set_value(&[])?;
        writer.set_value(&[])?;

        let mut service = Self::new(SERVICE_UUID);
        service.add_characteristic(Arc::new(peer_id))?;
        service.add_characteristic(Arc::new(writer))?;
        Ok(service)
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Add a characteristic (UUIDs must be unique within the service)
    pub fn add_characteristic(
        &mut self,
        characteristic: Arc<GattCharacteristic>,
    ) -> Result<(), GattError> {
        if self.characteristic(characteristic.uuid()).is_some() {
            return Err(GattError::DuplicateCharacteristic(characteristic.uuid()));
        }
        self.characteristics.push(characteristic);
        Ok(())
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<Arc<GattCharacteristic>> {
        self.characteristics
            .iter()
            .find(|c| c.uuid() == uuid)
            .cloned()
    }

    pub fn characteristics(&self) -> &[Arc<GattCharacteristic>] {
        &self.characteristics
    }
}
