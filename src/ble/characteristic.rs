//! A single GATT characteristic.
//!
//! Capability flags are fixed at discovery. Reads and writes are gated on
//! them; notification toggling is not. Values arrive through
//! [`Characteristic::handle_value`], and non-empty values are queued for
//! consumers that poll instead of listening.

use std::collections::VecDeque;

use btleplug::api::{CharPropFlags, WriteType};
use bytes::Bytes;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::events::CharacteristicInfo;
use crate::ble::platform::{BlePlatform, CharacteristicPath, DiscoveredCharacteristic};
use crate::ble::uuids::{display_uuid, is_excluded_from_read};

/// Values kept for polling consumers before the oldest is dropped.
pub const MAX_PENDING_VALUES: usize = 64;

/// A characteristic channel.
#[derive(Debug, Clone)]
pub struct Characteristic {
    /// Device, service and characteristic UUID.
    path: CharacteristicPath,
    /// Capabilities reported at discovery.
    properties: CharPropFlags,
    /// Last received value, empty or not.
    value: Option<Bytes>,
    /// Non-empty values not yet taken.
    pending: VecDeque<Bytes>,
    /// Notifications requested.
    notifying: bool,
}

impl Characteristic {
    /// Create a characteristic.
    pub fn new(path: CharacteristicPath, properties: CharPropFlags) -> Self {
        Self {
            path,
            properties,
            value: None,
            pending: VecDeque::new(),
            notifying: false,
        }
    }

    /// Create from a discovery record.
    pub fn discovered(
        device: crate::ble::platform::DeviceId,
        service: Uuid,
        found: &DiscoveredCharacteristic,
    ) -> Self {
        Self::new(
            CharacteristicPath::new(device, service, found.uuid),
            found.properties,
        )
    }

    /// Characteristic UUID.
    pub fn uuid(&self) -> Uuid {
        self.path.characteristic
    }

    /// Full path.
    pub fn path(&self) -> &CharacteristicPath {
        &self.path
    }

    /// Capability flags.
    pub fn properties(&self) -> CharPropFlags {
        self.properties
    }

    pub fn is_readable(&self) -> bool {
        self.properties.contains(CharPropFlags::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.properties
            .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
    }

    pub fn is_notifiable(&self) -> bool {
        self.properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
    }

    /// On the list of characteristics never read.
    pub fn is_excluded(&self) -> bool {
        is_excluded_from_read(&self.path.characteristic)
    }

    /// Whether notifications have been requested.
    pub fn is_notifying(&self) -> bool {
        self.notifying
    }

    /// Last received value.
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// Request a read. Returns whether a read was issued.
    pub fn read(&self, platform: &dyn BlePlatform) -> bool {
        if !self.is_readable() || self.is_excluded() {
            trace!("Skipping read of {}", display_uuid(&self.uuid()));
            return false;
        }
        platform.read(&self.path);
        true
    }

    /// Write with acknowledgement. Returns whether a write was issued.
    pub fn write(&self, platform: &dyn BlePlatform, data: &[u8]) -> bool {
        self.write_with(platform, data, WriteType::WithResponse)
    }

    /// Write in the given mode. Returns whether a write was issued.
    pub fn write_with(&self, platform: &dyn BlePlatform, data: &[u8], mode: WriteType) -> bool {
        if !self.is_writable() {
            debug!(
                "Characteristic {} is not writable, dropping {} bytes",
                display_uuid(&self.uuid()),
                data.len()
            );
            return false;
        }
        trace!("Writing {} bytes to {}", data.len(), display_uuid(&self.uuid()));
        platform.write(&self.path, data, mode);
        true
    }

    /// Switch notifications on or off.
    ///
    /// Not gated on capabilities; a refusal comes back from the platform as
    /// an operation failure.
    pub fn notify(&mut self, platform: &dyn BlePlatform, on: bool) {
        self.notifying = on;
        platform.set_notify(&self.path, on);
    }

    /// Record a new value. Returns it if it should be forwarded.
    pub fn handle_value(&mut self, value: Bytes) -> Option<Bytes> {
        self.value = Some(value.clone());
        if value.is_empty() {
            return None;
        }

        if self.pending.len() == MAX_PENDING_VALUES {
            self.pending.pop_front();
        }
        self.pending.push_back(value.clone());
        Some(value)
    }

    /// Take the oldest unconsumed value.
    pub fn pop_pending(&mut self) -> Option<Bytes> {
        self.pending.pop_front()
    }

    /// Number of unconsumed values.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot.
    pub fn info(&self) -> CharacteristicInfo {
        CharacteristicInfo {
            path: self.path.clone(),
            readable: self.is_readable(),
            writable: self.is_writable(),
            notifiable: self.is_notifiable(),
            notifying: self.notifying,
            value: self.value.clone(),
        }
    }
}
