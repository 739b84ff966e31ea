//! Platform BLE stack interface.
//!
//! The core never talks to a radio directly. It issues fire-and-forget
//! commands through [`BlePlatform`] and is fed completions as
//! [`PlatformEvent`]s on a single channel. Completions may arrive on any
//! thread, in any order the platform chooses.

use std::fmt;

use btleplug::api::{CharPropFlags, WriteType};
use bytes::Bytes;
use uuid::Uuid;

/// Stable platform-assigned identifier of a physical peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a platform identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Fully-qualified address of one characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicPath {
    /// Owning device.
    pub device: DeviceId,
    /// Owning service.
    pub service: Uuid,
    /// Characteristic UUID.
    pub characteristic: Uuid,
}

impl CharacteristicPath {
    /// Build a path.
    pub fn new(device: DeviceId, service: Uuid, characteristic: Uuid) -> Self {
        Self {
            device,
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.device, self.service, self.characteristic)
    }
}

/// Adapter power state, as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PowerState {
    /// Not yet known.
    #[default]
    Unknown,
    /// Adapter is resetting.
    Resetting,
    /// BLE is not supported here.
    Unsupported,
    /// The process may not use BLE.
    Unauthorized,
    /// Adapter is off.
    PoweredOff,
    /// Adapter is on and usable.
    PoweredOn,
}

impl PowerState {
    /// Only a powered-on adapter is alive.
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl From<btleplug::api::CentralState> for PowerState {
    fn from(state: btleplug::api::CentralState) -> Self {
        use btleplug::api::CentralState;

        match state {
            CentralState::PoweredOn => Self::PoweredOn,
            CentralState::PoweredOff => Self::PoweredOff,
            CentralState::Unknown => Self::Unknown,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Resetting => write!(f, "Resetting"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::PoweredOff => write!(f, "Powered off"),
            Self::PoweredOn => write!(f, "Powered on"),
        }
    }
}

/// What a device advertised when first seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform identifier.
    pub id: DeviceId,
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// A characteristic reported by characteristic discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Capability flags, fixed for the life of the characteristic.
    pub properties: CharPropFlags,
}

impl DiscoveredCharacteristic {
    /// Build a discovery record.
    pub fn new(uuid: Uuid, properties: CharPropFlags) -> Self {
        Self { uuid, properties }
    }
}

/// GATT operations whose failures are reported asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GattOperation {
    /// Service discovery.
    DiscoverServices,
    /// Characteristic read.
    Read,
    /// Characteristic write.
    Write,
    /// Notification toggle.
    SetNotify,
    /// RSSI read.
    ReadRssi,
    /// Connection cancel.
    Disconnect,
}

impl fmt::Display for GattOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DiscoverServices => "discover services",
            Self::Read => "read",
            Self::Write => "write",
            Self::SetNotify => "set notify",
            Self::ReadRssi => "read RSSI",
            Self::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// Completions delivered by the platform stack.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    /// Adapter power state changed.
    PowerStateChanged(PowerState),
    /// A device was seen while scanning.
    Discovered(Advertisement),
    /// A connection attempt succeeded.
    Connected(DeviceId),
    /// A connection attempt failed.
    ConnectFailed {
        /// Device concerned.
        id: DeviceId,
        /// Platform-supplied reason.
        reason: String,
    },
    /// The link dropped.
    Disconnected(DeviceId),
    /// Service discovery completed with this full list.
    ServicesDiscovered {
        /// Device concerned.
        id: DeviceId,
        /// Every service on the device.
        services: Vec<Uuid>,
    },
    /// The device invalidated some services.
    ServicesChanged {
        /// Device concerned.
        id: DeviceId,
        /// Services no longer valid.
        invalidated: Vec<Uuid>,
    },
    /// Characteristic discovery completed for one service.
    CharacteristicsDiscovered {
        /// Device concerned.
        id: DeviceId,
        /// Service whose characteristics were discovered.
        service: Uuid,
        /// Every characteristic in the service.
        characteristics: Vec<DiscoveredCharacteristic>,
    },
    /// Characteristic discovery failed for one service.
    CharacteristicDiscoveryFailed {
        /// Device concerned.
        id: DeviceId,
        /// Service concerned.
        service: Uuid,
        /// Platform-supplied reason.
        reason: String,
    },
    /// A characteristic value arrived (read completion or notification).
    ValueUpdated {
        /// Characteristic concerned.
        path: CharacteristicPath,
        /// New value, possibly empty.
        value: Bytes,
    },
    /// RSSI read completed.
    RssiRead {
        /// Device concerned.
        id: DeviceId,
        /// Signal strength in dBm.
        rssi: i16,
    },
    /// The device's name changed.
    NameUpdated {
        /// Device concerned.
        id: DeviceId,
        /// New name.
        name: String,
    },
    /// A transient GATT operation failed.
    OperationFailed {
        /// Device concerned.
        id: DeviceId,
        /// Which operation failed.
        operation: GattOperation,
        /// Characteristic concerned, if any.
        characteristic: Option<Uuid>,
        /// Platform-supplied reason.
        reason: String,
    },
    /// A connect timer fired.
    ConnectTimeout {
        /// Device concerned.
        id: DeviceId,
        /// Attempt the timer was armed for.
        attempt: u64,
    },
}

impl PlatformEvent {
    /// The device an event concerns, if it concerns a single device.
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            Self::PowerStateChanged(_) => None,
            Self::Discovered(adv) => Some(&adv.id),
            Self::Connected(id) | Self::Disconnected(id) => Some(id),
            Self::ValueUpdated { path, .. } => Some(&path.device),
            Self::ConnectFailed { id, .. }
            | Self::ServicesDiscovered { id, .. }
            | Self::ServicesChanged { id, .. }
            | Self::CharacteristicsDiscovered { id, .. }
            | Self::CharacteristicDiscoveryFailed { id, .. }
            | Self::RssiRead { id, .. }
            | Self::NameUpdated { id, .. }
            | Self::OperationFailed { id, .. }
            | Self::ConnectTimeout { id, .. } => Some(id),
        }
    }
}

/// Commands the core issues to the platform stack.
///
/// Every command is fire-and-forget: it must not block, and its outcome is
/// delivered later as a [`PlatformEvent`].
#[cfg_attr(test, mockall::automock)]
pub trait BlePlatform: Send + Sync {
    /// Start scanning, optionally only for devices advertising these services.
    fn start_scan(&self, filter: Option<Vec<Uuid>>);

    /// Stop scanning.
    fn stop_scan(&self);

    /// Connect to a device.
    fn connect(&self, id: &DeviceId);

    /// Cancel a pending or established connection.
    fn cancel_connection(&self, id: &DeviceId);

    /// Discover services, optionally only these.
    fn discover_services(&self, id: &DeviceId, filter: Option<Vec<Uuid>>);

    /// Discover the characteristics of one service, optionally only these.
    fn discover_characteristics(&self, id: &DeviceId, service: Uuid, filter: Option<Vec<Uuid>>);

    /// Read a characteristic value.
    fn read(&self, path: &CharacteristicPath);

    /// Write a characteristic value.
    fn write(&self, path: &CharacteristicPath, data: &[u8], mode: WriteType);

    /// Enable or disable notifications.
    fn set_notify(&self, path: &CharacteristicPath, enabled: bool);

    /// Read the current RSSI.
    fn read_rssi(&self, id: &DeviceId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_state_alive() {
        assert!(PowerState::PoweredOn.is_alive());
        assert!(!PowerState::PoweredOff.is_alive());
        assert!(!PowerState::Unknown.is_alive());
        assert!(!PowerState::Unauthorized.is_alive());
    }

    #[test]
    fn test_power_state_from_central_state() {
        use btleplug::api::CentralState;
        assert_eq!(PowerState::from(CentralState::PoweredOn), PowerState::PoweredOn);
        assert_eq!(PowerState::from(CentralState::PoweredOff), PowerState::PoweredOff);
    }

    #[test]
    fn test_event_device() {
        let id = DeviceId::new("U1");
        assert_eq!(PlatformEvent::Connected(id.clone()).device(), Some(&id));
        assert_eq!(
            PlatformEvent::PowerStateChanged(PowerState::PoweredOn).device(),
            None
        );
        let path = CharacteristicPath::new(id.clone(), Uuid::nil(), Uuid::nil());
        let event = PlatformEvent::ValueUpdated {
            path,
            value: Bytes::new(),
        };
        assert_eq!(event.device(), Some(&id));
    }

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId::from("AA:BB").to_string(), "AA:BB");
    }
}
