//! Events published to listeners, and the snapshots they carry.
//!
//! Listeners never see the live state machines; every event holds plain
//! cloned data taken at the moment the event was produced.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::ble::connection::ConnectionState;
use crate::ble::platform::{CharacteristicPath, DeviceId};
use crate::ble::service::ServiceState;
use crate::template::Template;

/// Snapshot of one characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Where the characteristic lives.
    pub path: CharacteristicPath,
    /// READ is set.
    pub readable: bool,
    /// WRITE or WRITE_WITHOUT_RESPONSE is set.
    pub writable: bool,
    /// NOTIFY or INDICATE is set.
    pub notifiable: bool,
    /// Notifications are switched on.
    pub notifying: bool,
    /// Last value received.
    pub value: Option<Bytes>,
}

/// Snapshot of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Service UUID.
    pub uuid: Uuid,
    /// Discovery state.
    pub state: ServiceState,
    /// Template bound by the last match evaluation.
    pub matched_template: Option<Template>,
    /// Known characteristics, ordered by UUID.
    pub characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    /// Whether a template is bound.
    pub fn is_matched(&self) -> bool {
        self.matched_template.is_some()
    }
}

/// Snapshot of one peripheral.
#[derive(Debug, Clone, PartialEq)]
pub struct PeripheralInfo {
    /// Platform identifier.
    pub id: DeviceId,
    /// Advertised or updated name.
    pub local_name: Option<String>,
    /// Last known RSSI in dBm.
    pub rssi: Option<i16>,
    /// Services advertised when first seen.
    pub advertised_services: Vec<Uuid>,
    /// When the device was first seen.
    pub discovered_at: DateTime<Utc>,
    /// Connection state.
    pub state: ConnectionState,
    /// The last connect attempt was refused by the platform.
    pub last_connect_failed: bool,
    /// Discovered services, ordered by UUID.
    pub services: Vec<ServiceInfo>,
}

impl PeripheralInfo {
    /// Services bound to a template.
    pub fn matched_services(&self) -> impl Iterator<Item = &ServiceInfo> {
        self.services.iter().filter(|s| s.is_matched())
    }

    /// Whether any service is bound to a template.
    pub fn is_matched(&self) -> bool {
        self.matched_services().next().is_some()
    }

    /// Display name, falling back to the identifier.
    pub fn display_name(&self) -> String {
        self.local_name
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Events published to the listener layer.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A peripheral entered the live view (connected).
    PeripheralCreated(PeripheralInfo),
    /// A peripheral left the live view (disconnected or timed out).
    PeripheralRemoved(PeripheralInfo),
    /// A live peripheral changed.
    PeripheralUpdated(PeripheralInfo),
    /// The adapter became usable or unusable.
    SystemStateChanged {
        /// Adapter is powered on.
        alive: bool,
    },
    /// A non-empty value arrived on a characteristic.
    ValueReceived {
        /// Characteristic concerned.
        path: CharacteristicPath,
        /// The value.
        value: Bytes,
    },
    /// The platform refused a connection.
    ConnectFailed {
        /// Device concerned.
        id: DeviceId,
        /// Platform-supplied reason.
        reason: String,
    },
    /// A notifying channel's link went up or down.
    ChannelLinkChanged {
        /// Characteristic concerned.
        path: CharacteristicPath,
        /// Link is up.
        connected: bool,
    },
    /// A service's template match flipped.
    MatchChanged {
        /// Device concerned.
        id: DeviceId,
        /// Service concerned.
        service: Uuid,
        /// New match state.
        matched: bool,
    },
}

impl DeviceEvent {
    /// The device an event concerns, if any.
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            Self::PeripheralCreated(info)
            | Self::PeripheralRemoved(info)
            | Self::PeripheralUpdated(info) => Some(&info.id),
            Self::SystemStateChanged { .. } => None,
            Self::ValueReceived { path, .. } | Self::ChannelLinkChanged { path, .. } => {
                Some(&path.device)
            }
            Self::ConnectFailed { id, .. } | Self::MatchChanged { id, .. } => Some(id),
        }
    }

    /// Short name of the event kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PeripheralCreated(_) => "peripheral created",
            Self::PeripheralRemoved(_) => "peripheral removed",
            Self::PeripheralUpdated(_) => "peripheral updated",
            Self::SystemStateChanged { .. } => "system state changed",
            Self::ValueReceived { .. } => "value received",
            Self::ConnectFailed { .. } => "connect failed",
            Self::ChannelLinkChanged { .. } => "channel link changed",
            Self::MatchChanged { .. } => "match changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: Option<&str>) -> PeripheralInfo {
        PeripheralInfo {
            id: DeviceId::new("U1"),
            local_name: name.map(str::to_string),
            rssi: Some(-60),
            advertised_services: Vec::new(),
            discovered_at: Utc::now(),
            state: ConnectionState::Ready,
            last_connect_failed: false,
            services: Vec::new(),
        }
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        assert_eq!(info(Some("nano")).display_name(), "nano");
        assert_eq!(info(None).display_name(), "U1");
    }

    #[test]
    fn test_unmatched_peripheral() {
        let mut p = info(None);
        assert!(!p.is_matched());

        p.services.push(ServiceInfo {
            uuid: Uuid::nil(),
            state: ServiceState::Ready,
            matched_template: None,
            characteristics: Vec::new(),
        });
        assert!(!p.is_matched());
    }

    #[test]
    fn test_event_device() {
        let event = DeviceEvent::PeripheralRemoved(info(None));
        assert_eq!(event.device(), Some(&DeviceId::new("U1")));
        assert_eq!(event.kind(), "peripheral removed");
        assert_eq!(DeviceEvent::SystemStateChanged { alive: true }.device(), None);
    }
}
