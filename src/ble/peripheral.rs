//! Per-device connection state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> DiscoveringServices -> Ready
//!       ^              |                                             |
//!       +--------------+---------- disconnect / timeout -------------+
//! ```
//!
//! Every handler is a reducer: it updates the machine, issues platform
//! commands, and returns the [`DeviceEvent`]s listeners should see.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::WriteType;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::characteristic::Characteristic;
use crate::ble::connection::{ConnectTimer, ConnectionState, TimeoutHandle, DEFAULT_CONNECT_TIMEOUT};
use crate::ble::events::{DeviceEvent, PeripheralInfo};
use crate::ble::platform::{
    Advertisement, BlePlatform, CharacteristicPath, DeviceId, DiscoveredCharacteristic,
    GattOperation, PlatformEvent,
};
use crate::ble::service::{Service, ServiceState};
use crate::ble::uuids::display_uuid;
use crate::error::{Error, Result};
use crate::template::TemplateRegistry;

/// A discovered peripheral and its connection state machine.
pub struct Peripheral {
    /// Platform identifier.
    id: DeviceId,
    /// Advertised or updated name.
    local_name: Option<String>,
    /// Last known RSSI in dBm.
    rssi: Option<i16>,
    /// Services advertised at discovery.
    advertised_services: Vec<Uuid>,
    /// When first seen.
    discovered_at: DateTime<Utc>,
    /// Connection state.
    state: ConnectionState,
    /// Attempt counter; a timer only acts for the attempt it was armed for.
    connect_attempt: u64,
    /// Connect timeout used for the next attempt.
    connect_timeout: Duration,
    /// Armed connect timer.
    pending_timeout: Option<TimeoutHandle>,
    /// The platform refused the last attempt.
    last_connect_failed: bool,
    /// Discovered services.
    services: BTreeMap<Uuid, Service>,
    /// Command sink.
    platform: Arc<dyn BlePlatform>,
    /// Connect timeout scheduler.
    timer: Arc<dyn ConnectTimer>,
    /// Profiles to match.
    templates: Arc<TemplateRegistry>,
}

impl Peripheral {
    /// Create a peripheral from its first advertisement.
    pub fn new(
        advertisement: Advertisement,
        platform: Arc<dyn BlePlatform>,
        timer: Arc<dyn ConnectTimer>,
        templates: Arc<TemplateRegistry>,
    ) -> Self {
        Self {
            id: advertisement.id,
            local_name: advertisement.local_name,
            rssi: advertisement.rssi,
            advertised_services: advertisement.services,
            discovered_at: Utc::now(),
            state: ConnectionState::Disconnected,
            connect_attempt: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pending_timeout: None,
            last_connect_failed: false,
            services: BTreeMap::new(),
            platform,
            timer,
            templates,
        }
    }

    /// Set the timeout used by later connect attempts.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Services advertised when first seen.
    pub fn advertised_services(&self) -> &[Uuid] {
        &self.advertised_services
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    /// The platform refused the last connect attempt.
    pub fn last_connect_failed(&self) -> bool {
        self.last_connect_failed
    }

    /// Current attempt number.
    pub fn connect_attempt(&self) -> u64 {
        self.connect_attempt
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Change the timeout for later attempts. An armed timer keeps its delay.
    pub fn set_connect_timeout(&mut self, timeout: Duration) {
        self.connect_timeout = timeout;
    }

    pub fn service(&self, uuid: &Uuid) -> Option<&Service> {
        self.services.get(uuid)
    }

    /// Services in UUID order.
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    /// Ready services bound to a template.
    pub fn matched_services(&self) -> impl Iterator<Item = &Service> {
        self.services
            .values()
            .filter(|s| s.state() == ServiceState::Ready && s.is_matched())
    }

    /// Snapshot.
    pub fn info(&self) -> PeripheralInfo {
        PeripheralInfo {
            id: self.id.clone(),
            local_name: self.local_name.clone(),
            rssi: self.rssi,
            advertised_services: self.advertised_services.clone(),
            discovered_at: self.discovered_at,
            state: self.state,
            last_connect_failed: self.last_connect_failed,
            services: self.services.values().map(Service::info).collect(),
        }
    }

    /// Start a connect attempt. Only valid from `Disconnected`.
    pub fn connect(&mut self) -> bool {
        if self.state != ConnectionState::Disconnected {
            debug!("{}: connect ignored in state {}", self.id, self.state);
            return false;
        }

        self.connect_attempt += 1;
        self.last_connect_failed = false;
        self.state = ConnectionState::Connecting;
        info!("{}: connecting (attempt {})", self.id, self.connect_attempt);

        self.platform.connect(&self.id);
        self.pending_timeout = Some(self.timer.schedule(
            &self.id,
            self.connect_attempt,
            self.connect_timeout,
        ));
        true
    }

    /// Tear the connection down.
    ///
    /// An established link completes through the platform's disconnect
    /// callback. A pending attempt has no link to report on, so it is
    /// completed here.
    pub fn disconnect(&mut self) -> Vec<DeviceEvent> {
        match self.state {
            ConnectionState::Disconnected => {
                debug!("{}: already disconnected", self.id);
                Vec::new()
            }
            ConnectionState::Connecting => {
                self.cancel_timeout();
                self.platform.cancel_connection(&self.id);
                self.handle_disconnected()
            }
            _ => {
                self.cancel_timeout();
                self.platform.cancel_connection(&self.id);
                Vec::new()
            }
        }
    }

    /// Route a platform completion.
    pub fn handle_event(&mut self, event: PlatformEvent) -> Vec<DeviceEvent> {
        match event {
            PlatformEvent::Connected(_) => self.handle_connected(),
            PlatformEvent::ConnectFailed { reason, .. } => self.handle_connect_failed(&reason),
            PlatformEvent::Disconnected(_) => self.handle_disconnected(),
            PlatformEvent::ConnectTimeout { attempt, .. } => self.handle_timeout(attempt),
            PlatformEvent::ServicesDiscovered { services, .. } => {
                self.handle_services_discovered(&services)
            }
            PlatformEvent::ServicesChanged { invalidated, .. } => {
                self.handle_services_changed(&invalidated)
            }
            PlatformEvent::CharacteristicsDiscovered {
                service,
                characteristics,
                ..
            } => self.handle_characteristics_discovered(service, &characteristics),
            PlatformEvent::CharacteristicDiscoveryFailed { service, reason, .. } => {
                if let Some(s) = self.services.get_mut(&service) {
                    s.handle_discovery_failed(&reason);
                }
                Vec::new()
            }
            PlatformEvent::ValueUpdated { path, value } => self.handle_value(path, value),
            PlatformEvent::RssiRead { rssi, .. } => self.handle_rssi(rssi),
            PlatformEvent::NameUpdated { name, .. } => self.handle_name(name),
            PlatformEvent::OperationFailed {
                operation,
                characteristic,
                reason,
                ..
            } => {
                self.handle_operation_failed(operation, characteristic, &reason);
                Vec::new()
            }
            PlatformEvent::PowerStateChanged(_) | PlatformEvent::Discovered(_) => Vec::new(),
        }
    }

    /// The platform reports the link is up.
    pub fn handle_connected(&mut self) -> Vec<DeviceEvent> {
        match self.state {
            ConnectionState::Connecting => {}
            ConnectionState::Disconnected => {
                // A timed-out or cancelled attempt; do not resurrect it.
                debug!("{}: late connect ignored", self.id);
                self.platform.cancel_connection(&self.id);
                return Vec::new();
            }
            state => {
                debug!("{}: duplicate connect in state {}", self.id, state);
                return Vec::new();
            }
        }

        self.cancel_timeout();
        self.state = ConnectionState::Connected;
        info!("{}: connected", self.id);

        let mut events = self.channel_link_events(true);
        events.push(DeviceEvent::PeripheralCreated(self.info()));

        self.state = ConnectionState::DiscoveringServices;
        self.platform.discover_services(&self.id, None);
        events
    }

    /// The platform refused the connection. No retry.
    pub fn handle_connect_failed(&mut self, reason: &str) -> Vec<DeviceEvent> {
        if self.state != ConnectionState::Connecting {
            debug!("{}: connect failure ignored in state {}", self.id, self.state);
            return Vec::new();
        }

        self.cancel_timeout();
        self.state = ConnectionState::Disconnected;
        self.last_connect_failed = true;
        warn!("{}: connect failed: {}", self.id, reason);

        vec![DeviceEvent::ConnectFailed {
            id: self.id.clone(),
            reason: reason.to_string(),
        }]
    }

    /// A connect timer fired.
    pub fn handle_timeout(&mut self, attempt: u64) -> Vec<DeviceEvent> {
        if attempt != self.connect_attempt || self.state != ConnectionState::Connecting {
            trace!(
                "{}: stale timeout for attempt {} (current {}, {})",
                self.id,
                attempt,
                self.connect_attempt,
                self.state
            );
            return Vec::new();
        }

        warn!("{}: connect timed out after {:?}", self.id, self.connect_timeout);
        self.platform.cancel_connection(&self.id);
        self.handle_disconnected()
    }

    /// The link is down, for real or because an attempt timed out.
    pub fn handle_disconnected(&mut self) -> Vec<DeviceEvent> {
        if self.state == ConnectionState::Disconnected {
            debug!("{}: already disconnected", self.id);
            return Vec::new();
        }

        self.cancel_timeout();
        let mut events = self.channel_link_events(false);

        // In-flight discoveries will never complete on this link.
        for service in self.services.values_mut() {
            if service.state() == ServiceState::DiscoveringCharacteristics {
                service.reset();
            }
        }

        self.state = ConnectionState::Disconnected;
        info!("{}: disconnected", self.id);
        events.push(DeviceEvent::PeripheralRemoved(self.info()));
        events
    }

    /// Service discovery completed with the full list of services.
    pub fn handle_services_discovered(&mut self, uuids: &[Uuid]) -> Vec<DeviceEvent> {
        if !matches!(
            self.state,
            ConnectionState::DiscoveringServices | ConnectionState::Ready
        ) {
            debug!("{}: services discovered in state {}, ignored", self.id, self.state);
            return Vec::new();
        }

        let mut events = Vec::new();

        let dropped: Vec<Uuid> = self
            .services
            .keys()
            .filter(|uuid| !uuids.contains(uuid))
            .copied()
            .collect();
        for uuid in dropped {
            if let Some(mut service) = self.services.remove(&uuid) {
                events.extend(self.link_down(service.reset()));
                if service.is_matched() {
                    events.push(self.match_changed(uuid, false));
                }
            }
        }

        for uuid in uuids {
            let service = self
                .services
                .entry(*uuid)
                .or_insert_with(|| Service::new(self.id.clone(), *uuid));

            match service.state() {
                ServiceState::Waiting if service.is_weak_match(&self.templates) => {
                    service.run(self.platform.as_ref());
                }
                ServiceState::Ready => {
                    // Subscriptions do not survive a reconnect.
                    for c in service.characteristics().filter(|c| c.is_notifying()) {
                        self.platform.set_notify(c.path(), true);
                    }
                }
                _ => {}
            }
        }

        debug!("{}: {} services", self.id, self.services.len());
        self.state = ConnectionState::Ready;
        events.push(DeviceEvent::PeripheralUpdated(self.info()));
        events
    }

    /// Some services were invalidated; forget them and rediscover.
    pub fn handle_services_changed(&mut self, invalidated: &[Uuid]) -> Vec<DeviceEvent> {
        if !self.state.is_connected() {
            debug!("{}: services changed while {}, ignored", self.id, self.state);
            return Vec::new();
        }

        info!("{}: {} services invalidated", self.id, invalidated.len());
        let mut events = Vec::new();
        for uuid in invalidated {
            if let Some(service) = self.services.get_mut(uuid) {
                let closed = service.reset();
                events.extend(self.link_down(closed));
            }
        }

        self.state = ConnectionState::DiscoveringServices;
        self.platform.discover_services(&self.id, None);
        events
    }

    /// Characteristic discovery completed for one service.
    pub fn handle_characteristics_discovered(
        &mut self,
        service: Uuid,
        characteristics: &[DiscoveredCharacteristic],
    ) -> Vec<DeviceEvent> {
        let changed = match self.services.get_mut(&service) {
            Some(s) => s.handle_characteristics_discovered(
                characteristics,
                &self.templates,
                self.platform.as_ref(),
            ),
            None => {
                debug!(
                    "{}: characteristics for unknown service {}",
                    self.id,
                    display_uuid(&service)
                );
                return Vec::new();
            }
        };

        let platform = self.platform.clone();
        let restored = match self.services.get_mut(&service) {
            Some(s) => s.resubscribe(platform.as_ref()),
            None => Vec::new(),
        };

        let mut events = Vec::new();
        if let Some(matched) = changed {
            events.push(self.match_changed(service, matched));
            events.push(DeviceEvent::PeripheralUpdated(self.info()));
        }
        events.extend(restored.into_iter().map(|path| DeviceEvent::ChannelLinkChanged {
            path,
            connected: true,
        }));
        events
    }

    /// A characteristic value arrived.
    pub fn handle_value(&mut self, path: CharacteristicPath, value: Bytes) -> Vec<DeviceEvent> {
        trace!("{}: {} bytes on {}", self.id, value.len(), display_uuid(&path.characteristic));

        let forwarded = self
            .services
            .get_mut(&path.service)
            .and_then(|s| s.handle_value(&path.characteristic, value));

        match forwarded {
            Some(value) => vec![DeviceEvent::ValueReceived { path, value }],
            None => Vec::new(),
        }
    }

    /// RSSI read completed.
    pub fn handle_rssi(&mut self, rssi: i16) -> Vec<DeviceEvent> {
        debug!("{}: RSSI {} dBm", self.id, rssi);
        self.rssi = Some(rssi);
        vec![DeviceEvent::PeripheralUpdated(self.info())]
    }

    /// The device's name changed.
    pub fn handle_name(&mut self, name: String) -> Vec<DeviceEvent> {
        debug!("{}: name updated to '{}'", self.id, name);
        self.local_name = Some(name);
        vec![DeviceEvent::PeripheralUpdated(self.info())]
    }

    /// Transient GATT failures are logged and otherwise ignored.
    pub fn handle_operation_failed(
        &self,
        operation: GattOperation,
        characteristic: Option<Uuid>,
        reason: &str,
    ) {
        match characteristic {
            Some(uuid) => warn!(
                "{}: {} failed on {}: {}",
                self.id,
                operation,
                display_uuid(&uuid),
                reason
            ),
            None => warn!("{}: {} failed: {}", self.id, operation, reason),
        }
    }

    /// Request an RSSI read if connected.
    pub fn read_rssi(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.platform.read_rssi(&self.id);
        true
    }

    /// Read a characteristic. Returns whether a read was issued.
    pub fn read_characteristic(&self, service: &Uuid, characteristic: &Uuid) -> Result<bool> {
        let platform = self.platform.clone();
        self.with_characteristic(service, characteristic, |c| c.read(platform.as_ref()))
    }

    /// Write a characteristic. Returns whether a write was issued.
    pub fn write_characteristic(
        &self,
        service: &Uuid,
        characteristic: &Uuid,
        data: &[u8],
        mode: WriteType,
    ) -> Result<bool> {
        let platform = self.platform.clone();
        self.with_characteristic(service, characteristic, |c| {
            c.write_with(platform.as_ref(), data, mode)
        })
    }

    /// Switch notifications on a characteristic.
    pub fn set_notify(&mut self, service: &Uuid, characteristic: &Uuid, on: bool) -> Result<()> {
        self.ensure_connected()?;
        let platform = self.platform.clone();
        let c = self
            .services
            .get_mut(service)
            .and_then(|s| s.characteristic_mut(characteristic))
            .ok_or_else(|| Error::NotMatched {
                identifier: self.id.to_string(),
            })?;
        c.notify(platform.as_ref(), on);
        Ok(())
    }

    /// Take the oldest unconsumed value of a characteristic.
    pub fn take_value(&mut self, service: &Uuid, characteristic: &Uuid) -> Option<Bytes> {
        self.services
            .get_mut(service)?
            .characteristic_mut(characteristic)?
            .pop_pending()
    }

    /// Cancel everything, ahead of being dropped from the registry.
    pub fn shutdown(&mut self) -> Vec<DeviceEvent> {
        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        self.platform.cancel_connection(&self.id);
        self.handle_disconnected()
    }

    fn with_characteristic<T>(
        &self,
        service: &Uuid,
        characteristic: &Uuid,
        f: impl FnOnce(&Characteristic) -> T,
    ) -> Result<T> {
        self.ensure_connected()?;
        self.services
            .get(service)
            .and_then(|s| s.characteristic(characteristic))
            .map(f)
            .ok_or_else(|| Error::NotMatched {
                identifier: self.id.to_string(),
            })
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn cancel_timeout(&mut self) {
        if let Some(mut handle) = self.pending_timeout.take() {
            handle.cancel();
        }
    }

    fn channel_link_events(&self, connected: bool) -> Vec<DeviceEvent> {
        self.services
            .values()
            .flat_map(|s| s.characteristics())
            .filter(|c| c.is_notifying())
            .map(|c| DeviceEvent::ChannelLinkChanged {
                path: c.path().clone(),
                connected,
            })
            .collect()
    }

    fn link_down(&self, closed: Vec<Characteristic>) -> Vec<DeviceEvent> {
        closed
            .into_iter()
            .map(|c| DeviceEvent::ChannelLinkChanged {
                path: c.path().clone(),
                connected: false,
            })
            .collect()
    }

    fn match_changed(&self, service: Uuid, matched: bool) -> DeviceEvent {
        DeviceEvent::MatchChanged {
            id: self.id.clone(),
            service,
            matched,
        }
    }
}

impl std::fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peripheral")
            .field("id", &self.id)
            .field("local_name", &self.local_name)
            .field("state", &self.state)
            .field("connect_attempt", &self.connect_attempt)
            .field("services", &self.services.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::connection::ManualConnectTimer;
    use crate::ble::platform::MockBlePlatform;
    use crate::ble::uuids::{from_short, BLE_NANO_RXTX_UUID, BLE_NANO_SERVICE_UUID};
    use btleplug::api::CharPropFlags;
    use pretty_assertions::assert_eq;

    fn advertisement() -> Advertisement {
        Advertisement {
            id: DeviceId::new("U1"),
            local_name: Some("nano".to_string()),
            services: vec![BLE_NANO_SERVICE_UUID],
            rssi: Some(-70),
        }
    }

    fn peripheral(platform: MockBlePlatform, timer: &ManualConnectTimer) -> Peripheral {
        Peripheral::new(
            advertisement(),
            Arc::new(platform),
            Arc::new(timer.clone()),
            Arc::new(TemplateRegistry::default()),
        )
    }

    fn lenient_platform() -> MockBlePlatform {
        let mut platform = MockBlePlatform::new();
        platform.expect_connect().return_const(());
        platform.expect_cancel_connection().return_const(());
        platform.expect_discover_services().return_const(());
        platform.expect_discover_characteristics().return_const(());
        platform.expect_read().return_const(());
        platform.expect_set_notify().return_const(());
        platform.expect_read_rssi().return_const(());
        platform
    }

    fn ready(p: &mut Peripheral) {
        p.connect();
        p.handle_connected();
        p.handle_services_discovered(&[BLE_NANO_SERVICE_UUID, from_short(0x180A)]);
        p.handle_characteristics_discovered(
            BLE_NANO_SERVICE_UUID,
            &[DiscoveredCharacteristic::new(
                BLE_NANO_RXTX_UUID,
                CharPropFlags::READ | CharPropFlags::WRITE | CharPropFlags::NOTIFY,
            )],
        );
    }

    fn removed_count(events: &[DeviceEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, DeviceEvent::PeripheralRemoved(_)))
            .count()
    }

    #[test]
    fn test_connect_twice_issues_one_request() {
        let timer = ManualConnectTimer::new();
        let mut platform = MockBlePlatform::new();
        platform.expect_connect().times(1).return_const(());
        let mut p = peripheral(platform, &timer);

        assert!(p.connect());
        assert!(!p.connect());
        assert_eq!(p.state(), ConnectionState::Connecting);
        assert_eq!(timer.scheduled().len(), 1);
    }

    #[test]
    fn test_connected_triggers_service_discovery() {
        let timer = ManualConnectTimer::new();
        let mut platform = MockBlePlatform::new();
        platform.expect_connect().return_const(());
        platform
            .expect_discover_services()
            .withf(|id, filter| id.as_str() == "U1" && filter.is_none())
            .times(1)
            .return_const(());
        let mut p = peripheral(platform, &timer);

        p.connect();
        let events = p.handle_connected();

        assert_eq!(p.state(), ConnectionState::DiscoveringServices);
        assert!(matches!(events.as_slice(), [DeviceEvent::PeripheralCreated(_)]));
        assert_eq!(timer.cancelled(), vec![(DeviceId::new("U1"), 1)]);
    }

    #[test]
    fn test_timeout_runs_disconnect_path_once() {
        let timer = ManualConnectTimer::new();
        let mut p = peripheral(lenient_platform(), &timer);

        p.connect();
        let events = p.handle_timeout(1);
        assert_eq!(p.state(), ConnectionState::Disconnected);
        assert_eq!(removed_count(&events), 1);

        // A real disconnect arriving afterwards is a no-op.
        assert!(p.handle_disconnected().is_empty());
        // So is a late connect.
        assert!(p.handle_connected().is_empty());
        assert_eq!(p.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_stale_timeout_ignored() {
        let timer = ManualConnectTimer::new();
        let mut p = peripheral(lenient_platform(), &timer);

        p.connect();
        p.handle_connected();
        assert!(p.handle_timeout(1).is_empty());
        assert_eq!(p.state(), ConnectionState::DiscoveringServices);

        p.handle_disconnected();
        p.connect();
        assert_eq!(p.connect_attempt(), 2);
        assert!(p.handle_timeout(1).is_empty());
        assert_eq!(p.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_connect_failure_enters_failed_substate() {
        let timer = ManualConnectTimer::new();
        let mut p = peripheral(lenient_platform(), &timer);

        p.connect();
        let events = p.handle_connect_failed("refused");

        assert_eq!(p.state(), ConnectionState::Disconnected);
        assert!(p.last_connect_failed());
        assert_eq!(
            events,
            vec![DeviceEvent::ConnectFailed {
                id: DeviceId::new("U1"),
                reason: "refused".to_string()
            }]
        );

        assert!(p.connect());
        assert!(!p.last_connect_failed());
    }

    #[test]
    fn test_only_weak_matches_are_driven() {
        let timer = ManualConnectTimer::new();
        let mut platform = MockBlePlatform::new();
        platform.expect_connect().return_const(());
        platform.expect_discover_services().return_const(());
        platform
            .expect_discover_characteristics()
            .withf(|_, service, _| *service == BLE_NANO_SERVICE_UUID)
            .times(1)
            .return_const(());
        let mut p = peripheral(platform, &timer);

        p.connect();
        p.handle_connected();
        let events = p.handle_services_discovered(&[BLE_NANO_SERVICE_UUID, from_short(0x180A)]);

        assert_eq!(p.state(), ConnectionState::Ready);
        assert_eq!(p.services().count(), 2);
        assert!(matches!(events.as_slice(), [DeviceEvent::PeripheralUpdated(_)]));
        assert_eq!(
            p.service(&from_short(0x180A)).map(|s| s.state()),
            Some(ServiceState::Waiting)
        );
    }

    #[test]
    fn test_match_emits_change_once() {
        let timer = ManualConnectTimer::new();
        let mut p = peripheral(lenient_platform(), &timer);
        ready(&mut p);

        assert_eq!(p.matched_services().count(), 1);
        let info = p.info();
        assert!(info.is_matched());

        // Same characteristics again after a service change: no new event.
        p.handle_services_changed(&[BLE_NANO_SERVICE_UUID]);
        p.handle_services_discovered(&[BLE_NANO_SERVICE_UUID]);
        let events = p.handle_characteristics_discovered(
            BLE_NANO_SERVICE_UUID,
            &[DiscoveredCharacteristic::new(BLE_NANO_RXTX_UUID, CharPropFlags::NOTIFY)],
        );
        assert!(events.is_empty());
    }

    #[test]
    fn test_services_list_is_authoritative() {
        let timer = ManualConnectTimer::new();
        let mut p = peripheral(lenient_platform(), &timer);
        ready(&mut p);

        p.handle_services_changed(&[]);
        let events = p.handle_services_discovered(&[from_short(0x180A)]);

        assert!(p.service(&BLE_NANO_SERVICE_UUID).is_none());
        assert!(events.contains(&DeviceEvent::MatchChanged {
            id: DeviceId::new("U1"),
            service: BLE_NANO_SERVICE_UUID,
            matched: false
        }));
    }

    #[test]
    fn test_values_forwarded_only_when_non_empty() {
        let timer = ManualConnectTimer::new();
        let mut p = peripheral(lenient_platform(), &timer);
        ready(&mut p);

        let path = CharacteristicPath::new(
            DeviceId::new("U1"),
            BLE_NANO_SERVICE_UUID,
            BLE_NANO_RXTX_UUID,
        );
        assert!(p.handle_value(path.clone(), Bytes::new()).is_empty());

        let events = p.handle_value(path.clone(), Bytes::from_static(b"\x01"));
        assert_eq!(
            events,
            vec![DeviceEvent::ValueReceived {
                path,
                value: Bytes::from_static(b"\x01")
            }]
        );
        assert_eq!(
            p.take_value(&BLE_NANO_SERVICE_UUID, &BLE_NANO_RXTX_UUID),
            Some(Bytes::from_static(b"\x01"))
        );
    }

    #[test]
    fn test_channel_links_follow_connection() {
        let timer = ManualConnectTimer::new();
        let mut p = peripheral(lenient_platform(), &timer);
        ready(&mut p);
        p.set_notify(&BLE_NANO_SERVICE_UUID, &BLE_NANO_RXTX_UUID, true)
            .unwrap();

        let down = p.handle_disconnected();
        assert!(matches!(
            down.first(),
            Some(DeviceEvent::ChannelLinkChanged { connected: false, .. })
        ));
        assert_eq!(removed_count(&down), 1);

        p.connect();
        let up = p.handle_connected();
        assert!(matches!(
            up.first(),
            Some(DeviceEvent::ChannelLinkChanged { connected: true, .. })
        ));
    }

    #[test]
    fn test_characteristic_access_requires_connection() {
        let timer = ManualConnectTimer::new();
        let p = peripheral(lenient_platform(), &timer);

        assert!(matches!(
            p.read_characteristic(&BLE_NANO_SERVICE_UUID, &BLE_NANO_RXTX_UUID),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_rssi_and_name_updates() {
        let timer = ManualConnectTimer::new();
        let mut p = peripheral(lenient_platform(), &timer);
        ready(&mut p);

        let events = p.handle_rssi(-42);
        assert_eq!(p.rssi(), Some(-42));
        assert!(matches!(events.as_slice(), [DeviceEvent::PeripheralUpdated(_)]));

        p.handle_name("renamed".to_string());
        assert_eq!(p.local_name(), Some("renamed"));
        assert_eq!(p.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_disconnect_while_connecting_completes_immediately() {
        let timer = ManualConnectTimer::new();
        let mut platform = MockBlePlatform::new();
        platform.expect_connect().return_const(());
        platform.expect_cancel_connection().times(1).return_const(());
        let mut p = peripheral(platform, &timer);

        p.connect();
        let events = p.disconnect();

        assert_eq!(p.state(), ConnectionState::Disconnected);
        assert_eq!(removed_count(&events), 1);
    }
}
