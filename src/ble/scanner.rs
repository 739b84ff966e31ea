//! Scan controller.
//!
//! Owns the registry of known peripherals. It is the only writer of that
//! registry; every platform completion enters through
//! [`ScanController::handle_event`] and is routed to the peripheral it
//! concerns, under that peripheral's own lock.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::connection::ConnectTimer;
use crate::ble::events::{DeviceEvent, PeripheralInfo};
use crate::ble::peripheral::Peripheral;
use crate::ble::platform::{Advertisement, BlePlatform, DeviceId, PlatformEvent, PowerState};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::serial::SerialPort;
use crate::template::TemplateRegistry;

/// Shared handle to one peripheral state machine.
pub type SharedPeripheral = Arc<Mutex<Peripheral>>;

/// Discovers peripherals and drives one state machine per device.
pub struct ScanController {
    /// Command sink.
    platform: Arc<dyn BlePlatform>,
    /// Connect timeout scheduler.
    timer: Arc<dyn ConnectTimer>,
    /// Profiles to match.
    templates: Arc<TemplateRegistry>,
    /// Timeout for new connect attempts.
    connect_timeout: RwLock<Duration>,
    /// Default scan filter.
    service_filter: Option<Vec<Uuid>>,
    /// Last reported adapter state.
    power_state: RwLock<PowerState>,
    /// Whether a scan is running.
    scanning: AtomicBool,
    /// Known peripherals.
    peripherals: RwLock<HashMap<DeviceId, SharedPeripheral>>,
}

impl ScanController {
    /// Create a controller.
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        timer: Arc<dyn ConnectTimer>,
        config: &ManagerConfig,
    ) -> Self {
        Self {
            platform,
            timer,
            templates: Arc::new(config.templates.clone()),
            connect_timeout: RwLock::new(config.connect_timeout),
            service_filter: config.service_filter.clone(),
            power_state: RwLock::new(PowerState::Unknown),
            scanning: AtomicBool::new(false),
            peripherals: RwLock::new(HashMap::new()),
        }
    }

    /// Start scanning with the configured filter.
    pub fn start_scan(&self) -> bool {
        self.start_scan_with(self.service_filter.clone())
    }

    /// Start scanning with an explicit filter. No-op if already scanning.
    pub fn start_scan_with(&self, filter: Option<Vec<Uuid>>) -> bool {
        if self.scanning.swap(true, Ordering::SeqCst) {
            debug!("Already scanning, ignoring start request");
            return false;
        }

        info!("Starting BLE scan");
        self.platform.start_scan(filter);
        true
    }

    /// Stop scanning. No-op if not scanning.
    pub fn stop_scan(&self) -> bool {
        if !self.scanning.swap(false, Ordering::SeqCst) {
            debug!("Not scanning, ignoring stop request");
            return false;
        }

        info!("Stopping BLE scan");
        self.platform.stop_scan();
        true
    }

    /// Whether a scan has been requested and not stopped since.
    ///
    /// Tracks requests only; a power-off clears it.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Whether the adapter is powered on.
    pub fn is_alive(&self) -> bool {
        self.power_state.read().is_alive()
    }

    /// Last reported adapter state.
    pub fn power_state(&self) -> PowerState {
        *self.power_state.read()
    }

    /// Templates in use.
    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// Timeout applied to new connect attempts.
    pub fn connect_timeout(&self) -> Duration {
        *self.connect_timeout.read()
    }

    /// Change the connect timeout for every later attempt.
    pub fn set_connect_timeout(&self, timeout: Duration) {
        info!("Connect timeout set to {:?}", timeout);
        *self.connect_timeout.write() = timeout;
        for peripheral in self.peripherals.read().values() {
            peripheral.lock().set_connect_timeout(timeout);
        }
    }

    /// Apply one platform completion.
    pub fn handle_event(&self, event: PlatformEvent) -> Vec<DeviceEvent> {
        match event {
            PlatformEvent::PowerStateChanged(state) => self.handle_power_state(state),
            PlatformEvent::Discovered(advertisement) => self.handle_discovered(advertisement),
            event => {
                let Some(id) = event.device().cloned() else {
                    return Vec::new();
                };
                let Some(peripheral) = self.get(&id) else {
                    trace!("Event for unknown device {}", id);
                    if matches!(event, PlatformEvent::Connected(_)) {
                        // Nobody will ever use this link.
                        self.platform.cancel_connection(&id);
                    }
                    return Vec::new();
                };
                let events = peripheral.lock().handle_event(event);
                events
            }
        }
    }

    fn handle_power_state(&self, state: PowerState) -> Vec<DeviceEvent> {
        info!("Adapter state: {}", state);
        *self.power_state.write() = state;

        if state == PowerState::PoweredOff {
            let dropped = std::mem::take(&mut *self.peripherals.write());
            debug!("Adapter off, discarding {} peripherals", dropped.len());
            if self.scanning.swap(false, Ordering::SeqCst) {
                self.platform.stop_scan();
            }
        }

        vec![DeviceEvent::SystemStateChanged {
            alive: state.is_alive(),
        }]
    }

    fn handle_discovered(&self, advertisement: Advertisement) -> Vec<DeviceEvent> {
        let peripheral = {
            let mut peripherals = self.peripherals.write();
            if peripherals.contains_key(&advertisement.id) {
                trace!("Already known: {}", advertisement.id);
                return Vec::new();
            }

            info!(
                "Discovered {} ({}) RSSI {:?}",
                advertisement.id,
                advertisement.local_name.as_deref().unwrap_or("unnamed"),
                advertisement.rssi
            );
            let peripheral = Arc::new(Mutex::new(
                Peripheral::new(
                    advertisement.clone(),
                    self.platform.clone(),
                    self.timer.clone(),
                    self.templates.clone(),
                )
                .with_connect_timeout(self.connect_timeout()),
            ));
            peripherals.insert(advertisement.id, peripheral.clone());
            peripheral
        };

        peripheral.lock().connect();
        Vec::new()
    }

    fn get(&self, id: &DeviceId) -> Option<SharedPeripheral> {
        self.peripherals.read().get(id).cloned()
    }

    fn require(&self, id: &DeviceId) -> Result<SharedPeripheral> {
        self.get(id).ok_or_else(|| Error::DeviceNotFound {
            identifier: id.to_string(),
        })
    }

    /// Start a new connect attempt, e.g. after a failure or timeout.
    ///
    /// Returns whether an attempt was started.
    pub fn connect(&self, id: &DeviceId) -> Result<bool> {
        let peripheral = self.require(id)?;
        let started = peripheral.lock().connect();
        Ok(started)
    }

    /// Disconnect a device, keeping it in the registry.
    pub fn disconnect(&self, id: &DeviceId) -> Result<Vec<DeviceEvent>> {
        let peripheral = self.require(id)?;
        let events = peripheral.lock().disconnect();
        Ok(events)
    }

    /// Drop a device from the registry, disconnecting it first.
    pub fn forget(&self, id: &DeviceId) -> Result<Vec<DeviceEvent>> {
        let peripheral = self
            .peripherals
            .write()
            .remove(id)
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: id.to_string(),
            })?;

        info!("Forgetting {}", id);
        let events = peripheral.lock().shutdown();
        Ok(events)
    }

    /// Stop scanning and tear down every link.
    ///
    /// Devices are marked disconnected immediately and their removal events
    /// returned, since nobody will be listening for the platform's own
    /// disconnect completions. Devices stay registered.
    pub fn shutdown(&self) -> Vec<DeviceEvent> {
        self.stop_scan();

        let mut peripherals: Vec<SharedPeripheral> =
            self.peripherals.read().values().cloned().collect();
        peripherals.sort_by_key(|p| p.lock().id().clone());

        peripherals
            .iter()
            .flat_map(|p| p.lock().shutdown())
            .collect()
    }

    /// Ask every connected device for its RSSI.
    pub fn read_rssi_all(&self) -> usize {
        self.peripherals
            .read()
            .values()
            .filter(|p| p.lock().read_rssi())
            .count()
    }

    /// Snapshot of one device.
    pub fn peripheral(&self, id: &DeviceId) -> Option<PeripheralInfo> {
        self.get(id).map(|p| p.lock().info())
    }

    /// Snapshots of every known device, ordered by identifier.
    pub fn peripherals(&self) -> Vec<PeripheralInfo> {
        let mut infos: Vec<PeripheralInfo> = self
            .peripherals
            .read()
            .values()
            .map(|p| p.lock().info())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Whether a device is registered.
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.peripherals.read().contains_key(id)
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.peripherals.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peripherals.read().is_empty()
    }

    /// The first matched serial channel on a device.
    pub fn serial_port(&self, id: &DeviceId) -> Result<SerialPort> {
        let peripheral = self.require(id)?;
        SerialPort::open(peripheral)
    }

    /// Every matched serial channel on every device.
    pub fn serial_ports(&self) -> Vec<SerialPort> {
        let mut peripherals: Vec<SharedPeripheral> =
            self.peripherals.read().values().cloned().collect();
        peripherals.sort_by_key(|p| p.lock().id().clone());

        peripherals
            .into_iter()
            .flat_map(SerialPort::open_all)
            .collect()
    }
}

impl std::fmt::Debug for ScanController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanController")
            .field("power_state", &self.power_state())
            .field("scanning", &self.is_scanning())
            .field("peripherals", &self.len())
            .finish()
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        if self.scanning.swap(false, Ordering::SeqCst) {
            warn!("Scan controller dropped while scanning");
            self.platform.stop_scan();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::connection::ManualConnectTimer;
    use crate::ble::platform::MockBlePlatform;
    use crate::ble::uuids::BLE_NANO_SERVICE_UUID;
    use pretty_assertions::assert_eq;

    fn advertisement(id: &str) -> Advertisement {
        Advertisement {
            id: DeviceId::new(id),
            local_name: None,
            services: vec![BLE_NANO_SERVICE_UUID],
            rssi: Some(-50),
        }
    }

    fn controller(platform: MockBlePlatform) -> ScanController {
        ScanController::new(
            Arc::new(platform),
            Arc::new(ManualConnectTimer::new()),
            &ManagerConfig::default(),
        )
    }

    #[test]
    fn test_scan_is_idempotent() {
        let mut platform = MockBlePlatform::new();
        platform.expect_start_scan().times(1).return_const(());
        platform.expect_stop_scan().times(1).return_const(());
        let c = controller(platform);

        assert!(c.start_scan());
        assert!(!c.start_scan());
        assert!(c.is_scanning());
        assert!(c.stop_scan());
        assert!(!c.stop_scan());
        assert!(!c.is_scanning());
    }

    #[test]
    fn test_discovery_creates_and_connects_once() {
        let mut platform = MockBlePlatform::new();
        platform
            .expect_connect()
            .withf(|id| id.as_str() == "U1")
            .times(1)
            .return_const(());
        let c = controller(platform);

        assert!(c
            .handle_event(PlatformEvent::Discovered(advertisement("U1")))
            .is_empty());
        assert!(c
            .handle_event(PlatformEvent::Discovered(advertisement("U1")))
            .is_empty());

        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_power_off_clears_registry() {
        let mut platform = MockBlePlatform::new();
        platform.expect_connect().times(3).return_const(());
        let c = controller(platform);

        c.handle_event(PlatformEvent::PowerStateChanged(PowerState::PoweredOn));
        for id in ["U1", "U2", "U3"] {
            c.handle_event(PlatformEvent::Discovered(advertisement(id)));
        }
        assert_eq!(c.len(), 3);
        assert!(c.is_alive());

        let events = c.handle_event(PlatformEvent::PowerStateChanged(PowerState::PoweredOff));

        assert!(c.is_empty());
        assert!(!c.is_alive());
        assert_eq!(events, vec![DeviceEvent::SystemStateChanged { alive: false }]);
    }

    #[test]
    fn test_events_for_unknown_devices_ignored() {
        let mut platform = MockBlePlatform::new();
        platform
            .expect_cancel_connection()
            .times(1)
            .return_const(());
        let c = controller(platform);

        assert!(c
            .handle_event(PlatformEvent::Connected(DeviceId::new("ghost")))
            .is_empty());
        assert!(c
            .handle_event(PlatformEvent::RssiRead {
                id: DeviceId::new("ghost"),
                rssi: -80
            })
            .is_empty());
    }

    #[test]
    fn test_connect_unknown_device() {
        let c = controller(MockBlePlatform::new());
        assert!(matches!(
            c.connect(&DeviceId::new("nope")),
            Err(Error::DeviceNotFound { .. })
        ));
    }

    #[test]
    fn test_set_connect_timeout_applies_to_known_devices() {
        let mut platform = MockBlePlatform::new();
        platform.expect_connect().return_const(());
        let c = controller(platform);
        c.handle_event(PlatformEvent::Discovered(advertisement("U1")));

        c.set_connect_timeout(Duration::from_secs(3));

        assert_eq!(c.connect_timeout(), Duration::from_secs(3));
        let peripheral = c.get(&DeviceId::new("U1")).unwrap();
        assert_eq!(peripheral.lock().connect_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_forget_emits_removed_when_live() {
        let mut platform = MockBlePlatform::new();
        platform.expect_connect().return_const(());
        platform.expect_cancel_connection().return_const(());
        let c = controller(platform);
        c.handle_event(PlatformEvent::Discovered(advertisement("U1")));

        let events = c.forget(&DeviceId::new("U1")).unwrap();

        assert!(!c.contains(&DeviceId::new("U1")));
        assert!(matches!(events.as_slice(), [DeviceEvent::PeripheralRemoved(_)]));
    }
}
