#![allow(dead_code)]

use std::sync::Arc;

use btleplug::api::{CharPropFlags, WriteType};
use parking_lot::Mutex;
use serial_rust_ble::ble::uuids::{BLE_NANO_RXTX_UUID, BLE_NANO_SERVICE_UUID};
use serial_rust_ble::ble::{
    Advertisement, BlePlatform, CharacteristicPath, DeviceId, DiscoveredCharacteristic,
    ManualConnectTimer, PlatformEvent, ScanController,
};
use serial_rust_ble::{DeviceEvent, ManagerConfig};
use uuid::Uuid;

/// A command issued to the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    StartScan(Option<Vec<Uuid>>),
    StopScan,
    Connect(DeviceId),
    CancelConnection(DeviceId),
    DiscoverServices(DeviceId),
    DiscoverCharacteristics(DeviceId, Uuid),
    Read(CharacteristicPath),
    Write(CharacteristicPath, Vec<u8>),
    SetNotify(CharacteristicPath, bool),
    ReadRssi(DeviceId),
}

/// Platform that records every command.
#[derive(Debug, Default)]
pub struct RecordingPlatform {
    calls: Mutex<Vec<Call>>,
}

impl RecordingPlatform {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| f(c)).count()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn push(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

impl BlePlatform for RecordingPlatform {
    fn start_scan(&self, filter: Option<Vec<Uuid>>) {
        self.push(Call::StartScan(filter));
    }

    fn stop_scan(&self) {
        self.push(Call::StopScan);
    }

    fn connect(&self, id: &DeviceId) {
        self.push(Call::Connect(id.clone()));
    }

    fn cancel_connection(&self, id: &DeviceId) {
        self.push(Call::CancelConnection(id.clone()));
    }

    fn discover_services(&self, id: &DeviceId, _filter: Option<Vec<Uuid>>) {
        self.push(Call::DiscoverServices(id.clone()));
    }

    fn discover_characteristics(&self, id: &DeviceId, service: Uuid, _filter: Option<Vec<Uuid>>) {
        self.push(Call::DiscoverCharacteristics(id.clone(), service));
    }

    fn read(&self, path: &CharacteristicPath) {
        self.push(Call::Read(path.clone()));
    }

    fn write(&self, path: &CharacteristicPath, data: &[u8], _mode: WriteType) {
        self.push(Call::Write(path.clone(), data.to_vec()));
    }

    fn set_notify(&self, path: &CharacteristicPath, enabled: bool) {
        self.push(Call::SetNotify(path.clone(), enabled));
    }

    fn read_rssi(&self, id: &DeviceId) {
        self.push(Call::ReadRssi(id.clone()));
    }
}

pub struct Harness {
    pub controller: ScanController,
    pub platform: Arc<RecordingPlatform>,
    pub timer: ManualConnectTimer,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let platform = Arc::new(RecordingPlatform::default());
        let timer = ManualConnectTimer::new();
        let controller = ScanController::new(platform.clone(), Arc::new(timer.clone()), &config);
        Self {
            controller,
            platform,
            timer,
        }
    }

    pub fn send(&self, event: PlatformEvent) -> Vec<DeviceEvent> {
        self.controller.handle_event(event)
    }

    pub fn discover(&self, id: &str) -> Vec<DeviceEvent> {
        self.send(PlatformEvent::Discovered(advertisement(id)))
    }

    /// Discover, connect and find a BLE-Nano service on a device.
    pub fn bring_up_nano(&self, id: &str) -> Vec<DeviceEvent> {
        let device = DeviceId::new(id);
        let mut events = self.discover(id);
        events.extend(self.send(PlatformEvent::Connected(device.clone())));
        events.extend(self.send(PlatformEvent::ServicesDiscovered {
            id: device.clone(),
            services: vec![BLE_NANO_SERVICE_UUID],
        }));
        events.extend(self.send(PlatformEvent::CharacteristicsDiscovered {
            id: device,
            service: BLE_NANO_SERVICE_UUID,
            characteristics: vec![nano_rxtx()],
        }));
        events
    }
}

pub fn advertisement(id: &str) -> Advertisement {
    Advertisement {
        id: DeviceId::new(id),
        local_name: Some(format!("dev-{}", id)),
        services: Vec::new(),
        rssi: Some(-60),
    }
}

pub fn nano_rxtx() -> DiscoveredCharacteristic {
    DiscoveredCharacteristic::new(
        BLE_NANO_RXTX_UUID,
        CharPropFlags::READ | CharPropFlags::WRITE | CharPropFlags::NOTIFY,
    )
}

pub fn nano_path(id: &str) -> CharacteristicPath {
    CharacteristicPath::new(DeviceId::new(id), BLE_NANO_SERVICE_UUID, BLE_NANO_RXTX_UUID)
}

pub fn removed(events: &[DeviceEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, DeviceEvent::PeripheralRemoved(_)))
        .count()
}

pub fn created(events: &[DeviceEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, DeviceEvent::PeripheralCreated(_)))
        .count()
}
