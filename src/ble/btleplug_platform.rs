//! [`BlePlatform`] over btleplug.
//!
//! Commands are spawned onto the tokio runtime and return immediately.
//! Adapter events, command completions and notifications are all
//! translated into [`PlatformEvent`]s on one unbounded channel.

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::ble::platform::{
    Advertisement, BlePlatform, CharacteristicPath, DeviceId, DiscoveredCharacteristic,
    GattOperation, PlatformEvent, PowerState,
};
use crate::error::{Error, Result};

/// A peripheral seen by the adapter.
#[derive(Clone)]
struct Known {
    peripheral: Peripheral,
    name: Option<String>,
}

type KnownMap = Arc<RwLock<HashMap<DeviceId, Known>>>;

/// Platform stack backed by a btleplug adapter.
pub struct BtleplugPlatform {
    /// The BLE adapter.
    adapter: Adapter,
    /// Completion channel.
    events: mpsc::UnboundedSender<PlatformEvent>,
    /// Runtime commands are spawned on.
    runtime: Handle,
    /// Peripherals seen so far.
    known: KnownMap,
    /// Notification pumps by device.
    notification_tasks: Arc<Mutex<HashMap<DeviceId, JoinHandle<()>>>>,
    /// Adapter event pump.
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugPlatform {
    /// Open the first Bluetooth adapter.
    ///
    /// Returns the platform and the receiving end of its event channel.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<PlatformEvent>)> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter)
    }

    /// Use a specific adapter. Must be called within a tokio runtime.
    pub fn with_adapter(
        adapter: Adapter,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PlatformEvent>)> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Internal(format!("no tokio runtime: {}", e)))?;
        let (events, rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                adapter,
                events,
                runtime,
                known: Arc::new(RwLock::new(HashMap::new())),
                notification_tasks: Arc::new(Mutex::new(HashMap::new())),
                pump: Mutex::new(None),
            },
            rx,
        ))
    }

    /// Another sender onto the event channel, e.g. for a connect timer.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<PlatformEvent> {
        self.events.clone()
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Report the current adapter state and start translating adapter events.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter event stream cannot be opened.
    pub async fn start(&self) -> Result<()> {
        if self.pump.lock().is_some() {
            debug!("Adapter event pump already running");
            return Ok(());
        }

        let mut stream = self.adapter.events().await.map_err(Error::Bluetooth)?;

        match self.adapter.adapter_state().await {
            Ok(state) => {
                let _ = self
                    .events
                    .send(PlatformEvent::PowerStateChanged(state.into()));
            }
            Err(e) => error!("Failed to read adapter state: {}", e),
        }

        let adapter = self.adapter.clone();
        let known = self.known.clone();
        let tasks = self.notification_tasks.clone();
        let events = self.events.clone();

        let handle = self.runtime.spawn(async move {
            while let Some(event) = stream.next().await {
                Self::translate(event, &adapter, &known, &tasks, &events).await;
            }
            debug!("Adapter event stream ended");
        });

        *self.pump.lock() = Some(handle);
        Ok(())
    }

    async fn translate(
        event: CentralEvent,
        adapter: &Adapter,
        known: &KnownMap,
        tasks: &Arc<Mutex<HashMap<DeviceId, JoinHandle<()>>>>,
        events: &mpsc::UnboundedSender<PlatformEvent>,
    ) {
        match event {
            CentralEvent::StateUpdate(state) => {
                let _ = events.send(PlatformEvent::PowerStateChanged(PowerState::from(state)));
            }
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ServicesAdvertisement { id, .. } => {
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(p) => p,
                    Err(e) => {
                        trace!("Failed to get peripheral: {}", e);
                        return;
                    }
                };
                let properties = match peripheral.properties().await {
                    Ok(Some(p)) => p,
                    _ => return,
                };

                let device = DeviceId::new(id.to_string());
                let previous = known.write().insert(
                    device.clone(),
                    Known {
                        peripheral,
                        name: properties.local_name.clone(),
                    },
                );

                let advertisement = Advertisement {
                    id: device,
                    local_name: properties.local_name,
                    services: properties.services,
                    rssi: properties.rssi,
                };
                for event in advertisement_events(previous.and_then(|k| k.name), advertisement) {
                    let _ = events.send(event);
                }
            }
            CentralEvent::DeviceConnected(id) => {
                trace!("Adapter reports {} connected", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                let device = DeviceId::new(id.to_string());
                if let Some(task) = tasks.lock().remove(&device) {
                    task.abort();
                }
                let _ = events.send(PlatformEvent::Disconnected(device));
            }
            _ => {}
        }
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future);
    }

    fn peripheral(&self, id: &DeviceId) -> Option<Peripheral> {
        self.known.read().get(id).map(|k| k.peripheral.clone())
    }

    fn fail(
        events: &mpsc::UnboundedSender<PlatformEvent>,
        id: &DeviceId,
        operation: GattOperation,
        characteristic: Option<Uuid>,
        reason: impl ToString,
    ) {
        let _ = events.send(PlatformEvent::OperationFailed {
            id: id.clone(),
            operation,
            characteristic,
            reason: reason.to_string(),
        });
    }

    /// Resolve a path to the btleplug characteristic, reporting a failure if absent.
    fn resolve(
        &self,
        path: &CharacteristicPath,
        operation: GattOperation,
    ) -> Option<(Peripheral, Characteristic)> {
        let Some(peripheral) = self.peripheral(&path.device) else {
            Self::fail(
                &self.events,
                &path.device,
                operation,
                Some(path.characteristic),
                "unknown device",
            );
            return None;
        };

        let found = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == path.characteristic && c.service_uuid == path.service);

        match found {
            Some(characteristic) => Some((peripheral, characteristic)),
            None => {
                Self::fail(
                    &self.events,
                    &path.device,
                    operation,
                    Some(path.characteristic),
                    "characteristic not discovered",
                );
                None
            }
        }
    }

    fn pump_notifications(
        events: &mpsc::UnboundedSender<PlatformEvent>,
        tasks: &Arc<Mutex<HashMap<DeviceId, JoinHandle<()>>>>,
        id: DeviceId,
        peripheral: Peripheral,
    ) {
        let events = events.clone();
        let device = id.clone();

        let handle = tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    error!("Failed to get notifications stream for {}: {}", device, e);
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                let service = peripheral
                    .characteristics()
                    .into_iter()
                    .find(|c| c.uuid == notification.uuid)
                    .map(|c| c.service_uuid);

                match service {
                    Some(service) => {
                        let _ = events.send(PlatformEvent::ValueUpdated {
                            path: CharacteristicPath::new(
                                device.clone(),
                                service,
                                notification.uuid,
                            ),
                            value: Bytes::from(notification.value),
                        });
                    }
                    None => trace!("Notification for unknown characteristic {}", notification.uuid),
                }
            }
            debug!("Notification stream for {} ended", device);
        });

        if let Some(old) = tasks.lock().insert(id, handle) {
            old.abort();
        }
    }
}

/// Events for one advertisement of a device.
///
/// Every advertisement is reported as `Discovered`; the registry above decides
/// whether the device is new, so a device forgotten or dropped by a power-off
/// comes back on its next advertisement. A changed name on a device seen
/// before is also reported.
fn advertisement_events(
    previous_name: Option<String>,
    advertisement: Advertisement,
) -> Vec<PlatformEvent> {
    let renamed = match (&previous_name, &advertisement.local_name) {
        (Some(old), Some(new)) if old != new => Some(PlatformEvent::NameUpdated {
            id: advertisement.id.clone(),
            name: new.clone(),
        }),
        _ => None,
    };

    let mut events = vec![PlatformEvent::Discovered(advertisement)];
    events.extend(renamed);
    events
}

impl BlePlatform for BtleplugPlatform {
    fn start_scan(&self, filter: Option<Vec<Uuid>>) {
        let adapter = self.adapter.clone();
        let filter = ScanFilter {
            services: filter.unwrap_or_default(),
        };
        self.spawn(async move {
            if let Err(e) = adapter.start_scan(filter).await {
                error!("Failed to start scan: {}", e);
            }
        });
    }

    fn stop_scan(&self) {
        let adapter = self.adapter.clone();
        self.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                error!("Failed to stop scan: {}", e);
            }
        });
    }

    fn connect(&self, id: &DeviceId) {
        let Some(peripheral) = self.peripheral(id) else {
            let _ = self.events.send(PlatformEvent::ConnectFailed {
                id: id.clone(),
                reason: "unknown device".to_string(),
            });
            return;
        };

        let events = self.events.clone();
        let tasks = self.notification_tasks.clone();
        let id = id.clone();
        self.spawn(async move {
            match peripheral.connect().await {
                Ok(()) => {
                    Self::pump_notifications(&events, &tasks, id.clone(), peripheral);
                    let _ = events.send(PlatformEvent::Connected(id));
                }
                Err(e) => {
                    let _ = events.send(PlatformEvent::ConnectFailed {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        });
    }

    fn cancel_connection(&self, id: &DeviceId) {
        if let Some(task) = self.notification_tasks.lock().remove(id) {
            task.abort();
        }
        let Some(peripheral) = self.peripheral(id) else {
            return;
        };

        let events = self.events.clone();
        let id = id.clone();
        self.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                Self::fail(&events, &id, GattOperation::Disconnect, None, e);
            }
        });
    }

    fn discover_services(&self, id: &DeviceId, filter: Option<Vec<Uuid>>) {
        let Some(peripheral) = self.peripheral(id) else {
            Self::fail(&self.events, id, GattOperation::DiscoverServices, None, "unknown device");
            return;
        };

        let events = self.events.clone();
        let id = id.clone();
        self.spawn(async move {
            if let Err(e) = peripheral.discover_services().await {
                Self::fail(&events, &id, GattOperation::DiscoverServices, None, e);
                return;
            }

            let services: Vec<Uuid> = peripheral
                .services()
                .into_iter()
                .map(|s| s.uuid)
                .filter(|uuid| filter.as_ref().map_or(true, |f| f.contains(uuid)))
                .collect();
            let _ = events.send(PlatformEvent::ServicesDiscovered { id, services });
        });
    }

    fn discover_characteristics(&self, id: &DeviceId, service: Uuid, filter: Option<Vec<Uuid>>) {
        let found = self.peripheral(id).and_then(|p| {
            p.services().into_iter().find(|s| s.uuid == service)
        });

        let event = match found {
            Some(s) => PlatformEvent::CharacteristicsDiscovered {
                id: id.clone(),
                service,
                characteristics: s
                    .characteristics
                    .into_iter()
                    .filter(|c| filter.as_ref().map_or(true, |f| f.contains(&c.uuid)))
                    .map(|c| DiscoveredCharacteristic::new(c.uuid, c.properties))
                    .collect(),
            },
            None => PlatformEvent::CharacteristicDiscoveryFailed {
                id: id.clone(),
                service,
                reason: "service not discovered".to_string(),
            },
        };
        let _ = self.events.send(event);
    }

    fn read(&self, path: &CharacteristicPath) {
        let Some((peripheral, characteristic)) = self.resolve(path, GattOperation::Read) else {
            return;
        };

        let events = self.events.clone();
        let path = path.clone();
        self.spawn(async move {
            match peripheral.read(&characteristic).await {
                Ok(value) => {
                    trace!("Read {} bytes from {}", value.len(), path);
                    let _ = events.send(PlatformEvent::ValueUpdated {
                        path,
                        value: Bytes::from(value),
                    });
                }
                Err(e) => Self::fail(
                    &events,
                    &path.device,
                    GattOperation::Read,
                    Some(path.characteristic),
                    e,
                ),
            }
        });
    }

    fn write(&self, path: &CharacteristicPath, data: &[u8], mode: WriteType) {
        let Some((peripheral, characteristic)) = self.resolve(path, GattOperation::Write) else {
            return;
        };

        let events = self.events.clone();
        let path = path.clone();
        let data = data.to_vec();
        self.spawn(async move {
            if let Err(e) = peripheral.write(&characteristic, &data, mode).await {
                Self::fail(
                    &events,
                    &path.device,
                    GattOperation::Write,
                    Some(path.characteristic),
                    e,
                );
            }
        });
    }

    fn set_notify(&self, path: &CharacteristicPath, enabled: bool) {
        let Some((peripheral, characteristic)) = self.resolve(path, GattOperation::SetNotify)
        else {
            return;
        };

        let events = self.events.clone();
        let path = path.clone();
        self.spawn(async move {
            let result = if enabled {
                peripheral.subscribe(&characteristic).await
            } else {
                peripheral.unsubscribe(&characteristic).await
            };
            if let Err(e) = result {
                Self::fail(
                    &events,
                    &path.device,
                    GattOperation::SetNotify,
                    Some(path.characteristic),
                    e,
                );
            }
        });
    }

    fn read_rssi(&self, id: &DeviceId) {
        let Some(peripheral) = self.peripheral(id) else {
            return;
        };

        let events = self.events.clone();
        let id = id.clone();
        self.spawn(async move {
            match peripheral.properties().await {
                Ok(Some(properties)) => match properties.rssi {
                    Some(rssi) => {
                        let _ = events.send(PlatformEvent::RssiRead { id, rssi });
                    }
                    None => Self::fail(&events, &id, GattOperation::ReadRssi, None, "no RSSI"),
                },
                Ok(None) => Self::fail(&events, &id, GattOperation::ReadRssi, None, "no properties"),
                Err(e) => Self::fail(&events, &id, GattOperation::ReadRssi, None, e),
            }
        });
    }
}

impl Drop for BtleplugPlatform {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        for (_, task) in self.notification_tasks.lock().drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn advertisement(name: Option<&str>) -> Advertisement {
        Advertisement {
            id: DeviceId::new("A"),
            local_name: name.map(str::to_string),
            services: Vec::new(),
            rssi: Some(-50),
        }
    }

    #[test]
    fn test_repeat_advertisement_still_discovered() {
        let events = advertisement_events(Some("nano".to_string()), advertisement(Some("nano")));
        assert_eq!(
            events,
            vec![PlatformEvent::Discovered(advertisement(Some("nano")))]
        );
    }

    #[test]
    fn test_first_advertisement() {
        let events = advertisement_events(None, advertisement(Some("nano")));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PlatformEvent::Discovered(_)));
    }

    #[test]
    fn test_renamed_device_reports_name() {
        let events = advertisement_events(Some("old".to_string()), advertisement(Some("new")));
        assert_eq!(
            events,
            vec![
                PlatformEvent::Discovered(advertisement(Some("new"))),
                PlatformEvent::NameUpdated {
                    id: DeviceId::new("A"),
                    name: "new".to_string(),
                },
            ]
        );
    }
}
