//! Device manager for discovering serial-over-BLE peripherals.
//!
//! Wraps a [`ScanController`] in the tokio runtime: one task consumes
//! platform completions and publishes [`DeviceEvent`]s, another runs scan
//! start/stop requests so callers never wait on the radio.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Interval;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::btleplug_platform::BtleplugPlatform;
use crate::ble::connection::{ConnectTimer, TokioConnectTimer};
use crate::ble::events::{DeviceEvent, PeripheralInfo};
use crate::ble::platform::{BlePlatform, DeviceId, PlatformEvent, PowerState};
use crate::ble::scanner::ScanController;
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::serial::SerialPort;

/// Handle for a registered callback. Dropping it unregisters the callback.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

/// Requests for the scan worker.
#[derive(Debug)]
enum ScanCommand {
    Start,
    StartWith(Option<Vec<Uuid>>),
    Stop,
}

/// Central manager for discovering and talking to serial peripherals.
pub struct DeviceManager {
    /// Peripheral registry and state machines.
    controller: Arc<ScanController>,
    /// Listener channel.
    event_tx: broadcast::Sender<DeviceEvent>,
    /// Scan worker queue.
    scan_tx: mpsc::UnboundedSender<ScanCommand>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Event loop task handle.
    event_loop: Mutex<Option<JoinHandle<()>>>,
    /// Scan worker task handle.
    scan_worker: Mutex<Option<JoinHandle<()>>>,
    /// Running flag.
    is_running: Arc<AtomicBool>,
}

impl DeviceManager {
    /// Create a DeviceManager on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_config(ManagerConfig::default()).await
    }

    /// Create a DeviceManager on the first Bluetooth adapter with a configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_config(config: ManagerConfig) -> Result<Self> {
        let (platform, events) = BtleplugPlatform::new().await?;
        let timer = TokioConnectTimer::new(platform.event_sender());
        platform.start().await?;

        Ok(Self::with_platform(
            Arc::new(platform),
            events,
            Arc::new(timer),
            config,
        ))
    }

    /// Create a DeviceManager over any platform stack.
    ///
    /// `events` must carry every completion of `platform` and every timeout
    /// of `timer`. Must be called within a tokio runtime.
    pub fn with_platform(
        platform: Arc<dyn BlePlatform>,
        events: mpsc::UnboundedReceiver<PlatformEvent>,
        timer: Arc<dyn ConnectTimer>,
        config: ManagerConfig,
    ) -> Self {
        let controller = Arc::new(ScanController::new(platform, timer, &config));
        let (event_tx, _) = broadcast::channel(config.event_capacity);
        let (scan_tx, scan_rx) = mpsc::unbounded_channel();
        let is_running = Arc::new(AtomicBool::new(true));

        let event_loop = Self::spawn_event_loop(
            controller.clone(),
            events,
            event_tx.clone(),
            config.rssi_interval,
            is_running.clone(),
        );
        let scan_worker = Self::spawn_scan_worker(controller.clone(), scan_rx);

        Self {
            controller,
            event_tx,
            scan_tx,
            callback_counter: AtomicU64::new(0),
            event_loop: Mutex::new(Some(event_loop)),
            scan_worker: Mutex::new(Some(scan_worker)),
            is_running,
        }
    }

    fn spawn_event_loop(
        controller: Arc<ScanController>,
        mut events: mpsc::UnboundedReceiver<PlatformEvent>,
        event_tx: broadcast::Sender<DeviceEvent>,
        rssi_interval: Option<Duration>,
        is_running: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rssi_tick = rssi_interval.map(|period| {
                tokio::time::interval_at(tokio::time::Instant::now() + period, period)
            });

            while is_running.load(Ordering::SeqCst) {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else {
                            debug!("Platform event channel closed");
                            break;
                        };
                        Self::publish(&event_tx, controller.handle_event(event));
                    }
                    _ = Self::tick(&mut rssi_tick) => {
                        let polled = controller.read_rssi_all();
                        trace!("Polled RSSI on {} devices", polled);
                    }
                }
            }

            debug!("Device manager event loop ended");
        })
    }

    fn spawn_scan_worker(
        controller: Arc<ScanController>,
        mut scan_rx: mpsc::UnboundedReceiver<ScanCommand>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(command) = scan_rx.recv().await {
                trace!("Scan worker: {:?}", command);
                match command {
                    ScanCommand::Start => {
                        controller.start_scan();
                    }
                    ScanCommand::StartWith(filter) => {
                        controller.start_scan_with(filter);
                    }
                    ScanCommand::Stop => {
                        controller.stop_scan();
                    }
                }
            }
        })
    }

    async fn tick(interval: &mut Option<Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    fn publish(event_tx: &broadcast::Sender<DeviceEvent>, events: Vec<DeviceEvent>) {
        for event in events {
            trace!("Publishing {}", event.kind());
            // No receivers is fine.
            let _ = event_tx.send(event);
        }
    }

    /// Start scanning with the configured filter.
    pub fn start_scanning(&self) -> Result<()> {
        self.send_scan(ScanCommand::Start)
    }

    /// Start scanning for devices advertising one of these services.
    pub fn start_scanning_with(&self, services: Vec<Uuid>) -> Result<()> {
        self.send_scan(ScanCommand::StartWith(Some(services)))
    }

    /// Stop scanning.
    pub fn stop_scanning(&self) -> Result<()> {
        self.send_scan(ScanCommand::Stop)
    }

    fn send_scan(&self, command: ScanCommand) -> Result<()> {
        self.scan_tx.send(command).map_err(|_| Error::ChannelClosed)
    }

    /// Subscribe to device events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.event_tx.subscribe()
    }

    /// Register a callback for every device event.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(DeviceEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.event_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Callback {} missed {} events", callback_id, missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback for adapter power changes.
    pub fn on_system_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let DeviceEvent::SystemStateChanged { alive } = event {
                callback(alive);
            }
        })
    }

    /// Register a callback for values received on any characteristic.
    pub fn on_value_received<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(crate::ble::platform::CharacteristicPath, bytes::Bytes) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let DeviceEvent::ValueReceived { path, value } = event {
                callback(path, value);
            }
        })
    }

    /// Snapshots of every known device.
    pub fn peripherals(&self) -> Vec<PeripheralInfo> {
        self.controller.peripherals()
    }

    /// Snapshot of one device.
    pub fn peripheral(&self, id: &DeviceId) -> Option<PeripheralInfo> {
        self.controller.peripheral(id)
    }

    /// Number of known devices.
    pub fn peripheral_count(&self) -> usize {
        self.controller.len()
    }

    /// The first matched serial channel on a device.
    pub fn serial_port(&self, id: &DeviceId) -> Result<SerialPort> {
        self.controller.serial_port(id)
    }

    /// Every matched serial channel.
    pub fn serial_ports(&self) -> Vec<SerialPort> {
        self.controller.serial_ports()
    }

    /// Retry a connection, e.g. after a failure or timeout.
    pub fn connect(&self, id: &DeviceId) -> Result<bool> {
        self.controller.connect(id)
    }

    /// Disconnect a device.
    pub fn disconnect(&self, id: &DeviceId) -> Result<()> {
        let events = self.controller.disconnect(id)?;
        Self::publish(&self.event_tx, events);
        Ok(())
    }

    /// Disconnect and forget a device.
    pub fn forget(&self, id: &DeviceId) -> Result<()> {
        let events = self.controller.forget(id)?;
        Self::publish(&self.event_tx, events);
        Ok(())
    }

    /// Override the connect timeout.
    pub fn set_timeout_value(&self, timeout: Duration) {
        self.controller.set_connect_timeout(timeout);
    }

    /// Current connect timeout.
    pub fn timeout_value(&self) -> Duration {
        self.controller.connect_timeout()
    }

    /// Whether the adapter is powered on.
    pub fn is_alive(&self) -> bool {
        self.controller.is_alive()
    }

    /// Last reported adapter state.
    pub fn power_state(&self) -> PowerState {
        self.controller.power_state()
    }

    /// Whether a scan has been requested and not stopped since.
    ///
    /// This is the requested state, not a query of the adapter. It is
    /// cleared when the adapter powers off and is not restored on power-on.
    pub fn is_scanning(&self) -> bool {
        self.controller.is_scanning()
    }

    /// The underlying scan controller.
    pub fn controller(&self) -> &Arc<ScanController> {
        &self.controller
    }

    /// Clean shutdown of all connections and scanning.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");

        self.is_running.store(false, Ordering::SeqCst);
        let handles = [self.scan_worker.lock().take(), self.event_loop.lock().take()];
        for handle in handles.into_iter().flatten() {
            handle.abort();
            let _ = handle.await;
        }

        // Disconnect completions can no longer arrive, so report them here.
        Self::publish(&self.event_tx, self.controller.shutdown());

        Ok(())
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.scan_worker.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::connection::ManualConnectTimer;
    use crate::ble::platform::MockBlePlatform;
    use std::sync::atomic::AtomicUsize;

    fn manager(
        platform: MockBlePlatform,
    ) -> (DeviceManager, mpsc::UnboundedSender<PlatformEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = DeviceManager::with_platform(
            Arc::new(platform),
            rx,
            Arc::new(ManualConnectTimer::new()),
            ManagerConfig::default(),
        );
        (manager, tx)
    }

    #[test]
    fn test_callback_handle_unregisters_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = CallbackHandle::new(7, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(handle.id(), 7);
        handle.unregister();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_power_events_published() {
        let (manager, tx) = manager(MockBlePlatform::new());
        let mut rx = manager.subscribe();

        tx.send(PlatformEvent::PowerStateChanged(PowerState::PoweredOn))
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            DeviceEvent::SystemStateChanged { alive: true }
        );
        assert!(manager.is_alive());
    }

    #[tokio::test]
    async fn test_scan_runs_on_worker() {
        let mut platform = MockBlePlatform::new();
        platform.expect_start_scan().times(1).return_const(());
        platform.expect_stop_scan().times(1).return_const(());
        let (manager, _tx) = manager(platform);

        manager.start_scanning().unwrap();
        manager.start_scanning().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.is_scanning());

        manager.stop_scanning().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!manager.is_scanning());
    }

    #[tokio::test]
    async fn test_timeout_value_roundtrip() {
        let (manager, _tx) = manager(MockBlePlatform::new());
        assert_eq!(manager.timeout_value(), Duration::from_secs(10));

        manager.set_timeout_value(Duration::from_secs(4));
        assert_eq!(manager.timeout_value(), Duration::from_secs(4));
    }
}
