//! Device manager scenarios on a paused tokio clock.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{advertisement, nano_rxtx, Call, RecordingPlatform};
use serial_rust_ble::ble::uuids::BLE_NANO_SERVICE_UUID;
use serial_rust_ble::ble::{DeviceId, PlatformEvent, PowerState, TokioConnectTimer};
use serial_rust_ble::{DeviceEvent, DeviceManager, ManagerConfig};
use tokio::sync::mpsc;

struct Setup {
    manager: DeviceManager,
    platform: Arc<RecordingPlatform>,
    tx: mpsc::UnboundedSender<PlatformEvent>,
}

fn setup(config: ManagerConfig) -> Setup {
    let platform = Arc::new(RecordingPlatform::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let timer = Arc::new(TokioConnectTimer::new(tx.clone()));
    let manager = DeviceManager::with_platform(platform.clone(), rx, timer, config);
    Setup {
        manager,
        platform,
        tx,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_fires() {
    let s = setup(ManagerConfig::new().with_connect_timeout(Duration::from_secs(2)));
    let mut events = s.manager.subscribe();

    s.tx.send(PlatformEvent::Discovered(advertisement("a")))
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timeout event")
        .unwrap();
    assert!(matches!(event, DeviceEvent::PeripheralRemoved(_)));
    assert!(s
        .platform
        .calls()
        .contains(&Call::CancelConnection(DeviceId::new("a"))));
}

#[tokio::test(start_paused = true)]
async fn test_connected_device_does_not_time_out() {
    let s = setup(ManagerConfig::new().with_connect_timeout(Duration::from_secs(2)));
    let mut events = s.manager.subscribe();
    let id = DeviceId::new("a");

    s.tx.send(PlatformEvent::Discovered(advertisement("a")))
        .unwrap();
    s.tx.send(PlatformEvent::Connected(id.clone())).unwrap();

    let event = events.recv().await.unwrap();
    assert!(matches!(event, DeviceEvent::PeripheralCreated(_)));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(events.try_recv().is_err());
    assert!(s.manager.peripheral(&id).unwrap().state.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_callbacks_receive_events() {
    let s = setup(ManagerConfig::default());
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let handle = s.manager.on_system_state_changed(move |alive| {
        if alive {
            c.fetch_add(1, Ordering::SeqCst);
        }
    });

    s.tx.send(PlatformEvent::PowerStateChanged(PowerState::PoweredOn))
        .unwrap();
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    handle.unregister();
    s.tx.send(PlatformEvent::PowerStateChanged(PowerState::PoweredOn))
        .unwrap();
    settle().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rssi_polling() {
    let s = setup(ManagerConfig::new().with_rssi_interval(Duration::from_secs(1)));
    let id = DeviceId::new("a");

    s.tx.send(PlatformEvent::Discovered(advertisement("a")))
        .unwrap();
    s.tx.send(PlatformEvent::Connected(id.clone())).unwrap();

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(
        s.platform.count(|c| *c == Call::ReadRssi(id.clone())),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_serial_port_through_manager() {
    let s = setup(ManagerConfig::default());
    let mut events = s.manager.subscribe();
    let id = DeviceId::new("a");

    s.tx.send(PlatformEvent::Discovered(advertisement("a")))
        .unwrap();
    s.tx.send(PlatformEvent::Connected(id.clone())).unwrap();
    s.tx.send(PlatformEvent::ServicesDiscovered {
        id: id.clone(),
        services: vec![BLE_NANO_SERVICE_UUID],
    })
    .unwrap();
    s.tx.send(PlatformEvent::CharacteristicsDiscovered {
        id: id.clone(),
        service: BLE_NANO_SERVICE_UUID,
        characteristics: vec![nano_rxtx()],
    })
    .unwrap();

    loop {
        if let DeviceEvent::MatchChanged { matched: true, .. } = events.recv().await.unwrap() {
            break;
        }
    }

    assert_eq!(s.manager.serial_ports().len(), 1);
    let port = s.manager.serial_port(&id).unwrap();
    assert!(port.write(b"ping").unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_disconnects_and_stops() {
    let s = setup(ManagerConfig::default());
    let mut events = s.manager.subscribe();

    s.manager.start_scanning().unwrap();
    s.tx.send(PlatformEvent::Discovered(advertisement("a")))
        .unwrap();
    settle().await;
    assert!(s.manager.is_scanning());

    s.manager.shutdown().await.unwrap();

    assert!(!s.manager.is_scanning());
    assert_eq!(s.platform.count(|c| *c == Call::StopScan), 1);
    assert!(matches!(
        events.recv().await.unwrap(),
        DeviceEvent::PeripheralRemoved(_)
    ));
    assert!(s.manager.start_scanning().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_reports_connected_devices() {
    let s = setup(ManagerConfig::default());
    let mut events = s.manager.subscribe();
    let id = DeviceId::new("a");

    s.tx.send(PlatformEvent::Discovered(advertisement("a")))
        .unwrap();
    s.tx.send(PlatformEvent::Connected(id.clone())).unwrap();
    s.tx.send(PlatformEvent::ServicesDiscovered {
        id: id.clone(),
        services: vec![BLE_NANO_SERVICE_UUID],
    })
    .unwrap();
    s.tx.send(PlatformEvent::CharacteristicsDiscovered {
        id: id.clone(),
        service: BLE_NANO_SERVICE_UUID,
        characteristics: vec![nano_rxtx()],
    })
    .unwrap();
    settle().await;
    s.manager.serial_port(&id).unwrap().notify(true).unwrap();
    while events.try_recv().is_ok() {}

    s.manager.shutdown().await.unwrap();

    assert!(matches!(
        events.recv().await.unwrap(),
        DeviceEvent::ChannelLinkChanged {
            connected: false,
            ..
        }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        DeviceEvent::PeripheralRemoved(info) if info.id == id
    ));
    assert!(s.platform.calls().contains(&Call::CancelConnection(id)));
}

#[tokio::test(start_paused = true)]
async fn test_connect_from_plain_thread() {
    let s = setup(ManagerConfig::new().with_connect_timeout(Duration::from_secs(2)));
    let mut events = s.manager.subscribe();
    let id = DeviceId::new("a");

    s.tx.send(PlatformEvent::Discovered(advertisement("a")))
        .unwrap();
    s.tx.send(PlatformEvent::ConnectFailed {
        id: id.clone(),
        reason: "refused".to_string(),
    })
    .unwrap();
    settle().await;
    while events.try_recv().is_ok() {}

    let started = std::thread::scope(|scope| {
        scope
            .spawn(|| s.manager.connect(&id))
            .join()
            .expect("connect thread")
    });
    assert!(started.unwrap());

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timeout event")
        .unwrap();
    assert!(matches!(event, DeviceEvent::PeripheralRemoved(_)));
}

#[tokio::test(start_paused = true)]
async fn test_power_off_clears_scan_request() {
    let s = setup(ManagerConfig::default());

    s.manager.start_scanning().unwrap();
    settle().await;
    assert!(s.manager.is_scanning());

    s.tx.send(PlatformEvent::PowerStateChanged(PowerState::PoweredOff))
        .unwrap();
    settle().await;
    assert!(!s.manager.is_scanning());
    assert_eq!(s.platform.count(|c| *c == Call::StopScan), 1);

    s.tx.send(PlatformEvent::PowerStateChanged(PowerState::PoweredOn))
        .unwrap();
    settle().await;
    assert!(!s.manager.is_scanning());
}
