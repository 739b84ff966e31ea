//! Basic example: Find serial modules and ping them
//!
//! Run with: cargo run --example scan_serial

use serial_rust_ble::{Command, DeviceEvent, DeviceManager, ManagerConfig, Message, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("serial_rust_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Scanning for serial-over-BLE modules...\n");

    let config = ManagerConfig::new()
        .with_connect_timeout(Duration::from_secs(8))
        .with_rssi_interval(Duration::from_secs(5));
    let manager = DeviceManager::with_config(config).await?;
    let mut events = manager.subscribe();

    let _power = manager.on_system_state_changed(|alive| {
        println!("Adapter {}", if alive { "on" } else { "off" });
    });

    manager.start_scanning()?;

    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => {
                let Ok(event) = event else { break };
                match event {
                    DeviceEvent::PeripheralCreated(info) => {
                        println!("Connected: {} RSSI {:?} dBm", info.display_name(), info.rssi);
                    }
                    DeviceEvent::PeripheralRemoved(info) => {
                        println!("Gone: {}", info.display_name());
                    }
                    DeviceEvent::ConnectFailed { id, reason } => {
                        println!("Connect to {} failed: {}", id, reason);
                    }
                    DeviceEvent::MatchChanged { id, service, matched: true } => {
                        let port = manager.serial_port(&id)?;
                        println!(
                            "Serial module {} on service {} ({})",
                            id,
                            service,
                            port.template().name()
                        );
                        port.notify(true)?;
                        port.send(&Message::command(Command::Identity))?;
                    }
                    DeviceEvent::ValueReceived { path, .. } => {
                        for port in manager.serial_ports() {
                            if port.rx_path() != path {
                                continue;
                            }
                            while let Some(received) = port.receive() {
                                match received {
                                    Ok(message) => println!("{} <- {}", port.device(), message),
                                    Err(e) => println!("{} <- bad frame: {}", port.device(), e),
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    println!("\nKnown devices:");
    for info in manager.peripherals() {
        println!(
            "  {} [{}] matched: {}",
            info.display_name(),
            info.state,
            info.is_matched()
        );
    }

    manager.shutdown().await?;
    Ok(())
}
