// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # serial-rust-ble
//!
//! A cross-platform Rust library for finding serial-over-BLE modules and
//! exchanging framed messages with them.
//!
//! Every peripheral seen while scanning is connected, its services are
//! discovered, and each service is checked against a list of serial
//! *templates*: a service UUID plus the RX and TX characteristics that carry
//! the byte stream. A service that implements a template becomes a
//! [`SerialPort`].
//!
//! ## Features
//!
//! - **Discovery**: Scan, connect and discover every nearby peripheral
//! - **Template Matching**: Recognise BLE-Nano (FFE0/FFE1), Nordic UART or custom profiles
//! - **Connect Timeouts**: Abandon stalled connection attempts
//! - **Message Framing**: Hex-encoded, length-prefixed command frames
//! - **Favourites**: Remember devices across sessions through a preference store
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serial_rust_ble::{DeviceEvent, DeviceManager, Message, Command, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Create device manager and start scanning
//!     let manager = DeviceManager::new().await?;
//!     let mut events = manager.subscribe();
//!     manager.start_scanning()?;
//!
//!     // Wait for the first serial module
//!     while let Ok(event) = events.recv().await {
//!         if let DeviceEvent::MatchChanged { id, matched: true, .. } = event {
//!             let port = manager.serial_port(&id)?;
//!             port.notify(true)?;
//!             port.send(&Message::command(Command::Identity))?;
//!             break;
//!         }
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization of identifiers and TOML configuration files

// Public modules
pub mod ble;
pub mod config;
pub mod device_manager;
pub mod error;
pub mod favourites;
pub mod protocol;
pub mod serial;
pub mod template;

// Re-exports for convenience
pub use config::ManagerConfig;
pub use device_manager::{CallbackHandle, DeviceManager};
pub use error::{Error, Result};
pub use favourites::{Favourites, FavouritesChange, MemoryPreferenceStore, PreferenceStore};
pub use serial::SerialPort;
pub use template::{Template, TemplateRegistry};

// Re-export commonly used types from submodules
pub use ble::connection::ConnectionState;
pub use ble::events::{DeviceEvent, PeripheralInfo, ServiceInfo};
pub use ble::platform::{CharacteristicPath, DeviceId, PowerState};
pub use ble::scanner::ScanController;
pub use protocol::{Command, FrameError, Message};
