//! BLE communication module.
//!
//! The state machines here ([`ScanController`], [`Peripheral`], [`Service`],
//! [`Characteristic`]) are driven purely by [`PlatformEvent`]s and talk to
//! the radio through the [`BlePlatform`] trait. [`BtleplugPlatform`] is the
//! production implementation of that trait.

pub mod btleplug_platform;
pub mod characteristic;
pub mod connection;
pub mod events;
pub mod peripheral;
pub mod platform;
pub mod scanner;
pub mod service;
pub mod uuids;

pub use btleplug_platform::BtleplugPlatform;
pub use characteristic::Characteristic;
pub use connection::{
    ConnectTimer, ConnectionState, ManualConnectTimer, TimeoutHandle, TokioConnectTimer,
};
pub use events::{CharacteristicInfo, DeviceEvent, PeripheralInfo, ServiceInfo};
pub use peripheral::Peripheral;
pub use platform::{
    Advertisement, BlePlatform, CharacteristicPath, DeviceId, DiscoveredCharacteristic,
    GattOperation, PlatformEvent, PowerState,
};
pub use scanner::{ScanController, SharedPeripheral};
pub use service::{Service, ServiceState};
pub use uuids::*;
