//! BLE Service and Characteristic UUIDs.
//!
//! Contains the UUID constants used to recognise serial-over-BLE devices,
//! plus helpers for the Bluetooth SIG 16-bit short form.

use uuid::Uuid;

use crate::error::{Error, Result};

/// Bluetooth SIG base UUID (`0000xxxx-0000-1000-8000-00805f9b34fb`).
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb);

// Device Information Service (Standard BLE)
/// Standard BLE Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180a_0000_1000_8000_00805f9b34fb);
/// Manufacturer Name characteristic UUID.
pub const MANUFACTURER_NAME_UUID: Uuid = Uuid::from_u128(0x0000_2a29_0000_1000_8000_00805f9b34fb);
/// Serial Number characteristic UUID.
pub const SERIAL_NUMBER_UUID: Uuid = Uuid::from_u128(0x0000_2a25_0000_1000_8000_00805f9b34fb);

// Characteristics some stacks refuse to read
/// Battery Level characteristic UUID.
pub const BATTERY_LEVEL_UUID: Uuid = Uuid::from_u128(0x0000_2a19_0000_1000_8000_00805f9b34fb);
/// Local Time Information characteristic UUID.
pub const LOCAL_TIME_INFO_UUID: Uuid = Uuid::from_u128(0x0000_2a0f_0000_1000_8000_00805f9b34fb);
/// Current Time characteristic UUID.
pub const CURRENT_TIME_UUID: Uuid = Uuid::from_u128(0x0000_2a2b_0000_1000_8000_00805f9b34fb);

/// Characteristics never read during the bulk read after discovery.
pub const EXCLUDED_READ_UUIDS: [Uuid; 3] = [BATTERY_LEVEL_UUID, LOCAL_TIME_INFO_UUID, CURRENT_TIME_UUID];

// HM-10 / BLE-Nano style modules
/// Single-characteristic serial service (`FFE0`).
pub const BLE_NANO_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_ffe0_0000_1000_8000_00805f9b34fb);
/// Bidirectional serial characteristic (`FFE1`).
pub const BLE_NANO_RXTX_UUID: Uuid = Uuid::from_u128(0x0000_ffe1_0000_1000_8000_00805f9b34fb);

// UART Service (Nordic NUS - Nordic UART Service)
/// Nordic UART Service UUID.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
/// UART RX characteristic UUID (write to device).
pub const UART_RX_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e);
/// UART TX characteristic UUID (notifications from device).
pub const UART_TX_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dcca9e);

/// Expand a 16-bit SIG short UUID onto the Bluetooth base UUID.
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// Return the 16-bit short form if the UUID sits on the Bluetooth base UUID.
pub fn to_short(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    if value & !(0xFFFF_u128 << 96) == BLUETOOTH_BASE_UUID.as_u128() {
        Some((value >> 96) as u16)
    } else {
        None
    }
}

/// Parse a UUID given either in 16-bit short form (`"FFE0"`), 32-bit short
/// form (`"0000FFE0"`) or full hyphenated form.
pub fn parse_uuid(text: &str) -> Result<Uuid> {
    let trimmed = text.trim();
    let invalid = || Error::InvalidUuid {
        value: text.to_string(),
    };

    match trimmed.len() {
        4 => u16::from_str_radix(trimmed, 16)
            .map(from_short)
            .map_err(|_| invalid()),
        8 => u32::from_str_radix(trimmed, 16)
            .map(|v| Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((v as u128) << 96)))
            .map_err(|_| invalid()),
        _ => Uuid::parse_str(trimmed).map_err(|_| invalid()),
    }
}

/// Format a UUID the way the SIG writes it: short form when possible.
pub fn display_uuid(uuid: &Uuid) -> String {
    match to_short(uuid) {
        Some(short) => format!("{:04X}", short),
        None => uuid.to_string(),
    }
}

/// Check if a characteristic is on the excluded-read list.
pub fn is_excluded_from_read(uuid: &Uuid) -> bool {
    EXCLUDED_READ_UUIDS.contains(uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_short_matches_constants() {
        assert_eq!(from_short(0xFFE0), BLE_NANO_SERVICE_UUID);
        assert_eq!(from_short(0x2A19), BATTERY_LEVEL_UUID);
        assert_eq!(from_short(0x180A), DEVICE_INFO_SERVICE_UUID);
    }

    #[test]
    fn test_to_short() {
        assert_eq!(to_short(&BLE_NANO_RXTX_UUID), Some(0xFFE1));
        assert_eq!(to_short(&UART_SERVICE_UUID), None);
    }

    #[test]
    fn test_parse_uuid_forms() {
        assert_eq!(parse_uuid("FFE0").unwrap(), BLE_NANO_SERVICE_UUID);
        assert_eq!(parse_uuid("ffe1").unwrap(), BLE_NANO_RXTX_UUID);
        assert_eq!(parse_uuid("0000FFE0").unwrap(), BLE_NANO_SERVICE_UUID);
        assert_eq!(
            parse_uuid("6e400001-b5a3-f393-e0a9-e50e24dcca9e").unwrap(),
            UART_SERVICE_UUID
        );
    }

    #[test]
    fn test_parse_uuid_rejects_garbage() {
        assert!(matches!(parse_uuid("XYZ1"), Err(Error::InvalidUuid { .. })));
        assert!(parse_uuid("").is_err());
        assert!(parse_uuid("12345").is_err());
    }

    #[test]
    fn test_display_uuid() {
        assert_eq!(display_uuid(&BLE_NANO_SERVICE_UUID), "FFE0");
        assert_eq!(
            display_uuid(&UART_RX_UUID),
            "6e400002-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_excluded_from_read() {
        assert!(is_excluded_from_read(&BATTERY_LEVEL_UUID));
        assert!(is_excluded_from_read(&from_short(0x2A2B)));
        assert!(!is_excluded_from_read(&BLE_NANO_RXTX_UUID));
    }
}
