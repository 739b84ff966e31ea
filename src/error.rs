//! Error types for the serial-rust-ble crate.

use thiserror::Error;

use crate::protocol::FrameError;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// A UUID string could not be parsed.
    #[error("Invalid UUID: {value}")]
    InvalidUuid {
        /// The text that failed to parse.
        value: String,
    },

    /// A serial template entry was malformed.
    #[error("Invalid template {name}: {reason}")]
    InvalidTemplate {
        /// Name of the offending template.
        name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A message frame could not be built or decoded.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// The specified device is not in the registry.
    #[error("Device not found: {identifier}")]
    DeviceNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// Operation requires a connection but the device is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// The device has no service matching a serial template.
    #[error("No serial template matched on {identifier}")]
    NotMatched {
        /// The device that was inspected.
        identifier: String,
    },

    /// The platform event channel was closed.
    #[error("Platform event channel closed")]
    ChannelClosed,

    /// Configuration could not be loaded.
    #[cfg(feature = "serde")]
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_error_converts() {
        let err: Error = FrameError::NoHeader.into();
        assert!(matches!(err, Error::Frame(FrameError::NoHeader)));
        assert_eq!(err.to_string(), "Frame error: missing frame header");
    }

    #[test]
    fn test_display_includes_identifier() {
        let err = Error::DeviceNotFound {
            identifier: "AA:BB".to_string(),
        };
        assert_eq!(err.to_string(), "Device not found: AA:BB");
    }
}
