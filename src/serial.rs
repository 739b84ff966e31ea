//! Serial channel over a matched service.
//!
//! A [`SerialPort`] pairs the RX and TX characteristics a template names.
//! Bytes written go to TX; bytes received are taken from RX, either raw or
//! decoded as [`Message`] frames.

use btleplug::api::WriteType;
use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use crate::ble::platform::{CharacteristicPath, DeviceId};
use crate::ble::scanner::SharedPeripheral;
use crate::error::{Error, Result};
use crate::protocol::{FrameError, Message};
use crate::template::Template;

/// One serial channel on one peripheral.
#[derive(Clone)]
pub struct SerialPort {
    peripheral: SharedPeripheral,
    device: DeviceId,
    service: Uuid,
    template: Template,
}

impl SerialPort {
    /// Open the first matched service of a peripheral.
    ///
    /// # Errors
    ///
    /// [`Error::NotMatched`] if no service is bound to a template.
    pub fn open(peripheral: SharedPeripheral) -> Result<Self> {
        Self::open_all(peripheral.clone())
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotMatched {
                identifier: peripheral.lock().id().to_string(),
            })
    }

    /// Open every matched service of a peripheral.
    pub fn open_all(peripheral: SharedPeripheral) -> Vec<Self> {
        let guard = peripheral.lock();
        let device = guard.id().clone();
        let matched: Vec<(Uuid, Template)> = guard
            .matched_services()
            .filter_map(|s| s.matched_template().map(|t| (s.uuid(), t.clone())))
            .collect();
        drop(guard);

        matched
            .into_iter()
            .map(|(service, template)| Self {
                peripheral: peripheral.clone(),
                device: device.clone(),
                service,
                template,
            })
            .collect()
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn service(&self) -> Uuid {
        self.service
    }

    /// The template this port was bound with.
    pub fn template(&self) -> &Template {
        &self.template
    }

    /// Path of the receive characteristic.
    pub fn rx_path(&self) -> CharacteristicPath {
        CharacteristicPath::new(self.device.clone(), self.service, self.template.rx())
    }

    /// Path of the transmit characteristic.
    pub fn tx_path(&self) -> CharacteristicPath {
        CharacteristicPath::new(self.device.clone(), self.service, self.template.tx())
    }

    /// Whether the underlying peripheral is connected.
    pub fn is_connected(&self) -> bool {
        self.peripheral.lock().is_connected()
    }

    /// Write raw bytes to TX with acknowledgement.
    ///
    /// Returns whether a write was issued; a TX characteristic without write
    /// capability silently drops the data.
    pub fn write(&self, data: &[u8]) -> Result<bool> {
        self.write_with(data, WriteType::WithResponse)
    }

    /// Write raw bytes to TX in the given mode.
    pub fn write_with(&self, data: &[u8], mode: WriteType) -> Result<bool> {
        self.peripheral
            .lock()
            .write_characteristic(&self.service, &self.template.tx(), data, mode)
    }

    /// Request a read of RX.
    pub fn read(&self) -> Result<bool> {
        self.peripheral
            .lock()
            .read_characteristic(&self.service, &self.template.rx())
    }

    /// Switch RX notifications on or off.
    pub fn notify(&self, on: bool) -> Result<()> {
        self.peripheral
            .lock()
            .set_notify(&self.service, &self.template.rx(), on)
    }

    /// Take the oldest unconsumed RX value.
    pub fn take(&self) -> Option<Bytes> {
        self.peripheral
            .lock()
            .take_value(&self.service, &self.template.rx())
    }

    /// Encode and send a message.
    pub fn send(&self, message: &Message) -> Result<bool> {
        debug!("{} -> {}", self.device, message);
        self.write(&message.to_bytes())
    }

    /// Decode the oldest unconsumed RX value as a message.
    ///
    /// `None` means nothing is waiting; a malformed frame is returned as an
    /// error and consumed.
    pub fn receive(&self) -> Option<std::result::Result<Message, FrameError>> {
        let received = self.take()?;
        let message = Message::parse(&received);
        match &message {
            Ok(m) => debug!("{} <- {}", self.device, m),
            Err(e) => debug!("{} <- bad frame: {}", self.device, e),
        }
        Some(message)
    }
}

impl std::fmt::Debug for SerialPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPort")
            .field("device", &self.device)
            .field("service", &self.service)
            .field("template", &self.template.name())
            .finish()
    }
}
