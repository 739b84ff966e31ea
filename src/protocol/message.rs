//! Application message frames.
//!
//! Once a serial channel is open, peripherals exchange short framed messages:
//!
//! ```text
//! Header(0xC0) + Command(1) + Length(1) + HexBody(n) + Footer(0xCF)
//! ```
//!
//! The body is carried as lowercase ASCII hex. The length byte always has its
//! high bit set and its low seven bits hold the length of the *encoded* body,
//! so an encoded body can be at most 127 characters long.

use std::fmt;

use thiserror::Error;

/// Frame start marker.
pub const HEADER: u8 = 0xC0;

/// Frame end marker.
pub const FOOTER: u8 = 0xCF;

/// Flag always set on the length byte.
pub const LENGTH_FLAG: u8 = 0x80;

/// Mask selecting the encoded body length from the length byte.
pub const LENGTH_MASK: u8 = 0x7F;

/// Header + command + length + footer.
pub const FRAME_OVERHEAD: usize = 4;

/// Largest raw body that fits once hex encoded into seven bits of length.
pub const MAX_BODY_LEN: usize = (LENGTH_MASK as usize) / 2;

/// Ways a frame can fail to build or decode.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Packet shorter than the fixed frame overhead.
    #[error("packet too short")]
    BadPacket,
    /// First byte is not the frame header.
    #[error("missing frame header")]
    NoHeader,
    /// Last byte is not the frame footer.
    #[error("missing frame footer")]
    NoFooter,
    /// Length byte disagrees with the packet size.
    #[error("length byte does not match packet size")]
    InvalidLength,
    /// Body is not ASCII hex.
    #[error("body is not valid ASCII hex")]
    BadContent,
    /// Body too long to encode.
    #[error("body of {len} bytes exceeds the {max} byte limit")]
    BodyTooLong {
        /// Raw body length that was rejected.
        len: usize,
        /// Largest raw body length accepted.
        max: usize,
    },
}

/// Message commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Command {
    /// Unrecognised or error command (0x00).
    Error = 0x00,
    /// Reset the remote device (0x80).
    Reset = 0x80,
    /// Start streaming (0x81).
    Start = 0x81,
    /// Stop streaming (0x82).
    Stop = 0x82,
    /// Identity query or reply (0x90).
    Identity = 0x90,
    /// Sequence data (0xA0).
    Sequence = 0xA0,
}

impl Command {
    /// Every command, in wire order.
    pub const ALL: [Command; 6] = [
        Self::Error,
        Self::Reset,
        Self::Start,
        Self::Stop,
        Self::Identity,
        Self::Sequence,
    ];

    /// Create from raw byte value. Unknown values map to [`Command::Error`].
    pub fn from_raw(value: u8) -> Self {
        match value {
            0x80 => Self::Reset,
            0x81 => Self::Start,
            0x82 => Self::Stop,
            0x90 => Self::Identity,
            0xA0 => Self::Sequence,
            _ => Self::Error,
        }
    }

    /// Convert to raw byte value.
    pub fn to_raw(&self) -> u8 {
        *self as u8
    }

    /// Anything but [`Command::Error`].
    pub fn is_valid(&self) -> bool {
        !matches!(self, Self::Error)
    }

    /// Upper-case name, as shown in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Reset => "RESET",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Identity => "IDENTITY",
            Self::Sequence => "SEQUENCE",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A complete message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    command: Command,
    body: Vec<u8>,
}

impl Message {
    /// Create a new message.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::BodyTooLong`] if the body would not fit in the
    /// seven-bit encoded length.
    pub fn new(command: Command, body: impl Into<Vec<u8>>) -> Result<Self, FrameError> {
        let body = body.into();
        if body.len() > MAX_BODY_LEN {
            return Err(FrameError::BodyTooLong {
                len: body.len(),
                max: MAX_BODY_LEN,
            });
        }
        Ok(Self { command, body })
    }

    /// Create a message with an empty body.
    pub fn command(command: Command) -> Self {
        Self {
            command,
            body: Vec::new(),
        }
    }

    /// Parse a complete frame.
    ///
    /// Checks run in a fixed order: size, header, footer, length, content.
    /// An unknown command byte is not an error; it decodes as
    /// [`Command::Error`].
    pub fn parse(packet: &[u8]) -> Result<Self, FrameError> {
        if packet.len() < FRAME_OVERHEAD {
            return Err(FrameError::BadPacket);
        }
        if packet[0] != HEADER {
            return Err(FrameError::NoHeader);
        }
        if packet[packet.len() - 1] != FOOTER {
            return Err(FrameError::NoFooter);
        }

        let encoded_len = (packet[2] & LENGTH_MASK) as usize;
        if encoded_len + FRAME_OVERHEAD != packet.len() {
            return Err(FrameError::InvalidLength);
        }

        let content = &packet[3..packet.len() - 1];
        if !content.is_ascii() {
            return Err(FrameError::BadContent);
        }
        let body = hex::decode(content).map_err(|_| FrameError::BadContent)?;

        Ok(Self {
            command: Command::from_raw(packet[1]),
            body,
        })
    }

    /// Serialize the message to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let encoded = hex::encode(&self.body).into_bytes();
        let length = (encoded.len() as u8 & LENGTH_MASK) | LENGTH_FLAG;

        let mut data = Vec::with_capacity(FRAME_OVERHEAD + encoded.len());
        data.push(HEADER);
        data.push(self.command.to_raw());
        data.push(length);
        data.extend_from_slice(&encoded);
        data.push(FOOTER);

        data
    }

    /// Get the command.
    pub fn command_kind(&self) -> Command {
        self.command
    }

    /// Get the raw body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Consume the message, returning its parts.
    pub fn into_parts(self) -> (Command, Vec<u8>) {
        (self.command, self.body)
    }
}

impl TryFrom<&[u8]> for Message {
    type Error = FrameError;

    fn try_from(packet: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(packet)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body: Vec<String> = self.body.iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "{} : [{}]", self.command, body.join(","))
    }
}
