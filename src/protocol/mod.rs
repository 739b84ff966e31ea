//! Protocol module for framing messages over a serial channel.
//!
//! This module contains the implementations for:
//! - Message frame parsing and construction

pub mod message;

pub use message::{Command, FrameError, Message, MAX_BODY_LEN};
