//! Error types for the blehost library
//!
//! Transport-level failures live here. Security Manager failures have their
//! own type in [`crate::smp::SmpError`].

use crate::hci::pool::BufferKind;
use thiserror::Error;

/// Errors raised by the HCI UART transport and its buffer pools
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HciError {
    #[error("No free {0:?} buffer")]
    PoolExhausted(BufferKind),

    #[error("Buffer overflow (capacity {capacity} bytes)")]
    BufferOverflow { capacity: usize },

    #[error("Pending-transmit queue is full")]
    QueueFull,

    #[error("Invalid H4 packet type: {0:#04x}")]
    InvalidPacketType(u8),

    #[error("Invalid HCI packet format")]
    InvalidPacketFormat,

    #[error("Invalid transport configuration: {0}")]
    InvalidConfig(String),
}
