//! Bluetooth HCI (Host Controller Interface) UART transport
//!
//! This module frames HCI packets over an H4 byte stream and manages the
//! fixed buffer pools the framers draw from.

pub mod constants;
pub mod framer;
pub mod packet;
pub mod pool;
pub mod transport;

#[cfg(test)]
mod tests;

pub use framer::{RxFramer, Stall, TxFramer, WireLog};
pub use packet::{
    DisconnectionComplete, EncryptionChange, HciCommand, HciEvent, LtkRequest, PacketType,
};
pub use pool::{AclChain, BufferKind, BufferPool, PacketBuffer};
pub use transport::{
    HciUart, QueuedPacket, RxHandler, StatsSnapshot, TransportStats, TxQueue, UartDriver,
};
