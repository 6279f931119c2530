//! blehost - Bluetooth LE host building blocks over an H4 UART
//!
//! This library provides the pieces a BLE host needs underneath GAP:
//! an HCI UART transport with fixed buffer pools and byte-level framers,
//! and a Security Manager implementing LE legacy pairing with key
//! distribution and bond restore.

pub mod config;
pub mod error;
pub mod gap;
pub mod hci;
pub mod smp;

// Re-export common types for convenience
pub use config::{RxOverflowPolicy, SmConfig, TransportConfig};
pub use error::HciError;
pub use gap::{AddressType, BdAddr, ConnectionDirectory, ConnectionInfo};
pub use hci::{
    AclChain, BufferPool, HciCommand, HciEvent, HciUart, PacketBuffer, RxFramer, RxHandler,
    TxFramer, UartDriver,
};
pub use smp::{
    IoCapability, KeyDistribution, KeyStore, MemoryKeyStore, Passkey, PasskeyAction,
    SecurityManager, SmEvent, SmHost, SmpError, SmpResult, UartSmHost,
};
