//! Security Manager Protocol (SMP) implementation
//!
//! This module implements LE legacy pairing as used by the Bluetooth host:
//! - Deciding the pairing method from both sides' IO capabilities
//! - Exchanging confirm values and randoms, deriving the STK
//! - Starting or restoring link encryption through the controller
//! - Distributing and storing bonding keys

pub mod constants;
pub mod crypto;
mod host;
mod keys;
mod legacy;
mod manager;
mod pairing;
pub mod resolver;
mod types;


// Re-export public API
pub use self::host::UartSmHost;
pub use self::keys::*;
pub use self::manager::{SecurityManager, SmEventCallback, SmHost};
pub use self::pairing::*;
pub use self::types::*;
