//! Connection-level GAP types shared by the transport and the Security Manager

pub mod constants;
pub mod types;

pub use constants::*;
pub use types::*;
