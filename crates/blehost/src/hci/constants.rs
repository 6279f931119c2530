//! HCI protocol constants
//!
//! H4 packet discriminants, header sizes and the handful of commands and
//! events the Security Manager exchanges with the controller.

// H4 packet types
pub const H4_NONE: u8 = 0x00;
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_SCO_PKT: u8 = 0x03;
pub const HCI_EVENT_PKT: u8 = 0x04;

// Header sizes, not counting the H4 type byte
pub const HCI_CMD_HDR_LEN: usize = 3;
pub const HCI_ACL_HDR_LEN: usize = 4;
pub const HCI_SCO_HDR_LEN: usize = 3;
pub const HCI_EVT_HDR_LEN: usize = 2;

// Maximum size of HCI command parameters
pub const HCI_MAX_PARAM_LEN: usize = 255;

/// Size of the dedicated host command buffer
pub const HCI_TRANS_CMD_SZ: usize = 260;

// Transport defaults
pub const DEFAULT_NUM_EVT_BUFS: usize = 8;
pub const DEFAULT_EVT_BUF_SIZE: usize = 260;
pub const DEFAULT_NUM_ACL_BUFS: usize = 8;
pub const DEFAULT_ACL_BUF_SIZE: usize = 255;

/// Bytes kept by each direction's wire log
pub const WIRE_LOG_SZ: usize = 1024;

// OGF values
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_LE: u8 = 0x08;

// Link Control Commands (OGF: 0x01)
pub const OCF_DISCONNECT: u16 = 0x0006;

// LE Command OCF values (OGF: 0x08)
pub const OCF_LE_START_ENCRYPT: u16 = 0x0019;
pub const OCF_LE_LT_KEY_REQ_REPLY: u16 = 0x001A;
pub const OCF_LE_LT_KEY_REQ_NEG_REPLY: u16 = 0x001B;

// HCI Events
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_ENC_KEY_REFRESH: u8 = 0x30;
pub const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta Events
pub const EVT_LE_LT_KEY_REQ: u8 = 0x05;
