//! Constants for the Security Manager Protocol

// SMP command codes
pub const SMP_PAIRING_REQUEST: u8 = 0x01;
pub const SMP_PAIRING_RESPONSE: u8 = 0x02;
pub const SMP_PAIRING_CONFIRM: u8 = 0x03;
pub const SMP_PAIRING_RANDOM: u8 = 0x04;
pub const SMP_PAIRING_FAILED: u8 = 0x05;
pub const SMP_ENCRYPTION_INFORMATION: u8 = 0x06;
pub const SMP_MASTER_IDENTIFICATION: u8 = 0x07;
pub const SMP_IDENTITY_INFORMATION: u8 = 0x08;
pub const SMP_IDENTITY_ADDRESS_INFORMATION: u8 = 0x09;
pub const SMP_SIGNING_INFORMATION: u8 = 0x0A;
pub const SMP_SECURITY_REQUEST: u8 = 0x0B;
pub const SMP_PAIRING_PUBLIC_KEY: u8 = 0x0C;
pub const SMP_PAIRING_DHK_CHECK: u8 = 0x0D;
pub const SMP_PAIRING_KEYPRESS_NOTIFICATION: u8 = 0x0E;

// SMP fixed channel ID and MTU
pub const SMP_CID: u16 = 0x0006;
pub const SMP_MTU: usize = 65;

// PDU sizes, opcode included
pub const SMP_PAIR_CMD_SZ: usize = 7;
pub const SMP_PAIR_CONFIRM_SZ: usize = 17;
pub const SMP_PAIR_RANDOM_SZ: usize = 17;
pub const SMP_PAIR_FAIL_SZ: usize = 2;
pub const SMP_ENC_INFO_SZ: usize = 17;
pub const SMP_MASTER_IDEN_SZ: usize = 11;
pub const SMP_IDEN_INFO_SZ: usize = 17;
pub const SMP_IDEN_ADDR_INFO_SZ: usize = 8;
pub const SMP_SIGN_INFO_SZ: usize = 17;
pub const SMP_SEC_REQ_SZ: usize = 2;

// IO Capability values
pub const SMP_IO_CAPABILITY_DISPLAY_ONLY: u8 = 0x00;
pub const SMP_IO_CAPABILITY_DISPLAY_YES_NO: u8 = 0x01;
pub const SMP_IO_CAPABILITY_KEYBOARD_ONLY: u8 = 0x02;
pub const SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT: u8 = 0x03;
pub const SMP_IO_CAPABILITY_KEYBOARD_DISPLAY: u8 = 0x04;
pub const SMP_IO_CAPABILITY_COUNT: usize = 5;

// Authentication Requirements bit masks
pub const SMP_AUTH_REQ_BONDING: u8 = 0x01;
pub const SMP_AUTH_REQ_MITM: u8 = 0x04;
pub const SMP_AUTH_REQ_SC: u8 = 0x08;
pub const SMP_AUTH_REQ_KEYPRESS: u8 = 0x10;
/// Bits a legacy pairing command must leave clear
pub const SMP_AUTH_REQ_RESERVED: u8 = 0xE2;

// OOB data flag values
pub const SMP_OOB_DATA_NOT_PRESENT: u8 = 0x00;
pub const SMP_OOB_DATA_PRESENT: u8 = 0x01;

// Pairing Failed reason codes
pub const SMP_REASON_PASSKEY_ENTRY_FAILED: u8 = 0x01;
pub const SMP_REASON_OOB_NOT_AVAILABLE: u8 = 0x02;
pub const SMP_REASON_AUTHENTICATION_REQUIREMENTS: u8 = 0x03;
pub const SMP_REASON_CONFIRM_VALUE_FAILED: u8 = 0x04;
pub const SMP_REASON_PAIRING_NOT_SUPPORTED: u8 = 0x05;
pub const SMP_REASON_ENCRYPTION_KEY_SIZE: u8 = 0x06;
pub const SMP_REASON_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const SMP_REASON_UNSPECIFIED_REASON: u8 = 0x08;
pub const SMP_REASON_REPEATED_ATTEMPTS: u8 = 0x09;
pub const SMP_REASON_INVALID_PARAMETERS: u8 = 0x0A;

// SMP key distribution bit masks
pub const SMP_KEY_DIST_ENC_KEY: u8 = 0x01;
pub const SMP_KEY_DIST_ID_KEY: u8 = 0x02;
pub const SMP_KEY_DIST_SIGN_KEY: u8 = 0x04;
pub const SMP_KEY_DIST_LINK_KEY: u8 = 0x08;
pub const SMP_KEY_DIST_RESERVED: u8 = 0xF0;

// SMP encryption key size limits
pub const SMP_MIN_ENC_KEY_SIZE: u8 = 7;
pub const SMP_MAX_ENC_KEY_SIZE: u8 = 16;

/// Largest passkey a user can enter
pub const SMP_MAX_PASSKEY: u32 = 999_999;

// SMP timeout values (in milliseconds)
pub const SMP_TIMEOUT_GENERAL: u64 = 30000; // 30 seconds general timeout
