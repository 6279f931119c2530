//! Type definitions for the Security Manager Protocol
use super::constants::*;
use crate::gap::BdAddr;
use bitflags::bitflags;
use std::fmt;
use thiserror::Error;

/// SMP Error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmpError {
    /// We aborted the procedure and told the peer why
    #[error("Pairing failed locally: {0}")]
    Local(PairingFailureReason),

    /// The peer sent Pairing Failed
    #[error("Pairing failed by peer: {0}")]
    Peer(PairingFailureReason),

    #[error("Not connected")]
    NotConnected,

    #[error("No matching procedure or key")]
    NotFound,

    #[error("Procedure already in progress")]
    Already,

    #[error("No free procedure slot")]
    NoResources,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Operation timeout")]
    Timeout,

    #[error("Operation not supported")]
    NotSupported,

    #[error("Malformed PDU")]
    BadData,

    #[error("Controller error: {0}")]
    Controller(String),

    #[error("HCI status {0:#04x}")]
    Hci(u8),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<crate::error::HciError> for SmpError {
    fn from(err: crate::error::HciError) -> Self {
        SmpError::Transport(err.to_string())
    }
}

/// Result type for SMP operations
pub type SmpResult<T> = Result<T, SmpError>;

/// Reason codes carried by Pairing Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PairingFailureReason {
    PasskeyEntryFailed = SMP_REASON_PASSKEY_ENTRY_FAILED,
    OobNotAvailable = SMP_REASON_OOB_NOT_AVAILABLE,
    AuthenticationRequirements = SMP_REASON_AUTHENTICATION_REQUIREMENTS,
    ConfirmValueFailed = SMP_REASON_CONFIRM_VALUE_FAILED,
    PairingNotSupported = SMP_REASON_PAIRING_NOT_SUPPORTED,
    EncryptionKeySize = SMP_REASON_ENCRYPTION_KEY_SIZE,
    CommandNotSupported = SMP_REASON_COMMAND_NOT_SUPPORTED,
    UnspecifiedReason = SMP_REASON_UNSPECIFIED_REASON,
    RepeatedAttempts = SMP_REASON_REPEATED_ATTEMPTS,
    InvalidParameters = SMP_REASON_INVALID_PARAMETERS,
}

impl PairingFailureReason {
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Convert from the wire value; unknown codes map to `UnspecifiedReason`
    pub fn from_u8(value: u8) -> Self {
        match value {
            SMP_REASON_PASSKEY_ENTRY_FAILED => Self::PasskeyEntryFailed,
            SMP_REASON_OOB_NOT_AVAILABLE => Self::OobNotAvailable,
            SMP_REASON_AUTHENTICATION_REQUIREMENTS => Self::AuthenticationRequirements,
            SMP_REASON_CONFIRM_VALUE_FAILED => Self::ConfirmValueFailed,
            SMP_REASON_PAIRING_NOT_SUPPORTED => Self::PairingNotSupported,
            SMP_REASON_ENCRYPTION_KEY_SIZE => Self::EncryptionKeySize,
            SMP_REASON_COMMAND_NOT_SUPPORTED => Self::CommandNotSupported,
            SMP_REASON_REPEATED_ATTEMPTS => Self::RepeatedAttempts,
            SMP_REASON_INVALID_PARAMETERS => Self::InvalidParameters,
            _ => Self::UnspecifiedReason,
        }
    }
}

impl fmt::Display for PairingFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::PasskeyEntryFailed => "passkey entry failed",
            Self::OobNotAvailable => "OOB data not available",
            Self::AuthenticationRequirements => "authentication requirements",
            Self::ConfirmValueFailed => "confirm value failed",
            Self::PairingNotSupported => "pairing not supported",
            Self::EncryptionKeySize => "encryption key size",
            Self::CommandNotSupported => "command not supported",
            Self::UnspecifiedReason => "unspecified reason",
            Self::RepeatedAttempts => "repeated attempts",
            Self::InvalidParameters => "invalid parameters",
        };
        write!(f, "{} ({:#04x})", text, self.to_u8())
    }
}

/// IO Capability types for pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCapability {
    /// Display only capability
    DisplayOnly,
    /// Display with yes/no capability
    DisplayYesNo,
    /// Keyboard only
    KeyboardOnly,
    /// No input, no output
    NoInputNoOutput,
    /// Both keyboard and display
    KeyboardDisplay,
}

impl IoCapability {
    pub const ALL: [IoCapability; SMP_IO_CAPABILITY_COUNT] = [
        IoCapability::DisplayOnly,
        IoCapability::DisplayYesNo,
        IoCapability::KeyboardOnly,
        IoCapability::NoInputNoOutput,
        IoCapability::KeyboardDisplay,
    ];

    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            IoCapability::DisplayOnly => SMP_IO_CAPABILITY_DISPLAY_ONLY,
            IoCapability::DisplayYesNo => SMP_IO_CAPABILITY_DISPLAY_YES_NO,
            IoCapability::KeyboardOnly => SMP_IO_CAPABILITY_KEYBOARD_ONLY,
            IoCapability::NoInputNoOutput => SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT,
            IoCapability::KeyboardDisplay => SMP_IO_CAPABILITY_KEYBOARD_DISPLAY,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Row/column of this capability in the action tables
    pub fn index(&self) -> usize {
        self.to_u8() as usize
    }
}

impl fmt::Display for IoCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCapability::DisplayOnly => write!(f, "Display Only"),
            IoCapability::DisplayYesNo => write!(f, "Display Yes/No"),
            IoCapability::KeyboardOnly => write!(f, "Keyboard Only"),
            IoCapability::NoInputNoOutput => write!(f, "No Input No Output"),
            IoCapability::KeyboardDisplay => write!(f, "Keyboard Display"),
        }
    }
}

bitflags! {
    /// Authentication requirements field of pairing commands
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AuthReq: u8 {
        const BOND = SMP_AUTH_REQ_BONDING;
        const MITM = SMP_AUTH_REQ_MITM;
        const SC = SMP_AUTH_REQ_SC;
        const KEYPRESS = SMP_AUTH_REQ_KEYPRESS;
    }
}

bitflags! {
    /// Key distribution field of pairing commands
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KeyDistribution: u8 {
        /// LTK, EDIV and Rand
        const ENC_KEY = SMP_KEY_DIST_ENC_KEY;
        /// IRK and identity address
        const ID_KEY = SMP_KEY_DIST_ID_KEY;
        /// CSRK
        const SIGN_KEY = SMP_KEY_DIST_SIGN_KEY;
        const LINK_KEY = SMP_KEY_DIST_LINK_KEY;
    }
}

/// What the application must do before pairing can continue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PasskeyAction {
    /// Nothing; the TK is zero
    None,
    /// Supply out-of-band data
    Oob,
    /// Let the user type the passkey shown on the peer
    Input,
    /// Show a passkey for the user to type on the peer
    Display,
}

impl PasskeyAction {
    /// Pairing algorithm implied by this action
    pub fn algorithm(&self) -> PairingAlgorithm {
        match self {
            PasskeyAction::None => PairingAlgorithm::JustWorks,
            PasskeyAction::Oob => PairingAlgorithm::Oob,
            PasskeyAction::Input | PasskeyAction::Display => PairingAlgorithm::Passkey,
        }
    }

    /// Whether the resulting key is MITM protected
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, PasskeyAction::None)
    }
}

/// Legacy pairing algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PairingAlgorithm {
    #[default]
    JustWorks,
    Passkey,
    Oob,
}

impl fmt::Display for PairingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingAlgorithm::JustWorks => write!(f, "Just Works"),
            PairingAlgorithm::Passkey => write!(f, "Passkey Entry"),
            PairingAlgorithm::Oob => write!(f, "Out of Band"),
        }
    }
}

/// Pairing Role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingRole {
    /// Initiator of the pairing (Central device)
    Initiator,
    /// Responder to pairing (Peripheral device)
    Responder,
}

/// User input answering a [`PasskeyAction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Passkey {
    /// OOB temporary key, if the application has one
    Oob(Option<[u8; 16]>),
    /// Passkey typed by the user
    Input(u32),
    /// Passkey the application displayed
    Display(u32),
}

impl Passkey {
    /// The action this input answers
    pub fn action(&self) -> PasskeyAction {
        match self {
            Passkey::Oob(_) => PasskeyAction::Oob,
            Passkey::Input(_) => PasskeyAction::Input,
            Passkey::Display(_) => PasskeyAction::Display,
        }
    }
}

/// Security properties of a link as reported to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityState {
    pub pair_alg: PairingAlgorithm,
    pub enc_enabled: bool,
    pub authenticated: bool,
    pub bonded: bool,
}

/// Events reported by the Security Manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmEvent {
    /// A procedure finished; `status` is `Ok` when the link is encrypted
    EncryptionChanged {
        conn_handle: u16,
        status: SmpResult<()>,
        security: SecurityState,
    },
    /// The application must supply a passkey or OOB data via `set_tk`
    PasskeyAction {
        conn_handle: u16,
        action: PasskeyAction,
    },
    /// Distributed keys were written to the key store
    KeysStored { conn_handle: u16, peer_addr: BdAddr },
    /// A procedure was abandoned after its timer expired
    Timeout { conn_handle: u16 },
}
