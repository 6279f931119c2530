//! HCI packet structures and parsing
//!
//! This module knows the H4 header layout of every packet kind and the few
//! commands and events the Security Manager needs from the controller.
//! Packet buffers never contain the H4 type byte; it is implied by the
//! [`PacketType`] carried alongside the buffer.

use crate::hci::constants::*;
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// H4 packet discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Command,
    Acl,
    Sco,
    Event,
}

impl PacketType {
    /// Convert from the H4 type byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            HCI_COMMAND_PKT => Some(PacketType::Command),
            HCI_ACL_PKT => Some(PacketType::Acl),
            HCI_SCO_PKT => Some(PacketType::Sco),
            HCI_EVENT_PKT => Some(PacketType::Event),
            _ => None,
        }
    }

    /// Convert to the H4 type byte
    pub fn to_u8(&self) -> u8 {
        match self {
            PacketType::Command => HCI_COMMAND_PKT,
            PacketType::Acl => HCI_ACL_PKT,
            PacketType::Sco => HCI_SCO_PKT,
            PacketType::Event => HCI_EVENT_PKT,
        }
    }

    /// Size of the fixed header that follows the type byte
    pub fn header_len(&self) -> usize {
        match self {
            PacketType::Command => HCI_CMD_HDR_LEN,
            PacketType::Acl => HCI_ACL_HDR_LEN,
            PacketType::Sco => HCI_SCO_HDR_LEN,
            PacketType::Event => HCI_EVT_HDR_LEN,
        }
    }

    /// Decode the payload length from a complete header.
    ///
    /// Returns `None` if `header` is shorter than [`Self::header_len`].
    pub fn payload_len(&self, header: &[u8]) -> Option<usize> {
        if header.len() < self.header_len() {
            return None;
        }

        let len = match self {
            PacketType::Command | PacketType::Sco => header[2] as usize,
            PacketType::Event => header[1] as usize,
            PacketType::Acl => LittleEndian::read_u16(&header[2..4]) as usize,
        };

        Some(len)
    }

    /// Header plus payload length declared by `header`
    pub fn total_len(&self, header: &[u8]) -> Option<usize> {
        self.payload_len(header)
            .map(|payload| self.header_len() + payload)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Command => write!(f, "CMD"),
            PacketType::Acl => write!(f, "ACL"),
            PacketType::Sco => write!(f, "SCO"),
            PacketType::Event => write!(f, "EVT"),
        }
    }
}

/// Build a command opcode from its group and command fields
pub fn opcode(ogf: u8, ocf: u16) -> u16 {
    ((ogf as u16) << 10) | (ocf & 0x3ff)
}

/// HCI commands issued by the host
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum HciCommand {
    // Link Control Commands (OGF: 0x01)
    Disconnect { handle: u16, reason: u8 },

    // LE Commands (OGF: 0x08)
    LeStartEncryption {
        handle: u16,
        random_number: u64,
        encrypted_diversifier: u16,
        long_term_key: [u8; 16],
    },
    LeLtkRequestReply { handle: u16, long_term_key: [u8; 16] },
    LeLtkRequestNegativeReply { handle: u16 },
}

impl HciCommand {
    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        match self {
            Self::Disconnect { .. } => (OGF_LINK_CTL, OCF_DISCONNECT),
            Self::LeStartEncryption { .. } => (OGF_LE, OCF_LE_START_ENCRYPT),
            Self::LeLtkRequestReply { .. } => (OGF_LE, OCF_LE_LT_KEY_REQ_REPLY),
            Self::LeLtkRequestNegativeReply { .. } => (OGF_LE, OCF_LE_LT_KEY_REQ_NEG_REPLY),
        }
    }

    /// Full 16-bit opcode
    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        opcode(ogf, ocf)
    }

    /// Convert the command to its raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        match *self {
            Self::Disconnect { handle, reason } => {
                let mut params = Vec::with_capacity(3);
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(reason);
                params
            }

            Self::LeStartEncryption {
                handle,
                random_number,
                encrypted_diversifier,
                long_term_key,
            } => {
                let mut params = Vec::with_capacity(28);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&random_number.to_le_bytes());
                params.extend_from_slice(&encrypted_diversifier.to_le_bytes());
                params.extend_from_slice(&long_term_key);
                params
            }

            Self::LeLtkRequestReply { handle, long_term_key } => {
                let mut params = Vec::with_capacity(18);
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&long_term_key);
                params
            }

            Self::LeLtkRequestNegativeReply { handle } => handle.to_le_bytes().to_vec(),
        }
    }

    /// Serialize without the H4 type byte, as stored in a command buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let params = self.parameters();

        let mut bytes = Vec::with_capacity(HCI_CMD_HDR_LEN + params.len());
        bytes.extend_from_slice(&self.opcode().to_le_bytes());
        bytes.push(params.len() as u8);
        bytes.extend_from_slice(&params);
        bytes
    }

    /// Convert the command to a raw H4 packet
    pub fn to_packet(&self) -> Vec<u8> {
        let mut packet = vec![HCI_COMMAND_PKT];
        packet.extend_from_slice(&self.to_bytes());
        packet
    }
}

/// HCI Event packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciEvent {
    pub event_code: u8,
    pub parameter_total_length: u8,
    pub parameters: Vec<u8>,
}

impl HciEvent {
    /// Parse an HCI event from raw bytes (no H4 type byte)
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HCI_EVT_HDR_LEN {
            return None;
        }

        let event_code = data[0];
        let parameter_total_length = data[1];
        let end = parameter_total_length as usize + HCI_EVT_HDR_LEN;

        if data.len() < end {
            return None;
        }

        Some(HciEvent {
            event_code,
            parameter_total_length,
            parameters: data[HCI_EVT_HDR_LEN..end].to_vec(),
        })
    }

    /// LE meta subevent code, if this is an LE meta event
    pub fn le_subevent(&self) -> Option<u8> {
        if self.event_code == EVT_LE_META_EVENT {
            self.parameters.first().copied()
        } else {
            None
        }
    }
}

/// Encryption Change / Encryption Key Refresh Complete event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionChange {
    pub status: u8,
    pub connection_handle: u16,
    pub encryption_enabled: u8,
}

impl EncryptionChange {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        if event.event_code != EVT_ENCRYPTION_CHANGE || event.parameters.len() < 4 {
            return None;
        }

        let p = &event.parameters;
        Some(Self {
            status: p[0],
            connection_handle: LittleEndian::read_u16(&p[1..3]),
            encryption_enabled: p[3],
        })
    }
}

/// LE Long Term Key Request subevent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LtkRequest {
    pub connection_handle: u16,
    pub random_number: u64,
    pub encrypted_diversifier: u16,
}

impl LtkRequest {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        if event.le_subevent() != Some(EVT_LE_LT_KEY_REQ) || event.parameters.len() < 13 {
            return None;
        }

        let p = &event.parameters;
        Some(Self {
            connection_handle: LittleEndian::read_u16(&p[1..3]),
            random_number: LittleEndian::read_u64(&p[3..11]),
            encrypted_diversifier: LittleEndian::read_u16(&p[11..13]),
        })
    }
}

/// Disconnection Complete event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectionComplete {
    pub status: u8,
    pub connection_handle: u16,
    pub reason: u8,
}

impl DisconnectionComplete {
    pub fn parse(event: &HciEvent) -> Option<Self> {
        if event.event_code != EVT_DISCONN_COMPLETE || event.parameters.len() < 4 {
            return None;
        }

        let p = &event.parameters;
        Some(Self {
            status: p[0],
            connection_handle: LittleEndian::read_u16(&p[1..3]),
            reason: p[3],
        })
    }
}
