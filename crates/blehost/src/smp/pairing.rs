//! Security Manager PDUs and the per-connection pairing procedure
//!
//! Every `parse` takes the PDU with its opcode byte and every `serialize`
//! produces one, matching what travels on the SMP fixed channel.

use super::constants::*;
use super::keys::SmKeys;
use super::resolver;
use super::types::*;
use crate::gap::BdAddr;
use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::time::Instant;

/// Pairing request/response packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PairCommand {
    /// IO capability
    pub io_capability: u8,
    /// OOB data flag
    pub oob_data_flag: u8,
    /// Authentication requirements
    pub auth_req: u8,
    /// Maximum encryption key size
    pub max_key_size: u8,
    /// Initiator key distribution
    pub initiator_key_dist: u8,
    /// Responder key distribution
    pub responder_key_dist: u8,
}

impl PairCommand {
    /// Parse from raw packet
    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        if data.len() < SMP_PAIR_CMD_SZ {
            return Err(SmpError::InvalidParameter(
                "Pairing command too short".into(),
            ));
        }

        Ok(Self {
            io_capability: data[1],
            oob_data_flag: data[2],
            auth_req: data[3],
            max_key_size: data[4],
            initiator_key_dist: data[5],
            responder_key_dist: data[6],
        })
    }

    /// The exact PDU bytes, as fed to c1 as `preq`/`pres`
    pub fn to_bytes(&self, is_request: bool) -> [u8; SMP_PAIR_CMD_SZ] {
        [
            if is_request {
                SMP_PAIRING_REQUEST
            } else {
                SMP_PAIRING_RESPONSE
            },
            self.io_capability,
            self.oob_data_flag,
            self.auth_req,
            self.max_key_size,
            self.initiator_key_dist,
            self.responder_key_dist,
        ]
    }

    /// Serialize to raw packet
    pub fn serialize(&self, is_request: bool) -> Vec<u8> {
        self.to_bytes(is_request).to_vec()
    }

    /// Field ranges a legacy pairing command must respect
    pub fn is_valid(&self) -> bool {
        self.io_capability < SMP_IO_CAPABILITY_COUNT as u8
            && self.oob_data_flag <= SMP_OOB_DATA_PRESENT
            && self.auth_req & SMP_AUTH_REQ_RESERVED == 0
            && (SMP_MIN_ENC_KEY_SIZE..=SMP_MAX_ENC_KEY_SIZE).contains(&self.max_key_size)
            && self.initiator_key_dist & SMP_KEY_DIST_RESERVED == 0
            && self.responder_key_dist & SMP_KEY_DIST_RESERVED == 0
    }

    pub fn io_cap(&self) -> IoCapability {
        IoCapability::from_u8(self.io_capability).unwrap_or(IoCapability::NoInputNoOutput)
    }

    pub fn has_oob(&self) -> bool {
        self.oob_data_flag == SMP_OOB_DATA_PRESENT
    }

    pub fn authreq(&self) -> AuthReq {
        AuthReq::from_bits_truncate(self.auth_req)
    }

    pub fn init_keys(&self) -> KeyDistribution {
        KeyDistribution::from_bits_truncate(self.initiator_key_dist)
    }

    pub fn resp_keys(&self) -> KeyDistribution {
        KeyDistribution::from_bits_truncate(self.responder_key_dist)
    }
}

/// Pairing confirm packet
#[derive(Debug, Clone)]
pub struct PairingConfirm {
    /// Confirm value
    pub confirm_value: [u8; 16],
}

impl PairingConfirm {
    pub fn new(confirm_value: [u8; 16]) -> Self {
        Self { confirm_value }
    }

    /// Parse from raw packet
    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        if data.len() < SMP_PAIR_CONFIRM_SZ {
            return Err(SmpError::InvalidParameter(
                "Pairing confirm too short".into(),
            ));
        }

        let mut confirm_value = [0u8; 16];
        confirm_value.copy_from_slice(&data[1..17]);

        Ok(Self { confirm_value })
    }

    /// Serialize to raw packet
    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(SMP_PAIR_CONFIRM_SZ);
        packet.push(SMP_PAIRING_CONFIRM);
        packet.extend_from_slice(&self.confirm_value);
        packet
    }
}

/// Pairing random packet
#[derive(Debug, Clone)]
pub struct PairingRandom {
    /// Random value
    pub random_value: [u8; 16],
}

impl PairingRandom {
    pub fn new(random_value: [u8; 16]) -> Self {
        Self { random_value }
    }

    /// Parse from raw packet
    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        if data.len() < SMP_PAIR_RANDOM_SZ {
            return Err(SmpError::InvalidParameter(
                "Pairing random too short".into(),
            ));
        }

        let mut random_value = [0u8; 16];
        random_value.copy_from_slice(&data[1..17]);

        Ok(Self { random_value })
    }

    /// Serialize to raw packet
    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(SMP_PAIR_RANDOM_SZ);
        packet.push(SMP_PAIRING_RANDOM);
        packet.extend_from_slice(&self.random_value);
        packet
    }
}

/// Pairing failed packet
#[derive(Debug, Clone)]
pub struct PairingFailed {
    /// Reason code
    pub reason: u8,
}

impl PairingFailed {
    pub fn new(reason: PairingFailureReason) -> Self {
        Self {
            reason: reason.to_u8(),
        }
    }

    /// Parse from raw packet
    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        if data.len() < SMP_PAIR_FAIL_SZ {
            return Err(SmpError::InvalidParameter(
                "Pairing failed too short".into(),
            ));
        }

        Ok(Self { reason: data[1] })
    }

    /// Serialize to raw packet
    pub fn serialize(&self) -> Vec<u8> {
        vec![SMP_PAIRING_FAILED, self.reason]
    }

    pub fn reason(&self) -> PairingFailureReason {
        PairingFailureReason::from_u8(self.reason)
    }
}

/// Encryption information packet
#[derive(Debug, Clone)]
pub struct EncryptionInformation {
    /// Long Term Key
    pub ltk: [u8; 16],
}

impl EncryptionInformation {
    pub fn new(ltk: [u8; 16]) -> Self {
        Self { ltk }
    }

    /// Parse from raw packet
    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        if data.len() < SMP_ENC_INFO_SZ {
            return Err(SmpError::InvalidParameter(
                "Encryption information too short".into(),
            ));
        }

        let mut ltk = [0u8; 16];
        ltk.copy_from_slice(&data[1..17]);

        Ok(Self { ltk })
    }

    /// Serialize to raw packet
    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(SMP_ENC_INFO_SZ);
        packet.push(SMP_ENCRYPTION_INFORMATION);
        packet.extend_from_slice(&self.ltk);
        packet
    }
}

/// Master identification packet
#[derive(Debug, Clone)]
pub struct MasterIdentification {
    /// EDIV (Encrypted Diversifier)
    pub ediv: u16,
    /// Rand (Random number)
    pub rand: u64,
}

impl MasterIdentification {
    pub fn new(ediv: u16, rand: u64) -> Self {
        Self { ediv, rand }
    }

    /// Parse from raw packet
    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        if data.len() < SMP_MASTER_IDEN_SZ {
            return Err(SmpError::InvalidParameter(
                "Master identification too short".into(),
            ));
        }

        let mut cursor = Cursor::new(&data[1..]);
        let ediv = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| SmpError::InvalidParameter("Failed to read EDIV".into()))?;
        let rand = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| SmpError::InvalidParameter("Failed to read Rand".into()))?;

        Ok(Self { ediv, rand })
    }

    /// Serialize to raw packet
    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(SMP_MASTER_IDEN_SZ);
        packet.push(SMP_MASTER_IDENTIFICATION);
        packet.extend_from_slice(&self.ediv.to_le_bytes());
        packet.extend_from_slice(&self.rand.to_le_bytes());
        packet
    }
}

/// Identity information packet
#[derive(Debug, Clone)]
pub struct IdentityInformation {
    /// Identity Resolving Key
    pub irk: [u8; 16],
}

impl IdentityInformation {
    pub fn new(irk: [u8; 16]) -> Self {
        Self { irk }
    }

    /// Parse from raw packet
    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        if data.len() < SMP_IDEN_INFO_SZ {
            return Err(SmpError::InvalidParameter(
                "Identity information too short".into(),
            ));
        }

        let mut irk = [0u8; 16];
        irk.copy_from_slice(&data[1..17]);

        Ok(Self { irk })
    }

    /// Serialize to raw packet
    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(SMP_IDEN_INFO_SZ);
        packet.push(SMP_IDENTITY_INFORMATION);
        packet.extend_from_slice(&self.irk);
        packet
    }
}

/// Identity address information packet
#[derive(Debug, Clone)]
pub struct IdentityAddressInformation {
    /// Address type
    pub addr_type: u8,
    /// Bluetooth device address, wire order
    pub bd_addr: BdAddr,
}

impl IdentityAddressInformation {
    pub fn new(addr_type: u8, bd_addr: BdAddr) -> Self {
        Self { addr_type, bd_addr }
    }

    /// Parse from raw packet
    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        if data.len() < SMP_IDEN_ADDR_INFO_SZ {
            return Err(SmpError::InvalidParameter(
                "Identity address information too short".into(),
            ));
        }

        let bd_addr = BdAddr::from_slice(&data[2..8])
            .ok_or_else(|| SmpError::InvalidParameter("Failed to read address".into()))?;

        Ok(Self {
            addr_type: data[1],
            bd_addr,
        })
    }

    /// Serialize to raw packet
    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(SMP_IDEN_ADDR_INFO_SZ);
        packet.push(SMP_IDENTITY_ADDRESS_INFORMATION);
        packet.push(self.addr_type);
        packet.extend_from_slice(&self.bd_addr.bytes);
        packet
    }
}

/// Signing information packet
#[derive(Debug, Clone)]
pub struct SigningInformation {
    /// Connection Signature Resolving Key
    pub csrk: [u8; 16],
}

impl SigningInformation {
    pub fn new(csrk: [u8; 16]) -> Self {
        Self { csrk }
    }

    /// Parse from raw packet
    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        if data.len() < SMP_SIGN_INFO_SZ {
            return Err(SmpError::InvalidParameter(
                "Signing information too short".into(),
            ));
        }

        let mut csrk = [0u8; 16];
        csrk.copy_from_slice(&data[1..17]);

        Ok(Self { csrk })
    }

    /// Serialize to raw packet
    pub fn serialize(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(SMP_SIGN_INFO_SZ);
        packet.push(SMP_SIGNING_INFORMATION);
        packet.extend_from_slice(&self.csrk);
        packet
    }
}

/// Security request packet
#[derive(Debug, Clone)]
pub struct SecurityRequest {
    /// Authentication requirements
    pub auth_req: u8,
}

impl SecurityRequest {
    pub fn new(auth_req: AuthReq) -> Self {
        Self {
            auth_req: auth_req.bits(),
        }
    }

    /// Parse from raw packet
    pub fn parse(data: &[u8]) -> SmpResult<Self> {
        if data.len() < SMP_SEC_REQ_SZ {
            return Err(SmpError::InvalidParameter(
                "Security request too short".into(),
            ));
        }

        Ok(Self { auth_req: data[1] })
    }

    /// Serialize to raw packet
    pub fn serialize(&self) -> Vec<u8> {
        vec![SMP_SECURITY_REQUEST, self.auth_req]
    }

    pub fn authreq(&self) -> AuthReq {
        AuthReq::from_bits_truncate(self.auth_req)
    }
}

/// Step a pairing procedure is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Exchanging pairing request and response
    Pair,
    /// Exchanging confirm values
    Confirm,
    /// Exchanging randoms
    Random,
    /// Responder waiting for the controller's LTK request to hand it the STK
    LtkStart,
    /// Responder answering an LTK request from the key store
    LtkRestore,
    /// Waiting for encryption with the STK
    EncStart,
    /// Waiting for encryption with a stored LTK
    EncRestore,
    /// Distributing keys over the encrypted link
    KeyExch,
    /// Peripheral sent a security request
    SecReq,
    /// Finished; the procedure is removed
    Done,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcFlags: u8 {
        const INITIATOR = 0x01;
        const TK_VALID = 0x02;
        const RX_CONFIRM = 0x04;
        const AUTHENTICATED = 0x08;
        const KEY_EXCHANGE = 0x10;
        const BONDED = 0x20;
    }
}

bitflags! {
    /// Key-distribution PDUs still expected from the peer
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KeyExchangeFlags: u8 {
        const ENC_INFO = 0x01;
        const MASTER_IDEN = 0x02;
        const IDEN_INFO = 0x04;
        const ADDR_INFO = 0x08;
        const SIGN_INFO = 0x10;
    }
}

impl KeyExchangeFlags {
    /// PDUs the peer sends for a distribution mask
    pub fn expected(dist: KeyDistribution) -> Self {
        let mut flags = Self::empty();
        if dist.contains(KeyDistribution::ENC_KEY) {
            flags |= Self::ENC_INFO | Self::MASTER_IDEN;
        }
        if dist.contains(KeyDistribution::ID_KEY) {
            flags |= Self::IDEN_INFO | Self::ADDR_INFO;
        }
        if dist.contains(KeyDistribution::SIGN_KEY) {
            flags |= Self::SIGN_INFO;
        }
        flags
    }
}

/// One in-flight security procedure on a connection
#[derive(Debug, Clone)]
pub struct PairingProcedure {
    pub conn_handle: u16,
    pub state: ProcState,
    pub flags: ProcFlags,
    pub pair_alg: PairingAlgorithm,
    pub pair_req: PairCommand,
    pub pair_rsp: PairCommand,
    pub tk: [u8; 16],
    pub confirm_peer: [u8; 16],
    pub randm: [u8; 16],
    pub rands: [u8; 16],
    /// STK, or the stored LTK when restoring encryption
    pub ltk: [u8; 16],
    pub rx_key_flags: KeyExchangeFlags,
    pub our_keys: SmKeys,
    pub peer_keys: SmKeys,
    pub expires: Instant,
}

impl PairingProcedure {
    pub fn new(conn_handle: u16, state: ProcState, flags: ProcFlags, expires: Instant) -> Self {
        Self {
            conn_handle,
            state,
            flags,
            pair_alg: PairingAlgorithm::JustWorks,
            pair_req: PairCommand::default(),
            pair_rsp: PairCommand::default(),
            tk: [0; 16],
            confirm_peer: [0; 16],
            randm: [0; 16],
            rands: [0; 16],
            ltk: [0; 16],
            rx_key_flags: KeyExchangeFlags::empty(),
            our_keys: SmKeys::default(),
            peer_keys: SmKeys::default(),
            expires,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.flags.contains(ProcFlags::INITIATOR)
    }

    pub fn role(&self) -> PairingRole {
        if self.is_initiator() {
            PairingRole::Initiator
        } else {
            PairingRole::Responder
        }
    }

    pub fn our_random(&self) -> &[u8; 16] {
        if self.is_initiator() {
            &self.randm
        } else {
            &self.rands
        }
    }

    pub fn our_random_mut(&mut self) -> &mut [u8; 16] {
        if self.is_initiator() {
            &mut self.randm
        } else {
            &mut self.rands
        }
    }

    pub fn their_random(&self) -> &[u8; 16] {
        if self.is_initiator() {
            &self.rands
        } else {
            &self.randm
        }
    }

    pub fn their_random_mut(&mut self) -> &mut [u8; 16] {
        if self.is_initiator() {
            &mut self.rands
        } else {
            &mut self.randm
        }
    }

    /// User action implied by the exchanged pairing commands
    pub fn passkey_action(&self) -> PasskeyAction {
        resolver::resolve_commands(self.role(), &self.pair_req, &self.pair_rsp)
    }

    /// Keys we distribute, as agreed in the pairing response
    pub fn our_key_dist(&self) -> KeyDistribution {
        if self.is_initiator() {
            self.pair_rsp.init_keys()
        } else {
            self.pair_rsp.resp_keys()
        }
    }

    /// Keys the peer distributes, as agreed in the pairing response
    pub fn their_key_dist(&self) -> KeyDistribution {
        if self.is_initiator() {
            self.pair_rsp.resp_keys()
        } else {
            self.pair_rsp.init_keys()
        }
    }

    pub fn security_state(&self, enc_enabled: bool) -> SecurityState {
        SecurityState {
            pair_alg: self.pair_alg,
            enc_enabled,
            authenticated: self.flags.contains(ProcFlags::AUTHENTICATED),
            bonded: self.flags.contains(ProcFlags::BONDED),
        }
    }
}
