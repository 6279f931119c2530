//! Runtime configuration for the transport and the Security Manager

use crate::error::HciError;
use crate::hci::constants::*;
use crate::smp::constants::{SMP_MAX_ENC_KEY_SIZE, SMP_TIMEOUT_GENERAL};
use crate::smp::{AuthReq, IoCapability, KeyDistribution, SmpError, SmpResult};
use std::time::Duration;

/// What the RX framer does when no buffer is free for an incoming packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxOverflowPolicy {
    /// Refuse the byte and wait for a buffer to be released
    #[default]
    Stall,
    /// Consume and discard the whole packet
    Drop,
}

/// HCI UART transport configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Number of event buffers; also bounds the pending-transmit queue
    pub num_evt_bufs: usize,
    /// Size of each event buffer in bytes
    pub evt_buf_size: usize,
    pub num_acl_bufs: usize,
    pub acl_buf_size: usize,
    pub rx_overflow: RxOverflowPolicy,
    /// Keep a ring of the raw bytes each direction handled
    pub wire_log: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            num_evt_bufs: DEFAULT_NUM_EVT_BUFS,
            evt_buf_size: DEFAULT_EVT_BUF_SIZE,
            num_acl_bufs: DEFAULT_NUM_ACL_BUFS,
            acl_buf_size: DEFAULT_ACL_BUF_SIZE,
            rx_overflow: RxOverflowPolicy::default(),
            wire_log: false,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), HciError> {
        if self.num_evt_bufs == 0 {
            return Err(HciError::InvalidConfig("num_evt_bufs must be non-zero".into()));
        }

        // An event header plus its maximum parameter length has to fit.
        let min_evt = HCI_EVT_HDR_LEN + HCI_MAX_PARAM_LEN;
        if self.evt_buf_size < min_evt {
            return Err(HciError::InvalidConfig(format!(
                "evt_buf_size {} is smaller than {}",
                self.evt_buf_size, min_evt
            )));
        }

        if self.num_acl_bufs == 0 || self.acl_buf_size == 0 {
            return Err(HciError::InvalidConfig("ACL pool must not be empty".into()));
        }

        Ok(())
    }
}

/// Security Manager configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmConfig {
    /// Maximum number of concurrent pairing procedures
    pub max_procs: usize,
    pub io_capability: IoCapability,
    /// Whether we have OOB data for the peer
    pub oob_data_flag: bool,
    pub bonding: bool,
    pub mitm: bool,
    pub keypress: bool,
    /// Keys we are willing to distribute
    pub our_key_dist: KeyDistribution,
    /// Keys we ask the peer to distribute
    pub their_key_dist: KeyDistribution,
    /// Idle time after which a procedure is abandoned
    pub timeout: Duration,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            max_procs: 1,
            io_capability: IoCapability::NoInputNoOutput,
            oob_data_flag: false,
            bonding: false,
            mitm: false,
            keypress: false,
            our_key_dist: KeyDistribution::empty(),
            their_key_dist: KeyDistribution::empty(),
            timeout: Duration::from_millis(SMP_TIMEOUT_GENERAL),
        }
    }
}

impl SmConfig {
    pub fn validate(&self) -> SmpResult<()> {
        if self.max_procs == 0 {
            return Err(SmpError::InvalidParameter("max_procs must be non-zero".into()));
        }
        if self.timeout.is_zero() {
            return Err(SmpError::InvalidParameter("timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// AuthReq field advertised in our pairing commands
    pub fn build_authreq(&self) -> AuthReq {
        let mut authreq = AuthReq::empty();
        authreq.set(AuthReq::BOND, self.bonding);
        authreq.set(AuthReq::MITM, self.mitm);
        authreq.set(AuthReq::KEYPRESS, self.keypress);
        authreq
    }

    /// Maximum encryption key size we advertise
    pub fn max_key_size(&self) -> u8 {
        SMP_MAX_ENC_KEY_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_transport_config_is_valid() {
        let config = TransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rx_overflow, RxOverflowPolicy::Stall);
    }

    #[test]
    fn test_small_event_buffers_rejected() {
        let config = TransportConfig {
            evt_buf_size: 64,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(HciError::InvalidConfig(_))));
    }

    #[test]
    fn test_build_authreq() {
        let config = SmConfig {
            bonding: true,
            mitm: true,
            ..Default::default()
        };
        assert_eq!(config.build_authreq().bits(), 0x05);

        let config = SmConfig {
            keypress: true,
            ..Default::default()
        };
        assert_eq!(config.build_authreq().bits(), 0x10);
    }
}
