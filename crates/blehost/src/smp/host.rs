//! [`SmHost`] backed by the H4 UART transport
//!
//! SMP PDUs travel as L2CAP basic frames on the fixed SMP channel, each in a
//! single ACL packet. Controller requests go out as HCI commands.

use super::constants::{SMP_CID, SMP_MTU};
use super::manager::SmHost;
use super::types::{SmpError, SmpResult};
use crate::error::HciError;
use crate::gap::{ConnectionDirectory, ConnectionInfo};
use crate::hci::{BufferKind, HciCommand, HciUart};

const L2CAP_HDR_LEN: usize = 4;
const ACL_HANDLE_MASK: u16 = 0x0FFF;

/// Security Manager host over an [`HciUart`]
pub struct UartSmHost<C: ConnectionDirectory> {
    uart: HciUart,
    connections: C,
}

impl<C: ConnectionDirectory> UartSmHost<C> {
    pub fn new(uart: HciUart, connections: C) -> Self {
        Self { uart, connections }
    }

    pub fn uart(&self) -> &HciUart {
        &self.uart
    }

    pub fn connections_mut(&mut self) -> &mut C {
        &mut self.connections
    }
}

impl<C: ConnectionDirectory> ConnectionDirectory for UartSmHost<C> {
    fn find_connection(&self, handle: u16) -> Option<ConnectionInfo> {
        self.connections.find_connection(handle)
    }
}

impl<C: ConnectionDirectory> SmHost for UartSmHost<C> {
    fn send_pdu(&mut self, conn_handle: u16, pdu: &[u8]) -> SmpResult<()> {
        if pdu.is_empty() || pdu.len() > SMP_MTU {
            return Err(SmpError::InvalidParameter(format!(
                "SMP PDU of {} bytes",
                pdu.len()
            )));
        }

        let mut chain = self
            .uart
            .pool()
            .allocate_chain()
            .ok_or(HciError::PoolExhausted(BufferKind::Acl))?;

        // Packet boundary flag 00: first non-flushable fragment
        let l2cap_len = pdu.len() as u16;
        let acl_len = (pdu.len() + L2CAP_HDR_LEN) as u16;
        chain.extend_from_slice(&(conn_handle & ACL_HANDLE_MASK).to_le_bytes())?;
        chain.extend_from_slice(&acl_len.to_le_bytes())?;
        chain.extend_from_slice(&l2cap_len.to_le_bytes())?;
        chain.extend_from_slice(&SMP_CID.to_le_bytes())?;
        chain.extend_from_slice(pdu)?;

        self.uart.send_acl(chain)?;
        Ok(())
    }

    fn start_encryption(
        &mut self,
        conn_handle: u16,
        rand: u64,
        ediv: u16,
        ltk: &[u8; 16],
    ) -> SmpResult<()> {
        self.uart.send_hci_command(&HciCommand::LeStartEncryption {
            handle: conn_handle,
            random_number: rand,
            encrypted_diversifier: ediv,
            long_term_key: *ltk,
        })?;
        Ok(())
    }

    fn ltk_reply(&mut self, conn_handle: u16, ltk: &[u8; 16]) -> SmpResult<()> {
        self.uart.send_hci_command(&HciCommand::LeLtkRequestReply {
            handle: conn_handle,
            long_term_key: *ltk,
        })?;
        Ok(())
    }

    fn ltk_neg_reply(&mut self, conn_handle: u16) -> SmpResult<()> {
        self.uart
            .send_hci_command(&HciCommand::LeLtkRequestNegativeReply {
                handle: conn_handle,
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::gap::{AddressType, BdAddr};
    use crate::hci::{TxFramer, UartDriver};
    use std::sync::Arc;

    struct NullDriver;

    impl UartDriver for NullDriver {
        fn start_tx(&self) {}
        fn start_rx(&self) {}
    }

    struct OneLink;

    impl ConnectionDirectory for OneLink {
        fn find_connection(&self, handle: u16) -> Option<ConnectionInfo> {
            (handle == 0x0041).then_some(ConnectionInfo {
                handle,
                is_master: true,
                our_addr: BdAddr::new([1; 6]),
                our_addr_type: AddressType::Public,
                peer_addr: BdAddr::new([2; 6]),
                peer_addr_type: AddressType::Random,
            })
        }
    }

    fn host() -> (UartSmHost<OneLink>, TxFramer) {
        let (uart, _rx, tx) = HciUart::new(TransportConfig::default(), Arc::new(NullDriver)).unwrap();
        (UartSmHost::new(uart, OneLink), tx)
    }

    fn drain(tx: &mut TxFramer) -> Vec<u8> {
        std::iter::from_fn(|| tx.tx_byte()).collect()
    }

    #[test]
    fn test_pdu_framed_as_l2cap_on_acl() {
        let (mut host, mut tx) = host();
        host.send_pdu(0x0041, &[0x05, 0x08]).unwrap();

        assert_eq!(
            drain(&mut tx),
            vec![0x02, 0x41, 0x00, 0x06, 0x00, 0x02, 0x00, 0x06, 0x00, 0x05, 0x08]
        );
        assert_eq!(host.uart().pool().acl_free_count(), TransportConfig::default().num_acl_bufs);
    }

    #[test]
    fn test_oversized_pdu_rejected() {
        let (mut host, _tx) = host();
        assert!(matches!(
            host.send_pdu(0x0041, &[0u8; SMP_MTU + 1]),
            Err(SmpError::InvalidParameter(_))
        ));
        assert_eq!(host.uart().pending(), 0);
    }

    #[test]
    fn test_controller_commands() {
        let (mut host, mut tx) = host();

        host.ltk_neg_reply(0x0041).unwrap();
        assert_eq!(drain(&mut tx), vec![0x01, 0x1B, 0x20, 0x02, 0x41, 0x00]);

        host.start_encryption(0x0041, 0, 0, &[0xAA; 16]).unwrap();
        let packet = drain(&mut tx);
        assert_eq!(&packet[..4], &[0x01, 0x19, 0x20, 28]);
        assert_eq!(&packet[4..6], &[0x41, 0x00]);
        assert_eq!(&packet[16..], &[0xAA; 16]);
        assert!(host.find_connection(0x0041).is_some());
    }
}
