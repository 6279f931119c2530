//! LE legacy pairing: confirm values, random check and STK derivation

use super::crypto::{c1, constant_time_eq, s1};
use super::manager::StepResult;
use super::pairing::{PairingConfirm, PairingProcedure, PairingRandom, ProcState};
use super::types::{PairingFailureReason, SmpError};
use crate::gap::ConnectionInfo;
use log::{debug, warn};

/// c1 over the exchanged pairing commands for one side's random
fn confirm_value(proc: &PairingProcedure, conn: &ConnectionInfo, rand: &[u8; 16]) -> [u8; 16] {
    let ((iat, ia), (rat, ra)) = conn.pairing_addresses();
    c1(
        &proc.tk,
        rand,
        &proc.pair_req.to_bytes(true),
        &proc.pair_rsp.to_bytes(false),
        iat.is_random() as u8,
        rat.is_random() as u8,
        &ia.bytes,
        &ra.bytes,
    )
}

/// Our Pairing Confirm PDU
pub(crate) fn confirm_pdu(proc: &PairingProcedure, conn: &ConnectionInfo) -> PairingConfirm {
    PairingConfirm::new(confirm_value(proc, conn, proc.our_random()))
}

/// Our Pairing Random PDU
pub(crate) fn random_pdu(proc: &PairingProcedure) -> PairingRandom {
    PairingRandom::new(*proc.our_random())
}

/// STK = s1(TK, Srand, Mrand)
pub(crate) fn gen_stk(proc: &PairingProcedure) -> [u8; 16] {
    s1(&proc.tk, &proc.rands, &proc.randm)
}

/// Handle the peer's random: verify its confirm, then derive the STK.
///
/// The initiator moves on to starting encryption; the responder still has to
/// send its own random, which the caller does by running the Random state.
pub(crate) fn random_rx(
    proc: &mut PairingProcedure,
    conn: &ConnectionInfo,
    peer_random: [u8; 16],
    res: &mut StepResult,
) {
    *proc.their_random_mut() = peer_random;

    let expected = confirm_value(proc, conn, &peer_random);
    if !constant_time_eq(&expected, &proc.confirm_peer) {
        warn!(
            "conn {:#06x}: peer confirm value does not match its random",
            proc.conn_handle
        );
        let reason = PairingFailureReason::ConfirmValueFailed;
        res.fail(SmpError::Local(reason), Some(reason));
        return;
    }

    proc.ltk = gen_stk(proc);
    debug!("conn {:#06x}: STK derived", proc.conn_handle);

    if proc.is_initiator() {
        proc.state = ProcState::EncStart;
    }
    res.do_state = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gap::{AddressType, BdAddr};
    use crate::smp::pairing::{PairCommand, ProcFlags};
    use std::time::Instant;

    // Core Specification sample data for c1
    fn sample() -> (PairingProcedure, ConnectionInfo) {
        let mut proc = PairingProcedure::new(
            0x0040,
            ProcState::Random,
            ProcFlags::INITIATOR,
            Instant::now(),
        );
        proc.pair_req = PairCommand::parse(&[0x01, 0x01, 0x00, 0x00, 0x10, 0x07, 0x07]).unwrap();
        proc.pair_rsp = PairCommand::parse(&[0x02, 0x03, 0x00, 0x00, 0x08, 0x00, 0x05]).unwrap();
        proc.randm = [
            0xE0, 0x2E, 0x70, 0xC6, 0x4E, 0x27, 0x88, 0x63, 0x0E, 0x6F, 0xAD, 0x56, 0x21, 0xD5,
            0x83, 0x57,
        ];

        let conn = ConnectionInfo {
            handle: 0x0040,
            is_master: true,
            our_addr: BdAddr::new([0xA6, 0xA5, 0xA4, 0xA3, 0xA2, 0xA1]),
            our_addr_type: AddressType::Random,
            peer_addr: BdAddr::new([0xB6, 0xB5, 0xB4, 0xB3, 0xB2, 0xB1]),
            peer_addr_type: AddressType::Public,
        };
        (proc, conn)
    }

    const SAMPLE_CONFIRM: [u8; 16] = [
        0x86, 0x3B, 0xF1, 0xBE, 0xC5, 0x4D, 0xA7, 0xD2, 0xEA, 0x88, 0x89, 0x87, 0xEF, 0x3F, 0x1E,
        0x1E,
    ];

    #[test]
    fn test_confirm_uses_initiator_addresses() {
        let (proc, conn) = sample();
        assert_eq!(confirm_pdu(&proc, &conn).confirm_value, SAMPLE_CONFIRM);
    }

    #[test]
    fn test_responder_verifies_initiator_random() {
        let (mut proc, mut conn) = sample();
        let randm = proc.randm;

        // Same link seen from the slave side
        proc.flags = ProcFlags::empty();
        proc.randm = [0; 16];
        proc.confirm_peer = SAMPLE_CONFIRM;
        std::mem::swap(&mut conn.our_addr, &mut conn.peer_addr);
        std::mem::swap(&mut conn.our_addr_type, &mut conn.peer_addr_type);
        conn.is_master = false;

        let mut res = StepResult::default();
        random_rx(&mut proc, &conn, randm, &mut res);
        assert!(res.app_status.is_none());
        assert!(res.do_state);
        assert_eq!(proc.randm, randm);
        assert_eq!(proc.ltk, gen_stk(&proc));
        assert_eq!(proc.state, ProcState::Random);
    }

    #[test]
    fn test_confirm_mismatch_fails() {
        let (mut proc, conn) = sample();
        proc.confirm_peer = [0x55; 16];

        let mut res = StepResult::default();
        random_rx(&mut proc, &conn, [0x11; 16], &mut res);
        assert_eq!(
            res.app_status,
            Some(SmpError::Local(PairingFailureReason::ConfirmValueFailed))
        );
        assert_eq!(res.sm_err, Some(PairingFailureReason::ConfirmValueFailed));
        assert!(res.enc_cb);
        assert!(!res.do_state);
        assert_eq!(proc.ltk, [0; 16]);
    }

    #[test]
    fn test_zero_stk() {
        let (mut proc, _) = sample();
        proc.randm = [0; 16];
        assert_eq!(
            gen_stk(&proc),
            [
                0x2e, 0x2b, 0x34, 0xca, 0x59, 0xfa, 0x4c, 0x88, 0x3b, 0x2c, 0x8a, 0xef, 0xd4, 0x4b,
                0xe9, 0x66
            ]
        );
    }
}
