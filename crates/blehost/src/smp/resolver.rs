//! Passkey action resolution for legacy pairing
//!
//! Both tables are indexed `[initiator io_cap][responder io_cap]` with the
//! capability order DisplayOnly, DisplayYesNo, KeyboardOnly,
//! NoInputNoOutput, KeyboardDisplay.

use super::constants::SMP_IO_CAPABILITY_COUNT;
use super::pairing::PairCommand;
use super::types::{AuthReq, IoCapability, PairingRole, PasskeyAction};
use PasskeyAction::{Display as D, Input as I, None as N};

type ActionTable = [[PasskeyAction; SMP_IO_CAPABILITY_COUNT]; SMP_IO_CAPABILITY_COUNT];

const INITIATOR_ACTIONS: ActionTable = [
    [N, N, I, N, I],
    [N, N, I, N, I],
    [D, D, I, N, D],
    [N, N, N, N, N],
    [D, D, D, N, D],
];

const RESPONDER_ACTIONS: ActionTable = [
    [N, N, D, N, D],
    [N, N, D, N, D],
    [I, I, I, N, I],
    [N, N, N, N, N],
    [I, I, I, N, I],
];

/// Decide what the local user must do for this pairing
pub fn resolve(
    role: PairingRole,
    oob_init: bool,
    oob_resp: bool,
    mitm_init: bool,
    mitm_resp: bool,
    io_init: IoCapability,
    io_resp: IoCapability,
) -> PasskeyAction {
    if oob_init && oob_resp {
        return PasskeyAction::Oob;
    }

    if !mitm_init || !mitm_resp {
        return PasskeyAction::None;
    }

    let table = match role {
        PairingRole::Initiator => &INITIATOR_ACTIONS,
        PairingRole::Responder => &RESPONDER_ACTIONS,
    };
    table[io_init.index()][io_resp.index()]
}

/// [`resolve`] applied to an exchanged request/response pair
pub fn resolve_commands(role: PairingRole, req: &PairCommand, rsp: &PairCommand) -> PasskeyAction {
    resolve(
        role,
        req.has_oob(),
        rsp.has_oob(),
        req.authreq().contains(AuthReq::MITM),
        rsp.authreq().contains(AuthReq::MITM),
        req.io_cap(),
        rsp.io_cap(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use IoCapability::*;

    #[test]
    fn test_oob_wins() {
        for mitm in [false, true] {
            assert_eq!(
                resolve(PairingRole::Initiator, true, true, mitm, mitm, NoInputNoOutput, DisplayOnly),
                PasskeyAction::Oob
            );
        }
        assert_eq!(
            resolve(PairingRole::Responder, true, false, false, false, KeyboardOnly, KeyboardOnly),
            PasskeyAction::None
        );
    }

    #[test]
    fn test_no_mitm_means_just_works() {
        assert_eq!(
            resolve(PairingRole::Initiator, false, false, true, false, KeyboardOnly, DisplayOnly),
            PasskeyAction::None
        );
        assert_eq!(
            resolve(PairingRole::Responder, false, false, false, true, KeyboardOnly, DisplayOnly),
            PasskeyAction::None
        );
    }

    #[test]
    fn test_keyboard_meets_display() {
        assert_eq!(
            resolve(PairingRole::Initiator, false, false, true, true, KeyboardOnly, DisplayOnly),
            PasskeyAction::Display
        );
        assert_eq!(
            resolve(PairingRole::Responder, false, false, true, true, KeyboardOnly, DisplayOnly),
            PasskeyAction::Input
        );
        assert_eq!(
            resolve(PairingRole::Initiator, false, false, true, true, DisplayOnly, KeyboardOnly),
            PasskeyAction::Input
        );
        assert_eq!(
            resolve(PairingRole::Responder, false, false, true, true, DisplayOnly, KeyboardOnly),
            PasskeyAction::Display
        );

        // Both keyboards: both type the same passkey
        assert_eq!(
            resolve(PairingRole::Initiator, false, false, true, true, KeyboardOnly, KeyboardOnly),
            PasskeyAction::Input
        );
        assert_eq!(
            resolve(PairingRole::Responder, false, false, true, true, KeyboardOnly, KeyboardOnly),
            PasskeyAction::Input
        );
    }

    #[test]
    fn test_every_combination_is_consistent() {
        let roles = [PairingRole::Initiator, PairingRole::Responder];
        for role in roles {
            for io_init in IoCapability::ALL {
                for io_resp in IoCapability::ALL {
                    for oob in [false, true] {
                        for mitm_init in [false, true] {
                            for mitm_resp in [false, true] {
                                let action =
                                    resolve(role, oob, oob, mitm_init, mitm_resp, io_init, io_resp);
                                if oob {
                                    assert_eq!(action, PasskeyAction::Oob);
                                } else if !(mitm_init && mitm_resp)
                                    || io_init == NoInputNoOutput
                                    || io_resp == NoInputNoOutput
                                {
                                    assert_eq!(action, PasskeyAction::None);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_full_tables_with_mitm() {
        let (n, i, d) = (PasskeyAction::None, PasskeyAction::Input, PasskeyAction::Display);
        let initiator = [
            [n, n, i, n, i],
            [n, n, i, n, i],
            [d, d, i, n, d],
            [n, n, n, n, n],
            [d, d, d, n, d],
        ];
        let responder = [
            [n, n, d, n, d],
            [n, n, d, n, d],
            [i, i, i, n, i],
            [n, n, n, n, n],
            [i, i, i, n, i],
        ];

        for (row, io_init) in IoCapability::ALL.into_iter().enumerate() {
            for (col, io_resp) in IoCapability::ALL.into_iter().enumerate() {
                assert_eq!(
                    resolve(PairingRole::Initiator, false, false, true, true, io_init, io_resp),
                    initiator[row][col],
                    "initiator {:?} / responder {:?}",
                    io_init,
                    io_resp
                );
                assert_eq!(
                    resolve(PairingRole::Responder, false, false, true, true, io_init, io_resp),
                    responder[row][col],
                    "responder side of {:?} / {:?}",
                    io_init,
                    io_resp
                );
            }
        }
    }

    #[test]
    fn test_roles_are_complementary() {
        // Whenever one side displays, the other side inputs
        for io_init in IoCapability::ALL {
            for io_resp in IoCapability::ALL {
                let init = resolve(PairingRole::Initiator, false, false, true, true, io_init, io_resp);
                let resp = resolve(PairingRole::Responder, false, false, true, true, io_init, io_resp);
                match (init, resp) {
                    (PasskeyAction::Display, other) => assert_eq!(other, PasskeyAction::Input),
                    (other, PasskeyAction::Display) => assert_eq!(other, PasskeyAction::Input),
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn test_action_algorithm() {
        use crate::smp::PairingAlgorithm;
        assert_eq!(PasskeyAction::None.algorithm(), PairingAlgorithm::JustWorks);
        assert_eq!(PasskeyAction::Oob.algorithm(), PairingAlgorithm::Oob);
        assert_eq!(PasskeyAction::Input.algorithm(), PairingAlgorithm::Passkey);
        assert_eq!(PasskeyAction::Display.algorithm(), PairingAlgorithm::Passkey);
        assert!(!PasskeyAction::None.is_authenticated());
        assert!(PasskeyAction::Display.is_authenticated());
    }
}
