//! Security Manager engine
//!
//! This module drives LE legacy pairing, encryption restore and key
//! distribution. Each connection that is pairing owns one
//! [`PairingProcedure`]. Received PDUs and controller events are turned into
//! a [`StepResult`] which [`SecurityManager`] then applies: it runs the next
//! state's action while the result asks for one, removes finished or failed
//! procedures, tells the peer why pairing failed, persists keys and reports
//! events to the application.

use super::constants::*;
use super::crypto::{generate_random_128, tk_from_passkey};
use super::keys::*;
use super::legacy;
use super::pairing::*;
use super::types::*;
use crate::config::SmConfig;
use crate::gap::{AddressType, ConnectionDirectory, ConnectionInfo};
use crate::hci::{DisconnectionComplete, EncryptionChange, HciEvent, LtkRequest};
use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::time::Instant;

/// Controller and channel operations the Security Manager relies on
pub trait SmHost: ConnectionDirectory {
    /// Send one SMP PDU, opcode first, on the connection's SMP channel
    fn send_pdu(&mut self, conn_handle: u16, pdu: &[u8]) -> SmpResult<()>;

    /// Issue LE Start Encryption
    fn start_encryption(
        &mut self,
        conn_handle: u16,
        rand: u64,
        ediv: u16,
        ltk: &[u8; 16],
    ) -> SmpResult<()>;

    /// Answer an LE Long Term Key Request with a key
    fn ltk_reply(&mut self, conn_handle: u16, ltk: &[u8; 16]) -> SmpResult<()>;

    /// Answer an LE Long Term Key Request without a key
    fn ltk_neg_reply(&mut self, conn_handle: u16) -> SmpResult<()>;
}

/// Type for SM event callback
pub type SmEventCallback = Box<dyn FnMut(SmEvent) -> SmpResult<()> + Send>;

/// Outcome of one step of a procedure
#[derive(Debug, Default)]
pub(crate) struct StepResult {
    /// Set when the procedure must be aborted
    pub app_status: Option<SmpError>,
    /// Reason to send in a Pairing Failed PDU
    pub sm_err: Option<PairingFailureReason>,
    /// Report the procedure outcome to the application
    pub enc_cb: bool,
    /// Run the action of the procedure's current state
    pub do_state: bool,
    pub passkey_action: Option<PasskeyAction>,
}

impl StepResult {
    fn execute() -> Self {
        Self {
            do_state: true,
            ..Default::default()
        }
    }

    /// Abort the procedure and report it, telling the peer `reason` if any
    pub(crate) fn fail(&mut self, err: SmpError, reason: Option<PairingFailureReason>) {
        self.app_status = Some(err);
        self.sm_err = reason;
        self.enc_cb = true;
        self.do_state = false;
    }

    fn local(reason: PairingFailureReason) -> Self {
        let mut res = Self::default();
        res.fail(SmpError::Local(reason), Some(reason));
        res
    }

    /// Refuse a request the application never saw start
    fn reject(err: SmpError, reason: PairingFailureReason) -> Self {
        Self {
            app_status: Some(err),
            sm_err: Some(reason),
            ..Default::default()
        }
    }
}

/// Security Manager for LE legacy pairing
pub struct SecurityManager<H: SmHost> {
    config: SmConfig,
    host: H,
    key_store: Box<dyn KeyStore + Send>,
    procs: Vec<PairingProcedure>,
    event_callback: Option<SmEventCallback>,
    rng: Box<dyn RngCore + Send>,
}

impl<H: SmHost> SecurityManager<H> {
    /// Create a Security Manager seeded from the OS entropy source
    pub fn new(config: SmConfig, host: H, key_store: Box<dyn KeyStore + Send>) -> SmpResult<Self> {
        Self::with_rng(config, host, key_store, Box::new(StdRng::from_entropy()))
    }

    /// Create a Security Manager drawing randoms and keys from `rng`
    pub fn with_rng(
        config: SmConfig,
        host: H,
        key_store: Box<dyn KeyStore + Send>,
        rng: Box<dyn RngCore + Send>,
    ) -> SmpResult<Self> {
        config.validate()?;
        let procs = Vec::with_capacity(config.max_procs);

        Ok(Self {
            config,
            host,
            key_store,
            procs,
            event_callback: None,
            rng,
        })
    }

    /// Set the event callback
    pub fn set_event_callback<F>(&mut self, callback: F)
    where
        F: FnMut(SmEvent) -> SmpResult<()> + Send + 'static,
    {
        self.event_callback = Some(Box::new(callback));
    }

    pub fn config(&self) -> &SmConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn key_store(&self) -> &dyn KeyStore {
        self.key_store.as_ref()
    }

    /// Number of procedures in progress
    pub fn num_procs(&self) -> usize {
        self.procs.len()
    }

    /// State of the procedure running on a connection, if any
    pub fn proc_state(&self, conn_handle: u16) -> Option<ProcState> {
        self.proc_index(conn_handle).map(|idx| self.procs[idx].state)
    }

    // ---- Application API ----

    /// Start pairing as central
    pub fn pair_initiate(&mut self, conn_handle: u16) -> SmpResult<()> {
        let conn = self.connection(conn_handle)?;
        if !conn.is_master {
            return Err(SmpError::InvalidParameter(
                "only the central starts pairing".into(),
            ));
        }
        if self.proc_index(conn_handle).is_some() {
            return Err(SmpError::Already);
        }

        self.insert_proc(conn_handle, ProcState::Pair, ProcFlags::INITIATOR)?;
        info!("conn {:#06x}: starting pairing", conn_handle);
        self.process_result(conn_handle, StepResult::execute())
    }

    /// Ask the central to secure the link (peripheral only)
    pub fn slave_initiate(&mut self, conn_handle: u16) -> SmpResult<()> {
        let conn = self.connection(conn_handle)?;
        if conn.is_master {
            return Err(SmpError::InvalidParameter(
                "security requests come from the peripheral".into(),
            ));
        }
        if self.proc_index(conn_handle).is_some() {
            return Err(SmpError::Already);
        }

        self.insert_proc(conn_handle, ProcState::SecReq, ProcFlags::empty())?;
        self.process_result(conn_handle, StepResult::execute())
    }

    /// Encrypt the link with a previously distributed LTK (central only)
    pub fn enc_initiate(
        &mut self,
        conn_handle: u16,
        ltk: [u8; 16],
        ediv: u16,
        rand: u64,
        authenticated: bool,
    ) -> SmpResult<()> {
        let conn = self.connection(conn_handle)?;
        if !conn.is_master {
            return Err(SmpError::InvalidParameter(
                "only the central starts encryption".into(),
            ));
        }
        if self.proc_index(conn_handle).is_some() {
            return Err(SmpError::Already);
        }

        let mut flags = ProcFlags::INITIATOR | ProcFlags::BONDED;
        flags.set(ProcFlags::AUTHENTICATED, authenticated);
        let idx = self.insert_proc(conn_handle, ProcState::EncRestore, flags)?;
        self.procs[idx].ltk = ltk;

        let mut res = StepResult::default();
        if let Err(err) = self.host.start_encryption(conn_handle, rand, ediv, &ltk) {
            res.fail(err, None);
        }
        self.process_result(conn_handle, res)
    }

    /// Supply the passkey or OOB data a [`SmEvent::PasskeyAction`] asked for
    pub fn set_tk(&mut self, conn_handle: u16, passkey: Passkey) -> SmpResult<()> {
        let idx = self.proc_in_state(conn_handle, ProcState::Confirm)?;
        let proc = &mut self.procs[idx];
        if proc.flags.contains(ProcFlags::TK_VALID) {
            return Err(SmpError::Already);
        }

        let mut res = StepResult::default();
        let expected = proc.passkey_action();
        if passkey.action() != expected {
            res.fail(
                SmpError::InvalidParameter(format!(
                    "{:?} does not answer {:?}",
                    passkey.action(),
                    expected
                )),
                Some(PairingFailureReason::PasskeyEntryFailed),
            );
            return self.process_result(conn_handle, res);
        }

        let tk = match passkey {
            Passkey::Oob(Some(tk)) => Ok(tk),
            Passkey::Oob(None) => Err(PairingFailureReason::OobNotAvailable),
            Passkey::Input(value) | Passkey::Display(value) => {
                tk_from_passkey(value).map_err(|_| PairingFailureReason::PasskeyEntryFailed)
            }
        };

        match tk {
            Ok(tk) => {
                proc.tk = tk;
                proc.flags |= ProcFlags::TK_VALID;
                res.do_state =
                    proc.is_initiator() || proc.flags.contains(ProcFlags::RX_CONFIRM);
            }
            Err(reason) => res.fail(SmpError::Local(reason), Some(reason)),
        }
        self.process_result(conn_handle, res)
    }

    /// Abort whatever is running on a connection that went away
    pub fn connection_broken(&mut self, conn_handle: u16) {
        let Some(idx) = self.proc_index(conn_handle) else {
            return;
        };

        let proc = self.procs.remove(idx);
        info!(
            "conn {:#06x}: disconnected during {:?}",
            conn_handle, proc.state
        );
        self.notify_event(SmEvent::EncryptionChanged {
            conn_handle,
            status: Err(SmpError::NotConnected),
            security: proc.security_state(false),
        });
    }

    /// Expire idle procedures using the current time
    pub fn heartbeat(&mut self) -> Option<Instant> {
        self.heartbeat_at(Instant::now())
    }

    /// Expire procedures whose timer ran out at `now`. Returns the next
    /// deadline, if any procedure is still running.
    pub fn heartbeat_at(&mut self, now: Instant) -> Option<Instant> {
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.procs)
            .into_iter()
            .partition(|proc| proc.expires <= now);
        self.procs = live;

        for proc in expired {
            warn!(
                "conn {:#06x}: security procedure timed out in {:?}",
                proc.conn_handle, proc.state
            );
            self.notify_event(SmEvent::EncryptionChanged {
                conn_handle: proc.conn_handle,
                status: Err(SmpError::Timeout),
                security: proc.security_state(false),
            });
            self.notify_event(SmEvent::Timeout {
                conn_handle: proc.conn_handle,
            });
        }

        self.procs.iter().map(|proc| proc.expires).min()
    }

    // ---- Inputs ----

    /// Handle a PDU received on the SMP channel
    pub fn handle_smp_packet(&mut self, conn_handle: u16, data: &[u8]) -> SmpResult<()> {
        let Some(&opcode) = data.first() else {
            return Err(SmpError::BadData);
        };
        debug!(
            "conn {:#06x}: rx smp {}",
            conn_handle,
            hex::encode(data)
        );

        let res = match opcode {
            SMP_PAIRING_REQUEST => self.rx_pair_req(conn_handle, data),
            SMP_PAIRING_RESPONSE => self.rx_pair_rsp(conn_handle, data),
            SMP_PAIRING_CONFIRM => self.rx_confirm(conn_handle, data),
            SMP_PAIRING_RANDOM => self.rx_random(conn_handle, data),
            SMP_PAIRING_FAILED => Ok(rx_pair_fail(data)),
            SMP_ENCRYPTION_INFORMATION
            | SMP_MASTER_IDENTIFICATION
            | SMP_IDENTITY_INFORMATION
            | SMP_IDENTITY_ADDRESS_INFORMATION
            | SMP_SIGNING_INFORMATION => self.rx_key(conn_handle, opcode, data),
            SMP_SECURITY_REQUEST => self.rx_sec_req(conn_handle, data),
            SMP_PAIRING_PUBLIC_KEY | SMP_PAIRING_DHK_CHECK | SMP_PAIRING_KEYPRESS_NOTIFICATION => {
                Ok(StepResult::local(PairingFailureReason::CommandNotSupported))
            }
            _ => {
                warn!("conn {:#06x}: unknown smp opcode {:#04x}", conn_handle, opcode);
                Err(SmpError::NotSupported)
            }
        }?;

        self.process_result(conn_handle, res)
    }

    /// Handle the controller events the Security Manager cares about
    pub fn handle_hci_event(&mut self, event: &HciEvent) -> SmpResult<()> {
        if let Some(evt) = EncryptionChange::parse(event) {
            return self.rx_encryption_change(
                evt.connection_handle,
                evt.status,
                evt.encryption_enabled != 0,
            );
        }

        if let Some(evt) = LtkRequest::parse(event) {
            return self.rx_lt_key_req(
                evt.connection_handle,
                evt.encrypted_diversifier,
                evt.random_number,
            );
        }

        if let Some(evt) = DisconnectionComplete::parse(event) {
            if evt.status == 0 {
                self.connection_broken(evt.connection_handle);
            }
        }

        Ok(())
    }

    /// LE Long Term Key Request from the controller (peripheral role)
    pub fn rx_lt_key_req(&mut self, conn_handle: u16, ediv: u16, rand: u64) -> SmpResult<()> {
        let idx = match self.proc_index(conn_handle) {
            Some(idx) => idx,
            None => match self.insert_proc(conn_handle, ProcState::LtkRestore, ProcFlags::BONDED) {
                Ok(idx) => idx,
                Err(err) => {
                    if let Err(reply_err) = self.host.ltk_neg_reply(conn_handle) {
                        warn!("conn {:#06x}: LTK negative reply failed: {}", conn_handle, reply_err);
                    }
                    return Err(err);
                }
            },
        };

        let proc = &mut self.procs[idx];
        if proc.state == ProcState::SecReq {
            proc.state = ProcState::LtkRestore;
            proc.flags |= ProcFlags::BONDED;
        }

        let state = proc.state;
        let res = match state {
            ProcState::LtkStart => StepResult::execute(),
            ProcState::LtkRestore => self.restore_ltk(idx, ediv, rand),
            state => {
                warn!("conn {:#06x}: unexpected LTK request in {:?}", conn_handle, state);
                if let Err(err) = self.host.ltk_neg_reply(conn_handle) {
                    warn!("conn {:#06x}: LTK negative reply failed: {}", conn_handle, err);
                }
                StepResult::local(PairingFailureReason::UnspecifiedReason)
            }
        };
        self.process_result(conn_handle, res)
    }

    /// Encryption Change from the controller
    pub fn rx_encryption_change(
        &mut self,
        conn_handle: u16,
        status: u8,
        enabled: bool,
    ) -> SmpResult<()> {
        let Some(idx) = self.proc_index(conn_handle).filter(|&idx| {
            matches!(
                self.procs[idx].state,
                ProcState::EncStart | ProcState::EncRestore
            )
        }) else {
            debug!("conn {:#06x}: encryption change with no procedure", conn_handle);
            return Ok(());
        };

        let mut res = StepResult::default();
        if status != 0 {
            res.fail(SmpError::Hci(status), None);
        } else if !enabled {
            res.fail(SmpError::Controller("encryption not enabled".into()), None);
        } else {
            let proc = &mut self.procs[idx];
            let key_exchange =
                proc.state == ProcState::EncStart && proc.flags.contains(ProcFlags::KEY_EXCHANGE);
            if key_exchange {
                proc.state = ProcState::KeyExch;
                // The responder distributes first
                res.do_state = !proc.is_initiator() || proc.rx_key_flags.is_empty();
            } else {
                proc.state = ProcState::Done;
                res.enc_cb = true;
            }
        }
        self.process_result(conn_handle, res)
    }

    // ---- Received PDUs ----

    fn rx_pair_req(&mut self, conn_handle: u16, data: &[u8]) -> SmpResult<StepResult> {
        let conn = self.connection(conn_handle)?;

        if let Some(idx) = self.proc_index(conn_handle) {
            let old = self.procs.remove(idx);
            debug!(
                "conn {:#06x}: pairing request replaces procedure in {:?}",
                conn_handle, old.state
            );
        }

        if conn.is_master {
            let reason = PairingFailureReason::CommandNotSupported;
            return Ok(StepResult::reject(SmpError::Local(reason), reason));
        }

        let req = match PairCommand::parse(data) {
            Ok(req) if req.is_valid() => req,
            _ => {
                let reason = PairingFailureReason::InvalidParameters;
                return Ok(StepResult::reject(SmpError::Local(reason), reason));
            }
        };

        let idx = match self.insert_proc(conn_handle, ProcState::Pair, ProcFlags::empty()) {
            Ok(idx) => idx,
            Err(err) => {
                return Ok(StepResult::reject(
                    err,
                    PairingFailureReason::UnspecifiedReason,
                ))
            }
        };
        self.procs[idx].pair_req = req;
        Ok(StepResult::execute())
    }

    fn rx_pair_rsp(&mut self, conn_handle: u16, data: &[u8]) -> SmpResult<StepResult> {
        let idx = self.proc_in_state(conn_handle, ProcState::Pair)?;
        if !self.procs[idx].is_initiator() {
            return Err(SmpError::NotFound);
        }

        let rsp = match PairCommand::parse(data) {
            Ok(rsp) if rsp.is_valid() => rsp,
            _ => return Ok(StepResult::local(PairingFailureReason::InvalidParameters)),
        };

        let proc = &mut self.procs[idx];
        proc.pair_rsp = rsp;
        check_key_exchange(proc);
        proc.state = ProcState::Confirm;

        let mut res = StepResult::default();
        match apply_passkey_action(proc) {
            PasskeyAction::None => res.do_state = true,
            action => res.passkey_action = Some(action),
        }
        Ok(res)
    }

    fn rx_confirm(&mut self, conn_handle: u16, data: &[u8]) -> SmpResult<StepResult> {
        let idx = self.proc_in_state(conn_handle, ProcState::Confirm)?;
        let Ok(pdu) = PairingConfirm::parse(data) else {
            return Ok(StepResult::local(PairingFailureReason::InvalidParameters));
        };

        let proc = &mut self.procs[idx];
        proc.confirm_peer = pdu.confirm_value;

        let mut res = StepResult::default();
        if proc.is_initiator() {
            proc.state = ProcState::Random;
            res.do_state = true;
        } else {
            proc.flags |= ProcFlags::RX_CONFIRM;
            res.do_state = can_advance(proc);
        }
        Ok(res)
    }

    fn rx_random(&mut self, conn_handle: u16, data: &[u8]) -> SmpResult<StepResult> {
        let idx = self.proc_in_state(conn_handle, ProcState::Random)?;
        let Ok(pdu) = PairingRandom::parse(data) else {
            return Ok(StepResult::local(PairingFailureReason::InvalidParameters));
        };

        let mut res = StepResult::default();
        match self.connection(conn_handle) {
            Ok(conn) => legacy::random_rx(&mut self.procs[idx], &conn, pdu.random_value, &mut res),
            Err(err) => res.fail(err, Some(PairingFailureReason::UnspecifiedReason)),
        }
        Ok(res)
    }

    fn rx_key(&mut self, conn_handle: u16, opcode: u8, data: &[u8]) -> SmpResult<StepResult> {
        let idx = self.proc_in_state(conn_handle, ProcState::KeyExch)?;
        let proc = &mut self.procs[idx];
        let keys = &mut proc.peer_keys;

        let parsed = match opcode {
            SMP_ENCRYPTION_INFORMATION => EncryptionInformation::parse(data).map(|pdu| {
                keys.ltk = Some(pdu.ltk);
                KeyExchangeFlags::ENC_INFO
            }),
            SMP_MASTER_IDENTIFICATION => MasterIdentification::parse(data).map(|pdu| {
                keys.ediv_rand = Some((pdu.ediv, pdu.rand));
                KeyExchangeFlags::MASTER_IDEN
            }),
            SMP_IDENTITY_INFORMATION => IdentityInformation::parse(data).map(|pdu| {
                keys.irk = Some(pdu.irk);
                KeyExchangeFlags::IDEN_INFO
            }),
            SMP_IDENTITY_ADDRESS_INFORMATION => IdentityAddressInformation::parse(data).map(|pdu| {
                keys.identity_addr = Some((AddressType::from(pdu.addr_type), pdu.bd_addr));
                KeyExchangeFlags::ADDR_INFO
            }),
            _ => SigningInformation::parse(data).map(|pdu| {
                keys.csrk = Some(pdu.csrk);
                KeyExchangeFlags::SIGN_INFO
            }),
        };

        let Ok(flag) = parsed else {
            return Ok(StepResult::local(PairingFailureReason::InvalidParameters));
        };
        proc.rx_key_flags.remove(flag);
        trace!(
            "conn {:#06x}: got {:?}, waiting for {:?}",
            conn_handle,
            flag,
            proc.rx_key_flags
        );

        let mut res = StepResult::default();
        if proc.rx_key_flags.is_empty() {
            if proc.is_initiator() {
                // Our turn to distribute
                res.do_state = true;
            } else {
                complete_key_exchange(proc, &mut res);
            }
        }
        Ok(res)
    }

    fn rx_sec_req(&mut self, conn_handle: u16, data: &[u8]) -> SmpResult<StepResult> {
        let conn = self.connection(conn_handle)?;
        if !conn.is_master {
            let reason = PairingFailureReason::CommandNotSupported;
            return Ok(StepResult::reject(SmpError::Local(reason), reason));
        }

        let Ok(pdu) = SecurityRequest::parse(data) else {
            let reason = PairingFailureReason::InvalidParameters;
            return Ok(StepResult::reject(SmpError::Local(reason), reason));
        };

        if self.proc_index(conn_handle).is_some() {
            return Err(SmpError::Already);
        }

        let mitm = pdu.authreq().contains(AuthReq::MITM);
        let stored = self
            .key_store
            .read_master_sec(&SecurityKey::by_peer(conn.peer_addr))?;
        let restore = stored.and_then(|value| {
            let ltk = value.ltk?;
            (value.authenticated || !mitm).then_some((ltk, value))
        });

        match restore {
            Some((ltk, value)) => {
                debug!("conn {:#06x}: security request, restoring bond", conn_handle);
                self.enc_initiate(conn_handle, ltk, value.ediv, value.rand, value.authenticated)?;
            }
            None => {
                debug!("conn {:#06x}: security request, pairing", conn_handle);
                self.pair_initiate(conn_handle)?;
            }
        }
        Ok(StepResult::default())
    }

    // ---- State actions ----

    fn go(&mut self, idx: usize, res: &mut StepResult) {
        let state = self.procs[idx].state;
        debug!(
            "conn {:#06x}: running {:?}",
            self.procs[idx].conn_handle, state
        );

        match state {
            ProcState::Pair => self.pair_go(idx, res),
            ProcState::Confirm => self.confirm_go(idx, res),
            ProcState::Random => self.random_go(idx, res),
            ProcState::LtkStart | ProcState::LtkRestore => self.ltk_reply_go(idx, res),
            ProcState::EncStart => self.enc_start_go(idx, res),
            ProcState::KeyExch => self.key_exch_go(idx, res),
            ProcState::SecReq => self.sec_req_go(idx, res),
            ProcState::EncRestore | ProcState::Done => {}
        }
    }

    fn pair_go(&mut self, idx: usize, res: &mut StepResult) {
        let initiator = self.procs[idx].is_initiator();
        let conn_handle = self.procs[idx].conn_handle;

        let (init_keys, resp_keys) = if initiator {
            (self.config.our_key_dist, self.config.their_key_dist)
        } else {
            let req = &self.procs[idx].pair_req;
            (
                req.init_keys() & self.config.their_key_dist,
                req.resp_keys() & self.config.our_key_dist,
            )
        };

        let cmd = PairCommand {
            io_capability: self.config.io_capability.to_u8(),
            oob_data_flag: if self.config.oob_data_flag {
                SMP_OOB_DATA_PRESENT
            } else {
                SMP_OOB_DATA_NOT_PRESENT
            },
            auth_req: self.config.build_authreq().bits(),
            max_key_size: self.config.max_key_size(),
            initiator_key_dist: init_keys.bits(),
            responder_key_dist: resp_keys.bits(),
        };

        let random = generate_random_128(&mut *self.rng);
        let proc = &mut self.procs[idx];
        *proc.our_random_mut() = random;
        if initiator {
            proc.pair_req = cmd;
        } else {
            proc.pair_rsp = cmd;
        }

        if let Err(err) = self.send(conn_handle, &cmd.serialize(initiator)) {
            res.fail(err, Some(PairingFailureReason::UnspecifiedReason));
            return;
        }

        if !initiator {
            let proc = &mut self.procs[idx];
            check_key_exchange(proc);
            proc.state = ProcState::Confirm;
            let action = apply_passkey_action(proc);
            if action != PasskeyAction::None {
                res.passkey_action = Some(action);
            }
        }
    }

    fn confirm_go(&mut self, idx: usize, res: &mut StepResult) {
        let conn_handle = self.procs[idx].conn_handle;
        let conn = match self.connection(conn_handle) {
            Ok(conn) => conn,
            Err(err) => {
                res.fail(err, Some(PairingFailureReason::UnspecifiedReason));
                return;
            }
        };

        let pdu = legacy::confirm_pdu(&self.procs[idx], &conn);
        if let Err(err) = self.send(conn_handle, &pdu.serialize()) {
            res.fail(err, Some(PairingFailureReason::UnspecifiedReason));
            return;
        }

        let proc = &mut self.procs[idx];
        if !proc.is_initiator() {
            proc.state = ProcState::Random;
        }
    }

    fn random_go(&mut self, idx: usize, res: &mut StepResult) {
        let conn_handle = self.procs[idx].conn_handle;
        let pdu = legacy::random_pdu(&self.procs[idx]);
        if let Err(err) = self.send(conn_handle, &pdu.serialize()) {
            res.fail(err, Some(PairingFailureReason::UnspecifiedReason));
            return;
        }

        let proc = &mut self.procs[idx];
        if !proc.is_initiator() {
            proc.state = ProcState::LtkStart;
        }
    }

    fn ltk_reply_go(&mut self, idx: usize, res: &mut StepResult) {
        let proc = &self.procs[idx];
        let (conn_handle, ltk) = (proc.conn_handle, proc.ltk);

        match self.host.ltk_reply(conn_handle, &ltk) {
            Ok(()) => {
                let proc = &mut self.procs[idx];
                proc.state = if proc.state == ProcState::LtkStart {
                    ProcState::EncStart
                } else {
                    ProcState::EncRestore
                };
            }
            Err(err) => res.fail(err, Some(PairingFailureReason::UnspecifiedReason)),
        }
    }

    fn enc_start_go(&mut self, idx: usize, res: &mut StepResult) {
        let proc = &self.procs[idx];
        // The responder waits for the controller's LTK request instead
        if !proc.is_initiator() {
            return;
        }

        let (conn_handle, stk) = (proc.conn_handle, proc.ltk);
        if let Err(err) = self.host.start_encryption(conn_handle, 0, 0, &stk) {
            res.fail(err, Some(PairingFailureReason::UnspecifiedReason));
        }
    }

    fn key_exch_go(&mut self, idx: usize, res: &mut StepResult) {
        let conn_handle = self.procs[idx].conn_handle;
        let dist = self.procs[idx].our_key_dist();

        let conn = match self.connection(conn_handle) {
            Ok(conn) => conn,
            Err(err) => {
                res.fail(err, Some(PairingFailureReason::UnspecifiedReason));
                return;
            }
        };

        let mut keys = SmKeys::default();
        let mut pdus = Vec::new();

        if dist.contains(KeyDistribution::ENC_KEY) {
            let ltk = generate_random_128(&mut *self.rng);
            let ediv = self.rng.next_u32() as u16;
            let rand = self.rng.next_u64();
            pdus.push(EncryptionInformation::new(ltk).serialize());
            pdus.push(MasterIdentification::new(ediv, rand).serialize());
            keys.ltk = Some(ltk);
            keys.ediv_rand = Some((ediv, rand));
        }

        if dist.contains(KeyDistribution::ID_KEY) {
            let irk = generate_random_128(&mut *self.rng);
            let addr_type = if conn.our_addr_type.is_random() {
                AddressType::Random
            } else {
                AddressType::Public
            };
            pdus.push(IdentityInformation::new(irk).serialize());
            pdus.push(IdentityAddressInformation::new(addr_type.into(), conn.our_addr).serialize());
            keys.irk = Some(irk);
            keys.identity_addr = Some((addr_type, conn.our_addr));
        }

        if dist.contains(KeyDistribution::SIGN_KEY) {
            let csrk = generate_random_128(&mut *self.rng);
            pdus.push(SigningInformation::new(csrk).serialize());
            keys.csrk = Some(csrk);
        }

        for pdu in &pdus {
            if let Err(err) = self.send(conn_handle, pdu) {
                res.fail(err, Some(PairingFailureReason::UnspecifiedReason));
                return;
            }
        }

        let proc = &mut self.procs[idx];
        proc.our_keys = keys;
        if proc.is_initiator() || proc.rx_key_flags.is_empty() {
            complete_key_exchange(proc, res);
        }
    }

    fn sec_req_go(&mut self, idx: usize, res: &mut StepResult) {
        let conn_handle = self.procs[idx].conn_handle;
        let pdu = SecurityRequest::new(self.config.build_authreq());
        if let Err(err) = self.send(conn_handle, &pdu.serialize()) {
            res.fail(err, None);
        }
    }

    // ---- Result processing ----

    /// Apply `res` to the connection's procedure, running state actions
    /// for as long as they ask for it.
    fn process_result(&mut self, conn_handle: u16, mut res: StepResult) -> SmpResult<()> {
        loop {
            let Some(mut idx) = self.proc_index(conn_handle) else {
                if let Some(reason) = res.sm_err.take() {
                    self.send_pair_fail(conn_handle, reason);
                }
                break;
            };

            if res.do_state {
                res = StepResult::default();
                self.go(idx, &mut res);
                idx = match self.proc_index(conn_handle) {
                    Some(idx) => idx,
                    None => break,
                };
            }

            let status = match &res.app_status {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            };
            let finished = status.is_err() || self.procs[idx].state == ProcState::Done;
            let security = self.procs[idx].security_state(status.is_ok());

            let removed = if finished {
                let proc = self.procs.remove(idx);
                debug!(
                    "conn {:#06x}: procedure finished in {:?}: {:?}",
                    conn_handle, proc.state, status
                );
                Some(proc)
            } else {
                self.procs[idx].expires = Instant::now() + self.config.timeout;
                None
            };

            if let Some(reason) = res.sm_err.take() {
                self.send_pair_fail(conn_handle, reason);
            }

            if res.enc_cb {
                self.notify_event(SmEvent::EncryptionChanged {
                    conn_handle,
                    status: status.clone(),
                    security,
                });
            }

            if status.is_ok() {
                if let Some(action) = res.passkey_action {
                    self.notify_event(SmEvent::PasskeyAction {
                        conn_handle,
                        action,
                    });
                }
            }

            if let Some(proc) = removed {
                if status.is_ok() && proc.flags.contains(ProcFlags::BONDED) {
                    self.persist_keys(&proc);
                }
                break;
            }

            if !res.do_state {
                break;
            }
        }

        match res.app_status {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn restore_ltk(&mut self, idx: usize, ediv: u16, rand: u64) -> StepResult {
        let conn_handle = self.procs[idx].conn_handle;
        let mut res = StepResult::default();

        match self
            .key_store
            .read_slave_sec(&SecurityKey::by_ediv_rand(ediv, rand))
        {
            Ok(Some(SecurityValue {
                ltk: Some(ltk),
                authenticated,
                ..
            })) => {
                let proc = &mut self.procs[idx];
                proc.ltk = ltk;
                proc.flags.set(ProcFlags::AUTHENTICATED, authenticated);
                res.do_state = true;
            }
            lookup => {
                debug!(
                    "conn {:#06x}: no LTK for ediv {:#06x} rand {:#018x}",
                    conn_handle, ediv, rand
                );
                if let Err(err) = self.host.ltk_neg_reply(conn_handle) {
                    warn!("conn {:#06x}: LTK negative reply failed: {}", conn_handle, err);
                }
                res.fail(lookup.err().unwrap_or(SmpError::NotFound), None);
            }
        }
        res
    }

    fn persist_keys(&mut self, proc: &PairingProcedure) {
        if proc.our_keys.is_empty() && proc.peer_keys.is_empty() {
            return;
        }

        let Some(conn) = self.host.find_connection(proc.conn_handle) else {
            warn!(
                "conn {:#06x}: connection gone, keys not stored",
                proc.conn_handle
            );
            return;
        };

        let peer_addr = proc
            .peer_keys
            .identity_addr
            .map(|(_, addr)| addr)
            .unwrap_or(conn.peer_addr);
        let authenticated = proc.flags.contains(ProcFlags::AUTHENTICATED);

        if !proc.our_keys.is_empty() {
            let value = SecurityValue::from_keys(peer_addr, &proc.our_keys, authenticated);
            if let Err(err) = self.key_store.write_slave_sec(value) {
                warn!("failed to store keys for {}: {}", peer_addr, err);
                return;
            }
        }
        if !proc.peer_keys.is_empty() {
            let value = SecurityValue::from_keys(peer_addr, &proc.peer_keys, authenticated);
            if let Err(err) = self.key_store.write_master_sec(value) {
                warn!("failed to store keys for {}: {}", peer_addr, err);
                return;
            }
        }

        info!("conn {:#06x}: bonded with {}", proc.conn_handle, peer_addr);
        self.notify_event(SmEvent::KeysStored {
            conn_handle: proc.conn_handle,
            peer_addr,
        });
    }

    // ---- Helpers ----

    fn proc_index(&self, conn_handle: u16) -> Option<usize> {
        self.procs
            .iter()
            .position(|proc| proc.conn_handle == conn_handle)
    }

    fn proc_in_state(&self, conn_handle: u16, state: ProcState) -> SmpResult<usize> {
        self.proc_index(conn_handle)
            .filter(|&idx| self.procs[idx].state == state)
            .ok_or(SmpError::NotFound)
    }

    fn insert_proc(
        &mut self,
        conn_handle: u16,
        state: ProcState,
        flags: ProcFlags,
    ) -> SmpResult<usize> {
        if self.procs.len() >= self.config.max_procs {
            warn!("conn {:#06x}: no free security procedure", conn_handle);
            return Err(SmpError::NoResources);
        }

        let expires = Instant::now() + self.config.timeout;
        self.procs
            .push(PairingProcedure::new(conn_handle, state, flags, expires));
        Ok(self.procs.len() - 1)
    }

    fn connection(&self, conn_handle: u16) -> SmpResult<ConnectionInfo> {
        self.host
            .find_connection(conn_handle)
            .ok_or(SmpError::NotConnected)
    }

    fn send(&mut self, conn_handle: u16, pdu: &[u8]) -> SmpResult<()> {
        debug!("conn {:#06x}: tx smp {}", conn_handle, hex::encode(pdu));
        self.host.send_pdu(conn_handle, pdu)
    }

    fn send_pair_fail(&mut self, conn_handle: u16, reason: PairingFailureReason) {
        info!("conn {:#06x}: pairing failed: {}", conn_handle, reason);
        let pdu = PairingFailed::new(reason).serialize();
        if let Err(err) = self.send(conn_handle, &pdu) {
            warn!("conn {:#06x}: could not send pairing failed: {}", conn_handle, err);
        }
    }

    fn notify_event(&mut self, event: SmEvent) {
        debug!("sm event {:?}", event);
        if let Some(callback) = self.event_callback.as_mut() {
            if let Err(err) = callback(event) {
                warn!("sm event callback failed: {}", err);
            }
        }
    }
}

fn rx_pair_fail(data: &[u8]) -> StepResult {
    let status = match PairingFailed::parse(data) {
        Ok(pdu) => SmpError::Peer(pdu.reason()),
        Err(_) => SmpError::BadData,
    };
    StepResult {
        app_status: Some(status),
        enc_cb: true,
        ..Default::default()
    }
}

/// Decide whether keys follow encryption and which ones we wait for
fn check_key_exchange(proc: &mut PairingProcedure) {
    let bonding = proc.pair_req.authreq().contains(AuthReq::BOND)
        && proc.pair_rsp.authreq().contains(AuthReq::BOND);
    let any_keys = !proc.pair_rsp.init_keys().is_empty() || !proc.pair_rsp.resp_keys().is_empty();

    if bonding && any_keys {
        proc.flags |= ProcFlags::KEY_EXCHANGE;
    }
    proc.rx_key_flags = KeyExchangeFlags::expected(proc.their_key_dist());
}

fn apply_passkey_action(proc: &mut PairingProcedure) -> PasskeyAction {
    let action = proc.passkey_action();
    proc.pair_alg = action.algorithm();
    if action.is_authenticated() {
        proc.flags |= ProcFlags::AUTHENTICATED;
    }
    action
}

/// Whether the responder may send its confirm
fn can_advance(proc: &PairingProcedure) -> bool {
    proc.passkey_action() == PasskeyAction::None || proc.flags.contains(ProcFlags::TK_VALID)
}

fn complete_key_exchange(proc: &mut PairingProcedure, res: &mut StepResult) {
    proc.flags |= ProcFlags::BONDED;
    proc.state = ProcState::Done;
    res.enc_cb = true;
}
