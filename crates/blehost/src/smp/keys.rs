//! Key management for the Security Manager
//!
//! Keys exchanged during pairing are collected in [`SmKeys`] and persisted
//! through a [`KeyStore`] as two tables:
//!
//! - *slave* entries hold the LTK we handed out. They are looked up by
//!   EDIV/Rand when the controller asks for a key as peripheral.
//! - *master* entries hold the LTK the peer handed us. They are looked up by
//!   peer address when we start encryption as central.

use super::types::*;
use crate::gap::{AddressType, BdAddr};
use std::collections::HashMap;

/// Keys sent or received during one key distribution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmKeys {
    /// Long Term Key
    pub ltk: Option<[u8; 16]>,
    /// EDIV and Rand identifying the LTK
    pub ediv_rand: Option<(u16, u64)>,
    /// Identity Resolving Key
    pub irk: Option<[u8; 16]>,
    /// Identity address and its type
    pub identity_addr: Option<(AddressType, BdAddr)>,
    /// Connection Signature Resolving Key
    pub csrk: Option<[u8; 16]>,
}

impl SmKeys {
    pub fn is_empty(&self) -> bool {
        self.ltk.is_none() && self.irk.is_none() && self.csrk.is_none()
    }
}

/// Lookup criteria for a stored security entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecurityKey {
    pub peer_addr: Option<BdAddr>,
    pub ediv_rand: Option<(u16, u64)>,
}

impl SecurityKey {
    pub fn by_peer(peer_addr: BdAddr) -> Self {
        Self {
            peer_addr: Some(peer_addr),
            ediv_rand: None,
        }
    }

    pub fn by_ediv_rand(ediv: u16, rand: u64) -> Self {
        Self {
            peer_addr: None,
            ediv_rand: Some((ediv, rand)),
        }
    }

    fn matches(&self, value: &SecurityValue) -> bool {
        let addr_ok = self.peer_addr.map_or(true, |a| a == value.peer_addr);
        let id_ok = self
            .ediv_rand
            .map_or(true, |(ediv, rand)| ediv == value.ediv && rand == value.rand);
        addr_ok && id_ok
    }
}

/// A persisted bond
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityValue {
    pub peer_addr: BdAddr,
    pub ediv: u16,
    pub rand: u64,
    pub ltk: Option<[u8; 16]>,
    pub irk: Option<[u8; 16]>,
    pub csrk: Option<[u8; 16]>,
    /// The key was produced by MITM-protected pairing
    pub authenticated: bool,
}

impl SecurityValue {
    pub fn from_keys(peer_addr: BdAddr, keys: &SmKeys, authenticated: bool) -> Self {
        let (ediv, rand) = keys.ediv_rand.unwrap_or_default();
        Self {
            peer_addr,
            ediv,
            rand,
            ltk: keys.ltk,
            irk: keys.irk,
            csrk: keys.csrk,
            authenticated,
        }
    }
}

/// Key Store trait for persistent storage of security keys
pub trait KeyStore {
    /// Find a key we distributed (peripheral role lookups)
    fn read_slave_sec(&self, key: &SecurityKey) -> SmpResult<Option<SecurityValue>>;

    /// Find a key the peer distributed (central role lookups)
    fn read_master_sec(&self, key: &SecurityKey) -> SmpResult<Option<SecurityValue>>;

    fn write_slave_sec(&mut self, value: SecurityValue) -> SmpResult<()>;

    fn write_master_sec(&mut self, value: SecurityValue) -> SmpResult<()>;

    /// Forget every entry for a peer
    fn delete_peer(&mut self, peer_addr: &BdAddr) -> SmpResult<()>;
}

/// In-memory implementation of KeyStore
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    slave: HashMap<BdAddr, SecurityValue>,
    master: HashMap<BdAddr, SecurityValue>,
}

impl MemoryKeyStore {
    /// Create a new empty in-memory key store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all bonded peers
    pub fn bonded_peers(&self) -> Vec<BdAddr> {
        let mut peers: Vec<BdAddr> = self.master.keys().chain(self.slave.keys()).copied().collect();
        peers.sort_by_key(|addr| addr.bytes);
        peers.dedup();
        peers
    }
}

impl KeyStore for MemoryKeyStore {
    fn read_slave_sec(&self, key: &SecurityKey) -> SmpResult<Option<SecurityValue>> {
        Ok(self.slave.values().find(|v| key.matches(v)).cloned())
    }

    fn read_master_sec(&self, key: &SecurityKey) -> SmpResult<Option<SecurityValue>> {
        Ok(self.master.values().find(|v| key.matches(v)).cloned())
    }

    fn write_slave_sec(&mut self, value: SecurityValue) -> SmpResult<()> {
        self.slave.insert(value.peer_addr, value);
        Ok(())
    }

    fn write_master_sec(&mut self, value: SecurityValue) -> SmpResult<()> {
        self.master.insert(value.peer_addr, value);
        Ok(())
    }

    fn delete_peer(&mut self, peer_addr: &BdAddr) -> SmpResult<()> {
        self.slave.remove(peer_addr);
        self.master.remove(peer_addr);
        Ok(())
    }
}
