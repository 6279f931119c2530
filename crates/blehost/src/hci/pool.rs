//! Fixed-size buffer pools shared by the HCI framers
//!
//! A [`BufferPool`] owns three free lists: event-class blocks, the single
//! host command block and ACL data blocks. Allocation hands out a
//! [`PacketBuffer`] that owns its block by value; the block goes back to its
//! free list when the buffer is dropped, so a buffer is released exactly once
//! no matter which side of the transport ends up holding it.
//!
//! All list manipulation happens inside a critical section so the pools can
//! be shared between task code and the UART interrupt handlers.

use crate::config::TransportConfig;
use crate::error::HciError;
use crate::hci::constants::HCI_TRANS_CMD_SZ;
use critical_section::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Class of buffer requested from a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Low-priority event (e.g. advertising reports)
    EventLow,
    /// High-priority event or received command
    EventHigh,
    /// The host command buffer
    Command,
    /// ACL data block
    Acl,
}

type ReleaseHook = Arc<dyn Fn(BufferKind) + Send + Sync>;

struct FreeLists {
    evt: Vec<Box<[u8]>>,
    cmd: Option<Box<[u8]>>,
    acl: Vec<Box<[u8]>>,
}

struct PoolShared {
    lists: Mutex<RefCell<FreeLists>>,
    release_hook: Mutex<RefCell<Option<ReleaseHook>>>,
    num_evt_bufs: usize,
    num_acl_bufs: usize,
}

impl PoolShared {
    fn give_back(&self, kind: BufferKind, block: Box<[u8]>) {
        let hook = critical_section::with(|cs| {
            let mut lists = self.lists.borrow_ref_mut(cs);
            match kind {
                BufferKind::EventLow | BufferKind::EventHigh => {
                    debug_assert!(lists.evt.len() < self.num_evt_bufs);
                    lists.evt.push(block);
                }
                BufferKind::Command => {
                    debug_assert!(lists.cmd.is_none());
                    lists.cmd = Some(block);
                }
                BufferKind::Acl => {
                    debug_assert!(lists.acl.len() < self.num_acl_bufs);
                    lists.acl.push(block);
                }
            }
            self.release_hook.borrow_ref(cs).clone()
        });

        // Outside the critical section: the hook may restart a driver.
        if let Some(hook) = hook {
            hook(kind);
        }
    }
}

/// Handle to a set of fixed buffer pools. Cloning shares the pools.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(config: &TransportConfig) -> Self {
        let evt = (0..config.num_evt_bufs)
            .map(|_| vec![0u8; config.evt_buf_size].into_boxed_slice())
            .collect();
        let acl = (0..config.num_acl_bufs)
            .map(|_| vec![0u8; config.acl_buf_size].into_boxed_slice())
            .collect();

        Self {
            shared: Arc::new(PoolShared {
                lists: Mutex::new(RefCell::new(FreeLists {
                    evt,
                    cmd: Some(vec![0u8; HCI_TRANS_CMD_SZ].into_boxed_slice()),
                    acl,
                })),
                release_hook: Mutex::new(RefCell::new(None)),
                num_evt_bufs: config.num_evt_bufs,
                num_acl_bufs: config.num_acl_bufs,
            }),
        }
    }

    /// Take a buffer of the requested kind, or `None` if that pool is empty
    pub fn allocate(&self, kind: BufferKind) -> Option<PacketBuffer> {
        let block = critical_section::with(|cs| {
            let mut lists = self.shared.lists.borrow_ref_mut(cs);
            match kind {
                BufferKind::EventLow | BufferKind::EventHigh => lists.evt.pop(),
                BufferKind::Command => lists.cmd.take(),
                BufferKind::Acl => lists.acl.pop(),
            }
        })?;

        Some(PacketBuffer {
            data: Some(block),
            len: 0,
            kind,
            pool: Arc::clone(&self.shared),
        })
    }

    pub fn allocate_acl(&self) -> Option<PacketBuffer> {
        self.allocate(BufferKind::Acl)
    }

    /// Start an ACL chain with one fresh block
    pub fn allocate_chain(&self) -> Option<AclChain> {
        let first = self.allocate_acl()?;
        let mut blocks = VecDeque::with_capacity(self.shared.num_acl_bufs);
        blocks.push_back(first);
        Some(AclChain {
            pool: self.clone(),
            blocks,
            read_offset: 0,
        })
    }

    /// Return a buffer to its pool. Equivalent to dropping it.
    pub fn release(&self, buf: PacketBuffer) {
        debug_assert!(
            Arc::ptr_eq(&self.shared, &buf.pool),
            "buffer released to a foreign pool"
        );
        drop(buf);
    }

    pub fn free_count(&self, kind: BufferKind) -> usize {
        critical_section::with(|cs| {
            let lists = self.shared.lists.borrow_ref(cs);
            match kind {
                BufferKind::EventLow | BufferKind::EventHigh => lists.evt.len(),
                BufferKind::Command => usize::from(lists.cmd.is_some()),
                BufferKind::Acl => lists.acl.len(),
            }
        })
    }

    pub fn acl_free_count(&self) -> usize {
        self.free_count(BufferKind::Acl)
    }

    /// Install a callback run after every release
    pub fn set_release_hook<F>(&self, hook: F)
    where
        F: Fn(BufferKind) + Send + Sync + 'static,
    {
        critical_section::with(|cs| {
            *self.shared.release_hook.borrow_ref_mut(cs) = Some(Arc::new(hook));
        });
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("evt_free", &self.free_count(BufferKind::EventHigh))
            .field("cmd_free", &self.free_count(BufferKind::Command))
            .field("acl_free", &self.acl_free_count())
            .finish()
    }
}

/// A fixed-capacity block borrowed from a [`BufferPool`]
pub struct PacketBuffer {
    data: Option<Box<[u8]>>,
    len: usize,
    kind: BufferKind,
    pool: Arc<PoolShared>,
}

impl PacketBuffer {
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data[..self.len],
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.data {
            Some(data) => &mut data[..self.len],
            None => &mut [],
        }
    }

    pub fn push(&mut self, byte: u8) -> Result<(), HciError> {
        let capacity = self.capacity();
        match &mut self.data {
            Some(data) if self.len < capacity => {
                data[self.len] = byte;
                self.len += 1;
                Ok(())
            }
            _ => Err(HciError::BufferOverflow { capacity }),
        }
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), HciError> {
        let capacity = self.capacity();
        let end = self.len + bytes.len();
        match &mut self.data {
            Some(data) if end <= capacity => {
                data[self.len..end].copy_from_slice(bytes);
                self.len = end;
                Ok(())
            }
            _ => Err(HciError::BufferOverflow { capacity }),
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        if let Some(block) = self.data.take() {
            self.pool.give_back(self.kind, block);
        }
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("kind", &self.kind)
            .field("len", &self.len)
            .field("data", &hex::encode(self.as_slice()))
            .finish()
    }
}

/// ACL packet spread over a chain of pool blocks, read front to back
pub struct AclChain {
    pool: BufferPool,
    blocks: VecDeque<PacketBuffer>,
    read_offset: usize,
}

impl AclChain {
    /// Bytes not yet consumed by [`Self::pop_byte`]
    pub fn len(&self) -> usize {
        let stored: usize = self.blocks.iter().map(PacketBuffer::len).sum();
        stored - self.read_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Append a byte, taking another block from the pool when the tail is full
    pub fn push(&mut self, byte: u8) -> Result<(), HciError> {
        let tail_full = self.blocks.back().map_or(true, PacketBuffer::is_full);
        if tail_full {
            let block = self
                .pool
                .allocate_acl()
                .ok_or(HciError::PoolExhausted(BufferKind::Acl))?;
            self.blocks.push_back(block);
        }

        match self.blocks.back_mut() {
            Some(tail) => tail.push(byte),
            None => Err(HciError::PoolExhausted(BufferKind::Acl)),
        }
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), HciError> {
        bytes.iter().try_for_each(|&b| self.push(b))
    }

    /// Consume the next byte, releasing each block once it is exhausted
    pub fn pop_byte(&mut self) -> Option<u8> {
        loop {
            let front = self.blocks.front()?;
            if self.read_offset < front.len() {
                let byte = front.as_slice()[self.read_offset];
                self.read_offset += 1;
                if self.read_offset == front.len() {
                    self.blocks.pop_front();
                    self.read_offset = 0;
                }
                return Some(byte);
            }

            self.blocks.pop_front();
            self.read_offset = 0;
        }
    }

    /// Copy up to `out.len()` unread bytes without consuming them
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let mut copied = 0;
        let mut offset = self.read_offset;
        for block in &self.blocks {
            let avail = &block.as_slice()[offset..];
            let n = avail.len().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&avail[..n]);
            copied += n;
            offset = 0;
            if copied == out.len() {
                break;
            }
        }
        copied
    }

    /// Copy every unread byte into a vector
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len()];
        self.peek(&mut out);
        out
    }
}

impl fmt::Debug for AclChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AclChain")
            .field("blocks", &self.blocks.len())
            .field("len", &self.len())
            .finish()
    }
}
