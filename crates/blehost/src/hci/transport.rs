//! HCI UART (H4) transport
//!
//! [`HciUart`] is the send side used by task code. Construction also yields
//! the two interrupt-side state machines, [`RxFramer`] and [`TxFramer`],
//! which the byte driver calls for every received byte and every byte it
//! wants to transmit.

use crate::config::{RxOverflowPolicy, TransportConfig};
use crate::error::HciError;
use crate::hci::framer::{RxFramer, TxFramer};
use crate::hci::packet::{HciCommand, PacketType};
use crate::hci::pool::{AclChain, BufferKind, BufferPool, PacketBuffer};
use critical_section::Mutex;
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Byte-level UART driver underneath the transport
pub trait UartDriver: Send + Sync {
    /// Bytes are waiting; start pulling them with [`TxFramer::tx_byte`]
    fn start_tx(&self);

    /// A buffer was released after the RX framer stalled; resume feeding it
    fn start_rx(&self);
}

/// Receiver of completed packets
pub trait RxHandler {
    /// A complete command arrived. Returning the buffer means it was not
    /// consumed; the framer releases it.
    fn on_command(&mut self, buf: PacketBuffer) -> Result<(), PacketBuffer>;

    /// A complete event arrived. Same ownership rules as `on_command`.
    fn on_event(&mut self, buf: PacketBuffer) -> Result<(), PacketBuffer>;

    /// A complete ACL packet arrived; the handler always takes the chain.
    fn on_acl(&mut self, chain: AclChain);
}

/// An outbound packet waiting for the TX framer
#[derive(Debug)]
pub enum QueuedPacket {
    Command(PacketBuffer),
    Event(PacketBuffer),
    Acl(AclChain),
}

impl QueuedPacket {
    pub fn packet_type(&self) -> PacketType {
        match self {
            QueuedPacket::Command(_) => PacketType::Command,
            QueuedPacket::Event(_) => PacketType::Event,
            QueuedPacket::Acl(_) => PacketType::Acl,
        }
    }
}

/// Bounded FIFO of packets awaiting transmission
pub struct TxQueue {
    packets: Mutex<RefCell<VecDeque<QueuedPacket>>>,
    capacity: usize,
}

impl TxQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: Mutex::new(RefCell::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append a packet; hands it back if the queue is full
    pub fn push(&self, packet: QueuedPacket) -> Result<(), QueuedPacket> {
        critical_section::with(|cs| {
            let mut packets = self.packets.borrow_ref_mut(cs);
            if packets.len() >= self.capacity {
                return Err(packet);
            }
            packets.push_back(packet);
            Ok(())
        })
    }

    pub fn pop(&self) -> Option<QueuedPacket> {
        critical_section::with(|cs| self.packets.borrow_ref_mut(cs).pop_front())
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.packets.borrow_ref(cs).len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Transport counters, updated lock-free from either context
#[derive(Debug, Default)]
pub struct TransportStats {
    pub rx_packets: AtomicU32,
    pub rx_framing_errors: AtomicU32,
    pub rx_dropped: AtomicU32,
    pub rx_stalls: AtomicU32,
    pub rx_unconsumed: AtomicU32,
    pub tx_packets: AtomicU32,
    pub tx_queue_full: AtomicU32,
}

/// Point-in-time copy of [`TransportStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx_packets: u32,
    pub rx_framing_errors: u32,
    pub rx_dropped: u32,
    pub rx_stalls: u32,
    pub rx_unconsumed: u32,
    pub tx_packets: u32,
    pub tx_queue_full: u32,
}

impl TransportStats {
    pub(crate) fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_framing_errors: self.rx_framing_errors.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            rx_stalls: self.rx_stalls.load(Ordering::Relaxed),
            rx_unconsumed: self.rx_unconsumed.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_queue_full: self.tx_queue_full.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the send side and both framers
pub(crate) struct Shared {
    pub(crate) pool: BufferPool,
    pub(crate) queue: TxQueue,
    pub(crate) stats: TransportStats,
    /// Set while the RX framer is waiting for a free buffer
    pub(crate) rx_stalled: AtomicBool,
    pub(crate) rx_overflow: RxOverflowPolicy,
    /// Largest ACL packet the pool could ever hold
    pub(crate) acl_limit: usize,
    pub(crate) wire_log: bool,
}

/// Send side of the H4 transport
pub struct HciUart {
    shared: Arc<Shared>,
    driver: Arc<dyn UartDriver>,
}

impl HciUart {
    /// Build the transport and its two framers
    pub fn new(
        config: TransportConfig,
        driver: Arc<dyn UartDriver>,
    ) -> Result<(Self, RxFramer, TxFramer), HciError> {
        config.validate()?;

        let pool = BufferPool::new(&config);
        let shared = Arc::new(Shared {
            pool: pool.clone(),
            queue: TxQueue::new(config.num_evt_bufs),
            stats: TransportStats::default(),
            rx_stalled: AtomicBool::new(false),
            rx_overflow: config.rx_overflow,
            acl_limit: config.num_acl_bufs * config.acl_buf_size,
            wire_log: config.wire_log,
        });

        // Wake a stalled receiver as soon as any buffer comes back. The hook
        // holds weak references so the pool does not keep the transport alive.
        let weak_shared = Arc::downgrade(&shared);
        let weak_driver = Arc::downgrade(&driver);
        pool.set_release_hook(move |kind| {
            let Some(shared) = weak_shared.upgrade() else {
                return;
            };
            if shared.rx_stalled.swap(false, Ordering::SeqCst) {
                debug!("{:?} buffer released, resuming rx", kind);
                if let Some(driver) = weak_driver.upgrade() {
                    driver.start_rx();
                }
            }
        });

        debug!(
            "H4 transport up: {} x {} event bufs, {} x {} ACL bufs, rx overflow {:?}",
            config.num_evt_bufs,
            config.evt_buf_size,
            config.num_acl_bufs,
            config.acl_buf_size,
            config.rx_overflow
        );

        let rx = RxFramer::new(Arc::clone(&shared));
        let tx = TxFramer::new(Arc::clone(&shared));
        Ok((Self { shared, driver }, rx, tx))
    }

    pub fn pool(&self) -> &BufferPool {
        &self.shared.pool
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Number of packets waiting for the TX framer
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Queue a command buffer (header included, no type byte)
    pub fn send_command(&self, buf: PacketBuffer) -> Result<(), HciError> {
        check_memblock(PacketType::Command, &buf)?;
        self.enqueue(QueuedPacket::Command(buf))
    }

    /// Queue an event buffer (header included, no type byte)
    pub fn send_event(&self, buf: PacketBuffer) -> Result<(), HciError> {
        check_memblock(PacketType::Event, &buf)?;
        self.enqueue(QueuedPacket::Event(buf))
    }

    /// Queue an ACL packet (4-byte header included)
    pub fn send_acl(&self, chain: AclChain) -> Result<(), HciError> {
        let mut header = [0u8; 4];
        if chain.peek(&mut header) < header.len()
            || PacketType::Acl.total_len(&header) != Some(chain.len())
        {
            return Err(HciError::InvalidPacketFormat);
        }
        self.enqueue(QueuedPacket::Acl(chain))
    }

    /// Serialize `cmd` into the host command buffer and queue it
    pub fn send_hci_command(&self, cmd: &HciCommand) -> Result<(), HciError> {
        let mut buf = self
            .shared
            .pool
            .allocate(BufferKind::Command)
            .ok_or(HciError::PoolExhausted(BufferKind::Command))?;
        buf.extend_from_slice(&cmd.to_bytes())?;
        self.send_command(buf)
    }

    fn enqueue(&self, packet: QueuedPacket) -> Result<(), HciError> {
        let ptype = packet.packet_type();
        if let Err(rejected) = self.shared.queue.push(packet) {
            warn!("tx queue full, dropping {} packet", ptype);
            TransportStats::bump(&self.shared.stats.tx_queue_full);
            drop(rejected);
            return Err(HciError::QueueFull);
        }

        self.driver.start_tx();
        Ok(())
    }
}

fn check_memblock(ptype: PacketType, buf: &PacketBuffer) -> Result<(), HciError> {
    match ptype.total_len(buf.as_slice()) {
        Some(total) if total == buf.len() => Ok(()),
        _ => Err(HciError::InvalidPacketFormat),
    }
}
