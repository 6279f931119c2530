//! H4 receive and transmit state machines
//!
//! Both framers run in interrupt context: they never block and only touch
//! the shared pools and queue through critical sections.

use crate::config::RxOverflowPolicy;
use crate::error::HciError;
use crate::hci::constants::WIRE_LOG_SZ;
use crate::hci::packet::PacketType;
use crate::hci::pool::{AclChain, BufferKind, PacketBuffer};
use crate::hci::transport::{QueuedPacket, RxHandler, Shared, TransportStats};
use log::{trace, warn};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Returned by [`RxFramer::rx_byte`] when no buffer is free. The byte was
/// not consumed and must be offered again once the driver is restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stall;

impl fmt::Display for Stall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rx stalled waiting for a buffer")
    }
}

impl std::error::Error for Stall {}

/// Ring of the most recent bytes seen in one direction
pub struct WireLog {
    ring: Box<[u8]>,
    pos: usize,
    wrapped: bool,
}

impl WireLog {
    pub fn new() -> Self {
        Self {
            ring: vec![0u8; WIRE_LOG_SZ].into_boxed_slice(),
            pos: 0,
            wrapped: false,
        }
    }

    pub fn record(&mut self, byte: u8) {
        self.ring[self.pos] = byte;
        self.pos += 1;
        if self.pos == self.ring.len() {
            self.pos = 0;
            self.wrapped = true;
        }
    }

    /// Logged bytes, oldest first
    pub fn contents(&self) -> Vec<u8> {
        if self.wrapped {
            let mut out = self.ring[self.pos..].to_vec();
            out.extend_from_slice(&self.ring[..self.pos]);
            out
        } else {
            self.ring[..self.pos].to_vec()
        }
    }
}

impl Default for WireLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the bytes of the packet being received go
enum RxSink {
    Memblock(PacketBuffer),
    Acl(AclChain),
    /// Packet is consumed and thrown away
    Discard,
}

impl RxSink {
    fn push(&mut self, byte: u8) -> Result<(), HciError> {
        match self {
            RxSink::Memblock(buf) => buf.push(byte),
            RxSink::Acl(chain) => chain.push(byte),
            RxSink::Discard => Ok(()),
        }
    }

    /// Largest packet this sink can hold
    fn limit(&self, acl_limit: usize) -> usize {
        match self {
            RxSink::Memblock(buf) => buf.capacity(),
            RxSink::Acl(_) => acl_limit,
            RxSink::Discard => usize::MAX,
        }
    }
}

enum RxState {
    Idle,
    ReadingHeader {
        ptype: PacketType,
        sink: RxSink,
        header: [u8; 4],
        cur: usize,
    },
    ReadingBody {
        ptype: PacketType,
        sink: RxSink,
        cur: usize,
        total: usize,
    },
}

/// Receive-side H4 state machine
pub struct RxFramer {
    shared: Arc<Shared>,
    state: RxState,
    log: Option<WireLog>,
}

impl RxFramer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let log = shared.wire_log.then(WireLog::new);
        Self {
            shared,
            state: RxState::Idle,
            log,
        }
    }

    /// Whether the framer is between packets
    pub fn is_idle(&self) -> bool {
        matches!(self.state, RxState::Idle)
    }

    pub fn wire_log(&self) -> Option<&WireLog> {
        self.log.as_ref()
    }

    /// Feed one byte from the UART
    pub fn rx_byte<H: RxHandler>(&mut self, byte: u8, handler: &mut H) -> Result<(), Stall> {
        let state = std::mem::replace(&mut self.state, RxState::Idle);
        let (next, result) = match state {
            RxState::Idle => self.start_packet(byte),
            RxState::ReadingHeader {
                ptype,
                mut sink,
                mut header,
                cur,
            } => {
                if let Err(stall) = self.store(&mut sink, byte) {
                    let state = RxState::ReadingHeader { ptype, sink, header, cur };
                    (state, Err(stall))
                } else {
                    header[cur] = byte;
                    let cur = cur + 1;
                    if cur < ptype.header_len() {
                        (RxState::ReadingHeader { ptype, sink, header, cur }, Ok(()))
                    } else {
                        (self.header_done(ptype, sink, &header[..cur], handler), Ok(()))
                    }
                }
            }
            RxState::ReadingBody {
                ptype,
                mut sink,
                cur,
                total,
            } => match self.store(&mut sink, byte) {
                Err(stall) => (RxState::ReadingBody { ptype, sink, cur, total }, Err(stall)),
                Ok(()) => {
                    let cur = cur + 1;
                    if cur == total {
                        self.deliver(ptype, sink, handler);
                        (RxState::Idle, Ok(()))
                    } else {
                        (RxState::ReadingBody { ptype, sink, cur, total }, Ok(()))
                    }
                }
            },
        };

        self.state = next;
        if result.is_ok() {
            if let Some(log) = self.log.as_mut() {
                log.record(byte);
            }
        }
        result
    }

    fn start_packet(&mut self, byte: u8) -> (RxState, Result<(), Stall>) {
        let Some(ptype) = PacketType::from_u8(byte) else {
            warn!("rx: {}", HciError::InvalidPacketType(byte));
            TransportStats::bump(&self.shared.stats.rx_framing_errors);
            return (RxState::Idle, Ok(()));
        };

        if ptype == PacketType::Sco {
            TransportStats::bump(&self.shared.stats.rx_dropped);
        }
        let allocate = || match ptype {
            PacketType::Command | PacketType::Event => self
                .shared
                .pool
                .allocate(BufferKind::EventHigh)
                .map(RxSink::Memblock),
            PacketType::Acl => self.shared.pool.allocate_chain().map(RxSink::Acl),
            PacketType::Sco => Some(RxSink::Discard),
        };

        let sink = match allocate() {
            Some(sink) => sink,
            None => match self.shared.rx_overflow {
                RxOverflowPolicy::Stall => match self.stall(allocate) {
                    Ok(sink) => sink,
                    Err(stall) => return (RxState::Idle, Err(stall)),
                },
                RxOverflowPolicy::Drop => self.drop_packet(ptype),
            },
        };

        let state = RxState::ReadingHeader {
            ptype,
            sink,
            header: [0; 4],
            cur: 0,
        };
        (state, Ok(()))
    }

    /// Refuse the byte until a buffer comes back. The flag is raised before
    /// `retry` runs, so a release racing the failed allocation either
    /// satisfies the retry or sees the flag and restarts the driver.
    fn stall<T>(&self, retry: impl FnOnce() -> Option<T>) -> Result<T, Stall> {
        self.shared.rx_stalled.store(true, Ordering::SeqCst);
        match retry() {
            Some(value) => {
                self.shared.rx_stalled.store(false, Ordering::SeqCst);
                Ok(value)
            }
            None => {
                TransportStats::bump(&self.shared.stats.rx_stalls);
                Err(Stall)
            }
        }
    }

    fn drop_packet(&self, ptype: PacketType) -> RxSink {
        warn!("rx: no buffer for {} packet, dropping", ptype);
        TransportStats::bump(&self.shared.stats.rx_dropped);
        RxSink::Discard
    }

    /// Store a byte, growing an ACL chain if needed
    fn store(&self, sink: &mut RxSink, byte: u8) -> Result<(), Stall> {
        if sink.push(byte).is_ok() {
            return Ok(());
        }

        // Only an ACL chain can run out mid-packet; memblock sizes were
        // checked against the header.
        match self.shared.rx_overflow {
            RxOverflowPolicy::Stall => self.stall(|| sink.push(byte).ok()),
            RxOverflowPolicy::Drop => {
                *sink = self.drop_packet(PacketType::Acl);
                Ok(())
            }
        }
    }

    fn header_done<H: RxHandler>(
        &mut self,
        ptype: PacketType,
        sink: RxSink,
        header: &[u8],
        handler: &mut H,
    ) -> RxState {
        // header_len bytes are present, so the length always decodes
        let total = ptype.total_len(header).unwrap_or(header.len());

        let sink = if total > sink.limit(self.shared.acl_limit) {
            warn!("rx: {} packet of {} bytes does not fit, skipping", ptype, total);
            TransportStats::bump(&self.shared.stats.rx_framing_errors);
            RxSink::Discard
        } else {
            sink
        };

        if total == header.len() {
            self.deliver(ptype, sink, handler);
            return RxState::Idle;
        }

        RxState::ReadingBody {
            ptype,
            sink,
            cur: header.len(),
            total,
        }
    }

    fn deliver<H: RxHandler>(&mut self, ptype: PacketType, sink: RxSink, handler: &mut H) {
        let rejected = match sink {
            RxSink::Discard => return,
            RxSink::Memblock(buf) => {
                trace!("rx {} {}", ptype, hex::encode(buf.as_slice()));
                TransportStats::bump(&self.shared.stats.rx_packets);
                match ptype {
                    PacketType::Command => handler.on_command(buf),
                    _ => handler.on_event(buf),
                }
            }
            RxSink::Acl(chain) => {
                trace!("rx {} {} bytes", ptype, chain.len());
                TransportStats::bump(&self.shared.stats.rx_packets);
                handler.on_acl(chain);
                Ok(())
            }
        };

        if let Err(buf) = rejected {
            TransportStats::bump(&self.shared.stats.rx_unconsumed);
            self.shared.pool.release(buf);
        }
    }
}

enum TxState {
    Idle,
    Memblock { buf: PacketBuffer, cur: usize },
    Acl { chain: AclChain },
}

/// Transmit-side H4 state machine
pub struct TxFramer {
    shared: Arc<Shared>,
    state: TxState,
    log: Option<WireLog>,
}

impl TxFramer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let log = shared.wire_log.then(WireLog::new);
        Self {
            shared,
            state: TxState::Idle,
            log,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, TxState::Idle)
    }

    pub fn wire_log(&self) -> Option<&WireLog> {
        self.log.as_ref()
    }

    /// Next byte to put on the wire, or `None` when nothing is queued
    pub fn tx_byte(&mut self) -> Option<u8> {
        let byte = self.next_byte()?;
        if let Some(log) = self.log.as_mut() {
            log.record(byte);
        }
        Some(byte)
    }

    fn next_byte(&mut self) -> Option<u8> {
        loop {
            match std::mem::replace(&mut self.state, TxState::Idle) {
                TxState::Idle => {
                    let packet = self.shared.queue.pop()?;
                    let ptype = packet.packet_type();
                    self.state = match packet {
                        QueuedPacket::Command(buf) | QueuedPacket::Event(buf) => {
                            trace!("tx {} {}", ptype, hex::encode(buf.as_slice()));
                            TxState::Memblock { buf, cur: 0 }
                        }
                        QueuedPacket::Acl(chain) => {
                            trace!("tx ACL {} bytes", chain.len());
                            TxState::Acl { chain }
                        }
                    };
                    return Some(ptype.to_u8());
                }
                TxState::Memblock { buf, cur } => {
                    let Some(&byte) = buf.as_slice().get(cur) else {
                        continue;
                    };
                    let cur = cur + 1;
                    if cur == buf.len() {
                        TransportStats::bump(&self.shared.stats.tx_packets);
                        drop(buf);
                    } else {
                        self.state = TxState::Memblock { buf, cur };
                    }
                    return Some(byte);
                }
                TxState::Acl { mut chain } => {
                    let Some(byte) = chain.pop_byte() else {
                        continue;
                    };
                    if chain.is_empty() {
                        TransportStats::bump(&self.shared.stats.tx_packets);
                    } else {
                        self.state = TxState::Acl { chain };
                    }
                    return Some(byte);
                }
            }
        }
    }
}
