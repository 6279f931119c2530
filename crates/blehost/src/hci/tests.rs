//! Unit tests for HCI packets and the H4 transport

use super::constants::*;
use super::*;
use crate::config::{RxOverflowPolicy, TransportConfig};
use crate::error::HciError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct MockDriver {
    tx_starts: AtomicUsize,
    rx_starts: AtomicUsize,
}

impl MockDriver {
    fn tx_starts(&self) -> usize {
        self.tx_starts.load(Ordering::SeqCst)
    }

    fn rx_starts(&self) -> usize {
        self.rx_starts.load(Ordering::SeqCst)
    }
}

impl UartDriver for MockDriver {
    fn start_tx(&self) {
        self.tx_starts.fetch_add(1, Ordering::SeqCst);
    }

    fn start_rx(&self) {
        self.rx_starts.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Collector {
    commands: Vec<Vec<u8>>,
    events: Vec<Vec<u8>>,
    acl: Vec<Vec<u8>>,
    held: Vec<PacketBuffer>,
    held_acl: Vec<AclChain>,
    hold: bool,
    reject: bool,
}

impl Collector {
    fn take(&mut self, buf: PacketBuffer) -> Result<(), PacketBuffer> {
        if self.reject {
            return Err(buf);
        }
        if self.hold {
            self.held.push(buf);
        }
        Ok(())
    }
}

impl RxHandler for Collector {
    fn on_command(&mut self, buf: PacketBuffer) -> Result<(), PacketBuffer> {
        self.commands.push(buf.as_slice().to_vec());
        self.take(buf)
    }

    fn on_event(&mut self, buf: PacketBuffer) -> Result<(), PacketBuffer> {
        self.events.push(buf.as_slice().to_vec());
        self.take(buf)
    }

    fn on_acl(&mut self, chain: AclChain) {
        self.acl.push(chain.to_vec());
        if self.hold {
            self.held_acl.push(chain);
        }
    }
}

fn transport(config: TransportConfig) -> (Arc<MockDriver>, HciUart, RxFramer, TxFramer) {
    let driver = Arc::new(MockDriver::default());
    let (uart, rx, tx) = HciUart::new(config, driver.clone()).unwrap();
    (driver, uart, rx, tx)
}

fn event_buf(uart: &HciUart, bytes: &[u8]) -> PacketBuffer {
    let mut buf = uart.pool().allocate(BufferKind::EventHigh).unwrap();
    buf.extend_from_slice(bytes).unwrap();
    buf
}

fn drain(tx: &mut TxFramer) -> Vec<u8> {
    std::iter::from_fn(|| tx.tx_byte()).collect()
}

fn feed(rx: &mut RxFramer, bytes: &[u8], handler: &mut Collector) {
    for &b in bytes {
        rx.rx_byte(b, handler).unwrap();
    }
}

#[test]
fn test_hci_command_serialization() {
    let command = HciCommand::LeStartEncryption {
        handle: 0x0040,
        random_number: 0x0102030405060708,
        encrypted_diversifier: 0xBEEF,
        long_term_key: [0xAA; 16],
    };
    let packet = command.to_packet();

    assert_eq!(packet[0], HCI_COMMAND_PKT);
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x2019);
    assert_eq!(packet[3], 28);
    assert_eq!(&packet[4..6], &[0x40, 0x00]);
    assert_eq!(&packet[6..14], &[8, 7, 6, 5, 4, 3, 2, 1]);
    assert_eq!(&packet[14..16], &[0xEF, 0xBE]);
    assert_eq!(&packet[16..], &[0xAA; 16]);

    let command = HciCommand::Disconnect {
        handle: 0x0040,
        reason: 0x13,
    };
    assert_eq!(command.opcode(), 0x0406);
    assert_eq!(command.to_packet(), vec![0x01, 0x06, 0x04, 0x03, 0x40, 0x00, 0x13]);

    let command = HciCommand::LeLtkRequestNegativeReply { handle: 0x0001 };
    assert_eq!(command.to_bytes(), vec![0x1B, 0x20, 0x02, 0x01, 0x00]);
}

#[test]
fn test_header_lengths() {
    assert_eq!(PacketType::Command.total_len(&[0x03, 0x0C, 0x00]), Some(3));
    assert_eq!(PacketType::Event.total_len(&[0x0E, 0x04]), Some(6));
    assert_eq!(PacketType::Acl.total_len(&[0x40, 0x20, 0x10, 0x01]), Some(4 + 0x110));
    assert_eq!(PacketType::Sco.total_len(&[0x40, 0x00, 0x30]), Some(3 + 0x30));
    assert_eq!(PacketType::Acl.total_len(&[0x40, 0x20]), None);
    assert_eq!(PacketType::from_u8(0x05), None);
}

#[test]
fn test_hci_event_parsing() {
    let event = HciEvent::parse(&[EVT_ENCRYPTION_CHANGE, 4, 0x00, 0x40, 0x00, 0x01]).unwrap();
    let change = EncryptionChange::parse(&event).unwrap();
    assert_eq!(change.status, 0);
    assert_eq!(change.connection_handle, 0x0040);
    assert_eq!(change.encryption_enabled, 1);

    let mut raw = vec![EVT_LE_META_EVENT, 13, EVT_LE_LT_KEY_REQ, 0x02, 0x00];
    raw.extend_from_slice(&0x1122334455667788u64.to_le_bytes());
    raw.extend_from_slice(&0x4321u16.to_le_bytes());
    let event = HciEvent::parse(&raw).unwrap();
    let req = LtkRequest::parse(&event).unwrap();
    assert_eq!(req.connection_handle, 2);
    assert_eq!(req.random_number, 0x1122334455667788);
    assert_eq!(req.encrypted_diversifier, 0x4321);
    assert!(EncryptionChange::parse(&event).is_none());

    let event = HciEvent::parse(&[EVT_DISCONN_COMPLETE, 4, 0x00, 0x03, 0x00, 0x13]).unwrap();
    let disc = DisconnectionComplete::parse(&event).unwrap();
    assert_eq!(disc.connection_handle, 3);
    assert_eq!(disc.reason, 0x13);

    // Truncated parameters
    assert!(HciEvent::parse(&[EVT_ENCRYPTION_CHANGE, 4, 0x00]).is_none());
}

#[test]
fn test_command_round_trip() {
    let (driver, uart, _rx, mut tx) = transport(TransportConfig::default());
    let command = HciCommand::LeLtkRequestReply {
        handle: 0x0040,
        long_term_key: [0x5A; 16],
    };

    uart.send_hci_command(&command).unwrap();
    assert_eq!(driver.tx_starts(), 1);
    assert_eq!(uart.pool().free_count(BufferKind::Command), 0);
    assert_eq!(
        uart.send_hci_command(&command),
        Err(HciError::PoolExhausted(BufferKind::Command))
    );

    let wire = drain(&mut tx);
    assert_eq!(wire, command.to_packet());
    assert!(tx.is_idle());
    assert_eq!(uart.pool().free_count(BufferKind::Command), 1);
    assert_eq!(uart.stats().tx_packets, 1);

    let (_, peer, mut rx, _) = transport(TransportConfig::default());
    let mut handler = Collector::default();
    feed(&mut rx, &wire, &mut handler);

    assert_eq!(handler.commands, vec![command.to_bytes()]);
    assert!(rx.is_idle());
    assert_eq!(peer.stats().rx_packets, 1);
    assert_eq!(peer.pool().free_count(BufferKind::EventHigh), DEFAULT_NUM_EVT_BUFS);
}

#[test]
fn test_acl_round_trip_across_blocks() {
    let config = TransportConfig {
        acl_buf_size: 8,
        ..Default::default()
    };
    let (_, uart, _, mut tx) = transport(config.clone());
    let payload: Vec<u8> = (0..20).collect();

    let mut chain = uart.pool().allocate_chain().unwrap();
    chain.extend_from_slice(&[0x40, 0x00, 20, 0x00]).unwrap();
    chain.extend_from_slice(&payload).unwrap();
    assert_eq!(chain.block_count(), 3);
    uart.send_acl(chain).unwrap();

    let wire = drain(&mut tx);
    assert_eq!(wire.len(), 1 + 4 + 20);
    assert_eq!(wire[0], HCI_ACL_PKT);
    assert_eq!(uart.pool().acl_free_count(), DEFAULT_NUM_ACL_BUFS);

    let (_, peer, mut rx, _) = transport(config);
    let mut handler = Collector::default();
    feed(&mut rx, &wire, &mut handler);

    assert_eq!(handler.acl.len(), 1);
    assert_eq!(handler.acl[0], wire[1..].to_vec());
    assert_eq!(peer.pool().acl_free_count(), DEFAULT_NUM_ACL_BUFS);
}

#[test]
fn test_tx_queue_is_fifo() {
    let (_, uart, _, mut tx) = transport(TransportConfig::default());

    uart.send_event(event_buf(&uart, &[0x0E, 0x01, 0xA1])).unwrap();
    uart.send_hci_command(&HciCommand::LeLtkRequestNegativeReply { handle: 1 })
        .unwrap();
    uart.send_event(event_buf(&uart, &[0x0F, 0x00])).unwrap();
    assert_eq!(uart.pending(), 3);

    let wire = drain(&mut tx);
    assert_eq!(
        wire,
        vec![
            0x04, 0x0E, 0x01, 0xA1, // first event
            0x01, 0x1B, 0x20, 0x02, 0x01, 0x00, // command
            0x04, 0x0F, 0x00, // second event
        ]
    );
    assert_eq!(uart.pending(), 0);
    assert_eq!(uart.stats().tx_packets, 3);
    assert_eq!(uart.pool().free_count(BufferKind::EventHigh), DEFAULT_NUM_EVT_BUFS);
}

#[test]
fn test_queue_full_releases_buffer() {
    let config = TransportConfig {
        num_evt_bufs: 2,
        ..Default::default()
    };
    let (driver, uart, _, _) = transport(config);

    for _ in 0..2 {
        let mut chain = uart.pool().allocate_chain().unwrap();
        chain.extend_from_slice(&[0x01, 0x00, 0x01, 0x00, 0xFF]).unwrap();
        uart.send_acl(chain).unwrap();
    }

    let mut chain = uart.pool().allocate_chain().unwrap();
    chain.extend_from_slice(&[0x01, 0x00, 0x01, 0x00, 0xFF]).unwrap();
    assert_eq!(uart.send_acl(chain), Err(HciError::QueueFull));

    assert_eq!(uart.stats().tx_queue_full, 1);
    assert_eq!(uart.pool().acl_free_count(), DEFAULT_NUM_ACL_BUFS - 2);
    assert_eq!(driver.tx_starts(), 2);
}

#[test]
fn test_send_rejects_bad_length() {
    let (_, uart, _, _) = transport(TransportConfig::default());

    // Declares 3 parameter bytes but carries 1
    let buf = event_buf(&uart, &[0x0E, 0x03, 0x01]);
    assert_eq!(uart.send_event(buf), Err(HciError::InvalidPacketFormat));
    assert_eq!(uart.pending(), 0);
    assert_eq!(uart.pool().free_count(BufferKind::EventHigh), DEFAULT_NUM_EVT_BUFS);
}

#[test]
fn test_unconsumed_event_is_released() {
    let (_, uart, mut rx, _) = transport(TransportConfig::default());
    let mut handler = Collector {
        reject: true,
        ..Default::default()
    };

    feed(&mut rx, &[0x04, 0x0E, 0x02, 0x01, 0x02], &mut handler);

    assert_eq!(handler.events, vec![vec![0x0E, 0x02, 0x01, 0x02]]);
    assert_eq!(uart.stats().rx_unconsumed, 1);
    assert_eq!(uart.pool().free_count(BufferKind::EventHigh), DEFAULT_NUM_EVT_BUFS);
}

#[test]
fn test_bad_packet_type_is_skipped() {
    let (_, uart, mut rx, _) = transport(TransportConfig::default());
    let mut handler = Collector::default();

    feed(&mut rx, &[0x07, 0x04, 0x0F, 0x00], &mut handler);

    assert_eq!(uart.stats().rx_framing_errors, 1);
    assert_eq!(handler.events, vec![vec![0x0F, 0x00]]);
}

#[test]
fn test_sco_is_dropped() {
    let (_, uart, mut rx, _) = transport(TransportConfig::default());
    let mut handler = Collector::default();

    feed(
        &mut rx,
        &[0x03, 0x01, 0x00, 0x02, 0xAA, 0xBB, 0x04, 0x0F, 0x00],
        &mut handler,
    );

    assert_eq!(uart.stats().rx_dropped, 1);
    assert_eq!(handler.events.len(), 1);
    assert!(rx.is_idle());
}

#[test]
fn test_oversized_acl_is_skipped() {
    let config = TransportConfig {
        num_acl_bufs: 2,
        acl_buf_size: 8,
        ..Default::default()
    };
    let (_, uart, mut rx, _) = transport(config);
    let mut handler = Collector::default();

    let mut wire = vec![0x02, 0x01, 0x00, 20, 0x00];
    wire.extend_from_slice(&[0u8; 20]);
    feed(&mut rx, &wire, &mut handler);

    assert!(handler.acl.is_empty());
    assert!(rx.is_idle());
    assert_eq!(uart.stats().rx_framing_errors, 1);
    assert_eq!(uart.pool().acl_free_count(), 2);
}

#[test]
fn test_rx_stalls_until_buffer_released() {
    let config = TransportConfig {
        num_evt_bufs: 1,
        ..Default::default()
    };
    let (driver, uart, mut rx, _) = transport(config);
    let mut handler = Collector {
        hold: true,
        ..Default::default()
    };

    feed(&mut rx, &[0x04, 0x0E, 0x01, 0x00], &mut handler);
    assert_eq!(handler.held.len(), 1);

    assert_eq!(rx.rx_byte(0x04, &mut handler), Err(Stall));
    assert_eq!(uart.stats().rx_stalls, 1);
    assert_eq!(driver.rx_starts(), 0);

    handler.held.clear();
    assert_eq!(driver.rx_starts(), 1);

    feed(&mut rx, &[0x04, 0x0F, 0x00], &mut handler);
    assert_eq!(handler.events.len(), 2);
}

#[test]
fn test_release_racing_stall_restarts_rx() {
    let config = TransportConfig {
        num_evt_bufs: 1,
        ..Default::default()
    };
    let (driver, uart, mut rx, _) = transport(config);
    let mut handler = Collector::default();

    for _ in 0..2000 {
        let held = uart.pool().allocate(BufferKind::EventHigh).unwrap();
        let starts = driver.rx_starts();

        let releaser = std::thread::spawn(move || drop(held));
        let result = rx.rx_byte(0x04, &mut handler);
        releaser.join().unwrap();

        if result.is_err() {
            // A refused byte must always be followed by a restart
            assert!(driver.rx_starts() > starts);
            rx.rx_byte(0x04, &mut handler).unwrap();
        }
        feed(&mut rx, &[0x0F, 0x00], &mut handler);
    }

    assert_eq!(handler.events.len(), 2000);
    assert_eq!(uart.pool().free_count(BufferKind::EventHigh), 1);
}

fn acl_chain_config(rx_overflow: RxOverflowPolicy) -> TransportConfig {
    TransportConfig {
        num_acl_bufs: 2,
        acl_buf_size: 8,
        rx_overflow,
        ..Default::default()
    }
}

const SHORT_ACL: [u8; 9] = [0x02, 0x01, 0x00, 0x04, 0x00, 1, 2, 3, 4];
const LONG_ACL: [u8; 13] = [0x02, 0x01, 0x00, 0x08, 0x00, 1, 2, 3, 4, 5, 6, 7, 8];

#[test]
fn test_acl_chain_stalls_mid_packet() {
    let (driver, uart, mut rx, _) = transport(acl_chain_config(RxOverflowPolicy::Stall));
    let mut handler = Collector {
        hold: true,
        ..Default::default()
    };

    feed(&mut rx, &SHORT_ACL, &mut handler);
    assert_eq!(handler.held_acl.len(), 1);

    // The first block holds the header and four payload bytes
    feed(&mut rx, &LONG_ACL[..9], &mut handler);
    assert_eq!(uart.pool().acl_free_count(), 0);
    assert_eq!(rx.rx_byte(LONG_ACL[9], &mut handler), Err(Stall));
    assert!(!rx.is_idle());
    assert_eq!(uart.stats().rx_stalls, 1);
    assert_eq!(driver.rx_starts(), 0);

    handler.held_acl.clear();
    assert_eq!(driver.rx_starts(), 1);

    feed(&mut rx, &LONG_ACL[9..], &mut handler);
    assert!(rx.is_idle());
    assert_eq!(handler.acl.len(), 2);
    assert_eq!(handler.acl[1], &LONG_ACL[1..]);
    assert_eq!(uart.stats().rx_dropped, 0);
}

#[test]
fn test_acl_chain_dropped_mid_packet() {
    let (driver, uart, mut rx, _) = transport(acl_chain_config(RxOverflowPolicy::Drop));
    let mut handler = Collector {
        hold: true,
        ..Default::default()
    };

    feed(&mut rx, &SHORT_ACL, &mut handler);
    feed(&mut rx, &LONG_ACL, &mut handler);

    assert!(rx.is_idle());
    assert_eq!(handler.acl.len(), 1);
    assert_eq!(uart.stats().rx_dropped, 1);
    assert_eq!(uart.stats().rx_stalls, 0);
    assert_eq!(uart.pool().acl_free_count(), 1);

    feed(&mut rx, &SHORT_ACL, &mut handler);
    assert_eq!(handler.acl.len(), 2);
    assert_eq!(handler.acl[1], &SHORT_ACL[1..]);
    assert_eq!(driver.rx_starts(), 0);
}

#[test]
fn test_rx_drop_policy_discards_packet() {
    let config = TransportConfig {
        num_evt_bufs: 1,
        rx_overflow: RxOverflowPolicy::Drop,
        ..Default::default()
    };
    let (driver, uart, mut rx, _) = transport(config);
    let mut handler = Collector {
        hold: true,
        ..Default::default()
    };

    feed(&mut rx, &[0x04, 0x0E, 0x01, 0x00], &mut handler);
    feed(&mut rx, &[0x04, 0x0F, 0x02, 0x11, 0x22], &mut handler);

    assert_eq!(handler.events.len(), 1);
    assert_eq!(uart.stats().rx_dropped, 1);
    assert!(rx.is_idle());

    handler.held.clear();
    assert_eq!(driver.rx_starts(), 0);
    feed(&mut rx, &[0x04, 0x0F, 0x00], &mut handler);
    assert_eq!(handler.events.len(), 2);
}

#[test]
fn test_wire_logs() {
    let config = TransportConfig {
        wire_log: true,
        ..Default::default()
    };
    let (_, uart, mut rx, mut tx) = transport(config);

    uart.send_event(event_buf(&uart, &[0x0E, 0x01, 0x42])).unwrap();
    let wire = drain(&mut tx);
    assert_eq!(tx.wire_log().unwrap().contents(), wire);

    let mut handler = Collector::default();
    feed(&mut rx, &wire, &mut handler);
    assert_eq!(rx.wire_log().unwrap().contents(), wire);

    let mut log = WireLog::new();
    for i in 0..(WIRE_LOG_SZ + 6) {
        log.record(i as u8);
    }
    let contents = log.contents();
    assert_eq!(contents.len(), WIRE_LOG_SZ);
    assert_eq!(contents[0], 6);
}
