//! Example: starting LE legacy pairing over the H4 transport
//!
//! There is no controller attached here; the example starts pairing as
//! central on a pretend link and prints the H4 bytes the transport would
//! write to the UART.

use blehost::hci::DisconnectionComplete;
use blehost::smp::SecurityState;
use blehost::*;
use std::sync::Arc;

struct PrintingDriver;

impl UartDriver for PrintingDriver {
    fn start_tx(&self) {
        println!("driver: tx ready");
    }

    fn start_rx(&self) {
        println!("driver: rx resumed");
    }
}

/// A single connection we pretend is up
struct OneLink(ConnectionInfo);

impl ConnectionDirectory for OneLink {
    fn find_connection(&self, handle: u16) -> Option<ConnectionInfo> {
        (handle == self.0.handle).then_some(self.0)
    }
}

fn dump(tx: &mut TxFramer) {
    let bytes: Vec<u8> = std::iter::from_fn(|| tx.tx_byte()).collect();
    if !bytes.is_empty() {
        println!("uart <- {}", hex::encode(bytes));
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (uart, _rx, mut tx) = HciUart::new(TransportConfig::default(), Arc::new(PrintingDriver))?;

    let link = ConnectionInfo {
        handle: 0x0040,
        is_master: true,
        our_addr: BdAddr::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]),
        our_addr_type: AddressType::Public,
        peer_addr: BdAddr::new([0x11, 0x12, 0x13, 0x14, 0x15, 0xC6]),
        peer_addr_type: AddressType::Random,
    };

    let config = SmConfig {
        io_capability: IoCapability::KeyboardDisplay,
        bonding: true,
        mitm: true,
        our_key_dist: KeyDistribution::ENC_KEY | KeyDistribution::ID_KEY,
        their_key_dist: KeyDistribution::ENC_KEY | KeyDistribution::ID_KEY,
        ..Default::default()
    };

    let host = UartSmHost::new(uart, OneLink(link));
    let mut sm = SecurityManager::new(config, host, Box::new(MemoryKeyStore::new()))?;
    sm.set_event_callback(|event| {
        match event {
            SmEvent::PasskeyAction { conn_handle, action } => {
                println!("conn {:#06x}: user action {:?}", conn_handle, action)
            }
            SmEvent::EncryptionChanged {
                conn_handle,
                status,
                security: SecurityState { pair_alg, bonded, .. },
            } => println!(
                "conn {:#06x}: security procedure ended: {:?} ({}, bonded {})",
                conn_handle, status, pair_alg, bonded
            ),
            other => println!("{:?}", other),
        }
        Ok(())
    });

    println!("Starting pairing on conn {:#06x}", link.handle);
    sm.pair_initiate(link.handle)?;
    dump(&mut tx);

    // The peer never answers; the link drops instead
    let disconnect = HciEvent::parse(&[0x05, 0x04, 0x00, 0x40, 0x00, 0x13])
        .ok_or("bad disconnection event")?;
    if let Some(evt) = DisconnectionComplete::parse(&disconnect) {
        println!("disconnected, reason {:#04x}", evt.reason);
    }
    sm.handle_hci_event(&disconnect)?;
    println!("{} procedures left", sm.num_procs());

    Ok(())
}
