//! Write loop and controller buffer accounting

use super::transport::{PollFlags, Transport, TransportError};
use super::Outgoing;
use crate::l2cap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const CREDIT_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Credits {
    /// `None` until the controller reports its buffer count
    available: Option<u16>,
    max: u16,
}

/// State shared by the read and write loops
#[derive(Debug)]
pub(crate) struct Shared {
    acl_mtu: AtomicU16,
    credits: Mutex<Credits>,
    credit_ready: Condvar,
    running: AtomicBool,
}

impl Shared {
    pub(crate) fn new(acl_mtu: u16) -> Self {
        Self {
            acl_mtu: AtomicU16::new(acl_mtu),
            credits: Mutex::new(Credits::default()),
            credit_ready: Condvar::new(),
            running: AtomicBool::new(true),
        }
    }

    pub(crate) fn acl_mtu(&self) -> u16 {
        self.acl_mtu.load(Ordering::Acquire)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.credit_ready.notify_all();
    }

    /// Apply LE Read Buffer Size results; zero fields keep the current values
    pub(crate) fn set_buffer_size(&self, acl_data_len: u16, total_packets: u16) {
        if acl_data_len > 0 {
            self.acl_mtu.store(acl_data_len, Ordering::Release);
        }
        if total_packets > 0 {
            let mut credits = self.credits.lock();
            credits.available = Some(total_packets);
            credits.max = total_packets;
        }
        info!(
            "Controller buffers: acl_mtu={} packets={}",
            self.acl_mtu(),
            total_packets
        );
        self.credit_ready.notify_all();
    }

    /// Return credits for packets the controller finished with
    pub(crate) fn replenish(&self, count: u32) {
        let mut credits = self.credits.lock();
        let max = credits.max;
        if let Some(available) = credits.available.as_mut() {
            *available = (*available as u32 + count).min(max as u32) as u16;
        }
        drop(credits);
        self.credit_ready.notify_all();
    }

    /// The controller drops queued packets of a closed link
    pub(crate) fn restore_credits(&self) {
        let mut credits = self.credits.lock();
        if credits.available.is_some() {
            credits.available = Some(credits.max);
        }
        drop(credits);
        self.credit_ready.notify_all();
    }

    pub(crate) fn available_credits(&self) -> Option<u16> {
        self.credits.lock().available
    }

    /// Wait for one ACL credit; false once the host stops
    pub(crate) fn acquire_credit(&self) -> bool {
        let mut credits = self.credits.lock();
        loop {
            if !self.is_running() {
                return false;
            }
            match credits.available.as_mut() {
                None => return true,
                Some(n) if *n > 0 => {
                    *n -= 1;
                    return true;
                }
                Some(_) => {
                    self.credit_ready.wait_for(&mut credits, CREDIT_WAIT);
                }
            }
        }
    }
}

/// Write `bytes` completely, polling for writability before each attempt
pub(crate) fn write_all(
    transport: &dyn Transport,
    mut bytes: &[u8],
    shared: &Shared,
    timeout_ms: i32,
) -> Result<(), TransportError> {
    while !bytes.is_empty() {
        if !shared.is_running() {
            return Err(TransportError::Closed);
        }
        if !transport.poll(PollFlags::WRITABLE, timeout_ms).writable {
            continue;
        }
        match transport.write(bytes) {
            Ok(n) => bytes = &bytes[n.min(bytes.len())..],
            Err(TransportError::WouldBlock) => continue,
            Err(TransportError::Closed) => return Err(TransportError::Closed),
            Err(e) => warn!("Transport write failed, retrying: {}", e),
        }
    }
    Ok(())
}

fn write_acl(transport: &dyn Transport, packet: &[u8], shared: &Shared, timeout_ms: i32) -> Result<(), TransportError> {
    if !shared.acquire_credit() {
        return Err(TransportError::Closed);
    }
    write_all(transport, packet, shared, timeout_ms)
}

fn send_sdu(
    transport: &dyn Transport,
    conn_handle: u16,
    cid: u16,
    payload: &[u8],
    shared: &Shared,
    timeout_ms: i32,
) -> Result<(), TransportError> {
    let fragments = match l2cap::fragment(payload, cid, conn_handle, shared.acl_mtu()) {
        Ok(fragments) => fragments,
        Err(e) => {
            warn!("Dropping outgoing SDU: {}", e);
            return Ok(());
        }
    };
    debug!(
        "Sending SDU: handle={:#06x} cid={:#06x} len={} fragments={}",
        conn_handle,
        cid,
        payload.len(),
        fragments.len()
    );
    for packet in fragments {
        write_acl(transport, &packet, shared, timeout_ms)?;
    }
    Ok(())
}

/// Drain the outbound queue into the transport, strictly FIFO
pub(crate) fn run_write_loop(
    transport: Arc<dyn Transport>,
    mut outbound: mpsc::Receiver<Outgoing>,
    shared: Arc<Shared>,
    timeout_ms: i32,
) {
    info!("Host write loop started");
    while let Some(item) = outbound.blocking_recv() {
        let result = match item {
            Outgoing::Packet(packet) if packet.is_acl_data() => {
                write_acl(transport.as_ref(), packet.as_bytes(), &shared, timeout_ms)
            }
            Outgoing::Packet(packet) => {
                if !packet.is_command() {
                    warn!("Writing packet with unexpected indicator {:#04x?}", packet.as_bytes().first());
                }
                write_all(transport.as_ref(), packet.as_bytes(), &shared, timeout_ms)
            }
            Outgoing::Sdu {
                conn_handle,
                cid,
                payload,
            } => send_sdu(transport.as_ref(), conn_handle, cid, &payload, &shared, timeout_ms),
        };
        match result {
            Ok(()) => {}
            Err(TransportError::Closed) => {
                info!("Transport closed, write loop exiting");
                break;
            }
            Err(e) => warn!("Dropping outgoing item: {}", e),
        }
    }
    shared.stop();
    info!("Host write loop stopped");
}
