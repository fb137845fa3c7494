//! In-process transport
//!
//! [`MemoryTransport`] is the host side; [`ControllerEnd`] plays the
//! controller, injecting packets and capturing what the host writes. Each
//! injected packet is delivered by one `read`.

use super::transport::{PollFlags, Transport, TransportError};
use crate::hci::acl::{self, PacketBoundary};
use crate::hci::EVENT_INDICATOR;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Queue {
    packets: VecDeque<Vec<u8>>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Link {
    to_host: Mutex<Queue>,
    to_host_ready: Condvar,
    from_host: Mutex<Queue>,
    from_host_ready: Condvar,
}

// Block on `cv` until `ready` holds or the timeout passes; -1 waits forever
fn wait_until(
    queue: &Mutex<Queue>,
    cv: &Condvar,
    timeout_ms: i32,
    ready: impl Fn(&Queue) -> bool,
) -> bool {
    let mut guard = queue.lock();
    if timeout_ms < 0 {
        while !ready(&guard) {
            cv.wait(&mut guard);
        }
        return true;
    }
    let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
    while !ready(&guard) {
        if cv.wait_until(&mut guard, deadline).timed_out() {
            return ready(&guard);
        }
    }
    true
}

/// Host side of an in-memory controller link
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    link: Arc<Link>,
}

/// Controller side of an in-memory link
#[derive(Debug, Clone)]
pub struct ControllerEnd {
    link: Arc<Link>,
}

impl MemoryTransport {
    /// Create a connected transport / controller pair
    pub fn pair() -> (MemoryTransport, ControllerEnd) {
        let link = Arc::new(Link::default());
        (
            MemoryTransport { link: link.clone() },
            ControllerEnd { link },
        )
    }

    /// Close both directions
    pub fn close(&self) {
        close_link(&self.link);
    }
}

fn close_link(link: &Link) {
    link.to_host.lock().closed = true;
    link.to_host_ready.notify_all();
    link.from_host.lock().closed = true;
    link.from_host_ready.notify_all();
}

impl Transport for MemoryTransport {
    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut queue = self.link.to_host.lock();
        let Some(mut packet) = queue.packets.pop_front() else {
            return Err(if queue.closed {
                TransportError::Closed
            } else {
                TransportError::WouldBlock
            });
        };
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        if n < packet.len() {
            // Keep the rest for the next read
            queue.packets.push_front(packet.split_off(n));
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, TransportError> {
        let mut queue = self.link.from_host.lock();
        if queue.closed {
            return Err(TransportError::Closed);
        }
        queue.packets.push_back(buf.to_vec());
        drop(queue);
        self.link.from_host_ready.notify_all();
        Ok(buf.len())
    }

    fn poll(&self, flags: PollFlags, timeout_ms: i32) -> PollFlags {
        let mut ready = PollFlags::NONE;
        if flags.writable {
            ready.writable = true;
        }
        if flags.readable {
            // Closed counts as readable so the next read reports it
            let timeout = if ready.writable { 0 } else { timeout_ms };
            ready.readable = wait_until(&self.link.to_host, &self.link.to_host_ready, timeout, |q| {
                !q.packets.is_empty() || q.closed
            });
        }
        ready
    }
}

impl ControllerEnd {
    /// Queue a raw packet (indicator included) for the host
    pub fn inject(&self, packet: &[u8]) {
        self.link.to_host.lock().packets.push_back(packet.to_vec());
        self.link.to_host_ready.notify_all();
    }

    /// Queue an HCI event built from its code and parameters
    pub fn inject_event(&self, code: u8, params: &[u8]) {
        let mut packet = Vec::with_capacity(3 + params.len());
        packet.push(EVENT_INDICATOR);
        packet.push(code);
        packet.push(params.len() as u8);
        packet.extend_from_slice(params);
        self.inject(&packet);
    }

    /// Queue one ACL packet
    pub fn inject_acl(&self, conn_handle: u16, pb_flag: PacketBoundary, payload: &[u8]) {
        let mut packet = acl::header_bytes(conn_handle, pb_flag, payload.len() as u16).to_vec();
        packet.extend_from_slice(payload);
        self.inject(&packet);
    }

    /// Take everything the host has written so far
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.link.from_host.lock().packets.drain(..).collect()
    }

    /// Wait up to `timeout` for the next packet written by the host
    pub fn wait_written(&self, timeout: Duration) -> Option<Vec<u8>> {
        let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        wait_until(&self.link.from_host, &self.link.from_host_ready, ms, |q| {
            !q.packets.is_empty() || q.closed
        });
        self.link.from_host.lock().packets.pop_front()
    }

    /// Close the link; the host read loop ends on its next read
    pub fn close(&self) {
        close_link(&self.link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_per_read() {
        let (host, controller) = MemoryTransport::pair();
        controller.inject_event(0x0E, &[0x01, 0x03, 0x0C, 0x00]);
        assert!(host.poll(PollFlags::READABLE, 0).readable);

        let mut buf = [0u8; 64];
        let n = host.read(&mut buf).expect("Read");
        assert_eq!(&buf[..n], &[0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]);
        assert_eq!(host.read(&mut buf), Err(TransportError::WouldBlock));
    }

    #[test]
    fn test_short_read_keeps_remainder() {
        let (host, controller) = MemoryTransport::pair();
        controller.inject(&[1, 2, 3, 4, 5]);
        let mut buf = [0u8; 3];
        assert_eq!(host.read(&mut buf), Ok(3));
        assert_eq!(host.read(&mut buf), Ok(2));
        assert_eq!(&buf[..2], &[4, 5]);
    }

    #[test]
    fn test_poll_times_out() {
        let (host, _controller) = MemoryTransport::pair();
        let start = Instant::now();
        assert!(!host.poll(PollFlags::READABLE, 20).readable);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_writes_are_captured() {
        let (host, controller) = MemoryTransport::pair();
        assert_eq!(host.write(&[0x01, 0x03, 0x0C, 0x00]), Ok(4));
        assert_eq!(
            controller.wait_written(Duration::from_millis(10)),
            Some(vec![0x01, 0x03, 0x0C, 0x00])
        );
        assert!(controller.written().is_empty());
    }

    #[test]
    fn test_close_wakes_reader() {
        let (host, controller) = MemoryTransport::pair();
        let waiter = {
            let host = host.clone();
            std::thread::spawn(move || host.poll(PollFlags::READABLE, -1))
        };
        controller.close();
        assert!(waiter.join().expect("Poll thread").readable);
        let mut buf = [0u8; 4];
        assert_eq!(host.read(&mut buf), Err(TransportError::Closed));
        assert_eq!(host.write(&[1]), Err(TransportError::Closed));
    }
}
