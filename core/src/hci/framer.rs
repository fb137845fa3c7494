//! H4 packet framing for byte-stream transports
//!
//! UART-style transports hand the host an unframed stream in which packets
//! may be split across reads or several packets may arrive in one read.
//! `PacketFramer` buffers those bytes and yields whole indicator-prefixed
//! packets. Transports that already deliver one packet per read pass through
//! unchanged.

use super::acl::{ACL_HEADER_LEN, ACL_INDICATOR};
use super::event::{EVENT_HEADER_LEN, EVENT_INDICATOR};
use tracing::warn;

#[derive(Debug, Default)]
pub struct PacketFramer {
    buf: Vec<u8>,
}

impl PacketFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held while waiting for the rest of a packet
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pop the next complete packet, indicator included
    pub fn next_packet(&mut self) -> Option<Vec<u8>> {
        loop {
            let indicator = *self.buf.first()?;
            let total = match indicator {
                EVENT_INDICATOR => {
                    let len = *self.buf.get(EVENT_HEADER_LEN)? as usize;
                    1 + EVENT_HEADER_LEN + len
                }
                ACL_INDICATOR => {
                    if self.buf.len() < 1 + ACL_HEADER_LEN {
                        return None;
                    }
                    let len = u16::from_le_bytes([self.buf[3], self.buf[4]]) as usize;
                    1 + ACL_HEADER_LEN + len
                }
                other => {
                    // Resync one byte at a time
                    warn!("Dropping byte with unknown HCI indicator {:#04x}", other);
                    self.buf.remove(0);
                    continue;
                }
            };
            if self.buf.len() < total {
                return None;
            }
            let rest = self.buf.split_off(total);
            return Some(std::mem::replace(&mut self.buf, rest));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event_passes_through() {
        let mut framer = PacketFramer::new();
        framer.push(&[0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]);
        assert_eq!(
            framer.next_packet(),
            Some(vec![0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00])
        );
        assert!(framer.next_packet().is_none());
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_packet_split_across_reads() {
        let mut framer = PacketFramer::new();
        framer.push(&[0x02, 0x40, 0x20]);
        assert!(framer.next_packet().is_none());
        framer.push(&[0x02, 0x00, 0xAA]);
        assert!(framer.next_packet().is_none());
        framer.push(&[0xBB]);
        assert_eq!(
            framer.next_packet(),
            Some(vec![0x02, 0x40, 0x20, 0x02, 0x00, 0xAA, 0xBB])
        );
    }

    #[test]
    fn test_two_packets_in_one_read() {
        let mut framer = PacketFramer::new();
        framer.push(&[0x04, 0x10, 0x01, 0x03, 0x02, 0x01, 0x20, 0x00, 0x00]);
        assert_eq!(framer.next_packet(), Some(vec![0x04, 0x10, 0x01, 0x03]));
        assert_eq!(framer.next_packet(), Some(vec![0x02, 0x01, 0x20, 0x00, 0x00]));
        assert!(framer.next_packet().is_none());
    }

    #[test]
    fn test_unknown_indicator_is_skipped() {
        let mut framer = PacketFramer::new();
        framer.push(&[0xFF, 0x00, 0x04, 0x10, 0x01, 0x03]);
        assert_eq!(framer.next_packet(), Some(vec![0x04, 0x10, 0x01, 0x03]));
    }
}
