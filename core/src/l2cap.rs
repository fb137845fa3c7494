//! L2CAP basic-mode framing for LE fixed channels
//!
//! This module reassembles ACL fragments into complete L2CAP service data
//! units (SDUs) and fragments outgoing SDUs to the negotiated ACL data
//! length. Only fixed channels are handled; the channel ID is carried in the
//! 4-byte basic header `[length: u16][cid: u16]`.

use crate::hci::acl::{self, AclHeader, PacketBoundary, ACL_HEADER_LEN};
use crate::hci::{HciError, MAX_CONN_HANDLE};
use thiserror::Error;
use tracing::{debug, warn};

/// Attribute Protocol fixed channel
pub const CID_ATT: u16 = 0x0004;
/// LE signaling fixed channel
pub const CID_LE_SIGNALING: u16 = 0x0005;
/// Security Manager Protocol fixed channel
pub const CID_SMP: u16 = 0x0006;

/// ACL data length every LE controller supports before DLE
pub const DEFAULT_ACL_MTU: u16 = 27;

/// Errors for L2CAP operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum L2capError {
    #[error("Invalid ACL MTU: {0}")]
    InvalidMtu(u16),
    #[error("SDU too large: {0} bytes")]
    SduTooLarge(usize),
    #[error("HCI error: {0}")]
    Hci(#[from] HciError),
}

/// Basic L2CAP header: [length: u16 | cid: u16]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the information payload, header excluded
    pub length: u16,
    /// Destination channel
    pub cid: u16,
}

impl L2capHeader {
    /// Size of the header in bytes
    pub const HEADER_SIZE: usize = 4;

    pub fn new(length: u16, cid: u16) -> Self {
        Self { length, cid }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[0..2].copy_from_slice(&self.length.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.cid.to_le_bytes());
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: u16::from_le_bytes([bytes[0], bytes[1]]),
            cid: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }
}

/// A complete L2CAP service data unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sdu {
    pub conn_handle: u16,
    pub cid: u16,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct Partial {
    conn_handle: u16,
    /// Parsed once four frame bytes have arrived
    header: Option<L2capHeader>,
    /// Raw L2CAP frame bytes, basic header included
    frame: Vec<u8>,
}

impl Partial {
    fn body_len(&self) -> usize {
        self.frame.len().saturating_sub(L2capHeader::HEADER_SIZE)
    }
}

/// Reassembly context for one in-flight SDU.
///
/// The basic header may itself be split across fragments when the ACL MTU
/// is below four bytes; header bytes are buffered until it can be parsed.
/// A continuation fragment without a preceding first fragment is an orphan
/// and is discarded without touching state. The context returns to empty
/// after every completed SDU.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: Option<Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no SDU is partially accumulated
    pub fn is_idle(&self) -> bool {
        self.partial.is_none()
    }

    /// Drop any partial SDU
    pub fn reset(&mut self) {
        self.partial = None;
    }

    /// Feed one ACL fragment; returns the SDU once its declared length is reached
    pub fn feed(&mut self, header: &AclHeader, fragment: &[u8]) -> Option<Sdu> {
        if header.pb_flag.is_first() {
            if self.partial.is_some() {
                warn!(
                    "Discarding incomplete SDU on handle {:#06x}: new first fragment",
                    header.conn_handle
                );
            }
            self.partial = Some(Partial {
                conn_handle: header.conn_handle,
                header: None,
                frame: fragment.to_vec(),
            });
        } else {
            let Some(partial) = self.partial.as_mut() else {
                warn!("Orphan continuation fragment on handle {:#06x}", header.conn_handle);
                return None;
            };
            if partial.conn_handle != header.conn_handle {
                warn!(
                    "Continuation for handle {:#06x} while reassembling {:#06x}",
                    header.conn_handle, partial.conn_handle
                );
                return None;
            }
            partial.frame.extend_from_slice(fragment);
        }
        self.advance()
    }

    fn advance(&mut self) -> Option<Sdu> {
        let partial = self.partial.as_mut()?;
        if partial.header.is_none() {
            let Some(l2cap) = L2capHeader::from_bytes(&partial.frame) else {
                debug!("Buffering split L2CAP header ({} bytes)", partial.frame.len());
                return None;
            };
            let total = L2capHeader::HEADER_SIZE + l2cap.length as usize;
            partial.frame.reserve(total.saturating_sub(partial.frame.len()));
            partial.header = Some(l2cap);
        }
        let l2cap = partial.header?;
        let expected = l2cap.length as usize;
        let received = partial.body_len();
        if received > expected {
            warn!(
                "Fragments carry {} bytes for a {}-byte SDU, discarding",
                received, expected
            );
            self.partial = None;
            return None;
        }
        if received < expected {
            return None;
        }

        let mut p = self.partial.take()?;
        let data = p.frame.split_off(L2capHeader::HEADER_SIZE);
        debug!(
            "SDU complete: handle={:#06x} cid={:#06x} len={}",
            p.conn_handle,
            l2cap.cid,
            data.len()
        );
        Some(Sdu {
            conn_handle: p.conn_handle,
            cid: l2cap.cid,
            data,
        })
    }
}

/// Iterator over the ACL packets carrying one SDU
///
/// The first packet is marked first-auto-flushable, every later one
/// continuing. Each packet carries at most `mtu` bytes of the L2CAP frame.
#[derive(Debug, Clone)]
pub struct Fragments<'a> {
    header: [u8; L2capHeader::HEADER_SIZE],
    payload: &'a [u8],
    conn_handle: u16,
    mtu: usize,
    offset: usize,
}

impl<'a> Fragments<'a> {
    fn frame_len(&self) -> usize {
        L2capHeader::HEADER_SIZE + self.payload.len()
    }
}

/// Split `payload` for channel `cid` into ACL packets of at most `mtu` data bytes
pub fn fragment(payload: &[u8], cid: u16, conn_handle: u16, mtu: u16) -> Result<Fragments<'_>, L2capError> {
    if mtu == 0 {
        return Err(L2capError::InvalidMtu(mtu));
    }
    if conn_handle > MAX_CONN_HANDLE {
        return Err(HciError::InvalidHandle(conn_handle).into());
    }
    if payload.len() > u16::MAX as usize {
        return Err(L2capError::SduTooLarge(payload.len()));
    }
    Ok(Fragments {
        header: L2capHeader::new(payload.len() as u16, cid).to_bytes(),
        payload,
        conn_handle,
        mtu: mtu as usize,
        offset: 0,
    })
}

impl<'a> Iterator for Fragments<'a> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.frame_len();
        if self.offset >= total {
            return None;
        }
        let start = self.offset;
        let end = (start + self.mtu).min(total);
        let hdr = L2capHeader::HEADER_SIZE;
        let pb = if start == 0 {
            PacketBoundary::FirstAutoFlush
        } else {
            PacketBoundary::Continuing
        };

        let mut packet = Vec::with_capacity(1 + ACL_HEADER_LEN + end - start);
        packet.extend_from_slice(&acl::header_bytes(
            self.conn_handle,
            pb,
            (end - start) as u16,
        ));
        if start < hdr {
            packet.extend_from_slice(&self.header[start..end.min(hdr)]);
        }
        if end > hdr {
            packet.extend_from_slice(&self.payload[start.max(hdr) - hdr..end - hdr]);
        }
        self.offset = end;
        Some(packet)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.frame_len().saturating_sub(self.offset);
        let n = (left + self.mtu - 1) / self.mtu;
        (n, Some(n))
    }
}

impl ExactSizeIterator for Fragments<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_packet(reassembler: &mut Reassembler, packet: &[u8]) -> Option<Sdu> {
        let header = acl::parse_header(packet).expect("Valid ACL header");
        let payload = acl::payload(packet).expect("Valid ACL payload");
        reassembler.feed(&header, payload)
    }

    #[test]
    fn test_header_roundtrip() {
        let header = L2capHeader::new(23, CID_ATT);
        let bytes = header.to_bytes();
        assert_eq!(bytes, [23, 0, 4, 0]);
        assert_eq!(L2capHeader::from_bytes(&bytes), Some(header));
        assert!(L2capHeader::from_bytes(&bytes[..3]).is_none());
    }

    #[test]
    fn test_single_fragment_sdu() {
        let packets: Vec<_> = fragment(&[0x02, 0x17, 0x00], CID_ATT, 0x0040, 27)
            .expect("Fragmenter")
            .collect();
        assert_eq!(packets.len(), 1);
        assert_eq!(
            packets[0],
            vec![0x02, 0x40, 0x20, 0x07, 0x00, 0x03, 0x00, 0x04, 0x00, 0x02, 0x17, 0x00]
        );
    }

    #[test]
    fn test_fragments_respect_mtu() {
        let payload = vec![0xAB; 100];
        let fragments = fragment(&payload, CID_ATT, 0x0001, 27).expect("Fragmenter");
        assert_eq!(fragments.size_hint(), (4, Some(4)));
        let packets: Vec<_> = fragments.collect();
        assert_eq!(packets.len(), 4);
        for (i, packet) in packets.iter().enumerate() {
            let header = acl::parse_header(packet).expect("Header");
            assert!(header.data_len <= 27);
            if i == 0 {
                assert_eq!(header.pb_flag, PacketBoundary::FirstAutoFlush);
            } else {
                assert_eq!(header.pb_flag, PacketBoundary::Continuing);
            }
        }
    }

    #[test]
    fn test_mtu_smaller_than_header() {
        let packets: Vec<_> = fragment(&[0x01, 0x02], CID_ATT, 0x0001, 3)
            .expect("Fragmenter")
            .collect();
        assert_eq!(packets.len(), 2);
        let mut reassembler = Reassembler::new();
        assert!(feed_packet(&mut reassembler, &packets[0]).is_none());
        let sdu = feed_packet(&mut reassembler, &packets[1]).expect("Complete");
        assert_eq!(sdu.data, vec![0x01, 0x02]);
    }

    #[test]
    fn test_zero_mtu_rejected() {
        assert_eq!(
            fragment(&[1], CID_ATT, 1, 0).err(),
            Some(L2capError::InvalidMtu(0))
        );
    }

    #[test]
    fn test_roundtrip_multi_fragment() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let mut reassembler = Reassembler::new();
        let mut result = None;
        for packet in fragment(&payload, CID_ATT, 0x0042, 27).expect("Fragmenter") {
            assert!(result.is_none(), "SDU completed early");
            result = feed_packet(&mut reassembler, &packet);
        }
        let sdu = result.expect("Reassembled");
        assert_eq!(sdu.conn_handle, 0x0042);
        assert_eq!(sdu.cid, CID_ATT);
        assert_eq!(sdu.data, payload);
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_empty_sdu() {
        let packets: Vec<_> = fragment(&[], CID_SMP, 0x0001, 27)
            .expect("Fragmenter")
            .collect();
        assert_eq!(packets.len(), 1);
        let mut reassembler = Reassembler::new();
        let sdu = feed_packet(&mut reassembler, &packets[0]).expect("Complete");
        assert_eq!(sdu.cid, CID_SMP);
        assert!(sdu.data.is_empty());
    }

    #[test]
    fn test_orphan_continuation_is_dropped() {
        let mut reassembler = Reassembler::new();
        let orphan = AclHeader {
            conn_handle: 0x0001,
            pb_flag: PacketBoundary::Continuing,
            bc_flag: 0,
            data_len: 3,
        };
        assert!(reassembler.feed(&orphan, &[1, 2, 3]).is_none());
        assert!(reassembler.is_idle());

        let payload = vec![0x5A; 40];
        let mut result = None;
        for packet in fragment(&payload, CID_ATT, 0x0001, 27).expect("Fragmenter") {
            result = feed_packet(&mut reassembler, &packet);
        }
        assert_eq!(result.expect("Recovered").data, payload);
    }

    #[test]
    fn test_new_first_fragment_replaces_partial() {
        let mut reassembler = Reassembler::new();
        let first = AclHeader {
            conn_handle: 0x0001,
            pb_flag: PacketBoundary::FirstAutoFlush,
            bc_flag: 0,
            data_len: 6,
        };
        assert!(reassembler.feed(&first, &[10, 0, 4, 0, 1, 2]).is_none());
        assert!(!reassembler.is_idle());

        let sdu = reassembler
            .feed(&first, &[2, 0, 4, 0, 7, 8])
            .expect("Second SDU completes");
        assert_eq!(sdu.data, vec![7, 8]);
    }

    #[test]
    fn test_overflowing_continuation_discards() {
        let mut reassembler = Reassembler::new();
        let first = AclHeader {
            conn_handle: 0x0001,
            pb_flag: PacketBoundary::FirstNonAutoFlush,
            bc_flag: 0,
            data_len: 5,
        };
        let cont = AclHeader {
            pb_flag: PacketBoundary::Continuing,
            ..first
        };
        assert!(reassembler.feed(&first, &[3, 0, 4, 0, 1]).is_none());
        assert!(reassembler.feed(&cont, &[2, 3, 4]).is_none());
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_continuation_from_other_handle_ignored() {
        let mut reassembler = Reassembler::new();
        let first = AclHeader {
            conn_handle: 0x0001,
            pb_flag: PacketBoundary::FirstAutoFlush,
            bc_flag: 0,
            data_len: 5,
        };
        let foreign = AclHeader {
            conn_handle: 0x0002,
            pb_flag: PacketBoundary::Continuing,
            ..first
        };
        let own = AclHeader {
            pb_flag: PacketBoundary::Continuing,
            ..first
        };
        assert!(reassembler.feed(&first, &[2, 0, 4, 0, 1]).is_none());
        assert!(reassembler.feed(&foreign, &[9]).is_none());
        let sdu = reassembler.feed(&own, &[2]).expect("Completes");
        assert_eq!(sdu.data, vec![1, 2]);
    }

    #[test]
    fn test_header_split_across_fragments() {
        let mut reassembler = Reassembler::new();
        let first = AclHeader {
            conn_handle: 0x0001,
            pb_flag: PacketBoundary::FirstAutoFlush,
            bc_flag: 0,
            data_len: 2,
        };
        let cont = AclHeader {
            pb_flag: PacketBoundary::Continuing,
            data_len: 3,
            ..first
        };
        assert!(reassembler.feed(&first, &[1, 0]).is_none());
        assert!(!reassembler.is_idle());
        let sdu = reassembler.feed(&cont, &[4, 0, 9]).expect("Completes");
        assert_eq!(sdu.cid, CID_ATT);
        assert_eq!(sdu.data, vec![9]);
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_one_byte_mtu() {
        let packets: Vec<_> = fragment(&[], CID_ATT, 0x0001, 1)
            .expect("Fragmenter")
            .collect();
        assert_eq!(packets.len(), 4);
        let mut reassembler = Reassembler::new();
        for packet in &packets[..3] {
            assert!(feed_packet(&mut reassembler, packet).is_none());
        }
        let sdu = feed_packet(&mut reassembler, &packets[3]).expect("Empty SDU completes");
        assert_eq!(sdu.cid, CID_ATT);
        assert!(sdu.data.is_empty());

        let payload = [0xA1, 0xB2, 0xC3];
        let mut result = None;
        for packet in fragment(&payload, CID_SMP, 0x0001, 1).expect("Fragmenter") {
            assert!(result.is_none(), "SDU completed early");
            result = feed_packet(&mut reassembler, &packet);
        }
        let sdu = result.expect("Reassembled");
        assert_eq!(sdu.cid, CID_SMP);
        assert_eq!(sdu.data, payload);
    }

    #[test]
    fn test_split_header_overflow_discards() {
        let mut reassembler = Reassembler::new();
        let first = AclHeader {
            conn_handle: 0x0001,
            pb_flag: PacketBoundary::FirstAutoFlush,
            bc_flag: 0,
            data_len: 3,
        };
        let cont = AclHeader {
            pb_flag: PacketBoundary::Continuing,
            data_len: 4,
            ..first
        };
        assert!(reassembler.feed(&first, &[1, 0, 4]).is_none());
        assert!(reassembler.feed(&cont, &[0, 7, 8, 9]).is_none());
        assert!(reassembler.is_idle());
    }
}
