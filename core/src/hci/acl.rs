//! HCI ACL data packets
//!
//! `[0x02][handle+flags: u16][data_len: u16][payload]`. The 16-bit word packs
//! the 12-bit connection handle with the 2-bit packet boundary (PB) flag in
//! bits 12-13 and the 2-bit broadcast (BC) flag in bits 14-15.

use super::{HciError, MAX_CONN_HANDLE};

/// Packet indicator for ACL data packets
pub const ACL_INDICATOR: u8 = 0x02;

/// Handle/flags word + data length, following the indicator
pub const ACL_HEADER_LEN: usize = 4;

/// Packet boundary flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketBoundary {
    /// First fragment of a non-automatically-flushable L2CAP PDU
    FirstNonAutoFlush = 0b00,
    /// Continuing fragment
    Continuing = 0b01,
    /// First fragment of an automatically-flushable L2CAP PDU
    FirstAutoFlush = 0b10,
}

impl PacketBoundary {
    /// Parse the 2-bit PB field; `0b11` is not valid on LE
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 0b11 {
            0b00 => Some(Self::FirstNonAutoFlush),
            0b01 => Some(Self::Continuing),
            0b10 => Some(Self::FirstAutoFlush),
            _ => None,
        }
    }

    /// True for both flavours of first fragment
    pub fn is_first(self) -> bool {
        !matches!(self, Self::Continuing)
    }
}

/// Parsed ACL header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclHeader {
    pub conn_handle: u16,
    pub pb_flag: PacketBoundary,
    pub bc_flag: u8,
    pub data_len: u16,
}

/// Header bytes for a packet; callers validate the handle beforehand
pub(crate) fn header_bytes(
    conn_handle: u16,
    pb_flag: PacketBoundary,
    data_len: u16,
) -> [u8; 1 + ACL_HEADER_LEN] {
    let word = (conn_handle & MAX_CONN_HANDLE) | ((pb_flag as u16) << 12);
    let w = word.to_le_bytes();
    let l = data_len.to_le_bytes();
    [ACL_INDICATOR, w[0], w[1], l[0], l[1]]
}

/// Write an ACL packet into `buf` and return the encoded slice
pub fn encode<'a>(
    buf: &'a mut [u8],
    conn_handle: u16,
    pb_flag: PacketBoundary,
    payload: &[u8],
) -> Result<&'a [u8], HciError> {
    if conn_handle > MAX_CONN_HANDLE {
        return Err(HciError::InvalidHandle(conn_handle));
    }
    if payload.len() > u16::MAX as usize {
        return Err(HciError::PayloadTooLong(payload.len()));
    }
    let total = 1 + ACL_HEADER_LEN + payload.len();
    if buf.len() < total {
        return Err(HciError::BufferTooSmall {
            needed: total,
            available: buf.len(),
        });
    }
    buf[..1 + ACL_HEADER_LEN].copy_from_slice(&header_bytes(
        conn_handle,
        pb_flag,
        payload.len() as u16,
    ));
    buf[1 + ACL_HEADER_LEN..total].copy_from_slice(payload);
    Ok(&buf[..total])
}

/// Parse the header of a packet that starts with the `0x02` indicator
pub fn parse_header(bytes: &[u8]) -> Option<AclHeader> {
    if bytes.len() < 1 + ACL_HEADER_LEN || bytes[0] != ACL_INDICATOR {
        return None;
    }
    let word = u16::from_le_bytes([bytes[1], bytes[2]]);
    Some(AclHeader {
        conn_handle: word & MAX_CONN_HANDLE,
        pb_flag: PacketBoundary::from_bits((word >> 12) as u8)?,
        bc_flag: ((word >> 14) & 0b11) as u8,
        data_len: u16::from_le_bytes([bytes[3], bytes[4]]),
    })
}

/// Payload of a packet, bounded by the header's data length
pub fn payload(bytes: &[u8]) -> Option<&[u8]> {
    let header = parse_header(bytes)?;
    let start = 1 + ACL_HEADER_LEN;
    bytes.get(start..start + header.data_len as usize)
}
