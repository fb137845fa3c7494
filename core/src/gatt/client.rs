//! GATT client response parsing
//!
//! Classifies received ATT PDUs and walks discovery responses into
//! caller-supplied fixed-size arrays. Parsers truncate when the output is
//! smaller than the response; callers page through handle ranges for the
//! rest.

use crate::att::pdu::{opcodes, FORMAT_UUID128, FORMAT_UUID16};
use crate::att::{AttErrorCode, CharProps, Uuid};
use serde::{Deserialize, Serialize};

/// A received ATT PDU reduced to opcode, parameters and error status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttResponse<'a> {
    pub opcode: u8,
    /// Parameters following the opcode
    pub data: &'a [u8],
    /// Set for Error Responses and for input that could not be classified
    pub err: Option<AttErrorCode>,
    /// Request opcode an Error Response refers to
    pub request_opcode: u8,
    /// Attribute handle an Error Response refers to
    pub handle: u16,
}

impl<'a> AttResponse<'a> {
    fn malformed() -> Self {
        Self {
            opcode: opcodes::ERROR_RSP,
            data: &[],
            err: Some(AttErrorCode::InvalidPdu),
            request_opcode: 0,
            handle: 0,
        }
    }

    /// Classify a PDU; empty or truncated Error Responses become an
    /// `InvalidPdu` error shape
    pub fn from_pdu(bytes: &'a [u8]) -> Self {
        let Some((&opcode, data)) = bytes.split_first() else {
            return Self::malformed();
        };
        if opcode != opcodes::ERROR_RSP {
            return Self {
                opcode,
                data,
                err: None,
                request_opcode: 0,
                handle: 0,
            };
        }
        if data.len() < 4 {
            return Self::malformed();
        }
        Self {
            opcode,
            data,
            err: Some(AttErrorCode::from_code(data[3])),
            request_opcode: data[0],
            handle: u16::from_le_bytes([data[1], data[2]]),
        }
    }

    pub fn is_error(&self) -> bool {
        self.err.is_some()
    }

    /// True when the server reported the end of a discovery range
    pub fn is_not_found(&self) -> bool {
        self.err == Some(AttErrorCode::AttributeNotFound)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub start_handle: u16,
    pub end_handle: u16,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveredCharacteristic {
    pub decl_handle: u16,
    pub properties: CharProps,
    pub value_handle: u16,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveredDescriptor {
    pub handle: u16,
    pub uuid: Uuid,
}

fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

/// Split a length-prefixed list response into its fixed-width entries
fn entries<'a>(resp: &AttResponse<'a>, opcode: u8) -> Option<(usize, std::slice::ChunksExact<'a, u8>)> {
    if resp.is_error() || resp.opcode != opcode {
        return None;
    }
    let (&len, list) = resp.data.split_first()?;
    let len = len as usize;
    if len == 0 {
        return None;
    }
    Some((len, list.chunks_exact(len)))
}

/// Walk a Read By Group Type response into `out`; returns entries written
pub fn parse_services_from_response(resp: &AttResponse, out: &mut [DiscoveredService]) -> usize {
    let Some((len, chunks)) = entries(resp, opcodes::READ_BY_GROUP_TYPE_RSP) else {
        return 0;
    };
    if len != 6 && len != 20 {
        return 0;
    }
    let mut n = 0;
    for (entry, slot) in chunks.zip(out.iter_mut()) {
        let Some(uuid) = Uuid::read_from(&entry[4..], len - 4) else {
            break;
        };
        *slot = DiscoveredService {
            start_handle: le16(entry, 0),
            end_handle: le16(entry, 2),
            uuid,
        };
        n += 1;
    }
    n
}

/// Walk a Read By Type response for characteristic declarations into `out`
pub fn parse_chars_from_response(resp: &AttResponse, out: &mut [DiscoveredCharacteristic]) -> usize {
    let Some((len, chunks)) = entries(resp, opcodes::READ_BY_TYPE_RSP) else {
        return 0;
    };
    if len != 7 && len != 21 {
        return 0;
    }
    let mut n = 0;
    for (entry, slot) in chunks.zip(out.iter_mut()) {
        let Some(uuid) = Uuid::read_from(&entry[5..], len - 5) else {
            break;
        };
        *slot = DiscoveredCharacteristic {
            decl_handle: le16(entry, 0),
            properties: CharProps::from_bits_retain(entry[2]),
            value_handle: le16(entry, 3),
            uuid,
        };
        n += 1;
    }
    n
}

/// Walk a Find Information response (format 1 or 2) into `out`
pub fn parse_descriptors_from_response(resp: &AttResponse, out: &mut [DiscoveredDescriptor]) -> usize {
    if resp.is_error() || resp.opcode != opcodes::FIND_INFORMATION_RSP {
        return 0;
    }
    let Some((&format, list)) = resp.data.split_first() else {
        return 0;
    };
    let uuid_len = match format {
        FORMAT_UUID16 => 2,
        FORMAT_UUID128 => 16,
        _ => return 0,
    };
    let mut n = 0;
    for (entry, slot) in list.chunks_exact(2 + uuid_len).zip(out.iter_mut()) {
        let Some(uuid) = Uuid::read_from(&entry[2..], uuid_len) else {
            break;
        };
        *slot = DiscoveredDescriptor {
            handle: le16(entry, 0),
            uuid,
        };
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_pdu_classifies() {
        let rsp = AttResponse::from_pdu(&[0x0B, 0x01, 0x02]);
        assert_eq!(rsp.opcode, 0x0B);
        assert_eq!(rsp.data, &[0x01, 0x02]);
        assert!(!rsp.is_error());

        let err = AttResponse::from_pdu(&[0x01, 0x10, 0x07, 0x00, 0x0A]);
        assert!(err.is_not_found());
        assert_eq!(err.request_opcode, 0x10);
        assert_eq!(err.handle, 0x0007);
    }

    #[test]
    fn test_from_pdu_malformed() {
        for bytes in [&[][..], &[0x01, 0x10, 0x07][..]] {
            let rsp = AttResponse::from_pdu(bytes);
            assert_eq!(rsp.opcode, opcodes::ERROR_RSP);
            assert_eq!(rsp.err, Some(AttErrorCode::InvalidPdu));
        }
    }

    #[test]
    fn test_parse_services_truncates() {
        let bytes = [
            0x11, 0x06, //
            0x01, 0x00, 0x05, 0x00, 0x00, 0x18, //
            0x06, 0x00, 0x0B, 0x00, 0x0D, 0x18, //
            0x0C, 0x00, 0xFF, 0xFF, 0x0F, 0x18,
        ];
        let rsp = AttResponse::from_pdu(&bytes);
        let mut out = [DiscoveredService::default(); 2];
        assert_eq!(parse_services_from_response(&rsp, &mut out), 2);
        assert_eq!(
            out[1],
            DiscoveredService {
                start_handle: 6,
                end_handle: 11,
                uuid: Uuid::from16(0x180D),
            }
        );

        let mut wide = [DiscoveredService::default(); 8];
        assert_eq!(parse_services_from_response(&rsp, &mut wide), 3);
    }

    #[test]
    fn test_parse_services_128bit() {
        let mut bytes = vec![0x11, 20, 0x07, 0x00, 0x0A, 0x00];
        bytes.extend_from_slice(&[0xAB; 16]);
        let rsp = AttResponse::from_pdu(&bytes);
        let mut out = [DiscoveredService::default(); 4];
        assert_eq!(parse_services_from_response(&rsp, &mut out), 1);
        assert_eq!(out[0].uuid, Uuid::Uuid128([0xAB; 16]));
    }

    #[test]
    fn test_parse_chars() {
        let bytes = [
            0x09, 0x07, //
            0x02, 0x00, 0x12, 0x03, 0x00, 0x37, 0x2A, //
            0x05, 0x00, 0x08, 0x06, 0x00, 0x39, 0x2A,
        ];
        let rsp = AttResponse::from_pdu(&bytes);
        let mut out = [DiscoveredCharacteristic::default(); 4];
        assert_eq!(parse_chars_from_response(&rsp, &mut out), 2);
        assert_eq!(out[0].value_handle, 3);
        assert!(out[0].properties.contains(CharProps::NOTIFY));
        assert_eq!(out[1].uuid, Uuid::from16(0x2A39));
    }

    #[test]
    fn test_parse_descriptors_formats() {
        let rsp = AttResponse::from_pdu(&[0x05, 0x01, 0x04, 0x00, 0x02, 0x29]);
        let mut out = [DiscoveredDescriptor::default(); 2];
        assert_eq!(parse_descriptors_from_response(&rsp, &mut out), 1);
        assert_eq!(out[0].uuid, Uuid::from16(0x2902));

        let mut bytes = vec![0x05, 0x02, 0x09, 0x00];
        bytes.extend_from_slice(&[0x11; 16]);
        let rsp = AttResponse::from_pdu(&bytes);
        assert_eq!(parse_descriptors_from_response(&rsp, &mut out), 1);
        assert_eq!(out[0].handle, 9);

        let rsp = AttResponse::from_pdu(&[0x05, 0x03, 0x04, 0x00]);
        assert_eq!(parse_descriptors_from_response(&rsp, &mut out), 0);
    }

    #[test]
    fn test_error_response_parses_nothing() {
        let rsp = AttResponse::from_pdu(&[0x01, 0x10, 0x01, 0x00, 0x0A]);
        let mut out = [DiscoveredService::default(); 2];
        assert_eq!(parse_services_from_response(&rsp, &mut out), 0);
    }
}
