//! ATT PDU decoding and encoding
//!
//! `decode` turns a received ATT payload into a borrowed [`Pdu`]. Encoders
//! write into a caller-supplied buffer and return the written slice, failing
//! with [`AttError::BufferTooSmall`] rather than overflowing.

use super::uuid::Uuid;
use super::AttError;

/// ATT MTU every LE link starts with
pub const DEFAULT_MTU: u16 = 23;
/// Largest ATT MTU a peer may negotiate
pub const MAX_MTU: u16 = 517;

/// ATT opcodes
pub mod opcodes {
    pub const ERROR_RSP: u8 = 0x01;
    pub const EXCHANGE_MTU_REQ: u8 = 0x02;
    pub const EXCHANGE_MTU_RSP: u8 = 0x03;
    pub const FIND_INFORMATION_REQ: u8 = 0x04;
    pub const FIND_INFORMATION_RSP: u8 = 0x05;
    pub const FIND_BY_TYPE_VALUE_REQ: u8 = 0x06;
    pub const FIND_BY_TYPE_VALUE_RSP: u8 = 0x07;
    pub const READ_BY_TYPE_REQ: u8 = 0x08;
    pub const READ_BY_TYPE_RSP: u8 = 0x09;
    pub const READ_REQ: u8 = 0x0A;
    pub const READ_RSP: u8 = 0x0B;
    pub const READ_BLOB_REQ: u8 = 0x0C;
    pub const READ_BLOB_RSP: u8 = 0x0D;
    pub const READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
    pub const READ_BY_GROUP_TYPE_RSP: u8 = 0x11;
    pub const WRITE_REQ: u8 = 0x12;
    pub const WRITE_RSP: u8 = 0x13;
    pub const HANDLE_VALUE_NTF: u8 = 0x1B;
    pub const HANDLE_VALUE_IND: u8 = 0x1D;
    pub const HANDLE_VALUE_CFM: u8 = 0x1E;
    pub const WRITE_CMD: u8 = 0x52;

    /// Bit 6 marks commands, which never get a response
    pub const COMMAND_FLAG: u8 = 0x40;
}

/// Find Information response formats
pub const FORMAT_UUID16: u8 = 0x01;
pub const FORMAT_UUID128: u8 = 0x02;

/// ATT error codes carried in Error Response PDUs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttErrorCode {
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidPdu,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    AttributeNotFound,
    AttributeNotLong,
    InvalidAttributeValueLength,
    UnlikelyError,
    UnsupportedGroupType,
    InsufficientResources,
    Other(u8),
}

impl AttErrorCode {
    pub fn code(self) -> u8 {
        match self {
            AttErrorCode::InvalidHandle => 0x01,
            AttErrorCode::ReadNotPermitted => 0x02,
            AttErrorCode::WriteNotPermitted => 0x03,
            AttErrorCode::InvalidPdu => 0x04,
            AttErrorCode::InsufficientAuthentication => 0x05,
            AttErrorCode::RequestNotSupported => 0x06,
            AttErrorCode::InvalidOffset => 0x07,
            AttErrorCode::AttributeNotFound => 0x0A,
            AttErrorCode::AttributeNotLong => 0x0B,
            AttErrorCode::InvalidAttributeValueLength => 0x0D,
            AttErrorCode::UnlikelyError => 0x0E,
            AttErrorCode::UnsupportedGroupType => 0x10,
            AttErrorCode::InsufficientResources => 0x11,
            AttErrorCode::Other(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => AttErrorCode::InvalidHandle,
            0x02 => AttErrorCode::ReadNotPermitted,
            0x03 => AttErrorCode::WriteNotPermitted,
            0x04 => AttErrorCode::InvalidPdu,
            0x05 => AttErrorCode::InsufficientAuthentication,
            0x06 => AttErrorCode::RequestNotSupported,
            0x07 => AttErrorCode::InvalidOffset,
            0x0A => AttErrorCode::AttributeNotFound,
            0x0B => AttErrorCode::AttributeNotLong,
            0x0D => AttErrorCode::InvalidAttributeValueLength,
            0x0E => AttErrorCode::UnlikelyError,
            0x10 => AttErrorCode::UnsupportedGroupType,
            0x11 => AttErrorCode::InsufficientResources,
            other => AttErrorCode::Other(other),
        }
    }
}

impl std::fmt::Display for AttErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({:#04x})", self, self.code())
    }
}

/// A decoded ATT PDU borrowing from the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pdu<'a> {
    ErrorResponse {
        request_opcode: u8,
        handle: u16,
        code: AttErrorCode,
    },
    ExchangeMtuRequest {
        mtu: u16,
    },
    ExchangeMtuResponse {
        mtu: u16,
    },
    FindInformationRequest {
        start: u16,
        end: u16,
    },
    FindInformationResponse {
        format: u8,
        data: &'a [u8],
    },
    FindByTypeValueRequest {
        start: u16,
        end: u16,
        attr_type: u16,
        value: &'a [u8],
    },
    FindByTypeValueResponse {
        data: &'a [u8],
    },
    ReadByTypeRequest {
        start: u16,
        end: u16,
        attr_type: Uuid,
    },
    ReadByTypeResponse {
        length: u8,
        data: &'a [u8],
    },
    ReadRequest {
        handle: u16,
    },
    ReadResponse {
        value: &'a [u8],
    },
    ReadBlobRequest {
        handle: u16,
        offset: u16,
    },
    ReadBlobResponse {
        value: &'a [u8],
    },
    ReadByGroupTypeRequest {
        start: u16,
        end: u16,
        group_type: Uuid,
    },
    ReadByGroupTypeResponse {
        length: u8,
        data: &'a [u8],
    },
    WriteRequest {
        handle: u16,
        value: &'a [u8],
    },
    WriteResponse,
    WriteCommand {
        handle: u16,
        value: &'a [u8],
    },
    Notification {
        handle: u16,
        value: &'a [u8],
    },
    Indication {
        handle: u16,
        value: &'a [u8],
    },
    Confirmation,
    /// Any opcode this stack does not interpret
    Unknown {
        opcode: u8,
        params: &'a [u8],
    },
}

impl<'a> Pdu<'a> {
    /// Wire opcode of this PDU
    pub fn opcode(&self) -> u8 {
        use opcodes::*;
        match self {
            Pdu::ErrorResponse { .. } => ERROR_RSP,
            Pdu::ExchangeMtuRequest { .. } => EXCHANGE_MTU_REQ,
            Pdu::ExchangeMtuResponse { .. } => EXCHANGE_MTU_RSP,
            Pdu::FindInformationRequest { .. } => FIND_INFORMATION_REQ,
            Pdu::FindInformationResponse { .. } => FIND_INFORMATION_RSP,
            Pdu::FindByTypeValueRequest { .. } => FIND_BY_TYPE_VALUE_REQ,
            Pdu::FindByTypeValueResponse { .. } => FIND_BY_TYPE_VALUE_RSP,
            Pdu::ReadByTypeRequest { .. } => READ_BY_TYPE_REQ,
            Pdu::ReadByTypeResponse { .. } => READ_BY_TYPE_RSP,
            Pdu::ReadRequest { .. } => READ_REQ,
            Pdu::ReadResponse { .. } => READ_RSP,
            Pdu::ReadBlobRequest { .. } => READ_BLOB_REQ,
            Pdu::ReadBlobResponse { .. } => READ_BLOB_RSP,
            Pdu::ReadByGroupTypeRequest { .. } => READ_BY_GROUP_TYPE_REQ,
            Pdu::ReadByGroupTypeResponse { .. } => READ_BY_GROUP_TYPE_RSP,
            Pdu::WriteRequest { .. } => WRITE_REQ,
            Pdu::WriteResponse => WRITE_RSP,
            Pdu::WriteCommand { .. } => WRITE_CMD,
            Pdu::Notification { .. } => HANDLE_VALUE_NTF,
            Pdu::Indication { .. } => HANDLE_VALUE_IND,
            Pdu::Confirmation => HANDLE_VALUE_CFM,
            Pdu::Unknown { opcode, .. } => *opcode,
        }
    }
}

fn u16_at(bytes: &[u8], at: usize) -> Option<u16> {
    let b = bytes.get(at..at + 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

// Type UUID filling the rest of a request after start/end handles
fn trailing_uuid(p: &[u8]) -> Option<Uuid> {
    let rest = p.get(4..)?;
    Uuid::read_from(rest, rest.len())
}

/// Decode an ATT PDU; `None` for empty or undersized input
pub fn decode(bytes: &[u8]) -> Option<Pdu<'_>> {
    let (&opcode, p) = bytes.split_first()?;
    let pdu = match opcode {
        opcodes::ERROR_RSP => Pdu::ErrorResponse {
            request_opcode: *p.first()?,
            handle: u16_at(p, 1)?,
            code: AttErrorCode::from_code(*p.get(3)?),
        },
        opcodes::EXCHANGE_MTU_REQ => Pdu::ExchangeMtuRequest { mtu: u16_at(p, 0)? },
        opcodes::EXCHANGE_MTU_RSP => Pdu::ExchangeMtuResponse { mtu: u16_at(p, 0)? },
        opcodes::FIND_INFORMATION_REQ => Pdu::FindInformationRequest {
            start: u16_at(p, 0)?,
            end: u16_at(p, 2)?,
        },
        opcodes::FIND_INFORMATION_RSP => Pdu::FindInformationResponse {
            format: *p.first()?,
            data: &p[1..],
        },
        opcodes::FIND_BY_TYPE_VALUE_REQ => Pdu::FindByTypeValueRequest {
            start: u16_at(p, 0)?,
            end: u16_at(p, 2)?,
            attr_type: u16_at(p, 4)?,
            value: &p[6..],
        },
        opcodes::FIND_BY_TYPE_VALUE_RSP => Pdu::FindByTypeValueResponse { data: p },
        opcodes::READ_BY_TYPE_REQ => Pdu::ReadByTypeRequest {
            start: u16_at(p, 0)?,
            end: u16_at(p, 2)?,
            attr_type: trailing_uuid(p)?,
        },
        opcodes::READ_BY_TYPE_RSP => Pdu::ReadByTypeResponse {
            length: *p.first()?,
            data: &p[1..],
        },
        opcodes::READ_REQ => Pdu::ReadRequest { handle: u16_at(p, 0)? },
        opcodes::READ_RSP => Pdu::ReadResponse { value: p },
        opcodes::READ_BLOB_REQ => Pdu::ReadBlobRequest {
            handle: u16_at(p, 0)?,
            offset: u16_at(p, 2)?,
        },
        opcodes::READ_BLOB_RSP => Pdu::ReadBlobResponse { value: p },
        opcodes::READ_BY_GROUP_TYPE_REQ => Pdu::ReadByGroupTypeRequest {
            start: u16_at(p, 0)?,
            end: u16_at(p, 2)?,
            group_type: trailing_uuid(p)?,
        },
        opcodes::READ_BY_GROUP_TYPE_RSP => Pdu::ReadByGroupTypeResponse {
            length: *p.first()?,
            data: &p[1..],
        },
        opcodes::WRITE_REQ => Pdu::WriteRequest {
            handle: u16_at(p, 0)?,
            value: &p[2..],
        },
        opcodes::WRITE_RSP => Pdu::WriteResponse,
        opcodes::WRITE_CMD => Pdu::WriteCommand {
            handle: u16_at(p, 0)?,
            value: &p[2..],
        },
        opcodes::HANDLE_VALUE_NTF => Pdu::Notification {
            handle: u16_at(p, 0)?,
            value: &p[2..],
        },
        opcodes::HANDLE_VALUE_IND => Pdu::Indication {
            handle: u16_at(p, 0)?,
            value: &p[2..],
        },
        opcodes::HANDLE_VALUE_CFM => Pdu::Confirmation,
        other => Pdu::Unknown {
            opcode: other,
            params: p,
        },
    };
    Some(pdu)
}

/// Bounds-checked cursor over an output buffer
pub(crate) struct PduWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> PduWriter<'a> {
    pub(crate) fn new(buf: &'a mut [u8], opcode: u8) -> Result<Self, AttError> {
        let mut w = Self { buf, len: 0 };
        w.put_u8(opcode)?;
        Ok(w)
    }

    fn reserve(&mut self, n: usize) -> Result<&mut [u8], AttError> {
        let needed = self.len + n;
        if needed > self.buf.len() {
            return Err(AttError::BufferTooSmall {
                needed,
                available: self.buf.len(),
            });
        }
        let start = self.len;
        self.len = needed;
        Ok(&mut self.buf[start..needed])
    }

    pub(crate) fn put_u8(&mut self, v: u8) -> Result<(), AttError> {
        self.reserve(1)?[0] = v;
        Ok(())
    }

    pub(crate) fn put_u16(&mut self, v: u16) -> Result<(), AttError> {
        self.reserve(2)?.copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    pub(crate) fn put_slice(&mut self, v: &[u8]) -> Result<(), AttError> {
        self.reserve(v.len())?.copy_from_slice(v);
        Ok(())
    }

    pub(crate) fn put_uuid(&mut self, uuid: &Uuid) -> Result<(), AttError> {
        let n = uuid.byte_len();
        let dst = self.reserve(n)?;
        uuid.write_to(dst);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Overwrite a byte already written
    pub(crate) fn set(&mut self, at: usize, v: u8) {
        if at < self.len {
            self.buf[at] = v;
        }
    }

    pub(crate) fn finish(self) -> &'a [u8] {
        &self.buf[..self.len]
    }
}

/// Length a value may occupy after `overhead` header bytes under `mtu`
fn fit(value: &[u8], mtu: u16, overhead: usize) -> &[u8] {
    let room = (mtu as usize).saturating_sub(overhead);
    &value[..value.len().min(room)]
}

pub fn error_response(
    buf: &mut [u8],
    request_opcode: u8,
    handle: u16,
    code: AttErrorCode,
) -> Result<&[u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::ERROR_RSP)?;
    w.put_u8(request_opcode)?;
    w.put_u16(handle)?;
    w.put_u8(code.code())?;
    Ok(w.finish())
}

/// Read Response, truncated to `mtu - 1` value bytes
pub fn read_response<'a>(buf: &'a mut [u8], value: &[u8], mtu: u16) -> Result<&'a [u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::READ_RSP)?;
    w.put_slice(fit(value, mtu, 1))?;
    Ok(w.finish())
}

/// Read Blob Response carrying `value[offset..]`, truncated to `mtu - 1`
pub fn read_blob_response<'a>(
    buf: &'a mut [u8],
    value: &[u8],
    offset: usize,
    mtu: u16,
) -> Result<&'a [u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::READ_BLOB_RSP)?;
    w.put_slice(fit(value.get(offset..).unwrap_or(&[]), mtu, 1))?;
    Ok(w.finish())
}

pub fn write_response(buf: &mut [u8]) -> Result<&[u8], AttError> {
    Ok(PduWriter::new(buf, opcodes::WRITE_RSP)?.finish())
}

pub fn mtu_response(buf: &mut [u8], mtu: u16) -> Result<&[u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::EXCHANGE_MTU_RSP)?;
    w.put_u16(mtu)?;
    Ok(w.finish())
}

/// Handle Value Notification, value truncated to `mtu - 3`
pub fn notification<'a>(
    buf: &'a mut [u8],
    handle: u16,
    value: &[u8],
    mtu: u16,
) -> Result<&'a [u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::HANDLE_VALUE_NTF)?;
    w.put_u16(handle)?;
    w.put_slice(fit(value, mtu, 3))?;
    Ok(w.finish())
}

/// Handle Value Indication, value truncated to `mtu - 3`
pub fn indication<'a>(
    buf: &'a mut [u8],
    handle: u16,
    value: &[u8],
    mtu: u16,
) -> Result<&'a [u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::HANDLE_VALUE_IND)?;
    w.put_u16(handle)?;
    w.put_slice(fit(value, mtu, 3))?;
    Ok(w.finish())
}

pub fn exchange_mtu_request(buf: &mut [u8], mtu: u16) -> Result<&[u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::EXCHANGE_MTU_REQ)?;
    w.put_u16(mtu)?;
    Ok(w.finish())
}

pub fn find_information_request(buf: &mut [u8], start: u16, end: u16) -> Result<&[u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::FIND_INFORMATION_REQ)?;
    w.put_u16(start)?;
    w.put_u16(end)?;
    Ok(w.finish())
}

/// Find By Type Value Request; used to discover a primary service by UUID
pub fn find_by_type_value_request<'a>(
    buf: &'a mut [u8],
    start: u16,
    end: u16,
    attr_type: u16,
    value: &[u8],
) -> Result<&'a [u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::FIND_BY_TYPE_VALUE_REQ)?;
    w.put_u16(start)?;
    w.put_u16(end)?;
    w.put_u16(attr_type)?;
    w.put_slice(value)?;
    Ok(w.finish())
}

pub fn read_by_type_request<'a>(
    buf: &'a mut [u8],
    start: u16,
    end: u16,
    attr_type: &Uuid,
) -> Result<&'a [u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::READ_BY_TYPE_REQ)?;
    w.put_u16(start)?;
    w.put_u16(end)?;
    w.put_uuid(attr_type)?;
    Ok(w.finish())
}

pub fn read_by_group_type_request<'a>(
    buf: &'a mut [u8],
    start: u16,
    end: u16,
    group_type: &Uuid,
) -> Result<&'a [u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::READ_BY_GROUP_TYPE_REQ)?;
    w.put_u16(start)?;
    w.put_u16(end)?;
    w.put_uuid(group_type)?;
    Ok(w.finish())
}

pub fn read_request(buf: &mut [u8], handle: u16) -> Result<&[u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::READ_REQ)?;
    w.put_u16(handle)?;
    Ok(w.finish())
}

pub fn read_blob_request(buf: &mut [u8], handle: u16, offset: u16) -> Result<&[u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::READ_BLOB_REQ)?;
    w.put_u16(handle)?;
    w.put_u16(offset)?;
    Ok(w.finish())
}

pub fn write_request<'a>(buf: &'a mut [u8], handle: u16, value: &[u8]) -> Result<&'a [u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::WRITE_REQ)?;
    w.put_u16(handle)?;
    w.put_slice(value)?;
    Ok(w.finish())
}

pub fn write_command<'a>(buf: &'a mut [u8], handle: u16, value: &[u8]) -> Result<&'a [u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::WRITE_CMD)?;
    w.put_u16(handle)?;
    w.put_slice(value)?;
    Ok(w.finish())
}

pub fn handle_value_confirmation(buf: &mut [u8]) -> Result<&[u8], AttError> {
    Ok(PduWriter::new(buf, opcodes::HANDLE_VALUE_CFM)?.finish())
}
