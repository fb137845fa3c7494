//! GATT server
//!
//! Compiles a service table into an [`AttributeDb`], keeps per-characteristic
//! CCCD state and answers ATT requests. Characteristic values are owned by
//! the application through [`CharacteristicHandler`]s; requests that need a
//! handler come back from [`GattServer::prepare`] as a [`DeferredAccess`] so
//! the caller can run them off the inbound path.

use super::layout::ServiceDef;
use super::GattError;
use crate::att::pdu::{self, opcodes, Pdu, PduWriter, FORMAT_UUID128, FORMAT_UUID16};
use crate::att::uuid::{self, Uuid};
use crate::att::{
    clamp_mtu, AttError, AttErrorCode, Attribute, AttributeDb, Permissions, DEFAULT_MTU, MAX_MTU,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// CCCD bit enabling notifications
pub const CCCD_NOTIFY: u16 = 0x0001;
/// CCCD bit enabling indications
pub const CCCD_INDICATE: u16 = 0x0002;

/// Application callbacks bound to one characteristic value
pub trait CharacteristicHandler: Send + Sync {
    fn on_read(&self, conn_handle: u16) -> Result<Vec<u8>, AttErrorCode> {
        let _ = conn_handle;
        Err(AttErrorCode::ReadNotPermitted)
    }

    fn on_write(&self, conn_handle: u16, value: &[u8]) -> Result<(), AttErrorCode> {
        let _ = (conn_handle, value);
        Err(AttErrorCode::WriteNotPermitted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum AttrKind {
    #[default]
    Service,
    CharDecl,
    Value,
    Cccd,
}

/// Outcome of dispatching one request
pub enum Prepared {
    /// A response of this many bytes was written to the response buffer
    Reply(usize),
    /// Nothing to send
    Silent,
    /// A handler must run to produce the response
    Deferred(DeferredAccess),
}

#[derive(Debug, Clone)]
enum AccessKind {
    Read,
    ReadBlob { offset: u16 },
    ReadByType,
    Write { value: Vec<u8>, respond: bool },
}

/// A characteristic access waiting on its application handler
pub struct DeferredAccess {
    handler: Arc<dyn CharacteristicHandler>,
    conn_handle: u16,
    handle: u16,
    mtu: u16,
    kind: AccessKind,
}

impl fmt::Debug for DeferredAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredAccess")
            .field("conn_handle", &self.conn_handle)
            .field("handle", &self.handle)
            .field("mtu", &self.mtu)
            .field("kind", &self.kind)
            .finish()
    }
}

impl DeferredAccess {
    pub fn conn_handle(&self) -> u16 {
        self.conn_handle
    }

    pub fn handle(&self) -> u16 {
        self.handle
    }

    /// Invoke the handler and encode its response into `buf`
    pub fn run(self, buf: &mut [u8]) -> Option<&[u8]> {
        let handle = self.handle;
        let result = match self.kind {
            AccessKind::Read => match self.handler.on_read(self.conn_handle) {
                Ok(value) => pdu::read_response(buf, &value, self.mtu),
                Err(code) => pdu::error_response(buf, opcodes::READ_REQ, handle, code),
            },
            AccessKind::ReadBlob { offset } => match self.handler.on_read(self.conn_handle) {
                Ok(value) if offset as usize > value.len() => {
                    pdu::error_response(buf, opcodes::READ_BLOB_REQ, handle, AttErrorCode::InvalidOffset)
                }
                Ok(value) => pdu::read_blob_response(buf, &value, offset as usize, self.mtu),
                Err(code) => pdu::error_response(buf, opcodes::READ_BLOB_REQ, handle, code),
            },
            AccessKind::ReadByType => match self.handler.on_read(self.conn_handle) {
                Ok(value) => read_by_type_single(buf, handle, &value, self.mtu),
                Err(code) => pdu::error_response(buf, opcodes::READ_BY_TYPE_REQ, handle, code),
            },
            AccessKind::Write { value, respond } => {
                let outcome = self.handler.on_write(self.conn_handle, &value);
                if !respond {
                    if let Err(code) = outcome {
                        debug!("Write command to {:#06x} rejected: {}", handle, code);
                    }
                    return None;
                }
                match outcome {
                    Ok(()) => pdu::write_response(buf),
                    Err(code) => pdu::error_response(buf, opcodes::WRITE_REQ, handle, code),
                }
            }
        };
        match result {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to encode ATT response for {:#06x}: {}", handle, e);
                None
            }
        }
    }
}

fn read_by_type_single<'a>(
    buf: &'a mut [u8],
    handle: u16,
    value: &[u8],
    mtu: u16,
) -> Result<&'a [u8], AttError> {
    // Entry length field is one byte and the entry must fit after opcode+length
    let room = (mtu as usize).saturating_sub(4).min(u8::MAX as usize - 2);
    let value = &value[..value.len().min(room)];
    let mut w = PduWriter::new(buf, opcodes::READ_BY_TYPE_RSP)?;
    w.put_u8((2 + value.len()) as u8)?;
    w.put_u16(handle)?;
    w.put_slice(value)?;
    Ok(w.finish())
}

fn encode_find_information<'a>(
    buf: &'a mut [u8],
    format: u8,
    entries: &[(u16, Uuid)],
) -> Result<&'a [u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::FIND_INFORMATION_RSP)?;
    w.put_u8(format)?;
    for (handle, uuid) in entries {
        w.put_u16(*handle)?;
        w.put_uuid(uuid)?;
    }
    Ok(w.finish())
}

// Find By Type Value response: (found handle, group end) pairs
fn encode_find_by_type_value<'a>(buf: &'a mut [u8], entries: &[(u16, u16)]) -> Result<&'a [u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::FIND_BY_TYPE_VALUE_RSP)?;
    for (found, group_end) in entries {
        w.put_u16(*found)?;
        w.put_u16(*group_end)?;
    }
    Ok(w.finish())
}

fn encode_read_by_type<'a>(
    buf: &'a mut [u8],
    entry_len: u8,
    entries: &[(u16, Vec<u8>)],
) -> Result<&'a [u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::READ_BY_TYPE_RSP)?;
    w.put_u8(entry_len)?;
    for (handle, value) in entries {
        w.put_u16(*handle)?;
        w.put_slice(value)?;
    }
    Ok(w.finish())
}

fn encode_read_by_group_type<'a>(
    buf: &'a mut [u8],
    entry_len: u8,
    entries: &[(u16, u16, Uuid)],
) -> Result<&'a [u8], AttError> {
    let mut w = PduWriter::new(buf, opcodes::READ_BY_GROUP_TYPE_RSP)?;
    w.put_u8(entry_len)?;
    for (handle, group_end, uuid) in entries {
        w.put_u16(*handle)?;
        w.put_u16(*group_end)?;
        w.put_uuid(uuid)?;
    }
    Ok(w.finish())
}

fn respond(result: Result<&[u8], AttError>) -> Prepared {
    match result {
        Ok(bytes) => Prepared::Reply(bytes.len()),
        Err(e) => {
            warn!("Failed to encode ATT response: {}", e);
            Prepared::Silent
        }
    }
}

fn error(buf: &mut [u8], request_opcode: u8, handle: u16, code: AttErrorCode) -> Prepared {
    debug!(
        "ATT error response: opcode={:#04x} handle={:#06x} {}",
        request_opcode, handle, code
    );
    respond(pdu::error_response(buf, request_opcode, handle, code))
}

/// GATT server over a database of at most `N` attributes
pub struct GattServer<const N: usize> {
    db: AttributeDb<N>,
    kinds: [AttrKind; N],
    handlers: [Option<Arc<dyn CharacteristicHandler>>; N],
    cccd: [u16; N],
    mtu: u16,
    local_mtu: u16,
    pending_indication: Option<u16>,
}

impl<const N: usize> GattServer<N> {
    /// Build the attribute table for `services`
    pub fn new(services: &[ServiceDef]) -> Result<Self, GattError> {
        let mut db = AttributeDb::<N>::new();
        let mut kinds = [AttrKind::Service; N];

        for service in services {
            let mut value = [0u8; 16];
            let len = service.uuid.write_to(&mut value).unwrap_or(0);
            let handle = db.add(Attribute::new(
                uuid::PRIMARY_SERVICE,
                Permissions::READ,
                &value[..len],
            )?)?;
            kinds[handle as usize - 1] = AttrKind::Service;

            for chr in service.characteristics {
                let value_handle = (db.len() + 2) as u16;
                let mut decl = Vec::with_capacity(19);
                decl.push(chr.props.bits());
                decl.extend_from_slice(&value_handle.to_le_bytes());
                chr.uuid.extend_into(&mut decl);

                let handle = db.add(Attribute::new(uuid::CHARACTERISTIC, Permissions::READ, &decl)?)?;
                kinds[handle as usize - 1] = AttrKind::CharDecl;

                let handle = db.add(Attribute::new(chr.uuid, chr.props.permissions(), &[])?)?;
                kinds[handle as usize - 1] = AttrKind::Value;

                if chr.has_cccd() {
                    let handle = db.add(Attribute::new(
                        uuid::CCCD,
                        Permissions::READ | Permissions::WRITE,
                        &[],
                    )?)?;
                    kinds[handle as usize - 1] = AttrKind::Cccd;
                }
            }
        }
        debug!("GATT database built: {} attributes", db.len());

        Ok(Self {
            db,
            kinds,
            handlers: std::array::from_fn(|_| None),
            cccd: [0; N],
            mtu: DEFAULT_MTU,
            local_mtu: MAX_MTU,
            pending_indication: None,
        })
    }

    /// Set the MTU this server advertises in Exchange MTU responses
    pub fn with_local_mtu(mut self, mtu: u16) -> Self {
        self.local_mtu = clamp_mtu(mtu);
        self
    }

    /// Bind `handler` to a characteristic value; returns the value handle
    pub fn handle(
        &mut self,
        service: &Uuid,
        characteristic: &Uuid,
        handler: Arc<dyn CharacteristicHandler>,
    ) -> Result<u16, GattError> {
        let handle = self
            .value_handle(service, characteristic)
            .ok_or(GattError::CharacteristicNotFound)?;
        self.handlers[handle as usize - 1] = Some(handler);
        Ok(handle)
    }

    /// Value handle of the first `characteristic` inside the first `service`
    pub fn value_handle(&self, service: &Uuid, characteristic: &Uuid) -> Option<u16> {
        let mut in_service = false;
        for attr in self.db.iter() {
            match self.kind(attr.handle) {
                AttrKind::Service => {
                    if in_service {
                        return None;
                    }
                    in_service = Uuid::read_from(attr.value(), attr.value().len())
                        .is_some_and(|u| u.eql(service));
                }
                AttrKind::CharDecl if in_service => {
                    let v = attr.value();
                    let decl_uuid = Uuid::read_from(&v[3..], v.len() - 3);
                    if decl_uuid.is_some_and(|u| u.eql(characteristic)) {
                        return Some(u16::from_le_bytes([v[1], v[2]]));
                    }
                }
                _ => {}
            }
        }
        None
    }

    pub fn cccd_handle(&self, service: &Uuid, characteristic: &Uuid) -> Option<u16> {
        let value = self.value_handle(service, characteristic)?;
        (self.db.find_by_handle(value + 1).is_some() && self.kind(value + 1) == AttrKind::Cccd)
            .then_some(value + 1)
    }

    fn cccd_bits(&self, service: &Uuid, characteristic: &Uuid) -> u16 {
        self.cccd_handle(service, characteristic)
            .map(|h| self.cccd[h as usize - 1])
            .unwrap_or(0)
    }

    pub fn is_notify_enabled(&self, service: &Uuid, characteristic: &Uuid) -> bool {
        self.cccd_bits(service, characteristic) & CCCD_NOTIFY != 0
    }

    pub fn is_indicate_enabled(&self, service: &Uuid, characteristic: &Uuid) -> bool {
        self.cccd_bits(service, characteristic) & CCCD_INDICATE != 0
    }

    /// Current ATT MTU of the link
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn local_mtu(&self) -> u16 {
        self.local_mtu
    }

    pub fn database(&self) -> &AttributeDb<N> {
        &self.db
    }

    /// Whether an indication is waiting for its confirmation
    pub fn indication_pending(&self) -> bool {
        self.pending_indication.is_some()
    }

    /// Forget link state: subscriptions, MTU and any pending indication
    pub fn on_disconnect(&mut self) {
        self.cccd = [0; N];
        self.mtu = DEFAULT_MTU;
        self.pending_indication = None;
    }

    /// Adopt the MTU from a locally initiated exchange
    pub fn set_mtu(&mut self, peer_mtu: u16) {
        self.mtu = clamp_mtu(peer_mtu).min(self.local_mtu);
        info!("ATT MTU negotiated: {}", self.mtu);
    }

    fn kind(&self, handle: u16) -> AttrKind {
        self.kinds
            .get((handle as usize).wrapping_sub(1))
            .copied()
            .unwrap_or_default()
    }

    fn handler(&self, handle: u16) -> Option<Arc<dyn CharacteristicHandler>> {
        self.handlers
            .get((handle as usize).wrapping_sub(1))
            .and_then(|h| h.clone())
    }

    /// Value of an attribute the server owns (declarations and CCCDs)
    fn static_value(&self, attr: &Attribute) -> Option<Vec<u8>> {
        match self.kind(attr.handle) {
            AttrKind::Service | AttrKind::CharDecl => Some(attr.value().to_vec()),
            AttrKind::Cccd => Some(self.cccd[attr.handle as usize - 1].to_le_bytes().to_vec()),
            AttrKind::Value => None,
        }
    }

    /// Encode a Handle Value Notification if the peer subscribed to it
    pub fn notification<'a>(
        &self,
        service: &Uuid,
        characteristic: &Uuid,
        value: &[u8],
        buf: &'a mut [u8],
    ) -> Result<Option<&'a [u8]>, GattError> {
        let handle = self
            .value_handle(service, characteristic)
            .ok_or(GattError::CharacteristicNotFound)?;
        if !self.is_notify_enabled(service, characteristic) {
            debug!("Notification for {:#06x} skipped: not subscribed", handle);
            return Ok(None);
        }
        Ok(Some(pdu::notification(buf, handle, value, self.mtu)?))
    }

    /// Encode a Handle Value Indication if the peer subscribed to it. Only
    /// one indication may be outstanding until the peer confirms it.
    pub fn indication<'a>(
        &mut self,
        service: &Uuid,
        characteristic: &Uuid,
        value: &[u8],
        buf: &'a mut [u8],
    ) -> Result<Option<&'a [u8]>, GattError> {
        let handle = self
            .value_handle(service, characteristic)
            .ok_or(GattError::CharacteristicNotFound)?;
        if !self.is_indicate_enabled(service, characteristic) {
            debug!("Indication for {:#06x} skipped: not subscribed", handle);
            return Ok(None);
        }
        if self.pending_indication.is_some() {
            return Err(GattError::IndicationPending);
        }
        let pdu = pdu::indication(buf, handle, value, self.mtu)?;
        self.pending_indication = Some(handle);
        Ok(Some(pdu))
    }

    /// Handle one request and run any handler inline
    pub fn handle_pdu<'a>(&mut self, conn_handle: u16, request: &[u8], rsp_buf: &'a mut [u8]) -> Option<&'a [u8]> {
        match self.prepare(conn_handle, request, rsp_buf) {
            Prepared::Reply(len) => Some(&rsp_buf[..len]),
            Prepared::Silent => None,
            Prepared::Deferred(access) => access.run(rsp_buf),
        }
    }

    /// Dispatch one request. Responses the server can produce itself are
    /// written to `rsp_buf`; handler-backed accesses are returned deferred.
    pub fn prepare(&mut self, conn_handle: u16, request: &[u8], rsp_buf: &mut [u8]) -> Prepared {
        let Some(&opcode) = request.first() else {
            return Prepared::Silent;
        };
        let is_command = opcode & opcodes::COMMAND_FLAG != 0;
        let Some(pdu) = pdu::decode(request) else {
            if is_command {
                return Prepared::Silent;
            }
            warn!("Malformed ATT request (opcode {:#04x}, {} bytes)", opcode, request.len());
            return error(rsp_buf, opcode, 0, AttErrorCode::InvalidPdu);
        };
        debug!("ATT request from {:#06x}: {:?}", conn_handle, pdu);

        match pdu {
            Pdu::ExchangeMtuRequest { mtu } => {
                self.mtu = clamp_mtu(mtu).min(self.local_mtu);
                info!("ATT MTU negotiated: {}", self.mtu);
                respond(pdu::mtu_response(rsp_buf, self.local_mtu))
            }
            Pdu::FindInformationRequest { start, end } => self.find_information(start, end, rsp_buf),
            Pdu::FindByTypeValueRequest {
                start,
                end,
                attr_type,
                value,
            } => self.find_by_type_value(start, end, attr_type, value, rsp_buf),
            Pdu::ReadByTypeRequest { start, end, attr_type } => {
                self.read_by_type(conn_handle, start, end, &attr_type, rsp_buf)
            }
            Pdu::ReadByGroupTypeRequest {
                start,
                end,
                group_type,
            } => self.read_by_group_type(start, end, &group_type, rsp_buf),
            Pdu::ReadRequest { handle } => self.read(conn_handle, handle, None, rsp_buf),
            Pdu::ReadBlobRequest { handle, offset } => {
                self.read(conn_handle, handle, Some(offset), rsp_buf)
            }
            Pdu::WriteRequest { handle, value } => self.write(conn_handle, handle, value, true, rsp_buf),
            Pdu::WriteCommand { handle, value } => self.write(conn_handle, handle, value, false, rsp_buf),
            Pdu::Confirmation => {
                if self.pending_indication.take().is_none() {
                    debug!("Confirmation without pending indication");
                }
                Prepared::Silent
            }
            _ if is_command => Prepared::Silent,
            other => error(rsp_buf, other.opcode(), 0, AttErrorCode::RequestNotSupported),
        }
    }

    fn check_range(start: u16, end: u16) -> bool {
        start != 0 && start <= end
    }

    fn find_information(&self, start: u16, end: u16, buf: &mut [u8]) -> Prepared {
        let op = opcodes::FIND_INFORMATION_REQ;
        if !Self::check_range(start, end) {
            return error(buf, op, start, AttErrorCode::InvalidHandle);
        }
        let mut entries: Vec<(u16, Uuid)> = Vec::new();
        let mut used = 2;
        for attr in self.db.range(start, end) {
            let entry_len = 2 + attr.uuid.byte_len();
            if let Some((_, first)) = entries.first() {
                if first.byte_len() != attr.uuid.byte_len() {
                    break;
                }
            }
            if used + entry_len > self.mtu as usize {
                break;
            }
            used += entry_len;
            entries.push((attr.handle, attr.uuid));
        }
        let Some((_, first)) = entries.first() else {
            return error(buf, op, start, AttErrorCode::AttributeNotFound);
        };
        let format = if first.is_16bit() { FORMAT_UUID16 } else { FORMAT_UUID128 };
        respond(encode_find_information(buf, format, &entries))
    }

    fn find_by_type_value(&self, start: u16, end: u16, attr_type: u16, value: &[u8], buf: &mut [u8]) -> Prepared {
        let op = opcodes::FIND_BY_TYPE_VALUE_REQ;
        if !Self::check_range(start, end) {
            return error(buf, op, start, AttErrorCode::InvalidHandle);
        }
        let wanted = Uuid::from16(attr_type);
        let is_group = wanted.eql(&uuid::PRIMARY_SERVICE);
        let mut entries: Vec<(u16, u16)> = Vec::new();
        let mut used = 1;
        for attr in self.db.range(start, end) {
            if !attr.uuid.eql(&wanted) {
                continue;
            }
            let matches = self.static_value(attr).is_some_and(|v| v == value);
            if !matches {
                continue;
            }
            if used + 4 > self.mtu as usize {
                break;
            }
            used += 4;
            let group_end = if is_group {
                self.db.group_end(attr.handle, &uuid::PRIMARY_SERVICE)
            } else {
                attr.handle
            };
            entries.push((attr.handle, group_end));
        }
        if entries.is_empty() {
            return error(buf, op, start, AttErrorCode::AttributeNotFound);
        }
        respond(encode_find_by_type_value(buf, &entries))
    }

    fn read_by_type(&self, conn_handle: u16, start: u16, end: u16, attr_type: &Uuid, buf: &mut [u8]) -> Prepared {
        let op = opcodes::READ_BY_TYPE_REQ;
        if !Self::check_range(start, end) {
            return error(buf, op, start, AttErrorCode::InvalidHandle);
        }
        let max_entry = (self.mtu as usize - 2).min(u8::MAX as usize);
        let mut entries: Vec<(u16, Vec<u8>)> = Vec::new();
        let mut used = 2;
        for attr in self.db.range(start, end).filter(|a| a.uuid.eql(attr_type)) {
            if !attr.is_readable() {
                if entries.is_empty() {
                    return error(buf, op, attr.handle, AttErrorCode::ReadNotPermitted);
                }
                break;
            }
            let Some(mut value) = self.static_value(attr) else {
                if !entries.is_empty() {
                    break;
                }
                return match self.handler(attr.handle) {
                    Some(handler) => Prepared::Deferred(DeferredAccess {
                        handler,
                        conn_handle,
                        handle: attr.handle,
                        mtu: self.mtu,
                        kind: AccessKind::ReadByType,
                    }),
                    None => error(buf, op, attr.handle, AttErrorCode::UnlikelyError),
                };
            };
            value.truncate(max_entry - 2);
            let entry_len = 2 + value.len();
            if let Some((_, first)) = entries.first() {
                if first.len() + 2 != entry_len {
                    break;
                }
            }
            if used + entry_len > self.mtu as usize {
                break;
            }
            used += entry_len;
            entries.push((attr.handle, value));
        }
        let Some((_, first)) = entries.first() else {
            return error(buf, op, start, AttErrorCode::AttributeNotFound);
        };
        let entry_len = (first.len() + 2) as u8;
        respond(encode_read_by_type(buf, entry_len, &entries))
    }

    fn read_by_group_type(&self, start: u16, end: u16, group_type: &Uuid, buf: &mut [u8]) -> Prepared {
        let op = opcodes::READ_BY_GROUP_TYPE_REQ;
        if !Self::check_range(start, end) {
            return error(buf, op, start, AttErrorCode::InvalidHandle);
        }
        if !group_type.eql(&uuid::PRIMARY_SERVICE) {
            return error(buf, op, start, AttErrorCode::UnsupportedGroupType);
        }
        let mut entries: Vec<(u16, u16, Uuid)> = Vec::new();
        let mut used = 2;
        for attr in self.db.range(start, end).filter(|a| a.uuid.eql(group_type)) {
            let Some(service_uuid) = Uuid::read_from(attr.value(), attr.value().len()) else {
                continue;
            };
            let entry_len = 4 + service_uuid.byte_len();
            if let Some((_, _, first)) = entries.first() {
                if first.byte_len() != service_uuid.byte_len() {
                    break;
                }
            }
            if used + entry_len > self.mtu as usize {
                break;
            }
            used += entry_len;
            entries.push((attr.handle, self.db.group_end(attr.handle, group_type), service_uuid));
        }
        let Some((_, _, first)) = entries.first() else {
            return error(buf, op, start, AttErrorCode::AttributeNotFound);
        };
        let entry_len = (4 + first.byte_len()) as u8;
        respond(encode_read_by_group_type(buf, entry_len, &entries))
    }

    fn read(&self, conn_handle: u16, handle: u16, offset: Option<u16>, buf: &mut [u8]) -> Prepared {
        let op = if offset.is_some() {
            opcodes::READ_BLOB_REQ
        } else {
            opcodes::READ_REQ
        };
        let Some(attr) = self.db.find_by_handle(handle) else {
            return error(buf, op, handle, AttErrorCode::AttributeNotFound);
        };
        if !attr.is_readable() {
            return error(buf, op, handle, AttErrorCode::ReadNotPermitted);
        }
        if let Some(value) = self.static_value(attr) {
            return match offset {
                None => respond(pdu::read_response(buf, &value, self.mtu)),
                Some(o) if o as usize > value.len() => error(buf, op, handle, AttErrorCode::InvalidOffset),
                Some(o) => respond(pdu::read_blob_response(buf, &value, o as usize, self.mtu)),
            };
        }
        match self.handler(handle) {
            Some(handler) => Prepared::Deferred(DeferredAccess {
                handler,
                conn_handle,
                handle,
                mtu: self.mtu,
                kind: match offset {
                    None => AccessKind::Read,
                    Some(offset) => AccessKind::ReadBlob { offset },
                },
            }),
            None => error(buf, op, handle, AttErrorCode::UnlikelyError),
        }
    }

    fn write(&mut self, conn_handle: u16, handle: u16, value: &[u8], respond_to: bool, buf: &mut [u8]) -> Prepared {
        let op = opcodes::WRITE_REQ;
        let reject = |buf: &mut [u8], code: AttErrorCode| {
            if respond_to {
                error(buf, op, handle, code)
            } else {
                debug!("Write command to {:#06x} dropped: {}", handle, code);
                Prepared::Silent
            }
        };
        let Some(attr) = self.db.find_by_handle(handle) else {
            return reject(buf, AttErrorCode::AttributeNotFound);
        };
        match self.kind(handle) {
            AttrKind::Cccd => {
                if value.len() < 2 {
                    return reject(buf, AttErrorCode::InvalidAttributeValueLength);
                }
                let bits = u16::from_le_bytes([value[0], value[1]]) & (CCCD_NOTIFY | CCCD_INDICATE);
                self.cccd[handle as usize - 1] = bits;
                info!(
                    "CCCD {:#06x} set by {:#06x}: notify={} indicate={}",
                    handle,
                    conn_handle,
                    bits & CCCD_NOTIFY != 0,
                    bits & CCCD_INDICATE != 0
                );
                if respond_to {
                    respond(pdu::write_response(buf))
                } else {
                    Prepared::Silent
                }
            }
            AttrKind::Service | AttrKind::CharDecl => reject(buf, AttErrorCode::WriteNotPermitted),
            AttrKind::Value => {
                if !attr.is_writable() {
                    return reject(buf, AttErrorCode::WriteNotPermitted);
                }
                match self.handler(handle) {
                    Some(handler) => Prepared::Deferred(DeferredAccess {
                        handler,
                        conn_handle,
                        handle,
                        mtu: self.mtu,
                        kind: AccessKind::Write {
                            value: value.to_vec(),
                            respond: respond_to,
                        },
                    }),
                    None => reject(buf, AttErrorCode::WriteNotPermitted),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::att::CharProps;
    use crate::gatt::layout::{attribute_count, CharDef};
    use parking_lot::Mutex;

    const HEART_RATE: Uuid = Uuid::from16(0x180D);
    const MEASUREMENT: Uuid = Uuid::from16(0x2A37);
    const CONTROL: Uuid = Uuid::from16(0x2A39);
    const CUSTOM_SERVICE: Uuid = Uuid::from128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
    const CUSTOM_CHAR: Uuid = Uuid::from128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

    const SERVICES: &[ServiceDef] = &[
        ServiceDef::new(
            HEART_RATE,
            &[
                CharDef::new(MEASUREMENT, CharProps::READ.union(CharProps::NOTIFY)),
                CharDef::new(CONTROL, CharProps::WRITE),
            ],
        ),
        ServiceDef::new(
            CUSTOM_SERVICE,
            &[CharDef::new(CUSTOM_CHAR, CharProps::READ.union(CharProps::INDICATE))],
        ),
    ];
    const ATTRS: usize = attribute_count(SERVICES);

    struct Value {
        data: Vec<u8>,
        written: Mutex<Vec<u8>>,
    }

    impl CharacteristicHandler for Value {
        fn on_read(&self, _conn_handle: u16) -> Result<Vec<u8>, AttErrorCode> {
            Ok(self.data.clone())
        }

        fn on_write(&self, _conn_handle: u16, value: &[u8]) -> Result<(), AttErrorCode> {
            *self.written.lock() = value.to_vec();
            Ok(())
        }
    }

    fn server() -> GattServer<ATTRS> {
        GattServer::new(SERVICES).expect("Server builds")
    }

    fn value(data: &[u8]) -> Arc<Value> {
        Arc::new(Value {
            data: data.to_vec(),
            written: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_handle_layout() {
        let server = server();
        assert_eq!(ATTRS, 10);
        assert_eq!(server.value_handle(&HEART_RATE, &MEASUREMENT), Some(3));
        assert_eq!(server.cccd_handle(&HEART_RATE, &MEASUREMENT), Some(4));
        assert_eq!(server.value_handle(&HEART_RATE, &CONTROL), Some(6));
        assert_eq!(server.cccd_handle(&HEART_RATE, &CONTROL), None);
        assert_eq!(server.value_handle(&CUSTOM_SERVICE, &CUSTOM_CHAR), Some(9));
        assert_eq!(server.value_handle(&CUSTOM_SERVICE, &MEASUREMENT), None);
    }

    #[test]
    fn test_database_too_small() {
        let result = GattServer::<3>::new(SERVICES);
        assert!(matches!(
            result,
            Err(GattError::Database(AttError::DatabaseFull { capacity: 3 }))
        ));
    }

    #[test]
    fn test_cccd_write_enables_notify() {
        let mut server = server();
        let mut buf = [0u8; 64];
        let rsp = server.handle_pdu(0x40, &[0x12, 0x04, 0x00, 0x01, 0x00], &mut buf);
        assert_eq!(rsp, Some(&[0x13][..]));
        assert!(server.is_notify_enabled(&HEART_RATE, &MEASUREMENT));
        assert!(!server.is_indicate_enabled(&HEART_RATE, &MEASUREMENT));

        let rsp = server.handle_pdu(0x40, &[0x0A, 0x04, 0x00], &mut buf);
        assert_eq!(rsp, Some(&[0x0B, 0x01, 0x00][..]));
    }

    #[test]
    fn test_cccd_short_write() {
        let mut server = server();
        let mut buf = [0u8; 64];
        let rsp = server.handle_pdu(0x40, &[0x12, 0x04, 0x00, 0x01], &mut buf);
        assert_eq!(rsp, Some(&[0x01, 0x12, 0x04, 0x00, 0x0D][..]));
        assert!(!server.is_notify_enabled(&HEART_RATE, &MEASUREMENT));
    }

    #[test]
    fn test_write_command_is_silent() {
        let mut server = server();
        let mut buf = [0u8; 64];
        assert!(server
            .handle_pdu(0x40, &[0x52, 0x04, 0x00, 0x03, 0x00], &mut buf)
            .is_none());
        assert!(server.is_notify_enabled(&HEART_RATE, &MEASUREMENT));
        // Write command to unknown handle: still no response
        assert!(server
            .handle_pdu(0x40, &[0x52, 0x40, 0x00, 0x01], &mut buf)
            .is_none());
    }

    #[test]
    fn test_mtu_exchange_clamps() {
        let mut server = server();
        let mut buf = [0u8; 8];
        let rsp = server.handle_pdu(0x40, &[0x02, 0x0F, 0x27], &mut buf);
        assert_eq!(rsp, Some(&[0x03, 0x05, 0x02][..]));
        assert_eq!(server.mtu(), 517);

        server.handle_pdu(0x40, &[0x02, 0x0A, 0x00], &mut buf);
        assert_eq!(server.mtu(), 23);
    }

    #[test]
    fn test_mtu_bounded_by_local() {
        let mut server = server().with_local_mtu(185);
        let mut buf = [0u8; 8];
        let rsp = server.handle_pdu(0x40, &[0x02, 0x00, 0x02], &mut buf);
        assert_eq!(rsp, Some(&[0x03, 0xB9, 0x00][..]));
        assert_eq!(server.mtu(), 185);
    }

    #[test]
    fn test_read_with_handler() {
        let mut server = server();
        server
            .handle(&HEART_RATE, &MEASUREMENT, value(&[0x06, 0x48]))
            .expect("Registered");
        let mut buf = [0u8; 64];
        let rsp = server.handle_pdu(0x40, &[0x0A, 0x03, 0x00], &mut buf);
        assert_eq!(rsp, Some(&[0x0B, 0x06, 0x48][..]));
    }

    #[test]
    fn test_read_is_deferred() {
        let mut server = server();
        server
            .handle(&HEART_RATE, &MEASUREMENT, value(&[0x01]))
            .expect("Registered");
        let mut buf = [0u8; 64];
        let access = match server.prepare(0x40, &[0x0A, 0x03, 0x00], &mut buf) {
            Prepared::Deferred(access) => access,
            _ => panic!("Expected deferred access"),
        };
        assert_eq!(access.handle(), 3);
        assert_eq!(access.conn_handle(), 0x40);
        assert_eq!(access.run(&mut buf), Some(&[0x0B, 0x01][..]));
    }

    #[test]
    fn test_read_errors() {
        let mut server = server();
        let mut buf = [0u8; 64];
        // Unknown handle
        assert_eq!(
            server.handle_pdu(0x40, &[0x0A, 0x30, 0x00], &mut buf),
            Some(&[0x01, 0x0A, 0x30, 0x00, 0x0A][..])
        );
        // Value without handler
        assert_eq!(
            server.handle_pdu(0x40, &[0x0A, 0x03, 0x00], &mut buf),
            Some(&[0x01, 0x0A, 0x03, 0x00, 0x0E][..])
        );
        // Write-only value
        assert_eq!(
            server.handle_pdu(0x40, &[0x0A, 0x06, 0x00], &mut buf),
            Some(&[0x01, 0x0A, 0x06, 0x00, 0x02][..])
        );
    }

    #[test]
    fn test_write_permissions() {
        let mut server = server();
        let control = value(&[]);
        server
            .handle(&HEART_RATE, &CONTROL, control.clone())
            .expect("Registered");
        let mut buf = [0u8; 64];
        // Declarations are read-only
        assert_eq!(
            server.handle_pdu(0x40, &[0x12, 0x01, 0x00, 0xFF], &mut buf),
            Some(&[0x01, 0x12, 0x01, 0x00, 0x03][..])
        );
        // Read-only value
        assert_eq!(
            server.handle_pdu(0x40, &[0x12, 0x03, 0x00, 0xFF], &mut buf),
            Some(&[0x01, 0x12, 0x03, 0x00, 0x03][..])
        );
        assert_eq!(
            server.handle_pdu(0x40, &[0x12, 0x06, 0x00, 0x01], &mut buf),
            Some(&[0x13][..])
        );
        assert_eq!(*control.written.lock(), vec![0x01]);
    }

    #[test]
    fn test_service_discovery_is_homogeneous() {
        let mut server = server();
        let mut buf = [0u8; 64];
        let rsp = server
            .handle_pdu(0x40, &[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28], &mut buf)
            .expect("Response");
        // Only the 16-bit service fits in the first response
        assert_eq!(rsp, &[0x11, 0x06, 0x01, 0x00, 0x06, 0x00, 0x0D, 0x18]);

        let rsp = server
            .handle_pdu(0x40, &[0x10, 0x07, 0x00, 0xFF, 0xFF, 0x00, 0x28], &mut buf)
            .expect("Response");
        assert_eq!(rsp[0], 0x11);
        assert_eq!(rsp[1], 20);
        assert_eq!(&rsp[2..6], &[0x07, 0x00, 0x0A, 0x00]);

        let rsp = server
            .handle_pdu(0x40, &[0x10, 0x0B, 0x00, 0xFF, 0xFF, 0x00, 0x28], &mut buf)
            .expect("Response");
        assert_eq!(rsp, &[0x01, 0x10, 0x0B, 0x00, 0x0A]);
    }

    #[test]
    fn test_unsupported_group_type() {
        let mut server = server();
        let mut buf = [0u8; 64];
        let rsp = server.handle_pdu(0x40, &[0x10, 0x01, 0x00, 0xFF, 0xFF, 0x03, 0x28], &mut buf);
        assert_eq!(rsp, Some(&[0x01, 0x10, 0x01, 0x00, 0x10][..]));
    }

    #[test]
    fn test_characteristic_discovery() {
        let mut server = server();
        let mut buf = [0u8; 64];
        let rsp = server
            .handle_pdu(0x40, &[0x08, 0x01, 0x00, 0x06, 0x00, 0x03, 0x28], &mut buf)
            .expect("Response");
        assert_eq!(
            rsp,
            &[
                0x09, 0x07, // opcode, entry length
                0x02, 0x00, 0x12, 0x03, 0x00, 0x37, 0x2A, // measurement
                0x05, 0x00, 0x08, 0x06, 0x00, 0x39, 0x2A, // control
            ]
        );
    }

    #[test]
    fn test_find_information() {
        let mut server = server();
        let mut buf = [0u8; 64];
        let rsp = server
            .handle_pdu(0x40, &[0x04, 0x04, 0x00, 0x04, 0x00], &mut buf)
            .expect("Response");
        assert_eq!(rsp, &[0x05, 0x01, 0x04, 0x00, 0x02, 0x29]);

        let rsp = server
            .handle_pdu(0x40, &[0x04, 0x00, 0x00, 0x04, 0x00], &mut buf)
            .expect("Response");
        assert_eq!(rsp, &[0x01, 0x04, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_find_by_type_value() {
        let mut server = server();
        let mut buf = [0u8; 64];
        let rsp = server
            .handle_pdu(
                0x40,
                &[0x06, 0x01, 0x00, 0xFF, 0xFF, 0x00, 0x28, 0x0D, 0x18],
                &mut buf,
            )
            .expect("Response");
        assert_eq!(rsp, &[0x07, 0x01, 0x00, 0x06, 0x00]);
    }

    #[test]
    fn test_unsupported_and_malformed() {
        let mut server = server();
        let mut buf = [0u8; 64];
        // Prepare Write Request
        assert_eq!(
            server.handle_pdu(0x40, &[0x16, 0x03, 0x00, 0x00, 0x00], &mut buf),
            Some(&[0x01, 0x16, 0x00, 0x00, 0x06][..])
        );
        // Truncated Read Request
        assert_eq!(
            server.handle_pdu(0x40, &[0x0A, 0x03], &mut buf),
            Some(&[0x01, 0x0A, 0x00, 0x00, 0x04][..])
        );
        // Unknown command
        assert!(server.handle_pdu(0x40, &[0xD2, 0x00], &mut buf).is_none());
        assert!(server.handle_pdu(0x40, &[], &mut buf).is_none());
    }

    #[test]
    fn test_notification_requires_subscription() {
        let mut server = server();
        let mut buf = [0u8; 64];
        let mut out = [0u8; 64];
        assert_eq!(
            server
                .notification(&HEART_RATE, &MEASUREMENT, &[0x06, 0x48], &mut out)
                .expect("Ok"),
            None
        );
        server.handle_pdu(0x40, &[0x12, 0x04, 0x00, 0x01, 0x00], &mut buf);
        assert_eq!(
            server
                .notification(&HEART_RATE, &MEASUREMENT, &[0x06, 0x48], &mut out)
                .expect("Ok"),
            Some(&[0x1B, 0x03, 0x00, 0x06, 0x48][..])
        );
        assert!(matches!(
            server.notification(&HEART_RATE, &Uuid::from16(0x2A38), &[], &mut out),
            Err(GattError::CharacteristicNotFound)
        ));
    }

    #[test]
    fn test_indication_waits_for_confirmation() {
        let mut server = server();
        let mut buf = [0u8; 64];
        let mut out = [0u8; 64];
        server.handle_pdu(0x40, &[0x12, 0x0A, 0x00, 0x02, 0x00], &mut buf);
        assert!(server.is_indicate_enabled(&CUSTOM_SERVICE, &CUSTOM_CHAR));

        let ind = server
            .indication(&CUSTOM_SERVICE, &CUSTOM_CHAR, &[0x01], &mut out)
            .expect("Ok")
            .expect("Subscribed");
        assert_eq!(ind, &[0x1D, 0x09, 0x00, 0x01]);
        assert!(matches!(
            server.indication(&CUSTOM_SERVICE, &CUSTOM_CHAR, &[0x02], &mut out),
            Err(GattError::IndicationPending)
        ));

        assert!(server.handle_pdu(0x40, &[0x1E], &mut buf).is_none());
        assert!(!server.indication_pending());
        assert!(server
            .indication(&CUSTOM_SERVICE, &CUSTOM_CHAR, &[0x02], &mut out)
            .expect("Ok")
            .is_some());
    }

    #[test]
    fn test_read_blob() {
        let mut server = server();
        let long: Vec<u8> = (0..40).collect();
        server
            .handle(&HEART_RATE, &MEASUREMENT, value(&long))
            .expect("Registered");
        let mut buf = [0u8; 64];
        let rsp = server
            .handle_pdu(0x40, &[0x0C, 0x03, 0x00, 22, 0x00], &mut buf)
            .expect("Response");
        assert_eq!(rsp[0], 0x0D);
        assert_eq!(&rsp[1..], &long[22..40]);

        let rsp = server
            .handle_pdu(0x40, &[0x0C, 0x03, 0x00, 41, 0x00], &mut buf)
            .expect("Response");
        assert_eq!(rsp, &[0x01, 0x0C, 0x03, 0x00, 0x07]);
    }

    #[test]
    fn test_disconnect_resets_link_state() {
        let mut server = server();
        let mut buf = [0u8; 64];
        server.handle_pdu(0x40, &[0x12, 0x04, 0x00, 0x01, 0x00], &mut buf);
        server.handle_pdu(0x40, &[0x02, 0x00, 0x01], &mut buf);
        server.on_disconnect();
        assert!(!server.is_notify_enabled(&HEART_RATE, &MEASUREMENT));
        assert_eq!(server.mtu(), DEFAULT_MTU);
    }
}
