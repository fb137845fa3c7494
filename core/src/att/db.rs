//! Fixed-capacity attribute database
//!
//! Attributes live in a statically sized array with an explicit count.
//! Handles are 1-based and assigned in insertion order; lookups walk the
//! table linearly.

use super::uuid::Uuid;
use super::AttError;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Characteristic properties as carried in the declaration value
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CharProps: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharProps {
    /// Whether a CCCD descriptor follows the value attribute
    pub const fn needs_cccd(self) -> bool {
        self.intersects(CharProps::NOTIFY.union(CharProps::INDICATE))
    }

    /// Access permissions a value attribute with these properties receives
    pub const fn permissions(self) -> Permissions {
        let mut p = Permissions::empty();
        if self.contains(CharProps::READ) {
            p = p.union(Permissions::READ);
        }
        if self.intersects(CharProps::WRITE.union(CharProps::WRITE_WITHOUT_RESPONSE)) {
            p = p.union(Permissions::WRITE);
        }
        p
    }
}

bitflags! {
    /// Access permissions of an attribute
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Permissions: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
    }
}

/// Largest value stored inline: a characteristic declaration with a
/// 128-bit UUID (1 + 2 + 16 bytes)
pub const MAX_INLINE_VALUE: usize = 19;

/// One attribute. Declaration values are stored inline; characteristic
/// values are supplied by handlers at access time and stay empty here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute {
    pub handle: u16,
    pub uuid: Uuid,
    pub permissions: Permissions,
    value: [u8; MAX_INLINE_VALUE],
    value_len: u8,
}

impl Attribute {
    pub const EMPTY: Attribute = Attribute {
        handle: 0,
        uuid: Uuid::Uuid16(0),
        permissions: Permissions::empty(),
        value: [0; MAX_INLINE_VALUE],
        value_len: 0,
    };

    /// Create an attribute; the handle is assigned by [`AttributeDb::add`]
    pub fn new(uuid: Uuid, permissions: Permissions, value: &[u8]) -> Result<Self, AttError> {
        if value.len() > MAX_INLINE_VALUE {
            return Err(AttError::ValueTooLong(value.len()));
        }
        let mut attr = Attribute {
            uuid,
            permissions,
            ..Attribute::EMPTY
        };
        attr.value[..value.len()].copy_from_slice(value);
        attr.value_len = value.len() as u8;
        Ok(attr)
    }

    pub fn value(&self) -> &[u8] {
        &self.value[..self.value_len as usize]
    }

    pub fn is_readable(&self) -> bool {
        self.permissions.contains(Permissions::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.permissions.contains(Permissions::WRITE)
    }
}

impl Default for Attribute {
    fn default() -> Self {
        Attribute::EMPTY
    }
}

#[derive(Debug, Clone)]
pub struct AttributeDb<const N: usize> {
    attrs: [Attribute; N],
    len: usize,
}

impl<const N: usize> Default for AttributeDb<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> AttributeDb<N> {
    pub const fn new() -> Self {
        Self {
            attrs: [Attribute::EMPTY; N],
            len: 0,
        }
    }

    /// Append an attribute and return its handle
    pub fn add(&mut self, mut attr: Attribute) -> Result<u16, AttError> {
        if self.len >= N {
            return Err(AttError::DatabaseFull { capacity: N });
        }
        let handle = (self.len + 1) as u16;
        attr.handle = handle;
        self.attrs[self.len] = attr;
        self.len += 1;
        Ok(handle)
    }

    pub fn find_by_handle(&self, handle: u16) -> Option<&Attribute> {
        self.iter().find(|a| a.handle == handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs[..self.len].iter()
    }

    /// Attributes with handles in `[start, end]`
    pub fn range(&self, start: u16, end: u16) -> impl Iterator<Item = &Attribute> {
        self.iter()
            .filter(move |a| a.handle >= start && a.handle <= end)
    }

    /// Handle of the last attribute in the group opened at `start`: the one
    /// before the next attribute of the same declaration type, or the last
    /// handle in the database
    pub fn group_end(&self, start: u16, group_type: &Uuid) -> u16 {
        self.iter()
            .skip_while(|a| a.handle <= start)
            .find(|a| a.uuid.eql(group_type))
            .map(|a| a.handle - 1)
            .unwrap_or(self.len as u16)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn is_full(&self) -> bool {
        self.len >= N
    }
}
