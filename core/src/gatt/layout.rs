//! Service table description and handle numbering
//!
//! A table is declared once as a `const` slice of [`ServiceDef`]. Handles
//! are assigned sequentially from 1: each service takes one handle for its
//! declaration, each characteristic two (declaration + value) plus one for a
//! CCCD when it can notify or indicate. All functions here are `const` so the
//! attribute count can size the server's database at compile time.
//!
//! ```
//! use blehost_core::att::{CharProps, Uuid};
//! use blehost_core::gatt::{attribute_count, value_handle, CharDef, ServiceDef};
//!
//! const HEART_RATE: Uuid = Uuid::from16(0x180D);
//! const MEASUREMENT: Uuid = Uuid::from16(0x2A37);
//! const SERVICES: &[ServiceDef] = &[ServiceDef::new(
//!     HEART_RATE,
//!     &[CharDef::new(MEASUREMENT, CharProps::READ.union(CharProps::NOTIFY))],
//! )];
//! const ATTRS: usize = attribute_count(SERVICES);
//!
//! assert_eq!(ATTRS, 4);
//! assert_eq!(value_handle(SERVICES, &HEART_RATE, &MEASUREMENT), Some(3));
//! ```

use crate::att::{CharProps, Uuid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharDef {
    pub uuid: Uuid,
    pub props: CharProps,
}

impl CharDef {
    pub const fn new(uuid: Uuid, props: CharProps) -> Self {
        Self { uuid, props }
    }

    pub const fn has_cccd(&self) -> bool {
        self.props.needs_cccd()
    }

    /// Handles consumed: declaration, value, optional CCCD
    pub const fn attribute_count(&self) -> usize {
        if self.has_cccd() {
            3
        } else {
            2
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDef<'a> {
    pub uuid: Uuid,
    pub characteristics: &'a [CharDef],
}

impl<'a> ServiceDef<'a> {
    pub const fn new(uuid: Uuid, characteristics: &'a [CharDef]) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    /// Handles consumed by the service declaration and all characteristics
    pub const fn attribute_count(&self) -> usize {
        let mut count = 1;
        let mut i = 0;
        while i < self.characteristics.len() {
            count += self.characteristics[i].attribute_count();
            i += 1;
        }
        count
    }
}

/// Total number of attributes a table compiles into
pub const fn attribute_count(services: &[ServiceDef]) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i < services.len() {
        count += services[i].attribute_count();
        i += 1;
    }
    count
}

/// Value handle of the first characteristic `char_uuid` inside the first
/// service `service_uuid`
pub const fn value_handle(services: &[ServiceDef], service_uuid: &Uuid, char_uuid: &Uuid) -> Option<u16> {
    let mut handle: usize = 1;
    let mut s = 0;
    while s < services.len() {
        let svc = &services[s];
        if svc.uuid.eql(service_uuid) {
            let mut h = handle + 1;
            let mut c = 0;
            while c < svc.characteristics.len() {
                let chr = &svc.characteristics[c];
                if chr.uuid.eql(char_uuid) {
                    return Some((h + 1) as u16);
                }
                h += chr.attribute_count();
                c += 1;
            }
            return None;
        }
        handle += svc.attribute_count();
        s += 1;
    }
    None
}

/// CCCD handle of a characteristic, `None` when it has no CCCD
pub const fn cccd_handle(services: &[ServiceDef], service_uuid: &Uuid, char_uuid: &Uuid) -> Option<u16> {
    let Some(value) = value_handle(services, service_uuid, char_uuid) else {
        return None;
    };
    match find_char(services, service_uuid, char_uuid) {
        Some(chr) if chr.has_cccd() => Some(value + 1),
        _ => None,
    }
}

const fn find_char<'a>(services: &'a [ServiceDef<'a>], service_uuid: &Uuid, char_uuid: &Uuid) -> Option<&'a CharDef> {
    let mut s = 0;
    while s < services.len() {
        if services[s].uuid.eql(service_uuid) {
            let chars = services[s].characteristics;
            let mut c = 0;
            while c < chars.len() {
                if chars[c].uuid.eql(char_uuid) {
                    return Some(&chars[c]);
                }
                c += 1;
            }
            return None;
        }
        s += 1;
    }
    None
}
