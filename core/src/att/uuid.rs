//! Attribute type UUIDs
//!
//! 16-bit UUIDs are kept in their short form. 128-bit UUIDs are stored in
//! wire (little-endian) byte order. Equality is width-sensitive: a 16-bit
//! UUID never equals a 128-bit one, even its Bluetooth base expansion.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Uuid {
    Uuid16(u16),
    Uuid128([u8; 16]),
}

/// Primary Service declaration
pub const PRIMARY_SERVICE: Uuid = Uuid::from16(0x2800);
/// Secondary Service declaration
pub const SECONDARY_SERVICE: Uuid = Uuid::from16(0x2801);
/// Include declaration
pub const INCLUDE: Uuid = Uuid::from16(0x2802);
/// Characteristic declaration
pub const CHARACTERISTIC: Uuid = Uuid::from16(0x2803);
/// Client Characteristic Configuration descriptor
pub const CCCD: Uuid = Uuid::from16(0x2902);

impl Default for Uuid {
    fn default() -> Self {
        Uuid::Uuid16(0)
    }
}

impl Uuid {
    pub const fn from16(value: u16) -> Self {
        Uuid::Uuid16(value)
    }

    /// Build a 128-bit UUID from its numeric value (as written in text form)
    pub const fn from128(value: u128) -> Self {
        Uuid::Uuid128(value.to_le_bytes())
    }

    /// Width-sensitive equality usable in const contexts
    pub const fn eql(&self, other: &Uuid) -> bool {
        match (self, other) {
            (Uuid::Uuid16(a), Uuid::Uuid16(b)) => *a == *b,
            (Uuid::Uuid128(a), Uuid::Uuid128(b)) => {
                let mut i = 0;
                while i < 16 {
                    if a[i] != b[i] {
                        return false;
                    }
                    i += 1;
                }
                true
            }
            _ => false,
        }
    }

    /// Encoded length on the wire: 2 or 16
    pub const fn byte_len(&self) -> usize {
        match self {
            Uuid::Uuid16(_) => 2,
            Uuid::Uuid128(_) => 16,
        }
    }

    pub fn is_16bit(&self) -> bool {
        matches!(self, Uuid::Uuid16(_))
    }

    /// Write the wire form into `buf`; `None` if it does not fit
    pub fn write_to(&self, buf: &mut [u8]) -> Option<usize> {
        let len = self.byte_len();
        let dst = buf.get_mut(..len)?;
        match self {
            Uuid::Uuid16(v) => dst.copy_from_slice(&v.to_le_bytes()),
            Uuid::Uuid128(b) => dst.copy_from_slice(b),
        }
        Some(len)
    }

    /// Read a UUID of width `len` (2 or 16) from the start of `buf`
    pub fn read_from(buf: &[u8], len: usize) -> Option<Self> {
        match len {
            2 => {
                let b = buf.get(..2)?;
                Some(Uuid::Uuid16(u16::from_le_bytes([b[0], b[1]])))
            }
            16 => {
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(buf.get(..16)?);
                Some(Uuid::Uuid128(bytes))
            }
            _ => None,
        }
    }

    /// Append the wire form to a vector
    pub fn extend_into(&self, out: &mut Vec<u8>) {
        match self {
            Uuid::Uuid16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Uuid::Uuid128(b) => out.extend_from_slice(b),
        }
    }
}

impl From<u16> for Uuid {
    fn from(value: u16) -> Self {
        Uuid::from16(value)
    }
}

impl From<::uuid::Uuid> for Uuid {
    fn from(value: ::uuid::Uuid) -> Self {
        Uuid::from128(value.as_u128())
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Uuid::Uuid16(v) => write!(f, "{:04X}", v),
            Uuid::Uuid128(b) => {
                let full = ::uuid::Uuid::from_u128(u128::from_le_bytes(*b));
                write!(f, "{}", full.hyphenated())
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid UUID: {0}")]
pub struct ParseUuidError(pub String);

impl FromStr for Uuid {
    type Err = ParseUuidError;

    /// Accepts `180D`, `0x180D` or a hyphenated/simple 128-bit UUID
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let short = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if short.len() <= 4 && !short.is_empty() {
            return u16::from_str_radix(short, 16)
                .map(Uuid::from16)
                .map_err(|_| ParseUuidError(s.to_string()));
        }
        ::uuid::Uuid::parse_str(trimmed)
            .map(Uuid::from)
            .map_err(|_| ParseUuidError(s.to_string()))
    }
}

impl Serialize for Uuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEART_RATE: Uuid = Uuid::from16(0x180D);
    const BASE_HEART_RATE: Uuid = Uuid::from128(0x0000180D_0000_1000_8000_00805F9B34FB);

    #[test]
    fn test_width_sensitive_equality() {
        assert!(HEART_RATE.eql(&Uuid::from16(0x180D)));
        assert!(!HEART_RATE.eql(&BASE_HEART_RATE));
        assert_ne!(HEART_RATE, BASE_HEART_RATE);
        assert!(BASE_HEART_RATE.eql(&BASE_HEART_RATE));
    }

    #[test]
    fn test_wire_form() {
        let mut buf = [0u8; 16];
        assert_eq!(HEART_RATE.write_to(&mut buf), Some(2));
        assert_eq!(&buf[..2], &[0x0D, 0x18]);

        assert_eq!(BASE_HEART_RATE.write_to(&mut buf), Some(16));
        assert_eq!(buf[0], 0xFB);
        assert_eq!(buf[12], 0x0D);
        assert_eq!(buf[13], 0x18);
        assert_eq!(Uuid::read_from(&buf, 16), Some(BASE_HEART_RATE));

        assert!(BASE_HEART_RATE.write_to(&mut buf[..8]).is_none());
        assert!(Uuid::read_from(&buf, 4).is_none());
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("180D".parse::<Uuid>(), Ok(HEART_RATE));
        assert_eq!("0x2a37".parse::<Uuid>(), Ok(Uuid::from16(0x2A37)));
        let full: Uuid = "0000180d-0000-1000-8000-00805f9b34fb".parse().expect("Parses");
        assert_eq!(full, BASE_HEART_RATE);
        assert_eq!(full.to_string(), "0000180d-0000-1000-8000-00805f9b34fb");
        assert_eq!(HEART_RATE.to_string(), "180D");
        assert!("xyz".parse::<Uuid>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&HEART_RATE).expect("Serialize");
        assert_eq!(json, "\"180D\"");
        let back: Uuid = serde_json::from_str(&json).expect("Deserialize");
        assert_eq!(back, HEART_RATE);
    }
}
