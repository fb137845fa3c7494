//! Attribute Protocol
//!
//! UUIDs, PDU codecs and the fixed-capacity attribute database shared by the
//! GATT server and client.

pub mod db;
pub mod pdu;
pub mod uuid;

use thiserror::Error;

pub use self::db::{Attribute, AttributeDb, CharProps, Permissions};
pub use self::pdu::{decode, AttErrorCode, Pdu, DEFAULT_MTU, MAX_MTU};
pub use self::uuid::Uuid;

/// Errors for local ATT operations (peer-facing failures travel as
/// [`AttErrorCode`] in Error Responses instead)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttError {
    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("Attribute database full (capacity {capacity})")]
    DatabaseFull { capacity: usize },
    #[error("Attribute value too long: {0} bytes")]
    ValueTooLong(usize),
}

/// Clamp a peer-requested MTU into `[DEFAULT_MTU, MAX_MTU]`
pub fn clamp_mtu(mtu: u16) -> u16 {
    mtu.clamp(DEFAULT_MTU, MAX_MTU)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_mtu() {
        assert_eq!(clamp_mtu(9999), 517);
        assert_eq!(clamp_mtu(10), 23);
        assert_eq!(clamp_mtu(247), 247);
    }
}
