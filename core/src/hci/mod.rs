//! HCI packet layer
//!
//! Encodes outgoing commands, decodes incoming events and frames ACL data.
//! Nothing in here knows about connections or channels; every function works
//! on plain byte buffers.

pub mod acl;
pub mod command;
pub mod event;
pub mod framer;

use thiserror::Error;

pub use acl::{AclHeader, PacketBoundary, ACL_INDICATOR};
pub use command::{
    commands, opcodes, AdvertisingParameters, AdvertisingType, Command, ConnectionParameters,
    PhyMask, PhyPreference, ScanParameters, COMMAND_INDICATOR,
};
pub use event::{
    AdvertisingReport, AdvertisingReports, CompletedPackets, Event, LeBufferSize,
    LeConnectionComplete, EVENT_INDICATOR,
};
pub use framer::PacketFramer;

/// HCI status code for a successful operation
pub const STATUS_SUCCESS: u8 = 0x00;

/// Disconnect reason: Remote User Terminated Connection
pub const REASON_REMOTE_USER_TERMINATED: u8 = 0x13;

/// Highest value representable by the 12-bit connection handle field
pub const MAX_CONN_HANDLE: u16 = 0x0FFF;

/// Errors for HCI packet construction
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HciError {
    #[error("Command parameters too long: {0} bytes (max 255)")]
    ParamsTooLong(usize),
    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("ACL payload too long: {0} bytes")]
    PayloadTooLong(usize),
    #[error("Connection handle out of range: {0:#06x}")]
    InvalidHandle(u16),
    #[error("Advertising data too long: {0} bytes (max 31)")]
    AdvertisingDataTooLong(usize),
}
