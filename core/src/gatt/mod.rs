//! Generic Attribute Profile
//!
//! `layout` numbers handles for a declared service table, `server` answers
//! ATT requests against it and `client` parses discovery responses from a
//! remote server.

pub mod client;
pub mod layout;
pub mod server;

use crate::att::AttError;
use thiserror::Error;

pub use client::{
    parse_chars_from_response, parse_descriptors_from_response, parse_services_from_response,
    AttResponse, DiscoveredCharacteristic, DiscoveredDescriptor, DiscoveredService,
};
pub use layout::{attribute_count, cccd_handle, value_handle, CharDef, ServiceDef};
pub use server::{CharacteristicHandler, DeferredAccess, GattServer, Prepared};

/// Errors for GATT server operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Characteristic not found in service table")]
    CharacteristicNotFound,
    #[error("Attribute database error: {0}")]
    Database(#[from] AttError),
    #[error("Indication pending: waiting for confirmation")]
    IndicationPending,
}
