// BLE host stack
//
// Layers, leaf first: HCI packets, L2CAP framing, ATT, GATT server and
// client, GAP, and the host coordinator that runs them over a transport.

pub mod att;
pub mod config;
pub mod gap;
pub mod gatt;
pub mod hci;
pub mod host;
pub mod l2cap;

use thiserror::Error;

pub use att::{AttError, AttErrorCode, CharProps, Uuid};
pub use config::HostConfig;
pub use gap::{AdvertisingData, Gap, GapError, GapEvent, GapState, Role};
pub use gatt::{CharDef, CharacteristicHandler, GattError, GattServer, ServiceDef};
pub use hci::{Command, Event, HciError};
pub use host::{
    ControllerEnd, Host, HostEvent, HostHandle, MemoryTransport, Outgoing, PollFlags, Transport,
    TransportError, TxPacket,
};
pub use l2cap::{L2capError, Reassembler, Sdu};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Host is not running")]
    NotRunning,
    #[error("No tokio runtime available")]
    NoRuntime,
    #[error("Not connected")]
    NotConnected,
    #[error("Another ATT request is in flight")]
    RequestInFlight,
    #[error("ATT request timed out")]
    Timeout,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Peer returned ATT error: {0}")]
    AttResponse(AttErrorCode),
    #[error("Unexpected ATT response opcode {0:#04x}")]
    UnexpectedResponse(u8),
    #[error("GAP error: {0}")]
    Gap(#[from] GapError),
    #[error("GATT error: {0}")]
    Gatt(#[from] GattError),
    #[error("ATT error: {0}")]
    Att(#[from] AttError),
    #[error("L2CAP error: {0}")]
    L2cap(#[from] L2capError),
    #[error("HCI error: {0}")]
    Hci(#[from] HciError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
