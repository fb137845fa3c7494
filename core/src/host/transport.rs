//! Controller transport abstraction
//!
//! A transport moves indicator-prefixed HCI packets between host and
//! controller. `read` and `write` never block; `poll` is the only place the
//! host waits.

use thiserror::Error;

/// Readiness flags for [`Transport::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollFlags {
    pub readable: bool,
    pub writable: bool,
}

impl PollFlags {
    pub const NONE: PollFlags = PollFlags {
        readable: false,
        writable: false,
    };
    pub const READABLE: PollFlags = PollFlags {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: PollFlags = PollFlags {
        readable: false,
        writable: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.readable && !self.writable
    }
}

/// Errors reported by a transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Nothing to read or no room to write right now
    #[error("Operation would block")]
    WouldBlock,
    #[error("HCI transport error: {0}")]
    Hci(String),
    #[error("Transport closed")]
    Closed,
}

/// Byte transport to the controller
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    /// Read available bytes without blocking
    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write bytes without blocking; may accept fewer than offered
    fn write(&self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Wait until one of `flags` is ready or `timeout_ms` elapses (`-1` waits
    /// forever). Returns the subset that is ready.
    fn poll(&self, flags: PollFlags, timeout_ms: i32) -> PollFlags;
}
