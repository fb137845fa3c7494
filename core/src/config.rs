// Host configuration
//
// Queue depths, the read-loop poll timeout and the MTUs the host starts
// with. Everything here has a working default; controllers report their
// real ACL buffer size during initialisation.

use crate::att::{DEFAULT_MTU, MAX_MTU};
use crate::gap::DEFAULT_COMMAND_CAPACITY;
use crate::l2cap::DEFAULT_ACL_MTU;
use crate::HostError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Depth of the queue feeding the write loop
    pub outbound_capacity: usize,

    /// Depth of the application event channel
    pub event_capacity: usize,

    /// Bound on queued HCI commands, also used for the handle command channel
    pub command_queue_capacity: usize,

    /// Read-loop poll timeout in milliseconds; -1 blocks until data arrives,
    /// which delays handle commands until the next inbound packet
    pub poll_timeout_ms: i32,

    /// ACL data length used until LE Read Buffer Size reports one
    pub acl_mtu: u16,

    /// ATT MTU this host offers in MTU exchanges
    pub att_mtu: u16,
}

impl HostConfig {
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_command_queue_capacity(mut self, capacity: usize) -> Self {
        self.command_queue_capacity = capacity;
        self
    }

    pub fn with_poll_timeout_ms(mut self, timeout_ms: i32) -> Self {
        self.poll_timeout_ms = timeout_ms;
        self
    }

    pub fn with_acl_mtu(mut self, mtu: u16) -> Self {
        self.acl_mtu = mtu;
        self
    }

    /// Values above 517 are clamped
    pub fn with_att_mtu(mut self, mtu: u16) -> Self {
        self.att_mtu = mtu.min(MAX_MTU);
        self
    }

    pub fn validate(&self) -> Result<(), HostError> {
        if self.outbound_capacity == 0 {
            return Err(HostError::InvalidConfig("outbound_capacity must be > 0".into()));
        }
        if self.event_capacity == 0 {
            return Err(HostError::InvalidConfig("event_capacity must be > 0".into()));
        }
        if self.command_queue_capacity == 0 {
            return Err(HostError::InvalidConfig(
                "command_queue_capacity must be > 0".into(),
            ));
        }
        if self.poll_timeout_ms < -1 {
            return Err(HostError::InvalidConfig(format!(
                "poll_timeout_ms must be >= -1, got {}",
                self.poll_timeout_ms
            )));
        }
        if self.acl_mtu == 0 {
            return Err(HostError::InvalidConfig("acl_mtu must be > 0".into()));
        }
        if self.att_mtu < DEFAULT_MTU {
            return Err(HostError::InvalidConfig(format!(
                "att_mtu must be >= {}, got {}",
                DEFAULT_MTU, self.att_mtu
            )));
        }
        Ok(())
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            event_capacity: 32,
            command_queue_capacity: DEFAULT_COMMAND_CAPACITY,
            poll_timeout_ms: 10,
            acl_mtu: DEFAULT_ACL_MTU,
            att_mtu: MAX_MTU,
        }
    }
}
