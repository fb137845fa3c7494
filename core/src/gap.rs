//! GAP state machine: advertising, scanning and connection management
//!
//! The machine never talks to the controller directly. Operations validate
//! the current state, queue the HCI commands that carry them out and move to
//! the next state; controller events are fed back through `handle_event`.
//! Both the command queue and the application event queue are drained by
//! the host.

use crate::hci::command::{DEFAULT_EVENT_MASK, DEFAULT_LE_EVENT_MASK, MAX_ADVERTISING_DATA_LEN};
use crate::hci::{
    opcodes, AdvertisingParameters, Command, ConnectionParameters, Event, HciError,
    PhyPreference, ScanParameters, STATUS_SUCCESS,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default bound on queued HCI commands
pub const DEFAULT_COMMAND_CAPACITY: usize = 16;

/// Bound on undelivered application events
pub const MAX_PENDING_EVENTS: usize = 64;

/// GAP connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GapState {
    Idle,
    Advertising,
    Scanning,
    Connecting,
    Connected,
}

/// Local role on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Central,
    Peripheral,
}

impl Role {
    pub fn from_u8(value: u8) -> Self {
        if value == 0x01 {
            Role::Peripheral
        } else {
            Role::Central
        }
    }
}

/// Errors for GAP operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GapError {
    #[error("Operation not allowed in state {0:?}")]
    InvalidState(GapState),
    #[error("HCI command queue full")]
    CommandQueueFull,
    #[error("HCI error: {0}")]
    Hci(#[from] HciError),
}

/// Application-facing GAP events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapEvent {
    DeviceFound {
        event_type: u8,
        address_type: u8,
        address: [u8; 6],
        rssi: i8,
        data: Vec<u8>,
    },
    Connected {
        conn_handle: u16,
        role: Role,
        peer_address_type: u8,
        peer_address: [u8; 6],
        /// Connection interval in 1.25 ms units
        interval: u16,
        latency: u16,
        /// Supervision timeout in 10 ms units
        supervision_timeout: u16,
    },
    ConnectFailed {
        status: u8,
    },
    Disconnected {
        conn_handle: u16,
        reason: u8,
    },
    AdvertisingStopped,
    PhyUpdated {
        status: u8,
        conn_handle: u16,
        tx_phy: u8,
        rx_phy: u8,
    },
    DataLengthChanged {
        conn_handle: u16,
        max_tx_octets: u16,
        max_tx_time: u16,
        max_rx_octets: u16,
        max_rx_time: u16,
    },
}

/// GAP state machine with its outgoing command and event queues
#[derive(Debug)]
pub struct Gap {
    state: GapState,
    conn_handle: Option<u16>,
    commands: VecDeque<Command>,
    events: VecDeque<GapEvent>,
    command_capacity: usize,
}

impl Default for Gap {
    fn default() -> Self {
        Self::new()
    }
}

impl Gap {
    pub fn new() -> Self {
        Self::with_command_capacity(DEFAULT_COMMAND_CAPACITY)
    }

    pub fn with_command_capacity(capacity: usize) -> Self {
        Self {
            state: GapState::Idle,
            conn_handle: None,
            commands: VecDeque::with_capacity(capacity),
            events: VecDeque::new(),
            command_capacity: capacity,
        }
    }

    pub fn state(&self) -> GapState {
        self.state
    }

    /// Handle of the active connection
    pub fn conn_handle(&self) -> Option<u16> {
        self.conn_handle
    }

    /// Number of commands waiting to be sent
    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    fn require(&self, allowed: &[GapState]) -> Result<(), GapError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(GapError::InvalidState(self.state))
        }
    }

    // All-or-nothing so a failed operation leaves no partial sequence behind
    fn enqueue(&mut self, commands: Vec<Command>) -> Result<(), GapError> {
        if self.commands.len() + commands.len() > self.command_capacity {
            warn!(
                "HCI command queue full ({} queued, capacity {})",
                self.commands.len(),
                self.command_capacity
            );
            return Err(GapError::CommandQueueFull);
        }
        self.commands.extend(commands);
        Ok(())
    }

    fn push_event(&mut self, event: GapEvent) {
        if self.events.len() >= MAX_PENDING_EVENTS {
            warn!("GAP event queue full, dropping {:?}", event);
            return;
        }
        self.events.push_back(event);
    }

    fn transition(&mut self, next: GapState) {
        if self.state != next {
            info!("GAP state: {:?} -> {:?}", self.state, next);
        }
        self.state = next;
    }

    /// Queue the controller initialisation sequence
    pub fn init(&mut self) -> Result<(), GapError> {
        self.require(&[GapState::Idle])?;
        self.enqueue(vec![
            Command::reset(),
            Command::set_event_mask(DEFAULT_EVENT_MASK),
            Command::le_set_event_mask(DEFAULT_LE_EVENT_MASK),
            Command::le_read_buffer_size(),
        ])
    }

    pub fn start_advertising(
        &mut self,
        params: &AdvertisingParameters,
        adv_data: &[u8],
        scan_rsp_data: &[u8],
    ) -> Result<(), GapError> {
        self.require(&[GapState::Idle])?;
        self.enqueue(vec![
            Command::le_set_advertising_parameters(params),
            Command::le_set_advertising_data(adv_data)?,
            Command::le_set_scan_response_data(scan_rsp_data)?,
            Command::le_set_advertising_enable(true),
        ])?;
        self.transition(GapState::Advertising);
        Ok(())
    }

    pub fn stop_advertising(&mut self) -> Result<(), GapError> {
        self.require(&[GapState::Advertising])?;
        self.enqueue(vec![Command::le_set_advertising_enable(false)])?;
        self.transition(GapState::Idle);
        Ok(())
    }

    pub fn start_scanning(&mut self, params: &ScanParameters) -> Result<(), GapError> {
        self.require(&[GapState::Idle])?;
        self.enqueue(vec![
            Command::le_set_scan_parameters(params),
            Command::le_set_scan_enable(true, params.filter_duplicates),
        ])?;
        self.transition(GapState::Scanning);
        Ok(())
    }

    pub fn stop_scanning(&mut self) -> Result<(), GapError> {
        self.require(&[GapState::Scanning])?;
        self.enqueue(vec![Command::le_set_scan_enable(false, false)])?;
        self.transition(GapState::Idle);
        Ok(())
    }

    /// Initiate a connection; from `Scanning` the scan is stopped first
    pub fn connect(&mut self, params: &ConnectionParameters) -> Result<(), GapError> {
        self.require(&[GapState::Idle, GapState::Scanning])?;
        let mut commands = Vec::with_capacity(2);
        if self.state == GapState::Scanning {
            commands.push(Command::le_set_scan_enable(false, false));
        }
        commands.push(Command::le_create_connection(params));
        self.enqueue(commands)?;
        self.transition(GapState::Connecting);
        Ok(())
    }

    /// Abort a pending connection. The controller answers with a failed LE
    /// Connection Complete, which returns the machine to `Idle`.
    pub fn cancel_connect(&mut self) -> Result<(), GapError> {
        self.require(&[GapState::Connecting])?;
        self.enqueue(vec![Command::le_create_connection_cancel()])
    }

    /// Request termination; the state changes on Disconnection Complete
    pub fn disconnect(&mut self, reason: u8) -> Result<(), GapError> {
        self.require(&[GapState::Connected])?;
        let handle = self.conn_handle.ok_or(GapError::InvalidState(self.state))?;
        self.enqueue(vec![Command::disconnect(handle, reason)])
    }

    pub fn request_phy_update(&mut self, pref: &PhyPreference) -> Result<(), GapError> {
        self.require(&[GapState::Connected])?;
        let handle = self.conn_handle.ok_or(GapError::InvalidState(self.state))?;
        self.enqueue(vec![Command::le_set_phy(handle, pref)])
    }

    pub fn request_data_length(&mut self, tx_octets: u16, tx_time: u16) -> Result<(), GapError> {
        self.require(&[GapState::Connected])?;
        let handle = self.conn_handle.ok_or(GapError::InvalidState(self.state))?;
        self.enqueue(vec![Command::le_set_data_length(handle, tx_octets, tx_time)])
    }

    /// Advance the machine with a controller event
    pub fn handle_event(&mut self, event: &Event<'_>) {
        match event {
            Event::LeConnectionComplete(c) => {
                if c.status != STATUS_SUCCESS {
                    warn!("Connection failed: status {:#04x}", c.status);
                    self.conn_handle = None;
                    self.transition(GapState::Idle);
                    self.push_event(GapEvent::ConnectFailed { status: c.status });
                    return;
                }
                if self.state == GapState::Advertising {
                    self.push_event(GapEvent::AdvertisingStopped);
                }
                self.conn_handle = Some(c.conn_handle);
                self.transition(GapState::Connected);
                info!(
                    "Connected: handle={:#06x} peer={:02X?} interval={}",
                    c.conn_handle, c.peer_address, c.interval
                );
                self.push_event(GapEvent::Connected {
                    conn_handle: c.conn_handle,
                    role: Role::from_u8(c.role),
                    peer_address_type: c.peer_address_type,
                    peer_address: c.peer_address,
                    interval: c.interval,
                    latency: c.latency,
                    supervision_timeout: c.supervision_timeout,
                });
            }
            Event::DisconnectionComplete {
                status,
                conn_handle,
                reason,
            } => {
                if *status != STATUS_SUCCESS {
                    warn!(
                        "Disconnection Complete for {:#06x} with status {:#04x}",
                        conn_handle, status
                    );
                }
                info!("Disconnected: handle={:#06x} reason={:#04x}", conn_handle, reason);
                self.conn_handle = None;
                self.transition(GapState::Idle);
                self.push_event(GapEvent::Disconnected {
                    conn_handle: *conn_handle,
                    reason: *reason,
                });
            }
            Event::CommandStatus { status, opcode, .. } => {
                if *status == STATUS_SUCCESS {
                    return;
                }
                warn!("Command {:#06x} rejected: status {:#04x}", opcode, status);
                if *opcode == opcodes::LE_CREATE_CONNECTION && self.state == GapState::Connecting {
                    self.transition(GapState::Idle);
                    self.push_event(GapEvent::ConnectFailed { status: *status });
                }
            }
            Event::CommandComplete { opcode, .. } => {
                if let Some(status) = event.status().filter(|s| *s != STATUS_SUCCESS) {
                    warn!("Command {:#06x} failed: status {:#04x}", opcode, status);
                }
            }
            Event::LeAdvertisingReport(reports) => {
                if self.state != GapState::Scanning {
                    return;
                }
                for report in reports.iter() {
                    self.push_event(GapEvent::DeviceFound {
                        event_type: report.event_type,
                        address_type: report.address_type,
                        address: report.address,
                        rssi: report.rssi,
                        data: report.data.to_vec(),
                    });
                }
            }
            Event::LePhyUpdateComplete {
                status,
                conn_handle,
                tx_phy,
                rx_phy,
            } => {
                self.push_event(GapEvent::PhyUpdated {
                    status: *status,
                    conn_handle: *conn_handle,
                    tx_phy: *tx_phy,
                    rx_phy: *rx_phy,
                });
            }
            Event::LeDataLengthChange {
                conn_handle,
                max_tx_octets,
                max_tx_time,
                max_rx_octets,
                max_rx_time,
            } => {
                self.push_event(GapEvent::DataLengthChanged {
                    conn_handle: *conn_handle,
                    max_tx_octets: *max_tx_octets,
                    max_tx_time: *max_tx_time,
                    max_rx_octets: *max_rx_octets,
                    max_rx_time: *max_rx_time,
                });
            }
            Event::HardwareError { code } => {
                warn!("Controller hardware error {:#04x}", code);
            }
            other => {
                debug!("GAP ignoring event {:?}", other);
            }
        }
    }

    /// Next HCI command to send, FIFO
    pub fn next_command(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    /// Next application event, FIFO
    pub fn poll_event(&mut self) -> Option<GapEvent> {
        self.events.pop_front()
    }
}

/// AD type: Flags
pub const AD_FLAGS: u8 = 0x01;
/// AD type: Incomplete List of 16-bit Service UUIDs
pub const AD_INCOMPLETE_UUID16: u8 = 0x02;
/// AD type: Complete List of 16-bit Service UUIDs
pub const AD_COMPLETE_UUID16: u8 = 0x03;
/// AD type: Shortened Local Name
pub const AD_SHORT_NAME: u8 = 0x08;
/// AD type: Complete Local Name
pub const AD_COMPLETE_NAME: u8 = 0x09;
/// AD type: Tx Power Level
pub const AD_TX_POWER: u8 = 0x0A;
/// AD type: Manufacturer Specific Data
pub const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// LE General Discoverable Mode
pub const FLAG_LE_GENERAL_DISCOVERABLE: u8 = 0x02;
/// BR/EDR Not Supported
pub const FLAG_BR_EDR_NOT_SUPPORTED: u8 = 0x04;

/// Builder for advertising / scan response payloads (max 31 bytes)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisingData {
    bytes: Vec<u8>,
}

impl AdvertisingData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one `[len][type][data]` structure
    pub fn push(mut self, ad_type: u8, data: &[u8]) -> Result<Self, GapError> {
        let total = self.bytes.len() + 2 + data.len();
        if total > MAX_ADVERTISING_DATA_LEN {
            return Err(HciError::AdvertisingDataTooLong(total).into());
        }
        self.bytes.push((data.len() + 1) as u8);
        self.bytes.push(ad_type);
        self.bytes.extend_from_slice(data);
        Ok(self)
    }

    pub fn flags(self, flags: u8) -> Result<Self, GapError> {
        self.push(AD_FLAGS, &[flags])
    }

    pub fn complete_local_name(self, name: &str) -> Result<Self, GapError> {
        self.push(AD_COMPLETE_NAME, name.as_bytes())
    }

    pub fn short_local_name(self, name: &str) -> Result<Self, GapError> {
        self.push(AD_SHORT_NAME, name.as_bytes())
    }

    pub fn service_uuids16(self, uuids: &[u16]) -> Result<Self, GapError> {
        let data: Vec<u8> = uuids.iter().flat_map(|u| u.to_le_bytes()).collect();
        self.push(AD_COMPLETE_UUID16, &data)
    }

    pub fn tx_power(self, dbm: i8) -> Result<Self, GapError> {
        self.push(AD_TX_POWER, &[dbm as u8])
    }

    pub fn manufacturer_data(self, company_id: u16, data: &[u8]) -> Result<Self, GapError> {
        let mut payload = company_id.to_le_bytes().to_vec();
        payload.extend_from_slice(data);
        self.push(AD_MANUFACTURER_DATA, &payload)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
