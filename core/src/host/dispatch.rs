//! Read loop: inbound packet dispatch and command handling

use super::transport::{PollFlags, Transport, TransportError};
use super::writer::Shared;
use super::{HostCommand, HostEvent, Outgoing, Reply, TxPacket};
use crate::att::pdu::{self, opcodes, MAX_MTU};
use crate::config::HostConfig;
use crate::gap::Gap;
use crate::gatt::{GattServer, Prepared};
use crate::hci::command::opcodes as hci_opcodes;
use crate::hci::event::{self, Event};
use crate::hci::{acl, LeBufferSize, PacketFramer, ACL_INDICATOR, EVENT_INDICATOR, STATUS_SUCCESS};
use crate::l2cap::{Reassembler, Sdu, CID_ATT, CID_LE_SIGNALING, CID_SMP};
use crate::HostError;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, error, info, warn};

const READ_BUFFER_SIZE: usize = 1024;

/// SMP Pairing Failed, reason Pairing Not Supported
const SMP_PAIRING_NOT_SUPPORTED: [u8; 2] = [0x05, 0x05];

fn is_att_response(opcode: u8) -> bool {
    matches!(
        opcode,
        opcodes::ERROR_RSP
            | opcodes::EXCHANGE_MTU_RSP
            | opcodes::FIND_INFORMATION_RSP
            | opcodes::FIND_BY_TYPE_VALUE_RSP
            | opcodes::READ_BY_TYPE_RSP
            | opcodes::READ_RSP
            | opcodes::READ_BLOB_RSP
            | opcodes::READ_BY_GROUP_TYPE_RSP
            | opcodes::WRITE_RSP
    )
}

fn answer<T>(reply: Reply<T>, result: Result<T, HostError>) {
    // The caller may have given up waiting
    let _ = reply.try_send(result);
}

/// Single owner of GAP and GATT state, driven by the read loop
pub(crate) struct Dispatcher<const N: usize> {
    transport: Arc<dyn Transport>,
    gap: Gap,
    server: GattServer<N>,
    framer: PacketFramer,
    reassembler: Reassembler,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Outgoing>,
    backlog: VecDeque<Outgoing>,
    events: mpsc::Sender<HostEvent>,
    pending_request: Option<Reply<Vec<u8>>>,
    runtime: Handle,
    poll_timeout_ms: i32,
    rsp_buf: Vec<u8>,
}

impl<const N: usize> Dispatcher<N> {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        server: GattServer<N>,
        config: &HostConfig,
        shared: Arc<Shared>,
        outbound: mpsc::Sender<Outgoing>,
        events: mpsc::Sender<HostEvent>,
        runtime: Handle,
    ) -> Self {
        Self {
            transport,
            gap: Gap::with_command_capacity(config.command_queue_capacity),
            server,
            framer: PacketFramer::new(),
            reassembler: Reassembler::new(),
            shared,
            outbound,
            backlog: VecDeque::new(),
            events,
            pending_request: None,
            runtime,
            poll_timeout_ms: config.poll_timeout_ms,
            rsp_buf: vec![0u8; MAX_MTU as usize],
        }
    }

    /// Queue the controller initialisation sequence
    pub(crate) fn init(&mut self) -> Result<(), HostError> {
        self.gap.init()?;
        self.flush();
        Ok(())
    }

    pub(crate) fn run(mut self, mut commands: mpsc::Receiver<HostCommand>) {
        info!("Host read loop started");
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        'outer: loop {
            loop {
                match commands.try_recv() {
                    Ok(HostCommand::Shutdown) => {
                        info!("Host shutdown requested");
                        break 'outer;
                    }
                    Ok(command) => self.handle_command(command),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        info!("All host handles dropped");
                        break 'outer;
                    }
                }
            }
            self.flush();
            if !self.shared.is_running() {
                break;
            }

            if !self.transport.poll(PollFlags::READABLE, self.poll_timeout_ms).readable {
                continue;
            }
            match self.transport.read(&mut buf) {
                Ok(0) | Err(TransportError::WouldBlock) => continue,
                Ok(n) => {
                    self.framer.push(&buf[..n]);
                    while let Some(packet) = self.framer.next_packet() {
                        self.process_packet(&packet);
                    }
                    self.flush();
                }
                Err(TransportError::Closed) => {
                    info!("Transport closed, read loop exiting");
                    break;
                }
                Err(e) => {
                    warn!("Transport read failed, retrying: {}", e);
                    continue;
                }
            }
        }
        if let Some(reply) = self.pending_request.take() {
            answer(reply, Err(HostError::NotRunning));
        }
        // Dropping the outbound sender lets the write loop drain and exit
        self.shared.stop();
        info!("Host read loop stopped");
    }

    fn queue(&mut self, item: Outgoing) {
        self.backlog.push_back(item);
    }

    fn queue_att(&mut self, conn_handle: u16, payload: Vec<u8>) {
        self.queue(Outgoing::Sdu {
            conn_handle,
            cid: CID_ATT,
            payload,
        });
    }

    fn emit(&self, event: HostEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!("Event queue full, dropping {:?}", event),
            Err(TrySendError::Closed(_)) => debug!("Event receiver dropped"),
        }
    }

    /// Move GAP output and the local backlog toward the write loop without
    /// blocking the read loop
    fn flush(&mut self) {
        while let Some(command) = self.gap.next_command() {
            debug!("Queueing HCI command {:#06x}", command.opcode());
            self.backlog.push_back(Outgoing::Packet(TxPacket::from(command)));
        }
        while let Some(event) = self.gap.poll_event() {
            self.emit(HostEvent::Gap(event));
        }
        while let Some(item) = self.backlog.pop_front() {
            match self.outbound.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(item)) => {
                    self.backlog.push_front(item);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    warn!("Write loop gone, dropping {} queued items", self.backlog.len() + 1);
                    self.backlog.clear();
                    break;
                }
            }
        }
    }

    fn connected_handle(&self) -> Result<u16, HostError> {
        self.gap.conn_handle().ok_or(HostError::NotConnected)
    }

    fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::StartAdvertising {
                params,
                adv_data,
                scan_rsp,
                reply,
            } => answer(
                reply,
                self.gap
                    .start_advertising(&params, &adv_data, &scan_rsp)
                    .map_err(HostError::from),
            ),
            HostCommand::StopAdvertising { reply } => {
                answer(reply, self.gap.stop_advertising().map_err(HostError::from))
            }
            HostCommand::StartScanning { params, reply } => {
                answer(reply, self.gap.start_scanning(&params).map_err(HostError::from))
            }
            HostCommand::StopScanning { reply } => {
                answer(reply, self.gap.stop_scanning().map_err(HostError::from))
            }
            HostCommand::Connect { params, reply } => {
                answer(reply, self.gap.connect(&params).map_err(HostError::from))
            }
            HostCommand::CancelConnect { reply } => {
                answer(reply, self.gap.cancel_connect().map_err(HostError::from))
            }
            HostCommand::Disconnect { reason, reply } => {
                answer(reply, self.gap.disconnect(reason).map_err(HostError::from))
            }
            HostCommand::RequestPhyUpdate { pref, reply } => {
                answer(reply, self.gap.request_phy_update(&pref).map_err(HostError::from))
            }
            HostCommand::RequestDataLength {
                tx_octets,
                tx_time,
                reply,
            } => answer(
                reply,
                self.gap
                    .request_data_length(tx_octets, tx_time)
                    .map_err(HostError::from),
            ),
            HostCommand::Notify {
                service,
                characteristic,
                value,
                reply,
            } => {
                let result = self.connected_handle().and_then(|conn| {
                    let pdu = self
                        .server
                        .notification(&service, &characteristic, &value, &mut self.rsp_buf)?
                        .map(<[u8]>::to_vec);
                    Ok((conn, pdu))
                });
                answer(reply, self.send_value(result));
            }
            HostCommand::Indicate {
                service,
                characteristic,
                value,
                reply,
            } => {
                let result = self.connected_handle().and_then(|conn| {
                    let pdu = self
                        .server
                        .indication(&service, &characteristic, &value, &mut self.rsp_buf)?
                        .map(<[u8]>::to_vec);
                    Ok((conn, pdu))
                });
                answer(reply, self.send_value(result));
            }
            HostCommand::AttRequest { pdu, reply } => {
                let conn = match self.connected_handle() {
                    Ok(conn) => conn,
                    Err(e) => return answer(reply, Err(e)),
                };
                if self.pending_request.as_ref().is_some_and(|r| !r.is_closed()) {
                    return answer(reply, Err(HostError::RequestInFlight));
                }
                debug!("ATT request {:#04x?} to {:#06x}", pdu.first(), conn);
                self.queue_att(conn, pdu);
                self.pending_request = Some(reply);
            }
            HostCommand::AttCommand { pdu, reply } => {
                let result = self.connected_handle().map(|conn| self.queue_att(conn, pdu));
                answer(reply, result);
            }
            HostCommand::GetState { reply } => answer(reply, Ok(self.gap.state())),
            HostCommand::Shutdown => {}
        }
    }

    fn send_value(&mut self, encoded: Result<(u16, Option<Vec<u8>>), HostError>) -> Result<bool, HostError> {
        match encoded? {
            (conn, Some(pdu)) => {
                self.queue_att(conn, pdu);
                Ok(true)
            }
            (_, None) => Ok(false),
        }
    }

    fn process_packet(&mut self, packet: &[u8]) {
        match packet.first() {
            Some(&EVENT_INDICATOR) => match event::decode(&packet[1..]) {
                Some(event) => self.handle_event(&event),
                None => warn!("Malformed HCI event ({} bytes)", packet.len()),
            },
            Some(&ACL_INDICATOR) => {
                let (Some(header), Some(payload)) = (acl::parse_header(packet), acl::payload(packet)) else {
                    warn!("Malformed ACL packet ({} bytes)", packet.len());
                    return;
                };
                if let Some(sdu) = self.reassembler.feed(&header, payload) {
                    self.handle_sdu(sdu);
                }
            }
            other => warn!("Unexpected HCI packet indicator {:#04x?}", other),
        }
    }

    fn handle_event(&mut self, event: &Event<'_>) {
        debug!("HCI event: {:?}", event);
        match event {
            Event::CommandComplete {
                opcode: hci_opcodes::LE_READ_BUFFER_SIZE,
                return_params,
                ..
            } => match LeBufferSize::parse(return_params) {
                Some(size) if size.status == STATUS_SUCCESS => {
                    self.shared.set_buffer_size(size.acl_data_len, size.total_packets as u16)
                }
                Some(size) => warn!("LE Read Buffer Size failed: status {:#04x}", size.status),
                None => warn!("Short LE Read Buffer Size response"),
            },
            Event::CommandComplete { opcode, .. } => {
                if let Some(status) = event.status().filter(|s| *s != STATUS_SUCCESS) {
                    warn!("Command {:#06x} failed: status {:#04x}", opcode, status);
                }
            }
            Event::CommandStatus { status, opcode, .. } if *status != STATUS_SUCCESS => {
                warn!("Command {:#06x} rejected: status {:#04x}", opcode, status);
            }
            Event::NumberOfCompletedPackets(completed) => self.shared.replenish(completed.total()),
            Event::DisconnectionComplete { conn_handle, .. } => {
                debug!("Clearing link state for {:#06x}", conn_handle);
                self.reassembler.reset();
                self.server.on_disconnect();
                self.shared.restore_credits();
                if let Some(reply) = self.pending_request.take() {
                    answer(reply, Err(HostError::NotConnected));
                }
            }
            Event::HardwareError { code } => error!("Controller hardware error {:#04x}", code),
            _ => {}
        }
        self.gap.handle_event(event);
    }

    fn handle_sdu(&mut self, sdu: Sdu) {
        match sdu.cid {
            CID_ATT => self.handle_att(sdu.conn_handle, &sdu.data),
            CID_SMP => {
                debug!("Rejecting SMP request from {:#06x}", sdu.conn_handle);
                self.queue(Outgoing::Sdu {
                    conn_handle: sdu.conn_handle,
                    cid: CID_SMP,
                    payload: SMP_PAIRING_NOT_SUPPORTED.to_vec(),
                });
            }
            CID_LE_SIGNALING => debug!("Ignoring LE signaling packet ({} bytes)", sdu.data.len()),
            other => debug!("Dropping SDU for unknown channel {:#06x}", other),
        }
    }

    fn handle_att(&mut self, conn_handle: u16, data: &[u8]) {
        let Some(&opcode) = data.first() else {
            return;
        };

        if is_att_response(opcode) {
            if opcode == opcodes::EXCHANGE_MTU_RSP && data.len() >= 3 {
                self.server.set_mtu(u16::from_le_bytes([data[1], data[2]]));
            }
            match self.pending_request.take() {
                Some(reply) => answer(reply, Ok(data.to_vec())),
                None => warn!("Unsolicited ATT response {:#04x}", opcode),
            }
            return;
        }

        match opcode {
            opcodes::HANDLE_VALUE_NTF | opcodes::HANDLE_VALUE_IND if data.len() >= 3 => {
                let handle = u16::from_le_bytes([data[1], data[2]]);
                let value = data[3..].to_vec();
                if opcode == opcodes::HANDLE_VALUE_NTF {
                    self.emit(HostEvent::Notification {
                        conn_handle,
                        handle,
                        value,
                    });
                    return;
                }
                let mut cfm = [0u8; 1];
                if let Ok(pdu) = pdu::handle_value_confirmation(&mut cfm) {
                    self.queue_att(conn_handle, pdu.to_vec());
                }
                self.emit(HostEvent::Indication {
                    conn_handle,
                    handle,
                    value,
                });
                return;
            }
            _ => {}
        }

        match self.server.prepare(conn_handle, data, &mut self.rsp_buf) {
            Prepared::Reply(len) => {
                let payload = self.rsp_buf[..len].to_vec();
                self.queue_att(conn_handle, payload);
            }
            Prepared::Silent => {}
            Prepared::Deferred(access) => {
                let outbound = self.outbound.clone();
                self.runtime.spawn_blocking(move || {
                    let mut buf = [0u8; MAX_MTU as usize];
                    let conn_handle = access.conn_handle();
                    let Some(rsp) = access.run(&mut buf) else {
                        return;
                    };
                    let item = Outgoing::Sdu {
                        conn_handle,
                        cid: CID_ATT,
                        payload: rsp.to_vec(),
                    };
                    if outbound.blocking_send(item).is_err() {
                        debug!("Write loop gone, dropping handler response");
                    }
                });
            }
        }
    }
}
