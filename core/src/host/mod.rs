//! Host coordinator
//!
//! [`Host::start`] takes ownership of a transport and a [`GattServer`] and
//! runs two loops on tokio's blocking pool:
//!
//! - the read loop polls the transport, frames HCI packets, reassembles
//!   L2CAP SDUs and dispatches them to GAP, the GATT server or a waiting
//!   client request. It is the only owner of GAP and GATT state; the
//!   application reaches that state through [`HostHandle`] commands.
//! - the write loop drains the outbound queue in FIFO order, fragmenting
//!   SDUs to the controller's ACL data length and waiting for buffer credits.
//!
//! Characteristic handlers run as their own blocking tasks and post their
//! responses straight into the outbound queue, so responses may leave in a
//! different order than their requests arrived.

mod dispatch;
pub mod memory;
pub mod transport;
mod writer;

use crate::att::pdu::{self, opcodes, MAX_MTU};
use crate::att::{uuid, AttErrorCode, Uuid};
use crate::config::HostConfig;
use crate::gap::{GapEvent, GapState};
use crate::gatt::{
    parse_chars_from_response, parse_descriptors_from_response, parse_services_from_response,
    AttResponse, DiscoveredCharacteristic, DiscoveredDescriptor, DiscoveredService, GattServer,
};
use crate::hci::{
    AdvertisingParameters, Command, ConnectionParameters, PhyPreference, ScanParameters,
    ACL_INDICATOR, COMMAND_INDICATOR,
};
use crate::HostError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

pub use memory::{ControllerEnd, MemoryTransport};
pub use transport::{PollFlags, Transport, TransportError};

/// How long a client request waits for the peer's response
pub const ATT_TIMEOUT: Duration = Duration::from_secs(30);

const PRIMARY_SERVICE_TYPE: u16 = 0x2800;

/// An outgoing HCI packet, indicator byte included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPacket(Vec<u8>);

impl TxPacket {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn is_command(&self) -> bool {
        self.0.first() == Some(&COMMAND_INDICATOR)
    }

    pub fn is_acl_data(&self) -> bool {
        self.0.first() == Some(&ACL_INDICATOR)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Command> for TxPacket {
    fn from(command: Command) -> Self {
        Self(command.to_bytes())
    }
}

/// Item queued for the write loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// A complete HCI packet
    Packet(TxPacket),
    /// An L2CAP payload, fragmented by the write loop
    Sdu {
        conn_handle: u16,
        cid: u16,
        payload: Vec<u8>,
    },
}

/// Events delivered to the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostEvent {
    Gap(GapEvent),
    /// Handle Value Notification from the peer's GATT server
    Notification {
        conn_handle: u16,
        handle: u16,
        value: Vec<u8>,
    },
    /// Handle Value Indication from the peer; already confirmed
    Indication {
        conn_handle: u16,
        handle: u16,
        value: Vec<u8>,
    },
}

type Reply<T> = mpsc::Sender<Result<T, HostError>>;

/// Commands sent from [`HostHandle`] to the read loop
pub(crate) enum HostCommand {
    StartAdvertising {
        params: AdvertisingParameters,
        adv_data: Vec<u8>,
        scan_rsp: Vec<u8>,
        reply: Reply<()>,
    },
    StopAdvertising {
        reply: Reply<()>,
    },
    StartScanning {
        params: ScanParameters,
        reply: Reply<()>,
    },
    StopScanning {
        reply: Reply<()>,
    },
    Connect {
        params: ConnectionParameters,
        reply: Reply<()>,
    },
    CancelConnect {
        reply: Reply<()>,
    },
    Disconnect {
        reason: u8,
        reply: Reply<()>,
    },
    RequestPhyUpdate {
        pref: PhyPreference,
        reply: Reply<()>,
    },
    RequestDataLength {
        tx_octets: u16,
        tx_time: u16,
        reply: Reply<()>,
    },
    /// Reply is false when the peer has not subscribed
    Notify {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        reply: Reply<bool>,
    },
    Indicate {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        reply: Reply<bool>,
    },
    /// ATT request expecting one response PDU
    AttRequest {
        pdu: Vec<u8>,
        reply: Reply<Vec<u8>>,
    },
    /// ATT command without response
    AttCommand {
        pdu: Vec<u8>,
        reply: Reply<()>,
    },
    GetState {
        reply: Reply<GapState>,
    },
    Shutdown,
}

/// Cloneable handle to a running host
#[derive(Clone)]
pub struct HostHandle {
    command_tx: mpsc::Sender<HostCommand>,
}

impl HostHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> HostCommand) -> Result<T, HostError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| HostError::NotRunning)?;
        reply_rx.recv().await.ok_or(HostError::NotRunning)?
    }

    pub async fn start_advertising(
        &self,
        params: AdvertisingParameters,
        adv_data: &[u8],
        scan_rsp: &[u8],
    ) -> Result<(), HostError> {
        let (adv_data, scan_rsp) = (adv_data.to_vec(), scan_rsp.to_vec());
        self.request(|reply| HostCommand::StartAdvertising {
            params,
            adv_data,
            scan_rsp,
            reply,
        })
        .await
    }

    pub async fn stop_advertising(&self) -> Result<(), HostError> {
        self.request(|reply| HostCommand::StopAdvertising { reply }).await
    }

    pub async fn start_scanning(&self, params: ScanParameters) -> Result<(), HostError> {
        self.request(|reply| HostCommand::StartScanning { params, reply })
            .await
    }

    pub async fn stop_scanning(&self) -> Result<(), HostError> {
        self.request(|reply| HostCommand::StopScanning { reply }).await
    }

    pub async fn connect(&self, params: ConnectionParameters) -> Result<(), HostError> {
        self.request(|reply| HostCommand::Connect { params, reply }).await
    }

    pub async fn cancel_connect(&self) -> Result<(), HostError> {
        self.request(|reply| HostCommand::CancelConnect { reply }).await
    }

    pub async fn disconnect(&self, reason: u8) -> Result<(), HostError> {
        self.request(|reply| HostCommand::Disconnect { reason, reply })
            .await
    }

    pub async fn request_phy_update(&self, pref: PhyPreference) -> Result<(), HostError> {
        self.request(|reply| HostCommand::RequestPhyUpdate { pref, reply })
            .await
    }

    pub async fn request_data_length(&self, tx_octets: u16, tx_time: u16) -> Result<(), HostError> {
        self.request(|reply| HostCommand::RequestDataLength {
            tx_octets,
            tx_time,
            reply,
        })
        .await
    }

    /// Current GAP state
    pub async fn state(&self) -> Result<GapState, HostError> {
        self.request(|reply| HostCommand::GetState { reply }).await
    }

    /// Notify the peer; `Ok(false)` when it has not subscribed
    pub async fn notify(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<bool, HostError> {
        let value = value.to_vec();
        self.request(|reply| HostCommand::Notify {
            service,
            characteristic,
            value,
            reply,
        })
        .await
    }

    /// Indicate to the peer; fails while a previous indication is unconfirmed
    pub async fn indicate(&self, service: Uuid, characteristic: Uuid, value: &[u8]) -> Result<bool, HostError> {
        let value = value.to_vec();
        self.request(|reply| HostCommand::Indicate {
            service,
            characteristic,
            value,
            reply,
        })
        .await
    }

    /// Send a raw ATT request and wait for the response PDU
    pub async fn att_request(&self, pdu: Vec<u8>) -> Result<Vec<u8>, HostError> {
        tokio::time::timeout(ATT_TIMEOUT, self.request(|reply| HostCommand::AttRequest { pdu, reply }))
            .await
            .map_err(|_| HostError::Timeout)?
    }

    async fn transact(&self, pdu: Vec<u8>, expected: u8) -> Result<Vec<u8>, HostError> {
        let rsp = self.att_request(pdu).await?;
        let parsed = AttResponse::from_pdu(&rsp);
        if let Some(code) = parsed.err {
            return Err(HostError::AttResponse(code));
        }
        if parsed.opcode != expected {
            return Err(HostError::UnexpectedResponse(parsed.opcode));
        }
        Ok(rsp)
    }

    /// Exchange MTUs with the peer; returns the MTU now in effect
    pub async fn exchange_mtu(&self, mtu: u16) -> Result<u16, HostError> {
        let mut buf = [0u8; 3];
        let pdu = pdu::exchange_mtu_request(&mut buf, mtu)?.to_vec();
        let rsp = self.transact(pdu, opcodes::EXCHANGE_MTU_RSP).await?;
        let server_mtu = match rsp.get(1..3) {
            Some(b) => u16::from_le_bytes([b[0], b[1]]),
            None => return Err(HostError::AttResponse(AttErrorCode::InvalidPdu)),
        };
        Ok(crate::att::clamp_mtu(server_mtu).min(crate::att::clamp_mtu(mtu)))
    }

    /// Discover primary services into `out`, paging from handle 1
    pub async fn discover_services(&self, out: &mut [DiscoveredService]) -> Result<usize, HostError> {
        let mut buf = [0u8; 32];
        let mut start = 1u16;
        let mut found = 0;
        while found < out.len() {
            let pdu = pdu::read_by_group_type_request(&mut buf, start, 0xFFFF, &uuid::PRIMARY_SERVICE)?.to_vec();
            let rsp = match self.transact(pdu, opcodes::READ_BY_GROUP_TYPE_RSP).await {
                Ok(rsp) => rsp,
                Err(HostError::AttResponse(AttErrorCode::AttributeNotFound)) => break,
                Err(e) => return Err(e),
            };
            let n = parse_services_from_response(&AttResponse::from_pdu(&rsp), &mut out[found..]);
            if n == 0 {
                break;
            }
            let last_end = out[found + n - 1].end_handle;
            found += n;
            if last_end == 0xFFFF || last_end < start {
                break;
            }
            start = last_end + 1;
        }
        Ok(found)
    }

    /// Locate a primary service by UUID; returns its handle range
    pub async fn find_service(&self, service: &Uuid) -> Result<Option<(u16, u16)>, HostError> {
        let mut value = [0u8; 16];
        let len = service.write_to(&mut value).unwrap_or(0);
        let mut buf = [0u8; 32];
        let pdu = pdu::find_by_type_value_request(&mut buf, 1, 0xFFFF, PRIMARY_SERVICE_TYPE, &value[..len])?
            .to_vec();
        match self.transact(pdu, opcodes::FIND_BY_TYPE_VALUE_RSP).await {
            Ok(rsp) if rsp.len() >= 5 => Ok(Some((
                u16::from_le_bytes([rsp[1], rsp[2]]),
                u16::from_le_bytes([rsp[3], rsp[4]]),
            ))),
            Ok(_) => Err(HostError::AttResponse(AttErrorCode::InvalidPdu)),
            Err(HostError::AttResponse(AttErrorCode::AttributeNotFound)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Discover the characteristics declared inside `service`
    pub async fn discover_characteristics(
        &self,
        service: &DiscoveredService,
        out: &mut [DiscoveredCharacteristic],
    ) -> Result<usize, HostError> {
        let mut buf = [0u8; 32];
        let mut start = service.start_handle;
        let mut found = 0;
        while found < out.len() && start <= service.end_handle {
            let pdu = pdu::read_by_type_request(&mut buf, start, service.end_handle, &uuid::CHARACTERISTIC)?.to_vec();
            let rsp = match self.transact(pdu, opcodes::READ_BY_TYPE_RSP).await {
                Ok(rsp) => rsp,
                Err(HostError::AttResponse(AttErrorCode::AttributeNotFound)) => break,
                Err(e) => return Err(e),
            };
            let n = parse_chars_from_response(&AttResponse::from_pdu(&rsp), &mut out[found..]);
            if n == 0 {
                break;
            }
            let last = out[found + n - 1].decl_handle;
            found += n;
            if last == 0xFFFF || last < start {
                break;
            }
            start = last + 1;
        }
        Ok(found)
    }

    /// Discover descriptors in `[start, end]`
    pub async fn discover_descriptors(
        &self,
        start: u16,
        end: u16,
        out: &mut [DiscoveredDescriptor],
    ) -> Result<usize, HostError> {
        let mut buf = [0u8; 8];
        let mut next = start;
        let mut found = 0;
        while found < out.len() && next <= end {
            let pdu = pdu::find_information_request(&mut buf, next, end)?.to_vec();
            let rsp = match self.transact(pdu, opcodes::FIND_INFORMATION_RSP).await {
                Ok(rsp) => rsp,
                Err(HostError::AttResponse(AttErrorCode::AttributeNotFound)) => break,
                Err(e) => return Err(e),
            };
            let n = parse_descriptors_from_response(&AttResponse::from_pdu(&rsp), &mut out[found..]);
            if n == 0 {
                break;
            }
            let last = out[found + n - 1].handle;
            found += n;
            if last == 0xFFFF || last < next {
                break;
            }
            next = last + 1;
        }
        Ok(found)
    }

    /// Read a remote attribute value
    pub async fn read(&self, handle: u16) -> Result<Vec<u8>, HostError> {
        let mut buf = [0u8; 3];
        let pdu = pdu::read_request(&mut buf, handle)?.to_vec();
        let mut rsp = self.transact(pdu, opcodes::READ_RSP).await?;
        rsp.remove(0);
        Ok(rsp)
    }

    /// Read a remote attribute value starting at `offset`
    pub async fn read_blob(&self, handle: u16, offset: u16) -> Result<Vec<u8>, HostError> {
        let mut buf = [0u8; 5];
        let pdu = pdu::read_blob_request(&mut buf, handle, offset)?.to_vec();
        let mut rsp = self.transact(pdu, opcodes::READ_BLOB_RSP).await?;
        rsp.remove(0);
        Ok(rsp)
    }

    /// Write a remote attribute and wait for the Write Response
    pub async fn write(&self, handle: u16, value: &[u8]) -> Result<(), HostError> {
        let mut buf = [0u8; MAX_MTU as usize];
        let pdu = pdu::write_request(&mut buf, handle, value)?.to_vec();
        self.transact(pdu, opcodes::WRITE_RSP).await?;
        Ok(())
    }

    /// Write a remote attribute without response
    pub async fn write_without_response(&self, handle: u16, value: &[u8]) -> Result<(), HostError> {
        let mut buf = [0u8; MAX_MTU as usize];
        let pdu = pdu::write_command(&mut buf, handle, value)?.to_vec();
        self.request(|reply| HostCommand::AttCommand { pdu, reply }).await
    }

    /// Stop the read loop; the write loop follows once the queue drains
    pub async fn shutdown(&self) -> Result<(), HostError> {
        self.command_tx
            .send(HostCommand::Shutdown)
            .await
            .map_err(|_| HostError::NotRunning)
    }
}

/// Entry point for running a host over a transport
pub struct Host;

impl Host {
    /// Queue the controller initialisation sequence and start both loops.
    /// Must be called from within a tokio runtime.
    pub fn start<const N: usize>(
        transport: Arc<dyn Transport>,
        server: GattServer<N>,
        config: HostConfig,
    ) -> Result<(HostHandle, mpsc::Receiver<HostEvent>), HostError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| HostError::NoRuntime)?;

        let (command_tx, command_rx) = mpsc::channel(config.command_queue_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity);
        let shared = Arc::new(writer::Shared::new(config.acl_mtu));

        let mut dispatcher = dispatch::Dispatcher::new(
            transport.clone(),
            server.with_local_mtu(config.att_mtu),
            &config,
            shared.clone(),
            outbound_tx,
            event_tx,
            runtime.clone(),
        );
        dispatcher.init()?;

        let timeout_ms = config.poll_timeout_ms;
        runtime.spawn_blocking(move || writer::run_write_loop(transport, outbound_rx, shared, timeout_ms));
        runtime.spawn_blocking(move || dispatcher.run(command_rx));
        info!("BLE host started");

        Ok((HostHandle { command_tx }, event_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_packet_classification() {
        let command = TxPacket::from(Command::reset());
        assert!(command.is_command());
        assert!(!command.is_acl_data());
        assert_eq!(command.as_bytes(), &[0x01, 0x03, 0x0C, 0x00]);

        let acl = TxPacket::new(vec![0x02, 0x40, 0x20, 0x00, 0x00]);
        assert!(acl.is_acl_data());
        assert!(!acl.is_command());

        assert!(!TxPacket::new(Vec::new()).is_command());
    }

    #[test]
    fn test_start_requires_runtime() {
        let (transport, _controller) = MemoryTransport::pair();
        let server = GattServer::<4>::new(&[]).expect("Empty server");
        let result = Host::start(Arc::new(transport), server, HostConfig::default());
        assert!(matches!(result, Err(HostError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_handle_reports_not_running_after_shutdown() {
        let (transport, controller) = MemoryTransport::pair();
        let server = GattServer::<4>::new(&[]).expect("Empty server");
        let (handle, _events) =
            Host::start(Arc::new(transport), server, HostConfig::default()).expect("Start host");
        handle.shutdown().await.expect("Shutdown");
        assert!(matches!(handle.state().await, Err(HostError::NotRunning)));
        controller.close();
    }

    #[tokio::test]
    async fn test_transient_read_error_keeps_host_running() {
        use crate::host::transport::{MockTransport, PollFlags, TransportError};
        use std::sync::atomic::{AtomicBool, Ordering};

        let failed = Arc::new(AtomicBool::new(false));
        let mut mock = MockTransport::new();
        mock.expect_poll().returning(|flags: PollFlags, _| {
            std::thread::sleep(Duration::from_millis(1));
            flags
        });
        mock.expect_write().returning(|buf| Ok(buf.len()));
        let flag = failed.clone();
        mock.expect_read().returning(move |_| {
            if flag.swap(true, Ordering::SeqCst) {
                Err(TransportError::WouldBlock)
            } else {
                Err(TransportError::Hci("transient".into()))
            }
        });

        let server = GattServer::<4>::new(&[]).expect("Empty server");
        let (handle, _events) =
            Host::start(Arc::new(mock), server, HostConfig::default()).expect("Start host");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(failed.load(Ordering::SeqCst));
        assert_eq!(handle.state().await.expect("Host still running"), GapState::Idle);
        handle.shutdown().await.expect("Shutdown");
    }
}
