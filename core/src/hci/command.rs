//! HCI command encoding
//!
//! Every command is framed as `[0x01][opcode_lo][opcode_hi][len][params]`
//! where `opcode = (OGF << 10) | OCF`. Parameter layouts follow Bluetooth Core
//! Vol 4 Part E §7.

use super::HciError;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Packet indicator for HCI command packets
pub const COMMAND_INDICATOR: u8 = 0x01;

/// Indicator + opcode + parameter length
pub const COMMAND_HEADER_LEN: usize = 4;

/// Maximum parameter length of a single command
pub const MAX_PARAMS_LEN: usize = 255;

/// Maximum legacy advertising / scan response payload
pub const MAX_ADVERTISING_DATA_LEN: usize = 31;

/// Default event mask: Disconnection Complete, Hardware Error,
/// Data Buffer Overflow and LE Meta events.
pub const DEFAULT_EVENT_MASK: u64 = (1 << 4) | (1 << 15) | (1 << 25) | (1 << 61);

/// Default LE event mask: Connection Complete, Advertising Report,
/// Connection Update Complete, Data Length Change and PHY Update Complete.
pub const DEFAULT_LE_EVENT_MASK: u64 = (1 << 0) | (1 << 1) | (1 << 2) | (1 << 6) | (1 << 11);

/// Build an opcode from its group and command fields
pub const fn make_opcode(ogf: u16, ocf: u16) -> u16 {
    (ogf << 10) | (ocf & 0x03FF)
}

/// Opcodes of the commands this host issues
pub mod opcodes {
    use super::make_opcode;

    const OGF_LINK_CONTROL: u16 = 0x01;
    const OGF_CONTROLLER: u16 = 0x03;
    const OGF_INFORMATIONAL: u16 = 0x04;
    const OGF_LE: u16 = 0x08;

    pub const DISCONNECT: u16 = make_opcode(OGF_LINK_CONTROL, 0x0006);
    pub const SET_EVENT_MASK: u16 = make_opcode(OGF_CONTROLLER, 0x0001);
    pub const RESET: u16 = make_opcode(OGF_CONTROLLER, 0x0003);
    pub const READ_LOCAL_VERSION: u16 = make_opcode(OGF_INFORMATIONAL, 0x0001);
    pub const READ_BD_ADDR: u16 = make_opcode(OGF_INFORMATIONAL, 0x0009);
    pub const LE_SET_EVENT_MASK: u16 = make_opcode(OGF_LE, 0x0001);
    pub const LE_READ_BUFFER_SIZE: u16 = make_opcode(OGF_LE, 0x0002);
    pub const LE_SET_RANDOM_ADDRESS: u16 = make_opcode(OGF_LE, 0x0005);
    pub const LE_SET_ADVERTISING_PARAMETERS: u16 = make_opcode(OGF_LE, 0x0006);
    pub const LE_SET_ADVERTISING_DATA: u16 = make_opcode(OGF_LE, 0x0008);
    pub const LE_SET_SCAN_RESPONSE_DATA: u16 = make_opcode(OGF_LE, 0x0009);
    pub const LE_SET_ADVERTISING_ENABLE: u16 = make_opcode(OGF_LE, 0x000A);
    pub const LE_SET_SCAN_PARAMETERS: u16 = make_opcode(OGF_LE, 0x000B);
    pub const LE_SET_SCAN_ENABLE: u16 = make_opcode(OGF_LE, 0x000C);
    pub const LE_CREATE_CONNECTION: u16 = make_opcode(OGF_LE, 0x000D);
    pub const LE_CREATE_CONNECTION_CANCEL: u16 = make_opcode(OGF_LE, 0x000E);
    pub const LE_SET_DATA_LENGTH: u16 = make_opcode(OGF_LE, 0x0022);
    pub const LE_WRITE_SUGGESTED_DEFAULT_DATA_LENGTH: u16 = make_opcode(OGF_LE, 0x0024);
    pub const LE_READ_PHY: u16 = make_opcode(OGF_LE, 0x0030);
    pub const LE_SET_PHY: u16 = make_opcode(OGF_LE, 0x0032);
}

/// Write a command packet into `buf`.
///
/// Returns the encoded slice, or an error when the parameters exceed 255
/// bytes or the buffer cannot hold the packet.
pub fn encode<'a>(buf: &'a mut [u8], opcode: u16, params: &[u8]) -> Result<&'a [u8], HciError> {
    if params.len() > MAX_PARAMS_LEN {
        return Err(HciError::ParamsTooLong(params.len()));
    }
    let total = COMMAND_HEADER_LEN + params.len();
    if buf.len() < total {
        return Err(HciError::BufferTooSmall {
            needed: total,
            available: buf.len(),
        });
    }
    buf[0] = COMMAND_INDICATOR;
    buf[1..3].copy_from_slice(&opcode.to_le_bytes());
    buf[3] = params.len() as u8;
    buf[COMMAND_HEADER_LEN..total].copy_from_slice(params);
    Ok(&buf[..total])
}

/// Advertising PDU type for LE Set Advertising Parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AdvertisingType {
    /// ADV_IND
    ConnectableUndirected = 0x00,
    /// ADV_DIRECT_IND (high duty cycle)
    ConnectableDirected = 0x01,
    /// ADV_SCAN_IND
    ScannableUndirected = 0x02,
    /// ADV_NONCONN_IND
    NonConnectableUndirected = 0x03,
}

/// Parameters of LE Set Advertising Parameters (§7.8.5)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisingParameters {
    /// Minimum interval in 0.625 ms units
    pub interval_min: u16,
    /// Maximum interval in 0.625 ms units
    pub interval_max: u16,
    pub advertising_type: AdvertisingType,
    pub own_address_type: u8,
    pub peer_address_type: u8,
    pub peer_address: [u8; 6],
    /// Bit 0..2 select channels 37, 38, 39
    pub channel_map: u8,
    pub filter_policy: u8,
}

impl Default for AdvertisingParameters {
    fn default() -> Self {
        Self {
            interval_min: 0x0800,
            interval_max: 0x0800,
            advertising_type: AdvertisingType::ConnectableUndirected,
            own_address_type: 0x00,
            peer_address_type: 0x00,
            peer_address: [0; 6],
            channel_map: 0x07,
            filter_policy: 0x00,
        }
    }
}

impl AdvertisingParameters {
    /// Set the advertising interval range (0.625 ms units)
    pub fn with_interval(mut self, min: u16, max: u16) -> Self {
        self.interval_min = min;
        self.interval_max = max;
        self
    }

    /// Set the advertising PDU type
    pub fn with_type(mut self, advertising_type: AdvertisingType) -> Self {
        self.advertising_type = advertising_type;
        self
    }

    fn to_params(&self) -> [u8; 15] {
        let mut p = [0u8; 15];
        p[0..2].copy_from_slice(&self.interval_min.to_le_bytes());
        p[2..4].copy_from_slice(&self.interval_max.to_le_bytes());
        p[4] = self.advertising_type as u8;
        p[5] = self.own_address_type;
        p[6] = self.peer_address_type;
        p[7..13].copy_from_slice(&self.peer_address);
        p[13] = self.channel_map;
        p[14] = self.filter_policy;
        p
    }
}

/// Parameters of LE Set Scan Parameters (§7.8.10)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanParameters {
    /// Active scanning sends scan requests
    pub active: bool,
    /// Scan interval in 0.625 ms units
    pub interval: u16,
    /// Scan window in 0.625 ms units
    pub window: u16,
    pub own_address_type: u8,
    pub filter_policy: u8,
    /// Ask the controller to drop duplicate reports
    pub filter_duplicates: bool,
}

impl Default for ScanParameters {
    fn default() -> Self {
        Self {
            active: false,
            interval: 0x0010,
            window: 0x0010,
            own_address_type: 0x00,
            filter_policy: 0x00,
            filter_duplicates: true,
        }
    }
}

impl ScanParameters {
    fn to_params(&self) -> [u8; 7] {
        let mut p = [0u8; 7];
        p[0] = self.active as u8;
        p[1..3].copy_from_slice(&self.interval.to_le_bytes());
        p[3..5].copy_from_slice(&self.window.to_le_bytes());
        p[5] = self.own_address_type;
        p[6] = self.filter_policy;
        p
    }
}

/// Parameters of LE Create Connection (§7.8.12)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    pub scan_interval: u16,
    pub scan_window: u16,
    pub initiator_filter_policy: u8,
    pub peer_address_type: u8,
    pub peer_address: [u8; 6],
    pub own_address_type: u8,
    /// Connection interval bounds in 1.25 ms units
    pub interval_min: u16,
    pub interval_max: u16,
    pub max_latency: u16,
    /// Supervision timeout in 10 ms units
    pub supervision_timeout: u16,
    pub min_ce_length: u16,
    pub max_ce_length: u16,
}

impl ConnectionParameters {
    /// Connection parameters for a peer with sensible defaults
    /// (30-50 ms interval, 4 s supervision timeout)
    pub fn new(peer_address_type: u8, peer_address: [u8; 6]) -> Self {
        Self {
            scan_interval: 0x0060,
            scan_window: 0x0030,
            initiator_filter_policy: 0x00,
            peer_address_type,
            peer_address,
            own_address_type: 0x00,
            interval_min: 0x0018,
            interval_max: 0x0028,
            max_latency: 0,
            supervision_timeout: 0x0190,
            min_ce_length: 0,
            max_ce_length: 0,
        }
    }

    fn to_params(&self) -> [u8; 25] {
        let mut p = [0u8; 25];
        p[0..2].copy_from_slice(&self.scan_interval.to_le_bytes());
        p[2..4].copy_from_slice(&self.scan_window.to_le_bytes());
        p[4] = self.initiator_filter_policy;
        p[5] = self.peer_address_type;
        p[6..12].copy_from_slice(&self.peer_address);
        p[12] = self.own_address_type;
        p[13..15].copy_from_slice(&self.interval_min.to_le_bytes());
        p[15..17].copy_from_slice(&self.interval_max.to_le_bytes());
        p[17..19].copy_from_slice(&self.max_latency.to_le_bytes());
        p[19..21].copy_from_slice(&self.supervision_timeout.to_le_bytes());
        p[21..23].copy_from_slice(&self.min_ce_length.to_le_bytes());
        p[23..25].copy_from_slice(&self.max_ce_length.to_le_bytes());
        p
    }
}

bitflags! {
    /// PHY selection bits used by LE Set PHY
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PhyMask: u8 {
        const LE_1M = 0x01;
        const LE_2M = 0x02;
        const LE_CODED = 0x04;
    }
}

/// Preferred PHYs for LE Set PHY (§7.8.49). An empty mask means
/// "no preference" for that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhyPreference {
    pub tx: PhyMask,
    pub rx: PhyMask,
    /// Coded PHY option (0 = none, 1 = S=2, 2 = S=8)
    pub coded_option: u16,
}

impl PhyPreference {
    /// Prefer the 2M PHY in both directions
    pub fn le_2m() -> Self {
        Self {
            tx: PhyMask::LE_2M,
            rx: PhyMask::LE_2M,
            coded_option: 0,
        }
    }

    /// Prefer the Coded PHY in both directions
    pub fn le_coded(coded_option: u16) -> Self {
        Self {
            tx: PhyMask::LE_CODED,
            rx: PhyMask::LE_CODED,
            coded_option,
        }
    }

    fn all_phys(&self) -> u8 {
        let mut all = 0;
        if self.tx.is_empty() {
            all |= 0x01;
        }
        if self.rx.is_empty() {
            all |= 0x02;
        }
        all
    }
}

fn disconnect_params(conn_handle: u16, reason: u8) -> [u8; 3] {
    let h = conn_handle.to_le_bytes();
    [h[0], h[1], reason]
}

fn set_phy_params(conn_handle: u16, pref: &PhyPreference) -> [u8; 7] {
    let mut p = [0u8; 7];
    p[0..2].copy_from_slice(&conn_handle.to_le_bytes());
    p[2] = pref.all_phys();
    p[3] = pref.tx.bits();
    p[4] = pref.rx.bits();
    p[5..7].copy_from_slice(&pref.coded_option.to_le_bytes());
    p
}

fn data_length_params(conn_handle: u16, tx_octets: u16, tx_time: u16) -> [u8; 6] {
    let mut p = [0u8; 6];
    p[0..2].copy_from_slice(&conn_handle.to_le_bytes());
    p[2..4].copy_from_slice(&tx_octets.to_le_bytes());
    p[4..6].copy_from_slice(&tx_time.to_le_bytes());
    p
}

/// Advertising and scan response data travel in a fixed 32-byte block:
/// significant length followed by 31 zero-padded bytes.
fn advertising_data_params(data: &[u8]) -> Result<[u8; 32], HciError> {
    if data.len() > MAX_ADVERTISING_DATA_LEN {
        return Err(HciError::AdvertisingDataTooLong(data.len()));
    }
    let mut p = [0u8; 32];
    p[0] = data.len() as u8;
    p[1..1 + data.len()].copy_from_slice(data);
    Ok(p)
}

/// An owned HCI command, kept in queues until the write loop sends it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    opcode: u16,
    params: Vec<u8>,
}

impl Command {
    /// Create a command, rejecting parameters longer than 255 bytes
    pub fn new(opcode: u16, params: &[u8]) -> Result<Self, HciError> {
        if params.len() > MAX_PARAMS_LEN {
            return Err(HciError::ParamsTooLong(params.len()));
        }
        Ok(Self::fixed(opcode, params))
    }

    // Callers guarantee params.len() <= 255
    fn fixed(opcode: u16, params: &[u8]) -> Self {
        Self {
            opcode,
            params: params.to_vec(),
        }
    }

    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }

    /// Size of the framed packet in bytes
    pub fn encoded_len(&self) -> usize {
        COMMAND_HEADER_LEN + self.params.len()
    }

    /// Frame the command into a caller-supplied buffer
    pub fn encode<'a>(&self, buf: &'a mut [u8]) -> Result<&'a [u8], HciError> {
        encode(buf, self.opcode, &self.params)
    }

    /// Frame the command into a freshly allocated packet
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(COMMAND_INDICATOR);
        out.extend_from_slice(&self.opcode.to_le_bytes());
        out.push(self.params.len() as u8);
        out.extend_from_slice(&self.params);
        out
    }

    pub fn reset() -> Self {
        Self::fixed(opcodes::RESET, &[])
    }

    pub fn read_local_version() -> Self {
        Self::fixed(opcodes::READ_LOCAL_VERSION, &[])
    }

    pub fn read_bd_addr() -> Self {
        Self::fixed(opcodes::READ_BD_ADDR, &[])
    }

    pub fn set_event_mask(mask: u64) -> Self {
        Self::fixed(opcodes::SET_EVENT_MASK, &mask.to_le_bytes())
    }

    pub fn le_set_event_mask(mask: u64) -> Self {
        Self::fixed(opcodes::LE_SET_EVENT_MASK, &mask.to_le_bytes())
    }

    pub fn le_read_buffer_size() -> Self {
        Self::fixed(opcodes::LE_READ_BUFFER_SIZE, &[])
    }

    pub fn le_set_random_address(address: [u8; 6]) -> Self {
        Self::fixed(opcodes::LE_SET_RANDOM_ADDRESS, &address)
    }

    pub fn disconnect(conn_handle: u16, reason: u8) -> Self {
        Self::fixed(opcodes::DISCONNECT, &disconnect_params(conn_handle, reason))
    }

    pub fn le_set_advertising_parameters(params: &AdvertisingParameters) -> Self {
        Self::fixed(opcodes::LE_SET_ADVERTISING_PARAMETERS, &params.to_params())
    }

    pub fn le_set_advertising_data(data: &[u8]) -> Result<Self, HciError> {
        Ok(Self::fixed(
            opcodes::LE_SET_ADVERTISING_DATA,
            &advertising_data_params(data)?,
        ))
    }

    pub fn le_set_scan_response_data(data: &[u8]) -> Result<Self, HciError> {
        Ok(Self::fixed(
            opcodes::LE_SET_SCAN_RESPONSE_DATA,
            &advertising_data_params(data)?,
        ))
    }

    pub fn le_set_advertising_enable(enable: bool) -> Self {
        Self::fixed(opcodes::LE_SET_ADVERTISING_ENABLE, &[enable as u8])
    }

    pub fn le_set_scan_parameters(params: &ScanParameters) -> Self {
        Self::fixed(opcodes::LE_SET_SCAN_PARAMETERS, &params.to_params())
    }

    pub fn le_set_scan_enable(enable: bool, filter_duplicates: bool) -> Self {
        Self::fixed(
            opcodes::LE_SET_SCAN_ENABLE,
            &[enable as u8, filter_duplicates as u8],
        )
    }

    pub fn le_create_connection(params: &ConnectionParameters) -> Self {
        Self::fixed(opcodes::LE_CREATE_CONNECTION, &params.to_params())
    }

    pub fn le_create_connection_cancel() -> Self {
        Self::fixed(opcodes::LE_CREATE_CONNECTION_CANCEL, &[])
    }

    pub fn le_set_data_length(conn_handle: u16, tx_octets: u16, tx_time: u16) -> Self {
        Self::fixed(
            opcodes::LE_SET_DATA_LENGTH,
            &data_length_params(conn_handle, tx_octets, tx_time),
        )
    }

    pub fn le_write_suggested_default_data_length(tx_octets: u16, tx_time: u16) -> Self {
        let mut p = [0u8; 4];
        p[0..2].copy_from_slice(&tx_octets.to_le_bytes());
        p[2..4].copy_from_slice(&tx_time.to_le_bytes());
        Self::fixed(opcodes::LE_WRITE_SUGGESTED_DEFAULT_DATA_LENGTH, &p)
    }

    pub fn le_read_phy(conn_handle: u16) -> Self {
        Self::fixed(opcodes::LE_READ_PHY, &conn_handle.to_le_bytes())
    }

    pub fn le_set_phy(conn_handle: u16, pref: &PhyPreference) -> Self {
        Self::fixed(opcodes::LE_SET_PHY, &set_phy_params(conn_handle, pref))
    }
}

/// Command builders that write straight into a caller-supplied buffer.
///
/// No ownership is retained: each call frames one packet and returns the
/// slice of `buf` holding it.
pub mod commands {
    use super::*;

    pub fn reset(buf: &mut [u8]) -> Result<&[u8], HciError> {
        encode(buf, opcodes::RESET, &[])
    }

    pub fn disconnect(buf: &mut [u8], conn_handle: u16, reason: u8) -> Result<&[u8], HciError> {
        encode(buf, opcodes::DISCONNECT, &disconnect_params(conn_handle, reason))
    }

    pub fn set_event_mask(buf: &mut [u8], mask: u64) -> Result<&[u8], HciError> {
        encode(buf, opcodes::SET_EVENT_MASK, &mask.to_le_bytes())
    }

    pub fn le_set_event_mask(buf: &mut [u8], mask: u64) -> Result<&[u8], HciError> {
        encode(buf, opcodes::LE_SET_EVENT_MASK, &mask.to_le_bytes())
    }

    pub fn le_read_buffer_size(buf: &mut [u8]) -> Result<&[u8], HciError> {
        encode(buf, opcodes::LE_READ_BUFFER_SIZE, &[])
    }

    pub fn le_set_advertising_parameters<'a>(
        buf: &'a mut [u8],
        params: &AdvertisingParameters,
    ) -> Result<&'a [u8], HciError> {
        encode(buf, opcodes::LE_SET_ADVERTISING_PARAMETERS, &params.to_params())
    }

    pub fn le_set_advertising_data<'a>(
        buf: &'a mut [u8],
        data: &[u8],
    ) -> Result<&'a [u8], HciError> {
        encode(
            buf,
            opcodes::LE_SET_ADVERTISING_DATA,
            &advertising_data_params(data)?,
        )
    }

    pub fn le_set_advertising_enable(buf: &mut [u8], enable: bool) -> Result<&[u8], HciError> {
        encode(buf, opcodes::LE_SET_ADVERTISING_ENABLE, &[enable as u8])
    }

    pub fn le_set_scan_parameters<'a>(
        buf: &'a mut [u8],
        params: &ScanParameters,
    ) -> Result<&'a [u8], HciError> {
        encode(buf, opcodes::LE_SET_SCAN_PARAMETERS, &params.to_params())
    }

    pub fn le_set_scan_enable(
        buf: &mut [u8],
        enable: bool,
        filter_duplicates: bool,
    ) -> Result<&[u8], HciError> {
        encode(
            buf,
            opcodes::LE_SET_SCAN_ENABLE,
            &[enable as u8, filter_duplicates as u8],
        )
    }

    pub fn le_create_connection<'a>(
        buf: &'a mut [u8],
        params: &ConnectionParameters,
    ) -> Result<&'a [u8], HciError> {
        encode(buf, opcodes::LE_CREATE_CONNECTION, &params.to_params())
    }

    pub fn le_set_phy<'a>(
        buf: &'a mut [u8],
        conn_handle: u16,
        pref: &PhyPreference,
    ) -> Result<&'a [u8], HciError> {
        encode(buf, opcodes::LE_SET_PHY, &set_phy_params(conn_handle, pref))
    }

    pub fn le_set_data_length(
        buf: &mut [u8],
        conn_handle: u16,
        tx_octets: u16,
        tx_time: u16,
    ) -> Result<&[u8], HciError> {
        encode(
            buf,
            opcodes::LE_SET_DATA_LENGTH,
            &data_length_params(conn_handle, tx_octets, tx_time),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_packing() {
        assert_eq!(opcodes::DISCONNECT, 0x0406);
        assert_eq!(opcodes::RESET, 0x0C03);
        assert_eq!(opcodes::LE_SET_ADVERTISING_PARAMETERS, 0x2006);
        assert_eq!(opcodes::LE_CREATE_CONNECTION, 0x200D);
        assert_eq!(opcodes::LE_SET_DATA_LENGTH, 0x2022);
        assert_eq!(opcodes::LE_SET_PHY, 0x2032);
    }

    #[test]
    fn test_disconnect_packet_bytes() {
        let mut buf = [0u8; 16];
        let packet = commands::disconnect(&mut buf, 0x0040, 0x13).expect("Encode");
        assert_eq!(packet, &[0x01, 0x06, 0x04, 0x03, 0x40, 0x00, 0x13]);
    }

    #[test]
    fn test_reset_has_no_params() {
        let mut buf = [0u8; 4];
        let packet = commands::reset(&mut buf).expect("Encode");
        assert_eq!(packet, &[0x01, 0x03, 0x0C, 0x00]);
    }

    #[test]
    fn test_encode_rejects_long_params() {
        let mut buf = [0u8; 300];
        let params = [0u8; 256];
        assert_eq!(
            encode(&mut buf, opcodes::RESET, &params),
            Err(HciError::ParamsTooLong(256))
        );
    }

    #[test]
    fn test_encode_rejects_small_buffer() {
        let mut buf = [0u8; 5];
        let result = commands::disconnect(&mut buf, 0x0001, 0x13);
        assert_eq!(
            result,
            Err(HciError::BufferTooSmall {
                needed: 7,
                available: 5
            })
        );
    }

    #[test]
    fn test_owned_command_matches_buffer_form() {
        let mut buf = [0u8; 64];
        let params = ScanParameters::default();
        let framed = commands::le_set_scan_parameters(&mut buf, &params).expect("Encode");
        assert_eq!(Command::le_set_scan_parameters(&params).to_bytes(), framed);
    }

    #[test]
    fn test_advertising_data_is_padded_to_32_bytes() {
        let cmd = Command::le_set_advertising_data(&[0x02, 0x01, 0x06]).expect("Valid data");
        assert_eq!(cmd.params().len(), 32);
        assert_eq!(&cmd.params()[..4], &[0x03, 0x02, 0x01, 0x06]);
        assert!(cmd.params()[4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_advertising_data_too_long() {
        let result = Command::le_set_advertising_data(&[0u8; 32]);
        assert_eq!(result, Err(HciError::AdvertisingDataTooLong(32)));
    }

    #[test]
    fn test_set_phy_layout() {
        let cmd = Command::le_set_phy(0x0001, &PhyPreference::le_2m());
        assert_eq!(cmd.params(), &[0x01, 0x00, 0x00, 0x02, 0x02, 0x00, 0x00]);

        let no_rx_pref = PhyPreference {
            tx: PhyMask::LE_CODED,
            rx: PhyMask::empty(),
            coded_option: 2,
        };
        let cmd = Command::le_set_phy(0x0001, &no_rx_pref);
        assert_eq!(cmd.params(), &[0x01, 0x00, 0x02, 0x04, 0x00, 0x02, 0x00]);
    }

    #[test]
    fn test_create_connection_layout() {
        let params = ConnectionParameters::new(0x01, [1, 2, 3, 4, 5, 6]);
        let cmd = Command::le_create_connection(&params);
        assert_eq!(cmd.params().len(), 25);
        assert_eq!(cmd.params()[5], 0x01);
        assert_eq!(&cmd.params()[6..12], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&cmd.params()[19..21], &0x0190u16.to_le_bytes());
    }

    #[test]
    fn test_data_length_layout() {
        let mut buf = [0u8; 16];
        let packet = commands::le_set_data_length(&mut buf, 0x0040, 251, 2120).expect("Encode");
        assert_eq!(
            packet,
            &[0x01, 0x22, 0x20, 0x06, 0x40, 0x00, 0xFB, 0x00, 0x48, 0x08]
        );
    }
}
