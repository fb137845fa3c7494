//! HCI event decoding
//!
//! `decode` takes the bytes following the `0x04` packet indicator
//! (`[event_code][param_len][params]`) and produces a borrowed [`Event`].
//! Unrecognised codes decode to [`Event::Unknown`]; buffers shorter than the
//! fixed part of a recognised event decode to `None`.

/// Packet indicator for HCI event packets
pub const EVENT_INDICATOR: u8 = 0x04;

/// Event code + parameter length
pub const EVENT_HEADER_LEN: usize = 2;

/// Event codes
pub mod codes {
    pub const DISCONNECTION_COMPLETE: u8 = 0x05;
    pub const COMMAND_COMPLETE: u8 = 0x0E;
    pub const COMMAND_STATUS: u8 = 0x0F;
    pub const HARDWARE_ERROR: u8 = 0x10;
    pub const NUMBER_OF_COMPLETED_PACKETS: u8 = 0x13;
    pub const LE_META: u8 = 0x3E;

    pub const LE_CONNECTION_COMPLETE: u8 = 0x01;
    pub const LE_ADVERTISING_REPORT: u8 = 0x02;
    pub const LE_CONNECTION_UPDATE_COMPLETE: u8 = 0x03;
    pub const LE_DATA_LENGTH_CHANGE: u8 = 0x07;
    pub const LE_PHY_UPDATE_COMPLETE: u8 = 0x0C;
}

/// A decoded HCI event borrowing from the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    CommandComplete {
        num_packets: u8,
        opcode: u16,
        return_params: &'a [u8],
    },
    CommandStatus {
        status: u8,
        num_packets: u8,
        opcode: u16,
    },
    DisconnectionComplete {
        status: u8,
        conn_handle: u16,
        reason: u8,
    },
    HardwareError {
        code: u8,
    },
    NumberOfCompletedPackets(CompletedPackets<'a>),
    LeConnectionComplete(LeConnectionComplete),
    LeAdvertisingReport(AdvertisingReports<'a>),
    LeConnectionUpdateComplete {
        status: u8,
        conn_handle: u16,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    },
    LeDataLengthChange {
        conn_handle: u16,
        max_tx_octets: u16,
        max_tx_time: u16,
        max_rx_octets: u16,
        max_rx_time: u16,
    },
    LePhyUpdateComplete {
        status: u8,
        conn_handle: u16,
        tx_phy: u8,
        rx_phy: u8,
    },
    /// Any event (or LE subevent, with code `0x3E`) this host does not interpret
    Unknown {
        code: u8,
        params: &'a [u8],
    },
}

impl<'a> Event<'a> {
    /// Status byte of a Command Complete event, which by convention is the
    /// first return parameter
    pub fn status(&self) -> Option<u8> {
        match self {
            Event::CommandComplete { return_params, .. } => return_params.first().copied(),
            Event::CommandStatus { status, .. }
            | Event::DisconnectionComplete { status, .. }
            | Event::LeConnectionUpdateComplete { status, .. }
            | Event::LePhyUpdateComplete { status, .. } => Some(*status),
            Event::LeConnectionComplete(c) => Some(c.status),
            _ => None,
        }
    }
}

/// LE Connection Complete subevent fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeConnectionComplete {
    pub status: u8,
    pub conn_handle: u16,
    /// 0x00 central, 0x01 peripheral
    pub role: u8,
    pub peer_address_type: u8,
    pub peer_address: [u8; 6],
    pub interval: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
    pub clock_accuracy: u8,
}

/// Repeating `{handle, count}` entries of Number of Completed Packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedPackets<'a> {
    entries: &'a [u8],
}

impl<'a> CompletedPackets<'a> {
    pub fn len(&self) -> usize {
        self.entries.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(conn_handle, completed_count)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (u16, u16)> + 'a {
        self.entries.chunks_exact(4).map(|e| {
            (
                u16::from_le_bytes([e[0], e[1]]) & 0x0FFF,
                u16::from_le_bytes([e[2], e[3]]),
            )
        })
    }

    /// Sum of completed packets over all handles
    pub fn total(&self) -> u32 {
        self.iter().map(|(_, n)| u32::from(n)).sum()
    }
}

/// One advertising report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingReport<'a> {
    pub event_type: u8,
    pub address_type: u8,
    pub address: [u8; 6],
    pub data: &'a [u8],
    pub rssi: i8,
}

/// The reports carried by one LE Advertising Report event, laid out one
/// after another (`type, addr_type, addr, len, data, rssi`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingReports<'a> {
    count: u8,
    body: &'a [u8],
}

impl<'a> AdvertisingReports<'a> {
    /// Number of reports announced by the controller
    pub fn count(&self) -> u8 {
        self.count
    }

    /// Iterate the reports; iteration stops early at a truncated report
    pub fn iter(&self) -> AdvertisingReportIter<'a> {
        AdvertisingReportIter {
            remaining: self.count,
            body: self.body,
        }
    }
}

pub struct AdvertisingReportIter<'a> {
    remaining: u8,
    body: &'a [u8],
}

impl<'a> Iterator for AdvertisingReportIter<'a> {
    type Item = AdvertisingReport<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.body.len() < 9 {
            return None;
        }
        let b = self.body;
        let data_len = b[8] as usize;
        let end = 9 + data_len;
        if b.len() < end + 1 {
            self.remaining = 0;
            return None;
        }
        let mut address = [0u8; 6];
        address.copy_from_slice(&b[2..8]);
        let report = AdvertisingReport {
            event_type: b[0],
            address_type: b[1],
            address,
            data: &b[9..end],
            rssi: b[end] as i8,
        };
        self.body = &b[end + 1..];
        self.remaining -= 1;
        Some(report)
    }
}

/// Return parameters of LE Read Buffer Size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeBufferSize {
    pub status: u8,
    /// Maximum ACL payload the controller accepts per packet
    pub acl_data_len: u16,
    /// Number of ACL packets the controller can buffer
    pub total_packets: u8,
}

impl LeBufferSize {
    pub fn parse(return_params: &[u8]) -> Option<Self> {
        if return_params.len() < 4 {
            return None;
        }
        Some(Self {
            status: return_params[0],
            acl_data_len: u16::from_le_bytes([return_params[1], return_params[2]]),
            total_packets: return_params[3],
        })
    }
}

fn le_u16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

/// Decode an event from `[event_code][param_len][params]`
pub fn decode(bytes: &[u8]) -> Option<Event<'_>> {
    if bytes.len() < EVENT_HEADER_LEN {
        return None;
    }
    let code = bytes[0];
    let len = bytes[1] as usize;
    let p = bytes.get(EVENT_HEADER_LEN..EVENT_HEADER_LEN + len)?;

    match code {
        codes::COMMAND_COMPLETE => {
            if p.len() < 3 {
                return None;
            }
            Some(Event::CommandComplete {
                num_packets: p[0],
                opcode: le_u16(p, 1),
                return_params: &p[3..],
            })
        }
        codes::COMMAND_STATUS => {
            if p.len() < 4 {
                return None;
            }
            Some(Event::CommandStatus {
                status: p[0],
                num_packets: p[1],
                opcode: le_u16(p, 2),
            })
        }
        codes::DISCONNECTION_COMPLETE => {
            if p.len() < 4 {
                return None;
            }
            Some(Event::DisconnectionComplete {
                status: p[0],
                conn_handle: le_u16(p, 1) & 0x0FFF,
                reason: p[3],
            })
        }
        codes::HARDWARE_ERROR => p.first().map(|&code| Event::HardwareError { code }),
        codes::NUMBER_OF_COMPLETED_PACKETS => {
            let n = *p.first()? as usize;
            let entries = p.get(1..1 + n * 4)?;
            Some(Event::NumberOfCompletedPackets(CompletedPackets { entries }))
        }
        codes::LE_META => decode_le_meta(p),
        _ => Some(Event::Unknown { code, params: p }),
    }
}

fn decode_le_meta(p: &[u8]) -> Option<Event<'_>> {
    let (&subevent, s) = p.split_first()?;
    match subevent {
        codes::LE_CONNECTION_COMPLETE => {
            if s.len() < 18 {
                return None;
            }
            let mut peer_address = [0u8; 6];
            peer_address.copy_from_slice(&s[5..11]);
            Some(Event::LeConnectionComplete(LeConnectionComplete {
                status: s[0],
                conn_handle: le_u16(s, 1) & 0x0FFF,
                role: s[3],
                peer_address_type: s[4],
                peer_address,
                interval: le_u16(s, 11),
                latency: le_u16(s, 13),
                supervision_timeout: le_u16(s, 15),
                clock_accuracy: s[17],
            }))
        }
        codes::LE_ADVERTISING_REPORT => {
            let (&count, body) = s.split_first()?;
            Some(Event::LeAdvertisingReport(AdvertisingReports { count, body }))
        }
        codes::LE_CONNECTION_UPDATE_COMPLETE => {
            if s.len() < 9 {
                return None;
            }
            Some(Event::LeConnectionUpdateComplete {
                status: s[0],
                conn_handle: le_u16(s, 1) & 0x0FFF,
                interval: le_u16(s, 3),
                latency: le_u16(s, 5),
                supervision_timeout: le_u16(s, 7),
            })
        }
        codes::LE_DATA_LENGTH_CHANGE => {
            if s.len() < 10 {
                return None;
            }
            Some(Event::LeDataLengthChange {
                conn_handle: le_u16(s, 0) & 0x0FFF,
                max_tx_octets: le_u16(s, 2),
                max_tx_time: le_u16(s, 4),
                max_rx_octets: le_u16(s, 6),
                max_rx_time: le_u16(s, 8),
            })
        }
        codes::LE_PHY_UPDATE_COMPLETE => {
            if s.len() < 5 {
                return None;
            }
            Some(Event::LePhyUpdateComplete {
                status: s[0],
                conn_handle: le_u16(s, 1) & 0x0FFF,
                tx_phy: s[3],
                rx_phy: s[4],
            })
        }
        _ => Some(Event::Unknown {
            code: codes::LE_META,
            params: p,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::opcodes;

    #[test]
    fn test_decode_reset_command_complete() {
        let event = decode(&[0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00]).expect("Decodes");
        match event {
            Event::CommandComplete {
                num_packets,
                opcode,
                return_params,
            } => {
                assert_eq!(num_packets, 1);
                assert_eq!(opcode, opcodes::RESET);
                assert_eq!(return_params, &[0x00]);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
        assert_eq!(event.status(), Some(0x00));
    }

    #[test]
    fn test_decode_command_status() {
        let event = decode(&[0x0F, 0x04, 0x0C, 0x01, 0x0D, 0x20]).expect("Decodes");
        assert_eq!(
            event,
            Event::CommandStatus {
                status: 0x0C,
                num_packets: 1,
                opcode: opcodes::LE_CREATE_CONNECTION,
            }
        );
    }

    #[test]
    fn test_decode_disconnection_complete() {
        let event = decode(&[0x05, 0x04, 0x00, 0x40, 0x00, 0x13]).expect("Decodes");
        assert_eq!(
            event,
            Event::DisconnectionComplete {
                status: 0,
                conn_handle: 0x0040,
                reason: 0x13,
            }
        );
    }

    #[test]
    fn test_decode_number_of_completed_packets() {
        let bytes = [0x13, 0x09, 0x02, 0x40, 0x00, 0x02, 0x00, 0x41, 0x00, 0x01, 0x00];
        match decode(&bytes).expect("Decodes") {
            Event::NumberOfCompletedPackets(completed) => {
                let entries: Vec<_> = completed.iter().collect();
                assert_eq!(entries, vec![(0x0040, 2), (0x0041, 1)]);
                assert_eq!(completed.total(), 3);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_completed_packets_truncated() {
        assert!(decode(&[0x13, 0x03, 0x02, 0x40, 0x00]).is_none());
    }

    #[test]
    fn test_decode_le_connection_complete() {
        let bytes = [
            0x3E, 0x13, 0x01, 0x00, 0x40, 0x00, 0x01, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
            0x18, 0x00, 0x00, 0x00, 0x90, 0x01, 0x00,
        ];
        match decode(&bytes).expect("Decodes") {
            Event::LeConnectionComplete(c) => {
                assert_eq!(c.status, 0);
                assert_eq!(c.conn_handle, 0x0040);
                assert_eq!(c.role, 1);
                assert_eq!(c.peer_address, [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
                assert_eq!(c.interval, 0x0018);
                assert_eq!(c.supervision_timeout, 0x0190);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_advertising_report() {
        let bytes = [
            0x3E, 0x0F, 0x02, 0x01, 0x00, 0x01, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x03, 0x02,
            0x01, 0x06, 0xC4,
        ];
        match decode(&bytes).expect("Decodes") {
            Event::LeAdvertisingReport(reports) => {
                assert_eq!(reports.count(), 1);
                let all: Vec<_> = reports.iter().collect();
                assert_eq!(all.len(), 1);
                assert_eq!(all[0].address_type, 1);
                assert_eq!(all[0].address, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
                assert_eq!(all[0].data, &[0x02, 0x01, 0x06]);
                assert_eq!(all[0].rssi, -60);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_truncated_advertising_report_stops() {
        let bytes = [
            0x3E, 0x0B, 0x02, 0x01, 0x00, 0x01, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x05,
        ];
        match decode(&bytes).expect("Decodes") {
            Event::LeAdvertisingReport(reports) => assert_eq!(reports.iter().count(), 0),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_decode_data_length_change() {
        let bytes = [
            0x3E, 0x0B, 0x07, 0x40, 0x00, 0xFB, 0x00, 0x48, 0x08, 0x1B, 0x00, 0x48, 0x01,
        ];
        assert_eq!(
            decode(&bytes),
            Some(Event::LeDataLengthChange {
                conn_handle: 0x0040,
                max_tx_octets: 251,
                max_tx_time: 2120,
                max_rx_octets: 27,
                max_rx_time: 328,
            })
        );
    }

    #[test]
    fn test_decode_phy_update_complete() {
        let bytes = [0x3E, 0x06, 0x0C, 0x00, 0x40, 0x00, 0x02, 0x02];
        assert_eq!(
            decode(&bytes),
            Some(Event::LePhyUpdateComplete {
                status: 0,
                conn_handle: 0x0040,
                tx_phy: 2,
                rx_phy: 2,
            })
        );
    }

    #[test]
    fn test_decode_unknown_event_code() {
        let event = decode(&[0xFF, 0x02, 0xAB, 0xCD]).expect("Unknown still decodes");
        assert_eq!(
            event,
            Event::Unknown {
                code: 0xFF,
                params: &[0xAB, 0xCD]
            }
        );
    }

    #[test]
    fn test_decode_unknown_le_subevent() {
        let event = decode(&[0x3E, 0x02, 0x7F, 0x00]).expect("Unknown still decodes");
        assert!(matches!(event, Event::Unknown { code: 0x3E, .. }));
    }

    #[test]
    fn test_decode_short_buffers() {
        assert!(decode(&[]).is_none());
        assert!(decode(&[0x0E]).is_none());
        // Declared length longer than the buffer
        assert!(decode(&[0x0E, 0x04, 0x01, 0x03]).is_none());
        // Fixed part missing
        assert!(decode(&[0x0E, 0x02, 0x01, 0x03]).is_none());
        assert!(decode(&[0x05, 0x01, 0x00]).is_none());
        assert!(decode(&[0x3E, 0x02, 0x01, 0x00]).is_none());
        assert!(decode(&[0x3E, 0x00]).is_none());
    }

    #[test]
    fn test_le_buffer_size_parse() {
        let size = LeBufferSize::parse(&[0x00, 0xFB, 0x00, 0x08]).expect("Parses");
        assert_eq!(size.acl_data_len, 251);
        assert_eq!(size.total_packets, 8);
        assert!(LeBufferSize::parse(&[0x00, 0x1B]).is_none());
    }
}
