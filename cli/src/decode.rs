// Human-readable decoding of captured HCI packets

use anyhow::{bail, Result};
use blehost_core::att;
use blehost_core::hci::{acl, event, ACL_INDICATOR, COMMAND_INDICATOR, EVENT_INDICATOR};
use blehost_core::l2cap::{L2capHeader, CID_ATT, CID_LE_SIGNALING, CID_SMP};

fn channel_name(cid: u16) -> &'static str {
    match cid {
        CID_ATT => "ATT",
        CID_LE_SIGNALING => "LE signaling",
        CID_SMP => "SMP",
        _ => "unknown",
    }
}

/// Describe one indicator-prefixed packet, one line per layer
pub fn describe(bytes: &[u8]) -> Result<Vec<String>> {
    let Some(&indicator) = bytes.first() else {
        bail!("Empty packet");
    };
    let mut lines = Vec::new();
    match indicator {
        COMMAND_INDICATOR => {
            if bytes.len() < 4 {
                bail!("Command packet too short ({} bytes)", bytes.len());
            }
            let opcode = u16::from_le_bytes([bytes[1], bytes[2]]);
            let params = &bytes[4..];
            lines.push(format!(
                "HCI command opcode={:#06x} (ogf={:#04x} ocf={:#06x}) params={}",
                opcode,
                opcode >> 10,
                opcode & 0x03FF,
                hex_string(params)
            ));
        }
        EVENT_INDICATOR => match event::decode(&bytes[1..]) {
            Some(ev) => lines.push(format!("HCI event {:?}", ev)),
            None => bail!("Malformed HCI event"),
        },
        ACL_INDICATOR => {
            let (Some(header), Some(payload)) = (acl::parse_header(bytes), acl::payload(bytes)) else {
                bail!("Malformed ACL packet");
            };
            lines.push(format!(
                "ACL handle={:#06x} pb={:?} bc={} len={}",
                header.conn_handle, header.pb_flag, header.bc_flag, header.data_len
            ));
            if !header.pb_flag.is_first() {
                lines.push(format!("  continuation {}", hex_string(payload)));
                return Ok(lines);
            }
            let Some(l2cap) = L2capHeader::from_bytes(payload) else {
                bail!("ACL payload shorter than L2CAP header");
            };
            let body = &payload[L2capHeader::HEADER_SIZE..];
            lines.push(format!(
                "  L2CAP cid={:#06x} ({}) length={}",
                l2cap.cid,
                channel_name(l2cap.cid),
                l2cap.length
            ));
            if body.len() < l2cap.length as usize {
                lines.push(format!("  fragment ({} of {} bytes)", body.len(), l2cap.length));
            } else if l2cap.cid == CID_ATT {
                match att::decode(body) {
                    Some(pdu) => lines.push(format!("  ATT {:?}", pdu)),
                    None => lines.push(format!("  ATT malformed {}", hex_string(body))),
                }
            } else {
                lines.push(format!("  data {}", hex_string(body)));
            }
        }
        other => bail!("Unknown HCI packet indicator {:#04x}", other),
    }
    Ok(lines)
}

pub fn hex_string(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "-".to_string();
    }
    hex::encode(bytes)
}

/// Parse hex that may contain whitespace, colons or a 0x prefix
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim();
    let cleaned: String = trimmed
        .strip_prefix("0x")
        .unwrap_or(trimmed)
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    Ok(hex::decode(cleaned)?)
}
