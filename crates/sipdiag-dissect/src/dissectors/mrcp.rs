//! MRCPv2 dissector (RFC 6787).
//!
//! Media Resource Control Protocol messages travel over the same TCP
//! flows SIP sets up; recognizing them keeps speech-resource traffic
//! from being mistaken for broken SIP.

use crate::dissector::Parser;
use crate::packet::{Packet, ProtoData};
use bytes::Bytes;

/// Start-line version token.
const MRCP_VERSION: &str = "MRCP/2.0";

/// The three MRCP message forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MrcpKind {
    /// `MRCP/2.0 <len> <method> <request-id>`
    Request {
        /// Method name.
        method: String,
        /// Request identifier.
        request_id: u64,
    },
    /// `MRCP/2.0 <len> <request-id> <status> <request-state>`
    Response {
        /// Request identifier.
        request_id: u64,
        /// Status code.
        status: u16,
        /// COMPLETE / IN-PROGRESS / PENDING.
        request_state: String,
    },
    /// `MRCP/2.0 <len> <event> <request-id> <request-state>`
    Event {
        /// Event name.
        event: String,
        /// Request identifier.
        request_id: u64,
        /// COMPLETE / IN-PROGRESS / PENDING.
        request_state: String,
    },
}

/// MRCP message data attached to a packet.
#[derive(Debug, Clone)]
pub struct MrcpData {
    /// Message form and identifiers.
    pub kind: MrcpKind,
    /// Declared message length.
    pub length: usize,
    /// `Channel-Identifier` header, when present.
    pub channel_id: Option<String>,
}

/// MRCP dissector.
#[derive(Debug)]
pub struct MrcpDissector;

impl MrcpDissector {
    /// Parses an MRCP message from an assembled TCP stream.
    pub fn dissect(
        &mut self,
        _parser: &mut Parser,
        packet: &mut Packet,
        data: Bytes,
    ) -> Option<Bytes> {
        let Ok(text) = std::str::from_utf8(&data) else {
            return Some(data);
        };

        if !text.starts_with(MRCP_VERSION) {
            return Some(data);
        }

        let line_end = text.find("\r\n").unwrap_or(text.len());
        let mut tokens = text[..line_end].split_whitespace();
        let _version = tokens.next();

        let Some(length) = tokens.next().and_then(|t| t.parse::<usize>().ok()) else {
            return Some(data);
        };

        let Some(third) = tokens.next() else {
            return Some(data);
        };

        let kind = if let Ok(request_id) = third.parse::<u64>() {
            // Numeric third token: a response
            let Some(status) = tokens.next().and_then(|t| t.parse::<u16>().ok()) else {
                return Some(data);
            };
            let Some(state) = tokens.next() else {
                return Some(data);
            };
            MrcpKind::Response {
                request_id,
                status,
                request_state: state.to_string(),
            }
        } else {
            let Some(request_id) = tokens.next().and_then(|t| t.parse::<u64>().ok()) else {
                return Some(data);
            };
            match tokens.next() {
                Some(state) => MrcpKind::Event {
                    event: third.to_string(),
                    request_id,
                    request_state: state.to_string(),
                },
                None => MrcpKind::Request {
                    method: third.to_string(),
                    request_id,
                },
            }
        };

        let channel_id = text
            .lines()
            .skip(1)
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("channel-identifier")
                    .then(|| value.trim().to_string())
            });

        packet.set_proto(ProtoData::Mrcp(MrcpData {
            kind,
            length,
            channel_id,
        }));

        None
    }
}
