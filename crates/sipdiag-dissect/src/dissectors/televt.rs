//! RFC 4733 telephony-event (DTMF) dissector.

use crate::dissector::Parser;
use crate::packet::{Packet, ProtoData};
use bytes::Bytes;

/// Event codes 0-15 as DTMF digits (RFC 4733 table 7).
const DTMF_DIGITS: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', '*', '#', 'A', 'B', 'C', 'D',
];

/// Telephony-event data attached to a packet.
#[derive(Debug, Clone)]
pub struct TelEvtData {
    /// The DTMF digit.
    pub value: char,
    /// End-of-event flag.
    pub end: bool,
    /// Volume in -dBm0 (0-63).
    pub volume: u8,
    /// Cumulative duration in timestamp units.
    pub duration: u16,
}

/// Telephony-event dissector; runs on RTP payloads.
#[derive(Debug)]
pub struct TelEvtDissector;

impl TelEvtDissector {
    /// Parses a 4-byte telephony-event payload.
    pub fn dissect(
        &mut self,
        _parser: &mut Parser,
        packet: &mut Packet,
        data: Bytes,
    ) -> Option<Bytes> {
        if data.len() != 4 {
            return Some(data);
        }

        let event = data[0] as usize;
        let Some(&value) = DTMF_DIGITS.get(event) else {
            // Not a DTMF event (flash hook, fax tones, ...)
            return Some(data);
        };

        packet.set_proto(ProtoData::TelEvt(TelEvtData {
            value,
            end: data[1] & 0x80 != 0,
            volume: data[1] & 0x3f,
            duration: u16::from_be_bytes([data[2], data[3]]),
        }));

        None
    }
}
