//! RTCP dissector.
//!
//! Walks a compound RTCP packet and pulls the quality figures the stream
//! view displays: sender packet counts from SR, loss fractions and MOS
//! scores from the XR VoIP-metrics block.

use crate::dissector::Parser;
use crate::packet::{Packet, ProtoData};
use bytes::Bytes;

/// Sender report packet type.
const RTCP_SR: u8 = 200;
/// Receiver report packet type.
const RTCP_RR: u8 = 201;
/// Extended report packet type.
const RTCP_XR: u8 = 207;
/// Last assigned RTCP packet type considered valid here.
const RTCP_TYPE_MAX: u8 = 210;

/// XR block type for VoIP metrics.
const XR_VOIP_METRICS: u8 = 7;

/// RTCP statistics attached to a packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcpData {
    /// Sender packet count (SR).
    pub sender_packets: u32,
    /// Fraction lost, x/256 (SR/RR report block or XR loss rate).
    pub fraction_lost: u8,
    /// Fraction discarded, x/256 (XR discard rate).
    pub fraction_discard: u8,
    /// MOS listening quality x10 (XR VoIP metrics).
    pub mos_listening: u8,
    /// MOS conversational quality x10 (XR VoIP metrics).
    pub mos_conversational: u8,
}

/// Checks the first compound header byte pair.
fn valid(data: &[u8]) -> bool {
    data.len() >= 8 && data[0] >> 6 == 2 && (RTCP_SR..=RTCP_TYPE_MAX).contains(&data[1])
}

/// RTCP dissector.
#[derive(Debug)]
pub struct RtcpDissector;

impl RtcpDissector {
    /// Parses a compound RTCP packet.
    pub fn dissect(
        &mut self,
        _parser: &mut Parser,
        packet: &mut Packet,
        data: Bytes,
    ) -> Option<Bytes> {
        if !valid(&data) {
            return Some(data);
        }

        let mut stats = RtcpData::default();
        let mut offset = 0usize;

        while offset + 4 <= data.len() {
            let ptype = data[offset + 1];
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let block_len = (words + 1) * 4;

            match ptype {
                RTCP_SR => {
                    if offset + 24 <= data.len() {
                        stats.sender_packets = u32::from_be_bytes([
                            data[offset + 20],
                            data[offset + 21],
                            data[offset + 22],
                            data[offset + 23],
                        ]);
                    }
                    // First reception report block, when present
                    let rc = data[offset] & 0x1f;
                    if rc > 0 && offset + 33 <= data.len() {
                        stats.fraction_lost = data[offset + 32];
                    }
                }
                RTCP_RR => {
                    let rc = data[offset] & 0x1f;
                    if rc > 0 && offset + 13 <= data.len() {
                        stats.fraction_lost = data[offset + 12];
                    }
                }
                RTCP_XR => Self::parse_xr(&data[offset..data.len().min(offset + block_len)], &mut stats),
                _ => {}
            }

            if block_len == 0 {
                break;
            }
            offset += block_len;
        }

        packet.set_proto(ProtoData::Rtcp(stats));
        None
    }

    /// Walks the blocks of an XR packet.
    fn parse_xr(data: &[u8], stats: &mut RtcpData) {
        // Skip the XR header (4 bytes) and its SSRC (4 bytes)
        let mut offset = 8usize;

        while offset + 4 <= data.len() {
            let block_type = data[offset];
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            let block_len = (words + 1) * 4;

            if block_type == XR_VOIP_METRICS && offset + 28 <= data.len() {
                stats.fraction_lost = data[offset + 8];
                stats.fraction_discard = data[offset + 9];
                stats.mos_listening = data[offset + 26];
                stats.mos_conversational = data[offset + 27];
            }

            if block_len == 0 {
                break;
            }
            offset += block_len;
        }
    }
}
