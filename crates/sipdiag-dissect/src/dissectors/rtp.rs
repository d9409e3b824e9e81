//! RTP dissector.
//!
//! Validation follows RFC 5761 section 4 and RFC 5764 section 5.1.2 so
//! RTP, RTCP, STUN and TLS can share a port without confusion.

use crate::dissector::{Parser, ProtocolId};
use crate::packet::{Packet, ProtoData};
use bytes::Bytes;

/// Fixed RTP header length.
const RTP_HDR_LENGTH: usize = 12;

/// A well-known static payload-type encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpEncoding {
    /// Payload-type number.
    pub id: u8,
    /// Canonical `name/rate` form.
    pub name: &'static str,
    /// Short display alias.
    pub alias: &'static str,
}

/// Static payload types from RFC 3551 section 6 and the IANA registry.
pub const WELL_KNOWN_ENCODINGS: &[RtpEncoding] = &[
    RtpEncoding { id: 0, name: "PCMU/8000", alias: "g711u" },
    RtpEncoding { id: 3, name: "GSM/8000", alias: "gsm" },
    RtpEncoding { id: 4, name: "G723/8000", alias: "g723" },
    RtpEncoding { id: 5, name: "DVI4/8000", alias: "dvi" },
    RtpEncoding { id: 6, name: "DVI4/16000", alias: "dvi" },
    RtpEncoding { id: 7, name: "LPC/8000", alias: "lpc" },
    RtpEncoding { id: 8, name: "PCMA/8000", alias: "g711a" },
    RtpEncoding { id: 9, name: "G722/8000", alias: "g722" },
    RtpEncoding { id: 10, name: "L16/44100", alias: "l16" },
    RtpEncoding { id: 11, name: "L16/44100", alias: "l16" },
    RtpEncoding { id: 12, name: "QCELP/8000", alias: "qcelp" },
    RtpEncoding { id: 13, name: "CN/8000", alias: "cn" },
    RtpEncoding { id: 14, name: "MPA/90000", alias: "mpa" },
    RtpEncoding { id: 15, name: "G728/8000", alias: "g728" },
    RtpEncoding { id: 16, name: "DVI4/11025", alias: "dvi" },
    RtpEncoding { id: 17, name: "DVI4/22050", alias: "dvi" },
    RtpEncoding { id: 18, name: "G729/8000", alias: "g729" },
    RtpEncoding { id: 25, name: "CelB/90000", alias: "celb" },
    RtpEncoding { id: 26, name: "JPEG/90000", alias: "jpeg" },
    RtpEncoding { id: 28, name: "nv/90000", alias: "nv" },
    RtpEncoding { id: 31, name: "H261/90000", alias: "h261" },
    RtpEncoding { id: 32, name: "MPV/90000", alias: "mpv" },
    RtpEncoding { id: 33, name: "MP2T/90000", alias: "mp2t" },
    RtpEncoding { id: 34, name: "H263/90000", alias: "h263" },
];

/// Looks up a static payload type.
#[must_use]
pub fn standard_encoding(id: u8) -> Option<&'static RtpEncoding> {
    WELL_KNOWN_ENCODINGS.iter().find(|e| e.id == id)
}

/// RTP data attached to a packet.
#[derive(Debug, Clone)]
pub struct RtpData {
    /// Payload-type number from the header.
    pub payload_type: u8,
    /// Static encoding, when the payload type is well known; dynamic
    /// types are resolved later against the SDP rtpmap.
    pub encoding: Option<&'static RtpEncoding>,
    /// Synchronization source identifier.
    pub ssrc: u32,
    /// Sequence number.
    pub seq: u16,
    /// Media timestamp.
    pub timestamp: u32,
    /// Payload bytes past the fixed header.
    pub payload: Bytes,
}

/// Checks the RTP demultiplexing heuristic.
fn valid(data: &[u8]) -> bool {
    if data.len() < RTP_HDR_LENGTH {
        return false;
    }
    let pt = data[1] & 0x7f;
    data[0] >> 6 == 2 && data[0] > 127 && data[0] < 192 && (pt <= 64 || pt >= 96)
}

/// RTP dissector.
#[derive(Debug)]
pub struct RtpDissector;

impl RtpDissector {
    /// Parses an RTP header; telephony events ride in the payload.
    pub fn dissect(
        &mut self,
        parser: &mut Parser,
        packet: &mut Packet,
        data: Bytes,
    ) -> Option<Bytes> {
        if !valid(&data) {
            return Some(data);
        }

        let payload_type = data[1] & 0x7f;
        let payload = data.slice(RTP_HDR_LENGTH..);

        packet.set_proto(ProtoData::Rtp(RtpData {
            payload_type,
            encoding: standard_encoding(payload_type),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            seq: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            payload: payload.clone(),
        }));

        // DTMF events are an RTP payload format
        parser.dissect_next(ProtocolId::Rtp, packet, payload);

        None
    }
}

/// Builds an RTP packet for tests.
#[cfg(test)]
pub(crate) fn build_rtp(payload_type: u8, seq: u16, timestamp: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0x80, payload_type & 0x7f];
    bytes.extend_from_slice(&seq.to_be_bytes());
    bytes.extend_from_slice(&timestamp.to_be_bytes());
    bytes.extend_from_slice(&ssrc.to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dissector::ParserConfig;

    #[test]
    fn test_parse_pcmu_packet() {
        let mut parser = Parser::new(ParserConfig::default());
        let mut packet = Packet::new();
        let bytes = build_rtp(0, 100, 16_000, 0xdead_beef, &[0u8; 160]);

        let out = RtpDissector.dissect(&mut parser, &mut packet, Bytes::from(bytes));
        assert!(out.is_none());

        let rtp = packet.rtp_data().expect("rtp data");
        assert_eq!(rtp.payload_type, 0);
        assert_eq!(rtp.encoding.map(|e| e.name), Some("PCMU/8000"));
        assert_eq!(rtp.seq, 100);
        assert_eq!(rtp.ssrc, 0xdead_beef);
        assert_eq!(rtp.payload.len(), 160);
    }

    #[test]
    fn test_dynamic_payload_type() {
        let mut parser = Parser::new(ParserConfig::default());
        let mut packet = Packet::new();
        let bytes = build_rtp(111, 1, 0, 1, &[0u8; 40]);

        RtpDissector.dissect(&mut parser, &mut packet, Bytes::from(bytes));
        let rtp = packet.rtp_data().expect("rtp data");
        assert_eq!(rtp.payload_type, 111);
        assert!(rtp.encoding.is_none());
    }

    #[test]
    fn test_rejects_rtcp_range() {
        let mut parser = Parser::new(ParserConfig::default());
        let mut packet = Packet::new();
        // First byte valid, payload type 72 (RTCP SR with marker bit view)
        let bytes = build_rtp(72, 1, 0, 1, &[0u8; 8]);

        let out = RtpDissector.dissect(&mut parser, &mut packet, Bytes::from(bytes));
        assert!(out.is_some());
        assert!(packet.rtp_data().is_none());
    }

    #[test]
    fn test_rejects_short_buffer() {
        let mut parser = Parser::new(ParserConfig::default());
        let mut packet = Packet::new();

        let out = RtpDissector.dissect(&mut parser, &mut packet, Bytes::from_static(&[0x80, 0]));
        assert!(out.is_some());
    }
}
