//! HEP / EEP v3 capture envelope dissector.
//!
//! HEP frames carry a SIP payload plus synthetic IP/UDP metadata in TLV
//! chunks. Dissection reconstructs the IP and UDP protocol slots so the
//! rest of the pipeline sees the same shape as a natively captured
//! packet, and overwrites the frame timestamp with the sender's clock.

use crate::dissector::{Parser, ProtocolId};
use crate::dissectors::ip::IpData;
use crate::dissectors::udp::UdpData;
use crate::packet::{Packet, ProtoData};
use bytes::Bytes;
use sipdiag_types::config::HepListenConfig;
use sipdiag_types::Address;
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::debug;

/// Protocol magic.
pub const HEP3_MAGIC: &[u8; 4] = b"HEP3";

/// Generic chunk header length (vendor + type + length).
const CHUNK_HDR: usize = 6;

/// AF_INET wire value.
const FAMILY_IPV4: u8 = 2;
/// AF_INET6 wire value.
const FAMILY_IPV6: u8 = 10;

/// Vendor-0 chunk types.
mod chunk {
    pub const IP_FAMILY: u16 = 1;
    pub const IP_PROTO: u16 = 2;
    pub const IPV4_SRC: u16 = 3;
    pub const IPV4_DST: u16 = 4;
    pub const IPV6_SRC: u16 = 5;
    pub const IPV6_DST: u16 = 6;
    pub const SRC_PORT: u16 = 7;
    pub const DST_PORT: u16 = 8;
    pub const TIME_SEC: u16 = 9;
    pub const TIME_USEC: u16 = 10;
    pub const PROTO_TYPE: u16 = 11;
    pub const CAPTURE_ID: u16 = 12;
    pub const AUTH_KEY: u16 = 14;
    pub const PAYLOAD: u16 = 15;
    pub const CORRELATION_ID: u16 = 17;
}

/// HEP envelope data attached to a packet.
#[derive(Debug, Clone, Default)]
pub struct HepData {
    /// Capture agent identifier.
    pub capture_id: Option<u32>,
    /// Correlation identifier, when the sender includes one.
    pub correlation_id: Option<String>,
    /// Payload protocol type (1 = SIP).
    pub proto_type: Option<u8>,
}

/// Field accumulator for the chunk walk.
#[derive(Debug, Default)]
struct Chunks {
    family: Option<u8>,
    protocol: Option<u8>,
    src_ip: Option<String>,
    dst_ip: Option<String>,
    src_port: Option<u16>,
    dst_port: Option<u16>,
    time_sec: Option<u32>,
    time_usec: Option<u32>,
    proto_type: Option<u8>,
    capture_id: Option<u32>,
    auth_key: Option<Vec<u8>>,
    payload: Option<(usize, usize)>,
    correlation_id: Option<String>,
}

fn read_u16(data: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes([*data.first()?, *data.get(1)?]))
}

fn read_u32(data: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes([
        *data.first()?,
        *data.get(1)?,
        *data.get(2)?,
        *data.get(3)?,
    ]))
}

/// HEP dissector.
#[derive(Debug)]
pub struct HepDissector {
    config: HepListenConfig,
}

impl HepDissector {
    /// Creates a HEP dissector with the listener configuration.
    #[must_use]
    pub fn new(config: HepListenConfig) -> Self {
        Self { config }
    }

    fn walk_chunks(data: &Bytes) -> Option<Chunks> {
        let total = read_u16(&data[4..])? as usize;
        let end = total.min(data.len());

        let mut chunks = Chunks::default();
        let mut offset = CHUNK_HDR;

        while offset + CHUNK_HDR <= end {
            let vendor = read_u16(&data[offset..])?;
            let type_id = read_u16(&data[offset + 2..])?;
            let length = read_u16(&data[offset + 4..])? as usize;

            if length < CHUNK_HDR || offset + length > end {
                return None;
            }
            let body = &data[offset + CHUNK_HDR..offset + length];

            if vendor == 0 {
                match type_id {
                    chunk::IP_FAMILY => chunks.family = body.first().copied(),
                    chunk::IP_PROTO => chunks.protocol = body.first().copied(),
                    chunk::IPV4_SRC => {
                        let ip: [u8; 4] = body.try_into().ok()?;
                        chunks.src_ip = Some(Ipv4Addr::from(ip).to_string());
                    }
                    chunk::IPV4_DST => {
                        let ip: [u8; 4] = body.try_into().ok()?;
                        chunks.dst_ip = Some(Ipv4Addr::from(ip).to_string());
                    }
                    chunk::IPV6_SRC => {
                        let ip: [u8; 16] = body.try_into().ok()?;
                        chunks.src_ip = Some(Ipv6Addr::from(ip).to_string());
                    }
                    chunk::IPV6_DST => {
                        let ip: [u8; 16] = body.try_into().ok()?;
                        chunks.dst_ip = Some(Ipv6Addr::from(ip).to_string());
                    }
                    chunk::SRC_PORT => chunks.src_port = read_u16(body),
                    chunk::DST_PORT => chunks.dst_port = read_u16(body),
                    chunk::TIME_SEC => chunks.time_sec = read_u32(body),
                    chunk::TIME_USEC => chunks.time_usec = read_u32(body),
                    chunk::PROTO_TYPE => chunks.proto_type = body.first().copied(),
                    chunk::CAPTURE_ID => chunks.capture_id = read_u32(body),
                    chunk::AUTH_KEY => chunks.auth_key = Some(body.to_vec()),
                    chunk::PAYLOAD => {
                        chunks.payload = Some((offset + CHUNK_HDR, offset + length));
                    }
                    chunk::CORRELATION_ID => {
                        chunks.correlation_id =
                            std::str::from_utf8(body).ok().map(ToString::to_string);
                    }
                    // Unknown chunks are skipped by length
                    _ => {}
                }
            }

            offset += length;
        }

        Some(chunks)
    }

    /// Parses a HEP3 envelope and dissects its payload as SIP.
    pub fn dissect(
        &mut self,
        parser: &mut Parser,
        packet: &mut Packet,
        data: Bytes,
    ) -> Option<Bytes> {
        if data.len() < CHUNK_HDR || data[..4] != HEP3_MAGIC[..] {
            return Some(data);
        }

        let Some(chunks) = Self::walk_chunks(&data) else {
            return Some(data);
        };

        // When a password is configured the auth chunk must match it
        if let Some(expected) = self.config.password.as_deref() {
            let authorized = chunks
                .auth_key
                .as_deref()
                .is_some_and(|key| key == expected.as_bytes());
            if !authorized {
                debug!("dropping HEP packet with bad auth key");
                return None;
            }
        }

        let family = chunks.family.unwrap_or(FAMILY_IPV4);
        let version = if family == FAMILY_IPV6 { 6 } else { 4 };
        let src = Address::new(chunks.src_ip.unwrap_or_default(), chunks.src_port.unwrap_or(0));
        let dst = Address::new(chunks.dst_ip.unwrap_or_default(), chunks.dst_port.unwrap_or(0));

        // Correlation UUID chunks are only expected from senders the
        // listener is configured for; otherwise the chunk is skipped by
        // length like any unrecognized one
        let correlation_id = if self.config.uuid {
            chunks.correlation_id
        } else {
            None
        };

        packet.set_proto(ProtoData::Ip(IpData {
            src,
            dst,
            protocol: chunks.protocol.unwrap_or(17),
            version,
        }));
        packet.set_proto(ProtoData::Udp(UdpData {
            src_port: chunks.src_port.unwrap_or(0),
            dst_port: chunks.dst_port.unwrap_or(0),
        }));
        packet.set_proto(ProtoData::Hep(HepData {
            capture_id: chunks.capture_id,
            correlation_id,
            proto_type: chunks.proto_type,
        }));

        // The envelope carries the original acquisition time
        if let (Some(sec), Some(usec)) = (chunks.time_sec, chunks.time_usec) {
            packet.set_timestamp(i64::from(sec) * 1_000_000 + i64::from(usec));
        }

        let (start, end) = chunks.payload?;
        parser.dissect_next(ProtocolId::Hep, packet, data.slice(start..end))
    }
}

/// Everything needed to frame a packet as a HEP3 envelope.
#[derive(Debug, Clone)]
pub struct HepEnvelope {
    /// Source endpoint.
    pub src: Address,
    /// Destination endpoint.
    pub dst: Address,
    /// IP version of the original packet (4 or 6).
    pub ip_version: u8,
    /// Transport protocol number.
    pub protocol: u8,
    /// Capture time, seconds part.
    pub time_sec: u32,
    /// Capture time, microseconds part.
    pub time_usec: u32,
    /// Payload protocol type (1 = SIP).
    pub proto_type: u8,
    /// Capture agent identifier.
    pub capture_id: u32,
    /// Authentication key, when the collector expects one.
    pub auth_key: Option<String>,
    /// Correlation UUID, when the collector expects one.
    pub correlation_id: Option<String>,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

fn push_chunk(buffer: &mut Vec<u8>, type_id: u16, body: &[u8]) {
    buffer.extend_from_slice(&0u16.to_be_bytes());
    buffer.extend_from_slice(&type_id.to_be_bytes());
    buffer.extend_from_slice(&((CHUNK_HDR + body.len()) as u16).to_be_bytes());
    buffer.extend_from_slice(body);
}

/// Builds a HEP3 envelope from packet metadata.
#[must_use]
pub fn build_hep3(envelope: &HepEnvelope) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(128 + envelope.payload.len());
    buffer.extend_from_slice(HEP3_MAGIC);
    buffer.extend_from_slice(&[0, 0]); // total length, patched below

    let family = if envelope.ip_version == 6 {
        FAMILY_IPV6
    } else {
        FAMILY_IPV4
    };
    push_chunk(&mut buffer, chunk::IP_FAMILY, &[family]);
    push_chunk(&mut buffer, chunk::IP_PROTO, &[envelope.protocol]);

    if envelope.ip_version == 6 {
        if let Ok(ip) = envelope.src.ip.parse::<Ipv6Addr>() {
            push_chunk(&mut buffer, chunk::IPV6_SRC, &ip.octets());
        }
        if let Ok(ip) = envelope.dst.ip.parse::<Ipv6Addr>() {
            push_chunk(&mut buffer, chunk::IPV6_DST, &ip.octets());
        }
    } else {
        if let Ok(ip) = envelope.src.ip.parse::<Ipv4Addr>() {
            push_chunk(&mut buffer, chunk::IPV4_SRC, &ip.octets());
        }
        if let Ok(ip) = envelope.dst.ip.parse::<Ipv4Addr>() {
            push_chunk(&mut buffer, chunk::IPV4_DST, &ip.octets());
        }
    }

    push_chunk(&mut buffer, chunk::SRC_PORT, &envelope.src.port.to_be_bytes());
    push_chunk(&mut buffer, chunk::DST_PORT, &envelope.dst.port.to_be_bytes());
    push_chunk(&mut buffer, chunk::TIME_SEC, &envelope.time_sec.to_be_bytes());
    push_chunk(&mut buffer, chunk::TIME_USEC, &envelope.time_usec.to_be_bytes());
    push_chunk(&mut buffer, chunk::PROTO_TYPE, &[envelope.proto_type]);
    push_chunk(&mut buffer, chunk::CAPTURE_ID, &envelope.capture_id.to_be_bytes());

    if let Some(key) = &envelope.auth_key {
        push_chunk(&mut buffer, chunk::AUTH_KEY, key.as_bytes());
    }
    if let Some(correlation) = &envelope.correlation_id {
        push_chunk(&mut buffer, chunk::CORRELATION_ID, correlation.as_bytes());
    }
    push_chunk(&mut buffer, chunk::PAYLOAD, &envelope.payload);

    let total = buffer.len() as u16;
    buffer[4..6].copy_from_slice(&total.to_be_bytes());
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dissector::ParserConfig;

    fn envelope(payload: &[u8]) -> HepEnvelope {
        HepEnvelope {
            src: Address::new("10.0.0.1", 5060),
            dst: Address::new("10.0.0.2", 5060),
            ip_version: 4,
            protocol: 17,
            time_sec: 1_500_000_000,
            time_usec: 123_456,
            proto_type: 1,
            capture_id: 2002,
            auth_key: None,
            correlation_id: None,
            payload: payload.to_vec(),
        }
    }

    const SIP: &[u8] = b"OPTIONS sip:bob@example.com SIP/2.0\r\n\
        Call-ID: hep@example.com\r\n\
        CSeq: 1 OPTIONS\r\n\
        To: <sip:bob@example.com>\r\n\r\n";

    #[test]
    fn test_roundtrip() {
        let bytes = build_hep3(&envelope(SIP));

        let mut parser = Parser::new(ParserConfig::default());
        let mut packet = Packet::with_frame(crate::packet::Frame::new(
            0,
            bytes.len() as u32,
            bytes.len() as u32,
            Bytes::from(bytes.clone()),
        ));

        let out = HepDissector::new(HepListenConfig::default()).dissect(
            &mut parser,
            &mut packet,
            Bytes::from(bytes),
        );
        assert!(out.is_none());

        assert_eq!(packet.src_address().unwrap().to_string(), "10.0.0.1:5060");
        assert_eq!(packet.dst_address().unwrap().to_string(), "10.0.0.2:5060");
        assert_eq!(packet.timestamp(), 1_500_000_000 * 1_000_000 + 123_456);
        assert_eq!(packet.sip_data().unwrap().call_id, "hep@example.com");
    }

    #[test]
    fn test_password_mismatch_drops_packet() {
        let mut env = envelope(SIP);
        env.auth_key = Some("wrong".to_string());
        let bytes = build_hep3(&env);

        let config = HepListenConfig {
            password: Some("secret".to_string()),
            ..HepListenConfig::default()
        };

        let mut parser = Parser::new(ParserConfig::default());
        let mut packet = Packet::new();
        let out = HepDissector::new(config).dissect(&mut parser, &mut packet, Bytes::from(bytes));

        assert!(out.is_none());
        assert!(packet.sip_data().is_none());
    }

    #[test]
    fn test_password_match_accepts_packet() {
        let mut env = envelope(SIP);
        env.auth_key = Some("secret".to_string());
        let bytes = build_hep3(&env);

        let config = HepListenConfig {
            password: Some("secret".to_string()),
            ..HepListenConfig::default()
        };

        let mut parser = Parser::new(ParserConfig::default());
        let mut packet = Packet::new();
        HepDissector::new(config).dissect(&mut parser, &mut packet, Bytes::from(bytes));
        assert_eq!(packet.sip_data().unwrap().call_id, "hep@example.com");
    }

    #[test]
    fn test_correlation_uuid_recorded_when_configured() {
        let mut env = envelope(SIP);
        env.correlation_id = Some("4d6f-8a21-leg1".to_string());
        let bytes = build_hep3(&env);

        let config = HepListenConfig {
            uuid: true,
            ..HepListenConfig::default()
        };

        let mut parser = Parser::new(ParserConfig::default());
        let mut packet = Packet::new();
        HepDissector::new(config).dissect(&mut parser, &mut packet, Bytes::from(bytes));

        let hep = match packet.proto_data(ProtocolId::Hep) {
            Some(crate::packet::ProtoData::Hep(hep)) => hep,
            _ => panic!("hep data"),
        };
        assert_eq!(hep.correlation_id.as_deref(), Some("4d6f-8a21-leg1"));
    }

    #[test]
    fn test_correlation_uuid_skipped_by_default() {
        let mut env = envelope(SIP);
        env.correlation_id = Some("ignored".to_string());
        let bytes = build_hep3(&env);

        let mut parser = Parser::new(ParserConfig::default());
        let mut packet = Packet::new();
        HepDissector::new(HepListenConfig::default()).dissect(
            &mut parser,
            &mut packet,
            Bytes::from(bytes),
        );

        let hep = match packet.proto_data(ProtocolId::Hep) {
            Some(crate::packet::ProtoData::Hep(hep)) => hep,
            _ => panic!("hep data"),
        };
        // The chunk is walked over by length, its value is not kept
        assert!(hep.correlation_id.is_none());
        assert_eq!(packet.sip_data().unwrap().call_id, "hep@example.com");
    }

    #[test]
    fn test_not_hep_passes_through() {
        let mut parser = Parser::new(ParserConfig::default());
        let mut packet = Packet::new();
        let data = Bytes::from_static(b"not a hep frame");

        let out = HepDissector::new(HepListenConfig::default()).dissect(
            &mut parser,
            &mut packet,
            data.clone(),
        );
        assert_eq!(out, Some(data));
    }

    #[test]
    fn test_unknown_chunks_are_skipped() {
        let mut bytes = build_hep3(&envelope(SIP));
        // Append a vendor-0 chunk of unknown type 0x0042 and patch the
        // total length
        push_chunk(&mut bytes, 0x0042, &[1, 2, 3, 4]);
        let total = bytes.len() as u16;
        bytes[4..6].copy_from_slice(&total.to_be_bytes());

        let mut parser = Parser::new(ParserConfig::default());
        let mut packet = Packet::new();
        HepDissector::new(HepListenConfig::default()).dissect(
            &mut parser,
            &mut packet,
            Bytes::from(bytes),
        );
        assert_eq!(packet.sip_data().unwrap().call_id, "hep@example.com");
    }
}
