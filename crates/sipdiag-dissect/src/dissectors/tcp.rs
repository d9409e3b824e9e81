//! TCP dissector with directional stream reassembly.
//!
//! Segments are collected per `src-dst` flow until the SIP dissector can
//! parse a complete message out of the assembled bytes. Streams that grow
//! too large or stop making progress are swept by a periodic garbage
//! collection pass.

use crate::dissector::{Parser, ProtocolId};
use crate::dissectors::sip;
use crate::packet::{Frame, Packet, ProtoData};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tracing::debug;

/// TCP protocol number in the IP header.
const IPPROTO_TCP: u8 = 6;

/// Streams holding more segments than this are discarded.
const MAX_SEGMENTS: usize = 5;

/// Sweeps a stream may survive without progress.
const MAX_AGE: u32 = 3;

/// TCP layer data attached to a packet.
#[derive(Debug, Clone)]
pub struct TcpData {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Data offset (header length in bytes).
    pub offset: u16,
    /// Sequence number.
    pub seq: u32,
    /// SYN flag.
    pub syn: bool,
    /// ACK flag.
    pub ack: bool,
    /// PSH flag.
    pub psh: bool,
}

/// One captured segment of a stream.
#[derive(Debug)]
struct TcpSegment {
    seq: u32,
    data: Bytes,
    frames: Vec<Frame>,
}

/// Reassembly state of one directional flow.
#[derive(Debug, Default)]
struct TcpStream {
    segments: Vec<TcpSegment>,
    age: u32,
}

impl TcpStream {
    fn assembled(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.segments.iter().map(|s| s.data.len()).sum());
        for segment in &self.segments {
            buffer.extend_from_slice(&segment.data);
        }
        buffer.freeze()
    }

    fn frames(&self) -> Vec<Frame> {
        self.segments.iter().flat_map(|s| s.frames.clone()).collect()
    }
}

/// TCP dissector holding the stream assembly table.
#[derive(Debug, Default)]
pub struct TcpDissector {
    assembly: HashMap<String, TcpStream>,
}

impl TcpDissector {
    /// Creates a TCP dissector with an empty assembly table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn stream_key(packet: &Packet) -> Option<String> {
        let src = packet.src_address()?;
        let dst = packet.dst_address()?;
        Some(format!("{src}-{dst}"))
    }

    /// Dissects a TCP header and reassembles the stream it belongs to.
    pub fn dissect(
        &mut self,
        parser: &mut Parser,
        packet: &mut Packet,
        data: Bytes,
    ) -> Option<Bytes> {
        let is_tcp = packet.ip_data().is_some_and(|ip| ip.protocol == IPPROTO_TCP);
        if !is_tcp {
            return Some(data);
        }

        if data.len() < 20 {
            return Some(data);
        }

        let offset = u16::from((data[12] >> 4) * 4);
        if (offset as usize) < 20 || data.len() < offset as usize {
            return Some(data);
        }

        let flags = data[13];
        packet.set_proto(ProtoData::Tcp(TcpData {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            offset,
            seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            syn: flags & 0x02 != 0,
            ack: flags & 0x10 != 0,
            psh: flags & 0x08 != 0,
        }));

        let payload = data.slice(offset as usize..);
        if payload.is_empty() {
            // Bare control segment, nothing to assemble
            return None;
        }

        let key = Self::stream_key(packet)?;
        let seq = packet.tcp_data().map_or(0, |t| t.seq);

        let stream = self.assembly.entry(key.clone()).or_default();
        stream.segments.push(TcpSegment {
            seq,
            data: payload.clone(),
            frames: packet.frames().to_vec(),
        });
        stream.segments.sort_by_key(|s| s.seq);

        if stream.segments.len() > MAX_SEGMENTS {
            debug!(stream = %key, "dropping over-segmented stream");
            self.assembly.remove(&key);
            return Some(payload);
        }

        // Progress resets the garbage collection age
        stream.age = 0;

        let assembled = stream.assembled();
        packet.set_frames(stream.frames());

        match parser.dissect_next(ProtocolId::Tcp, packet, assembled.clone()) {
            None => {
                // A sub-dissector consumed the whole stream; the flow
                // stays known but its pending bytes are done with
                if let Some(stream) = self.assembly.get_mut(&key) {
                    stream.segments.clear();
                }
                None
            }
            Some(_) => {
                if sip::looks_like_sip(&assembled) {
                    // A SIP message is forming, hold the segments until
                    // the remainder arrives
                    None
                } else {
                    self.assembly.remove(&key);
                    Some(payload)
                }
            }
        }
    }

    /// Periodic sweep dropping streams that stopped making progress.
    pub fn collect_garbage(&mut self) {
        self.assembly.retain(|key, stream| {
            stream.age += 1;
            let keep = stream.age <= MAX_AGE && stream.segments.len() <= MAX_SEGMENTS;
            if !keep {
                debug!(stream = %key, age = stream.age, "dropping stale stream");
            }
            keep
        });
    }

    /// Number of flows currently tracked.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.assembly.len()
    }
}

/// Builds a TCP header around `payload` for dissector tests.
#[cfg(test)]
pub(crate) fn build_tcp(src_port: u16, dst_port: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(20 + payload.len());
    bytes.extend_from_slice(&src_port.to_be_bytes());
    bytes.extend_from_slice(&dst_port.to_be_bytes());
    bytes.extend_from_slice(&seq.to_be_bytes());
    bytes.extend_from_slice(&0u32.to_be_bytes()); // ack number
    bytes.push(0x50); // data offset 5 words
    bytes.push(0x18); // PSH | ACK
    bytes.extend_from_slice(&[0x20, 0x00]); // window
    bytes.extend_from_slice(&[0, 0, 0, 0]); // checksum + urgent
    bytes.extend_from_slice(payload);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dissector::ParserConfig;
    use crate::dissectors::ip::build_ipv4;

    fn tcp_packet(parser: &mut Parser, seq: u32, ts: i64, payload: &[u8]) -> Packet {
        let tcp = build_tcp(5060, 5060, seq, payload);
        let ip = build_ipv4([10, 0, 0, 1], [10, 0, 0, 2], IPPROTO_TCP, 1, 0, &tcp);
        let mut packet = Packet::with_frame(Frame::new(
            ts,
            ip.len() as u32,
            ip.len() as u32,
            Bytes::from(ip.clone()),
        ));
        parser.dissect(ProtocolId::Ip, &mut packet, Bytes::from(ip));
        packet
    }

    fn sip_invite(body_len: usize) -> String {
        let body = "v".repeat(body_len);
        format!(
            "INVITE sip:bob@example.com SIP/2.0\r\n\
             Call-ID: segmented@example.com\r\n\
             CSeq: 1 INVITE\r\n\
             To: <sip:bob@example.com>\r\n\
             From: <sip:alice@example.com>;tag=123\r\n\
             Content-Length: {body_len}\r\n\r\n{body}"
        )
    }

    #[test]
    fn test_header_fields() {
        let mut parser = Parser::new(ParserConfig::default());
        let packet = tcp_packet(&mut parser, 42, 1, b"x");

        let tcp = packet.tcp_data().expect("tcp data");
        assert_eq!(tcp.src_port, 5060);
        assert_eq!(tcp.dst_port, 5060);
        assert_eq!(tcp.seq, 42);
        assert!(tcp.psh && tcp.ack && !tcp.syn);
    }

    #[test]
    fn test_segmented_sip_message() {
        let mut parser = Parser::new(ParserConfig::default());
        let message = sip_invite(600);
        let bytes = message.as_bytes();
        let (first, second) = bytes.split_at(300);

        // First segment alone cannot parse
        let p1 = tcp_packet(&mut parser, 1000, 1, first);
        assert!(!p1.has_protocol(ProtocolId::Sip));

        // Second segment completes the message
        let p2 = tcp_packet(&mut parser, 1000 + first.len() as u32, 2, second);
        let sip = p2.sip_data().expect("sip data");
        assert_eq!(sip.call_id, "segmented@example.com");
        assert_eq!(sip.payload, message);

        // Frames of both segments, ordered by time
        let stamps: Vec<i64> = p2.frames().iter().map(|f| f.timestamp).collect();
        assert_eq!(stamps, vec![1, 2]);
    }

    fn raw_tcp_packet(seq: u32, payload: &[u8]) -> (Packet, Bytes) {
        use sipdiag_types::Address;

        let tcp = build_tcp(5060, 5060, seq, payload);
        let mut packet = Packet::with_frame(Frame::new(
            1,
            tcp.len() as u32,
            tcp.len() as u32,
            Bytes::from(tcp.clone()),
        ));
        packet.set_proto(ProtoData::Ip(crate::dissectors::ip::IpData {
            src: Address::new("10.0.0.1", 0),
            dst: Address::new("10.0.0.2", 0),
            protocol: IPPROTO_TCP,
            version: 4,
        }));
        (packet, Bytes::from(tcp))
    }

    #[test]
    fn test_non_sip_stream_is_dropped() {
        let mut parser = Parser::new(ParserConfig::default());
        let mut dissector = TcpDissector::new();

        let (mut packet, data) = raw_tcp_packet(1, b"GET / HTTP/1.1\r\n\r\n");
        let out = dissector.dissect(&mut parser, &mut packet, data);

        assert!(out.is_some());
        assert_eq!(dissector.stream_count(), 0);
    }

    #[test]
    fn test_partial_sip_stream_is_retained() {
        let mut parser = Parser::new(ParserConfig::default());
        let mut dissector = TcpDissector::new();

        let message = sip_invite(600);
        let (mut packet, data) = raw_tcp_packet(1, &message.as_bytes()[..300]);
        let out = dissector.dissect(&mut parser, &mut packet, data);

        assert!(out.is_none());
        assert_eq!(dissector.stream_count(), 1);
    }

    #[test]
    fn test_garbage_collection_ages_streams() {
        let mut dissector = TcpDissector::new();
        dissector.assembly.insert(
            "10.0.0.1:1-10.0.0.2:2".to_string(),
            TcpStream::default(),
        );

        for _ in 0..MAX_AGE {
            dissector.collect_garbage();
            assert_eq!(dissector.stream_count(), 1);
        }
        dissector.collect_garbage();
        assert_eq!(dissector.stream_count(), 0);
    }
}
