//! UDP dissector.

use crate::dissector::{Parser, ProtocolId};
use crate::packet::{Packet, ProtoData};
use bytes::Bytes;

/// UDP protocol number in the IP header.
const IPPROTO_UDP: u8 = 17;

/// UDP header length.
const UDP_HDR_LENGTH: usize = 8;

/// UDP layer data attached to a packet.
#[derive(Debug, Clone)]
pub struct UdpData {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
}

/// UDP header stripper.
#[derive(Debug)]
pub struct UdpDissector;

impl UdpDissector {
    /// Strips the UDP header and offers the payload to SIP, RTP, RTCP
    /// and HEP in that order.
    pub fn dissect(
        &mut self,
        parser: &mut Parser,
        packet: &mut Packet,
        data: Bytes,
    ) -> Option<Bytes> {
        let is_udp = packet.ip_data().is_some_and(|ip| ip.protocol == IPPROTO_UDP);
        if !is_udp {
            return Some(data);
        }

        if data.len() < UDP_HDR_LENGTH {
            return Some(data);
        }

        packet.set_proto(ProtoData::Udp(UdpData {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
        }));

        parser.dissect_next(ProtocolId::Udp, packet, data.slice(UDP_HDR_LENGTH..))
    }
}

/// Builds a UDP header around `payload` for dissector tests.
#[cfg(test)]
pub(crate) fn build_udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(UDP_HDR_LENGTH + payload.len());
    bytes.extend_from_slice(&src_port.to_be_bytes());
    bytes.extend_from_slice(&dst_port.to_be_bytes());
    bytes.extend_from_slice(&((UDP_HDR_LENGTH + payload.len()) as u16).to_be_bytes());
    bytes.extend_from_slice(&[0, 0]); // checksum, unchecked
    bytes.extend_from_slice(payload);
    bytes
}
