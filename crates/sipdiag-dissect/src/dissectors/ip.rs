//! IPv4 / IPv6 dissector with datagram reassembly.

use crate::dissector::{Parser, ProtocolId};
use crate::packet::{Frame, Packet};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sipdiag_types::Address;
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::debug;

/// IPv6 fragment extension header number.
const IPPROTO_FRAGMENT: u8 = 44;

/// Upper bound of fragments per datagram; generous enough for a 20 KB
/// SIP message split at common MTUs.
const MAX_FRAGMENTS: usize = 16;

/// IP layer data attached to a packet.
#[derive(Debug, Clone)]
pub struct IpData {
    /// Source address (port not yet known).
    pub src: Address,
    /// Destination address (port not yet known).
    pub dst: Address,
    /// Transport protocol number.
    pub protocol: u8,
    /// IP version, 4 or 6.
    pub version: u8,
}

/// What to do when a fragment overlaps previously-seen data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentOverlapPolicy {
    /// Accept the fragment; on reassembly the latest write wins.
    #[default]
    LastWins,
    /// Drop the whole datagram when an overlap is detected.
    Reject,
}

/// One received fragment, pending reassembly.
#[derive(Debug)]
struct IpFragment {
    offset: usize,
    data: Bytes,
    frames: Vec<Frame>,
}

/// A partially reassembled IP datagram.
#[derive(Debug)]
struct Datagram {
    src_ip: String,
    dst_ip: String,
    id: u32,
    fragments: Vec<IpFragment>,
    seen: usize,
    expected: Option<usize>,
}

impl Datagram {
    fn complete(&self) -> bool {
        self.expected == Some(self.seen)
    }
}

/// Header fields shared by the v4 and v6 parse paths.
struct IpHeader {
    version: u8,
    header_len: usize,
    total_len: usize,
    protocol: u8,
    id: u32,
    frag_offset: usize,
    more_fragments: bool,
    fragmented: bool,
    src: String,
    dst: String,
}

/// IP dissector holding the fragment assembly table.
#[derive(Debug)]
pub struct IpDissector {
    overlap: FragmentOverlapPolicy,
    assembly: Vec<Datagram>,
}

impl IpDissector {
    /// Creates an IP dissector with the given overlap policy.
    #[must_use]
    pub fn new(overlap: FragmentOverlapPolicy) -> Self {
        Self {
            overlap,
            assembly: Vec::new(),
        }
    }

    fn parse_header(data: &Bytes) -> Option<IpHeader> {
        let version = data.first()? >> 4;
        match version {
            4 => Self::parse_v4(data),
            6 => Self::parse_v6(data),
            _ => None,
        }
    }

    fn parse_v4(data: &Bytes) -> Option<IpHeader> {
        if data.len() < 20 {
            return None;
        }

        let header_len = ((data[0] & 0x0f) as usize) * 4;
        if header_len < 20 || data.len() < header_len {
            return None;
        }

        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let id = u32::from(u16::from_be_bytes([data[4], data[5]]));
        let off_field = u16::from_be_bytes([data[6], data[7]]);
        let more_fragments = off_field & 0x2000 != 0;
        let frag_offset = ((off_field & 0x1fff) as usize) * 8;

        Some(IpHeader {
            version: 4,
            header_len,
            total_len,
            protocol: data[9],
            id,
            frag_offset,
            more_fragments,
            fragmented: more_fragments || frag_offset != 0,
            src: Ipv4Addr::new(data[12], data[13], data[14], data[15]).to_string(),
            dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]).to_string(),
        })
    }

    fn parse_v6(data: &Bytes) -> Option<IpHeader> {
        if data.len() < 40 {
            return None;
        }

        let payload_len = u16::from_be_bytes([data[4], data[5]]) as usize;
        let next_header = data[6];

        let mut src_bytes = [0u8; 16];
        src_bytes.copy_from_slice(&data[8..24]);
        let mut dst_bytes = [0u8; 16];
        dst_bytes.copy_from_slice(&data[24..40]);

        let mut header = IpHeader {
            version: 6,
            header_len: 40,
            total_len: 40 + payload_len,
            protocol: next_header,
            id: 0,
            frag_offset: 0,
            more_fragments: false,
            fragmented: false,
            src: Ipv6Addr::from(src_bytes).to_string(),
            dst: Ipv6Addr::from(dst_bytes).to_string(),
        };

        if next_header == IPPROTO_FRAGMENT {
            if data.len() < 48 {
                return None;
            }
            let offlg = u16::from_be_bytes([data[42], data[43]]);
            header.protocol = data[40];
            header.frag_offset = (offlg & !0x7) as usize;
            header.more_fragments = offlg & 0x1 != 0;
            header.fragmented = true;
            header.id = u32::from_be_bytes([data[44], data[45], data[46], data[47]]);
            header.header_len = 48;
        }

        Some(header)
    }

    fn find_datagram(&mut self, header: &IpHeader) -> Option<usize> {
        self.assembly.iter().position(|d| {
            d.src_ip == header.src && d.dst_ip == header.dst && d.id == header.id
        })
    }

    /// Reassembles a completed datagram into a payload buffer and the
    /// frames of every contributing packet.
    fn reassemble(datagram: Datagram) -> (Bytes, Vec<Frame>) {
        let size = datagram.expected.unwrap_or(0);
        let mut buffer = vec![0u8; size];
        let mut frames = Vec::new();

        // Write in arrival order so overlapping data keeps the latest copy
        for fragment in datagram.fragments {
            let end = (fragment.offset + fragment.data.len()).min(size);
            if fragment.offset < end {
                buffer[fragment.offset..end]
                    .copy_from_slice(&fragment.data[..end - fragment.offset]);
            }
            frames.extend(fragment.frames);
        }

        (Bytes::from(buffer), frames)
    }

    /// Dissects an IP header, reassembling fragmented datagrams.
    pub fn dissect(
        &mut self,
        parser: &mut Parser,
        packet: &mut Packet,
        data: Bytes,
    ) -> Option<Bytes> {
        let header = Self::parse_header(&data)?;

        if header.total_len <= header.header_len {
            return None;
        }

        packet.set_proto(crate::packet::ProtoData::Ip(IpData {
            src: Address::new(header.src.clone(), 0),
            dst: Address::new(header.dst.clone(), 0),
            protocol: header.protocol,
            version: header.version,
        }));

        // Trust the IP length field and drop any trailer
        let payload_end = header.total_len.min(data.len());
        let payload = data.slice(header.header_len..payload_end);

        if !header.fragmented {
            return parser.dissect_next(ProtocolId::Ip, packet, payload);
        }

        let index = match self.find_datagram(&header) {
            Some(index) => index,
            None => {
                self.assembly.push(Datagram {
                    src_ip: header.src.clone(),
                    dst_ip: header.dst.clone(),
                    id: header.id,
                    fragments: Vec::new(),
                    seen: 0,
                    expected: None,
                });
                self.assembly.len() - 1
            }
        };

        let datagram = &mut self.assembly[index];

        if self.overlap == FragmentOverlapPolicy::Reject {
            let start = header.frag_offset;
            let end = start + payload.len();
            let overlaps = datagram
                .fragments
                .iter()
                .any(|f| start < f.offset + f.data.len() && f.offset < end);
            if overlaps {
                debug!(id = header.id, "dropping datagram with overlapping fragment");
                self.assembly.remove(index);
                return None;
            }
        }

        datagram.seen += payload.len();
        if !header.more_fragments {
            datagram.expected = Some(header.frag_offset + payload.len());
        }
        datagram.fragments.push(IpFragment {
            offset: header.frag_offset,
            data: payload,
            frames: packet.frames().to_vec(),
        });

        if datagram.fragments.len() > MAX_FRAGMENTS {
            debug!(id = header.id, "dropping datagram with too many fragments");
            self.assembly.remove(index);
            return None;
        }

        if !datagram.complete() {
            // Held until the remaining fragments arrive
            return None;
        }

        let datagram = self.assembly.remove(index);
        let (joined, frames) = Self::reassemble(datagram);
        packet.set_frames(frames);

        parser.dissect_next(ProtocolId::Ip, packet, joined)
    }
}

/// Builds a minimal IPv4 header around `payload` for dissector tests.
#[cfg(test)]
pub(crate) fn build_ipv4(
    src: [u8; 4],
    dst: [u8; 4],
    protocol: u8,
    id: u16,
    frag_field: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = (20 + payload.len()) as u16;
    let mut bytes = vec![0x45, 0x00];
    bytes.extend_from_slice(&total_len.to_be_bytes());
    bytes.extend_from_slice(&id.to_be_bytes());
    bytes.extend_from_slice(&frag_field.to_be_bytes());
    bytes.push(64); // ttl
    bytes.push(protocol);
    bytes.extend_from_slice(&[0, 0]); // checksum, unchecked
    bytes.extend_from_slice(&src);
    bytes.extend_from_slice(&dst);
    bytes.extend_from_slice(payload);
    bytes
}
