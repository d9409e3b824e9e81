//! Datalink layer dissector.
//!
//! Strips the link-layer header according to the capture's datalink type
//! and hands the remainder to the IP dissector.

use crate::dissector::{Parser, ProtocolId};
use crate::packet::Packet;
use bytes::Bytes;

/// Ethernet (pcap LINKTYPE number).
pub const LINKTYPE_ETHERNET: i32 = 1;
/// IEEE 802.5 token ring.
pub const LINKTYPE_IEEE802: i32 = 6;
/// SLIP.
pub const LINKTYPE_SLIP: i32 = 8;
/// PPP.
pub const LINKTYPE_PPP: i32 = 9;
/// FDDI.
pub const LINKTYPE_FDDI: i32 = 10;
/// BSD loopback.
pub const LINKTYPE_NULL: i32 = 0;
/// OpenBSD loopback.
pub const LINKTYPE_LOOP: i32 = 108;
/// PPP over serial with HDLC framing.
pub const LINKTYPE_PPP_HDLC: i32 = 50;
/// PPP over Ethernet.
pub const LINKTYPE_PPP_ETHER: i32 = 51;
/// Raw IP.
pub const LINKTYPE_RAW: i32 = 101;
/// OpenBSD enc(4) encapsulation.
pub const LINKTYPE_ENC: i32 = 109;
/// Linux cooked capture.
pub const LINKTYPE_LINUX_SLL: i32 = 113;
/// Solaris ipnet pseudo-device.
pub const LINKTYPE_IPNET: i32 = 226;
/// Linux netfilter log.
pub const LINKTYPE_NFLOG: i32 = 239;

/// 802.1Q VLAN tag ethertype.
const ETHERTYPE_8021Q: u16 = 0x8100;

/// NFLOG TLV type carrying the packet payload.
const NFULA_PAYLOAD: u16 = 9;

/// Returns the fixed header size for a known datalink type.
#[must_use]
pub fn header_size(link_type: i32) -> Option<usize> {
    match link_type {
        LINKTYPE_ETHERNET => Some(14),
        LINKTYPE_IEEE802 => Some(22),
        LINKTYPE_NULL | LINKTYPE_LOOP => Some(4),
        LINKTYPE_SLIP => Some(16),
        LINKTYPE_PPP | LINKTYPE_PPP_HDLC | LINKTYPE_PPP_ETHER => Some(4),
        LINKTYPE_RAW => Some(0),
        LINKTYPE_FDDI => Some(21),
        LINKTYPE_ENC => Some(12),
        LINKTYPE_NFLOG => Some(4),
        LINKTYPE_LINUX_SLL => Some(16),
        LINKTYPE_IPNET => Some(24),
        _ => None,
    }
}

/// Datalink header stripper.
#[derive(Debug)]
pub struct LinkDissector {
    link_type: i32,
    link_size: usize,
}

impl LinkDissector {
    /// Creates a link dissector for the given datalink type.
    #[must_use]
    pub fn new(link_type: i32) -> Self {
        Self {
            link_type,
            link_size: header_size(link_type).unwrap_or(0),
        }
    }

    /// Strips the link header and passes the payload to IP.
    pub fn dissect(
        &mut self,
        parser: &mut Parser,
        packet: &mut Packet,
        data: Bytes,
    ) -> Option<Bytes> {
        if header_size(self.link_type).is_none() {
            // Unknown link type produces no output
            return None;
        }

        let mut offset = self.link_size;

        // Ethernet and cooked captures may carry a VLAN tag
        if self.link_type == LINKTYPE_ETHERNET && data.len() >= 14 {
            let ether_type = u16::from_be_bytes([data[12], data[13]]);
            if ether_type == ETHERTYPE_8021Q {
                offset += 4;
            }
        }

        if self.link_type == LINKTYPE_LINUX_SLL && data.len() >= 16 {
            let protocol = u16::from_be_bytes([data[14], data[15]]);
            if protocol == ETHERTYPE_8021Q {
                offset += 4;
            }
        }

        // NFLOG wraps the payload in TLVs, 4-byte aligned
        if self.link_type == LINKTYPE_NFLOG {
            while offset + 4 <= data.len() {
                let tlv_length = u16::from_le_bytes([data[offset], data[offset + 1]]) as usize;
                let tlv_type = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);

                if tlv_type == NFULA_PAYLOAD {
                    offset += 4;
                    break;
                }

                if tlv_length < 4 {
                    break;
                }
                offset += (tlv_length + 3) & !3;
            }
        }

        if data.len() <= offset {
            return None;
        }

        parser.dissect_next(ProtocolId::Link, packet, data.slice(offset..))
    }
}
