//! TLS record-layer recognition.
//!
//! Identifies TLS records on reassembled TCP streams so encrypted SIP
//! traffic is labeled as such. Payload decryption is out of scope; the
//! record content is never inspected further.

use crate::dissector::Parser;
use crate::packet::{Packet, ProtoData};
use bytes::Bytes;

/// TLS record header length.
const TLS_RECORD_HDR: usize = 5;

/// TLS record content types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsContentType {
    /// Change cipher spec (20).
    ChangeCipherSpec,
    /// Alert (21).
    Alert,
    /// Handshake (22).
    Handshake,
    /// Application data (23).
    ApplicationData,
}

impl TlsContentType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            20 => Some(Self::ChangeCipherSpec),
            21 => Some(Self::Alert),
            22 => Some(Self::Handshake),
            23 => Some(Self::ApplicationData),
            _ => None,
        }
    }
}

/// TLS record data attached to a packet.
#[derive(Debug, Clone)]
pub struct TlsData {
    /// Content type of the first record.
    pub content_type: TlsContentType,
    /// Protocol version bytes (3.1 = TLS 1.0 ... 3.4 = TLS 1.3).
    pub version: (u8, u8),
    /// Declared length of the first record.
    pub record_len: u16,
}

/// TLS record dissector.
#[derive(Debug)]
pub struct TlsDissector;

impl TlsDissector {
    /// Validates a TLS record header.
    pub fn dissect(
        &mut self,
        _parser: &mut Parser,
        packet: &mut Packet,
        data: Bytes,
    ) -> Option<Bytes> {
        if data.len() < TLS_RECORD_HDR {
            return Some(data);
        }

        let Some(content_type) = TlsContentType::from_byte(data[0]) else {
            return Some(data);
        };

        let (major, minor) = (data[1], data[2]);
        if major != 3 || minor > 4 {
            return Some(data);
        }

        packet.set_proto(ProtoData::Tls(TlsData {
            content_type,
            version: (major, minor),
            record_len: u16::from_be_bytes([data[3], data[4]]),
        }));

        None
    }
}
