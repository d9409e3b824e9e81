//! SIP messages inside a call.

use crate::attribute::Attribute;
use chrono::DateTime;
use sipdiag_dissect::dissectors::sdp::SdpMedia;
use sipdiag_dissect::dissectors::sip::{Method, SipCode, SipData};
use sipdiag_dissect::Packet;
use sipdiag_types::Address;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One SIP message, created when a dissected packet joins a call.
///
/// The message keeps its packet alive through the shared reference; the
/// attribute map caches immutable derived values on first read.
#[derive(Debug)]
pub struct Message {
    packet: Arc<Packet>,
    timestamp: i64,
    src: Address,
    dst: Address,
    retrans: bool,
    attrs: Mutex<HashMap<Attribute, String>>,
}

impl Message {
    /// Builds a message from a packet carrying SIP data.
    ///
    /// Returns `None` when the packet has no SIP data.
    #[must_use]
    pub fn from_packet(packet: Arc<Packet>) -> Option<Self> {
        packet.sip_data()?;
        let src = packet.src_address().unwrap_or_default();
        let dst = packet.dst_address().unwrap_or_default();

        Some(Self {
            timestamp: packet.timestamp(),
            src,
            dst,
            retrans: false,
            attrs: Mutex::new(HashMap::new()),
            packet,
        })
    }

    /// The underlying packet.
    #[must_use]
    pub fn packet(&self) -> &Arc<Packet> {
        &self.packet
    }

    /// The parsed SIP data of the packet.
    #[must_use]
    pub fn sip(&self) -> &SipData {
        self.packet
            .sip_data()
            .expect("message packet carries SIP data")
    }

    /// Capture timestamp, microseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Source address.
    #[must_use]
    pub fn src(&self) -> &Address {
        &self.src
    }

    /// Destination address.
    #[must_use]
    pub fn dst(&self) -> &Address {
        &self.dst
    }

    /// Request method or response status.
    #[must_use]
    pub fn code(&self) -> SipCode {
        self.sip().code
    }

    /// True for requests.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.sip().is_request()
    }

    /// Request method, when this is a request.
    #[must_use]
    pub fn method(&self) -> Option<Method> {
        self.sip().code.method()
    }

    /// CSeq number.
    #[must_use]
    pub fn cseq(&self) -> u64 {
        self.sip().cseq
    }

    /// True when the To header carried no tag yet.
    #[must_use]
    pub fn is_initial_transaction(&self) -> bool {
        self.sip().initial
    }

    /// Whole message text.
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.sip().payload
    }

    /// Marks this message as a retransmission of an earlier one.
    pub(crate) fn set_retrans(&mut self, retrans: bool) {
        self.retrans = retrans;
    }

    /// True when this message repeats the previous one byte for byte.
    #[must_use]
    pub fn is_retrans(&self) -> bool {
        self.retrans
    }

    /// The SDP media of this message matching a destination address.
    ///
    /// Falls back to the first media so late port changes still pair.
    #[must_use]
    pub fn media_for_address(&self, dst: &Address) -> Option<&SdpMedia> {
        let medias = &self.packet.sdp_data()?.medias;
        medias
            .iter()
            .find(|m| m.address == *dst || m.rtp_port == dst.port)
            .or_else(|| medias.first())
    }

    /// Message-scoped attribute value.
    ///
    /// Immutable attributes are cached on first read.
    #[must_use]
    pub fn attribute(&self, attr: Attribute) -> String {
        if !attr.is_mutable() {
            if let Some(cached) = self.attrs.lock().unwrap().get(&attr) {
                return cached.clone();
            }
        }

        let value = self.compute_attribute(attr);

        let mut cache = self.attrs.lock().unwrap();
        match cache.get(&attr) {
            // Mutable values only replace the cache when they changed
            Some(cached) if *cached == value => {}
            _ => {
                cache.insert(attr, value.clone());
            }
        }

        value
    }

    fn compute_attribute(&self, attr: Attribute) -> String {
        let sip = self.sip();
        match attr {
            Attribute::SipFrom => sip.from.clone().unwrap_or_default(),
            Attribute::SipFromUser => sip.from_user.clone().unwrap_or_default(),
            Attribute::SipTo => sip.to.clone().unwrap_or_default(),
            Attribute::SipToUser => sip.to_user.clone().unwrap_or_default(),
            Attribute::Src => self.src.to_string(),
            Attribute::Dst => self.dst.to_string(),
            Attribute::CallId => sip.call_id.clone(),
            Attribute::XCallId => sip.x_call_id.clone().unwrap_or_default(),
            Attribute::Date => format_date(self.timestamp),
            Attribute::Time => format_time(self.timestamp),
            Attribute::Method => sip.code_text.clone(),
            Attribute::Transport => self.packet.transport().to_string(),
            Attribute::Reason => sip.reason_text.clone().unwrap_or_default(),
            Attribute::Warning => sip.warning.map(|w| w.to_string()).unwrap_or_default(),
            // Call-scoped attributes are answered by the call
            _ => String::new(),
        }
    }
}

/// `YYYY/MM/DD` from a microsecond timestamp.
#[must_use]
pub fn format_date(timestamp: i64) -> String {
    DateTime::from_timestamp_micros(timestamp)
        .map(|dt| dt.format("%Y/%m/%d").to_string())
        .unwrap_or_default()
}

/// `HH:MM:SS.uuuuuu` from a microsecond timestamp.
#[must_use]
pub fn format_time(timestamp: i64) -> String {
    DateTime::from_timestamp_micros(timestamp)
        .map(|dt| dt.format("%H:%M:%S%.6f").to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sipdiag_dissect::dissector::{Parser, ParserConfig, ProtocolId};
    use sipdiag_dissect::Frame;

    fn sip_message(payload: &str) -> Message {
        let mut parser = Parser::new(ParserConfig::default());
        let mut packet = Packet::with_frame(Frame::new(
            1_500_000_000_123_456,
            payload.len() as u32,
            payload.len() as u32,
            Bytes::from(payload.to_string()),
        ));
        parser.dissect(
            ProtocolId::Sip,
            &mut packet,
            Bytes::from(payload.to_string()),
        );
        Message::from_packet(Arc::new(packet)).expect("sip message")
    }

    const INVITE: &str = "INVITE sip:bob@example.com SIP/2.0\r\n\
        Call-ID: msg@example.com\r\n\
        CSeq: 1 INVITE\r\n\
        From: <sip:alice@example.com>;tag=a\r\n\
        To: <sip:bob@example.com>\r\n\r\n";

    #[test]
    fn test_message_fields() {
        let msg = sip_message(INVITE);
        assert_eq!(msg.method(), Some(Method::Invite));
        assert_eq!(msg.cseq(), 1);
        assert!(msg.is_initial_transaction());
        assert!(!msg.is_retrans());
    }

    #[test]
    fn test_attribute_cache() {
        let msg = sip_message(INVITE);
        assert_eq!(msg.attribute(Attribute::CallId), "msg@example.com");
        assert_eq!(msg.attribute(Attribute::SipFromUser), "alice");
        // Second read comes from the cache
        assert_eq!(msg.attribute(Attribute::CallId), "msg@example.com");
    }

    #[test]
    fn test_time_formatting() {
        assert_eq!(format_date(1_500_000_000_123_456), "2017/07/14");
        assert_eq!(format_time(1_500_000_000_123_456), "02:40:00.123456");
    }
}
