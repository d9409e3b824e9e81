//! Captured packets and their per-protocol parsed data.

use crate::dissector::ProtocolId;
use crate::dissectors::hep::HepData;
use crate::dissectors::ip::IpData;
use crate::dissectors::mrcp::MrcpData;
use crate::dissectors::rtcp::RtcpData;
use crate::dissectors::rtp::RtpData;
use crate::dissectors::sdp::SdpData;
use crate::dissectors::sip::SipData;
use crate::dissectors::tcp::TcpData;
use crate::dissectors::televt::TelEvtData;
use crate::dissectors::tls::TlsData;
use crate::dissectors::udp::UdpData;
use bytes::Bytes;
use sipdiag_types::Address;

/// A single acquisition unit: one record read from a capture source.
///
/// A packet usually holds one frame; reassembled packets hold the frames
/// of every fragment or segment that contributed to them.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Acquisition timestamp, microseconds since the Unix epoch.
    pub timestamp: i64,
    /// Bytes actually captured.
    pub captured_len: u32,
    /// Bytes on the wire.
    pub wire_len: u32,
    /// Captured bytes.
    pub data: Bytes,
}

impl Frame {
    /// Creates a frame from a raw capture record.
    pub fn new(timestamp: i64, captured_len: u32, wire_len: u32, data: Bytes) -> Self {
        Self {
            timestamp,
            captured_len,
            wire_len,
            data,
        }
    }
}

/// Parsed data attached to a packet by one dissector.
#[derive(Debug, Clone)]
pub enum ProtoData {
    /// IP layer addresses and protocol.
    Ip(IpData),
    /// UDP ports.
    Udp(UdpData),
    /// TCP ports, sequence and flags.
    Tcp(TcpData),
    /// SIP message data.
    Sip(SipData),
    /// SDP session description.
    Sdp(SdpData),
    /// RTP header data and payload.
    Rtp(RtpData),
    /// RTCP statistics.
    Rtcp(RtcpData),
    /// HEP envelope marker.
    Hep(HepData),
    /// TLS record data.
    Tls(TlsData),
    /// MRCP message data.
    Mrcp(MrcpData),
    /// RFC 4733 telephony event.
    TelEvt(TelEvtData),
}

impl ProtoData {
    /// The protocol this data belongs to.
    #[must_use]
    pub fn protocol(&self) -> ProtocolId {
        match self {
            ProtoData::Ip(_) => ProtocolId::Ip,
            ProtoData::Udp(_) => ProtocolId::Udp,
            ProtoData::Tcp(_) => ProtocolId::Tcp,
            ProtoData::Sip(_) => ProtocolId::Sip,
            ProtoData::Sdp(_) => ProtocolId::Sdp,
            ProtoData::Rtp(_) => ProtocolId::Rtp,
            ProtoData::Rtcp(_) => ProtocolId::Rtcp,
            ProtoData::Hep(_) => ProtocolId::Hep,
            ProtoData::Tls(_) => ProtocolId::Tls,
            ProtoData::Mrcp(_) => ProtocolId::Mrcp,
            ProtoData::TelEvt(_) => ProtocolId::TelEvt,
        }
    }
}

/// A captured packet: ordered frames plus a sparse per-protocol data map.
#[derive(Debug)]
pub struct Packet {
    frames: Vec<Frame>,
    proto: Vec<Option<ProtoData>>,
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

impl Packet {
    /// Creates an empty packet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: Vec::with_capacity(1),
            proto: (0..ProtocolId::COUNT).map(|_| None).collect(),
        }
    }

    /// Creates a packet holding a single frame.
    #[must_use]
    pub fn with_frame(frame: Frame) -> Self {
        let mut packet = Self::new();
        packet.frames.push(frame);
        packet
    }

    /// The frames of this packet, ordered by acquisition time.
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// First frame, when any.
    #[must_use]
    pub fn first_frame(&self) -> Option<&Frame> {
        self.frames.first()
    }

    /// Appends a frame, keeping the list ordered by timestamp.
    pub fn push_frame(&mut self, frame: Frame) {
        let at = self
            .frames
            .partition_point(|f| f.timestamp <= frame.timestamp);
        self.frames.insert(at, frame);
    }

    /// Replaces the frame list with `frames`, sorted by timestamp.
    pub fn set_frames(&mut self, mut frames: Vec<Frame>) {
        frames.sort_by_key(|f| f.timestamp);
        self.frames = frames;
    }

    /// Drops frame payloads, keeping the parsed protocol data only.
    pub fn clear_frames(&mut self) {
        self.frames.clear();
    }

    /// Timestamp of the first frame, microseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.frames.first().map_or(0, |f| f.timestamp)
    }

    /// Overwrites the first frame's timestamp (HEP carries its own).
    pub fn set_timestamp(&mut self, timestamp: i64) {
        if let Some(frame) = self.frames.first_mut() {
            frame.timestamp = timestamp;
        }
    }

    /// Sum of captured bytes over all frames.
    #[must_use]
    pub fn captured_bytes(&self) -> usize {
        self.frames.iter().map(|f| f.data.len()).sum()
    }

    /// Attaches parsed protocol data, replacing any previous data for
    /// the same protocol.
    pub fn set_proto(&mut self, data: ProtoData) {
        let id = data.protocol();
        self.proto[id as usize] = Some(data);
    }

    /// Whether `id` has been dissected on this packet.
    #[must_use]
    pub fn has_protocol(&self, id: ProtocolId) -> bool {
        self.proto[id as usize].is_some()
    }

    /// Raw protocol data slot.
    #[must_use]
    pub fn proto_data(&self, id: ProtocolId) -> Option<&ProtoData> {
        self.proto[id as usize].as_ref()
    }

    /// IP layer data, when dissected.
    #[must_use]
    pub fn ip_data(&self) -> Option<&IpData> {
        match self.proto_data(ProtocolId::Ip) {
            Some(ProtoData::Ip(data)) => Some(data),
            _ => None,
        }
    }

    /// UDP layer data, when dissected.
    #[must_use]
    pub fn udp_data(&self) -> Option<&UdpData> {
        match self.proto_data(ProtocolId::Udp) {
            Some(ProtoData::Udp(data)) => Some(data),
            _ => None,
        }
    }

    /// TCP layer data, when dissected.
    #[must_use]
    pub fn tcp_data(&self) -> Option<&TcpData> {
        match self.proto_data(ProtocolId::Tcp) {
            Some(ProtoData::Tcp(data)) => Some(data),
            _ => None,
        }
    }

    /// SIP message data, when dissected.
    #[must_use]
    pub fn sip_data(&self) -> Option<&SipData> {
        match self.proto_data(ProtocolId::Sip) {
            Some(ProtoData::Sip(data)) => Some(data),
            _ => None,
        }
    }

    /// SDP session data, when dissected.
    #[must_use]
    pub fn sdp_data(&self) -> Option<&SdpData> {
        match self.proto_data(ProtocolId::Sdp) {
            Some(ProtoData::Sdp(data)) => Some(data),
            _ => None,
        }
    }

    /// RTP data, when dissected.
    #[must_use]
    pub fn rtp_data(&self) -> Option<&RtpData> {
        match self.proto_data(ProtocolId::Rtp) {
            Some(ProtoData::Rtp(data)) => Some(data),
            _ => None,
        }
    }

    /// RTCP data, when dissected.
    #[must_use]
    pub fn rtcp_data(&self) -> Option<&RtcpData> {
        match self.proto_data(ProtocolId::Rtcp) {
            Some(ProtoData::Rtcp(data)) => Some(data),
            _ => None,
        }
    }

    /// Telephony-event data, when dissected.
    #[must_use]
    pub fn televt_data(&self) -> Option<&TelEvtData> {
        match self.proto_data(ProtocolId::TelEvt) {
            Some(ProtoData::TelEvt(data)) => Some(data),
            _ => None,
        }
    }

    /// Source address combining the IP and transport layers.
    #[must_use]
    pub fn src_address(&self) -> Option<Address> {
        let ip = self.ip_data()?;
        let port = self
            .udp_data()
            .map(|u| u.src_port)
            .or_else(|| self.tcp_data().map(|t| t.src_port))
            .unwrap_or(0);
        Some(Address::new(ip.src.ip.clone(), port))
    }

    /// Destination address combining the IP and transport layers.
    #[must_use]
    pub fn dst_address(&self) -> Option<Address> {
        let ip = self.ip_data()?;
        let port = self
            .udp_data()
            .map(|u| u.dst_port)
            .or_else(|| self.tcp_data().map(|t| t.dst_port))
            .unwrap_or(0);
        Some(Address::new(ip.dst.ip.clone(), port))
    }

    /// Transport name for display purposes.
    #[must_use]
    pub fn transport(&self) -> &'static str {
        if self.has_protocol(ProtocolId::Hep) {
            "HEP"
        } else if self.has_protocol(ProtocolId::Tls) {
            "TLS"
        } else if self.has_protocol(ProtocolId::Tcp) {
            "TCP"
        } else if self.has_protocol(ProtocolId::Udp) {
            "UDP"
        } else {
            ""
        }
    }
}
