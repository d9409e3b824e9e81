//! Dissector registry and protocol chaining.

use crate::dissectors::hep::HepDissector;
use crate::dissectors::ip::{FragmentOverlapPolicy, IpDissector};
use crate::dissectors::link::LinkDissector;
use crate::dissectors::mrcp::MrcpDissector;
use crate::dissectors::rtcp::RtcpDissector;
use crate::dissectors::rtp::RtpDissector;
use crate::dissectors::sdp::SdpDissector;
use crate::dissectors::sip::SipDissector;
use crate::dissectors::tcp::TcpDissector;
use crate::dissectors::televt::TelEvtDissector;
use crate::dissectors::tls::TlsDissector;
use crate::dissectors::udp::UdpDissector;
use crate::packet::Packet;
use bytes::Bytes;
use sipdiag_types::config::{DissectorConfig, HepListenConfig};

/// Stable identifier of every protocol the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(usize)]
pub enum ProtocolId {
    /// Datalink layer (Ethernet, SLL, NFLOG, ...).
    Link = 0,
    /// IPv4 / IPv6.
    Ip,
    /// UDP.
    Udp,
    /// TCP.
    Tcp,
    /// SIP.
    Sip,
    /// SDP (SIP message bodies).
    Sdp,
    /// RTP.
    Rtp,
    /// RTCP.
    Rtcp,
    /// HEP / EEP capture envelope.
    Hep,
    /// TLS record layer.
    Tls,
    /// MRCPv2.
    Mrcp,
    /// RFC 4733 telephony events (DTMF).
    TelEvt,
}

impl ProtocolId {
    /// Number of protocol identifiers.
    pub const COUNT: usize = 12;

    /// Human-readable dissector name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ProtocolId::Link => "link",
            ProtocolId::Ip => "ip",
            ProtocolId::Udp => "udp",
            ProtocolId::Tcp => "tcp",
            ProtocolId::Sip => "sip",
            ProtocolId::Sdp => "sdp",
            ProtocolId::Rtp => "rtp",
            ProtocolId::Rtcp => "rtcp",
            ProtocolId::Hep => "hep",
            ProtocolId::Tls => "tls",
            ProtocolId::Mrcp => "mrcp",
            ProtocolId::TelEvt => "televt",
        }
    }

    /// Sub-dissectors attempted, in order, after this protocol parses.
    #[must_use]
    pub fn sub_dissectors(self) -> &'static [ProtocolId] {
        match self {
            ProtocolId::Link => &[ProtocolId::Ip],
            ProtocolId::Ip => &[ProtocolId::Udp, ProtocolId::Tcp],
            ProtocolId::Udp => &[
                ProtocolId::Sip,
                ProtocolId::Rtp,
                ProtocolId::Rtcp,
                ProtocolId::Hep,
            ],
            ProtocolId::Tcp => &[ProtocolId::Sip, ProtocolId::Tls, ProtocolId::Mrcp],
            ProtocolId::Sip => &[ProtocolId::Sdp],
            ProtocolId::Rtp => &[ProtocolId::TelEvt],
            ProtocolId::Hep => &[ProtocolId::Sip],
            _ => &[],
        }
    }
}

/// Per-input parser configuration.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Enabled-protocol toggles.
    pub dissectors: DissectorConfig,
    /// Datalink type of the owning capture input (pcap LINKTYPE number).
    pub link_type: i32,
    /// HEP listener settings (password / UUID handling).
    pub hep: HepListenConfig,
    /// IP fragment overlap policy.
    pub overlap: FragmentOverlapPolicy,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            dissectors: DissectorConfig::default(),
            link_type: crate::dissectors::link::LINKTYPE_ETHERNET,
            hep: HepListenConfig::default(),
            overlap: FragmentOverlapPolicy::default(),
        }
    }
}

/// One dissector instance, holding its reassembly state where needed.
enum Slot {
    Link(LinkDissector),
    Ip(IpDissector),
    Udp(UdpDissector),
    Tcp(TcpDissector),
    Sip(SipDissector),
    Sdp(SdpDissector),
    Rtp(RtpDissector),
    Rtcp(RtcpDissector),
    Hep(HepDissector),
    Tls(TlsDissector),
    Mrcp(MrcpDissector),
    TelEvt(TelEvtDissector),
}

impl Slot {
    fn dissect(&mut self, parser: &mut Parser, packet: &mut Packet, data: Bytes) -> Option<Bytes> {
        match self {
            Slot::Link(d) => d.dissect(parser, packet, data),
            Slot::Ip(d) => d.dissect(parser, packet, data),
            Slot::Udp(d) => d.dissect(parser, packet, data),
            Slot::Tcp(d) => d.dissect(parser, packet, data),
            Slot::Sip(d) => d.dissect(parser, packet, data),
            Slot::Sdp(d) => d.dissect(parser, packet, data),
            Slot::Rtp(d) => d.dissect(parser, packet, data),
            Slot::Rtcp(d) => d.dissect(parser, packet, data),
            Slot::Hep(d) => d.dissect(parser, packet, data),
            Slot::Tls(d) => d.dissect(parser, packet, data),
            Slot::Mrcp(d) => d.dissect(parser, packet, data),
            Slot::TelEvt(d) => d.dissect(parser, packet, data),
        }
    }
}

/// Per-input dissector tree.
///
/// Holds one lazily-created dissector per protocol; stateful dissectors
/// (IP fragment assembly, TCP stream assembly) keep their tables here, so
/// every capture input reassembles independently.
pub struct Parser {
    config: ParserConfig,
    slots: Vec<Option<Slot>>,
}

impl Parser {
    /// Creates a parser for an input with the given configuration.
    #[must_use]
    pub fn new(config: ParserConfig) -> Self {
        Self {
            config,
            slots: (0..ProtocolId::COUNT).map(|_| None).collect(),
        }
    }

    /// The configuration this parser was built with.
    #[must_use]
    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Whether a protocol is enabled by configuration.
    #[must_use]
    pub fn enabled(&self, id: ProtocolId) -> bool {
        let toggles = &self.config.dissectors;
        match id {
            ProtocolId::Ip => toggles.ip,
            ProtocolId::Udp => toggles.udp,
            ProtocolId::Tcp => toggles.tcp,
            ProtocolId::Sip => toggles.sip,
            ProtocolId::Sdp => toggles.sdp,
            ProtocolId::Rtp => toggles.rtp,
            ProtocolId::Rtcp => toggles.rtcp,
            ProtocolId::Hep => toggles.hep,
            ProtocolId::Tls => toggles.tls,
            _ => true,
        }
    }

    fn build(&self, id: ProtocolId) -> Slot {
        match id {
            ProtocolId::Link => Slot::Link(LinkDissector::new(self.config.link_type)),
            ProtocolId::Ip => Slot::Ip(IpDissector::new(self.config.overlap)),
            ProtocolId::Udp => Slot::Udp(UdpDissector),
            ProtocolId::Tcp => Slot::Tcp(TcpDissector::new()),
            ProtocolId::Sip => Slot::Sip(SipDissector),
            ProtocolId::Sdp => Slot::Sdp(SdpDissector),
            ProtocolId::Rtp => Slot::Rtp(RtpDissector),
            ProtocolId::Rtcp => Slot::Rtcp(RtcpDissector),
            ProtocolId::Hep => Slot::Hep(HepDissector::new(self.config.hep.clone())),
            ProtocolId::Tls => Slot::Tls(TlsDissector),
            ProtocolId::Mrcp => Slot::Mrcp(MrcpDissector),
            ProtocolId::TelEvt => Slot::TelEvt(TelEvtDissector),
        }
    }

    /// Runs the dissector for `id` over `data`.
    ///
    /// Returns `None` when the bytes were fully consumed, or the
    /// remaining (possibly untouched) bytes otherwise. Disabled
    /// protocols return the input unchanged, stopping the chain there.
    pub fn dissect(&mut self, id: ProtocolId, packet: &mut Packet, data: Bytes) -> Option<Bytes> {
        if !self.enabled(id) {
            return Some(data);
        }

        if self.slots[id as usize].is_none() {
            self.slots[id as usize] = Some(self.build(id));
        }

        // The slot is taken out for the duration of the call so the
        // dissector can re-enter the parser for its sub-dissectors.
        let mut slot = self.slots[id as usize].take()?;
        let out = slot.dissect(self, packet, data);
        self.slots[id as usize] = Some(slot);
        out
    }

    /// Offers `data` to each sub-dissector of `current` in order.
    ///
    /// A child that fully consumes the bytes ends the walk; a child that
    /// hands them back unchanged is "not my protocol, try the next one".
    pub fn dissect_next(
        &mut self,
        current: ProtocolId,
        packet: &mut Packet,
        data: Bytes,
    ) -> Option<Bytes> {
        if data.is_empty() {
            return None;
        }

        let mut data = data;
        for &child in current.sub_dissectors() {
            data = self.dissect(child, packet, data)?;
        }

        Some(data)
    }

    /// Drops reassembly state that stopped making progress.
    ///
    /// Called periodically by the storage consumer (roughly every 10 s).
    pub fn collect_garbage(&mut self) {
        if let Some(Slot::Tcp(tcp)) = self.slots[ProtocolId::Tcp as usize].as_mut() {
            tcp.collect_garbage();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_dissector_returns_input() {
        let mut config = ParserConfig::default();
        config.dissectors.sip = false;

        let mut parser = Parser::new(config);
        let mut packet = Packet::new();
        let data = Bytes::from_static(b"INVITE sip:bob@example.com SIP/2.0\r\n\r\n");

        let out = parser.dissect(ProtocolId::Sip, &mut packet, data.clone());
        assert_eq!(out, Some(data));
        assert!(!packet.has_protocol(ProtocolId::Sip));
    }

    #[test]
    fn test_sub_dissector_order() {
        assert_eq!(
            ProtocolId::Udp.sub_dissectors(),
            &[
                ProtocolId::Sip,
                ProtocolId::Rtp,
                ProtocolId::Rtcp,
                ProtocolId::Hep
            ]
        );
    }

    #[test]
    fn test_dissect_next_empty_input() {
        let mut parser = Parser::new(ParserConfig::default());
        let mut packet = Packet::new();
        assert!(parser
            .dissect_next(ProtocolId::Udp, &mut packet, Bytes::new())
            .is_none());
    }
}
