//! SDP dissector.
//!
//! Parses the connection, media and attribute lines that matter for
//! pairing RTP streams with the dialog that announced them.

use crate::dissector::Parser;
use crate::dissectors::rtp::standard_encoding;
use crate::packet::{Packet, ProtoData};
use bytes::Bytes;
use sipdiag_types::Address;
use strum::{Display, EnumString};

/// Media types from the `m=` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum SdpMediaType {
    /// Audio media.
    Audio,
    /// Video media.
    Video,
    /// Text media.
    Text,
    /// Application media.
    Application,
    /// Message media.
    Message,
    /// Image media (T.38 fax).
    Image,
}

/// One payload format declared on a media line.
#[derive(Debug, Clone)]
pub struct SdpFormat {
    /// Payload-type number.
    pub id: u32,
    /// `name/rate` form, static or learned from `a=rtpmap`.
    pub name: Option<String>,
    /// Short display alias.
    pub alias: Option<String>,
}

/// One media description.
#[derive(Debug, Clone)]
pub struct SdpMedia {
    /// Media type.
    pub media_type: SdpMediaType,
    /// Effective address: connection IP plus RTP port.
    pub address: Address,
    /// RTP port from the media line.
    pub rtp_port: u16,
    /// RTCP port override from `a=rtcp`.
    rtcp_port: Option<u16>,
    /// Declared formats, preferred first.
    pub formats: Vec<SdpFormat>,
}

impl SdpMedia {
    /// RTCP port; RTP port plus one unless overridden.
    #[must_use]
    pub fn rtcp_port(&self) -> u16 {
        self.rtcp_port.unwrap_or(self.rtp_port + 1)
    }

    /// Resolves a payload-type number against this media's formats.
    #[must_use]
    pub fn format_name(&self, id: u32) -> Option<&str> {
        self.formats
            .iter()
            .find(|f| f.id == id)
            .and_then(|f| f.name.as_deref().or(f.alias.as_deref()))
    }
}

/// SDP session data attached to a packet.
#[derive(Debug, Clone, Default)]
pub struct SdpData {
    /// Session-level connection address.
    pub connection: Option<String>,
    /// Media descriptions in declaration order.
    pub medias: Vec<SdpMedia>,
}

/// SDP dissector.
#[derive(Debug)]
pub struct SdpDissector;

impl SdpDissector {
    /// Parses the SDP body of a SIP message.
    pub fn dissect(
        &mut self,
        _parser: &mut Parser,
        packet: &mut Packet,
        data: Bytes,
    ) -> Option<Bytes> {
        let Ok(text) = std::str::from_utf8(&data) else {
            return Some(data);
        };

        let mut sdp = SdpData::default();
        let mut current: Option<SdpMedia> = None;

        for line in text.lines() {
            let Some((kind, value)) = line.split_once('=') else {
                continue;
            };

            match kind {
                "c" => Self::parse_connection(&mut sdp, current.as_mut(), value),
                "m" => {
                    if let Some(media) = current.take() {
                        sdp.medias.push(media);
                    }
                    current = Self::parse_media(&sdp, value);
                }
                "a" => {
                    if let Some(media) = current.as_mut() {
                        Self::parse_attribute(media, value);
                    }
                }
                _ => {}
            }
        }
        if let Some(media) = current.take() {
            sdp.medias.push(media);
        }

        if sdp.connection.is_none() && sdp.medias.is_empty() {
            return Some(data);
        }

        packet.set_proto(ProtoData::Sdp(sdp));
        None
    }

    /// `c=<nettype> <addrtype> <connection-address>`
    fn parse_connection(sdp: &mut SdpData, media: Option<&mut SdpMedia>, value: &str) {
        let mut parts = value.split_whitespace();
        let (Some(_net), Some(_addrtype), Some(addr)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return;
        };

        match media {
            // Inside a media section the address overrides that media only
            Some(media) => media.address.ip = addr.to_string(),
            None => sdp.connection = Some(addr.to_string()),
        }
    }

    /// `m=<media> <port> <proto> <fmt...>`
    fn parse_media(sdp: &SdpData, value: &str) -> Option<SdpMedia> {
        let mut parts = value.split_whitespace();
        let media_type: SdpMediaType = parts.next()?.parse().ok()?;
        let rtp_port: u16 = parts.next()?.parse().ok()?;
        let _proto = parts.next()?;

        let formats = parts
            .filter_map(|fmt| fmt.parse::<u32>().ok())
            .map(|id| match u8::try_from(id).ok().and_then(standard_encoding) {
                Some(enc) => SdpFormat {
                    id,
                    name: Some(enc.name.to_string()),
                    alias: Some(enc.alias.to_string()),
                },
                None => SdpFormat {
                    id,
                    name: None,
                    alias: None,
                },
            })
            .collect();

        Some(SdpMedia {
            media_type,
            address: Address::new(sdp.connection.clone().unwrap_or_default(), rtp_port),
            rtp_port,
            rtcp_port: None,
            formats,
        })
    }

    /// `a=rtpmap:<pt> <encoding>/<rate>` and `a=rtcp:<port>`
    fn parse_attribute(media: &mut SdpMedia, value: &str) {
        if let Some(rest) = value.strip_prefix("rtpmap:") {
            let mut parts = rest.split_whitespace();
            let Some(id) = parts.next().and_then(|p| p.parse::<u32>().ok()) else {
                return;
            };
            let Some(encoding) = parts.next() else {
                return;
            };

            if let Some(format) = media
                .formats
                .iter_mut()
                .find(|f| f.id == id && f.name.is_none())
            {
                format.name = Some(encoding.to_string());
                format.alias = encoding
                    .split('/')
                    .next()
                    .map(|name| name.to_ascii_lowercase());
            }
        } else if let Some(port) = value.strip_prefix("rtcp:") {
            media.rtcp_port = port
                .split_whitespace()
                .next()
                .and_then(|p| p.parse().ok());
        }
    }
}
