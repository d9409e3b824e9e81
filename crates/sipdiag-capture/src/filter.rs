//! BPF capture filters.
//!
//! A VoIP capture narrows on a handful of recurring shapes: signaling
//! ports, RTP port ranges, one or two hosts of interest. This builder
//! assembles those as conjunctive clauses and renders the BPF program
//! on demand; `raw` escapes to hand-written expressions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Transport narrowing for signaling clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// UDP only.
    Udp,
    /// TCP only.
    Tcp,
}

/// A capture filter built from clauses that must all hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureFilter {
    clauses: Vec<String>,
}

impl CaptureFilter {
    /// A filter that passes every frame.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    fn clause(mut self, text: String) -> Self {
        self.clauses.push(text);
        self
    }

    /// Appends a hand-written BPF expression as one clause.
    #[must_use]
    pub fn raw(self, expr: &str) -> Self {
        if expr.is_empty() {
            return self;
        }
        self.clause(expr.to_string())
    }

    /// Frames to or from a host.
    #[must_use]
    pub fn host(self, addr: IpAddr) -> Self {
        self.clause(format!("host {addr}"))
    }

    /// Frames exchanged between two hosts, either direction.
    #[must_use]
    pub fn between(self, one: IpAddr, two: IpAddr) -> Self {
        self.clause(format!("host {one} and host {two}"))
    }

    /// Drops frames involving a host (a noisy proxy, a monitor).
    #[must_use]
    pub fn not_host(self, addr: IpAddr) -> Self {
        self.clause(format!("not host {addr}"))
    }

    /// Restricts to one transport.
    #[must_use]
    pub fn transport(self, transport: Transport) -> Self {
        let proto = match transport {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        };
        self.clause(proto.to_string())
    }

    /// SIP signaling on the standard ports (5060 clear, 5061 TLS).
    #[must_use]
    pub fn signaling(self) -> Self {
        self.clause("port 5060 or port 5061".to_string())
    }

    /// SIP signaling on a non-standard port.
    #[must_use]
    pub fn signaling_port(self, port: u16) -> Self {
        self.clause(format!("port {port}"))
    }

    /// The UDP range a media gateway sends RTP and RTCP from.
    #[must_use]
    pub fn media_ports(self, first: u16, last: u16) -> Self {
        self.clause(format!("udp portrange {first}-{last}"))
    }

    /// Signaling plus the media range, the usual whole-call capture.
    #[must_use]
    pub fn call_traffic(self, media_first: u16, media_last: u16) -> Self {
        self.clause(format!(
            "port 5060 or port 5061 or udp portrange {media_first}-{media_last}"
        ))
    }

    /// Renders the filter as one BPF program.
    #[must_use]
    pub fn to_bpf(&self) -> String {
        match self.clauses.as_slice() {
            [] => String::new(),
            [only] => only.clone(),
            many => many
                .iter()
                .map(|clause| format!("({clause})"))
                .collect::<Vec<_>>()
                .join(" and "),
        }
    }

    /// True when no clause has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

impl fmt::Display for CaptureFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "(all)")
        } else {
            write!(f, "{}", self.to_bpf())
        }
    }
}
