//! Configuration types for sipdiag.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Main configuration for the capture/dissection/storage pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dialog matching settings (`match.*`).
    pub matching: MatchConfig,
    /// Capture and retention settings (`capture.*`, `storage.*`).
    pub capture: CaptureConfig,
    /// Call-list sorting settings (`sort.*`).
    pub sort: SortConfig,
    /// HEP listener settings (`hep.listen.*`).
    pub hep_listen: HepListenConfig,
    /// HEP forwarding settings (`hep.send.*`).
    pub hep_send: HepSendConfig,
    /// Per-protocol dissector toggles (`packet.*`).
    pub dissectors: DissectorConfig,
}

/// Settings controlling which SIP dialogs are stored (`match.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Payload match expression; dialogs whose first message does not
    /// match are discarded.
    pub expression: Option<String>,
    /// Invert the match expression result.
    pub invert: bool,
    /// Compile the expression case-insensitive.
    pub ignore_case: bool,
    /// Only store dialogs starting with an INVITE request.
    pub invite_only: bool,
    /// Only store dialogs starting with a session-creating request
    /// (REGISTER through MESSAGE).
    pub complete_dialogs_only: bool,
}

/// How packet payloads are retained once dissected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Keep frames in memory for payload display and saving.
    #[default]
    Memory,
    /// Drop frame bytes after dissection; keep parsed metadata only.
    None,
}

/// Capture and retention settings (`capture.*`, `storage.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Maximum number of live calls.
    pub limit: usize,
    /// Evict the oldest unlocked call when the limit is reached.
    pub rotate: bool,
    /// Retain RTP packets inside their streams.
    pub rtp: bool,
    /// Memory cap in bytes for retained packet data (0 = unlimited).
    pub mem_limit: usize,
    /// Frame retention mode.
    pub mode: StorageMode,
    /// Bound on in-flight packets between capture and storage.
    pub max_queue_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            limit: 20_000,
            rotate: false,
            rtp: false,
            mem_limit: 0,
            mode: StorageMode::Memory,
            max_queue_size: 1000,
        }
    }
}

/// Call-list sorting settings (`sort.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SortConfig {
    /// Attribute name used for ordering (e.g. `index`, `msgcnt`).
    pub field: String,
    /// Ascending order when true.
    pub ascending: bool,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            field: "index".to_string(),
            ascending: true,
        }
    }
}

/// HEP listener settings (`hep.listen.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HepListenConfig {
    /// Address to bind the UDP listener to.
    pub address: String,
    /// Port to bind the UDP listener to.
    pub port: u16,
    /// Protocol version (2 or 3).
    pub version: u8,
    /// Expected authentication password, when set.
    pub password: Option<String>,
    /// Whether senders include a correlation UUID chunk.
    pub uuid: bool,
}

impl Default for HepListenConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9060,
            version: 3,
            password: None,
            uuid: false,
        }
    }
}

/// HEP forwarding settings (`hep.send.*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HepSendConfig {
    /// Destination address.
    pub address: String,
    /// Destination port.
    pub port: u16,
    /// Protocol version (2 or 3).
    pub version: u8,
    /// Authentication password, when the collector requires one.
    pub password: Option<String>,
    /// Capture agent identifier sent in the envelope.
    pub capture_id: u32,
}

impl Default for HepSendConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 9060,
            version: 3,
            password: None,
            capture_id: 2002,
        }
    }
}

/// A `proto:host:port` capture URL as accepted on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureUrl {
    /// Transport protocol; only `udp` is supported.
    pub proto: String,
    /// Host part.
    pub host: String,
    /// Port part.
    pub port: u16,
}

impl CaptureUrl {
    /// Parses a `udp:host:port` URL.
    pub fn parse(url: &str) -> Result<Self> {
        let tokens: Vec<&str> = url.splitn(3, ':').collect();
        if tokens.len() != 3 {
            return Err(Error::InvalidUrl {
                url: url.to_string(),
                message: "expected proto:host:port".to_string(),
            });
        }

        if tokens[0] != "udp" {
            return Err(Error::InvalidUrl {
                url: url.to_string(),
                message: format!("unsupported protocol {}", tokens[0]),
            });
        }

        let port = tokens[2].parse::<u16>().map_err(|e| Error::InvalidUrl {
            url: url.to_string(),
            message: format!("invalid port {}: {e}", tokens[2]),
        })?;

        Ok(Self {
            proto: tokens[0].to_string(),
            host: tokens[1].to_string(),
            port,
        })
    }
}

/// Per-protocol dissector toggles (`packet.*`).
///
/// A disabled protocol makes the registry return nothing for that ID, so
/// the sub-dissector chain stops there.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DissectorConfig {
    /// IPv4/IPv6 dissection.
    pub ip: bool,
    /// UDP dissection.
    pub udp: bool,
    /// TCP dissection and stream reassembly.
    pub tcp: bool,
    /// SIP dissection.
    pub sip: bool,
    /// SDP dissection.
    pub sdp: bool,
    /// RTP dissection.
    pub rtp: bool,
    /// RTCP dissection.
    pub rtcp: bool,
    /// HEP envelope dissection.
    pub hep: bool,
    /// TLS record recognition.
    pub tls: bool,
}

impl Default for DissectorConfig {
    fn default() -> Self {
        Self {
            ip: true,
            udp: true,
            tcp: true,
            sip: true,
            sdp: true,
            rtp: true,
            rtcp: true,
            hep: true,
            tls: true,
        }
    }
}
