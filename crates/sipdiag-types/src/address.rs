//! Network endpoint addresses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A network endpoint as seen by the dissectors.
///
/// The IP part is kept as the textual form produced while dissecting
/// (dotted quad or colon-separated groups); hostnames never appear here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// IP address literal.
    pub ip: String,

    /// Transport port (0 when not yet known).
    pub port: u16,
}

impl Address {
    /// Creates a new address from an IP literal and port.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    /// Compares only the IP part of two addresses.
    #[must_use]
    pub fn equals_ip(&self, other: &Self) -> bool {
        self.ip == other.ip
    }

    /// Returns true if no IP has been set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ip.is_empty()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}
