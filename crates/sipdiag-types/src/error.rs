//! Error types shared across sipdiag crates.

use thiserror::Error;

/// Result type alias using the sipdiag [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced at configuration or construction time.
///
/// Parse failures inside dissectors are deliberately absent: a dissector
/// that does not recognize its input hands the bytes back to the caller,
/// which is the normal outcome of protocol negotiation, not an error.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed capture URL (expected `udp:host:port`).
    #[error("invalid capture URL {url}: {message}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
        /// What was wrong with it.
        message: String,
    },

    /// Unsupported HEP protocol version.
    #[error("unsupported HEP version {0} (supported: 2, 3)")]
    UnsupportedHepVersion(u8),

    /// Datalink type with no known header layout.
    #[error("unknown datalink type {0}")]
    UnknownLinkType(i32),

    /// Regular expression that failed to compile.
    #[error("invalid expression {expression:?}: {message}")]
    InvalidExpression {
        /// The source pattern.
        expression: String,
        /// Compiler message.
        message: String,
    },

    /// BPF filter rejected by the capture backend.
    #[error("invalid BPF filter {filter:?}: {message}")]
    InvalidBpfFilter {
        /// The filter expression.
        filter: String,
        /// Backend message.
        message: String,
    },

    /// I/O error while opening or reading a capture source or sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Memory limit reached; capture has been stopped.
    #[error("memory limit of {limit} bytes reached ({used} bytes in use)")]
    MemoryLimit {
        /// The configured limit.
        limit: usize,
        /// Usage at the time of the check.
        used: usize,
    },
}
