//! Capture error types.

use thiserror::Error;

/// Capture error type.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No capture device found.
    #[error("no capture device found")]
    NoDeviceFound,

    /// Device not found.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Permission denied.
    #[error("permission denied: capture requires elevated privileges")]
    PermissionDenied,

    /// Invalid BPF filter.
    #[error("invalid BPF filter {filter:?}: {message}")]
    InvalidFilter {
        /// The filter expression.
        filter: String,
        /// Backend message.
        message: String,
    },

    /// Datalink type the link dissector cannot handle.
    #[error("unknown datalink type {0}")]
    UnknownLinkType(i32),

    /// Unsupported HEP version (only 2 and 3 exist on the wire).
    #[error("unsupported HEP version {0}")]
    UnsupportedHepVersion(u8),

    /// Malformed capture URL.
    #[error(transparent)]
    InvalidUrl(#[from] sipdiag_types::Error),

    /// Input already started.
    #[error("capture input already started")]
    AlreadyStarted,

    /// PCAP error.
    #[error("pcap error: {0}")]
    Pcap(String),

    /// Output sink error.
    #[error("unable to open output {path}: {message}")]
    OutputOpen {
        /// Sink path.
        path: String,
        /// Underlying message.
        message: String,
    },

    /// IO error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for capture operations.
pub type CaptureResult<T> = Result<T, CaptureError>;

impl CaptureError {
    /// Maps a pcap error, recognizing permission problems.
    #[must_use]
    pub fn from_pcap(error: &pcap::Error) -> Self {
        let text = error.to_string();
        if text.contains("permission") || text.contains("Permission") {
            Self::PermissionDenied
        } else {
            Self::Pcap(text)
        }
    }
}
