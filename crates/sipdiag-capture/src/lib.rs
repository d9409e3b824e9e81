//! # sipdiag-capture
//!
//! Packet acquisition for sipdiag.
//!
//! Provides the capture side of the pipeline:
//! - Live interface capture and pcap file replay (libpcap)
//! - HEP v3 UDP listener
//! - Capture outputs: pcap dumper, text dump, HEP forwarder
//! - BPF filter support
//!
//! Inputs read raw frames on dedicated threads and enqueue them into
//! the storage queue; the capture manager owns their lifecycle.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod filter;
pub mod input;
pub mod manager;
pub mod output;

pub use error::{CaptureError, CaptureResult};
pub use filter::{CaptureFilter, Transport};
pub use input::{CaptureInput, CaptureMode, HepInput, PcapInput};
pub use manager::CaptureManager;
pub use output::{HepOutput, PcapOutput, TxtOutput};

use pcap::Device;

/// A network device available for capture.
#[derive(Debug, Clone)]
pub struct CaptureDevice {
    /// Device name (e.g., "eth0", "en0").
    pub name: String,
    /// Device description.
    pub description: Option<String>,
    /// IP addresses assigned to this device.
    pub addresses: Vec<String>,
    /// Is this a loopback device?
    pub is_loopback: bool,
    /// Is the device up?
    pub is_up: bool,
}

/// List available network devices for capture.
pub fn list_devices() -> CaptureResult<Vec<CaptureDevice>> {
    let devices = Device::list().map_err(|e| CaptureError::Pcap(e.to_string()))?;

    Ok(devices
        .into_iter()
        .map(|d| CaptureDevice {
            name: d.name.clone(),
            description: d.desc.clone(),
            addresses: d.addresses.iter().map(|a| a.addr.to_string()).collect(),
            is_loopback: d.flags.is_loopback(),
            is_up: d.flags.is_up(),
        })
        .collect())
}

/// Get the default capture device.
pub fn default_device() -> CaptureResult<CaptureDevice> {
    let device = Device::lookup()
        .map_err(|e| CaptureError::Pcap(e.to_string()))?
        .ok_or(CaptureError::NoDeviceFound)?;

    Ok(CaptureDevice {
        name: device.name.clone(),
        description: device.desc.clone(),
        addresses: device.addresses.iter().map(|a| a.addr.to_string()).collect(),
        is_loopback: device.flags.is_loopback(),
        is_up: device.flags.is_up(),
    })
}
