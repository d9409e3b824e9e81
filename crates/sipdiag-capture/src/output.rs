//! Capture outputs: pcap dumper, text dump and HEP forwarder.

use crate::error::{CaptureError, CaptureResult};
use pcap::{Capture, Linktype, Savefile};
use sipdiag_dissect::dissectors::hep::{build_hep3, HepEnvelope};
use sipdiag_dissect::dissectors::link;
use sipdiag_dissect::Packet;
use sipdiag_storage::message::{format_date, format_time};
use sipdiag_storage::PacketSink;
use sipdiag_types::config::HepSendConfig;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::UdpSocket;
use std::path::Path;
use tracing::warn;

/// Writes packets into a pcap capture file.
///
/// The dumper is opened with the datalink of the first input, or raw IP
/// when inputs with different datalinks feed it; frames from an input
/// whose datalink differs get their link header stripped on the way out.
pub struct PcapOutput {
    savefile: Savefile,
    link_type: i32,
}

impl PcapOutput {
    /// Opens a dumper for the given datalink type.
    pub fn new(path: impl AsRef<Path>, link_type: i32) -> CaptureResult<Self> {
        let path = path.as_ref();
        let dead = Capture::dead(Linktype(link_type))
            .map_err(|e| CaptureError::from_pcap(&e))?;
        let savefile = dead
            .savefile(path)
            .map_err(|e| CaptureError::OutputOpen {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            savefile,
            link_type,
        })
    }

    /// The datalink the dumper was opened with.
    #[must_use]
    pub fn link_type(&self) -> i32 {
        self.link_type
    }
}

impl PacketSink for PcapOutput {
    fn write(&mut self, packet: &Packet, link_type: Option<i32>) {
        for frame in packet.frames() {
            // Frames from inputs with a different datalink lose their
            // link header so the record matches the dumper's datalink
            let strip = match link_type {
                Some(src) if src != self.link_type => link::header_size(src).unwrap_or(0),
                _ => 0,
            };
            if frame.data.len() < strip {
                continue;
            }
            let data = &frame.data[strip..];

            let header = pcap::PacketHeader {
                ts: libc::timeval {
                    tv_sec: frame.timestamp / 1_000_000,
                    tv_usec: frame.timestamp % 1_000_000,
                },
                caplen: data.len() as u32,
                len: frame.wire_len.saturating_sub(strip as u32),
            };
            self.savefile.write(&pcap::Packet::new(&header, data));
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.savefile.flush() {
            warn!(error = %e, "flushing pcap output failed");
        }
    }
}

/// Writes SIP payloads as a plain-text dump.
///
/// Record format: `YYYY/MM/DD HH:MM:SS.uuuuuu SRC -> DST`, the payload,
/// and a blank separator line.
pub struct TxtOutput {
    writer: BufWriter<File>,
}

impl TxtOutput {
    /// Creates the text file, truncating any previous content.
    pub fn new(path: impl AsRef<Path>) -> CaptureResult<Self> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| CaptureError::OutputOpen {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl PacketSink for TxtOutput {
    fn write(&mut self, packet: &Packet, _link_type: Option<i32>) {
        let Some(sip) = packet.sip_data() else {
            return;
        };
        let src = packet.src_address().unwrap_or_default();
        let dst = packet.dst_address().unwrap_or_default();

        let ts = packet.timestamp();
        let result = write!(
            self.writer,
            "{} {} {src} -> {dst}\n{}\n\n",
            format_date(ts),
            format_time(ts),
            sip.payload
        );
        if let Err(e) = result {
            warn!(error = %e, "writing text output failed");
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(error = %e, "flushing text output failed");
        }
    }
}

/// Forwards SIP packets to a HEP collector.
pub struct HepOutput {
    config: HepSendConfig,
    socket: UdpSocket,
}

impl HepOutput {
    /// Connects the forwarding socket.
    pub fn new(config: HepSendConfig) -> CaptureResult<Self> {
        if config.version != 2 && config.version != 3 {
            return Err(CaptureError::UnsupportedHepVersion(config.version));
        }
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect((config.address.as_str(), config.port))?;
        Ok(Self { config, socket })
    }
}

impl PacketSink for HepOutput {
    fn write(&mut self, packet: &Packet, _link_type: Option<i32>) {
        let Some(sip) = packet.sip_data() else {
            return;
        };
        let (Some(src), Some(dst)) = (packet.src_address(), packet.dst_address()) else {
            return;
        };

        let ts = packet.timestamp();
        let envelope = HepEnvelope {
            src,
            dst,
            ip_version: packet.ip_data().map_or(4, |ip| ip.version),
            protocol: packet.ip_data().map_or(17, |ip| ip.protocol),
            time_sec: (ts / 1_000_000) as u32,
            time_usec: (ts % 1_000_000) as u32,
            proto_type: 1,
            capture_id: self.config.capture_id,
            auth_key: self.config.password.clone(),
            correlation_id: Some(sip.call_id.clone()),
            payload: sip.payload.as_bytes().to_vec(),
        };

        if let Err(e) = self.socket.send(&build_hep3(&envelope)) {
            warn!(error = %e, "forwarding HEP packet failed");
        }
    }

    fn close(&mut self) {}
}
