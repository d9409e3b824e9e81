//! Capture inputs: live interfaces, pcap files and the HEP listener.

use crate::error::{CaptureError, CaptureResult};
use crate::filter::CaptureFilter;
use bytes::Bytes;
use chrono::Utc;
use pcap::{Active, Capture, Device, Offline};
use sipdiag_dissect::dissector::ParserConfig;
use sipdiag_dissect::dissectors::hep::HEP3_MAGIC;
use sipdiag_dissect::dissectors::link;
use sipdiag_dissect::{Frame, Packet, ProtocolId};
use sipdiag_storage::{InputId, Storage, StorageSender};
use sipdiag_types::config::HepListenConfig;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Snapshot length for live captures.
const SNAPLEN: i32 = 262_144;

/// Kernel buffer for live captures.
const BUFFER_SIZE: i32 = 10 * 1024 * 1024;

/// Read timeout so capture threads notice stop requests.
const READ_TIMEOUT_MS: i32 = 1000;

/// Largest HEP datagram accepted.
const HEP_BUFSIZE: usize = 65_535;

/// Whether an input replays a finite source or taps a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Live source (interface or socket).
    Online,
    /// Finite source (capture file).
    Offline,
}

/// Common contract of every capture input.
pub trait CaptureInput: Send {
    /// Arms the IO source and starts the read thread.
    fn start(&mut self) -> CaptureResult<()>;

    /// Releases the IO source and stops the read thread.
    fn stop(&mut self);

    /// Installs a BPF filter where the backend supports one.
    fn set_filter(&mut self, filter: &CaptureFilter) -> CaptureResult<()>;

    /// Human-readable source description.
    fn source(&self) -> &str;

    /// Online or offline.
    fn mode(&self) -> CaptureMode;

    /// Protocol the dissection of this input's packets starts at.
    fn initial_protocol(&self) -> ProtocolId;

    /// Bytes read so far and, for finite sources, the total to read.
    fn progress(&self) -> (u64, Option<u64>) {
        (0, None)
    }
}

/// One raw capture record, copied out of the pcap handle.
struct RawFrame {
    timestamp: i64,
    captured_len: u32,
    wire_len: u32,
    data: Vec<u8>,
}

enum PcapHandle {
    Online(Capture<Active>),
    Offline(Capture<Offline>),
}

impl PcapHandle {
    fn next(&mut self) -> Result<RawFrame, pcap::Error> {
        let packet = match self {
            PcapHandle::Online(cap) => cap.next_packet()?,
            PcapHandle::Offline(cap) => cap.next_packet()?,
        };
        Ok(RawFrame {
            timestamp: packet.header.ts.tv_sec as i64 * 1_000_000
                + packet.header.ts.tv_usec as i64,
            captured_len: packet.header.caplen,
            wire_len: packet.header.len,
            data: packet.data.to_vec(),
        })
    }

    fn filter(&mut self, expr: &str) -> Result<(), pcap::Error> {
        match self {
            PcapHandle::Online(cap) => cap.filter(expr, true),
            PcapHandle::Offline(cap) => cap.filter(expr, true),
        }
    }
}

/// Live or offline libpcap input.
pub struct PcapInput {
    source: String,
    mode: CaptureMode,
    link_type: i32,
    input_id: InputId,
    sender: StorageSender,
    paused: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    handle: Arc<Mutex<Option<PcapHandle>>>,
    thread: Option<JoinHandle<()>>,
    loaded: Arc<AtomicU64>,
    total_size: Option<u64>,
}

impl PcapInput {
    /// Opens a live capture on a named interface.
    pub fn online(
        device_name: &str,
        storage: &Storage,
        config: ParserConfig,
        paused: Arc<AtomicBool>,
    ) -> CaptureResult<Self> {
        let device = Device::list()
            .map_err(|e| CaptureError::from_pcap(&e))?
            .into_iter()
            .find(|d| d.name == device_name)
            .ok_or_else(|| CaptureError::DeviceNotFound(device_name.to_string()))?;

        debug!(device = %device.name, "opening live capture");

        let cap = Capture::from_device(device)
            .map_err(|e| CaptureError::from_pcap(&e))?
            .promisc(true)
            .snaplen(SNAPLEN)
            .buffer_size(BUFFER_SIZE)
            .timeout(READ_TIMEOUT_MS)
            .open()
            .map_err(|e| CaptureError::from_pcap(&e))?;

        let link_type = cap.get_datalink().0;
        Self::build(
            device_name.to_string(),
            CaptureMode::Online,
            PcapHandle::Online(cap),
            link_type,
            None,
            storage,
            config,
            paused,
        )
    }

    /// Opens a capture file; `-` reads from standard input.
    pub fn offline(
        path: &str,
        storage: &Storage,
        config: ParserConfig,
        paused: Arc<AtomicBool>,
    ) -> CaptureResult<Self> {
        let file = if path == "-" { "/dev/stdin" } else { path };
        let total_size = std::fs::metadata(file).ok().map(|m| m.len());

        let cap = Capture::from_file(file).map_err(|e| CaptureError::from_pcap(&e))?;
        let link_type = cap.get_datalink().0;

        Self::build(
            path.to_string(),
            CaptureMode::Offline,
            PcapHandle::Offline(cap),
            link_type,
            total_size,
            storage,
            config,
            paused,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        source: String,
        mode: CaptureMode,
        handle: PcapHandle,
        link_type: i32,
        total_size: Option<u64>,
        storage: &Storage,
        mut config: ParserConfig,
        paused: Arc<AtomicBool>,
    ) -> CaptureResult<Self> {
        // Refuse sources the link dissector cannot strip
        if link::header_size(link_type).is_none() {
            return Err(CaptureError::UnknownLinkType(link_type));
        }

        config.link_type = link_type;
        let input_id = storage.register_input(ProtocolId::Link, config);

        Ok(Self {
            source,
            mode,
            link_type,
            input_id,
            sender: storage.sender(),
            paused,
            stop_flag: Arc::new(AtomicBool::new(false)),
            handle: Arc::new(Mutex::new(Some(handle))),
            thread: None,
            loaded: Arc::new(AtomicU64::new(0)),
            total_size,
        })
    }

    /// Datalink type of this input.
    #[must_use]
    pub fn link_type(&self) -> i32 {
        self.link_type
    }

    /// Storage identifier of this input.
    #[must_use]
    pub fn input_id(&self) -> InputId {
        self.input_id
    }
}

impl CaptureInput for PcapInput {
    fn start(&mut self) -> CaptureResult<()> {
        if self.thread.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }

        let handle = self.handle.clone();
        let sender = self.sender.clone();
        let stop_flag = self.stop_flag.clone();
        let paused = self.paused.clone();
        let loaded = self.loaded.clone();
        let input_id = self.input_id;
        let source = self.source.clone();

        let thread = std::thread::Builder::new()
            .name(format!("pcap-{source}"))
            .spawn(move || {
                let mut count = 0u64;
                loop {
                    if stop_flag.load(Ordering::SeqCst) || !sender.is_running() {
                        break;
                    }

                    let next = {
                        let mut guard = handle.lock().unwrap();
                        let Some(cap) = guard.as_mut() else { break };
                        cap.next()
                    };

                    match next {
                        Ok(raw) => {
                            loaded.fetch_add(u64::from(raw.captured_len), Ordering::Relaxed);
                            // Paused captures drop incoming packets
                            if paused.load(Ordering::Relaxed) {
                                continue;
                            }

                            let frame = Frame::new(
                                raw.timestamp,
                                raw.captured_len,
                                raw.wire_len,
                                Bytes::from(raw.data),
                            );
                            sender.push(input_id, Packet::with_frame(frame));
                            count += 1;
                        }
                        Err(pcap::Error::TimeoutExpired) => {}
                        Err(pcap::Error::NoMorePackets) => {
                            info!(source = %source, packets = count, "capture file finished");
                            break;
                        }
                        Err(e) => {
                            warn!(source = %source, error = %e, "capture read failed");
                            break;
                        }
                    }
                }
            })
            .expect("spawn capture thread");

        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        // Closing the handle releases the device or file
        self.handle.lock().unwrap().take();

        // Finite sources report as fully loaded once stopped
        if let Some(total) = self.total_size {
            self.loaded.store(total, Ordering::Relaxed);
        }
    }

    fn set_filter(&mut self, filter: &CaptureFilter) -> CaptureResult<()> {
        if filter.is_empty() {
            return Ok(());
        }
        let program = filter.to_bpf();
        let mut guard = self.handle.lock().unwrap();
        let Some(cap) = guard.as_mut() else {
            return Ok(());
        };
        cap.filter(&program).map_err(|e| CaptureError::InvalidFilter {
            filter: program.clone(),
            message: e.to_string(),
        })
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn mode(&self) -> CaptureMode {
        self.mode
    }

    fn initial_protocol(&self) -> ProtocolId {
        ProtocolId::Link
    }

    fn progress(&self) -> (u64, Option<u64>) {
        (self.loaded.load(Ordering::Relaxed), self.total_size)
    }
}

/// HEP v3 UDP listener input.
pub struct HepInput {
    source: String,
    input_id: InputId,
    sender: StorageSender,
    paused: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    socket: Option<UdpSocket>,
    thread: Option<JoinHandle<()>>,
}

impl HepInput {
    /// Binds the listener socket described by the configuration.
    pub fn new(
        hep: HepListenConfig,
        storage: &Storage,
        mut config: ParserConfig,
        paused: Arc<AtomicBool>,
    ) -> CaptureResult<Self> {
        if hep.version != 2 && hep.version != 3 {
            return Err(CaptureError::UnsupportedHepVersion(hep.version));
        }

        let addr: SocketAddr = format!("{}:{}", hep.address, hep.port)
            .parse()
            .map_err(|e| CaptureError::InvalidUrl(sipdiag_types::Error::InvalidUrl {
                url: format!("udp:{}:{}", hep.address, hep.port),
                message: format!("{e}"),
            }))?;

        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;

        info!(listen = %addr, "HEP listener bound");

        let source = format!("udp:{}:{}", hep.address, hep.port);
        config.hep = hep;
        let input_id = storage.register_input(ProtocolId::Hep, config);

        Ok(Self {
            source,
            input_id,
            sender: storage.sender(),
            paused,
            stop_flag: Arc::new(AtomicBool::new(false)),
            socket: Some(socket),
            thread: None,
        })
    }

    /// Storage identifier of this input.
    #[must_use]
    pub fn input_id(&self) -> InputId {
        self.input_id
    }
}

impl CaptureInput for HepInput {
    fn start(&mut self) -> CaptureResult<()> {
        if self.thread.is_some() {
            return Err(CaptureError::AlreadyStarted);
        }
        let Some(socket) = &self.socket else {
            return Err(CaptureError::AlreadyStarted);
        };

        let socket = socket.try_clone()?;
        let sender = self.sender.clone();
        let stop_flag = self.stop_flag.clone();
        let paused = self.paused.clone();
        let input_id = self.input_id;

        let thread = std::thread::Builder::new()
            .name("hep-listener".to_string())
            .spawn(move || {
                let mut buffer = vec![0u8; HEP_BUFSIZE];
                loop {
                    if stop_flag.load(Ordering::SeqCst) || !sender.is_running() {
                        break;
                    }

                    match socket.recv_from(&mut buffer) {
                        Ok((received, _)) => {
                            if paused.load(Ordering::Relaxed) {
                                continue;
                            }
                            // Only HEP3-framed datagrams enter the queue
                            if received < 4 || buffer[..4] != HEP3_MAGIC[..] {
                                debug!(received, "ignoring non-HEP datagram");
                                continue;
                            }

                            let data = Bytes::copy_from_slice(&buffer[..received]);
                            let frame = Frame::new(
                                Utc::now().timestamp_micros(),
                                received as u32,
                                received as u32,
                                data,
                            );
                            sender.push(input_id, Packet::with_frame(frame));
                        }
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            warn!(error = %e, "HEP receive failed");
                            break;
                        }
                    }
                }
            })
            .expect("spawn HEP listener thread");

        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.socket.take();
    }

    fn set_filter(&mut self, _filter: &CaptureFilter) -> CaptureResult<()> {
        // BPF filters only apply to libpcap inputs
        Ok(())
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn mode(&self) -> CaptureMode {
        CaptureMode::Online
    }

    fn initial_protocol(&self) -> ProtocolId {
        ProtocolId::Hep
    }
}
