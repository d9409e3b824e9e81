//! Storage engine: the packet queue consumer and the call registry.
//!
//! Capture inputs push raw packets into a bounded queue; a single
//! consumer dissects them, matches SIP messages into calls, pairs RTP
//! and RTCP with their announced streams, enforces capacity and memory
//! limits, and fans packets out to the configured outputs.

use crate::attribute::Attribute;
use crate::call::Call;
use crate::error::{StorageError, StorageResult};
use crate::filter::{self, FilterType, Filters};
use crate::message::Message;
use crate::sink::PacketSink;
use crate::stream::{Stream, StreamType};
use regex::{Regex, RegexBuilder};
use sipdiag_dissect::dissector::ParserConfig;
use sipdiag_dissect::dissectors::sip::Method;
use sipdiag_dissect::{Packet, Parser, ProtocolId};
use sipdiag_types::config::{CaptureConfig, MatchConfig, SortConfig, StorageMode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Reassembly garbage collection period.
const GC_PERIOD: Duration = Duration::from_secs(10);

/// Memory watchdog period.
const MEMORY_CHECK_PERIOD: Duration = Duration::from_millis(500);

/// Storage configuration.
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Dialog matching options.
    pub matching: MatchConfig,
    /// Capacity and retention options.
    pub capture: CaptureConfig,
    /// Call-list sort options.
    pub sort: SortConfig,
}

/// Events surfaced to the embedder (UI or headless runner).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEvent {
    /// The retained-memory cap was reached; capture should stop.
    MemoryLimit {
        /// Bytes retained at check time.
        used: usize,
        /// Configured cap.
        limit: usize,
    },
}

/// Call-list counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StorageStats {
    /// Calls stored.
    pub total: usize,
    /// Calls passing the current display filters.
    pub displayed: usize,
}

/// Identifier of a registered capture input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputId(usize);

/// One queued packet with the input it arrived on.
struct Queued {
    input: InputId,
    packet: Packet,
}

struct State {
    options: StorageOptions,
    match_regex: Option<Regex>,
    calls: Vec<Call>,
    call_index: HashMap<String, usize>,
    /// `"ip:port"` to (call-id, message index) of the announcing SDP.
    expected_streams: HashMap<String, (String, usize)>,
    last_index: u64,
    initials: Vec<ProtocolId>,
    input_links: Vec<Option<i32>>,
    parsers: Vec<Parser>,
    filters: Filters,
    outputs: Vec<Box<dyn PacketSink>>,
    changed: bool,
    retained_bytes: usize,
}

struct Inner {
    state: Mutex<State>,
    tx: Mutex<Option<mpsc::Sender<Queued>>>,
    rx: Mutex<Option<mpsc::Receiver<Queued>>>,
    running: AtomicBool,
    memory_reported: AtomicBool,
    events_tx: mpsc::UnboundedSender<StorageEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<StorageEvent>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    queue_capacity: usize,
}

/// Cloneable producer handle for capture inputs.
#[derive(Clone)]
pub struct StorageSender {
    inner: Arc<Inner>,
    tx: mpsc::Sender<Queued>,
}

impl StorageSender {
    /// Enqueues a raw packet, waiting while the queue is full.
    pub fn push(&self, input: InputId, packet: Packet) {
        if !self.inner.running.load(Ordering::SeqCst) {
            return;
        }
        // Producer backpressure: block until the consumer drains
        let _ = self.tx.blocking_send(Queued { input, packet });
    }

    /// Whether the consumer still accepts packets.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

/// The storage engine handle.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<Inner>,
}

impl Storage {
    /// Creates a storage engine, validating the match expression.
    pub fn new(options: StorageOptions) -> StorageResult<Self> {
        let match_regex = match &options.matching.expression {
            None => None,
            Some(expr) => Some(
                RegexBuilder::new(expr)
                    .case_insensitive(options.matching.ignore_case)
                    .build()
                    .map_err(|e| StorageError::InvalidMatchExpression {
                        expression: expr.clone(),
                        message: e.to_string(),
                    })?,
            ),
        };

        let queue_capacity = options.capture.max_queue_size.max(1);
        let (tx, rx) = mpsc::channel(queue_capacity);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let state = State {
            options,
            match_regex,
            calls: Vec::new(),
            call_index: HashMap::new(),
            expected_streams: HashMap::new(),
            last_index: 0,
            initials: Vec::new(),
            input_links: Vec::new(),
            parsers: Vec::new(),
            filters: Filters::new(),
            outputs: Vec::new(),
            changed: false,
            retained_bytes: 0,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                tx: Mutex::new(Some(tx)),
                rx: Mutex::new(Some(rx)),
                running: AtomicBool::new(true),
                memory_reported: AtomicBool::new(false),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                consumer: Mutex::new(None),
                queue_capacity,
            }),
        })
    }

    /// Registers a capture input, creating its dissector tree.
    pub fn register_input(&self, initial: ProtocolId, config: ParserConfig) -> InputId {
        let mut state = self.inner.state.lock().unwrap();
        let link = (initial == ProtocolId::Link).then_some(config.link_type);
        state.initials.push(initial);
        state.input_links.push(link);
        state.parsers.push(Parser::new(config));
        InputId(state.parsers.len() - 1)
    }

    /// Registers an output sink.
    pub fn add_output(&self, output: Box<dyn PacketSink>) {
        self.inner.state.lock().unwrap().outputs.push(output);
    }

    /// A producer handle for capture inputs.
    #[must_use]
    pub fn sender(&self) -> StorageSender {
        let tx = self
            .inner
            .tx
            .lock()
            .unwrap()
            .clone()
            .expect("storage not stopped");
        StorageSender {
            inner: self.inner.clone(),
            tx,
        }
    }

    /// Takes the event stream; available once.
    #[must_use]
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<StorageEvent>> {
        self.inner.events_rx.lock().unwrap().take()
    }

    /// Spawns the queue consumer thread.
    pub fn start(&self) -> StorageResult<()> {
        let rx = self
            .inner
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or(StorageError::AlreadyStarted)?;

        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("sipdiag-storage".to_string())
            .spawn(move || consumer_loop(&inner, rx))
            .expect("spawn storage consumer");

        *self.inner.consumer.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stops the consumer and closes the outputs.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        // Dropping the sender closes the channel and wakes the consumer
        self.inner.tx.lock().unwrap().take();

        let handle = self.inner.consumer.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        } else {
            // Never started: close outputs from here
            let mut state = self.inner.state.lock().unwrap();
            for output in &mut state.outputs {
                output.close();
            }
        }
    }

    /// Whether the consumer accepts packets.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Packets waiting in the queue.
    #[must_use]
    pub fn pending_packets(&self) -> usize {
        match self.inner.tx.lock().unwrap().as_ref() {
            Some(tx) => self.inner.queue_capacity - tx.capacity(),
            None => 0,
        }
    }

    /// Dissects and stores one packet synchronously.
    ///
    /// The consumer thread uses this internally; offline drivers and
    /// tests may call it directly.
    pub fn process_packet(&self, input: InputId, packet: Packet) {
        self.inner.process(input, packet);
    }

    /// Number of stored calls.
    #[must_use]
    pub fn calls_count(&self) -> usize {
        self.inner.state.lock().unwrap().calls.len()
    }

    /// Returns and clears the changed flag.
    pub fn calls_changed(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        std::mem::take(&mut state.changed)
    }

    /// Call-list counters under the current filters.
    #[must_use]
    pub fn stats(&self) -> StorageStats {
        let state = self.inner.state.lock().unwrap();
        let total = state.calls.len();
        let displayed = state
            .calls
            .iter()
            .filter(|c| c.filtered != Some(false))
            .count();
        StorageStats { total, displayed }
    }

    /// Runs `f` over the stored calls.
    pub fn with_calls<R>(&self, f: impl FnOnce(&[Call]) -> R) -> R {
        f(&self.inner.state.lock().unwrap().calls)
    }

    /// Runs `f` over one call, when it exists.
    pub fn with_call<R>(&self, call_id: &str, f: impl FnOnce(&Call) -> R) -> Option<R> {
        let state = self.inner.state.lock().unwrap();
        let &pos = state.call_index.get(call_id)?;
        Some(f(&state.calls[pos]))
    }

    /// Runs `f` mutably over one call, when it exists.
    pub fn with_call_mut<R>(&self, call_id: &str, f: impl FnOnce(&mut Call) -> R) -> Option<R> {
        let mut state = self.inner.state.lock().unwrap();
        let pos = *state.call_index.get(call_id)?;
        Some(f(&mut state.calls[pos]))
    }

    /// Drops every stored call and stream.
    pub fn calls_clear(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.calls.clear();
        state.call_index.clear();
        state.expected_streams.clear();
        state.retained_bytes = 0;
        state.changed = true;
    }

    /// Drops the calls passing the current display filters.
    pub fn calls_clear_soft(&self) {
        let mut state = self.inner.state.lock().unwrap();
        let state = &mut *state;

        let mut keep = Vec::with_capacity(state.calls.len());
        for mut call in state.calls.drain(..) {
            if state.filters.check_call(&mut call) {
                state.call_index.remove(call.call_id());
                let id = call.call_id().to_string();
                state.expected_streams.retain(|_, (cid, _)| *cid != id);
            } else {
                keep.push(call);
            }
        }
        state.calls = keep;
        Self::rebuild_index(state);
        state.changed = true;
    }

    /// Applies new sort options and reorders the call list.
    pub fn set_sort(&self, sort: SortConfig) {
        let mut state = self.inner.state.lock().unwrap();
        state.options.sort = sort;
        Self::sort_calls(&mut state);
    }

    /// Sets or clears a display filter.
    pub fn set_filter(&self, kind: FilterType, expr: Option<&str>) -> StorageResult<()> {
        self.inner.state.lock().unwrap().filters.set(kind, expr)
    }

    /// Evaluates the display filters for one call (memoized).
    pub fn check_call_filter(&self, call_id: &str) -> Option<bool> {
        let mut state = self.inner.state.lock().unwrap();
        let state = &mut *state;
        let pos = *state.call_index.get(call_id)?;
        Some(state.filters.check_call(&mut state.calls[pos]))
    }

    /// Clears the filter memo on every call.
    pub fn reset_filters(&self) {
        let mut state = self.inner.state.lock().unwrap();
        filter::reset_calls(&mut state.calls);
    }

    /// Bytes of packet data currently retained.
    #[must_use]
    pub fn memory_usage(&self) -> usize {
        self.inner.state.lock().unwrap().retained_bytes
    }

    fn sort_calls(state: &mut State) {
        let attr = Attribute::find_by_name(&state.options.sort.field).unwrap_or(Attribute::Index);
        let ascending = state.options.sort.ascending;
        state.calls.sort_by(|a, b| {
            let ord = a.compare(b, attr);
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        });
        Self::rebuild_index(state);
    }

    fn rebuild_index(state: &mut State) {
        state.call_index.clear();
        for (pos, call) in state.calls.iter().enumerate() {
            state.call_index.insert(call.call_id().to_string(), pos);
        }
    }
}

impl Inner {
    /// Dissects one raw packet and routes the result.
    fn process(&self, input: InputId, mut packet: Packet) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        let Some(frame) = packet.first_frame() else {
            return;
        };
        let data = frame.data.clone();

        let Some(parser) = state.parsers.get_mut(input.0) else {
            return;
        };
        let initial = state.initials[input.0];
        parser.dissect(initial, &mut packet, data);

        if packet.has_protocol(ProtocolId::Sip) {
            Self::handle_sip(state, input, packet);
        } else if packet.has_protocol(ProtocolId::Rtp) {
            Self::handle_media(state, input, packet, StreamType::Rtp);
        } else if packet.has_protocol(ProtocolId::Rtcp) {
            Self::handle_media(state, input, packet, StreamType::Rtcp);
        }
    }

    /// Stores a dissected SIP packet into its call.
    fn handle_sip(state: &mut State, input: InputId, mut packet: Packet) {
        let Some(sip) = packet.sip_data() else {
            return;
        };
        let call_id = sip.call_id.clone();
        let x_call_id = sip.x_call_id.clone();
        let code = sip.code;
        let payload_matches = state
            .match_regex
            .as_ref()
            .map(|re| re.is_match(&sip.payload));

        let pos = match state.call_index.get(&call_id).copied() {
            Some(pos) => pos,
            None => {
                // Match expression (possibly inverted) gates new dialogs
                if let Some(matched) = payload_matches {
                    if matched == state.options.matching.invert {
                        return;
                    }
                }

                if state.options.matching.invite_only && code.method() != Some(Method::Invite) {
                    return;
                }

                let creates_dialog = code.method().is_some_and(Method::creates_dialog);
                if state.options.matching.complete_dialogs_only && !creates_dialog {
                    return;
                }

                if state.calls.len() >= state.options.capture.limit {
                    if !state.options.capture.rotate {
                        return;
                    }
                    Self::rotate(state);
                    if state.calls.len() >= state.options.capture.limit {
                        // Everything is locked, nothing to evict
                        return;
                    }
                }

                state.last_index += 1;
                let call = Call::new(state.last_index, call_id.clone(), x_call_id.clone());
                debug!(call_id = %call_id, index = call.index(), "new call");
                state.calls.push(call);
                let pos = state.calls.len() - 1;
                state.call_index.insert(call_id.clone(), pos);
                pos
            }
        };

        if state.options.capture.mode == StorageMode::None {
            packet.clear_frames();
        } else {
            state.retained_bytes += packet.captured_bytes();
        }

        let packet = Arc::new(packet);
        let Some(msg) = Message::from_packet(packet.clone()) else {
            return;
        };

        // Link the dialog to its X-Call-ID parent on the first message
        if state.calls[pos].msg_count() == 0 {
            if let Some(parent_id) = &x_call_id {
                let child_index = state.calls[pos].index();
                if let Some(&parent_pos) = state.call_index.get(parent_id) {
                    state.calls[parent_pos].add_xcall(child_index);
                }
            }
        }

        state.calls[pos].add_message(msg);
        let msg_index = state.calls[pos].msg_count() - 1;

        Self::register_streams(state, pos, msg_index, &packet);

        state.changed = true;
        let link = state.input_links[input.0];
        for output in &mut state.outputs {
            output.write(&packet, link);
        }
    }

    /// Registers the expected stream keys announced by a message's SDP.
    fn register_streams(state: &mut State, pos: usize, msg_index: usize, packet: &Packet) {
        let Some(sdp) = packet.sdp_data() else {
            return;
        };
        let call_id = state.calls[pos].call_id().to_string();
        let src = packet.src_address();

        for media in &sdp.medias {
            if media.address.ip.is_empty() {
                continue;
            }

            let value = (call_id.clone(), msg_index);
            let rtp_key = format!("{}:{}", media.address.ip, media.rtp_port);
            let rtcp_key = format!("{}:{}", media.address.ip, media.rtcp_port());

            // The most recent SDP offer for a key wins
            state.expected_streams.insert(rtp_key, value.clone());
            state.expected_streams.insert(rtcp_key, value.clone());

            // The far side may source RTP from its signaling address
            if let Some(src) = &src {
                if src.ip != media.address.ip {
                    let src_key = format!("{}:{}", src.ip, media.rtp_port);
                    state.expected_streams.insert(src_key, value);
                }
            }
        }
    }

    /// Pairs an RTP or RTCP packet with its announced stream.
    fn handle_media(state: &mut State, input: InputId, mut packet: Packet, kind: StreamType) {
        let Some(src) = packet.src_address() else {
            return;
        };
        let Some(dst) = packet.dst_address() else {
            return;
        };

        let key = format!("{}:{}", dst.ip, dst.port);
        // Media nobody announced is not stored
        let Some((call_id, msg_index)) = state.expected_streams.get(&key).cloned() else {
            return;
        };
        let Some(&pos) = state.call_index.get(&call_id) else {
            return;
        };

        let (payload_type, ssrc) = match (kind, packet.rtp_data()) {
            (StreamType::Rtp, Some(rtp)) => (rtp.payload_type, rtp.ssrc),
            (StreamType::Rtp, None) => return,
            (StreamType::Rtcp, _) => (0, 0),
        };

        let retain = state.options.capture.rtp;
        if state.options.capture.mode == StorageMode::None {
            packet.clear_frames();
        } else if retain {
            state.retained_bytes += packet.captured_bytes();
        }
        let packet = Arc::new(packet);

        let call = &mut state.calls[pos];
        let at = match call.find_stream_index(&src, &dst, ssrc) {
            Some(at) => at,
            None => {
                let media = call.messages()[msg_index].media_for_address(&dst).cloned();
                let mut stream = Stream::new(kind, msg_index, media, src.clone(), dst.clone());
                stream.set_format(payload_type);
                stream.set_ssrc(ssrc);
                call.add_stream(stream);
                call.streams().len() - 1
            }
        };

        call.stream_mut(at)
            .add_packet(&packet, retain.then(|| packet.clone()));

        state.changed = true;
        let link = state.input_links[input.0];
        for output in &mut state.outputs {
            output.write(&packet, link);
        }
    }

    /// Evicts the oldest unlocked call.
    fn rotate(state: &mut State) {
        let Some(pos) = state.calls.iter().position(|c| !c.is_locked()) else {
            return;
        };
        let call = state.calls.remove(pos);
        info!(call_id = %call.call_id(), "rotating out oldest call");

        state.call_index.remove(call.call_id());
        let id = call.call_id().to_string();
        state.expected_streams.retain(|_, (cid, _)| *cid != id);
        state.retained_bytes = state
            .retained_bytes
            .saturating_sub(call_retained_bytes(&call));

        Storage::rebuild_index(state);
    }

    /// Sweeps reassembly state on every parser.
    fn collect_garbage(&self) {
        let mut state = self.state.lock().unwrap();
        for parser in &mut state.parsers {
            parser.collect_garbage();
        }
    }

    /// Checks retained memory against the configured cap.
    fn check_memory(&self) {
        let (used, limit) = {
            let state = self.state.lock().unwrap();
            (state.retained_bytes, state.options.capture.mem_limit)
        };

        if limit == 0 || used < limit {
            return;
        }
        if self.memory_reported.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!(used, limit, "memory limit reached, stopping capture");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(StorageEvent::MemoryLimit { used, limit });
    }
}

/// Approximate bytes a call keeps alive.
fn call_retained_bytes(call: &Call) -> usize {
    let messages: usize = call
        .messages()
        .iter()
        .map(|m| m.packet().captured_bytes())
        .sum();
    let streams: usize = call
        .streams()
        .iter()
        .flat_map(|s| s.packets().iter())
        .map(|p| p.captured_bytes())
        .sum();
    messages + streams
}

/// The consumer: drains the queue and runs the periodic timers.
fn consumer_loop(inner: &Arc<Inner>, mut rx: mpsc::Receiver<Queued>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("build storage runtime");

    runtime.block_on(async {
        let mut gc = tokio::time::interval(GC_PERIOD);
        let mut memory = tokio::time::interval(MEMORY_CHECK_PERIOD);
        gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        memory.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                queued = rx.recv() => match queued {
                    Some(q) => inner.process(q.input, q.packet),
                    // All senders dropped: we're shutting down
                    None => break,
                },
                _ = gc.tick() => inner.collect_garbage(),
                _ = memory.tick() => inner.check_memory(),
            }

            if !inner.running.load(Ordering::SeqCst) {
                // Drain what the producers managed to enqueue
                while let Ok(q) = rx.try_recv() {
                    inner.process(q.input, q.packet);
                }
                break;
            }
        }

        let mut state = inner.state.lock().unwrap();
        for output in &mut state.outputs {
            output.close();
        }
    });
}

/// Convenience: a parser configuration for inputs that start at the
/// datalink layer.
#[must_use]
pub fn link_parser_config(link_type: i32) -> ParserConfig {
    ParserConfig {
        link_type,
        ..ParserConfig::default()
    }
}
