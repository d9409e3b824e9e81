//! SIP call dialogs.

use crate::attribute::Attribute;
use crate::message::Message;
use crate::stream::{Stream, StreamType};
use sipdiag_dissect::dissectors::sip::{Method, SipCode};
use sipdiag_types::Address;
use std::cmp::Ordering;
use strum::Display;

/// State of a dialog that started with an INVITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CallState {
    /// INVITE sent, no final answer yet.
    #[strum(serialize = "CALL SETUP")]
    Setup,
    /// ACK seen, parties talking.
    #[strum(serialize = "IN CALL")]
    InCall,
    /// Caller gave up before the answer.
    #[strum(serialize = "CANCELLED")]
    Cancelled,
    /// Final error answer.
    #[strum(serialize = "REJECTED")]
    Rejected,
    /// Redirected elsewhere.
    #[strum(serialize = "DIVERTED")]
    Diverted,
    /// Busy answer.
    #[strum(serialize = "BUSY")]
    Busy,
    /// BYE after conversation.
    #[strum(serialize = "COMPLETED")]
    Completed,
}

impl CallState {
    /// Terminal states can only leave through a re-INVITE.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, CallState::Setup | CallState::InCall)
    }
}

/// A dialog: every message sharing one Call-ID, plus its media streams.
#[derive(Debug)]
pub struct Call {
    index: u64,
    call_id: String,
    x_call_id: Option<String>,
    /// Filter memo: `None` until evaluated, then the match outcome.
    pub(crate) filtered: Option<bool>,
    state: Option<CallState>,
    changed: bool,
    locked: bool,
    reason: Option<String>,
    warning: Option<u16>,
    invite_cseq: u64,
    messages: Vec<Message>,
    streams: Vec<Stream>,
    xcalls: Vec<u64>,
    conv_start: Option<usize>,
    conv_end: Option<usize>,
}

impl Call {
    /// Creates an empty call.
    #[must_use]
    pub fn new(index: u64, call_id: String, x_call_id: Option<String>) -> Self {
        Self {
            index,
            call_id,
            x_call_id,
            filtered: None,
            state: None,
            changed: false,
            locked: false,
            reason: None,
            warning: None,
            invite_cseq: 0,
            messages: Vec::new(),
            streams: Vec::new(),
            xcalls: Vec::new(),
            conv_start: None,
            conv_end: None,
        }
    }

    /// Monotonically assigned call index.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Call-ID shared by every message.
    #[must_use]
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// X-Call-ID header of the first message, when present.
    #[must_use]
    pub fn x_call_id(&self) -> Option<&str> {
        self.x_call_id.as_deref()
    }

    /// Messages in arrival order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages.
    #[must_use]
    pub fn msg_count(&self) -> usize {
        self.messages.len()
    }

    /// Media streams of this call.
    #[must_use]
    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    /// Calls that referenced this one through X-Call-ID.
    #[must_use]
    pub fn xcalls(&self) -> &[u64] {
        &self.xcalls
    }

    /// Records a related call index.
    pub fn add_xcall(&mut self, index: u64) {
        self.changed = true;
        self.xcalls.push(index);
    }

    /// Current state, set once the dialog starts with an INVITE.
    #[must_use]
    pub fn state(&self) -> Option<CallState> {
        self.state
    }

    /// Returns and clears the changed flag.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    /// Locked calls survive rotation eviction.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Locks or unlocks the call.
    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    /// Last Reason header text seen in the dialog.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Last Warning code seen in the dialog.
    #[must_use]
    pub fn warning(&self) -> Option<u16> {
        self.warning
    }

    /// Message that started the conversation (the ACK).
    #[must_use]
    pub fn conv_start(&self) -> Option<&Message> {
        self.conv_start.map(|i| &self.messages[i])
    }

    /// Message that ended the conversation (the BYE).
    #[must_use]
    pub fn conv_end(&self) -> Option<&Message> {
        self.conv_end.map(|i| &self.messages[i])
    }

    /// Whether the dialog started with an INVITE request.
    #[must_use]
    pub fn is_invite(&self) -> bool {
        self.messages
            .first()
            .is_some_and(|m| m.method() == Some(Method::Invite))
    }

    /// Appends a message, flagging retransmissions and driving the
    /// state machine for INVITE dialogs.
    pub fn add_message(&mut self, mut msg: Message) {
        let retrans = self.messages.last().is_some_and(|prev| {
            prev.src() == msg.src() && prev.dst() == msg.dst() && prev.payload() == msg.payload()
        });
        msg.set_retrans(retrans);

        if let Some(reason) = &msg.sip().reason_text {
            self.reason = Some(reason.clone());
        }
        if let Some(warning) = msg.sip().warning {
            self.warning = Some(warning);
        }

        self.messages.push(msg);
        self.changed = true;

        if self.is_invite() {
            self.update_state(self.messages.len() - 1);
        }
    }

    /// Applies the state machine for the message at `index`.
    fn update_state(&mut self, index: usize) {
        let msg = &self.messages[index];
        let code = msg.code();
        let cseq = msg.cseq();

        match self.state {
            None => {
                if code == SipCode::Request(Method::Invite) {
                    self.invite_cseq = cseq;
                    self.state = Some(CallState::Setup);
                }
            }
            Some(CallState::Setup) => match code {
                SipCode::Request(Method::Ack) if cseq == self.invite_cseq => {
                    self.state = Some(CallState::InCall);
                    self.conv_start = Some(index);
                }
                SipCode::Request(Method::Cancel) => {
                    self.state = Some(CallState::Cancelled);
                }
                SipCode::Request(Method::Invite) => {
                    self.invite_cseq = cseq;
                }
                SipCode::Response(480 | 486 | 600) => {
                    self.state = Some(CallState::Busy);
                }
                SipCode::Response(400..=499) if cseq == self.invite_cseq => {
                    self.state = Some(CallState::Rejected);
                }
                SipCode::Response(300..=399) => {
                    self.state = Some(CallState::Diverted);
                }
                _ => {}
            },
            Some(CallState::InCall) => {
                if code == SipCode::Request(Method::Bye) {
                    self.state = Some(CallState::Completed);
                    self.conv_end = Some(index);
                }
            }
            // Terminal states: a re-INVITE starts the dialog over
            Some(_) => {
                if code == SipCode::Request(Method::Invite) {
                    self.invite_cseq = cseq;
                    self.state = Some(CallState::Setup);
                }
            }
        }
    }

    /// Appends a media stream.
    pub fn add_stream(&mut self, stream: Stream) {
        self.streams.push(stream);
        self.changed = true;
    }

    /// Finds the stream an arriving media packet belongs to.
    ///
    /// Preference order: exact `(src, dst, ssrc)` match, then a stream
    /// for the same endpoints whose SSRC is still unset, then an
    /// incomplete stream announced for this destination.
    #[must_use]
    pub fn find_stream_index(&self, src: &Address, dst: &Address, ssrc: u32) -> Option<usize> {
        self.streams
            .iter()
            .position(|s| s.src() == src && s.dst() == dst && s.ssrc() == ssrc)
            .or_else(|| {
                self.streams
                    .iter()
                    .position(|s| s.src() == src && s.dst() == dst && s.ssrc() == 0)
            })
            .or_else(|| {
                self.streams
                    .iter()
                    .position(|s| s.dst() == dst && !s.is_complete())
            })
    }

    /// Mutable form of [`Call::find_stream_index`].
    #[must_use]
    pub fn find_stream(&mut self, src: &Address, dst: &Address, ssrc: u32) -> Option<&mut Stream> {
        let at = self.find_stream_index(src, dst, ssrc)?;
        Some(&mut self.streams[at])
    }

    /// Finds a stream by exact endpoints.
    #[must_use]
    pub fn find_stream_exact(&mut self, src: &Address, dst: &Address) -> Option<&mut Stream> {
        let at = self
            .streams
            .iter()
            .position(|s| s.src() == src && s.dst() == dst)?;
        Some(&mut self.streams[at])
    }

    /// Mutable access to a stream by position.
    #[must_use]
    pub fn stream_mut(&mut self, at: usize) -> &mut Stream {
        &mut self.streams[at]
    }

    /// Finds the first message with the given CSeq.
    #[must_use]
    pub fn find_message_by_cseq(&self, cseq: u64) -> Option<&Message> {
        self.messages.iter().find(|m| m.cseq() == cseq)
    }

    /// Active RTP streams (packets within the inactivity threshold).
    #[must_use]
    pub fn active_stream_count(&self) -> usize {
        self.streams
            .iter()
            .filter(|s| s.stream_type() == StreamType::Rtp && s.is_active())
            .count()
    }

    /// Conversation duration in microseconds (ACK to BYE).
    #[must_use]
    pub fn conv_duration(&self) -> Option<i64> {
        Some(self.conv_end()?.timestamp() - self.conv_start()?.timestamp())
    }

    /// Total duration in microseconds (first to last message).
    #[must_use]
    pub fn total_duration(&self) -> Option<i64> {
        let first = self.messages.first()?.timestamp();
        let last = self.messages.last()?.timestamp();
        Some(last - first)
    }

    /// Attribute value for this call.
    ///
    /// Call-scoped attributes are computed here; the rest delegate to
    /// the first message.
    #[must_use]
    pub fn attribute(&self, attr: Attribute) -> String {
        match attr {
            Attribute::Index => self.index.to_string(),
            Attribute::MsgCount => self.msg_count().to_string(),
            Attribute::State => self
                .state
                .map(|s| s.to_string())
                .unwrap_or_default(),
            Attribute::ConvDur => self.conv_duration().map(format_duration).unwrap_or_default(),
            Attribute::TotalDur => self.total_duration().map(format_duration).unwrap_or_default(),
            Attribute::Reason => self.reason.clone().unwrap_or_default(),
            Attribute::Warning => self.warning.map(|w| w.to_string()).unwrap_or_default(),
            _ => self
                .messages
                .first()
                .map(|m| m.attribute(attr))
                .unwrap_or_default(),
        }
    }

    /// One-line rendering used by the call-list filter.
    #[must_use]
    pub fn summary_line(&self) -> String {
        [
            Attribute::Index,
            Attribute::Date,
            Attribute::Time,
            Attribute::SipFrom,
            Attribute::SipTo,
            Attribute::Src,
            Attribute::Dst,
            Attribute::CallId,
            Attribute::Method,
            Attribute::MsgCount,
            Attribute::State,
        ]
        .iter()
        .map(|&attr| self.attribute(attr))
        .collect::<Vec<_>>()
        .join(" ")
    }

    /// Compares two calls on an attribute for list sorting.
    #[must_use]
    pub fn compare(&self, other: &Self, attr: Attribute) -> Ordering {
        attr.compare_values(&self.attribute(attr), &other.attribute(attr))
    }
}

/// `HH:MM:SS` from a duration in microseconds.
#[must_use]
fn format_duration(us: i64) -> String {
    let total = us / 1_000_000;
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}
