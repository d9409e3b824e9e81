//! Derived attributes of calls and messages.
//!
//! An attribute is a named view over a message or its call, used for
//! sorting, filtering and list rendering. Immutable attributes are
//! cached on the message after the first read; mutable ones change as
//! the call grows and are recomputed on demand.

use std::cmp::Ordering;

/// Well-known attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Call index in the call list.
    Index,
    /// SIP From URI.
    SipFrom,
    /// User part of the From URI.
    SipFromUser,
    /// SIP To URI.
    SipTo,
    /// User part of the To URI.
    SipToUser,
    /// Source address of the first message.
    Src,
    /// Destination address of the first message.
    Dst,
    /// Call-ID header.
    CallId,
    /// X-Call-ID header.
    XCallId,
    /// Date of the first message.
    Date,
    /// Time of the first message.
    Time,
    /// Method or response code of the first message.
    Method,
    /// Transport the dialog arrived over.
    Transport,
    /// Number of messages in the call.
    MsgCount,
    /// Call state.
    State,
    /// Conversation duration (ACK to BYE).
    ConvDur,
    /// Total duration (first to last message).
    TotalDur,
    /// Last Reason header text.
    Reason,
    /// Last Warning header code.
    Warning,
}

/// All attributes, in display order.
pub const ATTRIBUTES: &[Attribute] = &[
    Attribute::Index,
    Attribute::SipFrom,
    Attribute::SipFromUser,
    Attribute::SipTo,
    Attribute::SipToUser,
    Attribute::Src,
    Attribute::Dst,
    Attribute::CallId,
    Attribute::XCallId,
    Attribute::Date,
    Attribute::Time,
    Attribute::Method,
    Attribute::Transport,
    Attribute::MsgCount,
    Attribute::State,
    Attribute::ConvDur,
    Attribute::TotalDur,
    Attribute::Reason,
    Attribute::Warning,
];

impl Attribute {
    /// Canonical configuration name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Attribute::Index => "index",
            Attribute::SipFrom => "sipfrom",
            Attribute::SipFromUser => "sipfromuser",
            Attribute::SipTo => "sipto",
            Attribute::SipToUser => "siptouser",
            Attribute::Src => "src",
            Attribute::Dst => "dst",
            Attribute::CallId => "callid",
            Attribute::XCallId => "xcallid",
            Attribute::Date => "date",
            Attribute::Time => "time",
            Attribute::Method => "method",
            Attribute::Transport => "transport",
            Attribute::MsgCount => "msgcnt",
            Attribute::State => "state",
            Attribute::ConvDur => "convdur",
            Attribute::TotalDur => "totaldur",
            Attribute::Reason => "reason",
            Attribute::Warning => "warning",
        }
    }

    /// Column title for list rendering.
    #[must_use]
    pub fn title(self) -> &'static str {
        match self {
            Attribute::Index => "Idx",
            Attribute::SipFrom => "SIP From",
            Attribute::SipFromUser => "SIP From User",
            Attribute::SipTo => "SIP To",
            Attribute::SipToUser => "SIP To User",
            Attribute::Src => "Source",
            Attribute::Dst => "Destination",
            Attribute::CallId => "Call-ID",
            Attribute::XCallId => "X-Call-ID",
            Attribute::Date => "Date",
            Attribute::Time => "Time",
            Attribute::Method => "Method",
            Attribute::Transport => "Trans",
            Attribute::MsgCount => "Msgs",
            Attribute::State => "Call State",
            Attribute::ConvDur => "ConvDur",
            Attribute::TotalDur => "TotalDur",
            Attribute::Reason => "Reason Text",
            Attribute::Warning => "Warning",
        }
    }

    /// Looks an attribute up by its configuration name.
    #[must_use]
    pub fn find_by_name(name: &str) -> Option<Self> {
        ATTRIBUTES.iter().copied().find(|a| a.name() == name)
    }

    /// Mutable attributes change as the call receives messages;
    /// immutable ones are fixed by the first message and cacheable.
    #[must_use]
    pub fn is_mutable(self) -> bool {
        matches!(
            self,
            Attribute::MsgCount
                | Attribute::State
                | Attribute::ConvDur
                | Attribute::TotalDur
                | Attribute::Reason
                | Attribute::Warning
        )
    }

    /// Compares two attribute values for call sorting.
    ///
    /// Numeric attributes compare as integers; the rest compare as
    /// strings with empty values sorting last.
    #[must_use]
    pub fn compare_values(self, one: &str, two: &str) -> Ordering {
        match self {
            Attribute::Index | Attribute::MsgCount => {
                let a: i64 = one.parse().unwrap_or(0);
                let b: i64 = two.parse().unwrap_or(0);
                a.cmp(&b)
            }
            _ => {
                if one.is_empty() && two.is_empty() {
                    Ordering::Equal
                } else if one.is_empty() {
                    Ordering::Greater
                } else if two.is_empty() {
                    Ordering::Less
                } else {
                    one.cmp(two)
                }
            }
        }
    }
}
