//! # sipdiag-dissect
//!
//! Chained protocol dissectors for the sipdiag pipeline.
//!
//! Raw frames enter through a [`Parser`] and are dissected layer by layer:
//! link, IP (with fragment reassembly), UDP/TCP (with stream reassembly),
//! then SIP/SDP, RTP/RTCP and companions. Each dissector consumes a prefix
//! of the buffer, attaches typed data to the [`Packet`], and hands the
//! remainder to its sub-dissectors. A dissector that does not recognize
//! the bytes returns them unchanged so the next sibling can try.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dissector;
pub mod dissectors;
pub mod packet;

pub use dissector::{Parser, ProtocolId};
pub use packet::{Frame, Packet, ProtoData};
