//! # sipdiag-storage
//!
//! Dialog and media-stream storage for the sipdiag pipeline.
//!
//! Packets queue between the capture inputs and a single consumer that
//! runs the dissector chain, groups SIP messages into calls, pairs RTP
//! and RTCP packets with the streams their SDP offers announced, and
//! fans interesting packets out to the configured outputs.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attribute;
pub mod call;
pub mod error;
pub mod filter;
pub mod group;
pub mod message;
pub mod sink;
pub mod storage;
pub mod stream;

pub use attribute::Attribute;
pub use call::{Call, CallState};
pub use error::{StorageError, StorageResult};
pub use filter::{FilterType, Filters};
pub use group::CallGroup;
pub use message::Message;
pub use sink::PacketSink;
pub use storage::{InputId, Storage, StorageEvent, StorageOptions, StorageSender, StorageStats};
pub use stream::{Stream, StreamType};
