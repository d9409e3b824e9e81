//! Per-protocol dissector implementations.

pub mod hep;
pub mod ip;
pub mod link;
pub mod mrcp;
pub mod rtcp;
pub mod rtp;
pub mod sdp;
pub mod sip;
pub mod tcp;
pub mod televt;
pub mod tls;
pub mod udp;
