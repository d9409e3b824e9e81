//! RTP / RTCP media streams.

use sipdiag_dissect::dissectors::rtp::standard_encoding;
use sipdiag_dissect::dissectors::sdp::SdpMedia;
use sipdiag_dissect::Packet;
use sipdiag_types::Address;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A stream with no packet for this long is considered inactive.
pub const INACTIVE_THRESHOLD: Duration = Duration::from_secs(1);

/// Media stream flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    /// RTP media.
    Rtp,
    /// RTCP reports.
    Rtcp,
}

/// Interarrival statistics, RFC 3550 appendix A.8 style.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    /// Highest sequence number seen.
    pub max_seq: u16,
    /// Sequence number wraparounds.
    pub cycles: u32,
    /// Estimated lost packets.
    pub lost: u32,
    /// Smoothed interarrival jitter, milliseconds.
    pub jitter: f64,
    /// Delta between the last two arrivals, milliseconds.
    pub delta: f64,
    last_arrival: Option<i64>,
}

impl StreamStats {
    fn update(&mut self, seq: u16, arrival: i64, first: bool) {
        if first {
            self.max_seq = seq;
        } else {
            let expected = self.max_seq.wrapping_add(1);
            if seq != expected {
                if seq < self.max_seq && self.max_seq.wrapping_sub(seq) > 0x8000 {
                    self.cycles += 1;
                } else if seq > expected {
                    self.lost += u32::from(seq - expected);
                }
            }
            if seq > self.max_seq || self.max_seq.wrapping_sub(seq) > 0x8000 {
                self.max_seq = seq;
            }
        }

        if let Some(last) = self.last_arrival {
            let delta = (arrival - last) as f64 / 1000.0;
            // Smoothed estimator over the arrival deltas
            self.jitter += ((delta - self.delta).abs() - self.jitter) / 16.0;
            self.delta = delta;
        }
        self.last_arrival = Some(arrival);
    }
}

/// One media stream announced by SDP and fed by RTP or RTCP packets.
#[derive(Debug)]
pub struct Stream {
    stream_type: StreamType,
    src: Address,
    dst: Address,
    media: Option<SdpMedia>,
    msg_index: usize,
    format: u8,
    ssrc: u32,
    packet_count: u32,
    first_time: Option<i64>,
    last_time: Option<Instant>,
    packets: Vec<Arc<Packet>>,
    stats: StreamStats,
}

impl Stream {
    /// Creates a stream from its announcing message and media.
    #[must_use]
    pub fn new(
        stream_type: StreamType,
        msg_index: usize,
        media: Option<SdpMedia>,
        src: Address,
        dst: Address,
    ) -> Self {
        Self {
            stream_type,
            src,
            dst,
            media,
            msg_index,
            format: 0,
            ssrc: 0,
            packet_count: 0,
            first_time: None,
            last_time: None,
            packets: Vec::new(),
            stats: StreamStats::default(),
        }
    }

    /// Stream flavor.
    #[must_use]
    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    /// Source address.
    #[must_use]
    pub fn src(&self) -> &Address {
        &self.src
    }

    /// Destination address.
    #[must_use]
    pub fn dst(&self) -> &Address {
        &self.dst
    }

    /// Index of the announcing message within its call.
    #[must_use]
    pub fn msg_index(&self) -> usize {
        self.msg_index
    }

    /// The SDP media that announced this stream.
    #[must_use]
    pub fn media(&self) -> Option<&SdpMedia> {
        self.media.as_ref()
    }

    /// Sets the payload format of the first packet.
    pub fn set_format(&mut self, format: u8) {
        self.format = format;
    }

    /// Payload format code.
    #[must_use]
    pub fn format(&self) -> u8 {
        self.format
    }

    /// Sets the synchronization source.
    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.ssrc = ssrc;
    }

    /// Synchronization source identifier.
    #[must_use]
    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Number of packets seen on this stream.
    #[must_use]
    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    /// Retained packets, when RTP capture is enabled.
    #[must_use]
    pub fn packets(&self) -> &[Arc<Packet>] {
        &self.packets
    }

    /// Timestamp of the first packet, microseconds since the epoch.
    #[must_use]
    pub fn first_time(&self) -> Option<i64> {
        self.first_time
    }

    /// Interarrival statistics.
    #[must_use]
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Accounts a packet arriving on this stream.
    pub fn add_packet(&mut self, packet: &Packet, retain: Option<Arc<Packet>>) {
        let arrival = packet.timestamp();

        if let Some(rtp) = packet.rtp_data() {
            self.stats.update(rtp.seq, arrival, self.packet_count == 0);
        }

        if self.first_time.is_none() {
            self.first_time = Some(arrival);
        }
        self.last_time = Some(Instant::now());
        self.packet_count += 1;

        if let Some(packet) = retain {
            self.packets.push(packet);
        }
    }

    /// True while packets keep arriving within the inactivity threshold.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.last_time
            .is_some_and(|last| last.elapsed() <= INACTIVE_THRESHOLD)
    }

    /// A stream is complete once it carried at least one packet.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.packet_count > 0
    }

    /// Resolves the stream format to a displayable encoding name.
    ///
    /// Well-known payload types use the static table; dynamic ones fall
    /// back to what the SDP rtpmap taught the announcing media.
    #[must_use]
    pub fn format_name(&self) -> Option<&str> {
        if let Some(encoding) = standard_encoding(self.format) {
            return Some(encoding.name);
        }
        self.media
            .as_ref()
            .and_then(|m| m.format_name(u32::from(self.format)))
    }
}
