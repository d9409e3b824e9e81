//! Storage API behaviors beyond the basic dialog scenarios.

use bytes::Bytes;
use sipdiag_dissect::dissector::{ParserConfig, ProtocolId};
use sipdiag_dissect::{Frame, Packet};
use sipdiag_storage::{
    CallGroup, InputId, Storage, StorageEvent, StorageOptions, StreamType,
};
use sipdiag_types::config::{CaptureConfig, MatchConfig, SortConfig, StorageMode};

fn ethernet(payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; 12];
    bytes.extend_from_slice(&0x0800u16.to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

fn ipv4(src: [u8; 4], dst: [u8; 4], proto: u8, payload: &[u8]) -> Vec<u8> {
    let total_len = (20 + payload.len()) as u16;
    let mut bytes = vec![0x45, 0x00];
    bytes.extend_from_slice(&total_len.to_be_bytes());
    bytes.extend_from_slice(&1u16.to_be_bytes());
    bytes.extend_from_slice(&0u16.to_be_bytes());
    bytes.push(64);
    bytes.push(proto);
    bytes.extend_from_slice(&[0, 0]);
    bytes.extend_from_slice(&src);
    bytes.extend_from_slice(&dst);
    bytes.extend_from_slice(payload);
    bytes
}

fn udp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + payload.len());
    bytes.extend_from_slice(&src_port.to_be_bytes());
    bytes.extend_from_slice(&dst_port.to_be_bytes());
    bytes.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    bytes.extend_from_slice(&[0, 0]);
    bytes.extend_from_slice(payload);
    bytes
}

fn rtp(payload_type: u8, seq: u16, ssrc: u32) -> Vec<u8> {
    let mut bytes = vec![0x80, payload_type & 0x7f];
    bytes.extend_from_slice(&seq.to_be_bytes());
    bytes.extend_from_slice(&(u32::from(seq) * 160).to_be_bytes());
    bytes.extend_from_slice(&ssrc.to_be_bytes());
    bytes.extend_from_slice(&[0u8; 160]);
    bytes
}

fn rtcp_sr(packets: u32) -> Vec<u8> {
    let mut sr = vec![0x80, 200, 0x00, 0x06];
    sr.extend_from_slice(&0x1111u32.to_be_bytes());
    sr.extend_from_slice(&[0u8; 8]);
    sr.extend_from_slice(&[0u8; 4]);
    sr.extend_from_slice(&packets.to_be_bytes());
    sr.extend_from_slice(&[0u8; 4]);
    sr
}

struct Pipeline {
    storage: Storage,
    input: InputId,
    clock: i64,
}

impl Pipeline {
    fn new(options: StorageOptions) -> Self {
        let storage = Storage::new(options).unwrap();
        let input = storage.register_input(ProtocolId::Link, ParserConfig::default());
        Self {
            storage,
            input,
            clock: 1_700_000_000_000_000,
        }
    }

    fn feed(&mut self, frame_bytes: Vec<u8>) {
        self.clock += 20_000;
        let packet = Packet::with_frame(Frame::new(
            self.clock,
            frame_bytes.len() as u32,
            frame_bytes.len() as u32,
            Bytes::from(frame_bytes),
        ));
        self.storage.process_packet(self.input, packet);
    }

    fn feed_sip(&mut self, src: [u8; 4], dst: [u8; 4], payload: &str) {
        let datagram = udp(5060, 5060, payload.as_bytes());
        self.feed(ethernet(&ipv4(src, dst, 17, &datagram)));
    }
}

fn invite(call_id: &str) -> String {
    format!(
        "INVITE sip:bob@example.com SIP/2.0\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         From: <sip:alice@example.com>;tag=a1\r\n\
         To: <sip:bob@example.com>\r\n\
         Content-Length: 0\r\n\r\n"
    )
}

const SDP_BODY: &str = "v=0\r\n\
    o=- 1 1 IN IP4 10.0.0.3\r\n\
    s=-\r\n\
    c=IN IP4 10.0.0.3\r\n\
    t=0 0\r\n\
    m=audio 4000 RTP/AVP 0\r\n";

fn invite_with_sdp(call_id: &str) -> String {
    format!(
        "INVITE sip:bob@example.com SIP/2.0\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         From: <sip:alice@example.com>;tag=a1\r\n\
         To: <sip:bob@example.com>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {}\r\n\r\n{SDP_BODY}",
        SDP_BODY.len()
    )
}

#[test]
fn test_sort_by_msgcnt_descending() {
    let options = StorageOptions {
        sort: SortConfig {
            field: "msgcnt".to_string(),
            ascending: false,
        },
        ..StorageOptions::default()
    };
    let mut pipe = Pipeline::new(options);

    pipe.feed_sip([10, 0, 0, 1], [10, 0, 0, 2], &invite("one@example.com"));
    pipe.feed_sip([10, 0, 0, 1], [10, 0, 0, 2], &invite("two@example.com"));
    // Second dialog receives an extra message
    let cancel = invite("two@example.com").replace("INVITE", "CANCEL");
    pipe.feed_sip([10, 0, 0, 1], [10, 0, 0, 2], &cancel);

    pipe.storage.set_sort(SortConfig {
        field: "msgcnt".to_string(),
        ascending: false,
    });

    pipe.storage.with_calls(|calls| {
        assert_eq!(calls[0].call_id(), "two@example.com");
        assert_eq!(calls[1].call_id(), "one@example.com");
    });

    // The call-id map survives the reorder
    assert!(pipe.storage.with_call("one@example.com", |c| {
        assert_eq!(c.call_id(), "one@example.com");
    })
    .is_some());
}

#[test]
fn test_calls_clear() {
    let mut pipe = Pipeline::new(StorageOptions::default());
    pipe.feed_sip([10, 0, 0, 1], [10, 0, 0, 2], &invite("gone@example.com"));
    assert_eq!(pipe.storage.calls_count(), 1);

    pipe.storage.calls_clear();
    assert_eq!(pipe.storage.calls_count(), 0);
    assert_eq!(pipe.storage.memory_usage(), 0);
    assert!(pipe.storage.with_call("gone@example.com", |_| ()).is_none());
}

#[test]
fn test_calls_clear_soft_drops_displayed_calls() {
    let mut pipe = Pipeline::new(StorageOptions::default());
    pipe.feed_sip([10, 0, 0, 1], [10, 0, 0, 2], &invite("shown@example.com"));
    let hidden = invite("hidden@example.com").replace("alice", "mallory");
    pipe.feed_sip([10, 0, 0, 1], [10, 0, 0, 2], &hidden);

    pipe.storage
        .set_filter(sipdiag_storage::FilterType::SipFrom, Some("alice"))
        .unwrap();
    assert_eq!(pipe.storage.check_call_filter("shown@example.com"), Some(true));
    assert_eq!(
        pipe.storage.check_call_filter("hidden@example.com"),
        Some(false)
    );

    pipe.storage.calls_clear_soft();

    assert_eq!(pipe.storage.calls_count(), 1);
    assert!(pipe
        .storage
        .with_call("hidden@example.com", |_| ())
        .is_some());
}

#[test]
fn test_storage_mode_none_drops_frames() {
    let options = StorageOptions {
        capture: CaptureConfig {
            mode: StorageMode::None,
            ..CaptureConfig::default()
        },
        ..StorageOptions::default()
    };
    let mut pipe = Pipeline::new(options);
    pipe.feed_sip([10, 0, 0, 1], [10, 0, 0, 2], &invite("light@example.com"));

    assert_eq!(pipe.storage.memory_usage(), 0);
    pipe.storage
        .with_call("light@example.com", |call| {
            // Parsed metadata survives, raw frames do not
            assert_eq!(call.msg_count(), 1);
            assert!(call.messages()[0].packet().frames().is_empty());
            assert!(call.messages()[0].payload().contains("INVITE"));
        })
        .unwrap();
}

#[test]
fn test_complete_dialogs_only() {
    let options = StorageOptions {
        matching: MatchConfig {
            complete_dialogs_only: true,
            ..MatchConfig::default()
        },
        ..StorageOptions::default()
    };
    let mut pipe = Pipeline::new(options);

    // A stray BYE cannot start a dialog
    let bye = invite("stray@example.com").replace("INVITE", "BYE");
    pipe.feed_sip([10, 0, 0, 1], [10, 0, 0, 2], &bye);
    assert_eq!(pipe.storage.calls_count(), 0);

    // MESSAGE still can
    let message = invite("im@example.com").replace("INVITE", "MESSAGE");
    pipe.feed_sip([10, 0, 0, 1], [10, 0, 0, 2], &message);
    assert_eq!(pipe.storage.calls_count(), 1);
}

#[test]
fn test_inverted_match_expression() {
    let options = StorageOptions {
        matching: MatchConfig {
            expression: Some("mallory".to_string()),
            invert: true,
            ..MatchConfig::default()
        },
        ..StorageOptions::default()
    };
    let mut pipe = Pipeline::new(options);

    pipe.feed_sip([10, 0, 0, 1], [10, 0, 0, 2], &invite("clean@example.com"));
    assert_eq!(pipe.storage.calls_count(), 1);

    let tainted = invite("tainted@example.com").replace("alice", "mallory");
    pipe.feed_sip([10, 0, 0, 1], [10, 0, 0, 2], &tainted);
    assert_eq!(pipe.storage.calls_count(), 1);
}

#[test]
fn test_rtp_from_signaling_address_still_pairs() {
    let mut pipe = Pipeline::new(StorageOptions::default());
    pipe.feed_sip(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        &invite_with_sdp("sigsrc@example.com"),
    );

    // RTP arrives at the announced port but on the signaling IP
    let media = rtp(0, 1, 0xabcd);
    pipe.feed(ethernet(&ipv4(
        [10, 0, 0, 2],
        [10, 0, 0, 1],
        17,
        &udp(4000, 4000, &media),
    )));

    pipe.storage
        .with_call("sigsrc@example.com", |call| {
            assert_eq!(call.streams().len(), 1);
        })
        .unwrap();
}

#[test]
fn test_rtcp_stream_pairs_on_rtcp_port() {
    let mut pipe = Pipeline::new(StorageOptions::default());
    pipe.feed_sip(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        &invite_with_sdp("rtcp@example.com"),
    );

    // RTCP to the default RTCP port (RTP + 1)
    pipe.feed(ethernet(&ipv4(
        [10, 0, 0, 9],
        [10, 0, 0, 3],
        17,
        &udp(4001, 4001, &rtcp_sr(250)),
    )));

    pipe.storage
        .with_call("rtcp@example.com", |call| {
            assert_eq!(call.streams().len(), 1);
            assert_eq!(call.streams()[0].stream_type(), StreamType::Rtcp);
            assert_eq!(call.streams()[0].packet_count(), 1);
        })
        .unwrap();
}

#[test]
fn test_rtp_retention_with_capture_rtp() {
    let options = StorageOptions {
        capture: CaptureConfig {
            rtp: true,
            ..CaptureConfig::default()
        },
        ..StorageOptions::default()
    };
    let mut pipe = Pipeline::new(options);
    pipe.feed_sip(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        &invite_with_sdp("retain@example.com"),
    );

    for seq in 0..5u16 {
        let media = rtp(0, seq, 0xabcd);
        pipe.feed(ethernet(&ipv4(
            [10, 0, 0, 9],
            [10, 0, 0, 3],
            17,
            &udp(40_000, 4000, &media),
        )));
    }

    pipe.storage
        .with_call("retain@example.com", |call| {
            let stream = &call.streams()[0];
            assert_eq!(stream.packet_count(), 5);
            assert_eq!(stream.packets().len(), 5);
            // Retained packet timestamps are monotonic
            let stamps: Vec<i64> = stream.packets().iter().map(|p| p.timestamp()).collect();
            let mut sorted = stamps.clone();
            sorted.sort_unstable();
            assert_eq!(stamps, sorted);
        })
        .unwrap();
    assert!(pipe.storage.memory_usage() > 0);
}

#[test]
fn test_memory_limit_emits_event_and_stops() {
    let options = StorageOptions {
        capture: CaptureConfig {
            mem_limit: 64,
            ..CaptureConfig::default()
        },
        ..StorageOptions::default()
    };
    let storage = Storage::new(options).unwrap();
    let input = storage.register_input(ProtocolId::Link, ParserConfig::default());
    let mut events = storage.events().unwrap();

    storage.start().unwrap();

    // One SIP packet retains more than the 64-byte cap
    let payload = invite("heavy@example.com");
    let datagram = udp(5060, 5060, payload.as_bytes());
    let frame_bytes = ethernet(&ipv4([10, 0, 0, 1], [10, 0, 0, 2], 17, &datagram));
    let packet = Packet::with_frame(Frame::new(
        1,
        frame_bytes.len() as u32,
        frame_bytes.len() as u32,
        Bytes::from(frame_bytes),
    ));
    storage.sender().push(input, packet);

    // The 500 ms watchdog notices and stops intake
    let event = events.blocking_recv().expect("memory event");
    assert!(matches!(event, StorageEvent::MemoryLimit { .. }));
    assert!(!storage.is_running());

    storage.stop();
    // The already-stored call survives the capture stop
    assert_eq!(storage.calls_count(), 1);
}

#[test]
fn test_group_locks_calls_against_rotation() {
    let options = StorageOptions {
        capture: CaptureConfig {
            limit: 2,
            rotate: true,
            ..CaptureConfig::default()
        },
        ..StorageOptions::default()
    };
    let mut pipe = Pipeline::new(options);

    pipe.feed_sip([10, 0, 0, 1], [10, 0, 0, 2], &invite("pinned@example.com"));
    pipe.feed_sip([10, 0, 0, 1], [10, 0, 0, 2], &invite("loose@example.com"));

    let mut group = CallGroup::new();
    pipe.storage
        .with_call_mut("pinned@example.com", |call| group.add(call))
        .unwrap();

    // The third call evicts the oldest *unlocked* call
    pipe.feed_sip([10, 0, 0, 1], [10, 0, 0, 2], &invite("third@example.com"));

    assert!(pipe
        .storage
        .with_call("pinned@example.com", |_| ())
        .is_some());
    assert!(pipe.storage.with_call("loose@example.com", |_| ()).is_none());

    // Group aggregation sees the locked call's messages
    pipe.storage.with_calls(|calls| {
        assert_eq!(group.messages(calls).len(), 1);
    });
}

#[test]
fn test_changed_flag_handshake() {
    let mut pipe = Pipeline::new(StorageOptions::default());
    assert!(!pipe.storage.calls_changed());

    pipe.feed_sip([10, 0, 0, 1], [10, 0, 0, 2], &invite("flag@example.com"));
    assert!(pipe.storage.calls_changed());
    assert!(!pipe.storage.calls_changed());
}
