//! End-to-end scenarios: raw frames through dissection into storage.

use bytes::Bytes;
use sipdiag_dissect::dissector::{ParserConfig, ProtocolId};
use sipdiag_dissect::{Frame, Packet};
use sipdiag_storage::{
    Attribute, CallState, FilterType, Storage, StorageOptions, StreamType,
};
use sipdiag_types::config::CaptureConfig;

const ETHERTYPE_IPV4: u16 = 0x0800;

fn ethernet(payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; 12];
    bytes.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

fn ipv4(src: [u8; 4], dst: [u8; 4], proto: u8, id: u16, frag: u16, payload: &[u8]) -> Vec<u8> {
    let total_len = (20 + payload.len()) as u16;
    let mut bytes = vec![0x45, 0x00];
    bytes.extend_from_slice(&total_len.to_be_bytes());
    bytes.extend_from_slice(&id.to_be_bytes());
    bytes.extend_from_slice(&frag.to_be_bytes());
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

fn tcp(src_port: u16, dst_port: u16, seq: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(20 + payload.len());
    bytes.extend_from_slice(&src_port.to_be_bytes());
    bytes.extend_from_slice(&dst_port.to_be_bytes());
    bytes.extend_from_slice(&seq.to_be_bytes());
    bytes.extend_from_slice(&0u32.to_be_bytes());
    bytes.push(0x50);
    bytes.push(0x18);
    bytes.extend_from_slice(&[0x20, 0x00]);
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    bytes.extend_from_slice(payload);
    bytes
}

fn rtp(payload_type: u8, seq: u16, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0x80, payload_type & 0x7f];
    bytes.extend_from_slice(&seq.to_be_bytes());
    bytes.extend_from_slice(&(u32::from(seq) * 160).to_be_bytes());
    bytes.extend_from_slice(&ssrc.to_be_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

struct Pipeline {
    storage: Storage,
    input: sipdiag_storage::InputId,
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

    fn feed_udp_sip(&mut self, src: [u8; 4], dst: [u8; 4], payload: &str) {
        let datagram = udp(5060, 5060, payload.as_bytes());
        let packet = ipv4(src, dst, 17, 1, 0, &datagram);
        self.feed(ethernet(&packet));
    }
}

fn sip_request(method: &str, call_id: &str, cseq: u64, to_tag: Option<&str>) -> String {
    let tag = to_tag.map(|t| format!(";tag={t}")).unwrap_or_default();
    format!(
        "{method} sip:bob@example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} {method}\r\n\
         From: <sip:alice@example.com>;tag=a1\r\n\
         To: <sip:bob@example.com>{tag}\r\n\
         Content-Length: 0\r\n\r\n"
    )
}

fn sip_response(code: u16, reason: &str, call_id: &str, cseq: u64) -> String {
    format!(
        "SIP/2.0 {code} {reason}\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} INVITE\r\n\
         From: <sip:alice@example.com>;tag=a1\r\n\
         To: <sip:bob@example.com>;tag=b2\r\n\
         Content-Length: 0\r\n\r\n"
    )
}

/// An INVITE of exactly `size` bytes whose Content-Length matches.
fn large_invite(call_id: &str, size: usize) -> String {
    let head = format!(
        "INVITE sip:bob@example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         From: <sip:alice@example.com>;tag=a1\r\n\
         To: <sip:bob@example.com>\r\n\
         Content-Type: application/sdp\r\n"
    );
    let body_len = size - head.len() - "Content-Length: xxxx\r\n\r\n".len();
    let body = "v".repeat(body_len);
    let message = format!("{head}Content-Length: {body_len:4}\r\n\r\n{body}");
    assert_eq!(message.len(), size);
    message
}

#[test]
fn scenario_complete_dialog_over_udp() {
    let mut pipe = Pipeline::new(StorageOptions::default());
    let a = [10, 0, 0, 1];
    let b = [10, 0, 0, 2];
    let id = "dialog1@example.com";

    pipe.feed_udp_sip(a, b, &sip_request("INVITE", id, 1, None));
    assert_eq!(
        pipe.storage.with_call(id, |c| c.state()).unwrap(),
        Some(CallState::Setup)
    );

    pipe.feed_udp_sip(b, a, &sip_response(200, "OK", id, 1));
    pipe.feed_udp_sip(a, b, &sip_request("ACK", id, 1, Some("b2")));
    assert_eq!(
        pipe.storage.with_call(id, |c| c.state()).unwrap(),
        Some(CallState::InCall)
    );

    pipe.feed_udp_sip(a, b, &sip_request("BYE", id, 2, Some("b2")));

    assert_eq!(pipe.storage.calls_count(), 1);
    pipe.storage
        .with_call(id, |call| {
            assert_eq!(call.state(), Some(CallState::Completed));
            assert_eq!(call.msg_count(), 4);
            assert_eq!(
                call.conv_start().unwrap().method(),
                Some(sipdiag_dissect::dissectors::sip::Method::Ack)
            );
            assert_eq!(
                call.conv_end().unwrap().method(),
                Some(sipdiag_dissect::dissectors::sip::Method::Bye)
            );
            // Messages arrive in order and share the call id
            let stamps: Vec<i64> = call.messages().iter().map(|m| m.timestamp()).collect();
            let mut sorted = stamps.clone();
            sorted.sort_unstable();
            assert_eq!(stamps, sorted);
        })
        .unwrap();
}

#[test]
fn scenario_busy_response() {
    let mut pipe = Pipeline::new(StorageOptions::default());
    let id = "busy@example.com";

    pipe.feed_udp_sip([10, 0, 0, 1], [10, 0, 0, 2], &sip_request("INVITE", id, 1, None));
    pipe.feed_udp_sip([10, 0, 0, 2], [10, 0, 0, 1], &sip_response(486, "Busy Here", id, 1));

    pipe.storage
        .with_call(id, |call| {
            assert_eq!(call.state(), Some(CallState::Busy));
            assert_eq!(call.attribute(Attribute::MsgCount), "2");
        })
        .unwrap();
}

#[test]
fn scenario_fragmented_invite_matches_control() {
    let id = "fragmented@example.com";
    // The UDP header makes the fragmented IP payload exactly 2400 bytes
    let message = large_invite(id, 2392);
    let datagram = udp(5060, 5060, message.as_bytes());

    // Control: the same datagram unfragmented
    let mut control = Pipeline::new(StorageOptions::default());
    control.feed(ethernet(&ipv4(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        17,
        77,
        0,
        &datagram,
    )));
    let control_payload = control
        .storage
        .with_call(id, |c| c.messages()[0].payload().to_string())
        .expect("control call");

    // Three 800-byte fragments delivered 3, 1, 2
    let mut pipe = Pipeline::new(StorageOptions::default());
    let chunks: Vec<&[u8]> = datagram.chunks(800).collect();
    let offsets: Vec<u16> = (0..chunks.len() as u16).map(|i| i * 100).collect();

    let last = chunks.len() - 1;
    pipe.feed(ethernet(&ipv4(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        17,
        77,
        offsets[last],
        chunks[last],
    )));
    assert_eq!(pipe.storage.calls_count(), 0);

    pipe.feed(ethernet(&ipv4(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        17,
        77,
        0x2000,
        chunks[0],
    )));
    assert_eq!(pipe.storage.calls_count(), 0);

    pipe.feed(ethernet(&ipv4(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        17,
        77,
        0x2000 | offsets[1],
        chunks[1],
    )));

    assert_eq!(pipe.storage.calls_count(), 1);
    pipe.storage
        .with_call(id, |call| {
            assert_eq!(call.messages()[0].payload(), control_payload);
            // The reassembled packet holds all three source frames
            assert_eq!(call.messages()[0].packet().frames().len(), 3);
        })
        .expect("reassembled call");
}

#[test]
fn scenario_tcp_segmented_invite() {
    let mut pipe = Pipeline::new(StorageOptions::default());
    let id = "tcpseg@example.com";
    let message = large_invite(id, 2400);
    let bytes = message.as_bytes();
    let (first, second) = bytes.split_at(1000);

    let seq = 52_000u32;
    pipe.feed(ethernet(&ipv4(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        6,
        1,
        0,
        &tcp(5060, 5060, seq, first),
    )));
    // Held in the stream table until the rest arrives
    assert_eq!(pipe.storage.calls_count(), 0);

    pipe.feed(ethernet(&ipv4(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        6,
        2,
        0,
        &tcp(5060, 5060, seq + first.len() as u32, second),
    )));

    assert_eq!(pipe.storage.calls_count(), 1);
    pipe.storage
        .with_call(id, |call| {
            assert_eq!(call.messages()[0].payload(), message);
        })
        .expect("segmented call");
}

const SDP_INVITE_BODY: &str = "v=0\r\n\
    o=alice 1 1 IN IP4 10.0.0.3\r\n\
    s=-\r\n\
    c=IN IP4 10.0.0.3\r\n\
    t=0 0\r\n\
    m=audio 4000 RTP/AVP 0\r\n\
    a=rtpmap:0 PCMU/8000\r\n";

fn sdp_invite(call_id: &str) -> String {
    format!(
        "INVITE sip:bob@example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 10.0.0.1:5060\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         From: <sip:alice@example.com>;tag=a1\r\n\
         To: <sip:bob@example.com>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {}\r\n\r\n{SDP_INVITE_BODY}",
        SDP_INVITE_BODY.len()
    )
}

#[test]
fn scenario_sdp_announced_rtp_stream() {
    let mut pipe = Pipeline::new(StorageOptions::default());
    let id = "media@example.com";

    pipe.feed_udp_sip([10, 0, 0, 1], [10, 0, 0, 2], &sdp_invite(id));
    assert_eq!(pipe.storage.calls_count(), 1);

    // RTP to the announced address from an arbitrary source port
    let media = rtp(0, 7, 0xfeed_f00d, &[0u8; 160]);
    let datagram = udp(49_170, 4000, &media);
    pipe.feed(ethernet(&ipv4(
        [10, 0, 0, 9],
        [10, 0, 0, 3],
        17,
        9,
        0,
        &datagram,
    )));

    pipe.storage
        .with_call(id, |call| {
            assert_eq!(call.streams().len(), 1);
            let stream = &call.streams()[0];
            assert_eq!(stream.stream_type(), StreamType::Rtp);
            assert_eq!(stream.format_name(), Some("PCMU/8000"));
            assert_eq!(stream.ssrc(), 0xfeed_f00d);
            assert_eq!(stream.packet_count(), 1);
            assert_eq!(stream.dst().to_string(), "10.0.0.3:4000");
        })
        .expect("call with stream");
}

#[test]
fn scenario_unannounced_rtp_is_dropped() {
    let mut pipe = Pipeline::new(StorageOptions::default());
    pipe.feed_udp_sip(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        &sip_request("INVITE", "nomedia@example.com", 1, None),
    );

    let media = rtp(0, 1, 1, &[0u8; 40]);
    pipe.feed(ethernet(&ipv4(
        [10, 0, 0, 9],
        [10, 0, 0, 8],
        17,
        9,
        0,
        &udp(40_000, 41_000, &media),
    )));

    pipe.storage
        .with_call("nomedia@example.com", |call| {
            assert!(call.streams().is_empty());
        })
        .unwrap();
}

#[test]
fn scenario_capture_limit_with_rotation() {
    let options = StorageOptions {
        capture: CaptureConfig {
            limit: 2,
            rotate: true,
            ..CaptureConfig::default()
        },
        ..StorageOptions::default()
    };
    let mut pipe = Pipeline::new(options);

    for n in 1..=3 {
        let id = format!("rotated{n}@example.com");
        pipe.feed_udp_sip([10, 0, 0, 1], [10, 0, 0, 2], &sip_request("INVITE", &id, 1, None));
    }

    assert_eq!(pipe.storage.calls_count(), 2);
    // The eldest call is gone, its Call-ID no longer resolves
    assert!(pipe
        .storage
        .with_call("rotated1@example.com", |_| ())
        .is_none());
    assert!(pipe
        .storage
        .with_call("rotated3@example.com", |_| ())
        .is_some());

    // Indexes keep increasing monotonically across the rotation
    pipe.storage.with_calls(|calls| {
        let indexes: Vec<u64> = calls.iter().map(sipdiag_storage::Call::index).collect();
        assert_eq!(indexes, vec![2, 3]);
    });
}

#[test]
fn scenario_capture_limit_without_rotation() {
    let options = StorageOptions {
        capture: CaptureConfig {
            limit: 1,
            rotate: false,
            ..CaptureConfig::default()
        },
        ..StorageOptions::default()
    };
    let mut pipe = Pipeline::new(options);

    pipe.feed_udp_sip(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        &sip_request("INVITE", "kept@example.com", 1, None),
    );
    pipe.feed_udp_sip(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        &sip_request("INVITE", "refused@example.com", 1, None),
    );

    assert_eq!(pipe.storage.calls_count(), 1);
    assert!(pipe.storage.with_call("kept@example.com", |_| ()).is_some());
}

#[test]
fn scenario_invite_only_matching() {
    let options = StorageOptions {
        matching: sipdiag_types::config::MatchConfig {
            invite_only: true,
            ..sipdiag_types::config::MatchConfig::default()
        },
        ..StorageOptions::default()
    };
    let mut pipe = Pipeline::new(options);

    pipe.feed_udp_sip(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        &sip_request("OPTIONS", "opts@example.com", 1, None),
    );
    assert_eq!(pipe.storage.calls_count(), 0);

    pipe.feed_udp_sip(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        &sip_request("INVITE", "inv@example.com", 1, None),
    );
    assert_eq!(pipe.storage.calls_count(), 1);
}

#[test]
fn scenario_match_expression() {
    let options = StorageOptions {
        matching: sipdiag_types::config::MatchConfig {
            expression: Some("alice".to_string()),
            ..sipdiag_types::config::MatchConfig::default()
        },
        ..StorageOptions::default()
    };
    let mut pipe = Pipeline::new(options);

    pipe.feed_udp_sip(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        &sip_request("INVITE", "match@example.com", 1, None),
    );
    assert_eq!(pipe.storage.calls_count(), 1);

    // Existing dialogs keep collecting even non-matching messages
    let bye = sip_request("BYE", "match@example.com", 2, Some("b2")).replace("alice", "zelda");
    pipe.feed_udp_sip([10, 0, 0, 1], [10, 0, 0, 2], &bye);
    assert_eq!(
        pipe.storage.with_call("match@example.com", |c| c.msg_count()),
        Some(2)
    );
}

#[test]
fn scenario_filter_memo_and_reset() {
    let mut pipe = Pipeline::new(StorageOptions::default());
    let id = "filtered@example.com";
    pipe.feed_udp_sip([10, 0, 0, 1], [10, 0, 0, 2], &sip_request("INVITE", id, 1, None));

    pipe.storage
        .set_filter(FilterType::SipFrom, Some("alice"))
        .unwrap();
    assert_eq!(pipe.storage.check_call_filter(id), Some(true));

    // The memo holds across a filter change until the reset
    pipe.storage
        .set_filter(FilterType::SipFrom, Some("nobody"))
        .unwrap();
    assert_eq!(pipe.storage.check_call_filter(id), Some(true));

    pipe.storage.reset_filters();
    assert_eq!(pipe.storage.check_call_filter(id), Some(false));
    assert_eq!(pipe.storage.stats().displayed, 0);
}

#[test]
fn scenario_x_call_id_links_calls() {
    let mut pipe = Pipeline::new(StorageOptions::default());

    pipe.feed_udp_sip(
        [10, 0, 0, 1],
        [10, 0, 0, 2],
        &sip_request("INVITE", "parent@example.com", 1, None),
    );

    let child = format!(
        "INVITE sip:carol@example.com SIP/2.0\r\n\
         Call-ID: child@example.com\r\n\
         X-Call-ID: parent@example.com\r\n\
         CSeq: 1 INVITE\r\n\
         From: <sip:bob@example.com>;tag=b\r\n\
         To: <sip:carol@example.com>\r\n\
         Content-Length: 0\r\n\r\n"
    );
    pipe.feed_udp_sip([10, 0, 0, 2], [10, 0, 0, 3], &child);

    let child_index = pipe
        .storage
        .with_call("child@example.com", sipdiag_storage::Call::index)
        .unwrap();
    let linked = pipe
        .storage
        .with_call("parent@example.com", |c| c.xcalls().to_vec())
        .unwrap();
    assert_eq!(linked, vec![child_index]);
}
