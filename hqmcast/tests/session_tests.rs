//! End-to-end session scenarios against a scripted mock transport engine.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use hqmcast::frame::Frame;
use hqmcast::{
    CloseStatus, CryptoLevel, DataFlags, Error, Header, HeaderCodec, HeaderFlags, IoVerdict,
    LiteralCodec, Mode, Session, SessionCallbacks, StreamWrite, TimerId, TimerKind,
    TransportEngine, TransportError, TransportEvent, TransportSettings, NO_DEADLINE,
};

const NOW: u64 = 1_000_000_000;
const CID: &[u8] = b"\x01\x02\x03\x04\x05\x06\x07\x08";

// ---------------------------------------------------------------------------
// Mock transport engine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EngineState {
    read_pkts: Vec<Vec<u8>>,
    scripted: VecDeque<Vec<TransportEvent>>,
    bytes_in_flight: usize,
    write_accept: Option<usize>,
    opened: Vec<u64>,
    shutdowns: Vec<(u64, u64)>,
    keys: Vec<CryptoLevel>,
    crypto: Vec<CryptoLevel>,
    pending_pkts: VecDeque<Vec<u8>>,
    aead_overhead: Option<usize>,
    handshake_done: bool,
    cid: Vec<u8>,
    next_pn: u64,
    loss_deadline: u64,
    ack_deadline: u64,
    loss_fired: usize,
}

impl EngineState {
    fn new(cid: &[u8]) -> Self {
        Self {
            cid: cid.to_vec(),
            loss_deadline: NO_DEADLINE,
            ack_deadline: NO_DEADLINE,
            ..Default::default()
        }
    }
}

struct MockEngine(Rc<RefCell<EngineState>>);

impl TransportEngine for MockEngine {
    fn read_pkt(&mut self, pkt: &[u8]) -> Result<Vec<TransportEvent>, TransportError> {
        let mut st = self.0.borrow_mut();
        st.read_pkts.push(pkt.to_vec());
        Ok(st.scripted.pop_front().unwrap_or_default())
    }

    fn write_stream(
        &mut self,
        _stream_id: u64,
        data: &[u8],
        _fin: bool,
        out: &mut Vec<u8>,
    ) -> Result<StreamWrite, TransportError> {
        let mut st = self.0.borrow_mut();
        let accepted = st.write_accept.map_or(data.len(), |cap| data.len().min(cap));
        let mut pkt = vec![0x40u8];
        let cid = st.cid.clone();
        pkt.extend_from_slice(&cid);
        pkt.push(st.next_pn as u8);
        st.next_pn += 1;
        pkt.extend_from_slice(&data[..accepted]);
        st.bytes_in_flight += pkt.len();
        let pkt_len = pkt.len();
        out.extend_from_slice(&pkt);
        Ok(StreamWrite { accepted, pkt_len })
    }

    fn write_pkt(&mut self, out: &mut Vec<u8>) -> Result<usize, TransportError> {
        let mut st = self.0.borrow_mut();
        match st.pending_pkts.pop_front() {
            Some(pkt) => {
                out.extend_from_slice(&pkt);
                Ok(pkt.len())
            }
            None => Ok(0),
        }
    }

    fn bytes_in_flight(&self) -> usize {
        self.0.borrow().bytes_in_flight
    }

    fn max_packet_size(&self) -> usize {
        1200
    }

    fn install_keys(
        &mut self,
        level: CryptoLevel,
        _secret: &[u8; 32],
    ) -> Result<(), TransportError> {
        self.0.borrow_mut().keys.push(level);
        Ok(())
    }

    fn submit_crypto_data(
        &mut self,
        level: CryptoLevel,
        _data: &[u8],
    ) -> Result<(), TransportError> {
        self.0.borrow_mut().crypto.push(level);
        Ok(())
    }

    fn set_transport_params(&mut self, _encoded: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn open_stream(&mut self, stream_id: u64) -> Result<(), TransportError> {
        self.0.borrow_mut().opened.push(stream_id);
        Ok(())
    }

    fn shutdown_stream(&mut self, stream_id: u64, app_error: u64) -> Result<(), TransportError> {
        self.0.borrow_mut().shutdowns.push((stream_id, app_error));
        Ok(())
    }

    fn handshake_completed(&mut self) {
        self.0.borrow_mut().handshake_done = true;
    }

    fn set_aead_overhead(&mut self, overhead: usize) {
        self.0.borrow_mut().aead_overhead = Some(overhead);
    }

    fn loss_detection_deadline(&self) -> u64 {
        self.0.borrow().loss_deadline
    }

    fn ack_delay_deadline(&self) -> u64 {
        self.0.borrow().ack_deadline
    }

    fn on_loss_detection_timer(&mut self, _now: u64) -> Result<(), TransportError> {
        let mut st = self.0.borrow_mut();
        st.loss_fired += 1;
        st.loss_deadline = NO_DEADLINE;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Recording host
// ---------------------------------------------------------------------------

#[derive(Default)]
struct HostState {
    inbound: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    begin_headers: Vec<u64>,
    headers: Vec<(HeaderFlags, String, String, u64)>,
    data: Vec<(DataFlags, Vec<u8>, u64, u64)>,
    promises: Vec<(u64, u64)>,
    closes: Vec<(CloseStatus, u64)>,
    timers_set: Vec<(f64, TimerKind)>,
    timers_cancelled: Vec<TimerId>,
    next_timer_id: TimerId,
    support_timers: bool,
}

struct MockHost(Rc<RefCell<HostState>>);

impl SessionCallbacks for MockHost {
    fn recv(&mut self, buf: &mut [u8]) -> IoVerdict {
        let mut st = self.0.borrow_mut();
        match st.inbound.pop_front() {
            Some(pkt) => {
                buf[..pkt.len()].copy_from_slice(&pkt);
                IoVerdict::Ready(pkt.len())
            }
            None => IoVerdict::WouldBlock,
        }
    }

    fn send(&mut self, buf: &[u8]) -> IoVerdict {
        self.0.borrow_mut().sent.push(buf.to_vec());
        IoVerdict::Ready(buf.len())
    }

    fn on_begin_headers(&mut self, stream_user: u64) {
        self.0.borrow_mut().begin_headers.push(stream_user);
    }

    fn on_headers(&mut self, flags: HeaderFlags, header: &Header, stream_user: u64) {
        self.0.borrow_mut().headers.push((
            flags,
            String::from_utf8_lossy(&header.name).into_owned(),
            String::from_utf8_lossy(&header.value).into_owned(),
            stream_user,
        ));
    }

    fn on_data_recv(&mut self, flags: DataFlags, data: &[u8], offset: u64, stream_user: u64) {
        self.0
            .borrow_mut()
            .data
            .push((flags, data.to_vec(), offset, stream_user));
    }

    fn on_begin_promise(&mut self, parent_stream_user: u64, promise_user: u64) {
        self.0
            .borrow_mut()
            .promises
            .push((parent_stream_user, promise_user));
    }

    fn on_request_close(&mut self, status: CloseStatus, stream_user: u64) {
        self.0.borrow_mut().closes.push((status, stream_user));
    }

    fn set_timer(&mut self, seconds: f64, kind: TimerKind) -> Option<TimerId> {
        let mut st = self.0.borrow_mut();
        if !st.support_timers {
            return None;
        }
        st.next_timer_id += 1;
        st.timers_set.push((seconds, kind));
        Some(st.next_timer_id)
    }

    fn cancel_timer(&mut self, id: TimerId) {
        self.0.borrow_mut().timers_cancelled.push(id);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Fixture = (Session, Rc<RefCell<EngineState>>, Rc<RefCell<HostState>>);

fn build_session(mode: Mode, server: bool) -> Fixture {
    let engine_state = Rc::new(RefCell::new(EngineState::new(CID)));
    let host_state = Rc::new(RefCell::new(HostState::default()));
    let engine = Box::new(MockEngine(Rc::clone(&engine_state)));
    let host = Box::new(MockHost(Rc::clone(&host_state)));
    let codec = Box::new(LiteralCodec::new());
    let settings = TransportSettings::default();
    let session = if server {
        Session::new_server(mode, CID, settings, engine, codec, host).expect("server builds")
    } else {
        Session::new_client(mode, CID, settings, engine, codec, host).expect("client builds")
    };
    (session, engine_state, host_state)
}

fn hdrs(pairs: &[(&str, &str)]) -> Vec<Header> {
    pairs
        .iter()
        .map(|(n, v)| Header::new(n.as_bytes().to_vec(), v.as_bytes().to_vec()))
        .collect()
}

fn block(pairs: &[(&str, &str)]) -> Bytes {
    LiteralCodec::new().encode(&hdrs(pairs)).unwrap()
}

/// Queue one dummy bearer packet whose read produces `events`.
fn script(engine: &Rc<RefCell<EngineState>>, host: &Rc<RefCell<HostState>>, events: Vec<TransportEvent>) {
    engine.borrow_mut().scripted.push_back(events);
    host.borrow_mut().inbound.push_back(vec![0u8; 32]);
}

fn stream_data(stream_id: u64, offset: u64, data: Bytes, fin: bool) -> TransportEvent {
    TransportEvent::StreamData {
        stream_id,
        offset,
        data,
        fin,
    }
}

/// All bytes the host sent, concatenated.
fn sent_bytes(host: &Rc<RefCell<HostState>>) -> Vec<u8> {
    host.borrow().sent.iter().flatten().copied().collect()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

// ---------------------------------------------------------------------------
// S1: unicast happy path, server side
// ---------------------------------------------------------------------------

#[test]
fn s1_unicast_request_happy_path() {
    let (mut session, engine, host) = build_session(Mode::Unicast, true);

    let request = Frame::Headers {
        push_id: None,
        block: block(&[
            (":method", "GET"),
            (":scheme", "http"),
            (":path", "/x"),
            (":authority", "example.com"),
        ]),
    }
    .encode();
    script(
        &engine,
        &host,
        vec![
            stream_data(4, 0, request, true),
            TransportEvent::StreamClosed {
                stream_id: 4,
                app_error: 0x01, // NO_ERROR
            },
        ],
    );

    session.recv(NOW).unwrap();

    let st = host.borrow();
    assert_eq!(st.begin_headers.len(), 1, "exactly one begin_headers");
    let user = st.begin_headers[0];
    assert_eq!(st.headers.len(), 4, "four header fields");
    for (flags, _, _, u) in &st.headers[..3] {
        assert!(!flags.contains(HeaderFlags::END_REQUEST));
        assert_eq!(*u, user);
    }
    let last = &st.headers[3];
    assert!(last.0.contains(HeaderFlags::END_REQUEST), "last field ends the request");
    assert_eq!(st.closes, vec![(Ok(()), user)]);
}

// ---------------------------------------------------------------------------
// S2: trailer negotiation
// ---------------------------------------------------------------------------

#[test]
fn s2_trailers_accepted_when_promised() {
    let (mut session, _engine, _host) = build_session(Mode::Unicast, false);
    session
        .submit_request(
            &hdrs(&[(":method", "PUT"), (":path", "/up"), ("trailer", "x-checksum")]),
            None,
            false,
            77,
        )
        .unwrap();
    session.feed_payload_data(77, b"body bytes", false).unwrap();
    session
        .feed_headers(77, &hdrs(&[("x-checksum", "abc123")]), true)
        .unwrap();
}

#[test]
fn s2_trailers_rejected_without_promise() {
    let (mut session, _engine, _host) = build_session(Mode::Unicast, false);
    session
        .submit_request(&hdrs(&[(":method", "PUT"), (":path", "/up")]), None, false, 77)
        .unwrap();
    session.feed_payload_data(77, b"body bytes", false).unwrap();
    assert_eq!(
        session.feed_headers(77, &hdrs(&[("x-checksum", "abc123")]), true),
        Err(Error::TrailersNotPromised)
    );
}

// ---------------------------------------------------------------------------
// S3: multicast goaway
// ---------------------------------------------------------------------------

#[test]
fn s3_goaway_promise_closes_multicast_client() {
    let (mut session, engine, host) = build_session(Mode::Multicast, false);
    assert!(session.is_handshake_complete());

    // Stream 4 opens with the push-promise preamble, then the goaway promise.
    let mut wire = bytes::BytesMut::new();
    hqmcast::varint::encode(0x05, &mut wire);
    hqmcast::varint::encode(0, &mut wire);
    Frame::PushPromise {
        push_id: 0,
        block: block(&[(":path", "goaway"), ("connection", "close")]),
    }
    .encode_into(&mut wire);
    script(&engine, &host, vec![stream_data(4, 0, wire.freeze(), false)]);

    session.recv(NOW).unwrap();
    assert!(session.is_closed(), "goaway promise closes the session");
    assert_eq!(session.recv(NOW), Err(Error::SessionClosed));
    assert_eq!(
        session.submit_request(&hdrs(&[(":path", "/x")]), None, true, 1),
        Err(Error::SessionClosed)
    );
}

#[test]
fn s3_multicast_server_close_emits_goaway_promise() {
    let (mut session, _engine, host) = build_session(Mode::Multicast, true);
    session.close().unwrap();
    let _ = session.send(NOW);

    let expected = Frame::PushPromise {
        push_id: 0,
        block: block(&[(":path", "goaway"), ("connection", "close")]),
    }
    .encode();
    assert!(
        contains(&sent_bytes(&host), &expected),
        "goaway promise goes out on the init request stream"
    );
}

// ---------------------------------------------------------------------------
// S4: out-of-order reassembly at the session level
// ---------------------------------------------------------------------------

#[test]
fn s4_out_of_order_body_delivers_linearly() {
    let (mut session, engine, host) = build_session(Mode::Unicast, true);

    let headers = Frame::Headers {
        push_id: None,
        block: block(&[(":method", "POST"), (":path", "/upload")]),
    }
    .encode();
    let payload: Vec<u8> = (0..300).map(|i| (i % 97) as u8).collect();
    let body = Frame::Data {
        payload: Bytes::from(payload.clone()),
    }
    .encode();
    let base = headers.len() as u64;

    // Headers first, then body chunks at offsets 200, 0, 100 of the frame.
    script(&engine, &host, vec![stream_data(4, 0, headers.clone(), false)]);
    session.recv(NOW).unwrap();
    script(
        &engine,
        &host,
        vec![
            stream_data(4, base + 200, body.slice(200..), true),
            stream_data(4, base, body.slice(..100), false),
            stream_data(4, base + 100, body.slice(100..200), false),
        ],
    );
    session.recv(NOW).unwrap();

    let st = host.borrow();
    let mut expect = 0u64;
    let mut joined = Vec::new();
    for (_, chunk, offset, _) in &st.data {
        assert_eq!(*offset, expect, "ascending, gap-free body offsets");
        expect += chunk.len() as u64;
        joined.extend_from_slice(chunk);
    }
    assert_eq!(joined, payload);
    assert!(
        st.data.last().unwrap().0.contains(DataFlags::END_DATA),
        "final chunk is flagged"
    );
}

// ---------------------------------------------------------------------------
// S5: synthetic ACK shape on the multicast server
// ---------------------------------------------------------------------------

#[test]
fn s5_fake_ack_shape() {
    let (mut session, engine, host) = build_session(Mode::Multicast, true);
    let reads_before = engine.borrow().read_pkts.len();

    // Split the queued control bytes across three small packets.
    engine.borrow_mut().write_accept = Some(4);
    session.send(NOW).unwrap();
    assert!(host.borrow().sent.len() >= 3, "three application packets out");

    // Drain the reflected ACKs into the engine.
    session.recv(NOW).unwrap();
    let st = engine.borrow();
    let acks = &st.read_pkts[reads_before..];
    assert!(acks.len() >= 3);

    let third = &acks[2];
    assert_eq!(third[0], 0x40, "fixed first byte");
    assert_eq!(&third[1..9], CID, "eight-byte connection id");
    assert_eq!(third[9], 0x02, "fabricated peer packet number");
    assert_eq!(third[10], 0x02, "ACK frame type");
    assert_eq!(third[11], 0x02, "largest-ack is the expanded packet number");
    assert!(third.len() - 10 >= 16, "ACK body padded to 16 bytes");
}

// ---------------------------------------------------------------------------
// S6: push promise lifecycle
// ---------------------------------------------------------------------------

#[test]
fn s6_push_promise_lifecycle() {
    let (mut session, _engine, host) = build_session(Mode::Multicast, true);
    let parent = session.init_request_stream_user().unwrap();

    session
        .submit_push_promise(parent, &hdrs(&[(":path", "/a")]), 100)
        .unwrap();
    session
        .submit_push_promise(parent, &hdrs(&[(":path", "/b")]), 101)
        .unwrap();
    assert_eq!(session.next_push_id(), 2);
    assert_eq!(session.num_promises(), 2);

    // Materialise the first promise: it leaves the promises map and lands on
    // a fresh unidirectional stream.
    session
        .feed_headers(100, &hdrs(&[(":status", "200")]), false)
        .unwrap();
    assert_eq!(session.num_promises(), 1);
    assert!(session.transfer_ids().contains(&7));
    assert_eq!(session.transfer_push_id(7), Some(0));

    // Cancel the second: CANCEL_PUSH goes out on the server control stream.
    session.end_request(101, Ok(())).unwrap();
    assert_eq!(session.num_promises(), 0);
    assert_eq!(host.borrow().closes, vec![(Ok(()), 101)]);

    let _ = session.send(NOW);
    let expected = Frame::CancelPush { push_id: 1 }.encode();
    assert!(contains(&sent_bytes(&host), &expected));
}

// ---------------------------------------------------------------------------
// Property 7: bytes-in-flight gate
// ---------------------------------------------------------------------------

#[test]
fn bytes_in_flight_gate_blocks_sends() {
    let (mut session, engine, host) = build_session(Mode::Unicast, false);
    session
        .submit_request(&hdrs(&[(":method", "GET"), (":path", "/x")]), None, true, 5)
        .unwrap();

    engine.borrow_mut().bytes_in_flight = 14_600;
    assert_eq!(session.send(NOW), Err(Error::SessionBlocked));
    assert!(host.borrow().sent.is_empty(), "no packet under the gate");

    engine.borrow_mut().bytes_in_flight = 0;
    session.send(NOW).unwrap();
    assert!(!host.borrow().sent.is_empty(), "packets flow below the gate");
}

// ---------------------------------------------------------------------------
// Property 8: push-id ordering and limits
// ---------------------------------------------------------------------------

#[test]
fn push_ids_allocate_in_order() {
    let (mut session, _engine, _host) = build_session(Mode::Multicast, true);
    let parent = session.init_request_stream_user().unwrap();
    for expected in 0..5u64 {
        assert_eq!(session.next_push_id(), expected);
        session
            .submit_push_promise(parent, &hdrs(&[(":path", "/n")]), 200 + expected)
            .unwrap();
    }
    assert_eq!(session.next_push_id(), 5);
}

#[test]
fn push_limit_zero_rejects_promises() {
    // The unicast profile fixes max_push_promise to zero.
    let (mut session, _engine, _host) = build_session(Mode::Unicast, true);
    assert_eq!(session.max_push_promise(), 0);
    assert_eq!(
        session.submit_push_promise(1, &hdrs(&[(":path", "/p")]), 9),
        Err(Error::PushLimitReached)
    );
}

// ---------------------------------------------------------------------------
// Property 11: held DATA released only after HEADERS
// ---------------------------------------------------------------------------

#[test]
fn data_completing_before_headers_is_held_back() {
    let (mut session, engine, host) = build_session(Mode::Unicast, true);

    let headers = Frame::Headers {
        push_id: None,
        block: block(&[(":method", "POST"), (":path", "/h")]),
    }
    .encode();
    let body = Frame::Data {
        payload: Bytes::from_static(b"early body"),
    }
    .encode();
    let hdr_end = headers.len() as u64;

    // The HEADERS frame header arrives, its block does not; the whole DATA
    // frame lands after it.
    script(
        &engine,
        &host,
        vec![
            stream_data(4, 0, headers.slice(..2), false),
            stream_data(4, hdr_end, body.clone(), true),
        ],
    );
    session.recv(NOW).unwrap();
    assert!(host.borrow().data.is_empty(), "body held while headers gapped");
    assert!(host.borrow().headers.is_empty());

    // The missing block arrives: headers fire first, then the held body.
    script(&engine, &host, vec![stream_data(4, 2, headers.slice(2..), false)]);
    session.recv(NOW).unwrap();

    let st = host.borrow();
    assert_eq!(st.begin_headers.len(), 1);
    assert_eq!(st.headers.len(), 2);
    assert_eq!(st.data.len(), 1);
    assert_eq!(st.data[0].1, b"early body");
    assert!(st.data[0].0.contains(DataFlags::END_DATA));
}

// ---------------------------------------------------------------------------
// Control-stream routing
// ---------------------------------------------------------------------------

#[test]
fn control_frames_on_request_stream_fail_wrong_stream() {
    let (mut session, engine, host) = build_session(Mode::Unicast, true);
    script(
        &engine,
        &host,
        vec![stream_data(4, 0, Frame::CancelPush { push_id: 0 }.encode(), false)],
    );
    session.recv(NOW).unwrap();

    let st = host.borrow();
    assert_eq!(st.closes.len(), 1);
    assert_eq!(st.closes[0].0, Err(Error::WrongStream));
    assert!(engine
        .borrow()
        .shutdowns
        .iter()
        .any(|&(id, code)| id == 4 && code == 0x0a));
}

#[test]
fn settings_on_peer_control_stream_is_accepted() {
    let (mut session, engine, host) = build_session(Mode::Unicast, false);
    script(
        &engine,
        &host,
        vec![stream_data(
            3,
            0,
            Frame::Settings {
                settings: vec![(0x06, 4096)],
            }
            .encode(),
            false,
        )],
    );
    session.recv(NOW).unwrap();
    assert!(host.borrow().closes.is_empty());
}

#[test]
fn goaway_stops_new_requests() {
    let (mut session, engine, host) = build_session(Mode::Unicast, false);
    script(
        &engine,
        &host,
        vec![stream_data(3, 0, Frame::Goaway { id: 0 }.encode(), false)],
    );
    session.recv(NOW).unwrap();
    assert_eq!(
        session.submit_request(&hdrs(&[(":path", "/late")]), None, true, 9),
        Err(Error::SessionClosed)
    );
}

// ---------------------------------------------------------------------------
// Peer-cancelled push
// ---------------------------------------------------------------------------

#[test]
fn peer_cancel_push_closes_promise() {
    let (mut session, engine, host) = build_session(Mode::Unicast, false);
    session
        .submit_request(&hdrs(&[(":method", "GET"), (":path", "/x")]), None, true, 55)
        .unwrap();

    script(
        &engine,
        &host,
        vec![stream_data(
            4,
            0,
            Frame::PushPromise {
                push_id: 0,
                block: block(&[(":path", "/pushed")]),
            }
            .encode(),
            false,
        )],
    );
    session.recv(NOW).unwrap();
    let promise_user = {
        let st = host.borrow();
        assert_eq!(st.promises.len(), 1);
        assert_eq!(st.promises[0].0, 55, "parent handle is the request's");
        st.promises[0].1
    };
    assert_eq!(session.num_promises(), 1);

    script(
        &engine,
        &host,
        vec![stream_data(3, 0, Frame::CancelPush { push_id: 0 }.encode(), false)],
    );
    session.recv(NOW).unwrap();
    assert_eq!(session.num_promises(), 0);
    assert!(host
        .borrow()
        .closes
        .contains(&(Err(Error::NotInterested), promise_user)));
}

// ---------------------------------------------------------------------------
// Client-side push stream materialisation
// ---------------------------------------------------------------------------

#[test]
fn push_stream_binds_to_promise_via_preamble() {
    let (mut session, engine, host) = build_session(Mode::Unicast, false);
    session
        .submit_request(&hdrs(&[(":method", "GET"), (":path", "/x")]), None, true, 55)
        .unwrap();

    script(
        &engine,
        &host,
        vec![stream_data(
            4,
            0,
            Frame::PushPromise {
                push_id: 0,
                block: block(&[(":path", "/pushed")]),
            }
            .encode(),
            false,
        )],
    );
    session.recv(NOW).unwrap();
    let promise_user = host.borrow().promises[0].1;

    // The push stream opens with its push-id, then the response.
    let mut wire = bytes::BytesMut::new();
    hqmcast::varint::encode(0, &mut wire);
    Frame::Headers {
        push_id: Some(0),
        block: block(&[(":status", "200")]),
    }
    .encode_into(&mut wire);
    Frame::Data {
        payload: Bytes::from_static(b"pushed"),
    }
    .encode_into(&mut wire);
    script(&engine, &host, vec![stream_data(7, 0, wire.freeze(), true)]);
    session.recv(NOW).unwrap();

    let st = host.borrow();
    assert!(st.begin_headers.contains(&promise_user));
    assert!(st
        .headers
        .iter()
        .any(|(_, n, v, u)| n == ":status" && v == "200" && *u == promise_user));
    assert_eq!(st.data.len(), 1);
    assert_eq!(st.data[0].1, b"pushed");
    assert_eq!(st.data[0].3, promise_user);
    assert!(st.closes.contains(&(Ok(()), promise_user)));
    drop(st);
    assert_eq!(session.num_promises(), 0);
    assert!(!session.transfer_ids().contains(&7), "push stream retired");
}

// ---------------------------------------------------------------------------
// Request limits
// ---------------------------------------------------------------------------

#[test]
fn multicast_profile_allows_one_request_stream() {
    let (mut session, _engine, _host) = build_session(Mode::Multicast, false);
    session
        .submit_request(&hdrs(&[(":method", "GET"), (":path", "/a")]), None, true, 1)
        .unwrap();
    assert_eq!(
        session.submit_request(&hdrs(&[(":method", "GET"), (":path", "/b")]), None, true, 2),
        Err(Error::TooManyRequests)
    );
}

// ---------------------------------------------------------------------------
// Push-limit raising
// ---------------------------------------------------------------------------

#[test]
fn max_push_promises_cannot_be_lowered() {
    let (mut session, _engine, host) = build_session(Mode::Multicast, false);
    let current = session.max_push_promise();
    assert_eq!(session.set_max_push_promises(current - 1), Err(Error::InvalidPushLimit));
    session.set_max_push_promises(current + 10).unwrap();
    assert_eq!(session.max_push_promise(), current + 10);

    let _ = session.send(NOW);
    let expected = Frame::MaxPushId { max: current + 10 }.encode();
    assert!(contains(&sent_bytes(&host), &expected));
}

// ---------------------------------------------------------------------------
// Multicast handshake forging
// ---------------------------------------------------------------------------

#[test]
fn server_forging_drives_the_engine_through_a_handshake() {
    let (session, engine, _host) = build_session(Mode::Multicast, true);
    assert!(session.is_handshake_complete());

    let st = engine.borrow();
    assert!(st.handshake_done, "engine told the handshake finished");
    assert_eq!(st.aead_overhead, Some(0), "packet arithmetic matches the fiction");
    assert!(st.keys.contains(&CryptoLevel::Handshake));
    assert!(st.keys.contains(&CryptoLevel::Application));
    assert!(st.crypto.contains(&CryptoLevel::Initial));
    assert!(st.crypto.contains(&CryptoLevel::Handshake));
    // A fabricated client-initial (long header) then a stream-0 packet
    // (short header) were hand-fed.
    assert_eq!(st.read_pkts[0][0] & 0xf0, 0xc0);
    assert_eq!(st.read_pkts[1][0], 0x40);
}

#[test]
fn client_forging_installs_all_key_levels() {
    let (session, engine, host) = build_session(Mode::Multicast, false);
    assert!(session.is_handshake_complete());

    let st = engine.borrow();
    assert_eq!(
        st.keys,
        vec![
            CryptoLevel::Initial,
            CryptoLevel::Handshake,
            CryptoLevel::Application
        ]
    );
    assert!(st.handshake_done);
    // The client-initial write plus the committed anchor frame went out.
    assert!(host.borrow().sent.len() >= 2);
}

#[test]
fn materialised_push_opens_engine_stream() {
    let (mut session, engine, _host) = build_session(Mode::Multicast, true);
    let parent = session.init_request_stream_user().unwrap();
    session
        .submit_push_promise(parent, &hdrs(&[(":path", "/a")]), 100)
        .unwrap();
    session
        .feed_headers(100, &hdrs(&[(":status", "200")]), false)
        .unwrap();
    assert!(engine.borrow().opened.contains(&7));
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

#[test]
fn loss_detection_timer_is_armed_and_fires() {
    let (mut session, engine, host) = build_session(Mode::Unicast, false);
    host.borrow_mut().support_timers = true;

    // Complete the handshake, then advertise a future deadline.
    engine.borrow_mut().loss_deadline = NOW + 5_000_000_000;
    script(&engine, &host, vec![TransportEvent::HandshakeCompleted]);
    session.recv(NOW).unwrap();

    {
        let st = host.borrow();
        assert_eq!(st.timers_set.len(), 1);
        let (seconds, kind) = st.timers_set[0];
        assert_eq!(kind, TimerKind::LossDetection);
        assert!((seconds - 5.0).abs() < 1e-6);
    }

    session.handle_timer(TimerKind::LossDetection, NOW + 5_000_000_000).unwrap();
    assert_eq!(engine.borrow().loss_fired, 1);
}

#[test]
fn due_ack_delay_deadline_fires_inline() {
    let (mut session, engine, host) = build_session(Mode::Multicast, true);
    engine.borrow_mut().ack_deadline = NOW - 1;
    engine.borrow_mut().pending_pkts.push_back(vec![0xfe; 40]);

    let _ = session.send(NOW);
    assert!(
        host.borrow().sent.iter().any(|p| p == &vec![0xfeu8; 40]),
        "delayed ACK went out"
    );
}

#[test]
fn disarmed_deadline_cancels_the_host_timer() {
    let (mut session, engine, host) = build_session(Mode::Unicast, false);
    host.borrow_mut().support_timers = true;
    engine.borrow_mut().loss_deadline = NOW + 1_000_000_000;
    script(&engine, &host, vec![TransportEvent::HandshakeCompleted]);
    session.recv(NOW).unwrap();
    assert_eq!(host.borrow().timers_set.len(), 1);

    engine.borrow_mut().loss_deadline = NO_DEADLINE;
    let _ = session.recv(NOW); // blocked read still reconciles timers
    assert_eq!(host.borrow().timers_cancelled.len(), 1);
}

#[test]
fn timers_disabled_without_host_support() {
    let (mut session, engine, host) = build_session(Mode::Unicast, false);
    // support_timers stays false: set_timer returns None.
    engine.borrow_mut().loss_deadline = NOW + 1_000_000_000;
    script(&engine, &host, vec![TransportEvent::HandshakeCompleted]);
    session.recv(NOW).unwrap();
    assert!(host.borrow().timers_set.is_empty());
}
