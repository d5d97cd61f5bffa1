//! The session façade.
//!
//! One `Session` owns the per-connection state machine: the stream maps, the
//! header-compression context, the transport engine handle, the packet
//! queues, and the two timer slots. All progress is host-driven through
//! `recv`, `send` and `handle_timer`; the session never blocks and issues no
//! background work of its own. A session is not safe for concurrent entry.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::buffer::SegmentChain;
use crate::callbacks::{DataFlags, HeaderFlags, IoVerdict, SessionCallbacks};
use crate::config::{
    Mode, Role, TransportParams, TransportSettings, BUFFER_READ_SIZE, CLIENT_CONTROL_STREAM_ID,
    FIRST_PUSH_STREAM_ID, HANDSHAKE_ANCHOR_STREAM_ID, INIT_REQUEST_STREAM_ID,
    PUSH_PROMISE_STREAM_ID, SERVER_CONTROL_STREAM_ID,
};
use crate::error::{app_error_from_status, h3, status_from_app_error, CloseStatus, Error, Result};
use crate::frame::{Frame, FrameType};
use crate::hdr::{promises_trailers, Header, HeaderCodec};
use crate::map::{is_bidi, StreamMap};
use crate::reassembly::Deliverable;
use crate::stream::{Phase, Preamble, Stream};
use crate::timer::TimerSlot;
use crate::transport::{TransportEngine, TransportEvent};
use crate::varint;

/// SETTINGS announced on the local control stream at session start.
const DEFAULT_SETTINGS: &[(u64, u64)] = &[(0x06, 16_384)];

/// Per-connection session state.
pub struct Session {
    pub(crate) role: Role,
    pub(crate) mode: Mode,
    pub(crate) session_id: Bytes,
    pub(crate) handshake_complete: bool,
    pub(crate) closing: bool,
    pub(crate) closed: bool,
    pub(crate) settings: TransportSettings,
    pub(crate) params: TransportParams,
    pub(crate) max_push_promise: u64,
    pub(crate) next_push_id: u64,
    next_request_stream_id: u64,
    next_push_stream_id: u64,
    next_user_handle: u64,
    last_remote_bidi_stream: u64,
    pub(crate) transfers: StreamMap,
    pub(crate) promises: StreamMap,
    pub(crate) codec: Box<dyn HeaderCodec>,
    pub(crate) engine: Box<dyn TransportEngine>,
    pub(crate) callbacks: Box<dyn SessionCallbacks>,
    /// Inbound packets awaiting the engine: fabricated handshake packets and
    /// reflected synthetic ACKs.
    pub(crate) recv_queue: SegmentChain,
    /// Outbound packets the bearer could not take yet.
    pub(crate) send_queue: SegmentChain,
    pub(crate) last_remote_pkt_num: u64,
    pub(crate) remote_pktnum: u64,
    pub(crate) loss_timer: TimerSlot,
    pub(crate) ack_timer: TimerSlot,
}

impl Session {
    /// Build a client session. Multicast construction forges the handshake
    /// before returning.
    pub fn new_client(
        mode: Mode,
        session_id: &[u8],
        settings: TransportSettings,
        engine: Box<dyn TransportEngine>,
        codec: Box<dyn HeaderCodec>,
        callbacks: Box<dyn SessionCallbacks>,
    ) -> Result<Session> {
        Self::build(Role::Client, mode, session_id, settings, engine, codec, callbacks)
    }

    /// Build a server session. Multicast construction forges the handshake
    /// before returning.
    pub fn new_server(
        mode: Mode,
        session_id: &[u8],
        settings: TransportSettings,
        engine: Box<dyn TransportEngine>,
        codec: Box<dyn HeaderCodec>,
        callbacks: Box<dyn SessionCallbacks>,
    ) -> Result<Session> {
        Self::build(Role::Server, mode, session_id, settings, engine, codec, callbacks)
    }

    fn build(
        role: Role,
        mode: Mode,
        session_id: &[u8],
        settings: TransportSettings,
        engine: Box<dyn TransportEngine>,
        codec: Box<dyn HeaderCodec>,
        callbacks: Box<dyn SessionCallbacks>,
    ) -> Result<Session> {
        if session_id.is_empty() || session_id.len() > 20 {
            return Err(Error::BadUserData("session id must be 1..=20 bytes"));
        }
        let params = TransportParams::for_mode(mode);
        let mut session = Session {
            role,
            mode,
            session_id: Bytes::copy_from_slice(session_id),
            handshake_complete: false,
            closing: false,
            closed: false,
            settings,
            params,
            max_push_promise: params.max_push_promise,
            next_push_id: 0,
            next_request_stream_id: INIT_REQUEST_STREAM_ID,
            next_push_stream_id: FIRST_PUSH_STREAM_ID,
            next_user_handle: 1,
            last_remote_bidi_stream: 0,
            transfers: StreamMap::new(),
            promises: StreamMap::new(),
            codec,
            engine,
            callbacks,
            recv_queue: SegmentChain::new(),
            send_queue: SegmentChain::new(),
            last_remote_pkt_num: 0,
            remote_pktnum: 0,
            loss_timer: TimerSlot::default(),
            ack_timer: TimerSlot::default(),
        };

        let encoded = session.params.encode()?;
        session
            .engine
            .set_transport_params(&encoded)
            .map_err(Error::from)?;

        // The anchor stream the fabricated handshake writes to.
        let anchor_user = session.alloc_handle();
        session
            .transfers
            .add(HANDSHAKE_ANCHOR_STREAM_ID, Stream::new(HANDSHAKE_ANCHOR_STREAM_ID, anchor_user));

        // The local control stream, seeded with our SETTINGS.
        let ctl_id = match role {
            Role::Client => CLIENT_CONTROL_STREAM_ID,
            Role::Server => SERVER_CONTROL_STREAM_ID,
        };
        let ctl_user = session.alloc_handle();
        let mut ctl = Stream::new(ctl_id, ctl_user);
        ctl.queue_frame_bytes(
            Frame::Settings {
                settings: DEFAULT_SETTINGS.to_vec(),
            }
            .encode(),
            false,
        );
        session.transfers.add(ctl_id, ctl);

        if mode == Mode::Multicast && role == Role::Server {
            // The init request stream all promises are announced on. It opens
            // with the push-promise stream preamble the audience consumes.
            let init_user = session.alloc_handle();
            let mut init = Stream::new(INIT_REQUEST_STREAM_ID, init_user);
            let mut preamble = BytesMut::new();
            varint::encode(FrameType::PushPromise as u64, &mut preamble);
            varint::encode(0, &mut preamble);
            init.queue_frame_bytes(preamble.freeze(), false);
            session.transfers.add(INIT_REQUEST_STREAM_ID, init);
        }

        match (mode, role) {
            (Mode::Multicast, Role::Client) => session.forge_client_handshake()?,
            (Mode::Multicast, Role::Server) => session.forge_server_handshake()?,
            (Mode::Unicast, _) => {}
        }
        debug!(?role, ?mode, "session built");
        Ok(session)
    }

    // ---- public accessors -------------------------------------------------

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn session_id(&self) -> &[u8] {
        &self.session_id
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn next_push_id(&self) -> u64 {
        self.next_push_id
    }

    pub fn max_push_promise(&self) -> u64 {
        self.max_push_promise
    }

    pub fn num_promises(&self) -> usize {
        self.promises.len()
    }

    /// Live stream ids, ascending.
    pub fn transfer_ids(&self) -> Vec<u64> {
        self.transfers.keys().collect()
    }

    /// The push id a transfer stream materialises, if any.
    pub fn transfer_push_id(&self, stream_id: u64) -> Option<u64> {
        self.transfers.find(stream_id).and_then(Stream::push_id)
    }

    /// User handle of the multicast init request stream.
    pub fn init_request_stream_user(&self) -> Option<u64> {
        self.transfers.find(INIT_REQUEST_STREAM_ID).map(Stream::user)
    }

    // ---- submission api ---------------------------------------------------

    /// Open a new request stream and queue its header block, plus an optional
    /// body. Client only.
    pub fn submit_request(
        &mut self,
        headers: &[Header],
        body: Option<&[u8]>,
        fin: bool,
        user: u64,
    ) -> Result<()> {
        if self.role != Role::Client {
            return Err(Error::ClientOnly);
        }
        self.check_open()?;
        let open_requests = self.transfers.num_requests().saturating_sub(1);
        if open_requests as u64 >= self.settings.max_open_requests {
            return Err(Error::TooManyRequests);
        }
        if self.next_request_stream_id > self.params.highest_bidi_stream_id {
            return Err(Error::TooManyRequests);
        }

        let id = self.next_request_stream_id;
        self.engine.open_stream(id).map_err(Error::from)?;
        self.next_request_stream_id += 4;

        let mut stream = Stream::new(id, user);
        if promises_trailers(headers) {
            stream.set_trailers_promised();
        }
        stream.send_headers()?;
        let block = self.codec.encode(headers)?;
        let headers_end = fin && body.is_none();
        stream.queue_frame_bytes(
            Frame::Headers {
                push_id: None,
                block,
            }
            .encode(),
            headers_end,
        );
        if let Some(body) = body {
            stream.send_data()?;
            stream.queue_frame_bytes(
                Frame::Data {
                    payload: Bytes::copy_from_slice(body),
                }
                .encode(),
                fin,
            );
        }
        self.transfers.add(id, stream);
        debug!(stream_id = id, "request submitted");
        Ok(())
    }

    /// Announce a push on an existing request stream. Server only.
    pub fn submit_push_promise(
        &mut self,
        parent_user: u64,
        headers: &[Header],
        promise_user: u64,
    ) -> Result<()> {
        if self.role != Role::Server {
            return Err(Error::ServerOnly);
        }
        self.check_open()?;
        if self.next_push_id >= self.max_push_promise {
            return Err(Error::PushLimitReached);
        }
        let parent_id = self
            .transfers
            .find_by_user(parent_user)
            .ok_or(Error::BadUserData("unknown parent stream handle"))?;

        let push_id = self.next_push_id;
        self.next_push_id += 1;

        let block = self.codec.encode(headers)?;
        let frame = Frame::PushPromise { push_id, block }.encode();
        self.transfers
            .find_mut(parent_id)
            .ok_or(Error::Internal("parent stream vanished"))?
            .queue_frame_bytes(frame, false);

        self.promises
            .add(push_id, Stream::new_promise(push_id, promise_user));
        debug!(push_id, parent_id, "push promise submitted");
        Ok(())
    }

    /// Feed a header block to a stream or promise addressed by handle.
    ///
    /// Feeding a promise materialises it: the promise moves out of the
    /// promises map onto a freshly allocated unidirectional stream.
    pub fn feed_headers(&mut self, user_handle: u64, headers: &[Header], fin: bool) -> Result<()> {
        self.check_open()?;
        if let Some(id) = self.transfers.find_by_user(user_handle) {
            return self.feed_stream_headers(id, headers, fin);
        }
        let Some(push_id) = self.promises.find_by_user(user_handle) else {
            return Err(Error::BadUserData("no stream for handle"));
        };
        self.materialise_promise(push_id, headers, fin)
    }

    fn feed_stream_headers(&mut self, id: u64, headers: &[Header], fin: bool) -> Result<()> {
        let block = self.codec.encode(headers)?;
        let trailers = promises_trailers(headers);
        let stream = self
            .transfers
            .find_mut(id)
            .ok_or(Error::Internal("stream vanished"))?;
        stream.send_headers()?;
        if trailers {
            stream.set_trailers_promised();
        }
        let push_id = stream.push_id();
        stream.queue_frame_bytes(Frame::Headers { push_id, block }.encode(), fin);
        Ok(())
    }

    fn materialise_promise(&mut self, push_id: u64, headers: &[Header], fin: bool) -> Result<()> {
        if self.role != Role::Server {
            return Err(Error::ServerOnly);
        }
        if self.next_push_stream_id > self.params.highest_uni_stream_id {
            return Err(Error::PushLimitReached);
        }
        // The local control stream also occupies a unidirectional id.
        let open_pushes = self.transfers.num_pushes().saturating_sub(1);
        if open_pushes as u64 >= self.settings.max_open_server_pushes {
            return Err(Error::PushLimitReached);
        }
        let id = self.next_push_stream_id;
        self.engine.open_stream(id).map_err(Error::from)?;
        self.next_push_stream_id += 4;

        let block = self.codec.encode(headers)?;
        let mut stream = self
            .promises
            .remove(push_id)
            .ok_or(Error::Internal("promise vanished"))?;
        stream.materialise(id);
        if promises_trailers(headers) {
            stream.set_trailers_promised();
        }
        stream.send_headers()?;

        // The stream opens with its push-id, naming the promise it carries.
        let mut preamble = BytesMut::new();
        varint::encode(push_id, &mut preamble);
        stream.queue_frame_bytes(preamble.freeze(), false);
        stream.queue_frame_bytes(
            Frame::Headers {
                push_id: Some(push_id),
                block,
            }
            .encode(),
            fin,
        );
        self.transfers.add(id, stream);
        debug!(push_id, stream_id = id, "promise materialised");
        Ok(())
    }

    /// Feed body bytes to a stream addressed by handle.
    pub fn feed_payload_data(&mut self, user_handle: u64, data: &[u8], fin: bool) -> Result<()> {
        self.check_open()?;
        let id = self
            .transfers
            .find_by_user(user_handle)
            .ok_or(Error::BadUserData("no stream for handle"))?;
        let stream = self
            .transfers
            .find_mut(id)
            .ok_or(Error::Internal("stream vanished"))?;
        stream.send_data()?;
        stream.queue_frame_bytes(
            Frame::Data {
                payload: Bytes::copy_from_slice(data),
            }
            .encode(),
            fin,
        );
        Ok(())
    }

    /// Cancel a request or promise.
    ///
    /// An in-flight stream is shut down through the engine and its close
    /// surfaces later as `on_request_close`. A promise that has not been
    /// materialised is cancelled with a CANCEL_PUSH frame on the local
    /// control stream instead.
    pub fn end_request(&mut self, user_handle: u64, status: CloseStatus) -> Result<()> {
        self.check_open()?;
        if let Some(push_id) = self.promises.find_by_user(user_handle) {
            let frame = Frame::CancelPush { push_id }.encode();
            let ctl_id = self.local_control_stream();
            self.transfers
                .find_mut(ctl_id)
                .ok_or(Error::Internal("control stream missing"))?
                .queue_frame_bytes(frame, false);
            if let Some(promise) = self.promises.remove(push_id) {
                self.callbacks.on_request_close(status, promise.user());
            }
            debug!(push_id, "promise cancelled");
            return Ok(());
        }
        let id = self
            .transfers
            .find_by_user(user_handle)
            .ok_or(Error::BadUserData("no stream for handle"))?;
        if let Some(stream) = self.transfers.find_mut(id) {
            stream.set_status(status);
        }
        self.engine
            .shutdown_stream(id, app_error_from_status(status))
            .map_err(Error::from)?;
        Ok(())
    }

    /// Raise the number of pushes the client will accept. Client only; the
    /// limit can never be lowered.
    pub fn set_max_push_promises(&mut self, max: u64) -> Result<()> {
        if self.role != Role::Client {
            return Err(Error::ClientOnly);
        }
        self.check_open()?;
        if max < self.max_push_promise {
            return Err(Error::InvalidPushLimit);
        }
        self.max_push_promise = max;
        let frame = Frame::MaxPushId { max }.encode();
        let ctl_id = self.local_control_stream();
        self.transfers
            .find_mut(ctl_id)
            .ok_or(Error::Internal("control stream missing"))?
            .queue_frame_bytes(frame, false);
        Ok(())
    }

    /// Begin an orderly close.
    ///
    /// Unicast sessions announce GOAWAY on the control stream. A multicast
    /// server announces the goaway push-promise on the init request stream;
    /// when that stream is absent the close is skipped rather than failed.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        match (self.mode, self.role) {
            (Mode::Unicast, _) => {
                let frame = Frame::Goaway {
                    id: self.last_remote_bidi_stream,
                }
                .encode();
                let ctl_id = self.local_control_stream();
                self.transfers
                    .find_mut(ctl_id)
                    .ok_or(Error::Internal("control stream missing"))?
                    .queue_frame_bytes(frame, false);
            }
            (Mode::Multicast, Role::Server) => {
                if self.transfers.contains(INIT_REQUEST_STREAM_ID) {
                    let headers = [
                        Header::new(&b":path"[..], &b"goaway"[..]),
                        Header::new(&b"connection"[..], &b"close"[..]),
                    ];
                    let block = self.codec.encode(&headers)?;
                    let push_id = self.next_push_id;
                    self.next_push_id += 1;
                    let frame = Frame::PushPromise { push_id, block }.encode();
                    self.transfers
                        .find_mut(INIT_REQUEST_STREAM_ID)
                        .ok_or(Error::Internal("init request stream vanished"))?
                        .queue_frame_bytes(frame, false);
                } else {
                    debug!("init request stream absent, skipping goaway promise");
                }
            }
            (Mode::Multicast, Role::Client) => {
                self.closed = true;
            }
        }
        self.closing = true;
        Ok(())
    }

    // ---- recv / send ------------------------------------------------------

    /// Pull bearer bytes through the transport engine and fire callbacks for
    /// everything that became ready. `now` is the host's monotonic clock in
    /// nanoseconds.
    pub fn recv(&mut self, now: u64) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let mut processed = 0usize;

        // Internally queued packets first: fabricated handshake packets and
        // reflected synthetic ACKs.
        while let Some(seg) = self.recv_queue.pop() {
            self.feed_engine(seg.bytes())?;
            processed += 1;
        }

        loop {
            let mut buf = vec![0u8; BUFFER_READ_SIZE];
            match self.callbacks.recv(&mut buf) {
                IoVerdict::Ready(0) | IoVerdict::WouldBlock => break,
                IoVerdict::Eof => {
                    self.closed = true;
                    return Err(Error::SessionClosed);
                }
                IoVerdict::Ready(n) => {
                    self.feed_engine(&buf[..n])?;
                    processed += 1;
                }
            }
        }

        if self.closing {
            // Remaining buffer drained above; the session is now closed.
            self.closed = true;
        }
        self.reconcile_timers(now)?;
        if processed == 0 {
            return Err(Error::SessionBlocked);
        }
        Ok(())
    }

    /// Run the send scheduler and reconcile timers. `now` is the host's
    /// monotonic clock in nanoseconds.
    pub fn send(&mut self, now: u64) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        let outcome = self.scheduler_run();
        self.reconcile_timers(now)?;
        outcome.map(|_| ())
    }

    // ---- engine plumbing --------------------------------------------------

    fn feed_engine(&mut self, pkt: &[u8]) -> Result<()> {
        let events = match self.engine.read_pkt(pkt) {
            Ok(events) => events,
            Err(e) => {
                let err = Error::from(e);
                if matches!(
                    err,
                    Error::TransportProtocol | Error::TransportVersion | Error::Crypto
                ) {
                    // Session-level failure: the session is unusable.
                    self.closed = true;
                }
                return Err(err);
            }
        };
        self.process_events(events)
    }

    pub(crate) fn process_events(&mut self, events: Vec<TransportEvent>) -> Result<()> {
        for event in events {
            match event {
                TransportEvent::HandshakeCompleted => {
                    self.handshake_complete = true;
                }
                TransportEvent::StreamData {
                    stream_id,
                    offset,
                    data,
                    fin,
                } => self.handle_stream_data(stream_id, offset, data, fin)?,
                TransportEvent::StreamClosed {
                    stream_id,
                    app_error,
                } => self.handle_stream_closed(stream_id, app_error),
            }
        }
        Ok(())
    }

    fn handle_stream_data(
        &mut self,
        stream_id: u64,
        offset: u64,
        data: Bytes,
        fin: bool,
    ) -> Result<()> {
        if !self.transfers.contains(stream_id) {
            self.open_remote_stream(stream_id);
        }
        let deliverables = {
            let stream = self
                .transfers
                .find_mut(stream_id)
                .ok_or(Error::Internal("stream creation failed"))?;
            stream.recv_stream_data(&data, offset, fin)?
        };
        self.process_deliverables(stream_id, deliverables)
    }

    fn open_remote_stream(&mut self, stream_id: u64) {
        let user = self.alloc_handle();
        let mut stream = Stream::new(stream_id, user);
        if self.role == Role::Client && stream_id & 0x3 == 3 && stream_id != SERVER_CONTROL_STREAM_ID
        {
            stream.set_preamble(Preamble::PushId);
        }
        if self.mode == Mode::Multicast
            && self.role == Role::Client
            && stream_id == PUSH_PROMISE_STREAM_ID
        {
            stream.set_preamble(Preamble::TypeAndPushId);
        }
        if is_bidi(stream_id) && stream_id > self.last_remote_bidi_stream {
            self.last_remote_bidi_stream = stream_id;
        }
        debug!(stream_id, "remote stream opened");
        self.transfers.add(stream_id, stream);
    }

    fn process_deliverables(&mut self, stream_id: u64, items: Vec<Deliverable>) -> Result<()> {
        for item in items {
            match item {
                Deliverable::Preamble { push_id: Some(id) } => {
                    self.bind_push_stream(stream_id, id);
                }
                Deliverable::Preamble { push_id: None } => {}
                Deliverable::Frame { ftype, payload } => {
                    self.handle_frame(stream_id, ftype, payload)?;
                }
                Deliverable::Data { offset, data, end } => {
                    self.deliver_data(stream_id, offset, data, end)?;
                }
            }
        }
        Ok(())
    }

    fn bind_push_stream(&mut self, stream_id: u64, push_id: u64) {
        match self.promises.remove(push_id) {
            Some(promise) => {
                let user = promise.user();
                if let Some(stream) = self.transfers.find_mut(stream_id) {
                    stream.set_user(user);
                    stream.bind_push(push_id);
                }
                debug!(stream_id, push_id, "push stream bound to promise");
            }
            None => {
                warn!(stream_id, push_id, "push stream names an unknown promise");
                let _ = self.engine.shutdown_stream(stream_id, h3::PUSH_REFUSED);
            }
        }
    }

    fn handle_frame(&mut self, stream_id: u64, ftype: u64, payload: Bytes) -> Result<()> {
        let on_push_stream = !is_bidi(stream_id) && !self.is_control_stream(stream_id);
        let frame = match Frame::decode(ftype, &payload, on_push_stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e @ Error::MalformedFrame(_)) => return self.stream_error(stream_id, e),
            Err(e) => return Err(e),
        };
        trace!(stream_id, ?frame, "frame dispatched");
        match frame {
            Frame::Headers { block, .. } => self.handle_headers_frame(stream_id, block),
            Frame::Data { .. } => Ok(()), // body bytes stream separately
            Frame::PushPromise { push_id, block } => {
                self.handle_push_promise(stream_id, push_id, block)
            }
            Frame::CancelPush { push_id } => {
                if !self.is_peer_control_stream(stream_id) {
                    return self.stream_error(stream_id, Error::WrongStream);
                }
                self.handle_cancel_push(push_id);
                Ok(())
            }
            Frame::Settings { settings } => {
                if !self.is_peer_control_stream(stream_id) {
                    return self.stream_error(stream_id, Error::WrongStream);
                }
                trace!(?settings, "peer settings");
                Ok(())
            }
            Frame::Priority { .. } => {
                if !self.is_peer_control_stream(stream_id) {
                    return self.stream_error(stream_id, Error::WrongStream);
                }
                Ok(())
            }
            Frame::Goaway { id } => {
                if !self.is_peer_control_stream(stream_id) {
                    return self.stream_error(stream_id, Error::WrongStream);
                }
                debug!(last_stream = id, "goaway received");
                self.closing = true;
                Ok(())
            }
            Frame::MaxPushId { max } => {
                if !self.is_peer_control_stream(stream_id) {
                    return self.stream_error(stream_id, Error::WrongStream);
                }
                if self.role == Role::Server && max > self.max_push_promise {
                    self.max_push_promise = max;
                } else if max < self.max_push_promise {
                    warn!(max, "ignoring attempt to lower the push limit");
                }
                Ok(())
            }
        }
    }

    fn handle_headers_frame(&mut self, stream_id: u64, block: Bytes) -> Result<()> {
        if self.is_control_stream(stream_id) {
            return self.stream_error(stream_id, Error::WrongStream);
        }
        let transition = {
            let stream = self
                .transfers
                .find_mut(stream_id)
                .ok_or(Error::Internal("headers for unknown stream"))?;
            let first_block = stream.recv_state() == Phase::Open;
            stream
                .recv_headers()
                .map(|()| (first_block, stream.recv_state() == Phase::Trailers, stream.user()))
        };
        let (first_block, is_trailers, user) = match transition {
            Ok(t) => t,
            Err(e) => return self.stream_error(stream_id, e),
        };

        let headers = match self.codec.decode(&block) {
            Ok(headers) => headers,
            Err(_) => {
                let _ = self
                    .engine
                    .shutdown_stream(stream_id, h3::HPACK_DECOMPRESSION_FAILED);
                return self.stream_error(stream_id, Error::HeaderCompression);
            }
        };
        if promises_trailers(&headers) {
            if let Some(stream) = self.transfers.find_mut(stream_id) {
                stream.set_trailers_promised();
            }
        }

        let ends = self
            .transfers
            .find(stream_id)
            .is_some_and(|s| s.recv_exhausted() && !s.has_held());
        if first_block {
            self.callbacks.on_begin_headers(user);
        }
        let count = headers.len();
        for (i, header) in headers.iter().enumerate() {
            let mut flags = HeaderFlags::NONE;
            if is_trailers {
                flags = flags.union(HeaderFlags::TRAILERS);
            }
            if ends && i + 1 == count {
                flags = flags.union(HeaderFlags::END_REQUEST);
            }
            self.callbacks.on_headers(flags, header, user);
        }

        // Body bytes parked while the first HEADERS was still assembling.
        let held = self
            .transfers
            .find_mut(stream_id)
            .map(Stream::take_held)
            .unwrap_or_default();
        for item in held {
            if let Deliverable::Data { offset, data, end } = item {
                self.deliver_data(stream_id, offset, data, end)?;
            }
        }

        if ends {
            self.finish_stream_recv(stream_id);
        }
        Ok(())
    }

    fn deliver_data(&mut self, stream_id: u64, offset: u64, data: Bytes, end: bool) -> Result<()> {
        let verdict = {
            let stream = self
                .transfers
                .find_mut(stream_id)
                .ok_or(Error::Internal("data for unknown stream"))?;
            if stream.recv_state() == Phase::Open {
                stream.hold(offset, data, end);
                return Ok(());
            }
            stream.recv_data().map(|()| stream.user())
        };
        let user = match verdict {
            Ok(user) => user,
            Err(e) => return self.stream_error(stream_id, e),
        };
        let flags = if end {
            DataFlags::END_DATA
        } else {
            DataFlags::NONE
        };
        self.callbacks.on_data_recv(flags, &data, offset, user);
        if end
            && self
                .transfers
                .find(stream_id)
                .is_some_and(Stream::recv_exhausted)
        {
            self.finish_stream_recv(stream_id);
        }
        Ok(())
    }

    fn handle_push_promise(&mut self, stream_id: u64, push_id: u64, block: Bytes) -> Result<()> {
        if self.role != Role::Client || !is_bidi(stream_id) || self.is_control_stream(stream_id) {
            return self.stream_error(stream_id, Error::WrongStream);
        }
        if push_id > self.max_push_promise {
            return self.stream_error(stream_id, Error::PushLimitReached);
        }
        if self.promises.contains(push_id) || self.transfer_for_push(push_id).is_some() {
            return self.stream_error(stream_id, Error::DuplicatePush);
        }

        let headers = match self.codec.decode(&block) {
            Ok(headers) => headers,
            Err(_) => {
                let _ = self
                    .engine
                    .shutdown_stream(stream_id, h3::HPACK_DECOMPRESSION_FAILED);
                return self.stream_error(stream_id, Error::HeaderCompression);
            }
        };

        // A multicast goaway is announced as a promise of "/goaway".
        if self.mode == Mode::Multicast && is_goaway_promise(&headers) {
            debug!("goaway promise received, session closing");
            self.closing = true;
            return Ok(());
        }

        let promise_user = self.alloc_handle();
        let parent_user = self
            .transfers
            .find(stream_id)
            .map(Stream::user)
            .unwrap_or_default();
        self.promises
            .add(push_id, Stream::new_promise(push_id, promise_user));
        self.callbacks.on_begin_promise(parent_user, promise_user);
        for header in &headers {
            self.callbacks
                .on_headers(HeaderFlags::NONE, header, promise_user);
        }
        debug!(push_id, "push promise received");
        Ok(())
    }

    fn handle_cancel_push(&mut self, push_id: u64) {
        match self.promises.remove(push_id) {
            Some(promise) => {
                self.callbacks
                    .on_request_close(Err(Error::NotInterested), promise.user());
                debug!(push_id, "push cancelled by peer");
            }
            None => debug!(push_id, "cancel for unknown push"),
        }
    }

    fn handle_stream_closed(&mut self, stream_id: u64, app_error: u64) {
        let status = status_from_app_error(app_error);
        if let Some(mut stream) = self.transfers.remove(stream_id) {
            stream.close(status);
            if !stream.close_reported() {
                self.callbacks.on_request_close(status, stream.user());
            }
        }
    }

    /// The receive side of a stream is complete.
    fn finish_stream_recv(&mut self, stream_id: u64) {
        if is_bidi(stream_id) {
            return; // close arrives through the engine once both sides end
        }
        let Some(stream) = self.transfers.find_mut(stream_id) else {
            return;
        };
        if !stream.close_reported() {
            stream.mark_close_reported();
            let user = stream.user();
            self.callbacks.on_request_close(Ok(()), user);
        }
        self.transfers.remove(stream_id);
    }

    /// Close one stream on a stream-level error: report, shut the transport
    /// side down, and drop the stream.
    fn stream_error(&mut self, stream_id: u64, err: Error) -> Result<()> {
        warn!(stream_id, %err, "stream error");
        let _ = self
            .engine
            .shutdown_stream(stream_id, app_error_from_status(Err(err)));
        if let Some(stream) = self.transfers.find_mut(stream_id) {
            stream.set_status(Err(err));
            if !stream.close_reported() {
                stream.mark_close_reported();
                let user = stream.user();
                self.callbacks.on_request_close(Err(err), user);
            }
        }
        self.transfers.remove(stream_id);
        Ok(())
    }

    // ---- small helpers ----------------------------------------------------

    fn check_open(&self) -> Result<()> {
        if self.closed || self.closing {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    pub(crate) fn alloc_handle(&mut self) -> u64 {
        let handle = self.next_user_handle;
        self.next_user_handle += 1;
        handle
    }

    fn local_control_stream(&self) -> u64 {
        match self.role {
            Role::Client => CLIENT_CONTROL_STREAM_ID,
            Role::Server => SERVER_CONTROL_STREAM_ID,
        }
    }

    fn is_control_stream(&self, stream_id: u64) -> bool {
        stream_id == CLIENT_CONTROL_STREAM_ID || stream_id == SERVER_CONTROL_STREAM_ID
    }

    fn is_peer_control_stream(&self, stream_id: u64) -> bool {
        match self.role {
            Role::Client => stream_id == SERVER_CONTROL_STREAM_ID,
            Role::Server => stream_id == CLIENT_CONTROL_STREAM_ID,
        }
    }

    fn transfer_for_push(&self, push_id: u64) -> Option<u64> {
        self.transfers
            .keys()
            .find(|id| self.transfer_push_id(*id) == Some(push_id))
    }
}

/// The goaway sentinel a multicast server promises when it closes.
fn is_goaway_promise(headers: &[Header]) -> bool {
    let mut path_goaway = false;
    let mut conn_close = false;
    for h in headers {
        if h.name.as_ref() == b":path" && h.value.as_ref() == b"goaway" {
            path_goaway = true;
        }
        if h.name.eq_ignore_ascii_case(b"connection") && h.value.as_ref() == b"close" {
            conn_close = true;
        }
    }
    path_goaway && conn_close
}
