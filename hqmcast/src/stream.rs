//! Per-stream state.
//!
//! A stream runs two independent copies of the same lattice, one for each
//! direction:
//!
//! ```text
//! Open -> Headers -> Body -> (Trailers) -> Done
//! ```
//!
//! The receive side additionally owns the ordered segment store, the list of
//! active (partially filled) frames, and the running offsets the reassembly
//! engine advances through.

use bytes::{Bytes, BytesMut};

use crate::buffer::{RecvStore, Segment, SegmentChain};
use crate::error::{CloseStatus, Error, Result};

/// Position in the request lattice. The ordering is the lattice order; a
/// stream never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Open,
    Headers,
    Body,
    Trailers,
    Done,
}

impl Phase {
    /// Where a header block moves this phase, honouring the trailer promise.
    pub fn on_headers(self, trailers_promised: bool) -> Result<Phase> {
        match self {
            Phase::Open | Phase::Headers => Ok(Phase::Headers),
            Phase::Body if trailers_promised => Ok(Phase::Trailers),
            Phase::Body => Err(Error::TrailersNotPromised),
            Phase::Trailers | Phase::Done => Err(Error::RequestClosed),
        }
    }

    /// Where body bytes move this phase.
    pub fn on_data(self) -> Result<Phase> {
        match self {
            Phase::Headers | Phase::Body => Ok(Phase::Body),
            Phase::Open | Phase::Trailers | Phase::Done => Err(Error::RequestClosed),
        }
    }
}

/// A half-open byte range `[begin, end)` not yet received within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub begin: u64,
    pub end: u64,
}

/// Disjoint gaps ordered by `begin`. A new frame starts with the single gap
/// covering its whole span; an empty list means the frame is ready.
#[derive(Debug, Clone, Default)]
pub struct GapList {
    gaps: Vec<Gap>,
}

impl GapList {
    pub fn new(size: u64) -> Self {
        let gaps = if size == 0 {
            Vec::new()
        } else {
            vec![Gap {
                begin: 0,
                end: size,
            }]
        };
        Self { gaps }
    }

    pub fn is_empty(&self) -> bool {
        self.gaps.is_empty()
    }

    pub fn gaps(&self) -> &[Gap] {
        &self.gaps
    }

    /// Lowest unfilled position.
    pub fn first_begin(&self) -> Option<u64> {
        self.gaps.first().map(|g| g.begin)
    }

    /// Remove `[begin, end)` from the list. A punch may split a gap in two,
    /// truncate either end of one, or delete gaps outright.
    pub fn punch(&mut self, begin: u64, end: u64) {
        if begin >= end {
            return;
        }
        let mut out = Vec::with_capacity(self.gaps.len() + 1);
        for g in self.gaps.drain(..) {
            if g.end <= begin || g.begin >= end {
                out.push(g);
                continue;
            }
            if g.begin < begin {
                out.push(Gap {
                    begin: g.begin,
                    end: begin,
                });
            }
            if g.end > end {
                out.push(Gap {
                    begin: end,
                    end: g.end,
                });
            }
        }
        self.gaps = out;
    }
}

/// A receive-side frame whose span is known but whose payload is still
/// arriving.
#[derive(Debug)]
pub struct ActiveFrame {
    /// Raw wire type.
    pub ftype: u64,
    /// Stream offset of the first header byte.
    pub offset: u64,
    /// Header plus payload length.
    pub size: u64,
    /// Stream offset of the first payload byte.
    pub end_header_offset: u64,
    /// Subtracted from stream offsets to rebase DATA payload bytes into the
    /// application's body-offset space.
    pub data_offset_adjust: u64,
    /// Assembly buffer; DATA frames stream to the user instead of owning one.
    pub buf: Option<BytesMut>,
    pub gaps: GapList,
}

impl ActiveFrame {
    pub fn is_data(&self) -> bool {
        self.ftype == 0x00
    }

    /// Stream offset one past the frame.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Body bytes parked because the stream's first HEADERS has not finished.
#[derive(Debug)]
pub struct HeldData {
    pub offset: u64,
    pub data: Bytes,
    pub end: bool,
}

/// Leading varints some streams carry before their first frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preamble {
    /// Nothing to consume.
    None,
    /// A lone push-id naming the promise this push stream materialises.
    PushId,
    /// Frame-type and push-id pair on the dedicated push-promise stream.
    TypeAndPushId,
}

/// One request, pushed response, or control stream.
#[derive(Debug)]
pub struct Stream {
    id: Option<u64>,
    push_id: Option<u64>,
    user: u64,
    send_state: Phase,
    recv_state: Phase,
    started: bool,
    trailers_promised: bool,
    pub(crate) recv_store: RecvStore,
    pub(crate) send_queue: SegmentChain,
    pub(crate) active: Vec<ActiveFrame>,
    pub(crate) next_recv_offset: u64,
    pub(crate) data_frames_total: u64,
    pub(crate) held: Vec<HeldData>,
    pub(crate) preamble: Preamble,
    next_send_offset: u64,
    status: CloseStatus,
    close_reported: bool,
}

impl Stream {
    pub fn new(id: u64, user: u64) -> Self {
        Self {
            id: Some(id),
            push_id: None,
            user,
            send_state: Phase::Open,
            recv_state: Phase::Open,
            started: false,
            trailers_promised: false,
            recv_store: RecvStore::new(),
            send_queue: SegmentChain::new(),
            active: Vec::new(),
            next_recv_offset: 0,
            data_frames_total: 0,
            held: Vec::new(),
            preamble: Preamble::None,
            next_send_offset: 0,
            status: Ok(()),
            close_reported: false,
        }
    }

    /// A promise: no stream id until it is materialised.
    pub fn new_promise(push_id: u64, user: u64) -> Self {
        let mut s = Self::new(0, user);
        s.id = None;
        s.push_id = Some(push_id);
        s
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn push_id(&self) -> Option<u64> {
        self.push_id
    }

    pub fn user(&self) -> u64 {
        self.user
    }

    pub fn set_user(&mut self, user: u64) {
        self.user = user;
    }

    pub fn send_state(&self) -> Phase {
        self.send_state
    }

    pub fn recv_state(&self) -> Phase {
        self.recv_state
    }

    pub fn status(&self) -> CloseStatus {
        self.status
    }

    pub fn set_status(&mut self, status: CloseStatus) {
        self.status = status;
    }

    /// Whether `on_request_close` has already fired for this stream.
    pub fn close_reported(&self) -> bool {
        self.close_reported
    }

    pub fn mark_close_reported(&mut self) {
        self.close_reported = true;
    }

    pub fn trailers_promised(&self) -> bool {
        self.trailers_promised
    }

    pub fn set_trailers_promised(&mut self) {
        self.trailers_promised = true;
    }

    pub fn set_preamble(&mut self, preamble: Preamble) {
        self.preamble = preamble;
    }

    /// Bind the promise to its materialised unidirectional stream id.
    pub fn materialise(&mut self, stream_id: u64) {
        self.id = Some(stream_id);
    }

    /// Associate a receive-side push stream with the promise it carries.
    pub fn bind_push(&mut self, push_id: u64) {
        self.push_id = Some(push_id);
    }

    /// True once every received byte up to the stream's final offset has been
    /// framed and no frame is still assembling.
    pub fn recv_exhausted(&self) -> bool {
        self.active.is_empty() && self.recv_store.final_offset() == Some(self.next_recv_offset)
    }

    /// Body bytes are parked waiting for the first HEADERS to finish.
    pub fn has_held(&self) -> bool {
        !self.held.is_empty()
    }

    /// Whether any bytes have been queued for sending.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Advance the send side for a header block.
    pub fn send_headers(&mut self) -> Result<()> {
        self.send_state = self.send_state.on_headers(self.trailers_promised)?;
        Ok(())
    }

    /// Advance the send side for body bytes.
    pub fn send_data(&mut self) -> Result<()> {
        self.send_state = self.send_state.on_data()?;
        Ok(())
    }

    /// Advance the receive side for a header block.
    pub fn recv_headers(&mut self) -> Result<()> {
        self.recv_state = self.recv_state.on_headers(true)?;
        Ok(())
    }

    /// Advance the receive side for body bytes.
    pub fn recv_data(&mut self) -> Result<()> {
        self.recv_state = self.recv_state.on_data()?;
        Ok(())
    }

    /// Terminal transition for one or both directions.
    pub fn close(&mut self, status: CloseStatus) {
        self.send_state = Phase::Done;
        self.recv_state = Phase::Done;
        self.status = status;
    }

    pub fn close_send(&mut self) {
        self.send_state = Phase::Done;
    }

    pub fn is_done(&self) -> bool {
        self.send_state == Phase::Done && self.recv_state == Phase::Done
    }

    /// Append encoded frame bytes to the send queue. `fin` marks the final
    /// bytes of the stream.
    pub fn queue_frame_bytes(&mut self, bytes: Bytes, fin: bool) {
        let seg = Segment::from_bytes(bytes, self.next_send_offset, fin);
        self.next_send_offset += seg.len() as u64;
        self.started = true;
        self.send_queue.push(seg);
    }

    pub fn pending_send_bytes(&self) -> usize {
        self.send_queue.total_remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice_happy_path() {
        let mut s = Stream::new(4, 1);
        s.send_headers().unwrap();
        assert_eq!(s.send_state(), Phase::Headers);
        s.send_data().unwrap();
        assert_eq!(s.send_state(), Phase::Body);
        s.close(Ok(()));
        assert_eq!(s.send_state(), Phase::Done);
    }

    #[test]
    fn trailers_require_promise() {
        let mut s = Stream::new(4, 1);
        s.send_headers().unwrap();
        s.send_data().unwrap();
        assert_eq!(s.send_headers(), Err(Error::TrailersNotPromised));

        let mut t = Stream::new(8, 2);
        t.set_trailers_promised();
        t.send_headers().unwrap();
        t.send_data().unwrap();
        t.send_headers().unwrap();
        assert_eq!(t.send_state(), Phase::Trailers);
    }

    #[test]
    fn no_transition_fails_request_closed() {
        let mut s = Stream::new(4, 1);
        assert_eq!(s.send_data(), Err(Error::RequestClosed));
        s.close(Ok(()));
        assert_eq!(s.send_headers(), Err(Error::RequestClosed));
    }

    #[test]
    fn phases_never_move_backwards() {
        let mut s = Stream::new(4, 1);
        let mut last = s.send_state();
        s.send_headers().unwrap();
        assert!(s.send_state() >= last);
        last = s.send_state();
        s.send_data().unwrap();
        assert!(s.send_state() >= last);
        last = s.send_state();
        s.close(Ok(()));
        assert!(s.send_state() >= last);
    }

    #[test]
    fn gap_punch_splits() {
        let mut gaps = GapList::new(100);
        gaps.punch(40, 60);
        assert_eq!(
            gaps.gaps(),
            &[Gap { begin: 0, end: 40 }, Gap { begin: 60, end: 100 }]
        );
    }

    #[test]
    fn gap_punch_truncates_and_deletes() {
        let mut gaps = GapList::new(100);
        gaps.punch(0, 30);
        assert_eq!(gaps.gaps(), &[Gap { begin: 30, end: 100 }]);
        gaps.punch(90, 100);
        assert_eq!(gaps.gaps(), &[Gap { begin: 30, end: 90 }]);
        gaps.punch(30, 90);
        assert!(gaps.is_empty());
    }

    #[test]
    fn gap_cover_in_any_order_empties() {
        let mut gaps = GapList::new(300);
        gaps.punch(200, 300);
        gaps.punch(0, 100);
        gaps.punch(100, 200);
        assert!(gaps.is_empty());
    }

    #[test]
    fn zero_length_frame_has_no_gaps() {
        assert!(GapList::new(0).is_empty());
    }

    #[test]
    fn promise_materialisation_assigns_id() {
        let mut p = Stream::new_promise(2, 9);
        assert_eq!(p.id(), None);
        assert_eq!(p.push_id(), Some(2));
        p.materialise(7);
        assert_eq!(p.id(), Some(7));
    }

    #[test]
    fn send_queue_offsets_accumulate() {
        let mut s = Stream::new(4, 1);
        assert!(!s.started());
        s.queue_frame_bytes(Bytes::from_static(b"abc"), false);
        assert!(s.started());
        s.queue_frame_bytes(Bytes::from_static(b"defg"), true);
        assert_eq!(s.pending_send_bytes(), 7);
        let segs: Vec<_> = s.send_queue.iter().collect();
        assert_eq!(segs[0].offset(), 0);
        assert_eq!(segs[1].offset(), 3);
        assert!(segs[1].complete());
    }
}
