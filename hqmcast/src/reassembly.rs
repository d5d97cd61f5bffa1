//! Receive-side reassembly.
//!
//! Stream bytes arrive at arbitrary offsets with arbitrary overlap. The
//! engine inserts them into the stream's ordered segment store, parses frame
//! headers as soon as the byte at the next expected offset is readable,
//! reserves an active frame covering the exact span, and punches received
//! ranges out of each frame's gap list until the frame is ready.
//!
//! DATA payload bytes are never buffered into a frame: the contiguous prefix
//! of the earliest DATA frame streams out as it fills, rebased into body
//! offsets. Non-DATA frames assemble into an owned buffer and dispatch in
//! stream order with respect to each other; a completed frame behind an
//! incomplete non-DATA frame waits its turn. DATA is never blocked by an
//! incomplete non-DATA frame.

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::buffer::RecvStore;
use crate::error::Result;
use crate::frame::{FrameHeader, FrameType};
use crate::stream::{ActiveFrame, GapList, Preamble, Stream};
use crate::varint;

/// One thing the engine produced for the session to act on.
#[derive(Debug, PartialEq, Eq)]
pub enum Deliverable {
    /// A stream preamble was consumed; `push_id` names the promise a push
    /// stream materialises.
    Preamble { push_id: Option<u64> },
    /// A completed non-DATA frame: raw type and assembled payload.
    Frame { ftype: u64, payload: Bytes },
    /// A run of body bytes at `offset` in body-offset space.
    Data { offset: u64, data: Bytes, end: bool },
}

impl Stream {
    /// Insert received stream bytes and drain everything that became ready.
    ///
    /// Tolerates duplication, overlap and reordering; deliverable DATA runs
    /// come out in ascending body offset and never overlap.
    pub fn recv_stream_data(
        &mut self,
        data: &[u8],
        offset: u64,
        eos: bool,
    ) -> Result<Vec<Deliverable>> {
        self.recv_store.insert(data, offset, eos);

        let mut out = Vec::new();
        self.consume_preamble(&mut out);
        loop {
            let mut progress = self.extract_frames();
            progress |= self.fill_frames(&mut out);
            progress |= self.dispatch_ready(&mut out);
            if !progress {
                break;
            }
        }
        self.compact();
        Ok(out)
    }

    /// Consume the leading varints some streams carry before their first
    /// frame. Waits silently until the whole preamble is readable.
    fn consume_preamble(&mut self, out: &mut Vec<Deliverable>) {
        if self.preamble == Preamble::None {
            return;
        }
        let Some(avail) = self.recv_store.read_at(self.next_recv_offset) else {
            return;
        };
        match self.preamble {
            Preamble::PushId => {
                let Some((push_id, n)) = varint::decode(avail) else {
                    return;
                };
                trace!(push_id, "push stream preamble");
                self.next_recv_offset += n as u64;
                self.preamble = Preamble::None;
                out.push(Deliverable::Preamble {
                    push_id: Some(push_id),
                });
            }
            Preamble::TypeAndPushId => {
                let Some((ftype, n)) = varint::decode(avail) else {
                    return;
                };
                let Some((push_id, m)) = varint::decode(&avail[n..]) else {
                    return;
                };
                trace!(ftype, push_id, "push promise stream preamble");
                self.next_recv_offset += (n + m) as u64;
                self.preamble = Preamble::None;
                out.push(Deliverable::Preamble { push_id: None });
            }
            Preamble::None => {}
        }
    }

    /// Parse frame headers at the next expected offset and reserve active
    /// frames for their spans.
    fn extract_frames(&mut self) -> bool {
        let mut progress = false;
        while self.preamble == Preamble::None {
            let Some(avail) = self.recv_store.read_at(self.next_recv_offset) else {
                break;
            };
            let Some(hdr) = FrameHeader::parse(avail) else {
                break; // need more bytes
            };
            let offset = self.next_recv_offset;
            let size = hdr.total_len();
            let end_header_offset = offset + hdr.header_len as u64;
            let is_data = hdr.ftype == FrameType::Data as u64;

            let mut frame = ActiveFrame {
                ftype: hdr.ftype,
                offset,
                size,
                end_header_offset,
                data_offset_adjust: 0,
                buf: (!is_data).then(|| BytesMut::zeroed(size as usize)),
                gaps: GapList::new(size),
            };
            if is_data {
                // Rebase DATA payload offsets into body-offset space.
                frame.data_offset_adjust = end_header_offset - self.data_frames_total;
                self.data_frames_total += hdr.payload_len;
            }
            trace!(
                ftype = hdr.ftype,
                offset,
                size,
                "reserved active frame"
            );
            self.active.push(frame);
            self.next_recv_offset += size;
            progress = true;
        }
        progress
    }

    /// Copy available bytes into active frames and punch their gap lists.
    fn fill_frames(&mut self, out: &mut Vec<Deliverable>) -> bool {
        let mut progress = false;
        let final_offset = self.recv_store.final_offset();

        let mut i = 0;
        let mut earliest_data_seen = false;
        while i < self.active.len() {
            if self.active[i].is_data() {
                if !earliest_data_seen {
                    progress |= fill_data(&mut self.active[i], &self.recv_store, final_offset, out);
                    if self.active[i].gaps.is_empty() {
                        // Fully streamed to the user; nothing to dispatch.
                        self.active.remove(i);
                        continue;
                    }
                    earliest_data_seen = true;
                }
            } else {
                progress |= fill_copy(&mut self.active[i], &self.recv_store);
            }
            i += 1;
        }
        progress
    }

    /// Deliver completed non-DATA frames in stream order.
    fn dispatch_ready(&mut self, out: &mut Vec<Deliverable>) -> bool {
        let mut progress = false;
        let mut i = 0;
        while i < self.active.len() {
            if self.active[i].is_data() {
                i += 1;
                continue;
            }
            if !self.active[i].gaps.is_empty() {
                // Later non-DATA frames serialise behind this one.
                break;
            }
            let frame = self.active.remove(i);
            let header_len = (frame.end_header_offset - frame.offset) as usize;
            if let Some(buf) = frame.buf {
                out.push(Deliverable::Frame {
                    ftype: frame.ftype,
                    payload: buf.freeze().slice(header_len..),
                });
            }
            progress = true;
        }
        progress
    }

    /// Drop store segments every consumer is finished with.
    fn compact(&mut self) {
        let mut watermark = self.next_recv_offset;
        for f in &self.active {
            if let Some(begin) = f.gaps.first_begin() {
                watermark = watermark.min(f.offset + begin);
            }
        }
        self.recv_store.trim_below(watermark);
    }

    /// Body bytes parked while the stream's first HEADERS was incomplete.
    pub fn take_held(&mut self) -> Vec<Deliverable> {
        self.held
            .drain(..)
            .map(|h| Deliverable::Data {
                offset: h.offset,
                data: h.data,
                end: h.end,
            })
            .collect()
    }

    pub fn hold(&mut self, offset: u64, data: Bytes, end: bool) {
        self.held.push(crate::stream::HeldData { offset, data, end });
    }
}

/// Copy every available range into the frame's buffer.
fn fill_copy(frame: &mut ActiveFrame, store: &RecvStore) -> bool {
    let mut progress = false;
    let snapshot: Vec<_> = frame.gaps.gaps().to_vec();
    for g in snapshot {
        let abs_begin = frame.offset + g.begin;
        let abs_end = frame.offset + g.end;
        for seg in store.segments() {
            let s = seg.offset().max(abs_begin);
            let e = seg.end_offset().min(abs_end);
            if s >= e {
                continue;
            }
            let bytes = &seg.all_bytes()[(s - seg.offset()) as usize..(e - seg.offset()) as usize];
            if let Some(buf) = frame.buf.as_mut() {
                buf[(s - frame.offset) as usize..(e - frame.offset) as usize]
                    .copy_from_slice(bytes);
            }
            frame.gaps.punch(s - frame.offset, e - frame.offset);
            progress = true;
        }
    }
    progress
}

/// Stream the contiguous prefix of a DATA frame straight to the user.
fn fill_data(
    frame: &mut ActiveFrame,
    store: &RecvStore,
    final_offset: Option<u64>,
    out: &mut Vec<Deliverable>,
) -> bool {
    let mut progress = false;
    loop {
        let Some(begin) = frame.gaps.first_begin() else {
            break;
        };
        let gap_end = frame.gaps.gaps()[0].end;
        let abs = frame.offset + begin;
        let Some(avail) = store.read_at(abs) else {
            break;
        };
        let take = (avail.len() as u64).min(gap_end - begin);
        let chunk_end = abs + take;

        // Bytes before the payload are frame header, consumed silently.
        let payload_start = frame.end_header_offset;
        if chunk_end > payload_start {
            let ds = abs.max(payload_start);
            let slice = &avail[(ds - abs) as usize..take as usize];
            let end = chunk_end == frame.end() && final_offset == Some(chunk_end);
            out.push(Deliverable::Data {
                offset: ds - frame.data_offset_adjust,
                data: Bytes::copy_from_slice(slice),
                end,
            });
        }
        frame.gaps.punch(begin, begin + take);
        progress = true;
    }
    progress
}
