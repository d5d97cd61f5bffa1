//! The send scheduler.
//!
//! Invoked from `Session::send`. Streams are visited in ascending id order
//! and each packet carries bytes from exactly one stream; a saturated low
//! stream can therefore starve higher ones, a known limitation of the
//! lowest-id-first order.

use tracing::{debug, trace};

use crate::callbacks::IoVerdict;
use crate::config::{Mode, Role, MAX_BYTES_IN_FLIGHT, MIN_STREAM_PACKET_OVERHEAD};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::transport::TransportError;

/// Outcome of one write attempt against a single stream.
enum StreamSendOutcome {
    /// Bytes were accepted and a packet emitted.
    Sent(usize),
    /// The engine refused this stream for now; try another one.
    Absorbed,
    /// The engine wrote nothing at all.
    EngineIdle,
}

impl Session {
    /// Pack queued frames into packets until nothing is pending, the
    /// bytes-in-flight gate trips, or an error surfaces.
    pub(crate) fn scheduler_run(&mut self) -> Result<usize> {
        let mut packets = 0;

        self.flush_pending_packets()?;

        let mut prev = None;
        while let Some(id) = self.transfers.next_after(prev) {
            prev = Some(id);
            // The gate is unconditional; progress made earlier in this round
            // does not bypass it.
            if self.engine.bytes_in_flight() >= MAX_BYTES_IN_FLIGHT {
                return Err(Error::SessionBlocked);
            }
            loop {
                let pending = self
                    .transfers
                    .find(id)
                    .map_or(0, |s| s.pending_send_bytes());
                if pending == 0 {
                    break;
                }
                if self.engine.bytes_in_flight() >= MAX_BYTES_IN_FLIGHT {
                    return Err(Error::SessionBlocked);
                }
                match self.send_stream_bytes(id)? {
                    StreamSendOutcome::Sent(n) => {
                        trace!(stream_id = id, bytes = n, "stream bytes packed");
                        packets += 1;
                    }
                    StreamSendOutcome::Absorbed => break,
                    StreamSendOutcome::EngineIdle => return Err(Error::SessionBlocked),
                }
            }
        }
        Ok(packets)
    }

    /// Coalesce head buffers of one stream into a single packet write.
    fn send_stream_bytes(&mut self, id: u64) -> Result<StreamSendOutcome> {
        let budget = self
            .engine
            .max_packet_size()
            .saturating_sub(MIN_STREAM_PACKET_OVERHEAD);

        let (src, fin) = {
            let stream = self
                .transfers
                .find(id)
                .ok_or(Error::Internal("scheduler lost a stream"))?;
            let mut src = Vec::with_capacity(budget);
            let mut fin = false;
            for seg in stream.send_queue.iter() {
                if src.len() >= budget {
                    break;
                }
                let take = (budget - src.len()).min(seg.remaining());
                src.extend_from_slice(&seg.bytes()[..take]);
                fin = take == seg.remaining() && seg.complete();
                if take < seg.remaining() {
                    break;
                }
            }
            (src, fin)
        };

        let mut pkt = Vec::new();
        let write = match self.engine.write_stream(id, &src, fin, &mut pkt) {
            Ok(w) => w,
            Err(
                TransportError::StreamDataBlocked
                | TransportError::StreamShutWr
                | TransportError::StreamNotFound,
            ) => {
                // No progress on this stream this round; not an error.
                return Ok(StreamSendOutcome::Absorbed);
            }
            Err(e) => return Err(e.into()),
        };
        if write.accepted == 0 {
            return Ok(StreamSendOutcome::EngineIdle);
        }

        let finished = {
            let stream = self
                .transfers
                .find_mut(id)
                .ok_or(Error::Internal("scheduler lost a stream"))?;
            let mut left = write.accepted;
            let mut finished = false;
            while left > 0 {
                let seg = stream
                    .send_queue
                    .front_mut()
                    .ok_or(Error::Internal("send queue shrank mid-write"))?;
                let take = left.min(seg.remaining());
                seg.advance(take);
                left -= take;
                if seg.remaining() == 0 {
                    if let Some(done) = stream.send_queue.pop() {
                        finished = done.complete();
                    }
                }
            }
            finished
        };

        self.emit_packet(pkt)?;

        if finished {
            self.finish_stream_send(id);
        }
        Ok(StreamSendOutcome::Sent(write.accepted))
    }

    /// The final buffer of a stream has gone out.
    fn finish_stream_send(&mut self, id: u64) {
        let Some(stream) = self.transfers.find_mut(id) else {
            return;
        };
        stream.close_send();
        debug!(stream_id = id, "final stream bytes sent");
        if !stream.close_reported() {
            stream.mark_close_reported();
            let status = stream.status();
            let user = stream.user();
            self.callbacks.on_request_close(status, user);
        }
        if self
            .transfers
            .find(id)
            .is_some_and(|s| s.is_done() || !crate::map::is_bidi(id))
        {
            self.transfers.remove(id);
        }
    }

    /// Flush any pre-built packets waiting in the session's outgoing queue.
    pub(crate) fn flush_pending_packets(&mut self) -> Result<()> {
        while let Some(seg) = self.send_queue.front() {
            match self.callbacks.send(seg.bytes()) {
                IoVerdict::Ready(_) => {
                    self.send_queue.pop();
                }
                IoVerdict::WouldBlock => return Err(Error::SessionBlocked),
                IoVerdict::Eof => {
                    self.closed = true;
                    return Err(Error::SessionClosed);
                }
            }
        }
        Ok(())
    }

    /// Hand one packet to the bearer. On a multicast server every outbound
    /// packet is also reflected as a synthetic ACK onto the receive queue.
    pub(crate) fn emit_packet(&mut self, pkt: Vec<u8>) -> Result<()> {
        if self.mode == Mode::Multicast && self.role == Role::Server && self.handshake_complete {
            self.reflect_ack(&pkt);
        }
        match self.callbacks.send(&pkt) {
            IoVerdict::Ready(_) => Ok(()),
            IoVerdict::WouldBlock => {
                self.send_queue
                    .push(crate::buffer::Segment::new(&pkt, 0, false));
                Ok(())
            }
            IoVerdict::Eof => {
                self.closed = true;
                Err(Error::SessionClosed)
            }
        }
    }
}
