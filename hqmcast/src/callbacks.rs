//! The host callback surface.
//!
//! All callbacks are synchronous and invoked inline from the session entry
//! points. The timer trio is optional: a host whose `set_timer` returns
//! `None` runs the session purely reactively under its own clock and
//! timer-driven recovery is disabled.

use crate::error::CloseStatus;
use crate::hdr::Header;

/// Result of a socket callback: the C ssize convention (`0` would-block,
/// `-1` eof) rendered as an enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoVerdict {
    /// `n` bytes were transferred.
    Ready(usize),
    WouldBlock,
    Eof,
}

/// Flags delivered with each header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFlags(pub u8);

impl HeaderFlags {
    pub const NONE: Self = Self(0x00);
    /// This field ends the request; no body or trailers follow.
    pub const END_REQUEST: Self = Self(0x01);
    /// This field belongs to a trailer block.
    pub const TRAILERS: Self = Self(0x02);

    pub fn contains(self, flag: HeaderFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }

    pub fn union(self, flag: HeaderFlags) -> Self {
        Self(self.0 | flag.0)
    }
}

/// Flags delivered with each body chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataFlags(pub u8);

impl DataFlags {
    pub const NONE: Self = Self(0x00);
    /// This chunk carries the final body byte of the stream.
    pub const END_DATA: Self = Self(0x01);

    pub fn contains(self, flag: DataFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }
}

/// Which session timer a host timer is driving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    LossDetection,
    AckDelay,
}

/// Opaque host timer handle.
pub type TimerId = u64;

/// Everything the session asks of its host.
///
/// The boxed implementation a session is built with is also the place to
/// keep per-session user context; stream-level context travels as the
/// `stream_user` handle on every stream-scoped callback.
pub trait SessionCallbacks {
    /// Read bearer bytes into `buf`.
    fn recv(&mut self, buf: &mut [u8]) -> IoVerdict;

    /// Write one packet to the bearer.
    fn send(&mut self, buf: &[u8]) -> IoVerdict;

    /// A header block is about to be delivered for the stream.
    fn on_begin_headers(&mut self, stream_user: u64);

    /// One header field of the current block.
    fn on_headers(&mut self, flags: HeaderFlags, header: &Header, stream_user: u64);

    /// A run of body bytes at `offset` in application (body) offset space.
    fn on_data_recv(&mut self, flags: DataFlags, data: &[u8], offset: u64, stream_user: u64);

    /// The server announced a push; `promise_user` is the handle all later
    /// callbacks for the pushed response will carry.
    fn on_begin_promise(&mut self, parent_stream_user: u64, promise_user: u64);

    /// A stream finished, cleanly or with the mapped error status.
    fn on_request_close(&mut self, status: CloseStatus, stream_user: u64);

    /// Arm a host timer firing after `seconds`; the host must then call
    /// `Session::handle_timer(kind, now)`. `None` disables timer recovery.
    fn set_timer(&mut self, _seconds: f64, _kind: TimerKind) -> Option<TimerId> {
        None
    }

    fn reset_timer(&mut self, _id: TimerId, _seconds: f64) {}

    fn cancel_timer(&mut self, _id: TimerId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_flag_ops() {
        let flags = HeaderFlags::END_REQUEST.union(HeaderFlags::TRAILERS);
        assert!(flags.contains(HeaderFlags::END_REQUEST));
        assert!(flags.contains(HeaderFlags::TRAILERS));
        assert!(!HeaderFlags::NONE.contains(HeaderFlags::END_REQUEST));
    }

    #[test]
    fn data_flag_ops() {
        assert!(DataFlags::END_DATA.contains(DataFlags::END_DATA));
        assert!(!DataFlags::NONE.contains(DataFlags::END_DATA));
    }
}
