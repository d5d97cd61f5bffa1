//! HTTP/3 frame codec.
//!
//! Every frame is a varint type tag, a varint payload length, then the
//! payload. [`FrameHeader::parse`] recovers the full span of a frame before
//! its payload has arrived, so the reassembly engine can reserve the exact
//! byte range and fill it out of order. [`Frame`] is the parsed form used for
//! everything except DATA payload bytes, which are streamed to the user
//! without ever being materialised as a `Frame`.

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::error::{Error, Result};
use crate::varint;

/// Frame type identifiers on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x00,
    Headers = 0x01,
    Priority = 0x02,
    CancelPush = 0x03,
    Settings = 0x04,
    PushPromise = 0x05,
    Goaway = 0x07,
    MaxPushId = 0x0d,
}

impl FrameType {
    /// Convert from a raw wire tag. Unknown tags yield `None`; they are
    /// consumed and skipped rather than treated as fatal.
    pub fn from_wire(v: u64) -> Option<Self> {
        match v {
            0x00 => Some(FrameType::Data),
            0x01 => Some(FrameType::Headers),
            0x02 => Some(FrameType::Priority),
            0x03 => Some(FrameType::CancelPush),
            0x04 => Some(FrameType::Settings),
            0x05 => Some(FrameType::PushPromise),
            0x07 => Some(FrameType::Goaway),
            0x0d => Some(FrameType::MaxPushId),
            _ => None,
        }
    }
}

/// The leading type and length varints of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw wire tag (may be a type this crate does not recognise).
    pub ftype: u64,
    /// Payload length in bytes.
    pub payload_len: u64,
    /// Length of the two leading varints.
    pub header_len: usize,
}

impl FrameHeader {
    /// Parse the two leading varints. `None` means more bytes are needed.
    pub fn parse(buf: &[u8]) -> Option<FrameHeader> {
        let (ftype, n) = varint::decode(buf)?;
        let (payload_len, m) = varint::decode(&buf[n..])?;
        Some(FrameHeader {
            ftype,
            payload_len,
            header_len: n + m,
        })
    }

    /// Total frame size: header plus payload.
    pub fn total_len(&self) -> u64 {
        self.header_len as u64 + self.payload_len
    }
}

/// A parsed HTTP/3 frame.
///
/// HEADERS carries an optional push-id: `None` is a request/response header
/// block, `Some` is a push-continuation block whose payload is prefixed with
/// the push-id as a varint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data { payload: Bytes },
    Headers { push_id: Option<u64>, block: Bytes },
    /// Parsed but not acted upon beyond length validation.
    Priority { body: Bytes },
    CancelPush { push_id: u64 },
    Settings { settings: Vec<(u64, u64)> },
    PushPromise { push_id: u64, block: Bytes },
    Goaway { id: u64 },
    MaxPushId { max: u64 },
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Data { .. } => FrameType::Data,
            Frame::Headers { .. } => FrameType::Headers,
            Frame::Priority { .. } => FrameType::Priority,
            Frame::CancelPush { .. } => FrameType::CancelPush,
            Frame::Settings { .. } => FrameType::Settings,
            Frame::PushPromise { .. } => FrameType::PushPromise,
            Frame::Goaway { .. } => FrameType::Goaway,
            Frame::MaxPushId { .. } => FrameType::MaxPushId,
        }
    }

    fn payload_len(&self) -> u64 {
        match self {
            Frame::Data { payload } => payload.len() as u64,
            Frame::Headers { push_id, block } => {
                block.len() as u64 + push_id.map_or(0, |id| varint::len(id) as u64)
            }
            Frame::Priority { body } => body.len() as u64,
            Frame::CancelPush { push_id } => varint::len(*push_id) as u64,
            Frame::Settings { settings } => settings
                .iter()
                .map(|(id, v)| (varint::len(*id) + varint::len(*v)) as u64)
                .sum(),
            Frame::PushPromise { push_id, block } => {
                varint::len(*push_id) as u64 + block.len() as u64
            }
            Frame::Goaway { id } => varint::len(*id) as u64,
            Frame::MaxPushId { max } => varint::len(*max) as u64,
        }
    }

    /// Encode this frame into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode into a pre-allocated `BytesMut`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        varint::encode(self.frame_type() as u64, buf);
        varint::encode(self.payload_len(), buf);
        match self {
            Frame::Data { payload } => buf.extend_from_slice(payload),
            Frame::Headers { push_id, block } => {
                if let Some(id) = push_id {
                    varint::encode(*id, buf);
                }
                buf.extend_from_slice(block);
            }
            Frame::Priority { body } => buf.extend_from_slice(body),
            Frame::CancelPush { push_id } => {
                varint::encode(*push_id, buf);
            }
            Frame::Settings { settings } => {
                for (id, v) in settings {
                    varint::encode(*id, buf);
                    varint::encode(*v, buf);
                }
            }
            Frame::PushPromise { push_id, block } => {
                varint::encode(*push_id, buf);
                buf.extend_from_slice(block);
            }
            Frame::Goaway { id } => {
                varint::encode(*id, buf);
            }
            Frame::MaxPushId { max } => {
                varint::encode(*max, buf);
            }
        }
    }

    /// Decode a frame from its raw wire tag and complete payload.
    ///
    /// `on_push_stream` selects the HEADERS layout: on a push stream the
    /// block is prefixed with the push-id varint. Unknown types are logged
    /// and yield `Ok(None)`; they never abort the stream.
    pub fn decode(ftype: u64, payload: &[u8], on_push_stream: bool) -> Result<Option<Frame>> {
        let Some(known) = FrameType::from_wire(ftype) else {
            debug!(ftype, len = payload.len(), "skipping unknown frame type");
            return Ok(None);
        };
        let malformed = || Error::MalformedFrame(ftype);
        let frame = match known {
            FrameType::Data => Frame::Data {
                payload: Bytes::copy_from_slice(payload),
            },
            FrameType::Headers => {
                if on_push_stream {
                    let (push_id, n) = varint::decode(payload).ok_or_else(malformed)?;
                    Frame::Headers {
                        push_id: Some(push_id),
                        block: Bytes::copy_from_slice(&payload[n..]),
                    }
                } else {
                    Frame::Headers {
                        push_id: None,
                        block: Bytes::copy_from_slice(payload),
                    }
                }
            }
            FrameType::Priority => {
                if payload.is_empty() {
                    return Err(malformed());
                }
                Frame::Priority {
                    body: Bytes::copy_from_slice(payload),
                }
            }
            FrameType::CancelPush => Frame::CancelPush {
                push_id: Self::single_varint(payload).ok_or_else(malformed)?,
            },
            FrameType::Settings => {
                let mut settings = Vec::new();
                let mut rest = payload;
                while !rest.is_empty() {
                    let (id, n) = varint::decode(rest).ok_or_else(malformed)?;
                    let (v, m) = varint::decode(&rest[n..]).ok_or_else(malformed)?;
                    settings.push((id, v));
                    rest = &rest[n + m..];
                }
                Frame::Settings { settings }
            }
            FrameType::PushPromise => {
                let (push_id, n) = varint::decode(payload).ok_or_else(malformed)?;
                Frame::PushPromise {
                    push_id,
                    block: Bytes::copy_from_slice(&payload[n..]),
                }
            }
            FrameType::Goaway => Frame::Goaway {
                id: Self::single_varint(payload).ok_or_else(malformed)?,
            },
            FrameType::MaxPushId => Frame::MaxPushId {
                max: Self::single_varint(payload).ok_or_else(malformed)?,
            },
        };
        Ok(Some(frame))
    }

    /// A payload that must be exactly one varint.
    fn single_varint(payload: &[u8]) -> Option<u64> {
        let (v, n) = varint::decode(payload)?;
        (n == payload.len()).then_some(v)
    }
}
