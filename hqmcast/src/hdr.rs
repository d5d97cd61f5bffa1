//! Header-compression adapter.
//!
//! The actual HPACK-style codec is an external collaborator reached through
//! [`HeaderCodec`]. The session holds one boxed codec for its whole lifetime,
//! shared by the encode and decode directions; the codec is not assumed
//! thread-safe and callers hold the session.
//!
//! [`LiteralCodec`] is the built-in fallback: length-prefixed literal
//! name/value pairs with no compression state, enough to run a session
//! without an external codec.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::varint;

/// One header field as exchanged with the codec and the user callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: Bytes,
    pub value: Bytes,
}

impl Header {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The codec seam. Encoding failures surface as header-compression errors;
/// decoding failures additionally close the stream with the decompression
/// application error code.
pub trait HeaderCodec {
    fn encode(&mut self, headers: &[Header]) -> Result<Bytes>;
    fn decode(&mut self, block: &[u8]) -> Result<Vec<Header>>;
}

/// Literal (uncompressed) header block codec.
///
/// Layout: for each field, a varint name length, the name bytes, a varint
/// value length, the value bytes.
#[derive(Debug, Default)]
pub struct LiteralCodec;

impl LiteralCodec {
    pub fn new() -> Self {
        Self
    }
}

impl HeaderCodec for LiteralCodec {
    fn encode(&mut self, headers: &[Header]) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        for h in headers {
            varint::encode(h.name.len() as u64, &mut buf);
            buf.extend_from_slice(&h.name);
            varint::encode(h.value.len() as u64, &mut buf);
            buf.extend_from_slice(&h.value);
        }
        Ok(buf.freeze())
    }

    fn decode(&mut self, block: &[u8]) -> Result<Vec<Header>> {
        let mut headers = Vec::new();
        let mut rest = block;
        while !rest.is_empty() {
            let (name, n) = Self::field(rest).ok_or(Error::HeaderCompression)?;
            rest = &rest[n..];
            let (value, m) = Self::field(rest).ok_or(Error::HeaderCompression)?;
            rest = &rest[m..];
            headers.push(Header { name, value });
        }
        Ok(headers)
    }
}

impl LiteralCodec {
    fn field(buf: &[u8]) -> Option<(Bytes, usize)> {
        let (len, n) = varint::decode(buf)?;
        let len = len as usize;
        if buf.len() < n + len {
            return None;
        }
        Some((Bytes::copy_from_slice(&buf[n..n + len]), n + len))
    }
}

/// Whether a header block names a `trailer` field, promising trailers after
/// the body.
pub(crate) fn promises_trailers(headers: &[Header]) -> bool {
    headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case(b"trailer"))
}
