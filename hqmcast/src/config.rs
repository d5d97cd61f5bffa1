//! Session configuration: mode, role, limits, and the wire constants the
//! profiles pin down.

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::varint;

/// Bearer profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Conventional bidirectional QUIC with an external transport engine
    /// doing the real handshake.
    Unicast,
    /// One-way bearer: keys are pre-shared magic and the missing half of the
    /// handshake is forged locally.
    Multicast,
}

/// Endpoint role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// The ceiling the send scheduler applies to unacknowledged bytes.
pub const MAX_BYTES_IN_FLIGHT: usize = 14_600;

/// Reserved per-packet bytes: QUIC short header, stream-frame header and
/// HTTP/3 framing.
pub const MIN_STREAM_PACKET_OVERHEAD: usize = 27;

/// Size of each read from the host's receive callback.
pub const BUFFER_READ_SIZE: usize = 4096;

/// The one ALPN token this crate speaks.
pub const ALPN_TOKEN: &[u8] = b"hqm-05";

/// Bidirectional anchor stream committed by the fabricated handshake.
pub const HANDSHAKE_ANCHOR_STREAM_ID: u64 = 0;

/// The single multicast request stream, also the stream PUSH_PROMISE frames
/// arrive on.
pub const INIT_REQUEST_STREAM_ID: u64 = 4;
pub const PUSH_PROMISE_STREAM_ID: u64 = INIT_REQUEST_STREAM_ID;

/// Client- and server-owned control streams.
pub const CLIENT_CONTROL_STREAM_ID: u64 = 2;
pub const SERVER_CONTROL_STREAM_ID: u64 = 3;

/// Highest unidirectional stream id a multicast bearer may use.
pub const MULTICAST_MAX_UNI_STREAM_ID: u64 = 0x3fff_ffff;

/// First server-push stream id; pushes advance in steps of 4 from here,
/// leaving id 3 to the server control stream.
pub const FIRST_PUSH_STREAM_ID: u64 = 7;

pub(crate) const TRANSPORT_PARAMS_INITIAL_SIZE: usize = 128;
pub(crate) const TRANSPORT_PARAMS_MAX_SIZE: usize = 512;

/// Caller-tunable session limits.
#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    /// Concurrent requests the session will hold open.
    pub max_open_requests: u64,
    /// Concurrent server pushes the session will hold open.
    pub max_open_server_pushes: u64,
    /// Packet size the engine is asked to respect.
    pub max_packet_size: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_open_requests: 16,
            max_open_server_pushes: 16,
            max_packet_size: 1280,
        }
    }
}

/// The transport parameters a profile fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportParams {
    pub highest_bidi_stream_id: u64,
    pub highest_uni_stream_id: u64,
    pub max_push_promise: u64,
    pub initial_max_streams_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub active_connection_id_limit: u64,
}

impl TransportParams {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Multicast => Self {
                highest_bidi_stream_id: INIT_REQUEST_STREAM_ID,
                highest_uni_stream_id: MULTICAST_MAX_UNI_STREAM_ID,
                max_push_promise: MULTICAST_MAX_UNI_STREAM_ID,
                initial_max_streams_uni: 0x3fff_ffff,
                initial_max_streams_bidi: 4,
                active_connection_id_limit: 0,
            },
            Mode::Unicast => Self {
                highest_bidi_stream_id: MULTICAST_MAX_UNI_STREAM_ID,
                highest_uni_stream_id: MULTICAST_MAX_UNI_STREAM_ID,
                max_push_promise: 0,
                initial_max_streams_uni: 0x3fff_ffff,
                initial_max_streams_bidi: 4,
                active_connection_id_limit: 0,
            },
        }
    }

    /// Encode as the TLV list handed to the transport engine. The buffer
    /// starts at 128 bytes and may grow to a hard cap of 512.
    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(TRANSPORT_PARAMS_INITIAL_SIZE);
        for (id, value) in [
            (0x08, self.initial_max_streams_bidi),
            (0x09, self.initial_max_streams_uni),
            (0x0e, self.active_connection_id_limit),
        ] {
            varint::encode(id, &mut buf);
            varint::encode(varint::len(value) as u64, &mut buf);
            varint::encode(value, &mut buf);
        }
        if buf.len() > TRANSPORT_PARAMS_MAX_SIZE {
            return Err(Error::Internal("transport parameters exceed buffer cap"));
        }
        Ok(buf)
    }
}

/// Select our ALPN token from a length-prefixed protocol list.
///
/// Input is validated before anything else: an empty or truncated list fails
/// rather than being read past.
pub fn select_alpn(offered: &[u8]) -> Result<&[u8]> {
    let mut rest = offered;
    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if tail.len() < len {
            return Err(Error::AlpnFailed);
        }
        let (token, next) = tail.split_at(len);
        if token == ALPN_TOKEN {
            return Ok(token);
        }
        rest = next;
    }
    Err(Error::AlpnFailed)
}

/// Decode a session id given as a hex string.
///
/// Odd-length input is accepted: the final lone nibble occupies the low half
/// of the last byte.
pub fn decode_session_id(hex: &str) -> Result<Vec<u8>> {
    fn nibble(c: u8) -> Result<u8> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(Error::BadUserData("session id is not hex")),
        }
    }

    let src = hex.as_bytes();
    let mut out = Vec::with_capacity(src.len().div_ceil(2));
    let mut chunks = src.chunks_exact(2);
    for pair in &mut chunks {
        out.push((nibble(pair[0])? << 4) | nibble(pair[1])?);
    }
    if let [last] = chunks.remainder() {
        out.push(nibble(*last)?);
    }
    Ok(out)
}
