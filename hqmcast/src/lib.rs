//! HTTP/3-style request/response semantics over a QUIC transport, with a
//! one-way multicast profile.
//!
//! The core is the per-connection [`Session`]: it forges a complete QUIC
//! handshake out of pre-shared magic so a stateless transport engine can be
//! driven over a unidirectional bearer, multiplexes HTTP/3 frames over QUIC
//! streams (reassembling out-of-order byte ranges back into frame
//! boundaries), tracks server-push promises from allocation to
//! materialisation, schedules outgoing bytes under a bytes-in-flight
//! ceiling, and synthesises the ACKs the engine's recovery machinery expects
//! from a reverse path that does not exist.
//!
//! The QUIC engine itself, the header-compression codec, socket I/O and
//! timers are external collaborators reached through the [`transport`],
//! [`hdr`] and [`callbacks`] traits.

pub mod buffer;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod hdr;
pub mod map;
pub mod reassembly;
pub mod scheduler;
pub mod session;
pub mod stream;
pub mod timer;
pub mod transport;
pub mod varint;

pub use callbacks::{DataFlags, HeaderFlags, IoVerdict, SessionCallbacks, TimerId, TimerKind};
pub use config::{
    decode_session_id, select_alpn, Mode, Role, TransportParams, TransportSettings, ALPN_TOKEN,
};
pub use error::{CloseStatus, Error, Result};
pub use hdr::{Header, HeaderCodec, LiteralCodec};
pub use session::Session;
pub use transport::{
    CryptoLevel, StreamWrite, TransportEngine, TransportError, TransportEvent, NO_DEADLINE,
};
