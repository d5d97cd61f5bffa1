//! The QUIC transport engine seam.
//!
//! Packet protection, loss detection, flow control and packet numbering live
//! behind [`TransportEngine`]. The session drives the engine with raw packet
//! bytes and stream writes; the engine reports what happened through
//! [`TransportEvent`] values, the trait rendering of a callback table.

use bytes::Bytes;
use thiserror::Error;

use crate::error::Error as SessionError;

/// Encryption level for key installation and crypto data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoLevel {
    Initial,
    Handshake,
    Application,
}

/// Failures reported by the transport engine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("engine ran out of buffer space")]
    NoBuf,

    #[error("transport protocol violation")]
    Proto,

    #[error("unsupported transport version")]
    Version,

    #[error("packet failed decryption")]
    TlsDecrypt,

    #[error("stream is blocked by flow control")]
    StreamDataBlocked,

    #[error("stream send side is shut down")]
    StreamShutWr,

    #[error("stream not found")]
    StreamNotFound,

    #[error("engine failure: {0}")]
    Other(&'static str),
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NoBuf => SessionError::Internal("transport engine out of buffers"),
            TransportError::Proto => SessionError::TransportProtocol,
            TransportError::Version => SessionError::TransportVersion,
            TransportError::TlsDecrypt => SessionError::Crypto,
            // Absorbed by the send scheduler; anything that escapes to the
            // session boundary is a plain transport failure.
            TransportError::StreamDataBlocked
            | TransportError::StreamShutWr
            | TransportError::StreamNotFound => SessionError::Transport,
            TransportError::Other(_) => SessionError::Transport,
        }
    }
}

/// Outcome of asking the engine to write stream bytes into a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamWrite {
    /// Source bytes the engine accepted.
    pub accepted: usize,
    /// Length of the produced packet, zero when nothing was written.
    pub pkt_len: usize,
}

/// What the engine observed while reading a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Stream bytes arrived; ranges may be duplicated or out of order.
    StreamData {
        stream_id: u64,
        offset: u64,
        data: Bytes,
        fin: bool,
    },
    /// A stream closed with an application error code.
    StreamClosed { stream_id: u64, app_error: u64 },
    /// The handshake reached completion inside the engine.
    HandshakeCompleted,
}

/// Deadline value meaning "no timer".
pub const NO_DEADLINE: u64 = u64::MAX;

/// The transport engine contract the session programs against.
///
/// Timestamps are nanoseconds on the host's monotonic clock, supplied by the
/// caller at every entry point.
pub trait TransportEngine {
    /// Feed one received (or fabricated) packet. Returns the events the
    /// packet produced.
    fn read_pkt(&mut self, pkt: &[u8]) -> Result<Vec<TransportEvent>, TransportError>;

    /// Write up to `data.len()` bytes of `stream_id` into a fresh packet
    /// appended to `out`.
    fn write_stream(
        &mut self,
        stream_id: u64,
        data: &[u8],
        fin: bool,
        out: &mut Vec<u8>,
    ) -> Result<StreamWrite, TransportError>;

    /// Produce a pending non-stream packet (handshake flight, ACK), appended
    /// to `out`. Returns the packet length, zero once drained.
    fn write_pkt(&mut self, out: &mut Vec<u8>) -> Result<usize, TransportError>;

    /// Unacknowledged bytes currently in flight.
    fn bytes_in_flight(&self) -> usize;

    /// Largest packet the engine will emit.
    fn max_packet_size(&self) -> usize;

    fn install_keys(&mut self, level: CryptoLevel, secret: &[u8; 32])
        -> Result<(), TransportError>;

    fn submit_crypto_data(&mut self, level: CryptoLevel, data: &[u8])
        -> Result<(), TransportError>;

    /// Hand the engine the encoded transport parameters for this session.
    fn set_transport_params(&mut self, encoded: &[u8]) -> Result<(), TransportError>;

    fn open_stream(&mut self, stream_id: u64) -> Result<(), TransportError>;

    /// Shut down a stream; a later `StreamClosed` event reports the close.
    fn shutdown_stream(&mut self, stream_id: u64, app_error: u64) -> Result<(), TransportError>;

    /// Tell the engine the handshake is done (used when the session forges
    /// the handshake instead of the engine negotiating one).
    fn handshake_completed(&mut self);

    /// Override the AEAD expansion the engine adds to packet-size arithmetic.
    fn set_aead_overhead(&mut self, overhead: usize);

    /// Loss-detection deadline, [`NO_DEADLINE`] when unarmed.
    fn loss_detection_deadline(&self) -> u64;

    /// ACK-delay deadline, [`NO_DEADLINE`] when unarmed.
    fn ack_delay_deadline(&self) -> u64;

    /// Run the engine's loss-detection routine at `now`.
    fn on_loss_detection_timer(&mut self, now: u64) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_translation() {
        assert_eq!(
            SessionError::from(TransportError::Proto),
            SessionError::TransportProtocol
        );
        assert_eq!(
            SessionError::from(TransportError::TlsDecrypt),
            SessionError::Crypto
        );
        assert_eq!(
            SessionError::from(TransportError::Version),
            SessionError::TransportVersion
        );
        assert!(matches!(
            SessionError::from(TransportError::NoBuf),
            SessionError::Internal(_)
        ));
    }
}
