use thiserror::Error;

/// All errors produced by the hqmcast session layer.
///
/// Stream-level kinds (e.g. `RequestClosed`, `TrailersNotPromised`) close only
/// the stream that observed them; session-level kinds (`Crypto`,
/// `TransportProtocol`) leave the session unusable and the caller is expected
/// to drop it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("session is closed")]
    SessionClosed,

    #[error("session is blocked, retry later")]
    SessionBlocked,

    #[error("no more data available")]
    NoMoreData,

    #[error("transport engine failure")]
    Transport,

    #[error("transport protocol violation")]
    TransportProtocol,

    #[error("unsupported transport version")]
    TransportVersion,

    #[error("packet protection failure")]
    Crypto,

    #[error("bad user data: {0}")]
    BadUserData(&'static str),

    #[error("operation is valid on client sessions only")]
    ClientOnly,

    #[error("operation is valid on server sessions only")]
    ServerOnly,

    #[error("too many open requests")]
    TooManyRequests,

    #[error("push promise limit reached")]
    PushLimitReached,

    #[error("push limit may not be lowered")]
    InvalidPushLimit,

    #[error("request is closed")]
    RequestClosed,

    #[error("trailers were not promised by the header block")]
    TrailersNotPromised,

    #[error("header compression failure")]
    HeaderCompression,

    #[error("push refused by the receiver")]
    PushRefused,

    #[error("pushed resource already in cache")]
    PushAlreadyInCache,

    #[error("receiver not interested in the request")]
    NotInterested,

    #[error("frame received on the wrong stream")]
    WrongStream,

    #[error("CONNECT failed")]
    ConnectError,

    #[error("no mutually supported ALPN token")]
    AlpnFailed,

    #[error("malformed frame 0x{0:02x}")]
    MalformedFrame(u64),

    #[error("duplicate push id")]
    DuplicatePush,

    #[error("end of file on the bearer")]
    Eof,

    #[error("internal error: {0}")]
    Internal(&'static str),

    #[error("generic failure")]
    Generic,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The status delivered by `on_request_close`: `Ok(())` for a clean close,
/// otherwise the mapped error kind.
pub type CloseStatus = std::result::Result<(), Error>;

/// HTTP application error codes carried on stream close (draft numbering the
/// wire format targets).
pub mod h3 {
    pub const STOPPING: u64 = 0x00;
    pub const NO_ERROR: u64 = 0x01;
    pub const PUSH_REFUSED: u64 = 0x02;
    pub const INTERNAL_ERROR: u64 = 0x03;
    pub const PUSH_ALREADY_IN_CACHE: u64 = 0x04;
    pub const REQUEST_CANCELLED: u64 = 0x05;
    pub const INCOMPLETE_REQUEST: u64 = 0x06;
    pub const CONNECT_ERROR: u64 = 0x07;
    pub const EXCESSIVE_LOAD: u64 = 0x08;
    pub const VERSION_FALLBACK: u64 = 0x09;
    pub const WRONG_STREAM: u64 = 0x0a;
    pub const PUSH_LIMIT_EXCEEDED: u64 = 0x0b;
    pub const DUPLICATE_PUSH: u64 = 0x0c;
    /// Base of the malformed-frame family: `0x100 + frame type`.
    pub const MALFORMED_FRAME: u64 = 0x100;
    pub const HPACK_DECOMPRESSION_FAILED: u64 = 0x200;
}

/// Map an HTTP application error code observed on stream close to the status
/// delivered through `on_request_close`.
pub fn status_from_app_error(code: u64) -> CloseStatus {
    match code {
        h3::STOPPING | h3::NO_ERROR => Ok(()),
        h3::PUSH_REFUSED => Err(Error::PushRefused),
        h3::PUSH_ALREADY_IN_CACHE => Err(Error::PushAlreadyInCache),
        h3::REQUEST_CANCELLED => Err(Error::NotInterested),
        h3::CONNECT_ERROR => Err(Error::ConnectError),
        h3::WRONG_STREAM => Err(Error::WrongStream),
        h3::PUSH_LIMIT_EXCEEDED => Err(Error::PushLimitReached),
        h3::DUPLICATE_PUSH => Err(Error::DuplicatePush),
        h3::HPACK_DECOMPRESSION_FAILED => Err(Error::HeaderCompression),
        c if (h3::MALFORMED_FRAME..h3::MALFORMED_FRAME + 0x100).contains(&c) => {
            Err(Error::MalformedFrame(c - h3::MALFORMED_FRAME))
        }
        _ => Err(Error::Internal("unmapped application error code")),
    }
}

/// The inverse direction: the application error code announced to the
/// transport engine when the local side closes a stream with `status`.
pub fn app_error_from_status(status: CloseStatus) -> u64 {
    match status {
        Ok(()) => h3::NO_ERROR,
        Err(Error::PushRefused) => h3::PUSH_REFUSED,
        Err(Error::PushAlreadyInCache) => h3::PUSH_ALREADY_IN_CACHE,
        Err(Error::NotInterested) => h3::REQUEST_CANCELLED,
        Err(Error::ConnectError) => h3::CONNECT_ERROR,
        Err(Error::WrongStream) => h3::WRONG_STREAM,
        Err(Error::PushLimitReached) => h3::PUSH_LIMIT_EXCEEDED,
        Err(Error::DuplicatePush) => h3::DUPLICATE_PUSH,
        Err(Error::HeaderCompression) => h3::HPACK_DECOMPRESSION_FAILED,
        Err(Error::MalformedFrame(t)) => h3::MALFORMED_FRAME + (t & 0xff),
        Err(_) => h3::INTERNAL_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_error_mapping_round_trips() {
        for code in [
            h3::PUSH_REFUSED,
            h3::PUSH_ALREADY_IN_CACHE,
            h3::REQUEST_CANCELLED,
            h3::WRONG_STREAM,
            h3::PUSH_LIMIT_EXCEEDED,
            h3::DUPLICATE_PUSH,
            h3::HPACK_DECOMPRESSION_FAILED,
        ] {
            assert_eq!(app_error_from_status(status_from_app_error(code)), code);
        }
    }

    #[test]
    fn malformed_frame_family() {
        assert_eq!(
            status_from_app_error(h3::MALFORMED_FRAME + 0x05),
            Err(Error::MalformedFrame(0x05))
        );
    }

    #[test]
    fn clean_close_codes() {
        assert_eq!(status_from_app_error(h3::NO_ERROR), Ok(()));
        assert_eq!(status_from_app_error(h3::STOPPING), Ok(()));
    }

    #[test]
    fn unknown_code_is_internal() {
        assert!(matches!(
            status_from_app_error(0xdead),
            Err(Error::Internal(_))
        ));
    }
}
