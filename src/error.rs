use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Failure to promote an HTTP request to a WebSocket.
///
/// `Incomplete` only means the header block has not fully arrived yet; the
/// caller keeps buffering and retries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake request incomplete")]
    Incomplete,
    #[error("malformed handshake request: {0}")]
    MalformedRequest(&'static str),
    #[error("unsupported method {0}")]
    UnsupportedMethod(String),
    #[error("missing or invalid Upgrade header")]
    MissingUpgrade,
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("Sec-WebSocket-Key is not base64 of 16 bytes")]
    InvalidKey,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("control frame is fragmented")]
    FragmentedControl,
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlTooLarge(u64),
    #[error("64-bit payload length {0:#x} has the most significant bit set")]
    InvalidLength(u64),
    #[error("payload of {len} bytes exceeds limit of {max}")]
    TooLarge { len: u64, max: usize },
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("new data frame while a fragmented message is in progress")]
    InterleavedDataFrame,
    #[error("client frame is not masked")]
    UnmaskedClientFrame,
    #[error("invalid close frame payload")]
    InvalidClosePayload,
}

impl FrameError {
    /// Close status code sent to the peer for this violation.
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::TooLarge { .. } => crate::net::framing::close_code::TOO_BIG,
            _ => crate::net::framing::close_code::PROTOCOL_ERROR,
        }
    }
}

/// Text payload that is not UTF-8. Not fatal to the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("text payload is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("server i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid port {0} (expected 1024..=65535, or 0 for ephemeral)")]
    InvalidPort(String),
    #[error("invalid bind address {0}")]
    InvalidAddress(String),
    #[error("invalid value {value:?} for {key}")]
    InvalidNumber { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] simd_json::Error),
}
