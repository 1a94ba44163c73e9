use std::{fmt::Display, io};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Close reason codes as specified in
/// [RFC 6455](https://www.rfc-editor.org/rfc/rfc6455.html#section-7.4)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Normal close
    Normal = 1000,
    /// Going away
    GoingAway = 1001,
    /// Websocket protocol violation
    ProtoError = 1002,
    /// Unsupported data type
    DataType = 1003,
    /// Reserved code, should never be seen
    Rsv = 1004,
    /// No reason code provided
    NoneGiven = 1005,
    /// Abnormal closure
    Abnormal = 1006,
    /// Invalid UTF-8 in Text message
    DataError = 1007,
    /// Generic policy violation
    Policy = 1008,
    /// Messages are too big
    TooBig = 1009,
    /// Unsupported extensions
    Extension = 1010,
    /// An unexpected condition that prevented the request from being fulfilled
    Unexpected = 1011,
    /// TLS error
    Tls = 1015,
    /// Other valid codes with unknown meanings
    Unknown = 4000, // private use code
}

/// Converts a reason code to bytes of the appropriate endianness.
impl From<CloseReason> for [u8; 2] {
    fn from(value: CloseReason) -> Self { (value as u16).to_be_bytes() }
}

impl From<[u8; 2]> for CloseReason {
    fn from(bytes: [u8; 2]) -> Self {
        match u16::from_be_bytes(bytes) {
            1000 => CloseReason::Normal,
            1001 => CloseReason::GoingAway,
            1002 => CloseReason::ProtoError,
            1003 => CloseReason::DataType,
            1004 => CloseReason::Rsv,
            1005 => CloseReason::NoneGiven,
            1006 => CloseReason::Abnormal,
            1007 => CloseReason::DataError,
            1008 => CloseReason::Policy,
            1009 => CloseReason::TooBig,
            1010 => CloseReason::Extension,
            1011 => CloseReason::Unexpected,
            1015 => CloseReason::Tls,
            _ => CloseReason::Unknown,
        }
    }
}

impl CloseReason {
    /// Reads the status code from a Close frame payload, if one was sent.
    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        match payload {
            [a, b, ..] => Some(Self::from([*a, *b])),
            _ => None,
        }
    }
}

/// Everything that can go wrong between dialing the server and checking the
/// last event.
#[derive(Debug, Error)]
pub enum Error {
    /// TCP connect was refused or the host was unreachable.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The server answered the upgrade request with something other than 101.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The stream ended in the middle of a frame.
    #[error("stream ended mid-frame ({buffered} bytes of an incomplete frame buffered)")]
    TruncatedFrame { buffered: usize },

    /// Malformed framing or an illegal fragmentation sequence.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// Opcode outside the set defined by RFC 6455.
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),

    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: u64, max: usize },

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A text message was not valid UTF-8.
    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,

    /// A text message was not valid JSON.
    #[error("invalid JSON in text message: {0}")]
    Json(#[from] serde_json::Error),

    /// An event lacks one of the required fields.
    #[error("event missing field {field}: {event}")]
    Schema { field: &'static str, event: String },

    /// The connection closed before a snapshot arrived.
    #[error("did not receive snapshot")]
    MissingSnapshot,

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The server binary could not be found or started.
    #[error("server binary {path}: {reason}")]
    ServerBinary { path: String, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Coarse classification of [`Error`] for logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConnectFailure,
    HandshakeFailure,
    TruncatedFrame,
    ProtocolViolation,
    DecodeFailure,
    SchemaViolation,
    Infrastructure,
}

impl Error {
    pub(crate) fn connect(addr: impl Display, source: io::Error) -> Self {
        Self::Connect {
            addr: addr.to_string(),
            source,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect { .. } => ErrorKind::ConnectFailure,
            Self::Handshake(_) => ErrorKind::HandshakeFailure,
            Self::TruncatedFrame { .. } => ErrorKind::TruncatedFrame,
            Self::Protocol(_)
            | Self::ReservedOpcode(_)
            | Self::FrameTooLarge { .. }
            | Self::MessageTooLarge { .. } => ErrorKind::ProtocolViolation,
            Self::InvalidUtf8 | Self::Json(_) => ErrorKind::DecodeFailure,
            Self::Schema { .. } | Self::MissingSnapshot => ErrorKind::SchemaViolation,
            Self::InvalidUrl { .. }
            | Self::ServerBinary { .. }
            | Self::Timeout(_)
            | Self::Io(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether the session that produced this error can no longer be used.
    ///
    /// Schema problems are judged by the caller; the stream itself is intact.
    #[must_use]
    pub fn is_fatal_to_session(&self) -> bool { !matches!(self, Self::Schema { .. }) }
}
