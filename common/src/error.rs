use core::fmt;

use thiserror::Error;

/// Rejected trigger input. Nothing has been allocated when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("url is {len} bytes, longer than the {max} byte limit")]
    UrlTooLong { len: usize, max: usize },
    #[error("url must start with http://")]
    UnsupportedScheme,
    #[error("url has no host")]
    MissingHost,
    #[error("url has no path")]
    MissingPath,
    #[error("url contains whitespace or control characters")]
    InvalidCharacter,
    #[error("invalid port `{0}`")]
    InvalidPort(String),
    #[error("checksum must be 32 hex digits")]
    InvalidChecksum,
    #[error("trigger payload is {len} bytes, longer than the {max} byte limit")]
    PayloadTooLong { len: usize, max: usize },
    #[error("trigger payload has no `|` separator")]
    MissingSeparator,
    #[error("trigger url is not valid UTF-8")]
    InvalidEncoding,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("header line longer than {capacity} bytes")]
    HeaderLineTooLong { capacity: usize },
    #[error("null character in response headers")]
    NullByte,
    #[error("response has no status line")]
    MissingStatusLine,
    #[error("did not get 200 status: `{0}`")]
    BadStatus(String),
    #[error("unparseable Content-Length `{0}`")]
    InvalidContentLength(String),
    #[error("Content-Length {length} outside [{min}, {max}]")]
    ContentLengthOutOfRange { length: u64, min: u64, max: u64 },
    #[error("invalid Content-Type `{0}`")]
    InvalidContentType(String),
    #[error("{0} header missing")]
    MissingHeader(&'static str),
}

/// Why an in-flight update was torn down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("transport timed out")]
    TransportTimeout,
    #[error("transport disconnected")]
    Disconnected,
    #[error("not enough space in TX buffer: {available} < {required}")]
    SendBufferFull { available: usize, required: usize },
    #[error("only wrote {written} out of {expected} request bytes")]
    ShortRequestWrite { written: usize, expected: usize },
    #[error("not enough space to store a {size} byte image")]
    InsufficientSpace { size: u64 },
    #[error("write failed, wrote {written} expected {expected}")]
    ShortSinkWrite { written: usize, expected: usize },
    #[error("sink not finished after {written} bytes")]
    SinkIncomplete { written: u64 },
    #[error("image verification or commit failed")]
    Integrity,
    #[error("no progress for {timeout_ms} ms")]
    AttemptTimeout { timeout_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Protocol,
    Io,
    Capacity,
    Integrity,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::Io => "i/o",
            Self::Capacity => "capacity",
            Self::Integrity => "integrity",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl UpdateError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Protocol(_) => ErrorClass::Protocol,
            Self::Transport(_)
            | Self::TransportTimeout
            | Self::Disconnected
            | Self::SendBufferFull { .. }
            | Self::ShortRequestWrite { .. }
            | Self::ShortSinkWrite { .. }
            | Self::AttemptTimeout { .. } => ErrorClass::Io,
            Self::InsufficientSpace { .. } => ErrorClass::Capacity,
            Self::SinkIncomplete { .. } | Self::Integrity => ErrorClass::Integrity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BeginError {
    #[error("fetch in progress, not starting new one")]
    Busy,
    #[error(transparent)]
    Input(#[from] InputError),
    #[error("failed to initiate connection to {host}:{port}")]
    ConnectFailed { host: String, port: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_keep_their_message() {
        let err = UpdateError::from(ProtocolError::MissingHeader("Content-Length"));

        assert_eq!(err.class(), ErrorClass::Protocol);
        assert_eq!(err.to_string(), "Content-Length header missing");
    }

    #[test]
    fn classes_follow_failure_source() {
        assert_eq!(UpdateError::Disconnected.class(), ErrorClass::Io);
        assert_eq!(
            UpdateError::InsufficientSpace { size: 4096 }.class(),
            ErrorClass::Capacity
        );
        assert_eq!(UpdateError::Integrity.class(), ErrorClass::Integrity);
    }
}
