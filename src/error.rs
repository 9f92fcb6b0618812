//! Error types for tcpserv.
//!
//! Every failure is local to a single exchange: the listener recovers all of
//! them at the connection boundary, the client surfaces them to its caller.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// The byte stream did not contain a well-formed frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Declared length is larger than the configured maximum (or than the
    /// prefix width can carry, when encoding).
    #[error("malformed length: {declared} bytes exceeds maximum of {max}")]
    MalformedLength { declared: u64, max: u64 },

    /// Peer closed before the full length prefix arrived.
    #[error("incomplete header: got {received} of {expected} prefix bytes")]
    IncompleteHeader { received: usize, expected: usize },

    /// Peer closed before the declared payload length was satisfied.
    #[error("incomplete payload: got {received} of {expected} payload bytes")]
    IncompletePayload { received: usize, expected: usize },
}

/// The user handler failed (returned an error or panicked).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<io::Error> for HandlerError {
    fn from(e: io::Error) -> Self {
        Self::new(e)
    }
}

/// Which step of an exchange a timeout interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Read,
    Write,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Connect => f.write_str("connect"),
            Phase::Read => f.write_str("read"),
            Phase::Write => f.write_str("write"),
        }
    }
}

/// Main error type for all tcpserv operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or truncated frame.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport failure: refused, reset, unreachable, broken pipe.
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),

    /// A configured time bound elapsed.
    #[error("timed out during {phase} after {after:?}")]
    Timeout { phase: Phase, after: Duration },

    /// The handler failed for this exchange.
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    /// The listening socket could not be set up.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A blocking wrapper could not start its runtime.
    #[error("failed to start runtime: {0}")]
    Runtime(#[source] io::Error),
}

impl Error {
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }
}

/// Result type alias using tcpserv's Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_messages() {
        let e = ProtocolError::MalformedLength {
            declared: 11,
            max: 10,
        };
        assert_eq!(e.to_string(), "malformed length: 11 bytes exceeds maximum of 10");

        let e = ProtocolError::IncompleteHeader {
            received: 2,
            expected: 4,
        };
        assert!(e.to_string().contains("2 of 4"));
    }

    #[test]
    fn test_error_classification() {
        let e: Error = ProtocolError::IncompletePayload {
            received: 1,
            expected: 5,
        }
        .into();
        assert!(e.is_protocol());
        assert!(!e.is_timeout());

        let e: Error = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert!(e.is_connection());

        let e = Error::Timeout {
            phase: Phase::Read,
            after: Duration::from_millis(5),
        };
        assert!(e.is_timeout());
        assert!(e.to_string().starts_with("timed out during read"));
    }

    #[test]
    fn test_handler_error_conversions() {
        assert_eq!(HandlerError::from("boom").message(), "boom");
        assert_eq!(HandlerError::from(String::from("bad")).to_string(), "bad");
    }
}
