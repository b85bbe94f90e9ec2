//! Error types for tether.

use std::fmt;

/// Unified error type for all tether operations.
///
/// Each variant corresponds to one error kind on the library surface, so
/// callers can match on the failure class without string inspection.
#[derive(Debug)]
pub enum TetherError {
    /// I/O error on the underlying stream
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Malformed or unexpected protocol data; fatal to the transport
    Protocol(String),

    /// Cryptographic failure (bad MAC, failed agreement, bad signature);
    /// fatal to the transport
    Crypto(String),

    /// Authentication was refused
    Auth(String),

    /// Clean end of stream; reads after this drain nothing
    Eof,

    /// The channel or transport was closed under the operation
    Closed(String),

    /// A deadline or idle timer fired; the channel remains usable
    Timeout(String),

    /// The operation was cancelled by a halt signal or caller deadline
    Cancelled(String),

    /// Text or blob that does not parse (authorized-keys lines, key blobs)
    Format(String),

    /// A policy oracle rejected the peer (untrusted authority, bad principal)
    Policy(String),
}

impl TetherError {
    /// Returns whether this error tears down the whole transport, failing
    /// every channel with `Closed`.
    pub fn is_fatal_to_transport(&self) -> bool {
        matches!(self, TetherError::Protocol(_) | TetherError::Crypto(_))
    }

    /// Returns whether the operation may be retried on the same channel.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TetherError::Timeout(_))
    }
}

impl fmt::Display for TetherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TetherError::Io(e) => write!(f, "IO error: {}", e),
            TetherError::Config(msg) => write!(f, "Configuration error: {}", msg),
            TetherError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            TetherError::Crypto(msg) => write!(f, "Crypto error: {}", msg),
            TetherError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            TetherError::Eof => write!(f, "EOF"),
            TetherError::Closed(msg) => write!(f, "Closed: {}", msg),
            TetherError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            TetherError::Cancelled(msg) => write!(f, "Cancelled: {}", msg),
            TetherError::Format(msg) => write!(f, "Format error: {}", msg),
            TetherError::Policy(msg) => write!(f, "Policy error: {}", msg),
        }
    }
}

impl std::error::Error for TetherError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TetherError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            TetherError::Eof
        } else {
            TetherError::Io(err)
        }
    }
}

/// Result type for tether operations.
pub type TetherResult<T> = Result<T, TetherError>;
