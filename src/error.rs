//! Error types for the split proxy.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can end a single proxied session.
///
/// None of these are retried; the session is closed and the next connection
/// is independent.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed SOCKS5 greeting/request or unparseable HTTP request line
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// SOCKS5 address type this proxy does not carry (IPv6 or unknown)
    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    /// Dial to the chosen upstream failed
    #[error("upstream {addr} unreachable: {source}")]
    UpstreamUnreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A received frame could not be decrypted
    #[error("frame corruption: decryption failed")]
    FrameCorruption,

    /// No traffic in either direction for the idle period
    #[error("idle timeout after {0:?}")]
    Timeout(Duration),

    /// Target host matched a blacklist pattern
    #[error("rejected by policy: {host} matched `{pattern}`")]
    PolicyRejection { host: String, pattern: String },

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Policy store backend error
    #[error("policy store error: {0}")]
    Policy(String),

    /// A handshake block does not fit its single-byte length prefix
    #[error("handshake {field} block too large: {len} bytes")]
    HandshakeTooLarge { field: &'static str, len: usize },

    /// Remote side rejected the verification block
    #[error("tunnel key verification failed")]
    VerificationFailed,
}

impl Error {
    /// Create a new protocol violation error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new policy store error
    pub fn policy(msg: impl Into<String>) -> Self {
        Error::Policy(msg.into())
    }

    /// Whether this is a normal end of session rather than a failure.
    pub fn is_expected_close(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Network(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Whether the client spoke something other than SOCKS5/HTTP proxy.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation(_) | Error::UnsupportedAddressType(_)
        )
    }
}
