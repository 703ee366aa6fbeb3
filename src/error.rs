//! # Error Types
//!
//! This module defines the error surface of the library. Every failure a
//! caller can observe is a distinct variant of [`Error`], so call sites can
//! match on the kind instead of string-scraping. The variants fall into four
//! groups:
//!
//! - **Fatal connection errors**: transport I/O and codec violations. These
//!   tear down the connection and feed the reconnect path.
//! - **Per-call errors**: timeouts and remote error replies. These complete
//!   only the affected pending call and leave the connection untouched.
//! - **Handshake errors**: SASL and Hello failures. These fail the current
//!   connect attempt and count toward the circuit breaker.
//! - **Lifecycle misuse**: calling an operation in a state that does not
//!   permit it. These never change connection state.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All error kinds surfaced by the library.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying byte stream failed to read, write, or close.
    #[error("transport i/o error: {0}")]
    TransportIo(#[from] std::io::Error),

    /// Every configured SASL mechanism was rejected by the server.
    #[error("authentication rejected, no mechanism left to try (server offered: {offered})")]
    SaslRejected {
        /// The mechanism list from the final REJECTED line, verbatim.
        offered: String,
    },

    /// The SASL exchange violated the line protocol: malformed command,
    /// bad hex, oversized line, or a response illegal in the current state.
    #[error("SASL protocol error: {0}")]
    SaslProtocol(String),

    /// DBUS_COOKIE_SHA1 could not complete: keyring directory with unsafe
    /// permissions, missing cookie file, or no matching cookie entry.
    #[error("SASL cookie error: {0}")]
    SaslCookie(String),

    /// The mandatory Hello call returned an error or a malformed reply.
    #[error("Hello failed: {0}")]
    HelloFailed(String),

    /// Inbound wire bytes violate the marshalling rules.
    #[error("decode error: {0}")]
    CodecDecode(String),

    /// An outbound value list does not match its declared signature, or the
    /// encoded message would exceed the protocol maximum.
    #[error("encode error: {0}")]
    CodecEncode(String),

    /// A header field required for the message type is missing or carries
    /// the wrong type.
    #[error("invalid message: {0}")]
    MessageInvalid(String),

    /// The per-call deadline elapsed before a reply arrived.
    #[error("method call timed out")]
    Timeout,

    /// The connection was closed before a result arrived.
    #[error("connection closed")]
    Closed,

    /// `connect()` was called on an already connected engine.
    #[error("already connected")]
    AlreadyConnected,

    /// `connect()` was called while a prior attempt is still in flight.
    #[error("connection attempt already in progress")]
    AlreadyInProgress,

    /// The operation raced with a `close()` in progress.
    #[error("connection is closing")]
    Closing,

    /// The operation requires an active connection.
    #[error("connection is not active")]
    NotActive,

    /// The circuit breaker refused the connection attempt.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// The reconnect controller ran out of attempts.
    #[error("reconnection attempts exhausted")]
    ReconnectExhausted,

    /// The remote peer answered a method call with an error message. The
    /// error name is preserved verbatim.
    #[error("remote error {name}: {message}")]
    Remote {
        /// The ERROR_NAME header field, e.g. `org.freedesktop.DBus.Error.UnknownMethod`.
        name: String,
        /// First string body argument if present, empty otherwise.
        message: String,
        /// The full reply body.
        body: Vec<crate::types::Value>,
    },

    /// A configuration value failed builder validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A bus address string could not be parsed.
    #[error("invalid bus address: {0}")]
    Address(String),

    /// A bus, interface, member, or error name violates the D-Bus grammar.
    #[error("invalid name: {0}")]
    Name(String),

    /// A handler with the same name is already registered on the pipeline.
    #[error("handler name already exists: {0}")]
    HandlerExists(String),

    /// A pipeline structural rule was violated (sentinel removal, unknown
    /// handler name, double propagation).
    #[error("pipeline violation: {0}")]
    PipelineViolation(String),

    /// The handler context was removed from the pipeline and refuses to
    /// propagate further events.
    #[error("handler has been removed from the pipeline")]
    HandlerRemoved,
}

impl Error {
    /// True when the error is fatal for the connection as a whole and must
    /// feed the inactive/reconnect path rather than a single pending call.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::TransportIo(_) | Error::CodecDecode(_))
    }

    /// True for lifecycle misuse errors, which never change connection state.
    pub fn is_lifecycle_misuse(&self) -> bool {
        matches!(
            self,
            Error::AlreadyConnected | Error::AlreadyInProgress | Error::Closing | Error::NotActive
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_connection_fatal() {
        let err = Error::from(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        assert!(err.is_connection_fatal());
        assert!(!err.is_lifecycle_misuse());
    }

    #[test]
    fn per_call_errors_are_not_fatal() {
        assert!(!Error::Timeout.is_connection_fatal());
        assert!(!Error::Remote {
            name: "org.freedesktop.DBus.Error.UnknownMethod".into(),
            message: String::new(),
            body: Vec::new(),
        }
        .is_connection_fatal());
    }

    #[test]
    fn lifecycle_misuse_is_classified() {
        assert!(Error::AlreadyInProgress.is_lifecycle_misuse());
        assert!(Error::NotActive.is_lifecycle_misuse());
        assert!(!Error::Closed.is_lifecycle_misuse());
    }

    #[test]
    fn remote_error_preserves_name_verbatim() {
        let err = Error::Remote {
            name: "com.example.Custom.Error".into(),
            message: "boom".into(),
            body: Vec::new(),
        };
        assert_eq!(
            err.to_string(),
            "remote error com.example.Custom.Error: boom"
        );
    }
}
