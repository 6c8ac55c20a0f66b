//! Error types and result handling for hixie.
//!
//! Errors are split by the stage of a connection's life in which they occur:
//!
//! - [`ChallengeError`]: a `Sec-WebSocket-Key1`/`Key2` header that does not
//!   encode a valid draft-76 challenge number.
//! - [`HandshakeError`]: the upgrade request was rejected. Every variant maps
//!   to an HTTP status through [`HandshakeError::status`].
//! - [`Error`]: everything else, from socket failures to framing violations
//!   and registry misuse.
//!
//! Handshake errors end the offending socket only. Errors raised after the
//! upgrade are handled inside the connection worker and never reach the
//! accept loop.
//!
//! # Examples
//!
//! ```
//! use hixie_core::error::{ChallengeError, HandshakeError};
//! use http::StatusCode;
//!
//! let err = HandshakeError::from(ChallengeError::NoSpaces);
//! assert_eq!(err.status(), StatusCode::BAD_REQUEST);
//! ```

use http::StatusCode;
use std::fmt;
use thiserror::Error;

/// A malformed `Sec-WebSocket-Key1` or `Sec-WebSocket-Key2` value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChallengeError {
    /// The key contains no space characters, so there is nothing to divide by.
    #[error("number of spaces is zero")]
    NoSpaces,

    /// The digits of the key concatenate to zero.
    #[error("number is zero")]
    ZeroValue,

    /// The key carries no digits at all.
    #[error("key contains no digits")]
    NotNumeric,

    /// The digit value is not an exact multiple of the space count.
    #[error("number {value} is not divisible by {spaces} spaces")]
    NotDivisible {
        /// Concatenated digit value
        value: u64,
        /// Number of spaces found in the key
        spaces: u64,
    },

    /// The digit value, or the quotient, does not fit the 32-bit wire field.
    #[error("key number out of range")]
    OutOfRange,
}

/// Reasons an upgrade request is refused.
///
/// # Examples
///
/// ```
/// use hixie_core::error::HandshakeError;
/// use http::StatusCode;
///
/// let err = HandshakeError::Unsupported("websocket".to_string());
/// assert_eq!(err.status(), StatusCode::NOT_IMPLEMENTED);
/// ```
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Missing or incorrect headers, a bad challenge key, or a truncated body.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The client asked for an upgrade protocol other than draft-76 `WebSocket`.
    #[error("unsupported upgrade: {0}")]
    Unsupported(String),

    /// The request method was not `GET`.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// The socket failed while the handshake was in progress.
    #[error("IO error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// Creates a [`HandshakeError::BadRequest`] with the given reason.
    pub fn bad_request<T: fmt::Display>(reason: T) -> Self {
        HandshakeError::BadRequest(reason.to_string())
    }

    /// The HTTP status written back to the client for this error.
    ///
    /// I/O failures have no meaningful response, since the socket is
    /// usually gone; they report `500` for completeness.
    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HandshakeError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            HandshakeError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            HandshakeError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ChallengeError> for HandshakeError {
    fn from(err: ChallengeError) -> Self {
        HandshakeError::BadRequest(format!("invalid challenge key: {}", err))
    }
}

/// The main error type for hixie operations.
///
/// # Examples
///
/// ```
/// use hixie_core::prelude::*;
///
/// # async fn example(conn: std::sync::Arc<Connection>) {
/// match conn.write_message("hello").await {
///     Ok(()) => {}
///     Err(Error::Io(e)) => eprintln!("peer went away: {}", e),
///     Err(e) => eprintln!("write failed: {}", e),
/// }
/// # }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error from [`Connection::write_json`](crate::Connection::write_json).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The upgrade handshake failed.
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// An inbound text frame grew past the configured limit.
    #[error("Frame exceeds {limit} bytes")]
    FrameTooLarge {
        /// The configured maximum payload length
        limit: usize,
    },

    /// An inbound text frame was not valid UTF-8.
    #[error("Frame payload is not valid UTF-8")]
    InvalidUtf8,

    /// A write was attempted on a connection that is closing or closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A write did not complete within the configured write timeout.
    #[error("Write timed out")]
    WriteTimeout,

    /// The connection id is already present in the registry.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(String),

    /// The registry refuses new connections after shutdown.
    #[error("Server is shutting down")]
    ShuttingDown,

    /// The listen address could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Custom application-defined error.
    #[error("Custom error: {0}")]
    Custom(String),
}

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a custom error with the given message.
    ///
    /// # Examples
    ///
    /// ```
    /// use hixie_core::prelude::*;
    ///
    /// let err = Error::custom("room is full");
    /// assert_eq!(err.to_string(), "Custom error: room is full");
    /// ```
    pub fn custom<T: fmt::Display>(msg: T) -> Self {
        Error::Custom(msg.to_string())
    }

    /// Whether this error means the peer is gone rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionClosed | Error::WriteTimeout
        )
    }
}
