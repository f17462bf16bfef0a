//! Service-level error kinds and the per-kind session policy.
//!
//! Every failure surfaced to a client maps onto one of these kinds; the
//! kind decides whether the session survives the error frame.

use std::fmt;

/// Classification of every error a session can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or missing bearer token.
    Unauthenticated,
    /// Authenticated, but not a member of the target room.
    Forbidden,
    /// Room or file no longer exists.
    NotFound,
    /// Write lost to a concurrent conflicting write (e.g. duplicate file
    /// name).
    Conflict,
    /// Store timeout or connection failure after retries.
    Transient,
    /// Malformed frame; closes the session.
    ProtocolViolation,
    /// Well-formed frame in the wrong session state; dropped with a reply.
    InvalidState,
    /// Peer outbound queue full.
    Overloaded,
}

impl ErrorKind {
    /// Stable wire code for the `error` frame.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::ProtocolViolation => "protocol-violation",
            ErrorKind::InvalidState => "invalid-state",
            ErrorKind::Overloaded => "overloaded",
        }
    }

    /// Whether the session is closed after sending the error frame.
    ///
    /// Forbidden/NotFound/Transient keep the connection; a rejected token or
    /// a malformed frame terminates it. Overload is handled by the hub
    /// (drop or disconnect per frame class), never by blocking.
    pub fn closes_session(&self) -> bool {
        matches!(
            self,
            ErrorKind::Unauthenticated | ErrorKind::ProtocolViolation
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// An error kind plus a human-readable message, ready to serialize.
#[derive(Debug, Clone)]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthenticated, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolViolation, message)
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ServiceError {}
