//! Error handling for dashlink.
//!
//! Errors carry a gRPC-style [`ErrorKind`] next to the underlying cause, so
//! callers can decide on a policy (retry, drop, report) without matching on
//! concrete error types.
//!
//! # Policy by layer
//!
//! * Transport failures (connect, send, receive) are retried or escalated to
//!   the link supervisor and never leave it.
//! * Decode failures of inbound frames are logged and dropped.
//! * Handler failures become `{success: false, message}` responses.
//!
//! # Example
//!
//! ```rust
//! use dashlink::error::{Error, ErrorKind, Result};
//!
//! fn check(query: &str) -> Result<()> {
//!     if query.is_empty() {
//!         return Err(Error::invalid_argument("query is empty"));
//!     }
//!     Ok(())
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

/// Standard result type for dashlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories based on gRPC status codes.
///
/// See [gRPC status codes](https://github.com/googleapis/googleapis/blob/master/google/rpc/code.proto)
/// for the original definitions.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    #[error("operation was cancelled")]
    Cancelled = 1,

    #[error("unknown error")]
    Unknown = 2,

    #[error("invalid argument specified")]
    InvalidArgument = 3,

    #[error("operation timed out")]
    DeadlineExceeded = 4,

    #[error("not found")]
    NotFound = 5,

    #[error("attempt to create what already exists")]
    AlreadyExists = 6,

    #[error("permission denied")]
    PermissionDenied = 7,

    #[error("resource has been exhausted")]
    ResourceExhausted = 8,

    #[error("invalid state")]
    FailedPrecondition = 9,

    #[error("operation aborted")]
    Aborted = 10,

    #[error("out of range")]
    OutOfRange = 11,

    #[error("not implemented")]
    Unimplemented = 12,

    #[error("internal error")]
    Internal = 13,

    #[error("service unavailable")]
    Unavailable = 14,

    #[error("unrecoverable data loss or corruption")]
    DataLoss = 15,

    #[error("no valid authentication credentials")]
    Unauthenticated = 16,
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Returns the underlying error message without the kind prefix.
    ///
    /// Used where the message is shown to dashboard users, who care about
    /// "no tracks found" and not about gRPC categories.
    #[must_use]
    pub fn message(&self) -> String {
        self.error.to_string()
    }
}

macro_rules! constructors {
    ($($(#[$doc:meta])* $name:ident => $kind:ident,)*) => {
        impl Error {
            $(
                $(#[$doc])*
                pub fn $name<E>(error: E) -> Self
                where
                    E: Into<Box<dyn std::error::Error + Send + Sync>>,
                {
                    Self::new(ErrorKind::$kind, error)
                }
            )*
        }
    };
}

constructors! {
    /// Interrupted mid-operation, e.g. a connection reset.
    aborted => Aborted,
    already_exists => AlreadyExists,
    /// Cancelled before completion, e.g. the remote closed the link.
    cancelled => Cancelled,
    /// Loss or corruption of data in transit.
    data_loss => DataLoss,
    deadline_exceeded => DeadlineExceeded,
    /// The system is not in a state the operation needs.
    failed_precondition => FailedPrecondition,
    internal => Internal,
    invalid_argument => InvalidArgument,
    not_found => NotFound,
    out_of_range => OutOfRange,
    permission_denied => PermissionDenied,
    resource_exhausted => ResourceExhausted,
    /// Missing or rejected credentials, e.g. a wrong API token.
    unauthenticated => Unauthenticated,
    /// Transient failure; retrying may help.
    unavailable => Unavailable,
    unimplemented => Unimplemented,
    unknown => Unknown,
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error as `"{kind}: {details}"`.
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts IO errors into appropriate error kinds.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::permission_denied(err),
            AddrInUse | AlreadyExists => Self::already_exists(err),
            AddrNotAvailable | ConnectionRefused | NotConnected => Self::unavailable(err),
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::aborted(err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof => Self::data_loss(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            WriteZero => Self::resource_exhausted(err),
            _ => Self::unknown(err),
        }
    }
}

/// Converts WebSocket errors into appropriate error kinds.
///
/// A rejected handshake (for example a wrong `x-api-token`) surfaces as an
/// HTTP response error and maps to `Unauthenticated` or `PermissionDenied`
/// when the status says so.
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error::*;
        let status = match &err {
            Http(response) => Some(response.status()),
            _ => None,
        };

        match err {
            ConnectionClosed => Self::cancelled(err),
            AlreadyClosed => Self::unavailable(err),
            Io(err) => Self::from(err),
            Http(_) => match status {
                Some(http::StatusCode::UNAUTHORIZED) => Self::unauthenticated(err),
                Some(http::StatusCode::FORBIDDEN) => Self::permission_denied(err),
                _ => Self::unavailable(err),
            },
            Capacity(err) => Self::out_of_range(err),
            Utf8 { .. } => Self::invalid_argument(err),
            WriteBufferFull { .. } => Self::resource_exhausted(err),
            AttackAttempt => Self::permission_denied(err),
            _ => Self::unknown(err),
        }
    }
}

/// Converts HTTP client errors into appropriate error kinds.
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_body() {
            return Self::data_loss(err);
        }

        if err.is_decode() {
            return Self::invalid_argument(err);
        }

        if err.is_builder() {
            return Self::internal(err);
        }

        if err.is_connect() {
            return Self::unavailable(err);
        }

        if err.is_timeout() {
            return Self::deadline_exceeded(err);
        }

        if let Some(status) = err.status() {
            return match status {
                reqwest::StatusCode::UNAUTHORIZED => Self::unauthenticated(err),
                reqwest::StatusCode::FORBIDDEN => Self::permission_denied(err),
                reqwest::StatusCode::TOO_MANY_REQUESTS => Self::resource_exhausted(err),
                _ => Self::failed_precondition(err),
            };
        }

        Self::unknown(err)
    }
}

/// Converts JSON errors through IO error mapping.
///
/// Syntax and EOF errors become `InvalidArgument`/`DataLoss` respectively.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        std::io::Error::from(err).into()
    }
}

/// Converts secrets file parsing errors to `InvalidArgument`.
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts invalid header errors to `InvalidArgument`.
impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

/// Converts URL parsing errors to `Internal`.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts formatting errors to `Unknown`.
impl From<std::fmt::Error> for Error {
    fn from(e: std::fmt::Error) -> Self {
        Self::unknown(e.to_string())
    }
}

/// Converts timeout errors to `DeadlineExceeded`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_kind() {
        let err = Error::failed_precondition("nothing is playing");
        assert_eq!(err.to_string(), "invalid state: nothing is playing");
        assert_eq!(err.message(), "nothing is playing");
    }

    #[test]
    fn malformed_json_is_invalid_argument() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn truncated_json_is_data_loss() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{\"action\":")
            .unwrap_err()
            .into();
        assert_eq!(err.kind, ErrorKind::DataLoss);
    }

    #[test]
    fn refused_connection_is_unavailable() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        let err = Error::from(tokio_tungstenite::tungstenite::Error::Io(io));
        assert_eq!(err.kind, ErrorKind::Unavailable);
    }
}
