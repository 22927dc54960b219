//! Custom error types for the crate.
//!
//! Every fallible operation in `labmon` returns [`LabError`]. An error is a
//! [`ErrorKind`] (what went wrong, coarse enough to match on), a human-readable
//! message, and an optional underlying cause.
//!
//! ## Error Kinds
//!
//! - **`NotConnected`** / **`ConnectionFailed`**: the transport is closed or could
//!   not be opened.
//! - **`Timeout`**: a timed transport or protocol operation did not finish in time.
//!   Recoverable; distinct from cancellation.
//! - **`InvalidCommand`**: a command was rejected before any I/O, e.g. a query that
//!   does not end in `?`.
//! - **`InvalidResponse`**: the instrument answered with text that could not be
//!   converted. The offending substring is available through [`LabError::response`].
//! - **`NotInitialized`** / **`InitializationFailed`**: session state errors.
//! - **`Measurement`**: a device measurement call failed.
//! - **`Configuration`**: settings failed to load or validate.
//! - **`Device`**: any other instrument-side failure.
//! - **`Closed`**: the processing pipeline is no longer accepting samples.
//!
//! Causes are stored behind an `Arc` so that errors stay `Clone` and can be
//! broadcast on notification channels.

use std::sync::Arc;
use thiserror::Error;

/// Shared, type-erased underlying cause.
pub type ErrorSource = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias for results using the crate error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

/// Coarse classification of a [`LabError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotConnected,
    ConnectionFailed,
    Timeout,
    InvalidCommand,
    InvalidResponse,
    NotInitialized,
    InitializationFailed,
    Measurement,
    Configuration,
    Device,
    Closed,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::NotConnected => "not connected",
            ErrorKind::ConnectionFailed => "connection failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidCommand => "invalid command",
            ErrorKind::InvalidResponse => "invalid response",
            ErrorKind::NotInitialized => "not initialized",
            ErrorKind::InitializationFailed => "initialization failed",
            ErrorKind::Measurement => "measurement error",
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Device => "device error",
            ErrorKind::Closed => "closed",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type.
///
/// # Example
///
/// ```rust
/// use labmon::error::{ErrorKind, LabError};
///
/// let err = LabError::timeout("no reply to MEAS:VOLT?");
/// assert_eq!(err.kind(), ErrorKind::Timeout);
/// assert!(err.is_recoverable());
/// ```
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct LabError {
    kind: ErrorKind,
    message: String,
    response: Option<String>,
    #[source]
    source: Option<ErrorSource>,
}

impl LabError {
    /// Build an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            response: None,
            source: None,
        }
    }

    /// Attach an underlying cause.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// Attach an already shared cause (typically another `LabError`'s source).
    pub fn with_shared_source(mut self, source: ErrorSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotConnected, message)
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn invalid_command(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidCommand, message)
    }

    /// Conversion failure; `response` is the substring that failed to parse.
    pub fn invalid_response(response: impl Into<String>, message: impl Into<String>) -> Self {
        let response = response.into();
        let message = format!("{} (got '{}')", message.into(), response);
        Self {
            kind: ErrorKind::InvalidResponse,
            message,
            response: Some(response),
            source: None,
        }
    }

    pub fn not_initialized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotInitialized, message)
    }

    pub fn initialization_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InitializationFailed, message)
    }

    pub fn measurement(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Measurement, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Device, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Closed, message)
    }

    /// Re-classify this error, keeping the original as the cause.
    ///
    /// Used by device façades to report protocol failures as measurement or
    /// initialization errors without losing the transport-level detail.
    pub fn wrap(self, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message).with_source(self)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The offending response text for `InvalidResponse` errors.
    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    /// Walk the cause chain looking for a `LabError` of the given kind.
    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        if self.kind == kind {
            return true;
        }
        self.source
            .as_deref()
            .and_then(|cause| cause.downcast_ref::<LabError>())
            .is_some_and(|inner| inner.has_kind(kind))
    }

    /// Whether retrying the operation later can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self.kind,
            ErrorKind::Configuration | ErrorKind::InvalidCommand | ErrorKind::Closed
        )
    }

    /// Whether this error means the underlying session is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::NotConnected | ErrorKind::ConnectionFailed
        )
    }
}

impl From<std::io::Error> for LabError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match err.kind() {
            Io::TimedOut | Io::WouldBlock => ErrorKind::Timeout,
            Io::NotConnected
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::BrokenPipe
            | Io::UnexpectedEof => ErrorKind::NotConnected,
            Io::ConnectionRefused | Io::AddrNotAvailable => ErrorKind::ConnectionFailed,
            _ => ErrorKind::Device,
        };
        LabError::new(kind, err.to_string()).with_source(err)
    }
}

impl From<figment::Error> for LabError {
    fn from(err: figment::Error) -> Self {
        LabError::configuration(err.to_string()).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = LabError::not_connected("tcp://10.0.0.5:5025 is closed");
        assert_eq!(err.to_string(), "not connected: tcp://10.0.0.5:5025 is closed");
    }

    #[test]
    fn invalid_response_keeps_offending_text() {
        let err = LabError::invalid_response("12,x,3", "cannot parse element");
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
        assert_eq!(err.response(), Some("12,x,3"));
        assert!(err.message().contains("12,x,3"));
    }

    #[test]
    fn io_errors_map_to_kinds() {
        let timeout: LabError = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let reset: LabError = std::io::Error::from(std::io::ErrorKind::ConnectionReset).into();
        assert!(reset.is_connection_loss());

        let other: LabError = std::io::Error::other("boom").into();
        assert_eq!(other.kind(), ErrorKind::Device);
    }

    #[test]
    fn wrap_preserves_cause_chain() {
        let inner = LabError::timeout("MEAS:VOLT? timed out");
        let outer = inner.wrap(ErrorKind::Measurement, "voltage measurement failed");

        assert_eq!(outer.kind(), ErrorKind::Measurement);
        assert!(outer.has_kind(ErrorKind::Timeout));
        assert!(!outer.has_kind(ErrorKind::Configuration));
        assert!(std::error::Error::source(&outer).is_some());
    }

    #[test]
    fn recoverability() {
        assert!(LabError::timeout("t").is_recoverable());
        assert!(!LabError::configuration("bad").is_recoverable());
        assert!(!LabError::invalid_command("MEAS:VOLT").is_recoverable());
    }
}
