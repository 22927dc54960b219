//! Byte-stream transports for SCPI instruments.
//!
//! A [`Transport`] is a connect/disconnect-able byte pipe with timed send and
//! timed receive. It knows nothing about commands or queries; the
//! [`protocol`](crate::protocol) layer builds those on top.
//!
//! # End-of-message detection
//!
//! Neither TCP nor a serial line frames messages. Every SCPI message, including
//! bulk curve data, ends with the line terminator, so a read whose *last* byte
//! is the terminator (or a zero-length read) is treated as end-of-message. A
//! short read that does not end in the terminator means more data is coming.
//! Some instruments fragment one response across several packets, so this
//! heuristic matters.
//!
//! # Implementations
//!
//! - [`TcpTransport`]: raw socket (`tcp://host:port`)
//! - [`SerialTransport`]: RS-232 / USB-serial via `tokio-serial` (feature `serial`)
//! - [`MockTransport`]: scripted stub for tests and offline use

use crate::error::LabResult;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp;

pub use mock::{MockHandle, MockTransport};
#[cfg(feature = "serial")]
pub use serial::{SerialSettings, SerialTransport};
pub use tcp::TcpTransport;

/// Default timeout for a single transport operation.
pub const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_millis(500);

/// Line feed, the SCPI message terminator.
pub const LINE_FEED: u8 = b'\n';

/// Result of one `receive` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Number of bytes written into the caller's buffer
    pub bytes_read: usize,
    /// Whether the response is complete
    pub is_end_of_message: bool,
}

impl ReadOutcome {
    /// Classify a chunk with the terminator heuristic described in the module docs.
    pub fn from_chunk(chunk: &[u8], terminator: u8) -> Self {
        Self {
            bytes_read: chunk.len(),
            is_end_of_message: chunk.last().map_or(true, |&last| last == terminator),
        }
    }
}

/// Connection-status notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Transport path, e.g. `tcp://192.168.1.20:5025`
    pub path: String,
    /// Connection state after the change
    pub connected: bool,
    /// Human-readable reason
    pub message: String,
}

/// Async byte-stream connection to one instrument.
///
/// Implementations must make [`close`](Transport::close) idempotent and
/// infallible, and must fail `send`/`receive` with `NotConnected` while closed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable identifier for logs and notifications.
    fn path(&self) -> String;

    fn is_open(&self) -> bool;

    /// Open the connection, failing with `Timeout` or `ConnectionFailed`.
    async fn open(&mut self, timeout: Duration) -> LabResult<()>;

    /// Close the connection. No-op when already closed.
    async fn close(&mut self);

    /// Write all of `data` within `timeout`.
    async fn send(&mut self, data: &[u8], timeout: Duration) -> LabResult<()>;

    /// Read at most `buf.len()` bytes within `timeout`.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> LabResult<ReadOutcome>;

    /// Discard any stale input. Returns the number of bytes dropped.
    async fn clear_input(&mut self) -> LabResult<usize> {
        Ok(0)
    }

    /// Subscribe to connection-status notifications.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// Shared helper for transports: publish a status change, ignoring the
/// no-subscriber case.
pub(crate) fn notify(
    events: &broadcast::Sender<ConnectionEvent>,
    path: &str,
    connected: bool,
    message: impl Into<String>,
) {
    let _ = events.send(ConnectionEvent {
        path: path.to_string(),
        connected,
        message: message.into(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminator_ends_message() {
        let outcome = ReadOutcome::from_chunk(b"12.345\n", LINE_FEED);
        assert_eq!(outcome.bytes_read, 7);
        assert!(outcome.is_end_of_message);
    }

    #[test]
    fn test_short_read_without_terminator_continues() {
        let outcome = ReadOutcome::from_chunk(b"AB", LINE_FEED);
        assert_eq!(outcome.bytes_read, 2);
        assert!(!outcome.is_end_of_message);
    }

    #[test]
    fn test_terminator_in_middle_does_not_end_message() {
        let outcome = ReadOutcome::from_chunk(b"A\nB", LINE_FEED);
        assert!(!outcome.is_end_of_message);
    }

    #[test]
    fn test_zero_length_read_ends_message() {
        let outcome = ReadOutcome::from_chunk(b"", LINE_FEED);
        assert_eq!(outcome.bytes_read, 0);
        assert!(outcome.is_end_of_message);
    }
}
