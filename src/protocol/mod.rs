//! SCPI command/query framing on top of a [`Transport`].
//!
//! [`ScpiClient`] owns one transport and serialises access to it: a query
//! holds the transport for the whole write-then-read round trip so responses
//! can never interleave. Commands get the configured terminator appended;
//! queries must end in `?` and are rejected before any I/O otherwise.
//!
//! Responses are read in fixed-size chunks until the transport reports
//! end-of-message (see [`crate::transport`]), concatenated, and stripped of
//! trailing CR/LF. [`ScpiClient::query_typed`] converts the text through the
//! single dispatch point in [`convert`].

mod convert;

pub use convert::{convert, FromScpi, ScpiEnum};

use crate::error::{LabError, LabResult};
use crate::transport::{ConnectionEvent, Transport, DEFAULT_TRANSPORT_TIMEOUT};
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

/// Default overall deadline for one query round trip.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Chunk size for ordinary text responses.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 128;
/// Chunk size for bulk transfers such as curve data.
pub const DEFAULT_BULK_CHUNK_SIZE: usize = 1024;

/// Timing and framing options for a [`ScpiClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolOptions {
    /// Appended to commands that do not already end with it
    pub terminator: String,
    /// Timeout for opening the transport and for writes
    pub transport_timeout: Duration,
    /// Overall deadline for a query (write plus every chunked read)
    pub query_timeout: Duration,
    pub read_chunk_size: usize,
    pub bulk_chunk_size: usize,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            terminator: "\n".to_string(),
            transport_timeout: DEFAULT_TRANSPORT_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            bulk_chunk_size: DEFAULT_BULK_CHUNK_SIZE,
        }
    }
}

/// Async SCPI client bound to one transport.
pub struct ScpiClient {
    transport: Mutex<Box<dyn Transport>>,
    path: String,
    options: ProtocolOptions,
    initialized: AtomicBool,
    events: broadcast::Receiver<ConnectionEvent>,
}

impl ScpiClient {
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self::with_options(transport, ProtocolOptions::default())
    }

    pub fn with_options<T: Transport + 'static>(transport: T, options: ProtocolOptions) -> Self {
        Self::from_boxed(Box::new(transport), options)
    }

    pub fn from_boxed(transport: Box<dyn Transport>, options: ProtocolOptions) -> Self {
        let path = transport.path();
        let events = transport.subscribe();
        Self {
            transport: Mutex::new(transport),
            path,
            options,
            initialized: AtomicBool::new(false),
            events,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn options(&self) -> &ProtocolOptions {
        &self.options
    }

    /// Connection-status notifications from the underlying transport.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.resubscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_open()
    }

    /// Whether the session has been initialized since it was last opened.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Record the outcome of a device-level initialization sequence.
    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::Release);
    }

    /// Open the transport. A fresh session always starts uninitialized.
    pub async fn connect(&self) -> LabResult<()> {
        let mut transport = self.transport.lock().await;
        self.set_initialized(false);
        transport.open(self.options.transport_timeout).await
    }

    pub async fn disconnect(&self) {
        let mut transport = self.transport.lock().await;
        self.set_initialized(false);
        transport.close().await;
    }

    /// Send a command that produces no response.
    pub async fn send_command(&self, command: &str) -> LabResult<()> {
        let mut transport = self.transport.lock().await;
        self.write_locked(transport.as_mut(), command).await
    }

    /// Send a query and return the response text with trailing CR/LF removed.
    pub async fn query(&self, query: &str) -> LabResult<String> {
        self.query_with_timeout(query, self.options.query_timeout)
            .await
    }

    /// [`query`](Self::query) with an explicit overall deadline.
    pub async fn query_with_timeout(&self, query: &str, timeout: Duration) -> LabResult<String> {
        validate_query(query)?;

        let mut transport = self.transport.lock().await;
        let deadline = Instant::now() + timeout;

        let stale = transport.clear_input().await.unwrap_or(0);
        if stale > 0 {
            tracing::debug!(path = %self.path, bytes = stale, "Dropped stale input before query");
        }

        self.write_locked(transport.as_mut(), query).await?;
        let raw = self
            .read_locked(transport.as_mut(), self.options.read_chunk_size, deadline)
            .await
            .map_err(|err| self.observe(err))?;

        let response = decode_line(&raw);
        tracing::debug!(path = %self.path, query, response = %response, "SCPI query");
        Ok(response)
    }

    /// Query and convert the response to `T`.
    ///
    /// ```rust
    /// use labmon::protocol::ScpiClient;
    /// use labmon::transport::MockTransport;
    ///
    /// # tokio_test::block_on(async {
    /// let transport = MockTransport::new();
    /// transport.handle().push_response("12.345");
    /// let client = ScpiClient::new(transport);
    /// client.connect().await.unwrap();
    ///
    /// let volts: f64 = client.query_typed("MEAS:VOLT?").await.unwrap();
    /// assert_eq!(volts, 12.345);
    /// # });
    /// ```
    pub async fn query_typed<T: FromScpi>(&self, query: &str) -> LabResult<T> {
        let response = self.query(query).await?;
        convert(&response)
    }

    /// `*IDN?` identification string.
    pub async fn identify(&self) -> LabResult<String> {
        self.query("*IDN?").await
    }

    /// Read one pending text response without sending anything.
    pub async fn read_string(&self) -> LabResult<String> {
        let mut transport = self.transport.lock().await;
        let deadline = Instant::now() + self.options.query_timeout;
        let raw = self
            .read_locked(transport.as_mut(), self.options.read_chunk_size, deadline)
            .await
            .map_err(|err| self.observe(err))?;
        Ok(decode_line(&raw))
    }

    /// Read one pending response as raw bytes, using the bulk chunk size.
    ///
    /// Nothing is trimmed; binary block data may legitimately end in CR/LF.
    pub async fn read_bytes(&self) -> LabResult<Vec<u8>> {
        let mut transport = self.transport.lock().await;
        let deadline = Instant::now() + self.options.query_timeout;
        let raw = self
            .read_locked(transport.as_mut(), self.options.bulk_chunk_size, deadline)
            .await
            .map_err(|err| self.observe(err))?;
        Ok(raw.to_vec())
    }

    async fn write_locked(&self, transport: &mut dyn Transport, command: &str) -> LabResult<()> {
        if !transport.is_open() {
            self.set_initialized(false);
            return Err(LabError::not_connected(format!(
                "cannot send '{}': {} is not connected",
                command, self.path
            )));
        }

        let mut framed = String::with_capacity(command.len() + self.options.terminator.len());
        framed.push_str(command);
        if !command.ends_with(self.options.terminator.as_str()) {
            framed.push_str(&self.options.terminator);
        }

        tracing::trace!(path = %self.path, command, "SCPI write");
        transport
            .send(framed.as_bytes(), self.options.transport_timeout)
            .await
            .map_err(|err| self.observe(err))
    }

    /// Successive chunked reads until end-of-message or an empty read.
    async fn read_locked(
        &self,
        transport: &mut dyn Transport,
        chunk_size: usize,
        deadline: Instant,
    ) -> LabResult<BytesMut> {
        let mut response = BytesMut::with_capacity(chunk_size);
        let mut chunk = vec![0u8; chunk_size.max(1)];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(LabError::timeout(format!(
                    "no complete response from {} before the deadline",
                    self.path
                )));
            }

            let outcome = transport.receive(&mut chunk, remaining).await?;
            if outcome.bytes_read == 0 && !transport.is_open() {
                self.set_initialized(false);
            }
            response.extend_from_slice(&chunk[..outcome.bytes_read]);
            if outcome.is_end_of_message || outcome.bytes_read == 0 {
                return Ok(response);
            }
        }
    }

    /// A lost connection also invalidates the session.
    fn observe(&self, err: LabError) -> LabError {
        if err.is_connection_loss() {
            self.set_initialized(false);
        }
        err
    }
}

fn validate_query(query: &str) -> LabResult<()> {
    if query.trim_end().ends_with('?') {
        Ok(())
    } else {
        Err(LabError::invalid_command(format!(
            "query '{}' must end with '?'",
            query
        )))
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}
