//! Raw TCP socket transport (SCPI-RAW, typically port 5025).

use super::{notify, ConnectionEvent, ReadOutcome, Transport, LINE_FEED};
use crate::error::{LabError, LabResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Default SCPI raw-socket port.
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// TCP transport for LAN instruments.
pub struct TcpTransport {
    host: String,
    port: u16,
    path: String,
    stream: Option<TcpStream>,
    terminator: u8,
    events: broadcast::Sender<ConnectionEvent>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let path = format!("tcp://{}:{}", host, port);
        let (events, _) = broadcast::channel(16);
        Self {
            host,
            port,
            path,
            stream: None,
            terminator: LINE_FEED,
            events,
        }
    }

    /// Override the byte that marks end-of-message (default `\n`).
    pub fn with_terminator(mut self, terminator: u8) -> Self {
        self.terminator = terminator;
        self
    }

    fn stream_mut(&mut self) -> LabResult<&mut TcpStream> {
        let path = &self.path;
        self.stream
            .as_mut()
            .ok_or_else(|| LabError::not_connected(format!("{} is not open", path)))
    }

    /// Drop the socket after an I/O failure that means the peer is gone.
    fn fail_connection(&mut self, err: &LabError) {
        if err.is_connection_loss() && self.stream.take().is_some() {
            tracing::warn!(path = %self.path, error = %err, "TCP connection lost");
            notify(&self.events, &self.path, false, err.to_string());
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn path(&self) -> String {
        self.path.clone()
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn open(&mut self, open_timeout: Duration) -> LabResult<()> {
        // Reopening replaces any previous socket
        self.stream = None;

        tracing::info!(path = %self.path, "Opening TCP connection");
        let addr = format!("{}:{}", self.host, self.port);
        let stream = match timeout(open_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let err = LabError::connection_failed(format!("failed to connect to {}", self.path))
                    .with_source(e);
                notify(&self.events, &self.path, false, err.to_string());
                return Err(err);
            }
            Err(_) => {
                let err = LabError::timeout(format!(
                    "connection to {} timed out after {:?}",
                    self.path, open_timeout
                ));
                notify(&self.events, &self.path, false, err.to_string());
                return Err(err);
            }
        };

        // Disable Nagle's algorithm; SCPI traffic is many tiny writes
        stream.set_nodelay(true)?;

        self.stream = Some(stream);
        tracing::info!(path = %self.path, "TCP connection established");
        notify(&self.events, &self.path, true, "TCP connection established");
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            tracing::info!(path = %self.path, "TCP connection closed");
            notify(&self.events, &self.path, false, "TCP connection closed");
        }
    }

    async fn send(&mut self, data: &[u8], send_timeout: Duration) -> LabResult<()> {
        let stream = self.stream_mut()?;
        let result = match timeout(send_timeout, stream.write_all(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LabError::from(e)),
            Err(_) => Err(LabError::timeout("write to the device timed out")),
        };
        if let Err(err) = &result {
            self.fail_connection(err);
        }
        result
    }

    async fn receive(&mut self, buf: &mut [u8], read_timeout: Duration) -> LabResult<ReadOutcome> {
        let terminator = self.terminator;
        let stream = self.stream_mut()?;
        let result = match timeout(read_timeout, stream.read(buf)).await {
            Ok(Ok(n)) => Ok(ReadOutcome::from_chunk(&buf[..n], terminator)),
            Ok(Err(e)) => Err(LabError::from(e)),
            Err(_) => Err(LabError::timeout("reading from the device timed out")),
        };
        match &result {
            Err(err) => self.fail_connection(err),
            // Orderly shutdown by the peer: this read still ends the message
            Ok(outcome) if outcome.bytes_read == 0 && !buf.is_empty() => {
                if self.stream.take().is_some() {
                    tracing::warn!(path = %self.path, "TCP peer closed the connection");
                    notify(&self.events, &self.path, false, "peer closed the connection");
                }
            }
            Ok(_) => {}
        }
        result
    }

    async fn clear_input(&mut self) -> LabResult<usize> {
        let stream = self.stream_mut()?;
        let mut discard = [0u8; 4096];
        let mut total = 0usize;
        loop {
            match stream.try_read(&mut discard) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        if total > 0 {
            tracing::debug!(path = %self.path, bytes = total, "Discarded stale input");
        }
        Ok(total)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}
