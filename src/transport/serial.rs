//! Serial-port transport (RS-232 / USB-serial) built on `tokio-serial`.
//!
//! Opening a port touches the OS device synchronously, so it runs on the
//! blocking pool. Standard settings are applied: 8 data bits, no parity, one
//! stop bit, no flow control, configurable baud rate.

use super::{notify, ConnectionEvent, ReadOutcome, Transport, LINE_FEED};
use crate::error::{LabError, LabResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_serial::SerialStream;

/// How long `clear_input` keeps draining before giving up.
const DRAIN_WINDOW: Duration = Duration::from_millis(50);

fn default_baud_rate() -> u32 {
    9600
}

/// Port settings for [`SerialTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`
    pub path: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

impl SerialSettings {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

/// Serial transport for RS-232 instruments.
pub struct SerialTransport {
    settings: SerialSettings,
    port: Option<SerialStream>,
    terminator: u8,
    events: broadcast::Sender<ConnectionEvent>,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            settings,
            port: None,
            terminator: LINE_FEED,
            events,
        }
    }

    pub fn with_terminator(mut self, terminator: u8) -> Self {
        self.terminator = terminator;
        self
    }

    fn port_mut(&mut self) -> LabResult<&mut SerialStream> {
        let path = &self.settings.path;
        self.port
            .as_mut()
            .ok_or_else(|| LabError::not_connected(format!("serial port {} is not open", path)))
    }
}

async fn open_serial_async(settings: &SerialSettings) -> LabResult<SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let path = settings.path.clone();
    let baud_rate = settings.baud_rate;

    tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                LabError::connection_failed(format!("failed to open serial port {}", path))
                    .with_source(e)
            })
    })
    .await
    .map_err(|e| LabError::connection_failed("serial open task failed").with_source(e))?
}

/// Read and discard whatever is immediately available.
async fn drain<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            // I/O error or nothing more within the window
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total
}

#[async_trait]
impl Transport for SerialTransport {
    fn path(&self) -> String {
        format!("serial://{}", self.settings.path)
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn open(&mut self, open_timeout: Duration) -> LabResult<()> {
        self.port = None;
        let path = self.path();
        tracing::info!(path = %path, baud = self.settings.baud_rate, "Opening serial port");

        let result = match timeout(open_timeout, open_serial_async(&self.settings)).await {
            Ok(result) => result,
            Err(_) => Err(LabError::timeout(format!(
                "opening {} timed out after {:?}",
                path, open_timeout
            ))),
        };

        match result {
            Ok(port) => {
                self.port = Some(port);
                notify(&self.events, &path, true, "serial connection established");
                Ok(())
            }
            Err(err) => {
                tracing::error!(path = %path, error = %err, "Serial open failed");
                notify(&self.events, &path, false, err.to_string());
                Err(err)
            }
        }
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            let path = self.path();
            tracing::info!(path = %path, "Serial port closed");
            notify(&self.events, &path, false, "serial connection closed");
        }
    }

    async fn send(&mut self, data: &[u8], send_timeout: Duration) -> LabResult<()> {
        let port = self.port_mut()?;
        match timeout(send_timeout, async {
            port.write_all(data).await?;
            port.flush().await
        })
        .await
        {
            Ok(result) => result.map_err(LabError::from),
            Err(_) => Err(LabError::timeout("write to the serial port timed out")),
        }
    }

    async fn receive(&mut self, buf: &mut [u8], read_timeout: Duration) -> LabResult<ReadOutcome> {
        let terminator = self.terminator;
        let port = self.port_mut()?;
        match timeout(read_timeout, port.read(buf)).await {
            Ok(Ok(n)) => Ok(ReadOutcome::from_chunk(&buf[..n], terminator)),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(LabError::timeout("reading from the serial port timed out")),
        }
    }

    async fn clear_input(&mut self) -> LabResult<usize> {
        let port = self.port_mut()?;
        let discarded = drain(port, DRAIN_WINDOW).await;
        if discarded > 0 {
            tracing::debug!(bytes = discarded, "Discarded stale serial input");
        }
        Ok(discarded)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}
