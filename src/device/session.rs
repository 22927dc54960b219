use super::DeviceEvent;
use crate::error::{ErrorKind, LabError, LabResult};
use crate::protocol::{convert, ScpiClient};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// One entry from the instrument's `SYST:ERR?` queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentError {
    pub code: i32,
    pub message: String,
}

impl InstrumentError {
    /// Parse `-113,"Undefined header"` style replies.
    pub fn parse(reply: &str) -> LabResult<Self> {
        let (code, message) = reply
            .split_once(',')
            .ok_or_else(|| LabError::invalid_response(reply, "malformed error queue entry"))?;
        Ok(Self {
            code: convert::<i32>(code)?,
            message: message.trim().trim_matches('"').to_string(),
        })
    }
}

/// Shared plumbing for SCPI device façades.
///
/// Wraps a [`ScpiClient`] with a device name, the device event channel, and
/// the common IEEE-488.2 initialization sequence.
pub struct ScpiSession {
    name: String,
    client: ScpiClient,
    events: broadcast::Sender<DeviceEvent>,
    forwarding: AtomicBool,
}

impl ScpiSession {
    pub fn new(name: impl Into<String>, client: ScpiClient) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            name: name.into(),
            client,
            events,
            forwarding: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &ScpiClient {
        &self.client
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub async fn connect(&self) -> LabResult<()> {
        self.start_forwarding();
        tracing::info!(device = %self.name, path = %self.client.path(), "Connecting");
        self.client.connect().await.map_err(|err| self.report(err))
    }

    pub async fn disconnect(&self) {
        self.client.disconnect().await;
    }

    /// Identify the instrument and clear its status registers.
    pub async fn initialize(&self) -> LabResult<()> {
        if !self.client.is_connected().await {
            return Err(self.report(LabError::not_connected(format!(
                "{} must be connected before initialization",
                self.name
            ))));
        }

        let result = async {
            let idn = self.client.identify().await?;
            self.client.send_command("*CLS").await?;
            Ok::<_, LabError>(idn)
        }
        .await;

        match result {
            Ok(idn) => {
                self.client.set_initialized(true);
                tracing::info!(device = %self.name, idn = %idn, "Device initialized");
                Ok(())
            }
            Err(err) => {
                self.client.set_initialized(false);
                Err(self.report(err.wrap(
                    ErrorKind::InitializationFailed,
                    format!("{} failed to initialize", self.name),
                )))
            }
        }
    }

    /// Fail fast when the session is not ready for instrument I/O.
    pub fn ensure_initialized(&self) -> LabResult<()> {
        if self.client.is_initialized() {
            Ok(())
        } else {
            Err(self.report(LabError::not_initialized(format!(
                "{} is not initialized",
                self.name
            ))))
        }
    }

    /// Reclassify an I/O failure as `kind`, publish it, and hand it back.
    pub fn fail(&self, err: LabError, kind: ErrorKind, what: &str) -> LabError {
        self.report(err.wrap(kind, format!("{} {} failed", self.name, what)))
    }

    /// Pop one entry from the instrument error queue; `None` when it is empty.
    pub async fn next_error(&self) -> LabResult<Option<InstrumentError>> {
        self.ensure_initialized()?;
        let reply = self
            .client
            .query("SYST:ERR?")
            .await
            .map_err(|err| self.fail(err, ErrorKind::Device, "error queue read"))?;
        let entry = InstrumentError::parse(&reply)?;
        Ok((entry.code != 0).then_some(entry))
    }

    pub fn report(&self, err: LabError) -> LabError {
        tracing::warn!(device = %self.name, error = %err, "Device operation failed");
        let _ = self.events.send(DeviceEvent::Error(err.clone()));
        err
    }

    /// Relay transport connection changes onto the device event channel.
    fn start_forwarding(&self) {
        if self.forwarding.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut transport_events = self.client.subscribe();
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                match transport_events.recv().await {
                    Ok(event) => {
                        let _ = events.send(DeviceEvent::ConnectionChanged {
                            connected: event.connected,
                            message: event.message,
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
