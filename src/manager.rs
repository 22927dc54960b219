//! Device monitoring manager.
//!
//! [`DeviceMonitor`] is the orchestration layer above the runners: it owns one
//! [`MeasurementRunner`] per registered device, remembers each device's
//! configured definitions so a restart measures the same things again, and
//! merges runner failures and connection changes from every device onto one
//! [`MonitorEvent`] stream tagged with the device id.
//!
//! All runners feed the same ingestion queue ([`SampleSender`]), so keys must
//! be unique across devices.

use crate::config::{DeviceKind, Settings, TransportConfig};
use crate::device::{Device, DeviceEvent, ScpiMultimeter, ScpiPowerSupply};
use crate::error::{ErrorKind, LabError, LabResult};
use crate::measurement::{MeasurementDefinition, MeasurementKey};
use crate::pipeline::SampleSender;
use crate::protocol::{ProtocolOptions, ScpiClient};
use crate::runner::{MeasurementRunner, RunnerEvent, DEFAULT_RUNNER_TICK};
use crate::transport::{TcpTransport, Transport, LINE_FEED};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Notification published by a [`DeviceMonitor`].
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A periodic measurement failed
    MeasurementError {
        device_id: String,
        key: MeasurementKey,
        error: LabError,
    },
    /// A device connected or lost its connection
    ConnectionChanged { device_id: String, connected: bool },
    /// A device reported an operation failure outside the measurement loop
    DeviceError { device_id: String, error: LabError },
}

/// Point-in-time view of one monitored device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub id: String,
    pub display_name: String,
    pub kind: DeviceKind,
    pub connected: bool,
    pub initialized: bool,
    pub measuring: bool,
    /// Definitions currently being polled
    pub definitions: Vec<MeasurementDefinition>,
}

struct MonitoredDevice {
    display_name: String,
    kind: DeviceKind,
    runner: Arc<MeasurementRunner>,
    configured: Arc<RwLock<Vec<MeasurementDefinition>>>,
    cancel: CancellationToken,
    forwarder: JoinHandle<()>,
}

/// Owns the devices being monitored and their runners.
pub struct DeviceMonitor {
    devices: RwLock<HashMap<String, MonitoredDevice>>,
    sink: SampleSender,
    tick: Duration,
    events: broadcast::Sender<MonitorEvent>,
}

impl DeviceMonitor {
    pub fn new(sink: SampleSender) -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            devices: RwLock::new(HashMap::new()),
            sink,
            tick: DEFAULT_RUNNER_TICK,
            events,
        }
    }

    /// Sweep tick handed to every runner created afterwards.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Build the power supplies and multimeters listed in `settings`.
    ///
    /// Devices are registered but not connected; call
    /// [`start_all`](Self::start_all) to begin measuring.
    pub fn from_settings(settings: &Settings, sink: SampleSender) -> LabResult<Self> {
        settings.validate()?;
        let monitor = Self::new(sink).with_tick(settings.io.runner_tick);
        let options = settings.protocol_options();

        for config in &settings.devices {
            let transport = build_transport(&config.transport, &options)?;
            let client = ScpiClient::from_boxed(transport, options.clone());
            let device: Arc<dyn Device> = match config.kind {
                DeviceKind::PowerSupply => Arc::new(ScpiPowerSupply::new(config.label(), client)),
                DeviceKind::Multimeter => Arc::new(ScpiMultimeter::new(config.label(), client)),
            };
            monitor.register_device(
                config.id.clone(),
                config.label(),
                config.kind,
                device,
                config.definitions(),
            )?;
        }

        tracing::info!(devices = settings.devices.len(), "Device monitor configured");
        Ok(monitor)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Add a device with the definitions it should measure once started.
    ///
    /// Fails with `Configuration` for an empty or already registered id.
    pub fn register_device(
        &self,
        id: impl Into<String>,
        display_name: impl Into<String>,
        kind: DeviceKind,
        device: Arc<dyn Device>,
        definitions: Vec<MeasurementDefinition>,
    ) -> LabResult<()> {
        let id = id.into();
        if id.is_empty() {
            return Err(LabError::configuration("device id must not be empty"));
        }

        let mut devices = self.devices.write();
        if devices.contains_key(&id) {
            return Err(LabError::configuration(format!(
                "device '{}' is already registered",
                id
            )));
        }

        let runner = Arc::new(
            MeasurementRunner::new(device.clone(), self.sink.clone()).with_tick(self.tick),
        );
        let cancel = CancellationToken::new();
        let forwarder = tokio::spawn(forward_events(
            id.clone(),
            runner.subscribe(),
            device.subscribe(),
            self.events.clone(),
            cancel.clone(),
        ));

        tracing::info!(device_id = %id, kind = %kind, "Registered device");
        devices.insert(
            id,
            MonitoredDevice {
                display_name: display_name.into(),
                kind,
                runner,
                configured: Arc::new(RwLock::new(definitions)),
                cancel,
                forwarder,
            },
        );
        Ok(())
    }

    /// Connect and initialize the device if needed, then register all its
    /// configured definitions.
    pub async fn start_device(&self, id: &str) -> LabResult<()> {
        let (runner, configured) = self.entry(id)?;
        let device = runner.device().clone();

        if !device.is_connected().await {
            device.connect().await?;
        }
        if !device.is_initialized() {
            device.initialize().await?;
        }

        let definitions = configured.read().clone();
        for definition in definitions {
            runner.register(definition).await?;
        }
        tracing::info!(device_id = %id, "Device monitoring started");
        Ok(())
    }

    /// Start every registered device. A device that fails to start does not
    /// prevent the others; the failures are returned by device id.
    pub async fn start_all(&self) -> Vec<(String, LabError)> {
        let mut failures = Vec::new();
        for id in self.device_ids() {
            if let Err(error) = self.start_device(&id).await {
                tracing::warn!(device_id = %id, error = %error, "Device failed to start");
                failures.push((id, error));
            }
        }
        failures
    }

    /// Stop measuring on a device and close its connection. The device stays
    /// registered and can be started again.
    pub async fn stop_device(&self, id: &str) -> LabResult<()> {
        let (runner, _) = self.entry(id)?;
        runner.stop_all().await;
        runner.device().disconnect().await;
        tracing::info!(device_id = %id, "Device monitoring stopped");
        Ok(())
    }

    /// Add or replace one definition. It is remembered for later restarts
    /// and, when the device is connected, starts being measured right away.
    pub async fn update_definition(
        &self,
        id: &str,
        definition: MeasurementDefinition,
    ) -> LabResult<()> {
        let (runner, configured) = self.entry(id)?;
        {
            let mut configured = configured.write();
            configured.retain(|existing| existing.key != definition.key);
            configured.push(definition.clone());
        }

        if runner.device().is_connected().await {
            runner.register(definition).await?;
        }
        Ok(())
    }

    /// Forget one definition. Returns whether the device had it.
    pub async fn remove_definition(&self, id: &str, key: MeasurementKey) -> LabResult<bool> {
        let (runner, configured) = self.entry(id)?;
        let remembered = {
            let mut configured = configured.write();
            let before = configured.len();
            configured.retain(|existing| existing.key != key);
            configured.len() != before
        };
        let active = runner.unregister(key).await;
        Ok(remembered || active)
    }

    /// Stop a device, disconnect it, and drop it from the monitor.
    pub async fn unregister_device(&self, id: &str) -> LabResult<()> {
        let monitored = self
            .devices
            .write()
            .remove(id)
            .ok_or_else(|| unknown_device(id))?;
        shutdown_device(id, monitored).await;
        tracing::info!(device_id = %id, "Unregistered device");
        Ok(())
    }

    pub fn device(&self, id: &str) -> Option<Arc<dyn Device>> {
        self.devices
            .read()
            .get(id)
            .map(|monitored| monitored.runner.device().clone())
    }

    /// Registered ids, sorted.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn status(&self, id: &str) -> Option<DeviceStatus> {
        let (display_name, kind, runner) = {
            let devices = self.devices.read();
            let monitored = devices.get(id)?;
            (
                monitored.display_name.clone(),
                monitored.kind,
                monitored.runner.clone(),
            )
        };

        let device = runner.device();
        Some(DeviceStatus {
            id: id.to_string(),
            display_name,
            kind,
            connected: device.is_connected().await,
            initialized: device.is_initialized(),
            measuring: runner.is_measuring(),
            definitions: runner.definitions(),
        })
    }

    /// Status of every device, sorted by id.
    pub async fn statuses(&self) -> Vec<DeviceStatus> {
        let mut statuses = Vec::new();
        for id in self.device_ids() {
            if let Some(status) = self.status(&id).await {
                statuses.push(status);
            }
        }
        statuses
    }

    /// Stop and disconnect every device.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self.devices.write().drain().collect();
        for (id, monitored) in drained {
            shutdown_device(&id, monitored).await;
        }
        tracing::info!("Device monitor shut down");
    }

    fn entry(
        &self,
        id: &str,
    ) -> LabResult<(Arc<MeasurementRunner>, Arc<RwLock<Vec<MeasurementDefinition>>>)> {
        let devices = self.devices.read();
        let monitored = devices.get(id).ok_or_else(|| unknown_device(id))?;
        Ok((monitored.runner.clone(), monitored.configured.clone()))
    }
}

fn unknown_device(id: &str) -> LabError {
    LabError::configuration(format!("no device registered as '{}'", id))
}

async fn shutdown_device(id: &str, monitored: MonitoredDevice) {
    monitored.runner.stop_all().await;
    monitored.runner.device().disconnect().await;
    monitored.cancel.cancel();
    if let Err(e) = monitored.forwarder.await {
        tracing::error!(device_id = %id, error = %e, "Event forwarder failed");
    }
}

fn build_transport(
    config: &TransportConfig,
    options: &ProtocolOptions,
) -> LabResult<Box<dyn Transport>> {
    let terminator = options.terminator.bytes().last().unwrap_or(LINE_FEED);
    match config {
        TransportConfig::Tcp { host, port } => Ok(Box::new(
            TcpTransport::new(host.clone(), *port).with_terminator(terminator),
        )),
        #[cfg(feature = "serial")]
        TransportConfig::Serial { path, baud_rate } => {
            use crate::transport::{SerialSettings, SerialTransport};
            Ok(Box::new(
                SerialTransport::new(SerialSettings::new(path.clone(), *baud_rate))
                    .with_terminator(terminator),
            ))
        }
        #[cfg(not(feature = "serial"))]
        TransportConfig::Serial { path, .. } => Err(LabError::configuration(format!(
            "serial port {} requested but serial support is not enabled",
            path
        ))),
    }
}

async fn forward_events(
    device_id: String,
    mut runner_events: broadcast::Receiver<RunnerEvent>,
    mut device_events: broadcast::Receiver<DeviceEvent>,
    events: broadcast::Sender<MonitorEvent>,
    cancel: CancellationToken,
) {
    let mut runner_open = true;
    let mut device_open = true;

    while runner_open || device_open {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = runner_events.recv(), if runner_open => match received {
                Ok(RunnerEvent::MeasurementFailed { key, error }) => {
                    let _ = events.send(MonitorEvent::MeasurementError {
                        device_id: device_id.clone(),
                        key,
                        error,
                    });
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(device_id = %device_id, skipped, "Runner events lagged");
                }
                Err(RecvError::Closed) => runner_open = false,
            },
            received = device_events.recv(), if device_open => match received {
                Ok(DeviceEvent::ConnectionChanged { connected, .. }) => {
                    let _ = events.send(MonitorEvent::ConnectionChanged {
                        device_id: device_id.clone(),
                        connected,
                    });
                }
                // Measurement failures already arrive through the runner
                Ok(DeviceEvent::Error(error)) if error.kind() == ErrorKind::Measurement => {}
                Ok(DeviceEvent::Error(error)) => {
                    let _ = events.send(MonitorEvent::DeviceError {
                        device_id: device_id.clone(),
                        error,
                    });
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(device_id = %device_id, skipped, "Device events lagged");
                }
                Err(RecvError::Closed) => device_open = false,
            },
        }
    }
}
