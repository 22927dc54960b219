//! Periodic polling of one device.
//!
//! A [`MeasurementRunner`] owns a mutable set of [`MeasurementDefinition`]s
//! and a background loop that is alive exactly while the set is non-empty.
//!
//! Each sweep snapshots the set (so no lock is held during device I/O), and
//! measures every definition whose own interval has elapsed since its last
//! successful measurement. Between sweeps the loop sleeps one short tick.
//! A failing definition is reported on the event channel and retried on the
//! next sweep; it never stops the loop or other definitions.

use crate::device::{self, Device};
use crate::error::{LabError, LabResult};
use crate::measurement::{MeasurementDefinition, MeasurementKey, Sample};
use crate::pipeline::SampleSender;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default pause between two sweeps.
pub const DEFAULT_RUNNER_TICK: Duration = Duration::from_millis(100);

/// Notification published by a runner.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// A definition's measurement or hand-off failed
    MeasurementFailed { key: MeasurementKey, error: LabError },
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives periodic measurements on one device.
pub struct MeasurementRunner {
    device: Arc<dyn Device>,
    sink: SampleSender,
    definitions: Arc<Mutex<Vec<MeasurementDefinition>>>,
    running: Mutex<Option<LoopHandle>>,
    tick: Duration,
    events: broadcast::Sender<RunnerEvent>,
}

impl MeasurementRunner {
    pub fn new(device: Arc<dyn Device>, sink: SampleSender) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            device,
            sink,
            definitions: Arc::new(Mutex::new(Vec::new())),
            running: Mutex::new(None),
            tick: DEFAULT_RUNNER_TICK,
            events,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.events.subscribe()
    }

    /// Add `definition`, replacing any definition with the same key, and start
    /// the loop if it is not running.
    ///
    /// Fails with `NotConnected` when the device is not connected.
    pub async fn register(&self, definition: MeasurementDefinition) -> LabResult<()> {
        if !self.device.is_connected().await {
            return Err(LabError::not_connected(format!(
                "cannot measure key {} on {}: device is not connected",
                definition.key,
                self.device.name()
            )));
        }

        {
            let mut definitions = self.definitions.lock();
            definitions.retain(|existing| existing.key != definition.key);
            tracing::debug!(
                device = %self.device.name(),
                key = definition.key,
                interval = ?definition.interval,
                "Registered measurement"
            );
            definitions.push(definition);
        }

        self.ensure_running();
        Ok(())
    }

    /// Remove the definition for `key`. Stops the loop when none remain.
    ///
    /// Returns whether a definition was removed.
    pub async fn unregister(&self, key: MeasurementKey) -> bool {
        let (removed, now_empty) = {
            let mut definitions = self.definitions.lock();
            let before = definitions.len();
            definitions.retain(|existing| existing.key != key);
            (definitions.len() != before, definitions.is_empty())
        };

        if now_empty {
            self.stop_loop().await;
            // A concurrent register may have landed while the loop was stopping
            if !self.definitions.lock().is_empty() {
                self.ensure_running();
            }
        }
        removed
    }

    /// Drop every definition and stop the loop.
    pub async fn stop_all(&self) {
        self.definitions.lock().clear();
        self.stop_loop().await;
    }

    /// Whether the background loop is alive.
    pub fn is_measuring(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
    }

    pub fn definitions(&self) -> Vec<MeasurementDefinition> {
        self.definitions.lock().clone()
    }

    fn ensure_running(&self) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|handle| !handle.task.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(measurement_loop(
            self.device.clone(),
            self.definitions.clone(),
            self.sink.clone(),
            self.events.clone(),
            self.tick,
            cancel.clone(),
        ));
        tracing::info!(device = %self.device.name(), "Measurement loop started");
        *running = Some(LoopHandle { cancel, task });
    }

    async fn stop_loop(&self) {
        let handle = self.running.lock().take();
        if let Some(LoopHandle { cancel, task }) = handle {
            cancel.cancel();
            if let Err(e) = task.await {
                tracing::error!(device = %self.device.name(), error = %e, "Measurement loop failed");
            }
            tracing::info!(device = %self.device.name(), "Measurement loop stopped");
        }
    }
}

async fn measurement_loop(
    device: Arc<dyn Device>,
    definitions: Arc<Mutex<Vec<MeasurementDefinition>>>,
    sink: SampleSender,
    events: broadcast::Sender<RunnerEvent>,
    tick: Duration,
    cancel: CancellationToken,
) {
    let mut last_measured: HashMap<MeasurementKey, Instant> = HashMap::new();

    'sweeps: loop {
        let snapshot = definitions.lock().clone();
        last_measured.retain(|key, _| snapshot.iter().any(|d| d.key == *key));

        for definition in &snapshot {
            if cancel.is_cancelled() {
                break 'sweeps;
            }

            let due = last_measured
                .get(&definition.key)
                .map_or(true, |last| last.elapsed() >= definition.interval);
            if !due {
                continue;
            }

            match measure_once(device.as_ref(), definition, &sink).await {
                Ok(()) => {
                    last_measured.insert(definition.key, Instant::now());
                }
                Err(error) => {
                    tracing::warn!(
                        device = %device.name(),
                        key = definition.key,
                        error = %error,
                        "Measurement failed"
                    );
                    let _ = events.send(RunnerEvent::MeasurementFailed {
                        key: definition.key,
                        error,
                    });
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(tick) => {}
        }
    }
}

async fn measure_once(
    device: &dyn Device,
    definition: &MeasurementDefinition,
    sink: &SampleSender,
) -> LabResult<()> {
    let value = device::measure(device, definition).await?;
    sink.submit(Sample::now(definition.key, value, definition.source_label()))
}
