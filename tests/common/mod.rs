//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use labmon::device::{Device, DeviceEvent};
use labmon::measurement::{MeasurementKey, Sample, ThresholdBreach};
use labmon::pipeline::{PipelineEvent, ProcessorFactory, SampleProcessor};
use labmon::LabResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Values seen by each key's processor, in processing order.
pub type Seen = Arc<Mutex<HashMap<MeasurementKey, Vec<f64>>>>;

struct Recorder {
    key: MeasurementKey,
    seen: Seen,
}

#[async_trait]
impl SampleProcessor for Recorder {
    async fn process(&mut self, sample: &Sample) -> LabResult<Option<ThresholdBreach>> {
        assert_eq!(sample.key, self.key, "sample routed to the wrong worker");
        self.seen
            .lock()
            .entry(self.key)
            .or_default()
            .push(sample.value);
        Ok(None)
    }
}

/// Factory whose processors record every value they see.
pub fn recording_factory() -> (ProcessorFactory, Seen) {
    let seen: Seen = Arc::new(Mutex::new(HashMap::new()));
    let shared = seen.clone();
    let factory: ProcessorFactory = Arc::new(move |key: MeasurementKey| {
        let processor: Box<dyn SampleProcessor> = Box::new(Recorder {
            key,
            seen: shared.clone(),
        });
        Ok(processor)
    });
    (factory, seen)
}

/// Wait for the first event matching `pred`, giving up after `limit`.
pub async fn wait_for<F>(
    events: &mut mpsc::UnboundedReceiver<PipelineEvent>,
    limit: Duration,
    mut pred: F,
) -> PipelineEvent
where
    F: FnMut(&PipelineEvent) -> bool,
{
    tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("pipeline event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for pipeline event")
}

/// Connected device whose every reading is one more than the last.
pub struct RampDevice {
    connected: AtomicBool,
    next: Mutex<f64>,
    events: broadcast::Sender<DeviceEvent>,
}

impl RampDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(true),
            next: Mutex::new(0.0),
            events: broadcast::channel(8).0,
        })
    }

    fn read(&self) -> f64 {
        let mut next = self.next.lock();
        *next += 1.0;
        *next
    }
}

#[async_trait]
impl Device for RampDevice {
    fn name(&self) -> &str {
        "ramp"
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn is_initialized(&self) -> bool {
        true
    }

    async fn connect(&self) -> LabResult<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    async fn initialize(&self) -> LabResult<()> {
        Ok(())
    }

    async fn measure_voltage(&self, _channel: Option<u8>) -> LabResult<f64> {
        Ok(self.read())
    }

    async fn measure_current(&self, _channel: Option<u8>) -> LabResult<f64> {
        Ok(self.read())
    }

    fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}
