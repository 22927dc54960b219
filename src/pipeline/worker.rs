//! Key worker: one queue and one processing loop per measurement key.
//!
//! The loop dequeues a sample, stamps the worker's last-activity time, runs the
//! processor, and publishes the outcome. A panicking processor is reported as
//! a pipeline error for that sample and the loop keeps going. Stopping is cooperative: the sample
//! being processed always finishes, but anything still queued when the stop
//! signal arrives is discarded.

use super::events::{EventSink, PipelineEvent};
use super::processor::SampleProcessor;
use crate::error::{LabError, LabResult};
use crate::measurement::{MeasurementKey, Sample};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Activity {
    last: Mutex<Option<Instant>>,
    processed: AtomicU64,
}

pub(crate) struct KeyWorker {
    key: MeasurementKey,
    id: u64,
    tx: mpsc::UnboundedSender<Sample>,
    cancel: CancellationToken,
    activity: Arc<Activity>,
    handle: JoinHandle<()>,
}

impl KeyWorker {
    /// Spawn the worker loop.
    pub(crate) fn start(
        key: MeasurementKey,
        id: u64,
        processor: Box<dyn SampleProcessor>,
        sink: EventSink,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let activity = Arc::new(Activity::default());

        let handle = tokio::spawn(run(
            key,
            rx,
            processor,
            sink,
            cancel.clone(),
            activity.clone(),
        ));

        tracing::debug!(key, worker_id = id, "Key worker started");
        Self {
            key,
            id,
            tx,
            cancel,
            activity,
            handle,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn enqueue(&self, sample: Sample) -> LabResult<()> {
        self.tx.send(sample).map_err(|_| {
            LabError::closed(format!("worker for key {} has stopped", self.key))
        })
    }

    /// When the loop last dequeued a sample; `None` if it never has.
    pub(crate) fn last_activity(&self) -> Option<Instant> {
        *self.activity.last.lock()
    }

    /// False once the loop has exited; such a worker can no longer accept samples.
    pub(crate) fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    pub(crate) fn processed(&self) -> u64 {
        self.activity.processed.load(Ordering::Relaxed)
    }

    /// Idle means: has handled at least one sample, and the last one was
    /// dequeued more than `expiry` ago.
    pub(crate) fn is_idle(&self, now: Instant, expiry: Duration) -> bool {
        self.last_activity()
            .is_some_and(|last| now.saturating_duration_since(last) > expiry)
    }

    /// Make the loop exit without removing the worker from its table.
    #[cfg(test)]
    pub(crate) fn halt(&self) {
        self.cancel.cancel();
    }

    /// Signal the loop to stop and wait for the in-flight sample to finish.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(key = self.key, error = %e, "Key worker task failed");
        }
        tracing::debug!(
            key = self.key,
            worker_id = self.id,
            processed = self.activity.processed.load(Ordering::Relaxed),
            "Key worker stopped"
        );
    }
}

async fn run(
    key: MeasurementKey,
    mut rx: mpsc::UnboundedReceiver<Sample>,
    mut processor: Box<dyn SampleProcessor>,
    sink: EventSink,
    cancel: CancellationToken,
    activity: Arc<Activity>,
) {
    loop {
        let sample = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(sample) => sample,
                None => break,
            },
        };

        *activity.last.lock() = Some(Instant::now());

        let outcome = match AssertUnwindSafe(processor.process(&sample))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => {
                let reason = panic_message(&*payload);
                tracing::error!(key, reason, "Sample processor panicked");
                Err(LabError::device(format!(
                    "processor for key {} panicked: {}",
                    key, reason
                )))
            }
        };

        match outcome {
            Ok(Some(breach)) => {
                tracing::warn!(key, kind = %breach.kind, "{}", breach.message);
                sink.emit(PipelineEvent::ThresholdExceeded { key, breach });
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(key, error = %error, "Sample processing failed");
                sink.emit(PipelineEvent::Error {
                    error,
                    sample: Some(sample.clone()),
                });
            }
        }

        activity.processed.fetch_add(1, Ordering::Relaxed);
        sink.emit(PipelineEvent::SampleProcessed(sample));
    }

    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        tracing::debug!(key, dropped, "Discarded queued samples on stop");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
