use crate::error::LabError;
use crate::measurement::{MeasurementKey, Sample, ThresholdBreach};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Notifications published by the processing pipeline.
///
/// Delivered in the order they were emitted by each task. Events from
/// different workers interleave arbitrarily.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    ProcessingStarted,
    ProcessingStopped,
    /// The dispatcher dequeued a sample
    SampleReceived(Sample),
    /// A key worker finished processing a sample
    SampleProcessed(Sample),
    WorkerCreated { key: MeasurementKey, worker_id: u64 },
    WorkerExpired { key: MeasurementKey, worker_id: u64 },
    ThresholdExceeded { key: MeasurementKey, breach: ThresholdBreach },
    Error { error: LabError, sample: Option<Sample> },
}

/// Optional event subscriber shared by the dispatcher, workers, and idle monitor.
///
/// With no subscriber registered, emitting is a no-op.
#[derive(Clone, Default)]
pub(crate) struct EventSink {
    subscriber: Arc<RwLock<Option<mpsc::UnboundedSender<PipelineEvent>>>>,
}

impl EventSink {
    pub(crate) fn set(&self, subscriber: Option<mpsc::UnboundedSender<PipelineEvent>>) {
        *self.subscriber.write() = subscriber;
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = self.subscriber.read().as_ref() {
            // A dropped receiver only means nobody is listening any more
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscriber_is_noop() {
        let sink = EventSink::default();
        sink.emit(PipelineEvent::ProcessingStarted);
    }

    #[test]
    fn test_subscriber_receives_and_can_be_cleared() {
        let sink = EventSink::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sink.set(Some(tx));

        sink.clone().emit(PipelineEvent::ProcessingStarted);
        assert!(matches!(rx.try_recv(), Ok(PipelineEvent::ProcessingStarted)));

        sink.set(None);
        sink.emit(PipelineEvent::ProcessingStopped);
        assert!(rx.try_recv().is_err());
    }
}
