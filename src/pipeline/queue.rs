use crate::error::{LabError, LabResult};
use crate::measurement::Sample;
use tokio::sync::mpsc;

/// Producer side of the ingestion queue.
///
/// Cheap to clone; every measurement runner holds one. Submission never
/// blocks. Once the dispatcher has shut down, `submit` fails with `Closed`.
#[derive(Debug, Clone)]
pub struct SampleSender {
    tx: mpsc::UnboundedSender<Sample>,
}

impl SampleSender {
    pub fn submit(&self, sample: Sample) -> LabResult<()> {
        self.tx
            .send(sample)
            .map_err(|rejected| {
                LabError::closed(format!(
                    "ingestion queue is closed; dropped sample for key {}",
                    rejected.0.key
                ))
            })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Unbounded multi-producer, single-consumer sample queue.
pub(crate) fn ingest_channel() -> (SampleSender, mpsc::UnboundedReceiver<Sample>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SampleSender { tx }, rx)
}
