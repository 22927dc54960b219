//! The dispatcher: single consumer of the ingestion queue.
//!
//! # Worker table
//!
//! Workers live in one `tokio::sync::RwLock<HashMap<key, KeyWorker>>`, the
//! only structure shared between the dispatch loop, the idle monitor, and
//! explicit [`Dispatcher::remove_worker`] calls.
//!
//! - **Fast path**: the read guard. If the key has a live worker, the sample
//!   is handed over while the read guard is still held, so the worker cannot
//!   be evicted between lookup and hand-off. Dispatching to existing workers
//!   never takes the write lock.
//! - **Slow path**: the write lock, re-check, create-and-start if still absent.
//!   Concurrent creators for the same key serialise here, so at most one
//!   worker per key is ever live. A worker whose loop has exited is treated
//!   as absent: it is removed and replaced here.
//! - **Removal** (idle eviction, `remove_worker`, shutdown): under the write
//!   lock, including the wait for the worker's in-flight sample, so a
//!   replacement worker cannot start before the old one has finished.
//!
//! No other lock is ever taken while the table lock is held.

use super::events::{EventSink, PipelineEvent};
use super::monitor::{self, IdlePolicy};
use super::processor::ProcessorFactory;
use super::queue::{ingest_channel, SampleSender};
use super::worker::KeyWorker;
use crate::error::{LabError, LabResult};
use crate::measurement::{MeasurementKey, Sample};
use std::collections::hash_map::{Entry, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// State shared between the dispatcher handle and its background tasks.
pub(crate) struct Shared {
    pub(crate) workers: RwLock<HashMap<MeasurementKey, KeyWorker>>,
    pub(crate) sink: EventSink,
    factory: ProcessorFactory,
    next_worker_id: AtomicU64,
}

impl Shared {
    fn new(factory: ProcessorFactory, sink: EventSink) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            sink,
            factory,
            next_worker_id: AtomicU64::new(1),
        }
    }

    /// Id of the live worker for `key`, creating it if needed.
    async fn get_or_create(&self, key: MeasurementKey) -> LabResult<u64> {
        if let Some(worker) = self.workers.read().await.get(&key) {
            if worker.is_alive() {
                return Ok(worker.id());
            }
        }

        let mut workers = self.workers.write().await;
        Ok(self.live_worker(&mut workers, key).await?.id())
    }

    /// Hand `sample` to its key's worker.
    async fn dispatch(&self, sample: Sample) -> LabResult<()> {
        {
            let workers = self.workers.read().await;
            if let Some(worker) = workers.get(&sample.key) {
                if worker.is_alive() {
                    return worker.enqueue(sample);
                }
            }
        }

        let mut workers = self.workers.write().await;
        self.live_worker(&mut workers, sample.key)
            .await?
            .enqueue(sample)
    }

    /// Slow path, called with the write guard: the live worker for `key`,
    /// replacing a dead one and creating one if absent.
    async fn live_worker<'a>(
        &self,
        workers: &'a mut HashMap<MeasurementKey, KeyWorker>,
        key: MeasurementKey,
    ) -> LabResult<&'a KeyWorker> {
        if workers.get(&key).is_some_and(|worker| !worker.is_alive()) {
            if let Some(dead) = workers.remove(&key) {
                tracing::warn!(key, worker_id = dead.id(), "Replacing key worker whose loop exited");
                dead.stop().await;
            }
        }

        let worker: &KeyWorker = match workers.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.spawn_worker(key)?),
        };
        Ok(worker)
    }

    fn spawn_worker(&self, key: MeasurementKey) -> LabResult<KeyWorker> {
        let processor = (self.factory)(key)?;
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let worker = KeyWorker::start(key, id, processor, self.sink.clone());
        tracing::info!(key, worker_id = id, "Created key worker");
        self.sink.emit(PipelineEvent::WorkerCreated { key, worker_id: id });
        Ok(worker)
    }

    async fn remove(&self, key: MeasurementKey) -> bool {
        let mut workers = self.workers.write().await;
        match workers.remove(&key) {
            Some(worker) => {
                worker.stop().await;
                true
            }
            None => false,
        }
    }

    async fn stop_all(&self) {
        let mut workers = self.workers.write().await;
        let stops = workers.drain().map(|(_, worker)| worker.stop());
        futures::future::join_all(stops).await;
    }
}

/// Routes samples from the ingestion queue to per-key workers.
///
/// # Example
///
/// ```rust
/// use labmon::measurement::Sample;
/// use labmon::pipeline::{processor_factory, Dispatcher, PipelineOptions};
/// use std::collections::HashMap;
///
/// # tokio_test::block_on(async {
/// let dispatcher = Dispatcher::new(processor_factory(HashMap::new()), PipelineOptions::default());
/// dispatcher.start().unwrap();
///
/// let sender = dispatcher.sender();
/// sender.submit(Sample::now(1, 4.98, "PowerSupply_Voltage_CH1")).unwrap();
///
/// dispatcher.shutdown().await;
/// assert!(sender.submit(Sample::now(1, 5.0, "PowerSupply_Voltage_CH1")).is_err());
/// # });
/// ```
pub struct Dispatcher {
    shared: Arc<Shared>,
    sender: parking_lot::Mutex<Option<SampleSender>>,
    receiver: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Sample>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    options: PipelineOptions,
}

/// Tuning for the dispatcher and its idle monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    pub idle: IdlePolicy,
}

impl Dispatcher {
    pub fn new(factory: ProcessorFactory, options: PipelineOptions) -> Self {
        let (sender, receiver) = ingest_channel();
        Self {
            shared: Arc::new(Shared::new(factory, EventSink::default())),
            sender: parking_lot::Mutex::new(Some(sender)),
            receiver: parking_lot::Mutex::new(Some(receiver)),
            tasks: parking_lot::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            options,
        }
    }

    /// Producer handle for the ingestion queue.
    ///
    /// After [`shutdown`](Self::shutdown), handles fail every submission
    /// with `Closed`.
    pub fn sender(&self) -> SampleSender {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.clone(),
            // Already shut down: a sender whose receiver is gone
            None => ingest_channel().0,
        }
    }

    /// Route pipeline notifications to `subscriber`. Replaces any previous one.
    pub fn set_monitor(&self, subscriber: mpsc::UnboundedSender<PipelineEvent>) {
        self.shared.sink.set(Some(subscriber));
    }

    pub fn clear_monitor(&self) {
        self.shared.sink.set(None);
    }

    /// Convenience: register a fresh channel and return its receiving end.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PipelineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.set_monitor(tx);
        rx
    }

    /// Spawn the dispatch loop and the idle monitor.
    pub fn start(&self) -> LabResult<()> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| LabError::closed("dispatcher was already started"))?;

        let dispatch = tokio::spawn(dispatch_loop(
            self.shared.clone(),
            receiver,
            self.cancel.child_token(),
        ));
        let idle = tokio::spawn(monitor::run(
            self.shared.clone(),
            self.options.idle,
            self.cancel.child_token(),
        ));

        self.tasks.lock().extend([dispatch, idle]);
        Ok(())
    }

    /// Id of the live worker for `key`, creating one if none exists.
    pub async fn get_or_create_worker(&self, key: MeasurementKey) -> LabResult<u64> {
        if self.cancel.is_cancelled() {
            return Err(LabError::closed("dispatcher has shut down"));
        }
        self.shared.get_or_create(key).await
    }

    /// Stop and remove the worker for `key`. Returns whether one existed.
    pub async fn remove_worker(&self, key: MeasurementKey) -> bool {
        let removed = self.shared.remove(key).await;
        if removed {
            tracing::info!(key, "Removed key worker");
        }
        removed
    }

    pub async fn worker_count(&self) -> usize {
        self.shared.workers.read().await.len()
    }

    pub async fn has_worker(&self, key: MeasurementKey) -> bool {
        self.shared.workers.read().await.contains_key(&key)
    }

    /// Stop accepting samples, stop every worker, and wait for their
    /// in-flight samples. Queued samples are discarded.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.sender.lock().take();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Pipeline task failed");
            }
        }

        // Never started: drop the receiver so senders see the queue closed
        self.receiver.lock().take();
        self.shared.stop_all().await;
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut receiver: mpsc::UnboundedReceiver<Sample>,
    cancel: CancellationToken,
) {
    shared.sink.emit(PipelineEvent::ProcessingStarted);
    tracing::info!("Dispatcher started");

    loop {
        let sample = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = receiver.recv() => match next {
                Some(sample) => sample,
                None => break,
            },
        };

        shared.sink.emit(PipelineEvent::SampleReceived(sample.clone()));
        let key = sample.key;
        if let Err(error) = shared.dispatch(sample.clone()).await {
            tracing::warn!(key, error = %error, "Failed to dispatch sample");
            shared.sink.emit(PipelineEvent::Error {
                error,
                sample: Some(sample),
            });
        }
    }

    // Close the queue before workers are stopped so producers fail fast
    receiver.close();
    shared.stop_all().await;
    shared.sink.emit(PipelineEvent::ProcessingStopped);
    tracing::info!("Dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::pipeline::processor::processor_factory;
    use std::time::Duration;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(processor_factory(HashMap::new()), PipelineOptions::default())
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let dispatcher = dispatcher();
        let first = dispatcher.get_or_create_worker(3).await.unwrap();
        let second = dispatcher.get_or_create_worker(3).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(dispatcher.worker_count().await, 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_factory_error_is_reported_and_loop_continues() {
        let factory: ProcessorFactory = Arc::new(|key: MeasurementKey| {
            if key == 13 {
                Err(LabError::configuration("no processor for key 13"))
            } else {
                processor_factory(HashMap::new())(key)
            }
        });
        let dispatcher = Dispatcher::new(factory, PipelineOptions::default());
        let mut events = dispatcher.subscribe();
        dispatcher.start().unwrap();

        let sender = dispatcher.sender();
        sender.submit(Sample::now(13, 1.0, "bad")).unwrap();
        sender.submit(Sample::now(14, 2.0, "good")).unwrap();

        let mut saw_error = false;
        loop {
            match events.recv().await.unwrap() {
                PipelineEvent::Error { error, sample } => {
                    assert_eq!(error.kind(), ErrorKind::Configuration);
                    assert_eq!(sample.map(|s| s.key), Some(13));
                    saw_error = true;
                }
                PipelineEvent::SampleProcessed(sample) => {
                    assert_eq!(sample.key, 14);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_error);
        assert!(!dispatcher.has_worker(13).await);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_exited_worker_is_replaced_on_next_sample() {
        let dispatcher = dispatcher();
        let mut events = dispatcher.subscribe();
        dispatcher.start().unwrap();

        let first = dispatcher.get_or_create_worker(4).await.unwrap();
        {
            let workers = dispatcher.shared.workers.read().await;
            workers.get(&4).unwrap().halt();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.shared.workers.read().await.get(&4).unwrap().is_alive() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        dispatcher.sender().submit(Sample::now(4, 1.0, "psu")).unwrap();
        loop {
            match events.recv().await.unwrap() {
                PipelineEvent::Error { error, .. } => panic!("unexpected error: {}", error),
                PipelineEvent::SampleProcessed(sample) => {
                    assert_eq!(sample.key, 4);
                    break;
                }
                _ => {}
            }
        }

        let second = dispatcher.get_or_create_worker(4).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(dispatcher.worker_count().await, 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_worker() {
        let dispatcher = dispatcher();
        dispatcher.get_or_create_worker(1).await.unwrap();
        assert!(dispatcher.remove_worker(1).await);
        assert!(!dispatcher.remove_worker(1).await);
        assert_eq!(dispatcher.worker_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_emits_stopped_and_clears_workers() {
        let dispatcher = dispatcher();
        let mut events = dispatcher.subscribe();
        dispatcher.start().unwrap();
        dispatcher.sender().submit(Sample::now(2, 1.0, "x")).unwrap();

        // Wait for the worker to exist
        while !matches!(events.recv().await, Some(PipelineEvent::SampleProcessed(_))) {}

        dispatcher.shutdown().await;
        assert_eq!(dispatcher.worker_count().await, 0);

        let mut stopped = false;
        while let Ok(event) = events.try_recv() {
            stopped |= matches!(event, PipelineEvent::ProcessingStopped);
        }
        assert!(stopped);

        let err = dispatcher.get_or_create_worker(2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let dispatcher = dispatcher();
        dispatcher.start().unwrap();
        assert!(dispatcher.start().is_err());
        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sender_fails_after_shutdown() {
        let dispatcher = dispatcher();
        let sender = dispatcher.sender();
        dispatcher.start().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        dispatcher.shutdown().await;

        let err = sender.submit(Sample::now(1, 1.0, "x")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
        assert!(dispatcher.sender().is_closed());
    }
}
