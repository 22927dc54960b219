//! Integration tests for the dispatcher, key workers, and idle eviction.

mod common;

use async_trait::async_trait;
use common::{recording_factory, wait_for};
use labmon::error::ErrorKind;
use labmon::measurement::{MeasurementKey, Sample, ThresholdBounds, ThresholdBreach, ThresholdKind};
use labmon::pipeline::{
    processor_factory, Dispatcher, PipelineEvent, PipelineOptions, ProcessorFactory,
    ProcessorSpec, SampleProcessor,
};
use labmon::LabResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_same_key_samples_processed_in_submission_order() {
    let (factory, seen) = recording_factory();
    let dispatcher = Dispatcher::new(factory, PipelineOptions::default());
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let sender = dispatcher.sender();
    for i in 0..300 {
        let key = i % 3;
        sender.submit(Sample::now(key, i as f64, "ramp")).unwrap();
    }

    let mut processed = 0;
    while processed < 300 {
        wait_for(&mut events, WAIT, |e| matches!(e, PipelineEvent::SampleProcessed(_))).await;
        processed += 1;
    }

    let seen = seen.lock();
    assert_eq!(seen.len(), 3);
    for (key, values) in seen.iter() {
        assert_eq!(values.len(), 100, "key {}", key);
        assert!(values.windows(2).all(|w| w[0] < w[1]), "key {} out of order", key);
    }
    drop(seen);
    dispatcher.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creation_yields_one_worker() {
    let (factory, _seen) = recording_factory();
    let dispatcher = Arc::new(Dispatcher::new(factory, PipelineOptions::default()));
    let mut events = dispatcher.subscribe();

    let attempts: Vec<_> = (0..32)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.get_or_create_worker(7).await })
        })
        .collect();

    let mut ids = Vec::new();
    for attempt in attempts {
        ids.push(attempt.await.unwrap().unwrap());
    }

    assert!(ids.windows(2).all(|w| w[0] == w[1]), "ids differ: {:?}", ids);
    assert_eq!(dispatcher.worker_count().await, 1);

    let mut created = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PipelineEvent::WorkerCreated { key: 7, .. }) {
            created += 1;
        }
    }
    assert_eq!(created, 1);
    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_worker_evicted_and_recreated() {
    let (factory, _seen) = recording_factory();
    let dispatcher = Dispatcher::new(factory, PipelineOptions::default());
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();
    let sender = dispatcher.sender();

    sender.submit(Sample::now(1, 1.0, "dmm")).unwrap();
    let PipelineEvent::WorkerCreated { worker_id: first, .. } =
        wait_for(&mut events, WAIT, |e| matches!(e, PipelineEvent::WorkerCreated { .. })).await
    else {
        unreachable!()
    };
    wait_for(&mut events, WAIT, |e| matches!(e, PipelineEvent::SampleProcessed(_))).await;

    // Default expiry is 10 minutes, scanned every minute
    tokio::time::sleep(Duration::from_secs(11 * 60 + 1)).await;
    let expired = wait_for(&mut events, WAIT, |e| {
        matches!(e, PipelineEvent::WorkerExpired { .. })
    })
    .await;
    assert!(matches!(expired, PipelineEvent::WorkerExpired { key: 1, worker_id } if worker_id == first));
    assert!(!dispatcher.has_worker(1).await);

    sender.submit(Sample::now(1, 2.0, "dmm")).unwrap();
    let PipelineEvent::WorkerCreated { worker_id: second, .. } =
        wait_for(&mut events, WAIT, |e| matches!(e, PipelineEvent::WorkerCreated { .. })).await
    else {
        unreachable!()
    };
    assert_ne!(first, second);
    dispatcher.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_worker_without_samples_is_never_evicted() {
    let (factory, _seen) = recording_factory();
    let dispatcher = Dispatcher::new(factory, PipelineOptions::default());
    dispatcher.start().unwrap();

    let id = dispatcher.get_or_create_worker(5).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3 * 60 * 60)).await;

    assert!(dispatcher.has_worker(5).await);
    assert_eq!(dispatcher.get_or_create_worker(5).await.unwrap(), id);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_value_above_upper_bound_raises_one_event() {
    let mut specs = HashMap::new();
    specs.insert(1, ProcessorSpec::Threshold(ThresholdBounds::new(Some(0.0), Some(10.0))));
    let dispatcher = Dispatcher::new(processor_factory(specs), PipelineOptions::default());
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let sample = Sample::now(1, 12.5, "Multimeter_VOLT:DC");
    dispatcher.sender().submit(sample.clone()).unwrap();

    let mut breaches = Vec::new();
    loop {
        match wait_for(&mut events, WAIT, |_| true).await {
            PipelineEvent::ThresholdExceeded { key, breach } => {
                assert_eq!(key, 1);
                breaches.push(breach);
            }
            PipelineEvent::SampleProcessed(_) => break,
            _ => {}
        }
    }

    assert_eq!(breaches.len(), 1);
    assert_eq!(breaches[0].kind, ThresholdKind::Upper);
    assert_eq!(breaches[0].sample, sample);
    assert!(!breaches[0].message.is_empty());
    dispatcher.shutdown().await;
}

/// Panics on negative readings.
struct RejectsNegative {
    seen: Arc<Mutex<Vec<f64>>>,
}

#[async_trait]
impl SampleProcessor for RejectsNegative {
    async fn process(&mut self, sample: &Sample) -> LabResult<Option<ThresholdBreach>> {
        assert!(sample.value >= 0.0, "negative reading");
        self.seen.lock().push(sample.value);
        Ok(None)
    }
}

#[tokio::test]
async fn test_processor_panic_does_not_poison_key() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let shared = seen.clone();
    let factory: ProcessorFactory = Arc::new(move |_key: MeasurementKey| {
        let processor: Box<dyn SampleProcessor> = Box::new(RejectsNegative {
            seen: shared.clone(),
        });
        Ok(processor)
    });
    let dispatcher = Dispatcher::new(factory, PipelineOptions::default());
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let sender = dispatcher.sender();
    for value in [-1.0, 0.0, 1.0, 2.0] {
        sender.submit(Sample::now(9, value, "psu")).unwrap();
    }

    let mut errors = Vec::new();
    let mut processed = 0;
    while processed < 4 {
        match wait_for(&mut events, WAIT, |_| true).await {
            PipelineEvent::Error { error, sample } => errors.push((error.kind(), sample)),
            PipelineEvent::SampleProcessed(_) => processed += 1,
            _ => {}
        }
    }

    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, ErrorKind::Device);
    assert_eq!(errors[0].1.as_ref().map(|s| s.value), Some(-1.0));
    assert_eq!(*seen.lock(), vec![0.0, 1.0, 2.0]);
    assert_eq!(dispatcher.worker_count().await, 1);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_remove_worker_then_next_sample_recreates() {
    let (factory, _seen) = recording_factory();
    let dispatcher = Dispatcher::new(factory, PipelineOptions::default());
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let first = dispatcher.get_or_create_worker(3).await.unwrap();
    assert!(dispatcher.remove_worker(3).await);
    assert!(!dispatcher.remove_worker(3).await);

    dispatcher.sender().submit(Sample::now(3, 1.0, "psu")).unwrap();
    wait_for(&mut events, WAIT, |e| matches!(e, PipelineEvent::SampleProcessed(_))).await;
    assert_ne!(dispatcher.get_or_create_worker(3).await.unwrap(), first);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_ingestion_and_stops_workers() {
    let (factory, _seen) = recording_factory();
    let dispatcher = Dispatcher::new(factory, PipelineOptions::default());
    let mut events = dispatcher.subscribe();
    dispatcher.start().unwrap();

    let sender = dispatcher.sender();
    sender.submit(Sample::now(1, 1.0, "psu")).unwrap();
    wait_for(&mut events, WAIT, |e| matches!(e, PipelineEvent::SampleProcessed(_))).await;

    dispatcher.shutdown().await;
    assert_eq!(dispatcher.worker_count().await, 0);
    assert!(sender.submit(Sample::now(1, 2.0, "psu")).is_err());
    wait_for(&mut events, WAIT, |e| matches!(e, PipelineEvent::ProcessingStopped)).await;
}
