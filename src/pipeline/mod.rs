//! Key-partitioned sample processing.
//!
//! Data flow:
//!
//! ```text
//! runners ──submit──▶ ingestion queue ──▶ Dispatcher ──▶ KeyWorker(key 1) ──▶ processor
//!                     (unbounded MPSC)        │       ──▶ KeyWorker(key 2) ──▶ processor
//!                                             │                ▲
//!                                             └── idle monitor ┘ (evicts)
//! ```
//!
//! Samples sharing a key are processed strictly in dequeue order, because one
//! worker owns the key and its queue is FIFO. Samples with different keys have
//! no relative ordering.
//!
//! All notifications flow through a single optional subscriber registered with
//! [`Dispatcher::set_monitor`]; without one, behaviour is unchanged.

mod dispatcher;
mod events;
mod monitor;
mod processor;
mod queue;
mod worker;

pub use dispatcher::{Dispatcher, PipelineOptions};
pub use events::PipelineEvent;
pub use monitor::{IdlePolicy, DEFAULT_IDLE_EXPIRY, DEFAULT_IDLE_SCAN_PERIOD};
pub use processor::{
    processor_factory, PowerSupplyProcessor, ProcessorFactory, ProcessorSpec, SampleProcessor,
    ThresholdProcessor,
};
pub use queue::SampleSender;
