//! Measurement data types shared by the runner and the processing pipeline.
//!
//! - [`Sample`]: one timestamped, keyed measurement value.
//! - [`MeasurementDefinition`]: what to poll, how often, and under which key.
//! - [`ThresholdBounds`] / [`ThresholdBreach`]: optional limits checked by workers.

pub mod definition;
pub mod sample;
pub mod threshold;

pub use definition::{MeasurementDefinition, MeasurementKind, DEFAULT_POLL_INTERVAL};
pub use sample::{MeasurementKey, Sample};
pub use threshold::{ThresholdBounds, ThresholdBreach, ThresholdKind};
