//! # labmon
//!
//! Polls laboratory instruments (power supplies, multimeters) over SCPI and
//! feeds the readings into a key-partitioned processing pipeline that keeps
//! per-measurement state and raises threshold alerts.
//!
//! ## Crate Structure
//!
//! Leaf modules first:
//!
//! - **`error`**: [`LabError`](error::LabError) and its [`ErrorKind`](error::ErrorKind)
//!   taxonomy, used by every fallible operation.
//! - **`measurement`**: samples, measurement definitions, threshold bounds.
//! - **`transport`**: byte-stream connections (TCP, serial, scripted mock) with
//!   timed send/receive and end-of-message detection.
//! - **`protocol`**: SCPI command/query framing and typed response conversion.
//! - **`device`**: the `Device` capability trait and generic SCPI power-supply
//!   and multimeter façades.
//! - **`runner`**: periodic polling of a mutable set of definitions on one device.
//! - **`pipeline`**: ingestion queue, dispatcher, per-key workers, idle eviction.
//! - **`manager`**: `DeviceMonitor`, one runner per device plus status reporting.
//! - **`config`**: Figment-based settings (`config/labmon.toml` + `LABMON_*`).
//! - **`telemetry`**: `tracing-subscriber` initialization.
//!
//! ## Data Flow
//!
//! ```text
//! Device ──► MeasurementRunner ──► ingestion queue ──► Dispatcher ──► KeyWorker
//!                                                                      │
//!                                                  PipelineEvent ◄─────┘
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod manager;
pub mod measurement;
pub mod pipeline;
pub mod protocol;
pub mod runner;
pub mod telemetry;
pub mod transport;

pub use error::{ErrorKind, LabError, LabResult};
