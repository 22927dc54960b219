//! Structured logging setup.
//!
//! Wraps `tracing-subscriber` so binaries and tests can install one global
//! subscriber: pretty, compact, or JSON output, filtered by `RUST_LOG` when set
//! and by the configured level otherwise.
//!
//! # Example
//! ```no_run
//! use labmon::{config::Settings, telemetry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! telemetry::init_from_settings(&settings)?;
//! tracing::info!(devices = settings.devices.len(), "labmon starting");
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use crate::error::{LabError, LabResult};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored (development)
    Pretty,
    /// Single-line, no colors
    Compact,
    /// One JSON object per event (log aggregation)
    Json,
}

/// Subscriber options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
    /// Log span NEW/CLOSE events
    pub with_span_events: bool,
    pub with_file_and_line: bool,
    pub with_thread_names: bool,
    /// Only honored by [`OutputFormat::Pretty`]
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn from_settings(settings: &Settings) -> LabResult<Self> {
        Ok(Self::new(parse_log_level(&settings.application.log_level)?))
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Install the global subscriber using the configured log level.
pub fn init_from_settings(settings: &Settings) -> LabResult<()> {
    init(TracingConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// Idempotent: if a global subscriber is already set (another test, or the
/// embedding application) this returns `Ok(())` and leaves it in place.
pub fn init(config: TracingConfig) -> LabResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let layer = match config.format {
        OutputFormat::Pretty => layer.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => layer.compact().with_ansi(false).boxed(),
        OutputFormat::Json => layer.json().boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        // Already initialized elsewhere; expected in tests
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(LabError::configuration("failed to initialize tracing").with_source(e)),
    }
}

fn parse_log_level(level: &str) -> LabResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(LabError::configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}
