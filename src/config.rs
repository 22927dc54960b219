//! Configuration loading using Figment
//!
//! Settings are read from:
//! 1. `config/labmon.toml` (base configuration)
//! 2. Environment variables prefixed with `LABMON_`, nested keys separated by
//!    `__` (e.g. `LABMON_IO__QUERY_TIMEOUT=2s`)
//!
//! Durations are humantime strings (`500ms`, `10m`).
//!
//! # Example
//! ```no_run
//! use labmon::config::Settings;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Application: {}", settings.application.name);
//! # Ok(())
//! # }
//! ```

use crate::error::{LabError, LabResult};
use crate::measurement::{
    MeasurementDefinition, MeasurementKey, MeasurementKind, ThresholdBounds, DEFAULT_POLL_INTERVAL,
};
use crate::pipeline::{IdlePolicy, PipelineOptions, ProcessorSpec, DEFAULT_IDLE_EXPIRY, DEFAULT_IDLE_SCAN_PERIOD};
use crate::protocol::{
    ProtocolOptions, DEFAULT_BULK_CHUNK_SIZE, DEFAULT_QUERY_TIMEOUT, DEFAULT_READ_CHUNK_SIZE,
};
use crate::runner::DEFAULT_RUNNER_TICK;
use crate::transport::DEFAULT_TRANSPORT_TIMEOUT;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/labmon.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "LABMON_";

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub io: IoConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Worker lifecycle settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Inactivity after which a key worker is evicted
    #[serde(default = "default_idle_expiry", with = "humantime_serde")]
    pub idle_expiry: Duration,
    /// Time between eviction scans
    #[serde(default = "default_idle_scan_period", with = "humantime_serde")]
    pub idle_scan_period: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idle_expiry: DEFAULT_IDLE_EXPIRY,
            idle_scan_period: DEFAULT_IDLE_SCAN_PERIOD,
        }
    }
}

/// Transport and protocol timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoConfig {
    #[serde(default = "default_transport_timeout", with = "humantime_serde")]
    pub transport_timeout: Duration,
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_bulk_chunk_size")]
    pub bulk_chunk_size: usize,
    /// Pause between two runner sweeps
    #[serde(default = "default_runner_tick", with = "humantime_serde")]
    pub runner_tick: Duration,
    #[serde(default = "default_terminator")]
    pub terminator: String,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            transport_timeout: DEFAULT_TRANSPORT_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            bulk_chunk_size: DEFAULT_BULK_CHUNK_SIZE,
            runner_tick: DEFAULT_RUNNER_TICK,
            terminator: default_terminator(),
        }
    }
}

/// Instrument family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    PowerSupply,
    Multimeter,
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::PowerSupply => write!(f, "power_supply"),
            DeviceKind::Multimeter => write!(f, "multimeter"),
        }
    }
}

/// How to reach an instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    Tcp {
        host: String,
        #[serde(default = "default_scpi_port")]
        port: u16,
    },
    Serial {
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
}

/// One instrument entry (`[[devices]]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    pub kind: DeviceKind,
    pub transport: TransportConfig,
    #[serde(default)]
    pub measurements: Vec<MeasurementConfig>,
}

impl DeviceConfig {
    /// Display name, falling back to the id.
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }

    pub fn definitions(&self) -> Vec<MeasurementDefinition> {
        self.measurements
            .iter()
            .map(MeasurementConfig::definition)
            .collect()
    }
}

/// One periodic measurement (`[[devices.measurements]]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementConfig {
    pub key: MeasurementKey,
    pub kind: MeasurementKind,
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default)]
    pub channel: Option<u8>,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub lower: Option<f64>,
    #[serde(default)]
    pub upper: Option<f64>,
}

impl MeasurementConfig {
    pub fn definition(&self) -> MeasurementDefinition {
        let mut definition = MeasurementDefinition::new(self.key, self.kind)
            .with_interval(self.interval)
            .with_source(self.source.clone());
        definition.channel = self.channel;
        definition.function = self.function.clone();
        definition
    }

    pub fn bounds(&self) -> ThresholdBounds {
        ThresholdBounds::new(self.lower, self.upper)
    }
}

// Default value functions
fn default_name() -> String {
    "labmon".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_idle_expiry() -> Duration {
    DEFAULT_IDLE_EXPIRY
}

fn default_idle_scan_period() -> Duration {
    DEFAULT_IDLE_SCAN_PERIOD
}

fn default_transport_timeout() -> Duration {
    DEFAULT_TRANSPORT_TIMEOUT
}

fn default_query_timeout() -> Duration {
    DEFAULT_QUERY_TIMEOUT
}

fn default_read_chunk_size() -> usize {
    DEFAULT_READ_CHUNK_SIZE
}

fn default_bulk_chunk_size() -> usize {
    DEFAULT_BULK_CHUNK_SIZE
}

fn default_runner_tick() -> Duration {
    DEFAULT_RUNNER_TICK
}

fn default_terminator() -> String {
    "\n".to_string()
}

fn default_scpi_port() -> u16 {
    crate::transport::tcp::DEFAULT_SCPI_PORT
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

impl Settings {
    /// Load from `config/labmon.toml` and `LABMON_*` environment variables.
    pub fn load() -> LabResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path plus environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> LabResult<Self> {
        let settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Check values that deserialize fine but cannot work.
    pub fn validate(&self) -> LabResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(LabError::configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let durations = [
            ("pipeline.idle_expiry", self.pipeline.idle_expiry),
            ("pipeline.idle_scan_period", self.pipeline.idle_scan_period),
            ("io.transport_timeout", self.io.transport_timeout),
            ("io.query_timeout", self.io.query_timeout),
            ("io.runner_tick", self.io.runner_tick),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(LabError::configuration(format!("{} must be non-zero", name)));
            }
        }

        if self.io.read_chunk_size == 0 || self.io.bulk_chunk_size == 0 {
            return Err(LabError::configuration("chunk sizes must be non-zero"));
        }
        if self.io.terminator.is_empty() {
            return Err(LabError::configuration("io.terminator must not be empty"));
        }

        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                return Err(LabError::configuration("device id must not be empty"));
            }
            if !ids.insert(device.id.as_str()) {
                return Err(LabError::configuration(format!(
                    "Duplicate device ID: {}",
                    device.id
                )));
            }
            for measurement in &device.measurements {
                if !keys.insert(measurement.key) {
                    return Err(LabError::configuration(format!(
                        "Duplicate measurement key {} (device {})",
                        measurement.key, device.id
                    )));
                }
                if measurement.interval.is_zero() {
                    return Err(LabError::configuration(format!(
                        "measurement {} has a zero interval",
                        measurement.key
                    )));
                }
                if let (Some(lower), Some(upper)) = (measurement.lower, measurement.upper) {
                    if lower > upper {
                        return Err(LabError::configuration(format!(
                            "measurement {}: lower bound {} exceeds upper bound {}",
                            measurement.key, lower, upper
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn protocol_options(&self) -> ProtocolOptions {
        ProtocolOptions {
            terminator: self.io.terminator.clone(),
            transport_timeout: self.io.transport_timeout,
            query_timeout: self.io.query_timeout,
            read_chunk_size: self.io.read_chunk_size,
            bulk_chunk_size: self.io.bulk_chunk_size,
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            idle: IdlePolicy {
                expiry: self.pipeline.idle_expiry,
                scan_period: self.pipeline.idle_scan_period,
            },
        }
    }

    /// Processor choice per measurement key.
    ///
    /// Power-supply keys get a [`ProcessorSpec::PowerSupply`] pinned to the
    /// measurement's kind, so the bounds apply whatever the source label;
    /// multimeter keys get a plain threshold check.
    pub fn processor_specs(&self) -> HashMap<MeasurementKey, ProcessorSpec> {
        let mut specs = HashMap::new();
        for device in &self.devices {
            for measurement in &device.measurements {
                let spec = match (device.kind, measurement.kind) {
                    (DeviceKind::PowerSupply, MeasurementKind::Voltage) => {
                        ProcessorSpec::PowerSupply {
                            voltage: measurement.bounds(),
                            current: ThresholdBounds::default(),
                            quantity: Some(MeasurementKind::Voltage),
                        }
                    }
                    (DeviceKind::PowerSupply, MeasurementKind::Current) => {
                        ProcessorSpec::PowerSupply {
                            voltage: ThresholdBounds::default(),
                            current: measurement.bounds(),
                            quantity: Some(MeasurementKind::Current),
                        }
                    }
                    _ => ProcessorSpec::Threshold(measurement.bounds()),
                };
                specs.insert(measurement.key, spec);
            }
        }
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{Sample, ThresholdKind};
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
name = "bench"
log_level = "debug"

[pipeline]
idle_expiry = "5m"

[io]
query_timeout = "2s"
runner_tick = "50ms"

[[devices]]
id = "psu1"
display_name = "Bench PSU"
kind = "power_supply"
transport = { type = "tcp", host = "192.168.1.20" }

[[devices.measurements]]
key = 1
kind = "voltage"
interval = "250ms"
channel = 2
lower = 4.5
upper = 5.5

[[devices]]
id = "dmm1"
kind = "multimeter"
transport = { type = "serial", path = "/dev/ttyUSB0", baud_rate = 115200 }

[[devices.measurements]]
key = 2
kind = "generic"
function = "RES"
upper = 1000.0
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(SAMPLE);
        let settings = Settings::load_from(file.path()).unwrap();
        settings.validate().unwrap();

        assert_eq!(settings.application.name, "bench");
        assert_eq!(settings.pipeline.idle_expiry, Duration::from_secs(300));
        assert_eq!(settings.pipeline.idle_scan_period, Duration::from_secs(60));
        assert_eq!(settings.io.query_timeout, Duration::from_secs(2));
        assert_eq!(settings.io.transport_timeout, Duration::from_millis(500));
        assert_eq!(settings.io.read_chunk_size, 128);

        let psu = &settings.devices[0];
        assert_eq!(psu.kind, DeviceKind::PowerSupply);
        assert_eq!(
            psu.transport,
            TransportConfig::Tcp {
                host: "192.168.1.20".to_string(),
                port: 5025
            }
        );
        let defs = psu.definitions();
        assert_eq!(defs[0].interval, Duration::from_millis(250));
        assert_eq!(defs[0].source_label(), "PowerSupply_Voltage_CH2");

        let dmm = &settings.devices[1];
        assert_eq!(dmm.label(), "dmm1");
        assert_eq!(dmm.measurements[0].interval, Duration::from_secs(1));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_duplicate_measurement_keys_across_devices() {
        let file = write_config(&SAMPLE.replace("key = 2", "key = 1"));
        let settings = Settings::load_from(file.path()).unwrap();
        let err = settings.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn test_zero_duration_rejected() {
        let mut settings = Settings::default();
        settings.io.runner_tick = Duration::ZERO;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_processor_specs_by_device_kind() {
        let file = write_config(SAMPLE);
        let settings = Settings::load_from(file.path()).unwrap();
        let specs = settings.processor_specs();

        assert_eq!(
            specs.get(&1),
            Some(&ProcessorSpec::PowerSupply {
                voltage: ThresholdBounds::new(Some(4.5), Some(5.5)),
                current: ThresholdBounds::default(),
                quantity: Some(MeasurementKind::Voltage),
            })
        );
        assert_eq!(
            specs.get(&2),
            Some(&ProcessorSpec::Threshold(ThresholdBounds::new(None, Some(1000.0))))
        );
    }

    #[tokio::test]
    async fn test_custom_source_label_keeps_power_supply_bounds() {
        let file = write_config(
            r#"
[[devices]]
id = "psu1"
kind = "power_supply"
transport = { type = "tcp", host = "10.0.0.5" }

[[devices.measurements]]
key = 1
kind = "voltage"
source = "bench_rail_5v"
upper = 5.5

[[devices.measurements]]
key = 2
kind = "current"
source = "rail_draw"
upper = 0.5
"#,
        );
        let settings = Settings::load_from(file.path()).unwrap();
        let factory = crate::pipeline::processor_factory(settings.processor_specs());

        let mut rail = factory(1).unwrap();
        let breach = rail
            .process(&Sample::now(1, 9.0, "bench_rail_5v"))
            .await
            .unwrap();
        assert_eq!(breach.map(|b| b.kind), Some(ThresholdKind::Upper));

        let mut draw = factory(2).unwrap();
        let breach = draw.process(&Sample::now(2, 0.75, "rail_draw")).await.unwrap();
        assert_eq!(breach.map(|b| b.kind), Some(ThresholdKind::Upper));
        assert!(draw.process(&Sample::now(2, 0.25, "rail_draw")).await.unwrap().is_none());
    }

    #[test]
    fn test_option_conversion() {
        let settings = Settings::default();
        let protocol = settings.protocol_options();
        assert_eq!(protocol, ProtocolOptions::default());
        assert_eq!(settings.pipeline_options().idle, IdlePolicy::default());
    }
}
