use super::sample::MeasurementKey;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Polling interval used when a definition does not set one.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What a definition measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    /// Output/input voltage (`measure_voltage`)
    Voltage,
    /// Output/input current (`measure_current`)
    Current,
    /// Function-dependent reading (`measure_value`), e.g. a multimeter's active function
    Generic,
}

impl std::fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeasurementKind::Voltage => write!(f, "Voltage"),
            MeasurementKind::Current => write!(f, "Current"),
            MeasurementKind::Generic => write!(f, "Generic"),
        }
    }
}

fn default_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

/// A periodic measurement registered with a runner.
///
/// Definitions are identified by `key` within one runner; registering a second
/// definition with the same key replaces the first.
///
/// # Example
///
/// ```rust
/// use labmon::measurement::{MeasurementDefinition, MeasurementKind};
/// use std::time::Duration;
///
/// let def = MeasurementDefinition::new(1, MeasurementKind::Voltage)
///     .with_interval(Duration::from_millis(250))
///     .on_channel(2);
/// assert_eq!(def.source_label(), "PowerSupply_Voltage_CH2");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementDefinition {
    /// Routing key for produced samples
    pub key: MeasurementKey,
    /// Measurement kind
    pub kind: MeasurementKind,
    /// Time between two measurements of this definition
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Output channel (power supplies)
    #[serde(default)]
    pub channel: Option<u8>,
    /// Measurement function (multimeters), e.g. `VOLT:DC`
    #[serde(default)]
    pub function: Option<String>,
    /// Source label stamped on samples; derived from kind/channel/function when empty
    #[serde(default)]
    pub source: String,
}

impl MeasurementDefinition {
    pub fn new(key: MeasurementKey, kind: MeasurementKind) -> Self {
        Self {
            key,
            kind,
            interval: DEFAULT_POLL_INTERVAL,
            channel: None,
            function: None,
            source: String::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn on_channel(mut self, channel: u8) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Label stamped on every sample this definition produces.
    pub fn source_label(&self) -> String {
        if !self.source.is_empty() {
            return self.source.clone();
        }
        let channel = self.channel.unwrap_or(1);
        match self.kind {
            MeasurementKind::Voltage => format!("PowerSupply_Voltage_CH{}", channel),
            MeasurementKind::Current => format!("PowerSupply_Current_CH{}", channel),
            MeasurementKind::Generic => match &self.function {
                Some(function) => format!("Multimeter_{}", function),
                None => "Multimeter".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let def = MeasurementDefinition::new(7, MeasurementKind::Current);
        assert_eq!(def.interval, Duration::from_secs(1));
        assert_eq!(def.channel, None);
        assert_eq!(def.source_label(), "PowerSupply_Current_CH1");
    }

    #[test]
    fn test_explicit_source_wins() {
        let def = MeasurementDefinition::new(7, MeasurementKind::Voltage)
            .on_channel(3)
            .with_source("bench_rail_5v");
        assert_eq!(def.source_label(), "bench_rail_5v");
    }

    #[test]
    fn test_generic_label_uses_function() {
        let def = MeasurementDefinition::new(9, MeasurementKind::Generic).with_function("RES");
        assert_eq!(def.source_label(), "Multimeter_RES");

        let bare = MeasurementDefinition::new(9, MeasurementKind::Generic);
        assert_eq!(bare.source_label(), "Multimeter");
    }
}
