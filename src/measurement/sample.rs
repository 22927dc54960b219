use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Integer identifier partitioning samples into independent ordered streams.
pub type MeasurementKey = i32;

/// One timestamped, keyed measurement value.
///
/// Produced by a [`MeasurementRunner`](crate::runner::MeasurementRunner) and
/// consumed exactly once by the key worker that owns `key`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Routing key
    pub key: MeasurementKey,
    /// Measured value
    pub value: f64,
    /// Acquisition time (UTC)
    pub timestamp: DateTime<Utc>,
    /// Source label, e.g. `PowerSupply_Voltage_CH1`
    pub source: String,
}

impl Sample {
    /// Stamp a new sample with the current time.
    pub fn now(key: MeasurementKey, value: f64, source: impl Into<String>) -> Self {
        Self {
            key,
            value,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_now_stamps_current_time() {
        let before = Utc::now();
        let sample = Sample::now(3, 1.25, "Multimeter_VOLT:DC");
        let after = Utc::now();

        assert_eq!(sample.key, 3);
        assert_eq!(sample.value, 1.25);
        assert_eq!(sample.source, "Multimeter_VOLT:DC");
        assert!(sample.timestamp >= before && sample.timestamp <= after);
    }
}
