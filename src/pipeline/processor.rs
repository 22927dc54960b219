//! Per-key processing steps.
//!
//! A [`SampleProcessor`] is owned by exactly one key worker and only ever
//! called from that worker's loop, so its state needs no locking.

use crate::error::LabResult;
use crate::measurement::{
    MeasurementKey, MeasurementKind, Sample, ThresholdBounds, ThresholdBreach, ThresholdKind,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Processing step invoked for every sample of one key, in order.
#[async_trait]
pub trait SampleProcessor: Send {
    /// Update state from `sample`; return a breach when a bound was crossed.
    async fn process(&mut self, sample: &Sample) -> LabResult<Option<ThresholdBreach>>;
}

/// Builds the processor for a newly created worker.
pub type ProcessorFactory =
    Arc<dyn Fn(MeasurementKey) -> LabResult<Box<dyn SampleProcessor>> + Send + Sync>;

/// Bound-checking processor for a single quantity (multimeter style).
#[derive(Debug, Clone, Default)]
pub struct ThresholdProcessor {
    bounds: ThresholdBounds,
    last_value: Option<f64>,
    last_source: Option<String>,
}

impl ThresholdProcessor {
    pub fn new(bounds: ThresholdBounds) -> Self {
        Self {
            bounds,
            ..Self::default()
        }
    }

    pub fn last_value(&self) -> Option<f64> {
        self.last_value
    }

    pub fn last_source(&self) -> Option<&str> {
        self.last_source.as_deref()
    }
}

#[async_trait]
impl SampleProcessor for ThresholdProcessor {
    async fn process(&mut self, sample: &Sample) -> LabResult<Option<ThresholdBreach>> {
        self.last_value = Some(sample.value);
        self.last_source = Some(sample.source.clone());
        Ok(check(&self.bounds, "value", sample))
    }
}

/// Power-supply processor with separate voltage and current bounds.
///
/// A processor built for a known quantity checks every sample against that
/// quantity's bounds, whatever the source label says. Without one, samples
/// are routed by label: one containing "voltage" (any case) is checked
/// against the voltage bounds, one containing "current" against the current
/// bounds, and anything else is accepted without checks.
#[derive(Debug, Clone, Default)]
pub struct PowerSupplyProcessor {
    voltage: ThresholdBounds,
    current: ThresholdBounds,
    quantity: Option<MeasurementKind>,
    last_voltage: Option<f64>,
    last_current: Option<f64>,
}

impl PowerSupplyProcessor {
    pub fn new(voltage: ThresholdBounds, current: ThresholdBounds) -> Self {
        Self {
            voltage,
            current,
            ..Self::default()
        }
    }

    /// Pin the quantity this key measures; label routing is skipped.
    pub fn for_quantity(mut self, quantity: MeasurementKind) -> Self {
        self.quantity = Some(quantity);
        self
    }

    fn route(&self, sample: &Sample) -> Option<MeasurementKind> {
        match self.quantity {
            Some(kind @ (MeasurementKind::Voltage | MeasurementKind::Current)) => Some(kind),
            _ => {
                let source = sample.source.to_ascii_lowercase();
                if source.contains("voltage") {
                    Some(MeasurementKind::Voltage)
                } else if source.contains("current") {
                    Some(MeasurementKind::Current)
                } else {
                    None
                }
            }
        }
    }

    pub fn last_voltage(&self) -> Option<f64> {
        self.last_voltage
    }

    pub fn last_current(&self) -> Option<f64> {
        self.last_current
    }
}

#[async_trait]
impl SampleProcessor for PowerSupplyProcessor {
    async fn process(&mut self, sample: &Sample) -> LabResult<Option<ThresholdBreach>> {
        match self.route(sample) {
            Some(MeasurementKind::Voltage) => {
                self.last_voltage = Some(sample.value);
                Ok(check(&self.voltage, "voltage", sample))
            }
            Some(MeasurementKind::Current) => {
                self.last_current = Some(sample.value);
                Ok(check(&self.current, "current", sample))
            }
            _ => Ok(None),
        }
    }
}

/// At most one breach per sample; upper wins when both could apply.
fn check(bounds: &ThresholdBounds, quantity: &str, sample: &Sample) -> Option<ThresholdBreach> {
    let kind = bounds.check(sample.value)?;
    let bound = match kind {
        ThresholdKind::Upper => bounds.upper,
        ThresholdKind::Lower => bounds.lower,
    }?;
    Some(ThresholdBreach::new(kind, quantity, bound, sample.clone()))
}

/// Which processor a key gets.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorSpec {
    Threshold(ThresholdBounds),
    PowerSupply {
        voltage: ThresholdBounds,
        current: ThresholdBounds,
        /// Quantity the key measures; `None` routes by source label.
        quantity: Option<MeasurementKind>,
    },
}

impl ProcessorSpec {
    pub fn build(&self) -> Box<dyn SampleProcessor> {
        match self {
            ProcessorSpec::Threshold(bounds) => Box::new(ThresholdProcessor::new(*bounds)),
            ProcessorSpec::PowerSupply {
                voltage,
                current,
                quantity,
            } => {
                let processor = PowerSupplyProcessor::new(*voltage, *current);
                Box::new(match quantity {
                    Some(kind) => processor.for_quantity(*kind),
                    None => processor,
                })
            }
        }
    }
}

/// Factory that looks each key up in `specs`; unknown keys get an unbounded
/// [`ThresholdProcessor`], which only tracks the last value.
pub fn processor_factory(specs: HashMap<MeasurementKey, ProcessorSpec>) -> ProcessorFactory {
    Arc::new(move |key: MeasurementKey| {
        let processor: Box<dyn SampleProcessor> = match specs.get(&key) {
            Some(spec) => spec.build(),
            None => Box::new(ThresholdProcessor::default()),
        };
        Ok(processor)
    })
}
