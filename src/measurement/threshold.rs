use super::sample::Sample;
use serde::{Deserialize, Serialize};

/// Which bound a sample crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThresholdKind {
    Upper,
    Lower,
}

impl std::fmt::Display for ThresholdKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThresholdKind::Upper => write!(f, "upper"),
            ThresholdKind::Lower => write!(f, "lower"),
        }
    }
}

/// Optional upper/lower limits for one measured quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBounds {
    #[serde(default)]
    pub upper: Option<f64>,
    #[serde(default)]
    pub lower: Option<f64>,
}

impl ThresholdBounds {
    pub fn new(lower: Option<f64>, upper: Option<f64>) -> Self {
        Self { upper, lower }
    }

    pub fn is_empty(&self) -> bool {
        self.upper.is_none() && self.lower.is_none()
    }

    /// Compare `value` against the bounds. Upper is checked first; strict inequality.
    ///
    /// There is no hysteresis: a value that stays out of range is reported on
    /// every call.
    pub fn check(&self, value: f64) -> Option<ThresholdKind> {
        if self.upper.is_some_and(|upper| value > upper) {
            Some(ThresholdKind::Upper)
        } else if self.lower.is_some_and(|lower| value < lower) {
            Some(ThresholdKind::Lower)
        } else {
            None
        }
    }
}

/// A sample that crossed a bound, with a message for operators.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdBreach {
    pub kind: ThresholdKind,
    pub message: String,
    pub sample: Sample,
}

impl ThresholdBreach {
    /// Describe a breach of `quantity` (e.g. "voltage") by `sample`.
    pub fn new(kind: ThresholdKind, quantity: &str, bound: f64, sample: Sample) -> Self {
        let message = match kind {
            ThresholdKind::Upper => format!(
                "{} {} exceeded upper threshold {} (source {})",
                quantity, sample.value, bound, sample.source
            ),
            ThresholdKind::Lower => format!(
                "{} {} fell below lower threshold {} (source {})",
                quantity, sample.value, bound, sample.source
            ),
        };
        Self {
            kind,
            message,
            sample,
        }
    }
}
