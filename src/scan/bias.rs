//! Bias sequence generation.
//!
//! A sweep is defined either by a scalar endpoint (evenly spaced from 0 V) or by an explicit
//! list of voltages. Both forms are polarity-adjusted; explicit lists must be monotonic
//! unless the check is disabled.

use crate::error::{ScanError, ScanResult};
use std::fmt;
use std::str::FromStr;

/// Sign applied to every bias voltage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarity {
    /// Voltages as given
    #[default]
    Positive,
    /// Voltages negated
    Negative,
}

impl Polarity {
    /// `Negative` for values below zero, `Positive` otherwise
    pub fn from_sign(value: f64) -> Self {
        if value < 0.0 {
            Polarity::Negative
        } else {
            Polarity::Positive
        }
    }

    /// `+1.0` or `-1.0`
    pub fn factor(self) -> f64 {
        match self {
            Polarity::Positive => 1.0,
            Polarity::Negative => -1.0,
        }
    }
}

/// Bias specification as given by the operator
#[derive(Debug, Clone, PartialEq)]
pub enum BiasInput {
    /// Sweep from 0 V to this endpoint
    Scalar(f64),
    /// Explicit voltages; each must parse as a float
    Explicit(Vec<String>),
}

impl BiasInput {
    /// Explicit list from numbers
    pub fn values(values: impl IntoIterator<Item = f64>) -> Self {
        BiasInput::Explicit(values.into_iter().map(|v| format!("{v:?}")).collect())
    }
}

impl FromStr for BiasInput {
    type Err = ScanError;

    /// `"100"` is a scalar endpoint, `"0,10,20"` an explicit list.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(',') {
            return Ok(BiasInput::Explicit(
                s.split(',').map(|v| v.trim().to_string()).collect(),
            ));
        }
        let value = s.trim();
        value
            .parse::<f64>()
            .map(BiasInput::Scalar)
            .map_err(|_| ScanError::BiasConversion {
                value: value.to_string(),
            })
    }
}

/// Ordered, finite, non-empty bias voltages of one sweep
#[derive(Debug, Clone, PartialEq)]
pub struct BiasSequence {
    volts: Vec<f64>,
    explicit: bool,
}

impl BiasSequence {
    /// Voltages in sweep order
    pub fn as_slice(&self) -> &[f64] {
        &self.volts
    }

    /// Iterate over the voltages
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.volts.iter().copied()
    }

    /// Number of bias points
    pub fn len(&self) -> usize {
        self.volts.len()
    }

    /// Always false; kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.volts.is_empty()
    }

    /// First bias point
    pub fn first(&self) -> f64 {
        self.volts.first().copied().unwrap_or(0.0)
    }

    /// Last bias point
    pub fn last(&self) -> f64 {
        self.volts.last().copied().unwrap_or(0.0)
    }

    /// Largest magnitude, used for the source range
    pub fn max_abs(&self) -> f64 {
        self.volts.iter().fold(0.0_f64, |m, v| m.max(v.abs()))
    }

    /// One-line description for file comments
    pub fn describe(&self) -> String {
        if self.explicit {
            let list: Vec<String> = self.volts.iter().map(|v| v.to_string()).collect();
            format!("Bias voltages: ({}) V", list.join(", "))
        } else {
            let step = if self.volts.len() > 1 {
                (self.last() - self.first()).abs() / (self.volts.len() - 1) as f64
            } else {
                0.0
            };
            format!("Bias voltage: {} V in {} V steps", self.last(), step)
        }
    }
}

impl fmt::Display for BiasSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Largest number of points in a generated sweep or ramp path
pub const MAX_POINTS: usize = 100_000;

/// Convert a computed point count, rejecting counts above [`MAX_POINTS`].
pub(crate) fn bounded_points(points: f64) -> ScanResult<usize> {
    if points.is_finite() && points <= MAX_POINTS as f64 {
        Ok(points as usize)
    } else {
        Err(ScanError::config(format!(
            "A path of {points} points exceeds the limit of {MAX_POINTS}"
        )))
    }
}

/// `n` evenly spaced points from `start` to `end`, both included exactly.
pub(crate) fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let span = end - start;
            let last = n - 1;
            (0..n)
                .map(|i| {
                    if i == last {
                        end
                    } else {
                        start + span * i as f64 / last as f64
                    }
                })
                .collect()
        }
    }
}

fn is_monotonic(values: &[f64]) -> bool {
    let non_decreasing = values.windows(2).all(|w| w[0] <= w[1]);
    let non_increasing = values.windows(2).all(|w| w[0] >= w[1]);
    non_decreasing || non_increasing
}

/// Build the bias sequence of a sweep.
///
/// - Scalar: `steps` points from 0 to `polarity * bias`; without `steps`, one point per volt
///   (endpoint count rounded up, at least 2).
/// - Explicit: every value parsed and multiplied by the polarity factor; `steps` is ignored.
///   With `check_monotonic`, the result must be non-decreasing or non-increasing.
pub fn generate(
    bias: &BiasInput,
    steps: Option<usize>,
    polarity: Polarity,
    check_monotonic: bool,
) -> ScanResult<BiasSequence> {
    match bias {
        BiasInput::Scalar(value) => {
            if !value.is_finite() {
                return Err(ScanError::config(format!(
                    "Bias voltage must be finite, got {value}"
                )));
            }
            let max_bias = polarity.factor() * value;
            let points = match steps {
                Some(n) if n < 2 => {
                    return Err(ScanError::config(format!(
                        "A bias sweep needs at least 2 steps, got {n}"
                    )))
                }
                Some(n) => bounded_points(n as f64)?,
                None => bounded_points(max_bias.abs().ceil() + 1.0)?.max(2),
            };
            Ok(BiasSequence {
                volts: linspace(0.0, max_bias, points),
                explicit: false,
            })
        }
        BiasInput::Explicit(raw) => {
            if raw.is_empty() {
                return Err(ScanError::config("Bias voltage list is empty"));
            }
            let volts = raw
                .iter()
                .map(|v| {
                    v.trim()
                        .parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f * polarity.factor() + 0.0)
                        .ok_or_else(|| ScanError::BiasConversion { value: v.clone() })
                })
                .collect::<ScanResult<Vec<f64>>>()?;

            if check_monotonic && !is_monotonic(&volts) {
                return Err(ScanError::NotMonotonic);
            }
            Ok(BiasSequence {
                volts,
                explicit: true,
            })
        }
    }
}
