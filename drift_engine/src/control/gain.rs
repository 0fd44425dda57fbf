//! Gain parameter values.
//!
//! Gains are set either as one scalar broadcast to all three axes or as an
//! explicit `[x, y, z]` vector.

use crate::error::{Result, StabilizerError};
use serde::{Deserialize, Serialize};

/// Scalar or per-axis gain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GainValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

impl GainValue {
    /// Expand into per-axis gains `[x, y, z]`.
    ///
    /// # Errors
    /// `InvalidParameter` when a vector does not have exactly three entries
    /// or any entry is not finite.
    pub fn resolve(&self) -> Result<[f64; 3]> {
        let axes = match self {
            GainValue::Scalar(v) => [*v; 3],
            GainValue::Vector(v) => <[f64; 3]>::try_from(v.as_slice()).map_err(|_| {
                StabilizerError::InvalidParameter(format!(
                    "gain vector must have 3 entries, got {}",
                    v.len()
                ))
            })?,
        };
        if axes.iter().any(|g| !g.is_finite()) {
            return Err(StabilizerError::InvalidParameter(format!(
                "gain must be finite, got {axes:?}"
            )));
        }
        Ok(axes)
    }
}

impl From<f64> for GainValue {
    fn from(v: f64) -> Self {
        GainValue::Scalar(v)
    }
}

impl From<[f64; 3]> for GainValue {
    fn from(v: [f64; 3]) -> Self {
        GainValue::Vector(v.to_vec())
    }
}

impl From<Vec<f64>> for GainValue {
    fn from(v: Vec<f64>) -> Self {
        GainValue::Vector(v)
    }
}

impl From<&[f64]> for GainValue {
    fn from(v: &[f64]) -> Self {
        GainValue::Vector(v.to_vec())
    }
}
