//! Intensity-weighted centroid with median background subtraction.
//!
//! Cheap and robust against saturation; used for the axial reflection
//! spot, whose profile is rarely Gaussian.

use super::{Background, SpotFitter};
use drift_common::error::FitFailure;
use drift_common::types::SpotPosition;
use ndarray::ArrayView2;

#[derive(Debug, Clone)]
pub struct CentroidFitter {
    min_snr: f64,
}

impl CentroidFitter {
    pub fn new(min_snr: f64) -> Self {
        Self { min_snr }
    }
}

impl SpotFitter for CentroidFitter {
    fn name(&self) -> &'static str {
        "centroid"
    }

    fn fit(&self, crop: ArrayView2<'_, f64>) -> Result<SpotPosition, FitFailure> {
        let bg = Background::require_peak(crop, self.min_snr)?;

        let (mut sum, mut sx, mut sy) = (0.0, 0.0, 0.0);
        for ((r, c), &v) in crop.indexed_iter() {
            let w = v - bg.level;
            if w > 0.0 && w.is_finite() {
                sum += w;
                sx += w * c as f64;
                sy += w * r as f64;
            }
        }
        if sum <= 0.0 {
            return Err(FitFailure::NoPeak);
        }
        let pos = SpotPosition {
            x: sx / sum,
            y: sy / sum,
        };
        let (rows, cols) = crop.dim();
        if !(pos.x.is_finite() && pos.y.is_finite()) || pos.x > (cols - 1) as f64 || pos.y > (rows - 1) as f64 {
            return Err(FitFailure::OutOfBounds);
        }
        Ok(pos)
    }
}
