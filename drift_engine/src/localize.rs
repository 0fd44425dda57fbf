//! Sub-pixel spot localization.
//!
//! - [`SpotFitter`] - single-crop fitting strategy
//! - [`gaussian`] - 2D Gaussian least squares (Levenberg-Marquardt)
//! - [`centroid`] - background-subtracted intensity centroid
//! - [`pool`] - parallel fan-out of one frame's crops with a per-cycle deadline
//!
//! Fitters work in crop coordinates (`x` = column, `y` = row); the pool
//! translates results back to frame coordinates.

pub mod centroid;
pub mod gaussian;
pub mod pool;

pub use centroid::CentroidFitter;
pub use gaussian::GaussianFitter;
pub use pool::{FitterSet, LocalizationPool, PoolStats};

use crate::config::{FitMethod, FittingConfig};
use drift_common::error::FitFailure;
use drift_common::types::SpotPosition;
use ndarray::ArrayView2;
use std::sync::Arc;

/// Normal-consistent MAD scale.
const MAD_TO_SIGMA: f64 = 1.4826;

/// Localizes one spot inside a crop.
pub trait SpotFitter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fit the spot center in crop pixel coordinates.
    fn fit(&self, crop: ArrayView2<'_, f64>) -> Result<SpotPosition, FitFailure>;
}

/// Crop background level and noise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Background {
    /// Median pixel value.
    pub level: f64,
    /// Robust noise sigma (scaled MAD).
    pub noise: f64,
    /// Brightest pixel value.
    pub peak: f64,
}

impl Background {
    pub fn estimate(crop: ArrayView2<'_, f64>) -> Option<Background> {
        let mut values: Vec<f64> = crop.iter().copied().filter(|v| v.is_finite()).collect();
        if values.is_empty() {
            return None;
        }
        let peak = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let level = median_in_place(&mut values);
        for v in values.iter_mut() {
            *v = (*v - level).abs();
        }
        let noise = MAD_TO_SIGMA * median_in_place(&mut values);
        Some(Background { level, noise, peak })
    }

    /// Peak height above background over noise. Infinite on a noiseless
    /// crop with signal.
    pub fn snr(&self) -> f64 {
        let height = self.peak - self.level;
        if height <= 0.0 {
            0.0
        } else if self.noise > 0.0 {
            height / self.noise
        } else {
            f64::INFINITY
        }
    }

    /// `NoPeak` unless the crop shows a peak at least `min_snr` above noise.
    pub fn require_peak(crop: ArrayView2<'_, f64>, min_snr: f64) -> Result<Background, FitFailure> {
        let bg = Self::estimate(crop).ok_or(FitFailure::NoPeak)?;
        if bg.snr() < min_snr.max(f64::MIN_POSITIVE) {
            return Err(FitFailure::NoPeak);
        }
        Ok(bg)
    }
}

fn median_in_place(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Build one fitter from config.
pub fn build_fitter(method: FitMethod, cfg: &FittingConfig) -> Arc<dyn SpotFitter> {
    match method {
        FitMethod::Gaussian => Arc::new(GaussianFitter::new(
            cfg.max_iterations,
            cfg.initial_sigma_px,
            cfg.min_snr,
        )),
        FitMethod::Centroid => Arc::new(CentroidFitter::new(cfg.min_snr)),
    }
}

/// Build the XY and Z fitters from config.
pub fn build_fitters(cfg: &FittingConfig) -> FitterSet {
    FitterSet {
        xy: build_fitter(cfg.xy_method, cfg),
        z: build_fitter(cfg.z_method, cfg),
    }
}
