//! Pixel to nanometre calibration.
//!
//! Samples pair a known stage displacement with the measured spot shift.
//! A straight line with intercept is fitted per image axis by least
//! squares; the inverse slope is the nm-per-pixel scale. For Z the spot
//! moves along an arbitrary sensor direction, so both pixel components are
//! fitted and combined into an angle and a scale.
//!
//! [`routine`] drives the stage to collect samples on a running engine.

pub mod routine;

pub use routine::CalibrationRoutine;

use crate::error::{Result, StabilizerError};
use drift_common::types::{Offset2, XyCalibration, ZCalibration};
use nalgebra::{Matrix2, Vector2};
use serde::Serialize;

/// Fewest samples a fit accepts.
pub const MIN_CALIBRATION_SAMPLES: usize = 3;

/// Slopes below this (px per nm) mean the spot did not follow the stage.
const MIN_SLOPE_PX_PER_NM: f64 = 1e-9;

/// Known stage displacement and the spot shift it produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibrationSample {
    pub displacement_nm: f64,
    pub shift_px: Offset2,
}

impl CalibrationSample {
    pub fn new(displacement_nm: f64, shift_px: Offset2) -> Self {
        Self {
            displacement_nm,
            shift_px,
        }
    }
}

/// `y = slope * x + intercept`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    /// Coefficient of determination.
    pub r_squared: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct XyCalibrationResult {
    pub calibration: XyCalibration,
    /// Image x shift against stage x displacement, px per nm.
    pub fit_x: LinearFit,
    /// Image y shift against stage y displacement, px per nm.
    pub fit_y: LinearFit,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZCalibrationResult {
    pub calibration: ZCalibration,
    pub fit_x: LinearFit,
    pub fit_y: LinearFit,
}

// ─── Fitting ────────────────────────────────────────────────────────

/// Least-squares line through `(xs[i], ys[i])`.
pub fn fit_line(xs: &[f64], ys: &[f64]) -> Result<LinearFit> {
    let n = xs.len().min(ys.len());
    if n < MIN_CALIBRATION_SAMPLES {
        return Err(StabilizerError::InsufficientCalibrationData {
            got: n,
            need: MIN_CALIBRATION_SAMPLES,
        });
    }
    if xs.iter().chain(ys).any(|v| !v.is_finite()) {
        return Err(StabilizerError::DegenerateCalibration("non-finite sample".to_string()));
    }

    // Normal equations of the design matrix [x 1].
    let (mut sxx, mut sx, mut sxy, mut sy) = (0.0, 0.0, 0.0, 0.0);
    for (&x, &y) in xs.iter().zip(ys) {
        sxx += x * x;
        sx += x;
        sxy += x * y;
        sy += y;
    }
    let a = Matrix2::new(sxx, sx, sx, n as f64);
    let b = Vector2::new(sxy, sy);
    let spread = sxx - sx * sx / n as f64;
    if spread <= f64::EPSILON * sxx.max(1.0) {
        return Err(StabilizerError::DegenerateCalibration(
            "all displacements are equal".to_string(),
        ));
    }
    let sol = a
        .lu()
        .solve(&b)
        .ok_or_else(|| StabilizerError::DegenerateCalibration("singular normal equations".to_string()))?;
    let (slope, intercept) = (sol[0], sol[1]);

    let mean_y = sy / n as f64;
    let (mut ss_res, mut ss_tot) = (0.0, 0.0);
    for (&x, &y) in xs.iter().zip(ys) {
        ss_res += (y - (slope * x + intercept)).powi(2);
        ss_tot += (y - mean_y).powi(2);
    }
    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 1.0 };

    Ok(LinearFit {
        slope,
        intercept,
        r_squared,
    })
}

fn inverse_scale(slope: f64, axis: &str) -> Result<f64> {
    if slope.abs() < MIN_SLOPE_PX_PER_NM {
        return Err(StabilizerError::DegenerateCalibration(format!(
            "spot does not follow the stage along {axis}"
        )));
    }
    Ok(1.0 / slope)
}

/// Lateral calibration from an x scan and a y scan.
///
/// The sign of each scale is kept: a negative scale means the image axis
/// runs against the stage axis.
pub fn fit_xy(x_scan: &[CalibrationSample], y_scan: &[CalibrationSample]) -> Result<XyCalibrationResult> {
    let got = x_scan.len().min(y_scan.len());
    if got < MIN_CALIBRATION_SAMPLES {
        return Err(StabilizerError::InsufficientCalibrationData {
            got,
            need: MIN_CALIBRATION_SAMPLES,
        });
    }
    let (dx, sx): (Vec<f64>, Vec<f64>) = x_scan.iter().map(|s| (s.displacement_nm, s.shift_px.x)).unzip();
    let (dy, sy): (Vec<f64>, Vec<f64>) = y_scan.iter().map(|s| (s.displacement_nm, s.shift_px.y)).unzip();
    let fit_x = fit_line(&dx, &sx)?;
    let fit_y = fit_line(&dy, &sy)?;

    Ok(XyCalibrationResult {
        calibration: XyCalibration {
            nm_per_px_x: inverse_scale(fit_x.slope, "x")?,
            nm_per_px_y: inverse_scale(fit_y.slope, "y")?,
        },
        fit_x,
        fit_y,
    })
}

/// Axial calibration from a z scan.
pub fn fit_z(scan: &[CalibrationSample]) -> Result<ZCalibrationResult> {
    if scan.len() < MIN_CALIBRATION_SAMPLES {
        return Err(StabilizerError::InsufficientCalibrationData {
            got: scan.len(),
            need: MIN_CALIBRATION_SAMPLES,
        });
    }
    let d: Vec<f64> = scan.iter().map(|s| s.displacement_nm).collect();
    let sx: Vec<f64> = scan.iter().map(|s| s.shift_px.x).collect();
    let sy: Vec<f64> = scan.iter().map(|s| s.shift_px.y).collect();
    let fit_x = fit_line(&d, &sx)?;
    let fit_y = fit_line(&d, &sy)?;

    let magnitude = fit_x.slope.hypot(fit_y.slope);
    let nm_per_px = inverse_scale(magnitude, "z")?;
    Ok(ZCalibrationResult {
        calibration: ZCalibration {
            angle_rad: fit_y.slope.atan2(fit_x.slope),
            nm_per_px,
        },
        fit_x,
        fit_y,
    })
}
