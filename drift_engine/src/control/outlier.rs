//! PI response with per-cycle outlier rejection across XY fiducials.
//!
//! A fiducial that detaches or drifts on its own must not drag the whole
//! field. Each cycle the valid XY shifts are screened with a robust
//! statistic; survivors are averaged and fed to the PI law. Rejection holds
//! for the current cycle only.

use super::gain::GainValue;
use super::pi::{PiCore, PiGains};
use super::{ResponseController, mean_of};
use crate::error::{Result, StabilizerError};
use drift_common::types::{Correction, Offset2};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Scale factor turning a MAD into a standard-deviation estimate for normal
/// data.
const MAD_NORMAL_CONSISTENCY: f64 = 0.6745;

/// Minimum survivors for another round of SD re-estimation.
const SD_MIN_SURVIVORS: usize = 3;

/// Robust statistic used to screen XY shifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectionStrategy {
    /// Modified z-score around the median: `0.6745·|x − median| / MAD`.
    #[default]
    Mad,
    /// Iterative z-score around the mean: `|x − mean| / SD`.
    Std,
}

impl RejectionStrategy {
    pub fn default_threshold(self) -> f64 {
        match self {
            RejectionStrategy::Mad => 1.5,
            RejectionStrategy::Std => 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutlierRejectingPi {
    core: PiCore,
    strategy: RejectionStrategy,
    threshold: f64,
    /// Times each ROI was rejected since the last `reset_xy`.
    rejections: Vec<u64>,
}

impl OutlierRejectingPi {
    pub fn new(
        kp: impl Into<GainValue>,
        ki: impl Into<GainValue>,
        max_shift: f64,
        strategy: RejectionStrategy,
        threshold: f64,
    ) -> Result<Self> {
        if !(threshold.is_finite() && threshold > 0.0) {
            return Err(StabilizerError::InvalidParameter(format!(
                "rejection threshold must be > 0, got {threshold}"
            )));
        }
        Ok(Self {
            core: PiCore::new(kp.into(), ki.into(), max_shift)?,
            strategy,
            threshold,
            rejections: Vec::new(),
        })
    }

    pub fn strategy(&self) -> RejectionStrategy {
        self.strategy
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn core(&self) -> &PiCore {
        &self.core
    }

    /// Rejection count per ROI index since the last XY reset.
    pub fn rejections(&self) -> &[u64] {
        &self.rejections
    }

    /// Indices into `shifts` that survive screening this cycle.
    pub fn screen(&self, shifts: &[Option<Offset2>]) -> Vec<usize> {
        let valid: Vec<usize> = shifts
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.filter(Offset2::is_finite).map(|_| i))
            .collect();
        if valid.len() < 2 {
            return valid;
        }
        let points = |idx: &[usize]| -> Vec<Offset2> {
            idx.iter().filter_map(|&i| shifts[i]).collect()
        };

        let kept = match self.strategy {
            RejectionStrategy::Mad => {
                let pts = points(&valid);
                let xs: Vec<f64> = pts.iter().map(|p| p.x).collect();
                let ys: Vec<f64> = pts.iter().map(|p| p.y).collect();
                let (mx, madx) = median_mad(&xs);
                let (my, mady) = median_mad(&ys);
                valid
                    .iter()
                    .zip(&pts)
                    .filter(|(_, p)| {
                        !exceeds(MAD_NORMAL_CONSISTENCY * (p.x - mx).abs(), madx, self.threshold)
                            && !exceeds(MAD_NORMAL_CONSISTENCY * (p.y - my).abs(), mady, self.threshold)
                    })
                    .map(|(&i, _)| i)
                    .collect()
            }
            RejectionStrategy::Std => {
                let mut current = valid.clone();
                loop {
                    let pts = points(&current);
                    let (mx, sx) = mean_sd(pts.iter().map(|p| p.x));
                    let (my, sy) = mean_sd(pts.iter().map(|p| p.y));
                    let next: Vec<usize> = current
                        .iter()
                        .zip(&pts)
                        .filter(|(_, p)| {
                            !exceeds((p.x - mx).abs(), sx, self.threshold)
                                && !exceeds((p.y - my).abs(), sy, self.threshold)
                        })
                        .map(|(&i, _)| i)
                        .collect();
                    if next.len() == current.len() || next.len() < SD_MIN_SURVIVORS {
                        break current;
                    }
                    current = next;
                }
            }
        };

        if kept.is_empty() { valid } else { kept }
    }
}

/// Deviation exceeds `threshold · scale`. A zero scale rejects any nonzero
/// deviation.
fn exceeds(deviation: f64, scale: f64, threshold: f64) -> bool {
    if scale > 0.0 {
        deviation / scale > threshold
    } else {
        deviation > 0.0
    }
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

fn median_mad(values: &[f64]) -> (f64, f64) {
    let mut v = values.to_vec();
    let m = median(&mut v);
    let mut dev: Vec<f64> = values.iter().map(|x| (x - m).abs()).collect();
    (m, median(&mut dev))
}

/// Mean and population standard deviation.
fn mean_sd(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let n = values.clone().count() as f64;
    let mean = values.clone().sum::<f64>() / n;
    let var = values.map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

impl ResponseController for OutlierRejectingPi {
    fn name(&self) -> &'static str {
        match self.strategy {
            RejectionStrategy::Mad => "outlier_pi_mad",
            RejectionStrategy::Std => "outlier_pi_std",
        }
    }

    fn reset_xy(&mut self, n_rois: usize) {
        self.core.reset_xy();
        self.rejections = vec![0; n_rois];
    }

    fn reset_z(&mut self) {
        self.core.reset_z();
    }

    fn set_gain_p(&mut self, v: GainValue) -> Result<()> {
        self.core.set_gain_p(v)
    }

    fn set_gain_i(&mut self, v: GainValue) -> Result<()> {
        self.core.set_gain_i(v)
    }

    fn gains(&self) -> PiGains {
        self.core.gains()
    }

    fn response(&mut self, t: f64, xy_shifts: Option<&[Option<Offset2>]>, z_shift: Option<f64>) -> Correction {
        let xy = xy_shifts.map(|shifts| {
            let kept = self.screen(shifts);
            if self.rejections.len() < shifts.len() {
                self.rejections.resize(shifts.len(), 0);
            }
            let mut rejected = 0usize;
            for (i, s) in shifts.iter().enumerate() {
                if s.is_some_and(|p| p.is_finite()) && !kept.contains(&i) {
                    self.rejections[i] += 1;
                    rejected += 1;
                }
            }
            if rejected > 0 {
                debug!(rejected, kept = kept.len(), "XY outliers rejected");
            }
            let pts: Vec<Offset2> = kept.iter().filter_map(|&i| shifts[i]).collect();
            mean_of(&pts)
        });
        self.core.step(t, xy, z_shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::pi::PiController;
    use approx::assert_abs_diff_eq;

    fn s(x: f64, y: f64) -> Option<Offset2> {
        Some(Offset2::new(x, y))
    }

    fn orpi(strategy: RejectionStrategy) -> OutlierRejectingPi {
        OutlierRejectingPi::new(0.5, 0.2, 1000.0, strategy, strategy.default_threshold()).unwrap()
    }

    #[test]
    fn mad_rejects_gross_outlier() {
        let mut c = orpi(RejectionStrategy::Mad);
        c.reset_xy(3);
        let mut reference = PiController::new(0.5, 0.2, 1000.0).unwrap();

        let with_outlier = [s(1.0, 1.0), s(1.0, 1.0), s(50.0, 50.0)];
        let clean = [s(1.0, 1.0), s(1.0, 1.0)];
        for t in [0.0, 0.1, 0.2] {
            let a = c.response(t, Some(&with_outlier), None);
            let b = reference.response(t, Some(&clean), None);
            assert_abs_diff_eq!(a.dx, b.dx, epsilon = 1e-12);
            assert_abs_diff_eq!(a.dy, b.dy, epsilon = 1e-12);
        }
        assert_eq!(c.rejections(), &[0, 0, 3]);
    }

    #[test]
    fn mad_keeps_consistent_field() {
        let c = orpi(RejectionStrategy::Mad);
        let shifts = [s(1.0, 2.0), s(1.1, 2.1), s(0.9, 1.9), s(1.05, 2.05), s(0.95, 1.95)];
        assert_eq!(c.screen(&shifts), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn std_iterates_until_stable() {
        let c = orpi(RejectionStrategy::Std);
        let mut shifts: Vec<Option<Offset2>> = (0..10).map(|i| s(i as f64 * 0.01, 0.0)).collect();
        shifts.push(s(30.0, 0.0));
        shifts.push(None);
        let kept = c.screen(&shifts);
        assert_eq!(kept, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn single_valid_roi_is_plain_average() {
        let mut c = orpi(RejectionStrategy::Mad);
        let mut reference = PiController::new(0.5, 0.2, 1000.0).unwrap();
        let shifts = [None, s(7.0, -3.0), None];
        assert_eq!(
            c.response(0.0, Some(&shifts), Some(1.0)),
            reference.response(0.0, Some(&shifts), Some(1.0))
        );
    }

    #[test]
    fn failures_are_not_counted_as_rejections() {
        let mut c = orpi(RejectionStrategy::Mad);
        c.reset_xy(3);
        c.response(0.0, Some(&[None, s(1.0, 1.0), s(1.0, 1.0)]), None);
        assert_eq!(c.rejections(), &[0, 0, 0]);
    }

    #[test]
    fn reset_clears_rejection_counts() {
        let mut c = orpi(RejectionStrategy::Mad);
        c.reset_xy(3);
        c.response(0.0, Some(&[s(0.0, 0.0), s(0.0, 0.0), s(9.0, 9.0)]), None);
        c.reset_xy(4);
        assert_eq!(c.rejections(), &[0, 0, 0, 0]);
    }

    #[test]
    fn invalid_threshold_rejected() {
        let err = OutlierRejectingPi::new(0.1, 0.1, 10.0, RejectionStrategy::Std, 0.0).unwrap_err();
        assert!(matches!(err, StabilizerError::InvalidParameter(_)));
    }

    #[test]
    fn nan_shift_never_panics() {
        let mut c = orpi(RejectionStrategy::Std);
        let out = c.response(0.0, Some(&[s(f64::NAN, 1.0), s(1.0, 1.0), s(1.0, 1.0)]), Some(f64::NAN));
        assert!(out.dx.is_finite() && out.dz == 0.0);
    }
}
