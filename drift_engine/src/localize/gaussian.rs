//! Symmetric 2D Gaussian least-squares fit.
//!
//! Model: `f(x, y) = A · exp(-((x - x0)² + (y - y0)²) / (2σ²)) + b`,
//! parameters `[A, x0, y0, σ, b]`, solved with Levenberg-Marquardt on the
//! 5x5 normal equations. Initial guess from the background-subtracted
//! centroid.

use super::centroid::CentroidFitter;
use super::{Background, SpotFitter};
use drift_common::error::FitFailure;
use drift_common::types::SpotPosition;
use nalgebra::{Matrix5, Vector5};
use ndarray::ArrayView2;

const P_AMP: usize = 0;
const P_X0: usize = 1;
const P_Y0: usize = 2;
const P_SIGMA: usize = 3;

/// Center step below which the fit is considered converged, pixels.
const CENTER_TOL_PX: f64 = 1e-6;
const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MAX: f64 = 1e10;

#[derive(Debug, Clone)]
pub struct GaussianFitter {
    max_iterations: u32,
    initial_sigma: f64,
    min_snr: f64,
    seed: CentroidFitter,
}

impl GaussianFitter {
    pub fn new(max_iterations: u32, initial_sigma: f64, min_snr: f64) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
            initial_sigma: if initial_sigma > 0.0 { initial_sigma } else { 1.5 },
            min_snr,
            seed: CentroidFitter::new(min_snr),
        }
    }
}

/// Residual sum of squares plus, optionally, the normal equations.
fn evaluate(crop: ArrayView2<'_, f64>, p: &Vector5<f64>, with_jacobian: bool) -> (f64, Matrix5<f64>, Vector5<f64>) {
    let mut jtj = Matrix5::<f64>::zeros();
    let mut jtr = Vector5::<f64>::zeros();
    let mut cost = 0.0;
    let (amp, x0, y0, sigma, offset) = (p[0], p[1], p[2], p[3], p[4]);
    let inv_s2 = 1.0 / (sigma * sigma);

    for ((r, c), &v) in crop.indexed_iter() {
        let dx = c as f64 - x0;
        let dy = r as f64 - y0;
        let d2 = dx * dx + dy * dy;
        let g = (-0.5 * d2 * inv_s2).exp();
        let residual = v - (amp * g + offset);
        cost += residual * residual;
        if with_jacobian {
            let ag = amp * g;
            let j = Vector5::new(g, ag * dx * inv_s2, ag * dy * inv_s2, ag * d2 * inv_s2 / sigma, 1.0);
            jtj += j * j.transpose();
            jtr += j * residual;
        }
    }
    (cost, jtj, jtr)
}

impl SpotFitter for GaussianFitter {
    fn name(&self) -> &'static str {
        "gaussian"
    }

    fn fit(&self, crop: ArrayView2<'_, f64>) -> Result<SpotPosition, FitFailure> {
        let bg = Background::require_peak(crop, self.min_snr)?;
        let start = self.seed.fit(crop)?;
        let (rows, cols) = crop.dim();

        let mut p = Vector5::new(bg.peak - bg.level, start.x, start.y, self.initial_sigma, bg.level);
        let (mut cost, mut jtj, mut jtr) = evaluate(crop, &p, true);
        let mut lambda = LAMBDA_INIT;
        let mut converged = false;

        for _ in 0..self.max_iterations {
            let mut a = jtj;
            for i in 0..5 {
                a[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
            }
            let Some(step) = a.lu().solve(&jtr) else {
                lambda *= 10.0;
                if lambda > LAMBDA_MAX {
                    break;
                }
                continue;
            };
            if step.iter().any(|s| !s.is_finite()) {
                break;
            }

            let candidate = p + step;
            if candidate[P_SIGMA] <= 0.0 {
                lambda *= 10.0;
                continue;
            }
            let (new_cost, _, _) = evaluate(crop, &candidate, false);
            if new_cost < cost {
                // Tiny steps under heavy damping say nothing about convergence.
                let small = lambda <= 1.0
                    && step[P_X0].abs() < CENTER_TOL_PX
                    && step[P_Y0].abs() < CENTER_TOL_PX;
                let flat = (cost - new_cost) <= 1e-12 * cost.max(1e-300);
                p = candidate;
                (cost, jtj, jtr) = evaluate(crop, &p, true);
                lambda = (lambda / 10.0).max(1e-12);
                if small || flat {
                    converged = true;
                    break;
                }
            } else {
                lambda *= 10.0;
                if lambda > LAMBDA_MAX {
                    // No downhill step left: at a minimum to machine precision.
                    converged = true;
                    break;
                }
            }
        }

        if !converged {
            return Err(FitFailure::NotConverged {
                iterations: self.max_iterations,
            });
        }
        if !p.iter().all(|v| v.is_finite()) || p[P_AMP] <= 0.0 {
            return Err(FitFailure::NoPeak);
        }
        let (x, y) = (p[P_X0], p[P_Y0]);
        let inside = x >= -0.5 && y >= -0.5 && x <= cols as f64 - 0.5 && y <= rows as f64 - 0.5;
        if !inside || p[P_SIGMA] > rows.max(cols) as f64 {
            return Err(FitFailure::OutOfBounds);
        }
        Ok(SpotPosition { x, y })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::localize::test_support::gaussian_crop;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn recovers_noiseless_center() {
        let crop = gaussian_crop(15, 15, 6.37, 8.12, 1.7, 500.0, 20.0);
        let p = GaussianFitter::new(50, 1.5, 3.0).fit(crop.view()).unwrap();
        assert_abs_diff_eq!(p.x, 6.37, epsilon = 1e-4);
        assert_abs_diff_eq!(p.y, 8.12, epsilon = 1e-4);
    }

    #[test]
    fn recovers_center_with_noise() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut crop = gaussian_crop(17, 17, 8.4, 7.7, 1.6, 550.0, 3.0);
        crop.mapv_inplace(|v| v + rng.gen_range(-2.0..2.0));
        let p = GaussianFitter::new(50, 1.5, 3.0).fit(crop.view()).unwrap();
        assert_abs_diff_eq!(p.x, 8.4, epsilon = 0.05);
        assert_abs_diff_eq!(p.y, 7.7, epsilon = 0.05);
    }

    #[test]
    fn flat_crop_is_no_peak() {
        let crop = Array2::from_elem((11, 11), 7.0);
        assert_eq!(
            GaussianFitter::new(50, 1.5, 3.0).fit(crop.view()),
            Err(FitFailure::NoPeak)
        );
    }

    #[test]
    fn iteration_budget_exhausted() {
        let crop = gaussian_crop(15, 15, 4.0, 9.0, 2.2, 500.0, 20.0);
        assert_eq!(
            GaussianFitter::new(1, 1.0, 3.0).fit(crop.view()),
            Err(FitFailure::NotConverged { iterations: 1 })
        );
    }
}
