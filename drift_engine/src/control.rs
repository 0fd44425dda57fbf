//! Response controllers: measured shifts in, 3-axis stage correction out.
//!
//! The engine holds one `Box<dyn ResponseController>` behind a mutex, so
//! gain changes from other threads are serialized against `response()`.
//! Built-ins share the PI law in [`pi`] and differ in how they aggregate
//! the XY fiducials.

pub mod gain;
pub mod outlier;
pub mod pi;

pub use gain::GainValue;
pub use outlier::{OutlierRejectingPi, RejectionStrategy};
pub use pi::{PiController, PiGains};

use crate::config::{ControllerConfig, ControllerKind};
use crate::error::Result;
use drift_common::types::{Correction, Offset2};

/// Capability trait for drift response strategies.
///
/// Shifts are in nm once the group is calibrated, pixels otherwise.
/// Implementations never panic on NaN input.
pub trait ResponseController: Send {
    fn name(&self) -> &'static str;

    /// Clear XY state for a new session tracking `n_rois` fiducials.
    /// Idempotent.
    fn reset_xy(&mut self, n_rois: usize);

    /// Clear Z state. Idempotent.
    fn reset_z(&mut self);

    /// Set proportional gain. A vector of length other than 3 fails with
    /// `InvalidParameter` and leaves the gains unchanged.
    fn set_gain_p(&mut self, v: GainValue) -> Result<()>;

    /// Set integral gain. Same contract as [`Self::set_gain_p`].
    fn set_gain_i(&mut self, v: GainValue) -> Result<()>;

    fn gains(&self) -> PiGains;

    /// Compute this cycle's correction.
    ///
    /// - `xy_shifts = None`: XY not engaged, `dx = dy = 0`.
    /// - `None` entries are failed fits and are excluded from aggregation.
    /// - `z_shift = None` (or NaN): no Z data, proportional term zero and
    ///   the integral is not advanced.
    fn response(&mut self, t: f64, xy_shifts: Option<&[Option<Offset2>]>, z_shift: Option<f64>) -> Correction;
}

/// Mean of the x and y components; `None` per axis when empty.
pub(crate) fn mean_of(points: &[Offset2]) -> (Option<f64>, Option<f64>) {
    if points.is_empty() {
        return (None, None);
    }
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(ax, ay), p| (ax + p.x, ay + p.y));
    (Some(sx / n), Some(sy / n))
}

/// Build the controller described by `cfg`.
pub fn build_controller(cfg: &ControllerConfig) -> Result<Box<dyn ResponseController>> {
    let kp = cfg.kp.clone();
    let ki = cfg.ki.clone();
    Ok(match cfg.kind {
        ControllerKind::Pi => Box::new(PiController::new(kp, ki, cfg.max_shift_nm)?),
        ControllerKind::OutlierPi => {
            let threshold = cfg
                .threshold
                .unwrap_or_else(|| cfg.strategy.default_threshold());
            Box::new(OutlierRejectingPi::new(
                kp,
                ki,
                cfg.max_shift_nm,
                cfg.strategy,
                threshold,
            )?)
        }
    })
}
