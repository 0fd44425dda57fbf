//! Proportional-integral response with a time-weighted integral.
//!
//! The integral accumulates `error · Δt`, where `Δt` is measured per axis
//! from the previous call and capped at
//! [`MAX_INTEGRATION_STEP_S`]. The first sample after a reset contributes
//! `Δt = 0`. Output is `-(Kp·e + Ki·∫e dt)`, clipped to `±max_shift`.

use super::gain::GainValue;
use super::{ResponseController, mean_of};
use crate::error::Result;
use drift_common::types::{Correction, Offset2};

/// Longest interval credited to the integral in one step, seconds.
pub const MAX_INTEGRATION_STEP_S: f64 = 1.0;

/// Axis indices into the `[x, y, z]` arrays.
pub const AXIS_X: usize = 0;
pub const AXIS_Y: usize = 1;
pub const AXIS_Z: usize = 2;

/// Proportional and integral gains per axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PiGains {
    pub kp: [f64; 3],
    pub ki: [f64; 3],
}

/// Integrator state per axis.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PiState {
    integral: [f64; 3],
    last_t: [Option<f64>; 3],
}

impl PiState {
    pub fn integral(&self) -> [f64; 3] {
        self.integral
    }

    fn reset_axis(&mut self, axis: usize) {
        self.integral[axis] = 0.0;
        self.last_t[axis] = None;
    }
}

/// Compute one axis of the PI law.
///
/// `error = None` means no valid measurement this cycle: the proportional
/// term is zero and the integral is left untouched. The axis timestamp still
/// advances, so a gap in valid data is never credited to the integral.
#[inline]
pub fn pi_compute(state: &mut PiState, gains: &PiGains, axis: usize, t: f64, error: Option<f64>) -> f64 {
    let e = match error {
        Some(e) if e.is_finite() => {
            let dt = match state.last_t[axis] {
                Some(last) if t.is_finite() => (t - last).clamp(0.0, MAX_INTEGRATION_STEP_S),
                _ => 0.0,
            };
            state.integral[axis] += e * dt;
            e
        }
        _ => 0.0,
    };
    if t.is_finite() {
        state.last_t[axis] = Some(t);
    }
    -(gains.kp[axis] * e + gains.ki[axis] * state.integral[axis])
}

/// PI law shared by the built-in controllers; they differ only in how the
/// XY shifts are aggregated.
#[derive(Debug, Clone)]
pub struct PiCore {
    gains: PiGains,
    state: PiState,
    max_shift: f64,
}

impl PiCore {
    pub fn new(kp: GainValue, ki: GainValue, max_shift: f64) -> Result<Self> {
        Ok(Self {
            gains: PiGains {
                kp: kp.resolve()?,
                ki: ki.resolve()?,
            },
            state: PiState::default(),
            max_shift: max_shift.abs(),
        })
    }

    pub fn gains(&self) -> PiGains {
        self.gains
    }

    pub fn state(&self) -> &PiState {
        &self.state
    }

    pub fn max_shift(&self) -> f64 {
        self.max_shift
    }

    pub fn reset_xy(&mut self) {
        self.state.reset_axis(AXIS_X);
        self.state.reset_axis(AXIS_Y);
    }

    pub fn reset_z(&mut self) {
        self.state.reset_axis(AXIS_Z);
    }

    pub fn set_gain_p(&mut self, v: GainValue) -> Result<()> {
        self.gains.kp = v.resolve()?;
        Ok(())
    }

    pub fn set_gain_i(&mut self, v: GainValue) -> Result<()> {
        self.gains.ki = v.resolve()?;
        Ok(())
    }

    /// Run the law on an aggregated XY error and a Z error.
    ///
    /// `xy = None` (XY not engaged) yields `dx = dy = 0` without touching the
    /// XY integrators.
    pub fn step(&mut self, t: f64, xy: Option<(Option<f64>, Option<f64>)>, z: Option<f64>) -> Correction {
        let clip = |v: f64| v.clamp(-self.max_shift, self.max_shift);
        let (dx, dy) = match xy {
            Some((ex, ey)) => (
                pi_compute(&mut self.state, &self.gains, AXIS_X, t, ex),
                pi_compute(&mut self.state, &self.gains, AXIS_Y, t, ey),
            ),
            None => (0.0, 0.0),
        };
        let dz = pi_compute(&mut self.state, &self.gains, AXIS_Z, t, z);
        Correction {
            dx: clip(dx),
            dy: clip(dy),
            dz: clip(dz),
        }
    }
}

/// Plain PI: XY error is the mean shift over ROIs with a valid fit.
#[derive(Debug, Clone)]
pub struct PiController {
    core: PiCore,
}

impl PiController {
    pub fn new(kp: impl Into<GainValue>, ki: impl Into<GainValue>, max_shift: f64) -> Result<Self> {
        Ok(Self {
            core: PiCore::new(kp.into(), ki.into(), max_shift)?,
        })
    }

    pub fn core(&self) -> &PiCore {
        &self.core
    }
}

impl ResponseController for PiController {
    fn name(&self) -> &'static str {
        "pi"
    }

    fn reset_xy(&mut self, _n_rois: usize) {
        self.core.reset_xy();
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
            let valid: Vec<Offset2> = shifts.iter().flatten().copied().filter(Offset2::is_finite).collect();
            mean_of(&valid)
        });
        self.core.step(t, xy, z_shift)
    }
}
