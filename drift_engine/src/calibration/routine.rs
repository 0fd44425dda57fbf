//! Stage-stepping calibration on a running engine.
//!
//! The group must be tracking and unlocked. The stage is stepped along one
//! axis at a time; after each step a few cycles are discarded to let the
//! stage settle, then the mean spot shift of several cycles becomes one
//! sample. The stage is returned to its starting point afterwards, also
//! when the scan fails.

use super::{CalibrationSample, XyCalibrationResult, ZCalibrationResult, fit_xy, fit_z};
use crate::config::CalibrationRoutineConfig;
use crate::engine::Stabilizer;
use crate::error::{Result, StabilizerError};
use drift_common::telemetry::TelemetryRecord;
use drift_common::types::{AxisGroup, GroupState, Offset2};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanAxis {
    X,
    Y,
    Z,
}

impl ScanAxis {
    fn delta(self, step: f64) -> (f64, f64, f64) {
        match self {
            ScanAxis::X => (step, 0.0, 0.0),
            ScanAxis::Y => (0.0, step, 0.0),
            ScanAxis::Z => (0.0, 0.0, step),
        }
    }

    fn group(self) -> AxisGroup {
        match self {
            ScanAxis::X | ScanAxis::Y => AxisGroup::Xy,
            ScanAxis::Z => AxisGroup::Z,
        }
    }
}

pub struct CalibrationRoutine<'a> {
    engine: &'a Stabilizer,
    cfg: CalibrationRoutineConfig,
}

impl<'a> CalibrationRoutine<'a> {
    /// Routine with the engine's `[calibration_routine]` settings.
    pub fn new(engine: &'a Stabilizer) -> Self {
        let cfg = engine.config().calibration_routine.clone();
        Self { engine, cfg }
    }

    pub fn with_config(engine: &'a Stabilizer, cfg: CalibrationRoutineConfig) -> Self {
        Self { engine, cfg }
    }

    /// Scan x then y and fit the lateral scale. The result is not applied;
    /// pass it to [`Stabilizer::set_calibration`].
    pub fn run_xy(&self) -> Result<XyCalibrationResult> {
        self.require_tracking(AxisGroup::Xy)?;
        let x = self.scan(ScanAxis::X, self.cfg.xy_step_nm)?;
        let y = self.scan(ScanAxis::Y, self.cfg.xy_step_nm)?;
        let result = fit_xy(&x, &y)?;
        info!(
            nm_per_px_x = result.calibration.nm_per_px_x,
            nm_per_px_y = result.calibration.nm_per_px_y,
            r2_x = result.fit_x.r_squared,
            r2_y = result.fit_y.r_squared,
            "XY calibration fitted"
        );
        Ok(result)
    }

    /// Scan z and fit the axial direction and scale.
    pub fn run_z(&self) -> Result<ZCalibrationResult> {
        self.require_tracking(AxisGroup::Z)?;
        let z = self.scan(ScanAxis::Z, self.cfg.z_step_nm)?;
        let result = fit_z(&z)?;
        info!(
            angle_rad = result.calibration.angle_rad,
            nm_per_px = result.calibration.nm_per_px,
            "Z calibration fitted"
        );
        Ok(result)
    }

    fn require_tracking(&self, group: AxisGroup) -> Result<()> {
        if !self.engine.is_running() {
            return Err(StabilizerError::NotRunning);
        }
        match self.engine.group_state(group) {
            GroupState::Tracking => Ok(()),
            GroupState::Idle => Err(StabilizerError::InvalidParameter(format!(
                "{group} tracking must be engaged to calibrate"
            ))),
            GroupState::Locked => Err(StabilizerError::InvalidParameter(format!(
                "{group} group must be unlocked to calibrate"
            ))),
        }
    }

    fn scan(&self, axis: ScanAxis, step_nm: f64) -> Result<Vec<CalibrationSample>> {
        debug!(?axis, step_nm, steps = self.cfg.steps, "Calibration scan");
        let mut travelled = 0.0;
        let result = self.collect_scan(axis, step_nm, &mut travelled);

        if travelled != 0.0 {
            let (dx, dy, dz) = axis.delta(-travelled);
            let back = self
                .engine
                .move_stage_by(dx, dy, dz)
                .and_then(|()| self.engine.wait_cycles(self.cfg.settle_cycles + 1, self.cfg.cycle_timeout()));
            if let Err(e) = back {
                warn!(?axis, error = %e, "Could not return stage after calibration scan");
            }
        }
        result
    }

    fn collect_scan(&self, axis: ScanAxis, step_nm: f64, travelled: &mut f64) -> Result<Vec<CalibrationSample>> {
        let mut samples = Vec::with_capacity(self.cfg.steps);
        for k in 0..self.cfg.steps {
            if k > 0 {
                let (dx, dy, dz) = axis.delta(step_nm);
                self.engine.move_stage_by(dx, dy, dz)?;
                *travelled += step_nm;
            }
            match self.sample(axis.group())? {
                Some(shift) => samples.push(CalibrationSample::new(*travelled, shift)),
                None => warn!(?axis, step = k, "No valid fits at calibration step, skipped"),
            }
        }
        Ok(samples)
    }

    /// Mean shift over `samples_per_step` cycles once the stage settled.
    fn sample(&self, group: AxisGroup) -> Result<Option<Offset2>> {
        let timeout = self.cfg.cycle_timeout();
        // The cycle in flight may have drained the queue before the move.
        let mut next = self.engine.latest_cycle() + 2 + self.cfg.settle_cycles;
        let wanted = self.cfg.samples_per_step as usize;
        let mut acc = Vec::with_capacity(wanted);
        let mut seen = 0;
        while acc.len() < wanted && seen < wanted * 4 {
            let record = self.engine.wait_for_cycle(next, timeout)?;
            next = record.cycle + 1;
            seen += 1;
            if let Some(s) = mean_shift(&record, group) {
                acc.push(s);
            }
        }
        if acc.is_empty() {
            return Ok(None);
        }
        let n = acc.len() as f64;
        let (sx, sy) = acc.iter().fold((0.0, 0.0), |(ax, ay), s| (ax + s.x, ay + s.y));
        Ok(Some(Offset2::new(sx / n, sy / n)))
    }
}

/// Mean pixel shift of the group's valid ROIs in one record.
fn mean_shift(record: &TelemetryRecord, group: AxisGroup) -> Option<Offset2> {
    let shifts: Vec<Offset2> = match group {
        AxisGroup::Xy => record.xy.iter().filter_map(|s| s.shift_px).collect(),
        AxisGroup::Z => record.z.iter().filter_map(|s| s.shift_px).collect(),
    };
    let (x, y) = crate::control::mean_of(&shifts);
    Some(Offset2::new(x?, y?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_common::error::FitFailure;
    use drift_common::telemetry::RoiSample;
    use drift_common::types::{Correction, RoiId, SpotPosition};

    fn sample(id: u32, shift: Option<Offset2>) -> RoiSample {
        RoiSample {
            id: RoiId(id),
            measurement: match shift {
                Some(s) => Ok(SpotPosition { x: s.x, y: s.y }),
                None => Err(FitFailure::NoPeak),
            },
            shift_px: shift,
        }
    }

    #[test]
    fn mean_shift_skips_failed_rois() {
        let record = TelemetryRecord {
            cycle: 1,
            timestamp: 0.0,
            xy_state: GroupState::Tracking,
            z_state: GroupState::Idle,
            xy: vec![
                sample(0, Some(Offset2::new(1.0, 2.0))),
                sample(1, None),
                sample(2, Some(Offset2::new(3.0, 0.0))),
            ],
            z: None,
            correction: Correction::ZERO,
            applied: Correction::ZERO,
            stage: None,
        };
        assert_eq!(mean_shift(&record, AxisGroup::Xy), Some(Offset2::new(2.0, 1.0)));
        assert_eq!(mean_shift(&record, AxisGroup::Z), None);
    }

    #[test]
    fn scan_axis_deltas() {
        assert_eq!(ScanAxis::Y.delta(5.0), (0.0, 5.0, 0.0));
        assert_eq!(ScanAxis::Z.group(), AxisGroup::Z);
    }
}
