//! Integration test: stage-stepping calibration on the simulated rig.

use approx::assert_relative_eq;
use drift_common::types::{AxisGroup, CalibrationFrame};
use drift_engine::StabilizerError;
use drift_engine::calibration::CalibrationRoutine;
use drift_engine::config::CalibrationRoutineConfig;

use super::support::engine;

fn routine_config() -> CalibrationRoutineConfig {
    CalibrationRoutineConfig {
        xy_step_nm: 100.0,
        // 1 px per step along the axial direction.
        z_step_nm: 40.0,
        steps: 5,
        settle_cycles: 2,
        samples_per_step: 3,
        cycle_timeout_ms: 20_000,
    }
}

#[test]
fn xy_and_z_scales_recovered() {
    let e = engine([0.0; 3], false);
    let home = e.stage_position().unwrap();
    e.start().unwrap();
    e.set_tracking(AxisGroup::Xy, true).unwrap();
    e.set_tracking(AxisGroup::Z, true).unwrap();

    let routine = CalibrationRoutine::with_config(&e, routine_config());
    let xy = routine.run_xy().unwrap();
    assert_relative_eq!(xy.calibration.nm_per_px_x, 100.0, max_relative = 0.03);
    assert_relative_eq!(xy.calibration.nm_per_px_y, 100.0, max_relative = 0.03);
    assert!(xy.fit_x.r_squared > 0.99);

    let z = routine.run_z().unwrap();
    assert_relative_eq!(z.calibration.angle_rad, 0.35, epsilon = 0.05);
    assert_relative_eq!(z.calibration.nm_per_px, 40.0, max_relative = 0.05);

    e.set_calibration(CalibrationFrame {
        xy: Some(xy.calibration),
        z: Some(z.calibration),
    })
    .unwrap();
    e.set_locked(AxisGroup::Xy, true).unwrap();
    e.set_locked(AxisGroup::Xy, false).unwrap();
    e.stop().unwrap();

    // The stage is back where it started.
    let end = e.stage_position().unwrap();
    assert_relative_eq!(end.x, home.x, epsilon = 1e-6);
    assert_relative_eq!(end.y, home.y, epsilon = 1e-6);
    assert_relative_eq!(end.z, home.z, epsilon = 1e-6);
}

#[test]
fn calibration_needs_unlocked_tracking() {
    let e = engine([0.0; 3], true);
    let routine = CalibrationRoutine::with_config(&e, routine_config());
    assert_eq!(routine.run_xy().unwrap_err(), StabilizerError::NotRunning);

    e.start().unwrap();
    assert!(matches!(routine.run_xy(), Err(StabilizerError::InvalidParameter(_))));

    e.set_tracking(AxisGroup::Xy, true).unwrap();
    e.set_locked(AxisGroup::Xy, true).unwrap();
    assert!(matches!(routine.run_xy(), Err(StabilizerError::InvalidParameter(_))));
    e.set_locked(AxisGroup::Xy, false).unwrap();
    e.stop().unwrap();
}

#[test]
fn clearing_calibration_of_locked_group_refused() {
    let e = engine([0.0; 3], true);
    e.start().unwrap();
    e.set_tracking(AxisGroup::Z, true).unwrap();
    e.set_locked(AxisGroup::Z, true).unwrap();
    let mut frame = e.calibration();
    frame.z = None;
    assert!(matches!(e.set_calibration(frame), Err(StabilizerError::InvalidParameter(_))));
    // Clearing the idle XY half is fine.
    frame = e.calibration();
    frame.xy = None;
    e.set_calibration(frame).unwrap();
    assert!(!e.calibration().is_calibrated(AxisGroup::Xy));
    e.stop().unwrap();
}
