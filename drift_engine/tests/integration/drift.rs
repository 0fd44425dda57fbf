//! Integration test: closed-loop correction against simulated drift.
//!
//! While only tracking, the fiducials wander by several pixels. Once
//! locked, the stage follows the drift and the measured shift stays near
//! the session reference.

use drift_common::types::{AxisGroup, Correction, GroupState};

use super::support::{collect, engine, mean_xy_shift};

fn max_abs_xy(records: &[drift_common::telemetry::TelemetryRecord]) -> f64 {
    records
        .iter()
        .filter_map(mean_xy_shift)
        .map(|(x, y)| x.abs().max(y.abs()))
        .fold(0.0, f64::max)
}

#[test]
fn locked_xy_cancels_lateral_drift() {
    let e = engine([300.0, 300.0, 0.0], true);
    e.start().unwrap();
    e.set_tracking(AxisGroup::Xy, true).unwrap();

    // 100 frames = 2 s of simulated time, a quarter drift period.
    let free = collect(&e, 100);
    assert!(free.iter().all(|r| r.applied == Correction::ZERO && r.stage.is_none()));
    let free_max = max_abs_xy(&free);
    assert!(free_max > 1.5, "expected visible drift, max shift {free_max:.3} px");
    // The controller output is visible before locking.
    assert!(free.iter().any(|r| r.correction.dx.abs() > 1.0));

    e.set_locked(AxisGroup::Xy, true).unwrap();
    collect(&e, 60);
    let held = collect(&e, 60);
    assert!(held.iter().all(|r| r.xy_state == GroupState::Locked));
    assert!(held.iter().all(|r| r.stage.is_some()));
    let held_max = max_abs_xy(&held);
    assert!(held_max < 0.5, "locked shift should stay small, got {held_max:.3} px");

    e.set_locked(AxisGroup::Xy, false).unwrap();
    e.stop().unwrap();
}

#[test]
fn locked_z_cancels_axial_drift() {
    let e = engine([0.0, 0.0, 80.0], true);
    e.start().unwrap();
    e.set_tracking(AxisGroup::Z, true).unwrap();
    e.set_locked(AxisGroup::Z, true).unwrap();

    collect(&e, 60);
    let held = collect(&e, 60);
    let cal = e.calibration().z.unwrap();
    let worst_nm = held
        .iter()
        .filter_map(|r| r.z.as_ref().and_then(|s| s.shift_px))
        .map(|s| cal.project(s).abs())
        .fold(0.0, f64::max);
    assert!(worst_nm < 20.0, "axial error {worst_nm:.1} nm");
    // XY untouched while only Z is locked.
    assert!(held.iter().all(|r| r.correction.dx == 0.0 && r.applied.dx == 0.0 && r.applied.dy == 0.0));
    assert!(held.iter().all(|r| r.applied.dz == r.correction.dz));
    assert!(held.iter().all(|r| r.xy.is_empty()));
    e.stop().unwrap();
}

#[test]
fn correction_respects_safety_clamp() {
    let sim = super::support::sim([1000.0, 0.0, 0.0]);
    let mut cfg = super::support::config(&sim, true);
    cfg.engine.max_correction_nm = 5.0;
    cfg.controller.kp = 1.0.into();
    cfg.controller.max_shift_nm = 1000.0;
    let e = super::support::engine_with(sim, cfg, Box::new(drift_common::telemetry::NullSink));
    e.start().unwrap();
    e.set_tracking(AxisGroup::Xy, true).unwrap();
    e.set_locked(AxisGroup::Xy, true).unwrap();

    let records = collect(&e, 80);
    assert!(records.iter().all(|r| r.correction.dx.abs() <= 5.0 + 1e-12));
    assert!(records.iter().any(|r| r.correction.dx.abs() > 4.9));
    assert!(
        records
            .iter()
            .filter(|r| r.xy_state == GroupState::Locked)
            .all(|r| r.applied.dx == r.correction.dx)
    );
    e.stop().unwrap();
}
