//! Integration test: engine lifecycle and group state machine.

use drift_common::types::{AxisGroup, GroupState};
use drift_engine::StabilizerError;

use super::support::{WAIT, engine};

#[test]
fn engage_requires_running_engine() {
    let e = engine([0.0; 3], true);
    assert_eq!(e.set_tracking(AxisGroup::Xy, true), Err(StabilizerError::NotRunning));
    assert_eq!(e.group_state(AxisGroup::Xy), GroupState::Idle);
}

#[test]
fn lock_from_idle_fails() {
    let e = engine([0.0; 3], true);
    e.start().unwrap();
    assert!(matches!(
        e.set_locked(AxisGroup::Xy, true),
        Err(StabilizerError::InvalidParameter(_))
    ));
    assert_eq!(e.group_state(AxisGroup::Xy), GroupState::Idle);
    e.stop().unwrap();
}

#[test]
fn lock_requires_calibration() {
    let e = engine([0.0; 3], false);
    e.start().unwrap();
    e.set_tracking(AxisGroup::Xy, true).unwrap();
    assert_eq!(
        e.set_locked(AxisGroup::Xy, true),
        Err(StabilizerError::Uncalibrated(AxisGroup::Xy))
    );
    assert_eq!(e.group_state(AxisGroup::Xy), GroupState::Tracking);
    e.stop().unwrap();
}

#[test]
fn full_transition_sequence() {
    let e = engine([0.0; 3], true);
    e.start().unwrap();

    e.set_tracking(AxisGroup::Xy, true).unwrap();
    e.set_locked(AxisGroup::Xy, true).unwrap();
    assert_eq!(e.group_state(AxisGroup::Xy), GroupState::Locked);
    // Z is independent.
    assert_eq!(e.group_state(AxisGroup::Z), GroupState::Idle);

    assert!(matches!(
        e.set_tracking(AxisGroup::Xy, false),
        Err(StabilizerError::TransitionRejected(_))
    ));
    assert!(matches!(
        e.set_locked(AxisGroup::Xy, true),
        Err(StabilizerError::TransitionRejected(_))
    ));

    e.set_locked(AxisGroup::Xy, false).unwrap();
    e.set_tracking(AxisGroup::Xy, false).unwrap();
    assert_eq!(e.group_state(AxisGroup::Xy), GroupState::Idle);
    e.stop().unwrap();
}

#[test]
fn stop_returns_every_group_to_idle() {
    let e = engine([0.0; 3], true);
    e.start().unwrap();
    e.set_tracking(AxisGroup::Xy, true).unwrap();
    e.set_tracking(AxisGroup::Z, true).unwrap();
    e.set_locked(AxisGroup::Z, true).unwrap();
    e.wait_cycles(3, WAIT).unwrap();

    e.stop().unwrap();
    assert!(!e.is_running());
    for g in AxisGroup::ALL {
        assert_eq!(e.group_state(g), GroupState::Idle);
        assert!(e.active_rois(g).is_empty());
    }
}

#[test]
fn double_start_and_stop_rejected() {
    let e = engine([0.0; 3], false);
    assert_eq!(e.stop(), Err(StabilizerError::NotRunning));
    e.start().unwrap();
    assert_eq!(e.start(), Err(StabilizerError::AlreadyRunning));
    e.stop().unwrap();
    assert_eq!(e.stop(), Err(StabilizerError::NotRunning));

    // Restartable; cycle numbering continues.
    let before = e.latest_cycle();
    e.start().unwrap();
    let r = e.wait_cycles(2, WAIT).unwrap();
    assert!(r.cycle > before);
    e.stop().unwrap();
}

#[test]
fn roi_edits_deferred_while_tracking() {
    let e = engine([0.0; 3], false);
    e.start().unwrap();
    e.set_tracking(AxisGroup::Xy, true).unwrap();
    let frozen = e.active_rois(AxisGroup::Xy).len();

    let err = e.add_roi(AxisGroup::Xy, 200, 200, 6).unwrap_err();
    let StabilizerError::RoiEditDeferred { group, roi } = err else {
        panic!("expected deferral, got {err:?}");
    };
    assert_eq!(group, AxisGroup::Xy);

    // The running session keeps its snapshot.
    let r = e.wait_cycles(2, WAIT).unwrap();
    assert_eq!(r.xy.len(), frozen);

    // Applied at the next engagement.
    e.set_tracking(AxisGroup::Xy, false).unwrap();
    e.set_tracking(AxisGroup::Xy, true).unwrap();
    let active = e.active_rois(AxisGroup::Xy);
    assert_eq!(active.len(), frozen + 1);
    assert_eq!(active.last().map(|r| r.id), Some(roi));
    e.stop().unwrap();
}

#[test]
fn gains_validated_through_engine() {
    let e = engine([0.0; 3], false);
    e.set_gain_p(vec![0.2, 0.3, 0.4]).unwrap();
    assert_eq!(e.gains().kp, [0.2, 0.3, 0.4]);
    assert!(matches!(
        e.set_gain_i(vec![0.1, 0.2]),
        Err(StabilizerError::InvalidParameter(_))
    ));
    e.set_gain_i(0.05).unwrap();
    assert_eq!(e.gains().ki, [0.05; 3]);
}

#[test]
fn hardware_commands_apply_directly_while_stopped() {
    let e = engine([0.0; 3], false);
    let home = e.stage_position().unwrap();
    e.move_stage_by(50.0, -20.0, 10.0).unwrap();
    let moved = e.stage_position().unwrap();
    assert!((moved.x - home.x - 50.0).abs() < 1e-9);
    assert!((moved.y - home.y + 20.0).abs() < 1e-9);
    assert!((moved.z - home.z - 10.0).abs() < 1e-9);

    e.set_camera_gain(2.0).unwrap();
    assert!(matches!(e.set_camera_gain(11.0), Err(StabilizerError::Hardware(_))));
    assert!(matches!(
        e.move_stage_by(f64::NAN, 0.0, 0.0),
        Err(StabilizerError::InvalidParameter(_))
    ));

    // Queued to the control thread while running.
    e.start().unwrap();
    assert!(matches!(e.stage_position(), Err(StabilizerError::AlreadyRunning)));
    e.set_exposure(0.02).unwrap();
    e.wait_cycles(2, WAIT).unwrap();
    e.stop().unwrap();
}
