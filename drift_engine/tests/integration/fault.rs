//! Integration test: stage failure while locked.

use drift_common::error::HardwareError;
use drift_common::telemetry::TelemetryRecord;
use drift_common::types::{AxisGroup, Correction, GroupState, Offset2};
use drift_engine::StabilizerError;
use drift_engine::control::{GainValue, PiController, PiGains, ResponseController};

use super::support::{WAIT, config, engine, engine_with, sim};

/// PI controller whose second response panics.
struct FaultyController {
    inner: PiController,
    calls: u32,
}

impl ResponseController for FaultyController {
    fn name(&self) -> &'static str {
        "faulty"
    }

    fn reset_xy(&mut self, n_rois: usize) {
        self.inner.reset_xy(n_rois);
    }

    fn reset_z(&mut self) {
        self.inner.reset_z();
    }

    fn set_gain_p(&mut self, v: GainValue) -> drift_engine::Result<()> {
        self.inner.set_gain_p(v)
    }

    fn set_gain_i(&mut self, v: GainValue) -> drift_engine::Result<()> {
        self.inner.set_gain_i(v)
    }

    fn gains(&self) -> PiGains {
        self.inner.gains()
    }

    fn response(&mut self, t: f64, xy_shifts: Option<&[Option<Offset2>]>, z_shift: Option<f64>) -> Correction {
        self.calls += 1;
        if self.calls == 2 {
            panic!("controller bug");
        }
        self.inner.response(t, xy_shifts, z_shift)
    }
}

#[test]
fn actuator_fault_drops_group_to_tracking() {
    let mut s = sim([200.0, 200.0, 0.0]);
    s.fail_after_moves = Some(5);
    let cfg = config(&s, true);
    let e = engine_with(s, cfg, Box::new(drift_common::telemetry::NullSink));
    e.start().unwrap();
    e.set_tracking(AxisGroup::Xy, true).unwrap();
    e.set_locked(AxisGroup::Xy, true).unwrap();

    // Five moves succeed, the sixth fails.
    let mut downgraded = None;
    for _ in 0..50 {
        let r = e.wait_cycles(1, WAIT).unwrap();
        if r.xy_state == GroupState::Tracking {
            downgraded = Some(r);
            break;
        }
    }
    let r = downgraded.expect("group should drop to Tracking");
    assert_eq!(r.applied.dx, 0.0);
    assert_eq!(e.group_state(AxisGroup::Xy), GroupState::Tracking);

    match e.take_fault() {
        Some(StabilizerError::ActuatorFault { group, source }) => {
            assert_eq!(group, AxisGroup::Xy);
            assert!(matches!(source, HardwareError::CommunicationError(_)));
        }
        other => panic!("expected actuator fault, got {other:?}"),
    }
    assert_eq!(e.take_fault(), None);

    // Tracking continues after the fault.
    let later = e.wait_cycles(3, WAIT).unwrap();
    assert!(later.valid_fits() > 0);
    assert!(e.cycle_stats().actuator_faults >= 1);
    e.stop().unwrap();
}

#[test]
fn panicking_sink_does_not_stop_the_loop() {
    let mut seen = 0u32;
    let sink = move |_r: TelemetryRecord| {
        seen += 1;
        if seen == 3 {
            panic!("sink bug");
        }
    };
    let s = sim([0.0; 3]);
    let cfg = config(&s, false);
    let e = engine_with(s, cfg, Box::new(sink));
    e.start().unwrap();
    e.set_tracking(AxisGroup::Xy, true).unwrap();

    let r = e.wait_cycles(10, WAIT).unwrap();
    assert!(r.cycle >= 10);
    assert!(e.is_running());
    assert_eq!(e.cycle_stats().callback_panics, 1);

    e.stop().unwrap();
    assert!(!e.is_running());
    assert!(e.stage_position().is_ok());
}

#[test]
fn panicking_controller_zeroes_one_correction() {
    let e = engine([300.0, 300.0, 0.0], true);
    e.set_controller(Box::new(FaultyController {
        inner: PiController::new(0.5, 0.0, 1000.0).unwrap(),
        calls: 0,
    }))
    .unwrap();
    e.start().unwrap();
    e.set_tracking(AxisGroup::Xy, true).unwrap();
    e.set_locked(AxisGroup::Xy, true).unwrap();

    let r = e.wait_cycles(10, WAIT).unwrap();
    assert!(e.is_running());
    assert_eq!(r.xy_state, GroupState::Locked);
    assert_eq!(e.cycle_stats().callback_panics, 1);
    assert_eq!(e.controller_name(), "faulty");
    e.stop().unwrap();
    assert!(e.stage_position().is_ok());
}
