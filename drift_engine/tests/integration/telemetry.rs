//! Integration test: telemetry records reach the sink and carry the
//! engine clock.

use crossbeam_channel::bounded;
use drift_common::clock::ManualClock;
use drift_common::telemetry::ChannelSink;
use drift_common::types::{AxisGroup, GroupState};
use std::sync::Arc;

use super::support::{WAIT, collect, config, engine_with, engine_with_clock, sim};

#[test]
fn records_flow_to_channel_sink() {
    let s = sim([0.0; 3]);
    let cfg = config(&s, false);
    let n_xy = s.fiducials.len();
    let (tx, rx) = bounded(1024);
    let e = engine_with(s, cfg, Box::new(ChannelSink::new(tx)));
    e.start().unwrap();
    e.set_tracking(AxisGroup::Xy, true).unwrap();
    let tracked = e.wait_cycles(5, WAIT).unwrap();
    e.stop().unwrap();

    let received: Vec<_> = rx.try_iter().collect();
    assert!(received.len() as u64 >= tracked.cycle);
    assert!(received.windows(2).all(|w| w[1].cycle == w[0].cycle + 1));

    let last = received.last().unwrap();
    assert_eq!(last.xy_state, GroupState::Tracking);
    assert_eq!(last.xy.len(), n_xy);
    assert!(last.z.is_none());
    assert_eq!(last.valid_fits(), n_xy);
    // Reference captured at the first fit: shifts start near zero.
    let first_tracked = received.iter().find(|r| !r.xy.is_empty()).unwrap();
    assert!(first_tracked.xy.iter().all(|s| s.shift_px.is_some_and(|p| p.x == 0.0 && p.y == 0.0)));
}

#[test]
fn timestamps_come_from_engine_clock() {
    let s = sim([0.0; 3]);
    let cfg = config(&s, false);
    let clock = ManualClock::new(1000.0);
    let e = engine_with_clock(s, cfg, Arc::new(clock.clone()));
    e.start().unwrap();
    let r = e.wait_cycles(2, WAIT).unwrap();
    assert_eq!(r.timestamp, 1000.0);

    clock.set(2000.0);
    // Records acquired before the change may still be in flight.
    let later = collect(&e, 3);
    assert_eq!(later.last().map(|r| r.timestamp), Some(2000.0));
    e.stop().unwrap();
}

#[test]
fn idle_engine_publishes_empty_records() {
    let s = sim([0.0; 3]);
    let cfg = config(&s, false);
    let e = engine_with(s, cfg, Box::new(drift_common::telemetry::NullSink));
    e.start().unwrap();
    let r = e.wait_cycles(2, WAIT).unwrap();
    assert!(r.xy.is_empty() && r.z.is_none());
    assert_eq!(r.stage, None);
    assert_eq!(r.valid_fits(), 0);
    e.stop().unwrap();
}
