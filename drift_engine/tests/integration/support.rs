//! Shared fixtures: a fast simulated rig and a matching engine config.

use drift_common::clock::Clock;
use drift_common::telemetry::{NullSink, TelemetryRecord, TelemetrySink};
use drift_common::types::{AxisGroup, CalibrationFrame, XyCalibration, ZCalibration};
use drift_engine::Stabilizer;
use drift_engine::config::{RoiConfig, StabilizerConfig};
use drift_hal::drivers::simulation::{SimulationConfig, build};
use std::sync::Arc;
use std::time::Duration;

/// Generous wait for engine progress; debug builds fit slowly.
pub const WAIT: Duration = Duration::from_secs(20);

/// Unpaced simulation with the given drift amplitude `[x, y, z]`, nm.
pub fn sim(drift_nm: [f64; 3]) -> SimulationConfig {
    SimulationConfig {
        pace_frames: false,
        drift_amplitude_nm: drift_nm,
        drift_period_s: [8.0, 10.4, 12.0],
        ..SimulationConfig::default()
    }
}

/// Engine config with one XY ROI per fiducial and a Z ROI on the axial spot.
pub fn config(sim: &SimulationConfig, calibrated: bool) -> StabilizerConfig {
    let mut cfg = StabilizerConfig::default();
    cfg.engine.workers = 2;
    cfg.engine.fit_timeout_ms = 2000;
    cfg.engine.stats_interval = 0;
    cfg.rois = sim
        .fiducials
        .iter()
        .map(|p| RoiConfig {
            group: AxisGroup::Xy,
            x: p[0].round() as usize,
            y: p[1].round() as usize,
            half_size: 7,
        })
        .collect();
    cfg.rois.push(RoiConfig {
        group: AxisGroup::Z,
        x: sim.z_spot[0].round() as usize,
        y: sim.z_spot[1].round() as usize,
        half_size: 8,
    });
    if calibrated {
        cfg.calibration = CalibrationFrame {
            xy: Some(XyCalibration {
                nm_per_px_x: sim.nm_per_px,
                nm_per_px_y: sim.nm_per_px,
            }),
            z: Some(ZCalibration {
                angle_rad: sim.z_angle_rad,
                nm_per_px: sim.z_nm_per_px,
            }),
        };
    }
    cfg.controller.kp = 0.5.into();
    cfg.controller.ki = 0.0.into();
    cfg
}

pub fn engine_with(sim: SimulationConfig, cfg: StabilizerConfig, sink: Box<dyn TelemetrySink>) -> Stabilizer {
    let (camera, stage, _world) = build(sim);
    Stabilizer::new(cfg, Box::new(camera), Box::new(stage), sink).unwrap()
}

pub fn engine_with_clock(sim: SimulationConfig, cfg: StabilizerConfig, clock: Arc<dyn Clock>) -> Stabilizer {
    let (camera, stage, _world) = build(sim);
    Stabilizer::with_clock(cfg, Box::new(camera), Box::new(stage), Box::new(NullSink), clock).unwrap()
}

pub fn engine(drift_nm: [f64; 3], calibrated: bool) -> Stabilizer {
    let sim = sim(drift_nm);
    let cfg = config(&sim, calibrated);
    engine_with(sim, cfg, Box::new(NullSink))
}

/// The next `n` records, in cycle order.
pub fn collect(engine: &Stabilizer, n: usize) -> Vec<TelemetryRecord> {
    let mut next = engine.latest_cycle() + 1;
    (0..n)
        .map(|_| {
            let r = engine.wait_for_cycle(next, WAIT).unwrap();
            next = r.cycle + 1;
            r
        })
        .collect()
}

/// Mean XY shift of the valid fiducials, pixels.
pub fn mean_xy_shift(r: &TelemetryRecord) -> Option<(f64, f64)> {
    let shifts: Vec<_> = r.xy.iter().filter_map(|s| s.shift_px).collect();
    if shifts.is_empty() {
        return None;
    }
    let n = shifts.len() as f64;
    Some((
        shifts.iter().map(|s| s.x).sum::<f64>() / n,
        shifts.iter().map(|s| s.y).sum::<f64>() / n,
    ))
}
