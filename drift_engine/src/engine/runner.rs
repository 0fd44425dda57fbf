//! Control thread: acquire → localize → respond → actuate → publish.
//!
//! The runner owns camera, stage and sink for as long as the engine runs
//! and hands them back when the loop exits. Pacing comes from frame
//! acquisition; there is no extra sleep between cycles.
//!
//! ## Cycle Body
//! 1. Drain queued commands (stage moves, camera settings).
//! 2. Acquire a frame. On error: count, back off, skip the cycle.
//! 3. Read group states and frozen ROI snapshots under the shared lock.
//! 4. Localize every engaged ROI through the pool.
//! 5. Shifts against per-session references, converted to nm when
//!    calibrated.
//! 6. Controller response, safety clamp.
//! 7. Stage command for locked groups. Failure drops that group to
//!    Tracking.
//! 8. Publish the telemetry record.
//!
//! A panic in the controller or the sink is caught and counted; the cycle
//! continues with a zero correction or an unpublished record.

use super::command::EngineCommand;
use super::tap::TelemetryTap;
use super::{Hardware, SharedState};
use crate::config::EngineConfig;
use crate::control::ResponseController;
use crate::cycle::CycleStats;
use crate::error::StabilizerError;
use crate::localize::LocalizationPool;
use crate::state::{GroupEvent, TransitionResult};
use crossbeam_channel::Receiver;
use drift_common::clock::Clock;
use drift_common::error::HardwareError;
use drift_common::telemetry::{RoiSample, TelemetryRecord};
use drift_common::types::{
    AxisGroup, CalibrationFrame, Correction, GroupState, Measurement, Offset2, Roi, SpotPosition, StageLimits,
    StagePosition,
};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Grace period given to fitting workers when the loop exits.
const POOL_SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

// ─── References ─────────────────────────────────────────────────────

/// Reference spot positions of one tracking session.
///
/// A reference is captured lazily at the first successful fit of each ROI
/// after engagement; a new session id discards all of them.
#[derive(Debug, Default)]
struct References {
    session: u64,
    positions: Vec<Option<SpotPosition>>,
}

impl References {
    fn sync(&mut self, session: u64, n_rois: usize) {
        if self.session != session || self.positions.len() != n_rois {
            self.session = session;
            self.positions = vec![None; n_rois];
        }
    }

    /// Shift of ROI `i` from its reference, pixels.
    fn shift(&mut self, i: usize, m: &Measurement) -> Option<Offset2> {
        let pos = m.as_ref().ok()?;
        let reference = self.positions[i].get_or_insert(*pos);
        Some(pos.offset_from(reference))
    }
}

/// Per-cycle view of the shared state, copied out under the lock.
struct GroupView {
    state: GroupState,
    session: u64,
    rois: Arc<[Roi]>,
}

struct CycleView {
    xy: GroupView,
    z: GroupView,
    calibration: CalibrationFrame,
}

/// Clears the running flag when the loop exits by any path.
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ─── Runner ─────────────────────────────────────────────────────────

pub(super) struct CycleRunner {
    pub(super) hw: Hardware,
    pub(super) pool: LocalizationPool,
    pub(super) shared: Arc<Mutex<SharedState>>,
    pub(super) controller: Arc<Mutex<Box<dyn ResponseController>>>,
    pub(super) commands: Receiver<EngineCommand>,
    pub(super) tap: Arc<TelemetryTap>,
    pub(super) stats: Arc<Mutex<CycleStats>>,
    pub(super) running: Arc<AtomicBool>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) cfg: EngineConfig,
    pub(super) cycle: u64,
    target: Option<StagePosition>,
    limits: Option<StageLimits>,
    xy_refs: References,
    z_refs: References,
    /// Consecutive engaged cycles without a single valid fit.
    blind_cycles: u64,
}

impl CycleRunner {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        hw: Hardware,
        pool: LocalizationPool,
        shared: Arc<Mutex<SharedState>>,
        controller: Arc<Mutex<Box<dyn ResponseController>>>,
        commands: Receiver<EngineCommand>,
        tap: Arc<TelemetryTap>,
        stats: Arc<Mutex<CycleStats>>,
        running: Arc<AtomicBool>,
        clock: Arc<dyn Clock>,
        cfg: EngineConfig,
    ) -> Self {
        let cycle = tap.latest_cycle();
        Self {
            hw,
            pool,
            shared,
            controller,
            commands,
            tap,
            stats,
            running,
            clock,
            cfg,
            cycle,
            target: None,
            limits: None,
            xy_refs: References::default(),
            z_refs: References::default(),
            blind_cycles: 0,
        }
    }

    /// Run until the running flag clears, then return the hardware.
    pub(super) fn run(mut self) -> Hardware {
        let _flag = RunningFlag(self.running.clone());
        self.limits = self.hw.stage.get_limits();
        self.target = match self.hw.stage.get_position() {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(error = %e, "Stage position unavailable at start");
                None
            }
        };
        info!(
            camera = self.hw.camera.name(),
            stage = self.hw.stage.name(),
            workers = self.pool.target_workers(),
            "Control loop started"
        );

        while self.running.load(Ordering::Acquire) {
            let cycle_start = Instant::now();

            self.cycle_body();

            let elapsed = cycle_start.elapsed();
            let mut stats = self.stats.lock();
            if stats.record(elapsed) {
                debug!(
                    cycle = self.cycle,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Cycle overran its budget"
                );
            }
            if self.cfg.stats_interval > 0 && stats.cycle_count % self.cfg.stats_interval == 0 {
                debug!(
                    cycles = stats.cycle_count,
                    avg_us = stats.avg_cycle_ns() / 1000,
                    max_us = stats.max_cycle_ns / 1000,
                    overruns = stats.overruns,
                    fit_failures = stats.fit_failures,
                    "Cycle statistics"
                );
            }
        }

        self.pool.shutdown(POOL_SHUTDOWN_GRACE);
        let pool = self.pool.stats();
        let stats = self.stats.lock().clone();
        info!(
            cycle = self.cycle,
            avg_us = stats.avg_cycle_ns() / 1000,
            min_us = stats.min_or_zero_ns() / 1000,
            max_us = stats.max_cycle_ns / 1000,
            overruns = stats.overruns,
            fit_failures = stats.fit_failures,
            timeouts = pool.timeouts,
            panics = pool.panics,
            respawns = pool.respawns,
            "Control loop stopped"
        );
        self.hw
    }

    fn cycle_body(&mut self) {
        // ═══ COMMANDS ═══
        while let Ok(cmd) = self.commands.try_recv() {
            self.execute(cmd);
        }

        // ═══ ACQUIRE ═══
        let frame = match self.hw.camera.get_image() {
            Ok(f) => f,
            Err(e) => {
                let n = {
                    let mut stats = self.stats.lock();
                    stats.acquisition_errors += 1;
                    stats.acquisition_errors
                };
                if n.is_power_of_two() {
                    warn!(error = %e, failures = n, "Frame acquisition failed");
                }
                std::thread::sleep(self.cfg.acquisition_retry());
                return;
            }
        };
        let t = self.clock.now();
        self.cycle += 1;

        let view = self.view();

        // ═══ LOCALIZE ═══
        let xy_rois: &[Roi] = if view.xy.state.is_engaged() { &view.xy.rois } else { &[] };
        let z_roi: Option<&Roi> = if view.z.state.is_engaged() { view.z.rois.first() } else { None };
        let mut batch: Vec<Roi> = Vec::with_capacity(xy_rois.len() + 1);
        batch.extend_from_slice(xy_rois);
        batch.extend(z_roi.copied());
        let mut measurements = if batch.is_empty() {
            Vec::new()
        } else {
            self.pool.submit(frame.view(), &batch)
        };
        let z_measurement = z_roi.and_then(|_| measurements.pop());

        let failures = measurements.iter().chain(z_measurement.iter()).filter(|m| m.is_err()).count();
        if failures > 0 {
            self.stats.lock().fit_failures += failures as u64;
        }
        if !batch.is_empty() && failures == batch.len() {
            self.blind_cycles += 1;
            if self.blind_cycles.is_power_of_two() {
                warn!(cycle = self.cycle, consecutive = self.blind_cycles, "No valid fit in any engaged ROI");
            }
        } else {
            self.blind_cycles = 0;
        }

        // ═══ SHIFTS ═══
        self.xy_refs.sync(view.xy.session, xy_rois.len());
        self.z_refs.sync(view.z.session, usize::from(z_roi.is_some()));

        let xy_samples: Vec<RoiSample> = xy_rois
            .iter()
            .zip(measurements)
            .enumerate()
            .map(|(i, (roi, m))| RoiSample {
                id: roi.id,
                shift_px: self.xy_refs.shift(i, &m),
                measurement: m,
            })
            .collect();
        let z_sample = z_roi.zip(z_measurement).map(|(roi, m)| RoiSample {
            id: roi.id,
            shift_px: self.z_refs.shift(0, &m),
            measurement: m,
        });

        // ═══ RESPOND ═══
        let xy_shifts: Option<Vec<Option<Offset2>>> = view.xy.state.is_engaged().then(|| {
            xy_samples
                .iter()
                .map(|s| match (s.shift_px, view.calibration.xy) {
                    (Some(px), Some(cal)) => Some(cal.to_nm(px)),
                    (px, None) => px,
                    (None, _) => None,
                })
                .collect()
        });
        let z_shift: Option<f64> = match (&z_sample, view.calibration.z) {
            (Some(s), Some(cal)) => s.shift_px.map(|px| cal.project(px)),
            _ => None,
        };

        let correction = if xy_shifts.is_some() || z_sample.is_some() {
            let controller = &self.controller;
            let response =
                catch_unwind(AssertUnwindSafe(|| controller.lock().response(t, xy_shifts.as_deref(), z_shift)));
            match response {
                Ok(c) => c.clamped(self.cfg.max_correction_nm),
                Err(_) => {
                    self.callback_panic("controller");
                    Correction::ZERO
                }
            }
        } else {
            Correction::ZERO
        };

        // ═══ ACTUATE ═══
        let mut xy_state = view.xy.state;
        let mut z_state = view.z.state;
        let mut applied = Correction::ZERO;
        if xy_state == GroupState::Locked {
            match self.move_xy(correction.dx, correction.dy) {
                Ok(()) => {
                    applied.dx = correction.dx;
                    applied.dy = correction.dy;
                }
                Err(e) => xy_state = self.actuator_fault(AxisGroup::Xy, e),
            }
        }
        if z_state == GroupState::Locked {
            match self.move_z(correction.dz) {
                Ok(()) => applied.dz = correction.dz,
                Err(e) => z_state = self.actuator_fault(AxisGroup::Z, e),
            }
        }

        // ═══ PUBLISH ═══
        let locked = view.xy.state == GroupState::Locked || view.z.state == GroupState::Locked;
        let record = TelemetryRecord {
            cycle: self.cycle,
            timestamp: t,
            xy_state,
            z_state,
            xy: xy_samples,
            z: z_sample,
            correction,
            applied,
            stage: if locked { self.target } else { None },
        };
        let sink = &mut self.hw.sink;
        let published = catch_unwind(AssertUnwindSafe(|| sink.publish(record.clone())));
        if published.is_err() {
            self.callback_panic("telemetry sink");
        }
        self.tap.push(record);
    }

    fn callback_panic(&mut self, what: &'static str) {
        let n = {
            let mut stats = self.stats.lock();
            stats.callback_panics += 1;
            stats.callback_panics
        };
        if n.is_power_of_two() {
            error!(cycle = self.cycle, callback = what, panics = n, "Callback panicked, cycle continues");
        }
    }

    fn view(&self) -> CycleView {
        let shared = self.shared.lock();
        let group = |g: AxisGroup| {
            let s = shared.group(g);
            GroupView {
                state: s.machine.state(),
                session: s.session,
                rois: s.rois.clone(),
            }
        };
        CycleView {
            xy: group(AxisGroup::Xy),
            z: group(AxisGroup::Z),
            calibration: shared.calibration,
        }
    }

    fn execute(&mut self, cmd: EngineCommand) {
        let result = match cmd {
            EngineCommand::MoveStageBy { dx, dy, dz } => self.move_by(dx, dy, dz),
            EngineCommand::SetExposure(s) => self.hw.camera.set_exposure(s),
            EngineCommand::SetGain(g) => self.hw.camera.set_gain(g),
        };
        if let Err(e) = result {
            warn!(command = ?cmd, error = %e, "Engine command failed");
        }
    }

    /// Current stage target, read back from the stage if never set.
    fn current_target(&mut self) -> Result<StagePosition, HardwareError> {
        match self.target {
            Some(p) => Ok(p),
            None => {
                let p = self.hw.stage.get_position()?;
                self.target = Some(p);
                Ok(p)
            }
        }
    }

    fn clamp(&self, p: StagePosition) -> StagePosition {
        self.limits.map_or(p, |l| l.clamp(p))
    }

    fn move_by(&mut self, dx: f64, dy: f64, dz: f64) -> Result<(), HardwareError> {
        let cur = self.current_target()?;
        let next = self.clamp(StagePosition {
            x: cur.x + dx,
            y: cur.y + dy,
            z: cur.z + dz,
        });
        if dx != 0.0 || dy != 0.0 {
            self.hw.stage.set_position_xy(next.x, next.y)?;
            self.target = Some(StagePosition { z: cur.z, ..next });
        }
        if dz != 0.0 {
            self.hw.stage.set_position_z(next.z)?;
            if let Some(t) = self.target.as_mut() {
                t.z = next.z;
            }
        }
        Ok(())
    }

    fn move_xy(&mut self, dx: f64, dy: f64) -> Result<(), HardwareError> {
        let cur = self.current_target()?;
        let next = self.clamp(StagePosition {
            x: cur.x + dx,
            y: cur.y + dy,
            z: cur.z,
        });
        self.hw.stage.set_position_xy(next.x, next.y)?;
        self.target = Some(next);
        Ok(())
    }

    fn move_z(&mut self, dz: f64) -> Result<(), HardwareError> {
        let cur = self.current_target()?;
        let next = self.clamp(StagePosition { z: cur.z + dz, ..cur });
        self.hw.stage.set_position_z(next.z)?;
        self.target = Some(next);
        Ok(())
    }

    /// Drop `group` to Tracking after a failed stage command.
    fn actuator_fault(&mut self, group: AxisGroup, source: HardwareError) -> GroupState {
        self.stats.lock().actuator_faults += 1;
        // The commanded target is unknown after a failure.
        self.target = None;
        let mut shared = self.shared.lock();
        let state = match shared.group_mut(group).machine.handle_event(GroupEvent::ActuatorFault) {
            TransitionResult::Ok(s) => s,
            // Already unlocked by the caller in the meantime.
            TransitionResult::Rejected(_) => shared.group(group).machine.state(),
        };
        error!(%group, error = %source, "Stage command failed, group unlocked");
        shared.last_fault = Some(StabilizerError::ActuatorFault { group, source });
        state
    }
}
