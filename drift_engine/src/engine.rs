//! Stabilization engine.
//!
//! [`Stabilizer`] is the public face: ROI editing, per-group tracking and
//! lock, gains, calibration and a camera/stage passthrough. A dedicated
//! control thread ([`runner`]) does all I/O while the engine runs.
//!
//! ## Locking
//! Two locks, always taken in the order `shared → controller`. The control
//! thread never holds both: it copies what it needs out of `shared` and
//! releases it before touching the controller.

mod command;
mod runner;
mod tap;

pub use command::EngineCommand;
pub use tap::TelemetryTap;

use crate::config::StabilizerConfig;
use crate::control::{GainValue, PiGains, ResponseController, build_controller};
use crate::cycle::CycleStats;
use crate::error::{Result, StabilizerError};
use crate::localize::{LocalizationPool, build_fitters};
use crate::roi::RegionTracker;
use crate::state::{EngineState, GroupEvent, GroupStateMachine, TransitionResult};
use crossbeam_channel::{Receiver, Sender, unbounded};
use drift_common::clock::{Clock, SystemClock};
use drift_common::error::HardwareError;
use drift_common::hardware::{Camera, Stage};
use drift_common::telemetry::{TelemetryRecord, TelemetrySink};
use drift_common::types::{AxisGroup, CalibrationFrame, GroupState, Roi, RoiId, StagePosition};
use parking_lot::Mutex;
use runner::CycleRunner;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

// ─── Hardware ───────────────────────────────────────────────────────

/// Devices owned by whoever drives I/O: the engine while stopped, the
/// control thread while running.
pub struct Hardware {
    pub camera: Box<dyn Camera>,
    pub stage: Box<dyn Stage>,
    pub sink: Box<dyn TelemetrySink>,
}

impl std::fmt::Debug for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hardware")
            .field("camera", &self.camera.name())
            .field("stage", &self.stage.name())
            .finish_non_exhaustive()
    }
}

// ─── Shared State ───────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct GroupSession {
    pub(crate) machine: GroupStateMachine,
    /// Bumped at every engagement; the control thread keys its reference
    /// positions on it.
    pub(crate) session: u64,
    pub(crate) rois: Arc<[Roi]>,
}

impl GroupSession {
    fn new() -> Self {
        Self {
            machine: GroupStateMachine::new(),
            session: 0,
            rois: Arc::from(Vec::new()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SharedState {
    pub(crate) engine: EngineState,
    pub(crate) tracker: RegionTracker,
    pub(crate) xy: GroupSession,
    pub(crate) z: GroupSession,
    pub(crate) calibration: CalibrationFrame,
    pub(crate) last_fault: Option<StabilizerError>,
}

impl SharedState {
    pub(crate) fn group(&self, group: AxisGroup) -> &GroupSession {
        match group {
            AxisGroup::Xy => &self.xy,
            AxisGroup::Z => &self.z,
        }
    }

    pub(crate) fn group_mut(&mut self, group: AxisGroup) -> &mut GroupSession {
        match group {
            AxisGroup::Xy => &mut self.xy,
            AxisGroup::Z => &mut self.z,
        }
    }

    fn transition(&mut self, group: AxisGroup, event: GroupEvent) -> Result<GroupState> {
        match self.group_mut(group).machine.handle_event(event) {
            TransitionResult::Ok(s) => {
                info!(%group, ?event, state = ?s, "Group state changed");
                Ok(s)
            }
            TransitionResult::Rejected(reason) => Err(StabilizerError::TransitionRejected(reason)),
        }
    }
}

// ─── Stabilizer ─────────────────────────────────────────────────────

/// Closed-loop drift stabilizer.
///
/// All methods take `&self`; wrap in an `Arc` to drive it from several
/// threads.
pub struct Stabilizer {
    config: StabilizerConfig,
    shared: Arc<Mutex<SharedState>>,
    controller: Arc<Mutex<Box<dyn ResponseController>>>,
    tap: Arc<TelemetryTap>,
    stats: Arc<Mutex<CycleStats>>,
    running: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    cmd_tx: Sender<EngineCommand>,
    cmd_rx: Receiver<EngineCommand>,
    hardware: Mutex<Option<Hardware>>,
    thread: Mutex<Option<JoinHandle<Hardware>>>,
}

impl std::fmt::Debug for Stabilizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stabilizer")
            .field("running", &self.is_running())
            .field("xy", &self.group_state(AxisGroup::Xy))
            .field("z", &self.group_state(AxisGroup::Z))
            .finish_non_exhaustive()
    }
}

impl Stabilizer {
    /// Build a stopped engine with the system clock.
    pub fn new(
        config: StabilizerConfig,
        camera: Box<dyn Camera>,
        stage: Box<dyn Stage>,
        sink: Box<dyn TelemetrySink>,
    ) -> Result<Self> {
        Self::with_clock(config, camera, stage, sink, Arc::new(SystemClock))
    }

    /// Build a stopped engine. ROIs and calibration from `config` are
    /// loaded; the controller is built from `[controller]`.
    pub fn with_clock(
        config: StabilizerConfig,
        camera: Box<dyn Camera>,
        stage: Box<dyn Stage>,
        sink: Box<dyn TelemetrySink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let controller = build_controller(&config.controller)?;

        let mut tracker = RegionTracker::new();
        for r in &config.rois {
            tracker.add_roi(r.group, r.x, r.y, r.half_size)?;
        }

        let (cmd_tx, cmd_rx) = unbounded();
        let shared = SharedState {
            engine: EngineState::Stopped,
            tracker,
            xy: GroupSession::new(),
            z: GroupSession::new(),
            calibration: config.calibration,
            last_fault: None,
        };
        debug!(
            controller = controller.name(),
            rois = config.rois.len(),
            "Stabilizer created"
        );

        Ok(Self {
            tap: Arc::new(TelemetryTap::new(config.engine.telemetry_history)),
            stats: Arc::new(Mutex::new(CycleStats::new(config.engine.cycle_budget()))),
            config,
            shared: Arc::new(Mutex::new(shared)),
            controller: Arc::new(Mutex::new(controller)),
            running: Arc::new(AtomicBool::new(false)),
            clock,
            cmd_tx,
            cmd_rx,
            hardware: Mutex::new(Some(Hardware { camera, stage, sink })),
            thread: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &StabilizerConfig {
        &self.config
    }

    // ── Lifecycle ──

    /// Spawn the control thread.
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Err(StabilizerError::AlreadyRunning);
        }
        let hw = self.hardware.lock().take().ok_or(StabilizerError::AlreadyRunning)?;

        let pool = LocalizationPool::new(
            self.config.engine.workers,
            self.config.engine.fit_timeout(),
            build_fitters(&self.config.fitting),
        );
        // Commands queued while stopped were already refused.
        while self.cmd_rx.try_recv().is_ok() {}

        self.shared.lock().engine = EngineState::Running;
        self.running.store(true, Ordering::Release);
        let runner = CycleRunner::new(
            hw,
            pool,
            self.shared.clone(),
            self.controller.clone(),
            self.cmd_rx.clone(),
            self.tap.clone(),
            self.stats.clone(),
            self.running.clone(),
            self.clock.clone(),
            self.config.engine.clone(),
        );
        let handle = std::thread::Builder::new()
            .name("drift-control".to_string())
            .spawn(move || runner.run())
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                self.shared.lock().engine = EngineState::Stopped;
                StabilizerError::Hardware(HardwareError::InitFailed(format!(
                    "control thread spawn failed: {e}"
                )))
            })?;
        *thread = Some(handle);
        info!("Stabilizer started");
        Ok(())
    }

    /// Stop the control thread. Every group returns to Idle; the stage is
    /// left where it is.
    pub fn stop(&self) -> Result<()> {
        let handle = self.thread.lock().take().ok_or(StabilizerError::NotRunning)?;
        self.running.store(false, Ordering::Release);
        match handle.join() {
            Ok(hw) => *self.hardware.lock() = Some(hw),
            Err(_) => warn!("Control thread panicked, hardware handles lost"),
        }

        let mut shared = self.shared.lock();
        shared.engine = EngineState::Stopped;
        for group in AxisGroup::ALL {
            shared.tracker.release(group);
            let session = shared.group_mut(group);
            session.machine.handle_event(GroupEvent::EngineStop);
            session.rois = Arc::from(Vec::new());
        }
        info!(cycles = self.tap.latest_cycle(), "Stabilizer stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Take back the hardware of a stopped engine.
    pub fn into_hardware(mut self) -> Option<Hardware> {
        if self.is_running() {
            let _ = self.stop();
        }
        self.hardware.get_mut().take()
    }

    // ── ROIs ──

    pub fn add_roi(&self, group: AxisGroup, center_x: usize, center_y: usize, half_size: usize) -> Result<RoiId> {
        self.shared.lock().tracker.add_roi(group, center_x, center_y, half_size)
    }

    pub fn remove_roi(&self, id: RoiId) -> Result<()> {
        self.shared.lock().tracker.remove_roi(id)
    }

    pub fn move_roi(&self, id: RoiId, center_x: usize, center_y: usize) -> Result<()> {
        self.shared.lock().tracker.move_roi(id, center_x, center_y)
    }

    /// Editable ROIs of `group`, queued edits not applied.
    pub fn rois(&self, group: AxisGroup) -> Vec<Roi> {
        self.shared.lock().tracker.rois(group)
    }

    /// ROIs frozen for the current session, empty while idle.
    pub fn active_rois(&self, group: AxisGroup) -> Arc<[Roi]> {
        self.shared.lock().group(group).rois.clone()
    }

    // ── Tracking & lock ──

    pub fn group_state(&self, group: AxisGroup) -> GroupState {
        self.shared.lock().group(group).machine.state()
    }

    /// Engage or disengage tracking for `group`.
    ///
    /// Engaging freezes the ROI list, applies queued edits and resets the
    /// controller state for the group. Disengaging a locked group fails.
    pub fn set_tracking(&self, group: AxisGroup, enabled: bool) -> Result<()> {
        let mut shared = self.shared.lock();
        if enabled {
            if shared.engine != EngineState::Running {
                return Err(StabilizerError::NotRunning);
            }
            shared.transition(group, GroupEvent::EngageTracking)?;
            let rois = shared.tracker.snapshot(group);
            let session = shared.group_mut(group);
            session.session += 1;
            session.rois = rois.clone();
            let mut controller = self.controller.lock();
            match group {
                AxisGroup::Xy => controller.reset_xy(rois.len()),
                AxisGroup::Z => controller.reset_z(),
            }
            info!(%group, rois = rois.len(), "Tracking engaged");
        } else {
            shared.transition(group, GroupEvent::DisengageTracking)?;
            shared.tracker.release(group);
            shared.group_mut(group).rois = Arc::from(Vec::new());
            info!(%group, "Tracking disengaged");
        }
        Ok(())
    }

    /// Lock or unlock `group`. Locking requires Tracking and a calibration
    /// for the group, and starts the controller from a clean state.
    pub fn set_locked(&self, group: AxisGroup, enabled: bool) -> Result<()> {
        let mut shared = self.shared.lock();
        if enabled {
            if shared.group(group).machine.state() == GroupState::Idle {
                return Err(StabilizerError::InvalidParameter(format!(
                    "{group} group must be tracking before it can lock"
                )));
            }
            if !shared.calibration.is_calibrated(group) {
                return Err(StabilizerError::Uncalibrated(group));
            }
            shared.transition(group, GroupEvent::Lock)?;
            let n = shared.group(group).rois.len();
            let mut controller = self.controller.lock();
            match group {
                AxisGroup::Xy => controller.reset_xy(n),
                AxisGroup::Z => controller.reset_z(),
            }
        } else {
            shared.transition(group, GroupEvent::Unlock)?;
        }
        Ok(())
    }

    /// Most recent actuator fault, cleared on read.
    pub fn take_fault(&self) -> Option<StabilizerError> {
        self.shared.lock().last_fault.take()
    }

    // ── Calibration ──

    pub fn calibration(&self) -> CalibrationFrame {
        self.shared.lock().calibration
    }

    /// Replace the calibration. Clearing the calibration of a locked group
    /// is refused.
    pub fn set_calibration(&self, calibration: CalibrationFrame) -> Result<()> {
        let mut shared = self.shared.lock();
        for group in AxisGroup::ALL {
            if shared.group(group).machine.is_locked() && !calibration.is_calibrated(group) {
                return Err(StabilizerError::InvalidParameter(format!(
                    "{group} group is locked, cannot clear its calibration"
                )));
            }
        }
        shared.calibration = calibration;
        info!(?calibration, "Calibration updated");
        Ok(())
    }

    // ── Controller ──

    pub fn set_gain_p(&self, v: impl Into<GainValue>) -> Result<()> {
        self.controller.lock().set_gain_p(v.into())
    }

    pub fn set_gain_i(&self, v: impl Into<GainValue>) -> Result<()> {
        self.controller.lock().set_gain_i(v.into())
    }

    pub fn gains(&self) -> PiGains {
        self.controller.lock().gains()
    }

    pub fn controller_name(&self) -> &'static str {
        self.controller.lock().name()
    }

    /// Swap the response strategy. Refused while any group is locked.
    pub fn set_controller(&self, mut controller: Box<dyn ResponseController>) -> Result<()> {
        let shared = self.shared.lock();
        if AxisGroup::ALL.iter().any(|g| shared.group(*g).machine.is_locked()) {
            return Err(StabilizerError::InvalidParameter(
                "unlock all groups before replacing the controller".to_string(),
            ));
        }
        controller.reset_xy(shared.xy.rois.len());
        controller.reset_z();
        info!(controller = controller.name(), "Controller replaced");
        *self.controller.lock() = controller;
        Ok(())
    }

    // ── Passthrough ──

    /// Relative stage move, nm. Queued to the control thread while
    /// running, applied directly while stopped.
    pub fn move_stage_by(&self, dx: f64, dy: f64, dz: f64) -> Result<()> {
        if ![dx, dy, dz].iter().all(|v| v.is_finite()) {
            return Err(StabilizerError::InvalidParameter("stage move must be finite".to_string()));
        }
        self.dispatch(EngineCommand::MoveStageBy { dx, dy, dz }, |hw| {
            let p = hw.stage.get_position()?;
            let mut next = StagePosition {
                x: p.x + dx,
                y: p.y + dy,
                z: p.z + dz,
            };
            if let Some(limits) = hw.stage.get_limits() {
                next = limits.clamp(next);
            }
            hw.stage.set_position_xy(next.x, next.y)?;
            hw.stage.set_position_z(next.z)
        })
    }

    pub fn set_exposure(&self, seconds: f64) -> Result<()> {
        self.dispatch(EngineCommand::SetExposure(seconds), |hw| hw.camera.set_exposure(seconds))
    }

    pub fn set_camera_gain(&self, gain: f64) -> Result<()> {
        self.dispatch(EngineCommand::SetGain(gain), |hw| hw.camera.set_gain(gain))
    }

    /// Stage position. Only available while stopped; while running use the
    /// telemetry stream.
    pub fn stage_position(&self) -> Result<StagePosition> {
        let mut hw = self.hardware.lock();
        let hw = hw.as_mut().ok_or(StabilizerError::AlreadyRunning)?;
        Ok(hw.stage.get_position()?)
    }

    fn dispatch(
        &self,
        cmd: EngineCommand,
        direct: impl FnOnce(&mut Hardware) -> std::result::Result<(), HardwareError>,
    ) -> Result<()> {
        if self.is_running() {
            self.cmd_tx.send(cmd).map_err(|_| StabilizerError::NotRunning)?;
            return Ok(());
        }
        let mut hw = self.hardware.lock();
        match hw.as_mut() {
            Some(hw) => Ok(direct(hw)?),
            None => Err(StabilizerError::NotRunning),
        }
    }

    // ── Telemetry ──

    pub fn latest(&self) -> Option<TelemetryRecord> {
        self.tap.latest()
    }

    pub fn latest_cycle(&self) -> u64 {
        self.tap.latest_cycle()
    }

    /// Retained records with `cycle >= from`.
    pub fn history_since(&self, from: u64) -> Vec<TelemetryRecord> {
        self.tap.since(from)
    }

    /// Block until cycle `cycle` has been published.
    pub fn wait_for_cycle(&self, cycle: u64, timeout: Duration) -> Result<TelemetryRecord> {
        if !self.is_running() && self.tap.latest_cycle() < cycle {
            return Err(StabilizerError::NotRunning);
        }
        self.tap.wait_for(cycle, timeout).ok_or(StabilizerError::Timeout("control cycle"))
    }

    /// Block for `n` further published cycles and return the last one.
    pub fn wait_cycles(&self, n: u64, timeout: Duration) -> Result<TelemetryRecord> {
        let target = self.tap.latest_cycle() + n.max(1);
        self.wait_for_cycle(target, timeout)
    }

    pub fn cycle_stats(&self) -> CycleStats {
        self.stats.lock().clone()
    }
}

impl Drop for Stabilizer {
    fn drop(&mut self) {
        if self.thread.get_mut().is_some() {
            let _ = self.stop();
        }
    }
}
