//! Requests queued to the control thread.
//!
//! The control thread is the only owner of camera and stage I/O while the
//! engine runs; everything else asks through this queue. Commands are
//! drained at the top of each cycle, before acquisition.

/// Work for the control thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineCommand {
    /// Relative stage move, nm.
    MoveStageBy { dx: f64, dy: f64, dz: f64 },
    /// Camera exposure, seconds.
    SetExposure(f64),
    /// Camera gain, `0..=10`.
    SetGain(f64),
}
