//! Prelude module for common re-exports.
//!
//! `use drift_common::prelude::*;` pulls in the types that nearly every
//! consumer of the engine touches.

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LogLevel, SharedConfig};

// ─── Errors ─────────────────────────────────────────────────────────
pub use crate::error::{FitFailure, HardwareError};

// ─── Hardware capabilities ──────────────────────────────────────────
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::hardware::{Camera, Stage};

// ─── Telemetry ──────────────────────────────────────────────────────
pub use crate::telemetry::{RoiSample, TelemetryRecord, TelemetrySink};

// ─── Domain types ───────────────────────────────────────────────────
pub use crate::types::{
    AxisGroup, CalibrationFrame, Correction, GroupState, Measurement, Offset2, Roi, RoiId,
    SpotPosition, StageLimits, StagePosition, XyCalibration, ZCalibration,
};
