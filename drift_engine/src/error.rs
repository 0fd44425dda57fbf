//! Engine-level error taxonomy.
//!
//! Per-ROI fit failures never reach this type: they are absorbed into the
//! measurement vector. Everything here is reported to the caller of a
//! public engine, controller or calibration operation.

use drift_common::config::ConfigError;
use drift_common::error::HardwareError;
use drift_common::types::{AxisGroup, RoiId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StabilizerError {
    /// Caller supplied an argument the operation cannot accept.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// ROI edit attempted while its group is tracking; the edit was queued
    /// and takes effect at the next engagement.
    #[error("{group} group is engaged, edit of {roi} queued until next engagement")]
    RoiEditDeferred { group: AxisGroup, roi: RoiId },

    #[error("Unknown ROI: {0}")]
    UnknownRoi(RoiId),

    /// Calibration fit needs at least `need` samples.
    #[error("Insufficient calibration data: got {got} samples, need {need}")]
    InsufficientCalibrationData { got: usize, need: usize },

    /// Calibration samples do not determine a usable mapping.
    #[error("Degenerate calibration: {0}")]
    DegenerateCalibration(String),

    /// Lock requested for a group without a calibration.
    #[error("{0} group is uncalibrated")]
    Uncalibrated(AxisGroup),

    #[error("Fitting pool has no available worker")]
    WorkerUnavailable,

    /// Stage command failed; the owning group was dropped to Tracking.
    #[error("Actuator fault on {group} group: {source}")]
    ActuatorFault {
        group: AxisGroup,
        #[source]
        source: HardwareError,
    },

    #[error("Hardware error: {0}")]
    Hardware(#[from] HardwareError),

    #[error("State transition rejected: {0}")]
    TransitionRejected(&'static str),

    #[error("Engine is not running")]
    NotRunning,

    #[error("Engine is already running")]
    AlreadyRunning,

    /// Waiting for engine progress did not complete in time.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T, E = StabilizerError> = std::result::Result<T, E>;
