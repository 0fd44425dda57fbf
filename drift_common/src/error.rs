//! Error types shared across the workspace.
//!
//! - [`FitFailure`] - why a single ROI produced no position this cycle
//! - [`HardwareError`] - camera / stage capability failures

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-ROI localization failure.
///
/// Fit failures are absorbed by the pipeline: they travel as values in the
/// measurement vector and are excluded from aggregation by the controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitFailure {
    /// Crop holds no usable signal above background.
    #[error("no peak found in crop")]
    NoPeak,

    /// Iterative fit did not converge within the iteration budget.
    #[error("fit did not converge after {iterations} iterations")]
    NotConverged { iterations: u32 },

    /// Crop lies outside the frame, or the fitted center left the crop.
    #[error("fit position out of bounds")]
    OutOfBounds,

    /// No result arrived before the per-cycle deadline.
    #[error("fit timed out")]
    Timeout,

    /// The fitter panicked while processing this ROI.
    #[error("fitting worker panicked")]
    WorkerPanicked,

    /// The pool had no worker able to accept the job.
    #[error("no fitting worker available")]
    WorkerUnavailable,
}

/// Error types for camera and stage operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HardwareError {
    /// Device initialization failed
    #[error("Initialization failed: {0}")]
    InitFailed(String),

    /// Device communication error
    #[error("Hardware communication error: {0}")]
    CommunicationError(String),

    /// Requested value outside the device range
    #[error("Value out of range: {0}")]
    OutOfRange(String),

    /// Optional capability not implemented by this device
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// Driver name not present in the registry
    #[error("Driver not found: {0}")]
    DriverNotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_failure_display() {
        let err = FitFailure::NotConverged { iterations: 40 };
        assert!(err.to_string().contains("40"));
        assert_eq!(FitFailure::Timeout.to_string(), "fit timed out");
    }

    #[test]
    fn test_fit_failure_serializes_snake_case() {
        let json = serde_json::to_string(&FitFailure::WorkerPanicked).unwrap();
        assert_eq!(json, "\"worker_panicked\"");
    }

    #[test]
    fn test_hardware_error_display() {
        let err = HardwareError::DriverNotFound("andor".to_string());
        assert!(err.to_string().contains("andor"));
        let err = HardwareError::Unsupported("set_gain");
        assert!(err.to_string().contains("set_gain"));
    }
}
