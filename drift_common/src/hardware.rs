//! Hardware capability traits.
//!
//! The engine talks to the microscope only through these two traits, so any
//! camera or piezo stage (or a simulation of one) can be plugged in.
//!
//! # Ownership
//!
//! Both devices are moved into the control thread while the engine runs.
//! Implementations therefore need `Send` but never `Sync`.

use crate::error::HardwareError;
use crate::types::{StageLimits, StagePosition};
use ndarray::Array2;

/// Frame source.
pub trait Camera: Send {
    /// Human-readable device name, used in logs.
    fn name(&self) -> &str;

    /// Block until the next frame is available and return it.
    ///
    /// This call paces the control loop; the engine adds no sleep of its own.
    fn get_image(&mut self) -> Result<Array2<u16>, HardwareError>;

    /// Set exposure time in seconds.
    fn set_exposure(&mut self, _seconds: f64) -> Result<(), HardwareError> {
        Err(HardwareError::Unsupported("set_exposure"))
    }

    /// Set analog gain, `0..=10`.
    fn set_gain(&mut self, _gain: f64) -> Result<(), HardwareError> {
        Err(HardwareError::Unsupported("set_gain"))
    }
}

/// Three-axis positioner, nanometres.
pub trait Stage: Send {
    /// Human-readable device name, used in logs.
    fn name(&self) -> &str;

    fn get_position(&mut self) -> Result<StagePosition, HardwareError>;

    fn set_position_xy(&mut self, x: f64, y: f64) -> Result<(), HardwareError>;

    fn set_position_z(&mut self, z: f64) -> Result<(), HardwareError>;

    /// Travel range, if the device reports one.
    fn get_limits(&self) -> Option<StageLimits> {
        None
    }
}
