//! # Drift Stabilization Engine
//!
//! Closed-loop focus and drift correction for a camera-observed sample.
//! Each cycle acquires a frame, localizes fiducial spots (XY) and an axial
//! reference spot (Z) to sub-pixel precision, turns their displacement from
//! the session reference into a stage correction and applies it while the
//! axis group is locked.
//!
//! ## Architecture
//!
//! ```text
//!   Camera ──frame──▶ LocalizationPool ──positions──▶ references / shifts
//!                          (workers)                        │
//!                                                calibration (px → nm)
//!                                                           │
//!   Stage ◀──target── clamp ◀──correction── ResponseController
//!                                                           │
//!                                               TelemetrySink / tap
//! ```
//!
//! ## Group State Machine
//!
//! `Idle → Tracking → Locked`, per axis group (XY and Z independently).
//! Locking needs tracking and a calibration; an actuator fault drops a
//! locked group back to Tracking.

pub mod calibration;
pub mod config;
pub mod control;
pub mod cycle;
pub mod engine;
pub mod error;
pub mod localize;
pub mod roi;
pub mod state;

pub use engine::{Hardware, Stabilizer};
pub use error::{Result, StabilizerError};
