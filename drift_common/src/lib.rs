//! Drift Common Library
//!
//! Shared vocabulary for the drift stabilization workspace: geometry and
//! measurement types, the hardware capability traits implemented by drivers,
//! the injected clock, telemetry sinks and TOML configuration loading.
//!
//! # Module Structure
//!
//! - [`types`] - ROIs, axis groups, shifts, corrections, calibration frame
//! - [`error`] - Per-ROI fit failures and hardware errors
//! - [`hardware`] - `Camera` / `Stage` capability traits
//! - [`clock`] - Time source abstraction (system and manual clocks)
//! - [`telemetry`] - Per-cycle telemetry record and sinks
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use drift_common::prelude::*;
//! use drift_common::config::{ConfigLoader, SharedConfig};
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod hardware;
pub mod prelude;
pub mod telemetry;
pub mod types;
