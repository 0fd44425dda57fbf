//! # Drift HAL Library
//!
//! Hardware layer of the drift stabilizer. Drivers produce a [`HardwareSet`]
//! (one camera, one stage) implementing the capability traits from
//! `drift_common::hardware`; the binary picks one by name through the
//! [`DriverRegistry`].
//!
//! # Module Structure
//!
//! - [`driver_registry`] - Driver factory registration
//! - [`drivers`] - Driver implementations (simulation)
//!
//! ```text
//! ┌──────────────────┐   create_driver("simulation")   ┌───────────────────┐
//! │  DriverRegistry  │ ──────────────────────────────► │    HardwareSet    │
//! └──────────────────┘                                  │  camera + stage   │
//!                                                       └─────────┬─────────┘
//!                                                                 │ moved into
//!                                                                 ▼
//!                                                        stabilizer control thread
//! ```

pub mod driver_registry;
pub mod drivers;

pub use driver_registry::{DriverFactory, DriverRegistry, HardwareSet};
