//! Driver implementations.
//!
//! Each driver module exposes a `create_driver` factory matching
//! [`crate::DriverFactory`].

pub mod simulation;
