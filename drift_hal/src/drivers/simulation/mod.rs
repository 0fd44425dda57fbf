//! Simulation driver.
//!
//! A fiducial field on a simulated sensor, coupled to a simulated piezo
//! stage, for development and tests without physical hardware.

mod camera;
mod config;
mod stage;
mod world;

pub use camera::SimCamera;
pub use config::SimulationConfig;
pub use stage::SimStage;
pub use world::SimWorld;

use crate::driver_registry::HardwareSet;
use drift_common::error::HardwareError;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Build a camera and stage sharing one world.
pub fn build(config: SimulationConfig) -> (SimCamera, SimStage, Arc<Mutex<SimWorld>>) {
    let world = Arc::new(Mutex::new(SimWorld::new(config)));
    (
        SimCamera::new(world.clone()),
        SimStage::new(world.clone()),
        world,
    )
}

/// Factory function for the driver registry.
pub fn create_driver(table: Option<&toml::Table>) -> Result<HardwareSet, HardwareError> {
    let config = SimulationConfig::from_table(table)
        .map_err(|e| HardwareError::InitFailed(e.to_string()))?;
    info!(
        width = config.width,
        height = config.height,
        fiducials = config.fiducials.len(),
        "Simulation driver initialized"
    );
    let (camera, stage, _) = build(config);
    Ok(HardwareSet {
        camera: Box::new(camera),
        stage: Box::new(stage),
    })
}
