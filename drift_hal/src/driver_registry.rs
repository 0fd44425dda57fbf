//! Driver registry.
//!
//! Maps driver names to factory functions. The registry is built at startup
//! and passed around by value; there is no global state.

use drift_common::error::HardwareError;
use drift_common::hardware::{Camera, Stage};
use std::collections::BTreeMap;

/// Camera and stage produced by one driver.
pub struct HardwareSet {
    pub camera: Box<dyn Camera>,
    pub stage: Box<dyn Stage>,
}

impl std::fmt::Debug for HardwareSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareSet")
            .field("camera", &self.camera.name())
            .field("stage", &self.stage.name())
            .finish()
    }
}

/// Factory function type. Receives the driver's own config table, if the
/// application config carries one.
pub type DriverFactory = fn(Option<&toml::Table>) -> Result<HardwareSet, HardwareError>;

/// Registry of available hardware drivers.
pub struct DriverRegistry {
    factories: BTreeMap<&'static str, DriverFactory>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry pre-populated with every driver compiled into this crate.
    pub fn with_builtin() -> Self {
        let mut reg = Self::new();
        reg.factories
            .insert("simulation", crate::drivers::simulation::create_driver);
        reg
    }

    /// Register a driver factory.
    ///
    /// # Errors
    /// `HardwareError::InitFailed` if the name is already taken.
    pub fn register(&mut self, name: &'static str, factory: DriverFactory) -> Result<(), HardwareError> {
        if self.factories.contains_key(name) {
            return Err(HardwareError::InitFailed(format!(
                "driver '{name}' is already registered"
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Create a driver instance by name.
    ///
    /// # Errors
    /// `HardwareError::DriverNotFound` for unknown names, or whatever the
    /// factory reports.
    pub fn create_driver(
        &self,
        name: &str,
        config: Option<&toml::Table>,
    ) -> Result<HardwareSet, HardwareError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| HardwareError::DriverNotFound(name.to_string()))?;
        factory(config)
    }

    /// Registered driver names, sorted.
    pub fn list_drivers(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
