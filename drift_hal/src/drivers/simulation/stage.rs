//! Simulated piezo stage.

use super::world::SimWorld;
use drift_common::error::HardwareError;
use drift_common::hardware::Stage;
use drift_common::types::{StageLimits, StagePosition};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Moves the sample in the shared [`SimWorld`].
pub struct SimStage {
    world: Arc<Mutex<SimWorld>>,
    limits: StageLimits,
    moves: u64,
    fail_after: Option<u64>,
}

impl SimStage {
    pub fn new(world: Arc<Mutex<SimWorld>>) -> Self {
        let (travel, fail_after) = {
            let w = world.lock();
            (w.config.stage_travel_nm, w.config.fail_after_moves)
        };
        Self {
            world,
            limits: StageLimits {
                min: StagePosition::default(),
                max: StagePosition {
                    x: travel[0],
                    y: travel[1],
                    z: travel[2],
                },
            },
            moves: 0,
            fail_after,
        }
    }

    fn check_fault(&mut self) -> Result<(), HardwareError> {
        if let Some(limit) = self.fail_after {
            if self.moves >= limit {
                return Err(HardwareError::CommunicationError(
                    "piezo controller not responding".to_string(),
                ));
            }
        }
        self.moves += 1;
        Ok(())
    }

    fn check_range(&self, axis: &str, v: f64, lo: f64, hi: f64) -> Result<(), HardwareError> {
        if v.is_finite() && (lo..=hi).contains(&v) {
            Ok(())
        } else {
            Err(HardwareError::OutOfRange(format!("{axis} = {v} nm")))
        }
    }
}

impl Stage for SimStage {
    fn name(&self) -> &str {
        "sim-stage"
    }

    fn get_position(&mut self) -> Result<StagePosition, HardwareError> {
        Ok(self.world.lock().stage)
    }

    fn set_position_xy(&mut self, x: f64, y: f64) -> Result<(), HardwareError> {
        self.check_range("x", x, self.limits.min.x, self.limits.max.x)?;
        self.check_range("y", y, self.limits.min.y, self.limits.max.y)?;
        self.check_fault()?;
        let mut w = self.world.lock();
        w.stage.x = x;
        w.stage.y = y;
        debug!(x, y, "sim stage xy move");
        Ok(())
    }

    fn set_position_z(&mut self, z: f64) -> Result<(), HardwareError> {
        self.check_range("z", z, self.limits.min.z, self.limits.max.z)?;
        self.check_fault()?;
        self.world.lock().stage.z = z;
        Ok(())
    }

    fn get_limits(&self) -> Option<StageLimits> {
        Some(self.limits)
    }
}
