//! Simulated camera.

use super::world::SimWorld;
use drift_common::error::HardwareError;
use drift_common::hardware::Camera;
use ndarray::Array2;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Renders the shared [`SimWorld`] once per `get_image` call.
pub struct SimCamera {
    world: Arc<Mutex<SimWorld>>,
}

impl SimCamera {
    pub fn new(world: Arc<Mutex<SimWorld>>) -> Self {
        Self { world }
    }
}

impl Camera for SimCamera {
    fn name(&self) -> &str {
        "sim-camera"
    }

    fn get_image(&mut self) -> Result<Array2<u16>, HardwareError> {
        let (pace, interval) = {
            let w = self.world.lock();
            (w.config.pace_frames, w.config.frame_interval_s)
        };
        if pace {
            // Lock released while "exposing" so the stage stays responsive.
            std::thread::sleep(Duration::from_secs_f64(interval));
        }
        Ok(self.world.lock().next_frame())
    }

    fn set_exposure(&mut self, seconds: f64) -> Result<(), HardwareError> {
        if !(seconds.is_finite() && seconds > 0.0) {
            return Err(HardwareError::OutOfRange(format!("exposure {seconds} s")));
        }
        self.world.lock().exposure_s = seconds;
        Ok(())
    }

    fn set_gain(&mut self, gain: f64) -> Result<(), HardwareError> {
        if !(0.0..=10.0).contains(&gain) {
            return Err(HardwareError::OutOfRange(format!("gain {gain}")));
        }
        self.world.lock().gain = gain;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::simulation::SimulationConfig;

    fn camera() -> (SimCamera, Arc<Mutex<SimWorld>>) {
        let cfg = SimulationConfig {
            pace_frames: false,
            background: 0.0,
            drift_amplitude_nm: [0.0; 3],
            ..SimulationConfig::default()
        };
        let world = Arc::new(Mutex::new(SimWorld::new(cfg)));
        (SimCamera::new(world.clone()), world)
    }

    #[test]
    fn test_frame_dimensions_and_counter() {
        let (mut cam, world) = camera();
        let img = cam.get_image().unwrap();
        assert_eq!(img.dim(), (256, 256));
        cam.get_image().unwrap();
        assert_eq!(world.lock().frames, 2);
    }

    #[test]
    fn test_exposure_scales_amplitude() {
        let (mut cam, _) = camera();
        cam.set_exposure(0.02).unwrap();
        let img = cam.get_image().unwrap();
        assert_eq!(img[[40, 40]], 1100);
    }

    #[test]
    fn test_gain_range_checked() {
        let (mut cam, _) = camera();
        assert!(cam.set_gain(4.0).is_ok());
        assert!(matches!(cam.set_gain(11.0), Err(HardwareError::OutOfRange(_))));
        assert!(cam.set_exposure(-1.0).is_err());
    }
}
