//! Simulation driver configuration.
//!
//! Parsed from the optional `[simulation]` table of the application config.
//! Every field has a default, so an absent table gives a working rig.

use drift_common::config::ConfigError;
use serde::{Deserialize, Serialize};

/// Parameters of the simulated microscope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Sensor width, pixels.
    pub width: usize,
    /// Sensor height, pixels.
    pub height: usize,
    /// Fiducial marker centers `[x, y]`, pixels.
    pub fiducials: Vec<[f64; 2]>,
    /// Axial reflection spot center `[x, y]`, pixels.
    pub z_spot: [f64; 2],
    /// Gaussian sigma of every rendered spot, pixels.
    pub spot_sigma_px: f64,
    /// Peak amplitude at gain 1 and the reference exposure, counts.
    pub amplitude: f64,
    /// Mean background level, counts.
    pub background: f64,
    /// Lateral pixel size in sample space.
    pub nm_per_px: f64,
    /// Direction of axial spot motion on the sensor.
    pub z_angle_rad: f64,
    /// Axial displacement per pixel of spot motion.
    pub z_nm_per_px: f64,
    /// Peak drift amplitude `[x, y, z]`, nm.
    pub drift_amplitude_nm: [f64; 3],
    /// Drift periods `[x, y, z]`, seconds.
    pub drift_period_s: [f64; 3],
    /// Simulated time between frames, seconds.
    pub frame_interval_s: f64,
    /// Sleep for `frame_interval_s` in `get_image` to emulate acquisition.
    pub pace_frames: bool,
    /// Exposure at which `amplitude` applies, seconds.
    pub reference_exposure_s: f64,
    /// Stage travel `[x, y, z]`, nm. Range is `0..=travel`.
    pub stage_travel_nm: [f64; 3],
    /// Stage fails every command after this many successful moves.
    pub fail_after_moves: Option<u64>,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let mut fiducials = Vec::with_capacity(12);
        for row in 0..3 {
            for col in 0..4 {
                fiducials.push([40.0 + 50.0 * col as f64, 40.0 + 60.0 * row as f64]);
            }
        }
        let tau = 20.0;
        Self {
            width: 256,
            height: 256,
            fiducials,
            z_spot: [128.0, 220.0],
            spot_sigma_px: 1.6,
            amplitude: 550.0,
            background: 2.5,
            nm_per_px: 100.0,
            z_angle_rad: 0.35,
            z_nm_per_px: 40.0,
            drift_amplitude_nm: [150.0, 150.0, 80.0],
            drift_period_s: [tau, tau * std::f64::consts::E, tau * std::f64::consts::PI],
            frame_interval_s: 0.02,
            pace_frames: true,
            reference_exposure_s: 0.01,
            stage_travel_nm: [100_000.0, 100_000.0, 50_000.0],
            fail_after_moves: None,
            seed: 7,
        }
    }
}

impl SimulationConfig {
    /// Parse from a driver config table. `None` gives the defaults.
    pub fn from_table(table: Option<&toml::Table>) -> Result<Self, ConfigError> {
        let cfg: Self = match table {
            Some(t) => toml::Value::Table(t.clone())
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::ParseError(e.to_string()))?,
            None => Self::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));
        if self.width < 16 || self.height < 16 {
            return fail("sensor must be at least 16x16 pixels");
        }
        if self.spot_sigma_px <= 0.0 || self.amplitude <= 0.0 || self.background < 0.0 {
            return fail("spot sigma and amplitude must be > 0, background >= 0");
        }
        if self.nm_per_px <= 0.0 || self.z_nm_per_px <= 0.0 {
            return fail("pixel scales must be > 0");
        }
        if self.drift_period_s.iter().any(|p| *p <= 0.0) {
            return fail("drift periods must be > 0");
        }
        if self.frame_interval_s <= 0.0 || self.reference_exposure_s <= 0.0 {
            return fail("frame interval and reference exposure must be > 0");
        }
        if self.stage_travel_nm.iter().any(|t| *t <= 0.0) {
            return fail("stage travel must be > 0");
        }
        let inside = |p: &[f64; 2]| {
            p[0] >= 0.0 && p[1] >= 0.0 && p[0] < self.width as f64 && p[1] < self.height as f64
        };
        if !self.fiducials.iter().all(inside) || !inside(&self.z_spot) {
            return fail("spot centers must lie on the sensor");
        }
        Ok(())
    }
}
