//! TOML configuration for the stabilizer.
//!
//! One file describes the whole rig: engine timing, fitting, controller,
//! optional calibration, the calibration routine, initial ROIs and the
//! driver-specific `[simulation]` table. Every section has defaults, so an
//! empty file is a valid (uncalibrated, ROI-less) configuration.

use std::path::Path;
use std::time::Duration;

use drift_common::config::{ConfigError, ConfigLoader, SharedConfig};
use drift_common::types::{AxisGroup, CalibrationFrame};
use serde::{Deserialize, Serialize};

use crate::control::{GainValue, RejectionStrategy};
use crate::roi::MIN_HALF_SIZE;

// ─── Sections ───────────────────────────────────────────────────────

/// `[engine]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Safety clamp on the per-cycle stage command, nm per axis.
    pub max_correction_nm: f64,
    /// Per-cycle localization deadline.
    pub fit_timeout_ms: u64,
    /// Fitting worker threads; 0 = available parallelism.
    pub workers: usize,
    /// Soft cycle-time budget for overrun accounting; 0 disables.
    pub cycle_budget_ms: u64,
    /// Log cycle statistics every N cycles; 0 disables.
    pub stats_interval: u64,
    /// Back-off after a failed acquisition.
    pub acquisition_retry_ms: u64,
    /// Recent telemetry records kept for in-process observers.
    pub telemetry_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_correction_nm: 200.0,
            fit_timeout_ms: 200,
            workers: 0,
            cycle_budget_ms: 100,
            stats_interval: 500,
            acquisition_retry_ms: 10,
            telemetry_history: 256,
        }
    }
}

impl EngineConfig {
    pub fn fit_timeout(&self) -> Duration {
        Duration::from_millis(self.fit_timeout_ms)
    }

    pub fn cycle_budget(&self) -> Duration {
        Duration::from_millis(self.cycle_budget_ms)
    }

    pub fn acquisition_retry(&self) -> Duration {
        Duration::from_millis(self.acquisition_retry_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.max_correction_nm.is_finite() && self.max_correction_nm > 0.0) {
            return Err(invalid("engine.max_correction_nm must be > 0"));
        }
        if self.fit_timeout_ms == 0 {
            return Err(invalid("engine.fit_timeout_ms must be > 0"));
        }
        if self.telemetry_history == 0 {
            return Err(invalid("engine.telemetry_history must be > 0"));
        }
        Ok(())
    }
}

/// Localization method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMethod {
    Gaussian,
    Centroid,
}

/// `[fitting]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FittingConfig {
    pub xy_method: FitMethod,
    pub z_method: FitMethod,
    pub max_iterations: u32,
    /// Minimum peak-over-noise ratio for a crop to count as a spot.
    pub min_snr: f64,
    /// Starting Gaussian width, pixels.
    pub initial_sigma_px: f64,
}

impl Default for FittingConfig {
    fn default() -> Self {
        Self {
            xy_method: FitMethod::Gaussian,
            z_method: FitMethod::Centroid,
            max_iterations: 50,
            min_snr: 5.0,
            initial_sigma_px: 1.5,
        }
    }
}

impl FittingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(invalid("fitting.max_iterations must be > 0"));
        }
        if !(self.min_snr.is_finite() && self.min_snr >= 0.0) {
            return Err(invalid("fitting.min_snr must be >= 0"));
        }
        if !(self.initial_sigma_px.is_finite() && self.initial_sigma_px > 0.0) {
            return Err(invalid("fitting.initial_sigma_px must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    #[default]
    Pi,
    OutlierPi,
}

/// `[controller]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub kind: ControllerKind,
    pub kp: GainValue,
    pub ki: GainValue,
    /// Controller output clip per cycle, nm.
    pub max_shift_nm: f64,
    /// Outlier statistic (`outlier_pi` only).
    pub strategy: RejectionStrategy,
    /// Rejection threshold; defaults per strategy.
    pub threshold: Option<f64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            kind: ControllerKind::Pi,
            kp: GainValue::Scalar(1.0),
            ki: GainValue::Scalar(1.0),
            max_shift_nm: 100.0,
            strategy: RejectionStrategy::Mad,
            threshold: None,
        }
    }
}

impl ControllerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.kp
            .resolve()
            .map_err(|e| invalid(&format!("controller.kp: {e}")))?;
        self.ki
            .resolve()
            .map_err(|e| invalid(&format!("controller.ki: {e}")))?;
        if !(self.max_shift_nm.is_finite() && self.max_shift_nm > 0.0) {
            return Err(invalid("controller.max_shift_nm must be > 0"));
        }
        if let Some(t) = self.threshold {
            if !(t.is_finite() && t > 0.0) {
                return Err(invalid("controller.threshold must be > 0"));
            }
        }
        Ok(())
    }
}

/// `[calibration_routine]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationRoutineConfig {
    /// Stage step between XY samples, nm.
    pub xy_step_nm: f64,
    /// Stage step between Z samples, nm.
    pub z_step_nm: f64,
    /// Samples per axis; the stage visits `0, step, .., (steps - 1)·step`.
    pub steps: usize,
    /// Cycles to discard after each move.
    pub settle_cycles: u64,
    /// Cycles averaged per position.
    pub samples_per_step: u64,
    /// Wait limit for one batch of cycles.
    pub cycle_timeout_ms: u64,
}

impl Default for CalibrationRoutineConfig {
    fn default() -> Self {
        Self {
            xy_step_nm: 100.0,
            z_step_nm: 100.0,
            steps: 5,
            settle_cycles: 3,
            samples_per_step: 5,
            cycle_timeout_ms: 5000,
        }
    }
}

impl CalibrationRoutineConfig {
    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_millis(self.cycle_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.xy_step_nm.is_finite() && self.xy_step_nm != 0.0)
            || !(self.z_step_nm.is_finite() && self.z_step_nm != 0.0)
        {
            return Err(invalid("calibration_routine steps must be non-zero"));
        }
        if self.steps < 3 {
            return Err(invalid("calibration_routine.steps must be >= 3"));
        }
        if self.samples_per_step == 0 || self.cycle_timeout_ms == 0 {
            return Err(invalid(
                "calibration_routine.samples_per_step and cycle_timeout_ms must be > 0",
            ));
        }
        Ok(())
    }
}

/// `[[rois]]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoiConfig {
    pub group: AxisGroup,
    pub x: usize,
    pub y: usize,
    pub half_size: usize,
}

// ─── Root ───────────────────────────────────────────────────────────

/// Whole stabilizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StabilizerConfig {
    #[serde(default)]
    pub shared: SharedConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub fitting: FittingConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Absent halves mean that group is uncalibrated.
    #[serde(default)]
    pub calibration: CalibrationFrame,
    #[serde(default)]
    pub calibration_routine: CalibrationRoutineConfig,
    #[serde(default)]
    pub rois: Vec<RoiConfig>,
    /// Driver-specific table passed through to the simulation driver.
    #[serde(default)]
    pub simulation: Option<toml::Table>,
}

impl StabilizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.engine.validate()?;
        self.fitting.validate()?;
        self.controller.validate()?;
        self.calibration_routine.validate()?;
        if let Some(xy) = &self.calibration.xy {
            if !(xy.nm_per_px_x.is_finite() && xy.nm_per_px_x != 0.0)
                || !(xy.nm_per_px_y.is_finite() && xy.nm_per_px_y != 0.0)
            {
                return Err(invalid("calibration.xy scales must be finite and non-zero"));
            }
        }
        if let Some(z) = &self.calibration.z {
            if !(z.angle_rad.is_finite() && z.nm_per_px.is_finite() && z.nm_per_px != 0.0) {
                return Err(invalid("calibration.z must be finite with non-zero scale"));
            }
        }
        for (i, r) in self.rois.iter().enumerate() {
            if r.half_size < MIN_HALF_SIZE {
                return Err(invalid(&format!(
                    "rois[{i}].half_size must be >= {MIN_HALF_SIZE}"
                )));
            }
        }
        if self.rois.iter().filter(|r| r.group == AxisGroup::Z).count() > 1 {
            return Err(invalid("at most one Z ROI"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> ConfigError {
    ConfigError::ValidationError(msg.to_string())
}

/// Load and validate a stabilizer config file.
pub fn load_config(path: &Path) -> Result<StabilizerConfig, ConfigError> {
    let cfg = StabilizerConfig::load(path)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Parse and validate a stabilizer config from a string.
pub fn load_config_from_str(content: &str) -> Result<StabilizerConfig, ConfigError> {
    let cfg = StabilizerConfig::load_str(content)?;
    cfg.validate()?;
    Ok(cfg)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[shared]
service_name = "scope-3"
log_level = "debug"

[engine]
max_correction_nm = 150.0
fit_timeout_ms = 80
workers = 4

[fitting]
xy_method = "gaussian"
z_method = "centroid"

[controller]
kind = "outlier_pi"
kp = [0.8, 0.8, 0.5]
ki = 0.2
strategy = "std"

[calibration.xy]
nm_per_px_x = 98.5
nm_per_px_y = 101.2

[[rois]]
group = "xy"
x = 40
y = 40
half_size = 6

[[rois]]
group = "z"
x = 128
y = 220
half_size = 10

[simulation]
width = 256
pace_frames = false
"#;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = load_config_from_str("").unwrap();
        assert_eq!(cfg, StabilizerConfig::default());
        assert!(cfg.calibration.xy.is_none());
        assert!(cfg.simulation.is_none());
    }

    #[test]
    fn full_sample_parses() {
        let cfg = load_config_from_str(SAMPLE).unwrap();
        assert_eq!(cfg.shared.service_name, "scope-3");
        assert_eq!(cfg.engine.workers, 4);
        assert_eq!(cfg.engine.fit_timeout(), Duration::from_millis(80));
        assert_eq!(cfg.controller.kind, ControllerKind::OutlierPi);
        assert_eq!(cfg.controller.strategy, RejectionStrategy::Std);
        assert_eq!(cfg.controller.kp.resolve().unwrap(), [0.8, 0.8, 0.5]);
        assert_eq!(cfg.calibration.xy.unwrap().nm_per_px_y, 101.2);
        assert!(cfg.calibration.z.is_none());
        assert_eq!(cfg.rois.len(), 2);
        assert_eq!(cfg.rois[1].group, AxisGroup::Z);
        let sim = cfg.simulation.unwrap();
        assert_eq!(sim.get("width").and_then(|v| v.as_integer()), Some(256));
    }

    #[test]
    fn load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.engine.max_correction_nm, 150.0);
    }

    #[test]
    fn missing_file() {
        assert_eq!(
            load_config(Path::new("/nonexistent/stabilizer.toml")),
            Err(ConfigError::FileNotFound)
        );
    }

    #[test]
    fn bad_gain_vector_rejected() {
        let err = load_config_from_str("[controller]\nkp = [1.0, 2.0]").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(m) if m.contains("kp")));
    }

    #[test]
    fn two_z_rois_rejected() {
        let toml = r#"
[[rois]]
group = "z"
x = 10
y = 10
half_size = 4
[[rois]]
group = "z"
x = 30
y = 10
half_size = 4
"#;
        assert!(matches!(
            load_config_from_str(toml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn zero_timeout_rejected() {
        assert!(load_config_from_str("[engine]\nfit_timeout_ms = 0").is_err());
        assert!(load_config_from_str("[calibration_routine]\nsteps = 2").is_err());
        assert!(load_config_from_str("[rois]\n").is_err());
    }

    #[test]
    fn shipped_config_is_valid() {
        let cfg = load_config_from_str(include_str!("../../config/stabilizer.toml")).unwrap();
        assert_eq!(cfg.rois.iter().filter(|r| r.group == AxisGroup::Z).count(), 1);
        assert!(cfg.calibration.is_calibrated(AxisGroup::Xy));
        assert_eq!(cfg.controller.threshold, Some(1.5));
    }
}
