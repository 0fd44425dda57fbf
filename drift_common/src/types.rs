//! Core domain types: regions of interest, spot positions, shifts,
//! corrections, stage coordinates and the calibration frame.
//!
//! Pixel coordinates follow the image array layout: `x` is the column
//! index, `y` the row index, origin at the top-left pixel center.
//! Physical quantities are nanometres.

use crate::error::FitFailure;
use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Axis groups ────────────────────────────────────────────────────

/// Independent locking domains of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisGroup {
    /// Lateral drift, measured on fiducial markers.
    Xy,
    /// Axial drift, measured on a reflected spot.
    Z,
}

impl AxisGroup {
    pub const ALL: [AxisGroup; 2] = [AxisGroup::Xy, AxisGroup::Z];
}

impl fmt::Display for AxisGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisGroup::Xy => write!(f, "xy"),
            AxisGroup::Z => write!(f, "z"),
        }
    }
}

/// Lock state of a single axis group.
///
/// `Locked` implies the group is also tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    #[default]
    Idle,
    Tracking,
    Locked,
}

impl GroupState {
    /// True when the group measures positions each cycle.
    pub fn is_engaged(self) -> bool {
        !matches!(self, GroupState::Idle)
    }
}

// ─── Regions of interest ────────────────────────────────────────────

/// Stable identifier of a region of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoiId(pub u32);

impl fmt::Display for RoiId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "roi#{}", self.0)
    }
}

/// Square crop around a reference feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub id: RoiId,
    pub group: AxisGroup,
    /// Crop center column, pixels.
    pub center_x: usize,
    /// Crop center row, pixels.
    pub center_y: usize,
    /// Half side length; the crop spans `2 * half_size + 1` pixels.
    pub half_size: usize,
}

/// Frame-clamped crop window, half-open ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBounds {
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
}

impl CropBounds {
    pub fn rows(&self) -> usize {
        self.row_end - self.row_start
    }

    pub fn cols(&self) -> usize {
        self.col_end - self.col_start
    }
}

/// Smallest crop side a fitter can work with.
pub const MIN_CROP_SIDE: usize = 3;

impl Roi {
    /// Crop window of this ROI inside a `rows x cols` frame.
    ///
    /// Partially visible crops are clamped to the frame. Returns `None` when
    /// the remaining window is smaller than [`MIN_CROP_SIDE`] on either side.
    pub fn crop_bounds(&self, rows: usize, cols: usize) -> Option<CropBounds> {
        let row_start = self.center_y.saturating_sub(self.half_size);
        let col_start = self.center_x.saturating_sub(self.half_size);
        let row_end = self.center_y.saturating_add(self.half_size).saturating_add(1).min(rows);
        let col_end = self.center_x.saturating_add(self.half_size).saturating_add(1).min(cols);

        if row_end < row_start.saturating_add(MIN_CROP_SIDE) || col_end < col_start.saturating_add(MIN_CROP_SIDE) {
            return None;
        }
        Some(CropBounds {
            row_start,
            row_end,
            col_start,
            col_end,
        })
    }
}

// ─── Measurements ───────────────────────────────────────────────────

/// Sub-pixel spot center in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpotPosition {
    pub x: f64,
    pub y: f64,
}

impl SpotPosition {
    pub fn offset_from(&self, reference: &SpotPosition) -> Offset2 {
        Offset2 {
            x: self.x - reference.x,
            y: self.y - reference.y,
        }
    }
}

/// Result of localizing one ROI in one frame.
pub type Measurement = Result<SpotPosition, FitFailure>;

/// 2D displacement, either pixels or nanometres depending on context.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Offset2 {
    pub x: f64,
    pub y: f64,
}

impl Offset2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Per-cycle 3-axis correction, nanometres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Correction {
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
}

impl Correction {
    pub const ZERO: Correction = Correction {
        dx: 0.0,
        dy: 0.0,
        dz: 0.0,
    };

    /// Clamp every axis into `[-limit, limit]`. Non-finite axes become 0.
    pub fn clamped(self, limit: f64) -> Correction {
        let clamp = |v: f64| {
            if v.is_finite() {
                v.clamp(-limit, limit)
            } else {
                0.0
            }
        };
        Correction {
            dx: clamp(self.dx),
            dy: clamp(self.dy),
            dz: clamp(self.dz),
        }
    }
}

// ─── Stage ──────────────────────────────────────────────────────────

/// Absolute stage position, nanometres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StagePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Travel range reported by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageLimits {
    pub min: StagePosition,
    pub max: StagePosition,
}

impl StageLimits {
    pub fn clamp(&self, p: StagePosition) -> StagePosition {
        StagePosition {
            x: p.x.clamp(self.min.x, self.max.x),
            y: p.y.clamp(self.min.y, self.max.y),
            z: p.z.clamp(self.min.z, self.max.z),
        }
    }
}

// ─── Calibration ────────────────────────────────────────────────────

/// Lateral pixel scale, nm per pixel along each image axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct XyCalibration {
    pub nm_per_px_x: f64,
    pub nm_per_px_y: f64,
}

impl XyCalibration {
    pub fn to_nm(&self, shift_px: Offset2) -> Offset2 {
        Offset2 {
            x: shift_px.x * self.nm_per_px_x,
            y: shift_px.y * self.nm_per_px_y,
        }
    }
}

/// Axial calibration: direction of spot motion on the sensor and the
/// nm-per-pixel scale along it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZCalibration {
    pub angle_rad: f64,
    pub nm_per_px: f64,
}

impl ZCalibration {
    /// Project a pixel shift onto the calibrated direction, in nm.
    pub fn project(&self, shift_px: Offset2) -> f64 {
        let (sin, cos) = self.angle_rad.sin_cos();
        (shift_px.x * cos + shift_px.y * sin) * self.nm_per_px
    }
}

/// Pixel to nanometre mapping. A missing half means that group is
/// uncalibrated.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationFrame {
    #[serde(default)]
    pub xy: Option<XyCalibration>,
    #[serde(default)]
    pub z: Option<ZCalibration>,
}

impl CalibrationFrame {
    pub fn is_calibrated(&self, group: AxisGroup) -> bool {
        match group {
            AxisGroup::Xy => self.xy.is_some(),
            AxisGroup::Z => self.z.is_some(),
        }
    }
}
