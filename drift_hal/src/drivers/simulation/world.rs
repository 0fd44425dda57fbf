//! Shared state of the simulated microscope.
//!
//! Camera and stage both hold an `Arc<Mutex<SimWorld>>`: stage moves shift
//! the rendered spots, and drift advances with each acquired frame.

use super::config::SimulationConfig;
use drift_common::types::StagePosition;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

pub struct SimWorld {
    pub(crate) config: SimulationConfig,
    /// Simulated time of the last rendered frame, seconds.
    pub(crate) time_s: f64,
    pub(crate) frames: u64,
    pub(crate) stage: StagePosition,
    /// Stage position at construction; spots sit at their nominal centers here.
    pub(crate) stage_home: StagePosition,
    pub(crate) exposure_s: f64,
    pub(crate) gain: f64,
    rng: StdRng,
}

impl SimWorld {
    pub fn new(config: SimulationConfig) -> Self {
        let home = StagePosition {
            x: config.stage_travel_nm[0] / 2.0,
            y: config.stage_travel_nm[1] / 2.0,
            z: config.stage_travel_nm[2] / 2.0,
        };
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            exposure_s: config.reference_exposure_s,
            config,
            time_s: 0.0,
            frames: 0,
            stage: home,
            stage_home: home,
            gain: 1.0,
        }
    }

    /// Sample drift at simulated time `t`, nm.
    ///
    /// Lateral axes follow sines of incommensurate periods; the axial axis is
    /// a triangle wave.
    pub fn drift_nm(&self, t: f64) -> [f64; 3] {
        let amp = self.config.drift_amplitude_nm;
        let per = self.config.drift_period_s;
        let phase_z = (t / per[2]).rem_euclid(1.0);
        let triangle = 1.0 - 4.0 * (phase_z - 0.5).abs();
        [
            amp[0] * (2.0 * PI * t / per[0]).sin(),
            amp[1] * (2.0 * PI * t / per[1]).sin(),
            amp[2] * triangle,
        ]
    }

    /// Total apparent sample displacement `[x, y, z]`, nm: drift plus stage
    /// travel from home.
    pub fn displacement_nm(&self) -> [f64; 3] {
        let d = self.drift_nm(self.time_s);
        [
            d[0] + self.stage.x - self.stage_home.x,
            d[1] + self.stage.y - self.stage_home.y,
            d[2] + self.stage.z - self.stage_home.z,
        ]
    }

    /// Current rendered fiducial centers, pixels.
    pub fn fiducial_centers(&self) -> Vec<[f64; 2]> {
        let [dx, dy, _] = self.displacement_nm();
        let s = self.config.nm_per_px;
        self.config
            .fiducials
            .iter()
            .map(|p| [p[0] + dx / s, p[1] + dy / s])
            .collect()
    }

    /// Current rendered axial spot center, pixels.
    pub fn z_spot_center(&self) -> [f64; 2] {
        let [_, _, dz] = self.displacement_nm();
        let along = dz / self.config.z_nm_per_px;
        let (sin, cos) = self.config.z_angle_rad.sin_cos();
        [
            self.config.z_spot[0] + along * cos,
            self.config.z_spot[1] + along * sin,
        ]
    }

    /// Advance time by one frame and render it.
    pub fn next_frame(&mut self) -> Array2<u16> {
        self.frames += 1;
        self.time_s = self.frames as f64 * self.config.frame_interval_s;

        let (h, w) = (self.config.height, self.config.width);
        let scale = self.gain * self.exposure_s / self.config.reference_exposure_s;
        let bg = self.config.background * scale;

        let mut img = Array2::<f64>::zeros((h, w));
        for v in img.iter_mut() {
            *v = bg + bg.sqrt() * self.standard_normal();
        }

        let amp = self.config.amplitude * scale;
        let sigma = self.config.spot_sigma_px;
        let mut centers = self.fiducial_centers();
        centers.push(self.z_spot_center());
        for c in centers {
            render_spot(&mut img, c, amp, sigma);
        }

        img.mapv(|v| v.round().clamp(0.0, u16::MAX as f64) as u16)
    }

    fn standard_normal(&mut self) -> f64 {
        // Box-Muller
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen_range(0.0..1.0);
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }
}

fn render_spot(img: &mut Array2<f64>, center: [f64; 2], amp: f64, sigma: f64) {
    let (h, w) = img.dim();
    let reach = (4.0 * sigma).ceil();
    let [cx, cy] = center;
    let r0 = (cy - reach).floor().max(0.0) as usize;
    let c0 = (cx - reach).floor().max(0.0) as usize;
    let r1 = ((cy + reach).ceil().max(0.0) as usize).min(h.saturating_sub(1));
    let c1 = ((cx + reach).ceil().max(0.0) as usize).min(w.saturating_sub(1));
    if r0 > r1 || c0 > c1 {
        return;
    }
    let inv = 1.0 / (2.0 * sigma * sigma);
    for r in r0..=r1 {
        for c in c0..=c1 {
            let d2 = (c as f64 - cx).powi(2) + (r as f64 - cy).powi(2);
            img[[r, c]] += amp * (-d2 * inv).exp();
        }
    }
}
