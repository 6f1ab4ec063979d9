use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistortionModel {
    /// Fisheye model: `theta_d = theta (1 + k1 theta^2 + k2 theta^4 + k3 theta^6 + k4 theta^8)`.
    Equidistant,
    /// Radial-tangential model with coefficients `k1, k2, p1, p2[, k3]`.
    #[serde(alias = "radtan")]
    PlumbBob,
}

/// Camera matrix given to undistorted frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewCameraMatrix {
    /// Reuse the (rescaled) input matrix.
    #[default]
    Keep,
    /// Fisheye-style estimate from the frame's edge midpoints. `0.0` crops
    /// to valid pixels, `1.0` keeps the whole field of view.
    Balance(f64),
    /// Pinhole-style estimate from a 9x9 grid. `0.0` keeps only valid
    /// pixels, `1.0` keeps every source pixel.
    Alpha(f64),
}

/// Intrinsics and distortion of one physical camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub distortion_model: DistortionModel,
    /// Row-major 3x3 camera matrix.
    pub camera_matrix: [f64; 9],
    pub distortion_coefficients: Vec<f64>,
    /// Image size the intrinsics were estimated at. Frames of another size
    /// get the matrix rescaled.
    #[serde(default)]
    pub reference_size: Option<[u32; 2]>,
}

impl Calibration {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let calib: Calibration = toml::from_str(&text)?;
        calib.validate().map_err(|reason| PipelineError::Calibration { path: path.to_path_buf(), reason })?;
        Ok(calib)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let needed = match self.distortion_model {
            DistortionModel::Equidistant => 4..=4,
            DistortionModel::PlumbBob => 4..=5,
        };
        if !needed.contains(&self.distortion_coefficients.len()) {
            return Err(format!(
                "{:?} needs {:?} distortion coefficients, got {}",
                self.distortion_model,
                needed,
                self.distortion_coefficients.len()
            ));
        }
        if self.fx() <= 0.0 || self.fy() <= 0.0 {
            return Err("focal lengths must be positive".to_string());
        }
        if self.camera_matrix.iter().any(|v| !v.is_finite()) {
            return Err("camera matrix has non-finite entries".to_string());
        }
        Ok(())
    }

    pub fn fx(&self) -> f64 {
        self.camera_matrix[0]
    }

    pub fn fy(&self) -> f64 {
        self.camera_matrix[4]
    }

    pub fn cx(&self) -> f64 {
        self.camera_matrix[2]
    }

    pub fn cy(&self) -> f64 {
        self.camera_matrix[5]
    }

    pub fn skew(&self) -> f64 {
        self.camera_matrix[1]
    }

    /// Camera matrix adapted to a frame of `width` x `height`.
    pub fn scaled_to(&self, width: u32, height: u32) -> Calibration {
        let Some([ref_w, ref_h]) = self.reference_size else {
            return self.clone();
        };
        let sx = width as f64 / ref_w as f64;
        let sy = height as f64 / ref_h as f64;
        let mut scaled = self.clone();
        scaled.camera_matrix[0] *= sx;
        scaled.camera_matrix[1] *= sx;
        scaled.camera_matrix[2] *= sx;
        scaled.camera_matrix[4] *= sy;
        scaled.camera_matrix[5] *= sy;
        scaled.reference_size = Some([width, height]);
        scaled
    }

    /// Normalized image coordinates of pixel `(u, v)` under this matrix.
    pub fn normalize(&self, u: f64, v: f64) -> (f64, f64) {
        pinhole_normalize(&self.camera_matrix, u, v)
    }

    /// Matrix for undistorted frames of `width` x `height`.
    pub fn new_camera_matrix(&self, strategy: NewCameraMatrix, width: u32, height: u32) -> [f64; 9] {
        let k = self.scaled_to(width, height);
        match strategy {
            NewCameraMatrix::Keep => k.camera_matrix,
            NewCameraMatrix::Balance(balance) => k.balanced_matrix(balance.clamp(0.0, 1.0), width, height),
            NewCameraMatrix::Alpha(alpha) => k.optimal_matrix(alpha.clamp(0.0, 1.0), width, height),
        }
    }

    fn undistort_pixel(&self, u: f64, v: f64) -> (f64, f64) {
        let (xd, yd) = self.normalize(u, v);
        self.undistort_normalized(xd, yd)
    }

    /// Interpolates between the focal length that crops to valid pixels and
    /// the one that keeps the whole field of view, both measured at the four
    /// edge midpoints.
    fn balanced_matrix(&self, balance: f64, width: u32, height: u32) -> [f64; 9] {
        let (w, h) = (width as f64, height as f64);
        let aspect = self.fx() / self.fy();
        let mut points = [(w / 2.0, 0.0), (w, h / 2.0), (w / 2.0, h), (0.0, h / 2.0)]
            .map(|(u, v)| self.undistort_pixel(u, v));
        let mut cn = points.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0 / 4.0, acc.1 + p.1 / 4.0));
        cn.1 *= aspect;
        for p in points.iter_mut() {
            p.1 *= aspect;
        }

        let min_x = points.iter().map(|p| p.0).fold(f64::INFINITY, f64::min);
        let max_x = points.iter().map(|p| p.0).fold(f64::NEG_INFINITY, f64::max);
        let min_y = points.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
        let max_y = points.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
        let candidates = [
            w * 0.5 / (cn.0 - min_x),
            w * 0.5 / (max_x - cn.0),
            h * 0.5 * aspect / (cn.1 - min_y),
            h * 0.5 * aspect / (max_y - cn.1),
        ];
        let f_min = candidates.iter().copied().fold(f64::INFINITY, f64::min);
        let f_max = candidates.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let f = balance * f_min + (1.0 - balance) * f_max;

        let cx = -cn.0 * f + w * 0.5;
        let cy = (-cn.1 * f + h * aspect * 0.5) / aspect;
        [f, 0.0, cx, 0.0, f / aspect, cy, 0.0, 0.0, 1.0]
    }

    /// Interpolates between the largest rectangle of valid pixels and the
    /// rectangle bounding every undistorted source pixel.
    fn optimal_matrix(&self, alpha: f64, width: u32, height: u32) -> [f64; 9] {
        const N: u32 = 9;
        let (w1, h1) = ((width.max(2) - 1) as f64, (height.max(2) - 1) as f64);
        let (mut outer_x0, mut outer_x1) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut outer_y0, mut outer_y1) = (f64::INFINITY, f64::NEG_INFINITY);
        let (mut inner_x0, mut inner_x1) = (f64::NEG_INFINITY, f64::INFINITY);
        let (mut inner_y0, mut inner_y1) = (f64::NEG_INFINITY, f64::INFINITY);
        for gy in 0..N {
            for gx in 0..N {
                let u = gx as f64 * w1 / (N - 1) as f64;
                let v = gy as f64 * h1 / (N - 1) as f64;
                let (x, y) = self.undistort_pixel(u, v);
                outer_x0 = outer_x0.min(x);
                outer_x1 = outer_x1.max(x);
                outer_y0 = outer_y0.min(y);
                outer_y1 = outer_y1.max(y);
                if gx == 0 {
                    inner_x0 = inner_x0.max(x);
                }
                if gx == N - 1 {
                    inner_x1 = inner_x1.min(x);
                }
                if gy == 0 {
                    inner_y0 = inner_y0.max(y);
                }
                if gy == N - 1 {
                    inner_y1 = inner_y1.min(y);
                }
            }
        }

        let fit = |x0: f64, x1: f64, y0: f64, y1: f64| {
            let fx = w1 / (x1 - x0);
            let fy = h1 / (y1 - y0);
            (fx, fy, -fx * x0, -fy * y0)
        };
        let inner = fit(inner_x0, inner_x1, inner_y0, inner_y1);
        let outer = fit(outer_x0, outer_x1, outer_y0, outer_y1);
        let mix = |a: f64, b: f64| a * (1.0 - alpha) + b * alpha;
        [
            mix(inner.0, outer.0),
            0.0,
            mix(inner.2, outer.2),
            0.0,
            mix(inner.1, outer.1),
            mix(inner.3, outer.3),
            0.0,
            0.0,
            1.0,
        ]
    }

    /// Invert [`Calibration::distort`] numerically.
    pub fn undistort_normalized(&self, xd: f64, yd: f64) -> (f64, f64) {
        let d = &self.distortion_coefficients;
        match self.distortion_model {
            DistortionModel::Equidistant => {
                let r_d = (xd * xd + yd * yd).sqrt();
                let theta_d = r_d.min(std::f64::consts::FRAC_PI_2);
                if theta_d < 1e-8 {
                    return (xd, yd);
                }
                let mut theta = theta_d;
                for _ in 0..10 {
                    let t2 = theta * theta;
                    let f = theta * (1.0 + t2 * (d[0] + t2 * (d[1] + t2 * (d[2] + t2 * d[3])))) - theta_d;
                    let df = 1.0 + t2 * (3.0 * d[0] + t2 * (5.0 * d[1] + t2 * (7.0 * d[2] + t2 * 9.0 * d[3])));
                    theta -= f / df;
                }
                let scale = theta.tan() / theta_d;
                (xd * scale, yd * scale)
            }
            DistortionModel::PlumbBob => {
                let (k1, k2, p1, p2) = (d[0], d[1], d[2], d[3]);
                let k3 = d.get(4).copied().unwrap_or(0.0);
                let (mut x, mut y) = (xd, yd);
                for _ in 0..5 {
                    let r2 = x * x + y * y;
                    let icdist = 1.0 / (1.0 + r2 * (k1 + r2 * (k2 + r2 * k3)));
                    let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
                    let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
                    x = (xd - dx) * icdist;
                    y = (yd - dy) * icdist;
                }
                (x, y)
            }
        }
    }

    /// Apply the distortion model to a normalized, undistorted image point.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let d = &self.distortion_coefficients;
        match self.distortion_model {
            DistortionModel::Equidistant => {
                let r = (x * x + y * y).sqrt();
                if r < 1e-12 {
                    return (x, y);
                }
                let theta = r.atan();
                let t2 = theta * theta;
                let theta_d = theta * (1.0 + t2 * (d[0] + t2 * (d[1] + t2 * (d[2] + t2 * d[3]))));
                let scale = theta_d / r;
                (x * scale, y * scale)
            }
            DistortionModel::PlumbBob => {
                let (k1, k2, p1, p2) = (d[0], d[1], d[2], d[3]);
                let k3 = d.get(4).copied().unwrap_or(0.0);
                let r2 = x * x + y * y;
                let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
                let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
                let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
                (xd, yd)
            }
        }
    }
}

/// Normalized coordinates of pixel `(u, v)` under a row-major camera matrix.
pub fn pinhole_normalize(k: &[f64; 9], u: f64, v: f64) -> (f64, f64) {
    let y = (v - k[5]) / k[4];
    let x = (u - k[2] - k[1] * y) / k[0];
    (x, y)
}
