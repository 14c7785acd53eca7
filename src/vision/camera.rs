// vision/camera.rs

// Camera intrinsics and the Brown-Conrady radial distortion model. The
// distortion coefficients are fitted as multiplicative correction factors,
// so undistortion applies the polynomial directly to the normalized radius.

// Dependencies
use nalgebra::{Vector2, Vector3};

use crate::vision::BlobMeasurement;

/// Intrinsic camera parameters.
#[derive(Debug, Clone)]
pub struct CameraIntrinsics {
    /// Focal lengths in pixel units.
    pub fx: f64,
    pub fy: f64,
    /// Principal point in pixels.
    pub cx: f64,
    pub cy: f64,
    /// Radial distortion coefficients.
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    /// Tangential distortion coefficients (carried, not applied by the
    /// radial-only undistortion).
    pub p1: f64,
    pub p2: f64,
    /// Image size in pixels.
    pub width: usize,
    pub height: usize,
}

impl CameraIntrinsics {
    /// Intrinsics with the principal point at the image center and the
    /// given distortion coefficients.
    pub fn new(fx: f64, fy: f64, width: usize, height: usize, k: [f64; 3]) -> Self {
        CameraIntrinsics {
            fx,
            fy,
            cx: width as f64 / 2.0,
            cy: height as f64 / 2.0,
            k1: k[0],
            k2: k[1],
            k3: k[2],
            p1: 0.0,
            p2: 0.0,
            width,
            height,
        }
    }

    /// The simulated-camera profile: 700 px focal length, 640x480, no
    /// distortion. Matches a 35 mm lens on a 32 mm-wide sensor rendered at
    /// 640x480 (35 * 640 / 32 = 700).
    pub fn simulated() -> Self {
        CameraIntrinsics::new(700.0, 700.0, 640, 480, [0.0; 3])
    }

    /// Copy of these intrinsics with zero distortion, for use on points
    /// that have already been undistorted.
    pub fn undistorted_variant(&self) -> Self {
        let mut ret = self.clone();
        ret.k1 = 0.0;
        ret.k2 = 0.0;
        ret.k3 = 0.0;
        ret.p1 = 0.0;
        ret.p2 = 0.0;
        ret
    }

    pub fn principal_point(&self) -> Vector2<f64> {
        Vector2::new(self.cx, self.cy)
    }

    pub fn focal_lengths(&self) -> Vector2<f64> {
        Vector2::new(self.fx, self.fy)
    }

    /// Removes radial distortion from a pixel location.
    pub fn undistort_point(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let normalized = (point - self.principal_point()).component_div(&self.focal_lengths());
        let r2 = normalized.norm_squared();
        let factor = 1.0 + self.k1 * r2 + self.k2 * r2 * r2 + self.k3 * r2 * r2 * r2;
        (normalized * factor).component_mul(&self.focal_lengths()) + self.principal_point()
    }

    /// Projects a camera-space point to pixels. Returns None behind the
    /// camera.
    pub fn project(&self, point: &Vector3<f64>) -> Option<Vector2<f64>> {
        if point.z <= 0.0 {
            return None;
        }
        Some(Vector2::new(
            self.fx * point.x / point.z + self.cx,
            self.fy * point.y / point.z + self.cy,
        ))
    }

    /// Bearing vector (unit, camera space) of a pixel, assuming the pixel
    /// is already undistorted.
    pub fn bearing(&self, pixel: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new(
            (pixel.x - self.cx) / self.fx,
            (pixel.y - self.cy) / self.fy,
            1.0,
        )
        .normalize()
    }
}

/// Undistorts every blob measurement's location; the rest of the record is
/// carried through untouched.
pub fn undistort_measurements(
    measurements: &[BlobMeasurement],
    intrinsics: &CameraIntrinsics,
) -> Vec<BlobMeasurement> {
    measurements
        .iter()
        .map(|m| {
            let mut out = m.clone();
            out.loc = intrinsics.undistort_point(&m.loc);
            out
        })
        .collect()
}
