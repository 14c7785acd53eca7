// estimator/ransac.rs

// RANSAC-wrapped PnP bootstrap: builds matched 3-D/2-D pairs from the
// identified LEDs, runs a small fixed number of minimal-sample iterations,
// validates the winning pose by inlier count and per-axis reprojection,
// and (in its state-writing form) installs the pose into the body state
// with a fresh diagonal covariance.

// Dependencies
use log::debug;
use nalgebra::{Vector2, Vector3, UnitQuaternion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::pnp::{refine_pose, reprojection_error, solve_pnp, Pose};
use super::EstimationContext;
use crate::filter::state::{BodyState, BodyStateVector};
use crate::filter::FilterState;
use crate::vision::camera::CameraIntrinsics;
use crate::vision::led::Led;

/// Initial diagonal covariance installed with a RANSAC pose: essentially
/// exact position, moderate orientation uncertainty, velocities pinned to
/// the zeros just written.
const INITIAL_POSITION_STATE_ERROR: f64 = 0.0;
const INITIAL_ORIENTATION_STATE_ERROR: f64 = 0.5;
const INITIAL_VELOCITY_STATE_ERROR: f64 = 0.0;

pub struct RansacPoseEstimator {
    required_inliers: usize,
    permitted_outliers: usize,
    iterations: usize,
    /// Euclidean reprojection cutoff for counting a match as an inlier.
    reprojection_cutoff: f64,
    /// Post-hoc per-axis tolerance every inlier must satisfy.
    per_axis_tolerance: f64,
    rng: StdRng,
}

impl Default for RansacPoseEstimator {
    fn default() -> Self {
        RansacPoseEstimator {
            required_inliers: 4,
            permitted_outliers: 0,
            iterations: 5,
            reprojection_cutoff: 8.0,
            per_axis_tolerance: 4.0,
            rng: StdRng::from_entropy(),
        }
    }
}

impl RansacPoseEstimator {
    /// Deterministic variant for tests and replay.
    pub fn with_seed(seed: u64) -> Self {
        RansacPoseEstimator {
            rng: StdRng::seed_from_u64(seed),
            ..Default::default()
        }
    }

    /// Raw pose estimation from identified LEDs. Marks the LEDs backing
    /// the winning consensus as used. Does not touch any body state.
    pub fn estimate_pose(
        &mut self,
        intrinsics: &CameraIntrinsics,
        leds: &mut [Led],
        usable: &[usize],
        beacon_positions: &[Vector3<f64>],
    ) -> Option<Pose> {
        // Matched pairs: i-th object point corresponds to i-th image point.
        let mut object_points = Vec::with_capacity(usable.len());
        let mut image_points: Vec<Vector2<f64>> = Vec::with_capacity(usable.len());
        let mut led_indices = Vec::with_capacity(usable.len());
        for &led_idx in usable {
            let led = &leds[led_idx];
            let beacon = led.id().as_index();
            if beacon >= beacon_positions.len() {
                continue;
            }
            object_points.push(beacon_positions[beacon]);
            image_points.push(led.location());
            led_indices.push(led_idx);
        }

        let n = object_points.len();
        if n < self.required_inliers + self.permitted_outliers {
            return None;
        }

        let mut best: Option<(Vec<usize>, Pose)> = None;
        for _ in 0..self.iterations {
            let sample = rand::seq::index::sample(&mut self.rng, n, 4).into_vec();
            let sample_world: Vec<Vector3<f64>> =
                sample.iter().map(|&i| object_points[i]).collect();
            let sample_pixels: Vec<Vector2<f64>> =
                sample.iter().map(|&i| image_points[i]).collect();
            let candidate = match solve_pnp(&sample_world, &sample_pixels, intrinsics) {
                Some(pose) => pose,
                None => continue,
            };
            let inliers: Vec<usize> = (0..n)
                .filter(|&i| {
                    reprojection_error(&candidate, intrinsics, &object_points[i], &image_points[i])
                        < self.reprojection_cutoff
                })
                .collect();
            if best
                .as_ref()
                .map(|(prev, _)| inliers.len() > prev.len())
                .unwrap_or(true)
            {
                best = Some((inliers, candidate));
            }
        }

        let (inliers, pose) = best?;
        if inliers.len() < self.required_inliers {
            debug!(
                "RANSAC rejected pose: {} inliers of {} required",
                inliers.len(),
                self.required_inliers
            );
            return None;
        }

        // Polish over the consensus set.
        let inlier_world: Vec<Vector3<f64>> = inliers.iter().map(|&i| object_points[i]).collect();
        let inlier_pixels: Vec<Vector2<f64>> = inliers.iter().map(|&i| image_points[i]).collect();
        let pose = refine_pose(&pose, &inlier_world, &inlier_pixels, intrinsics, 10);

        // Reproject the inliers and insist they land close on both axes
        // individually; otherwise the pose is bad despite the consensus.
        for (world, pixel) in inlier_world.iter().zip(inlier_pixels.iter()) {
            let projected = intrinsics.project(&pose.transform(world))?;
            let delta = projected - pixel;
            if delta.x.abs() > self.per_axis_tolerance || delta.y.abs() > self.per_axis_tolerance {
                debug!(
                    "RANSAC rejected pose: per-axis reprojection {:?} beyond {}",
                    delta, self.per_axis_tolerance
                );
                return None;
            }
        }

        for &i in &inliers {
            leds[led_indices[i]].mark_as_used();
        }
        Some(pose)
    }

    /// Pose estimation that, on success, overwrites the body state:
    /// position and external quaternion from the pose, velocities and
    /// incremental rotation zeroed, and a fresh diagonal covariance.
    pub fn estimate_into_state(
        &mut self,
        ctx: &mut EstimationContext<'_>,
        leds: &mut [Led],
        usable: &[usize],
    ) -> bool {
        let beacon_positions: Vec<Vector3<f64>> =
            ctx.beacons.iter().map(|b| b.position()).collect();
        let pose = match self.estimate_pose(ctx.intrinsics, leds, usable, &beacon_positions) {
            Some(pose) => pose,
            None => return false,
        };
        install_pose(ctx.state, &pose.rotation, &pose.translation);
        true
    }
}

/// Writes a bootstrap pose into a body state with the standard initial
/// covariance.
pub fn install_pose(
    state: &mut BodyState,
    rotation: &UnitQuaternion<f64>,
    translation: &Vector3<f64>,
) {
    state.set_position(translation);
    state.set_quaternion(rotation);
    // Zero what the bootstrap cannot measure.
    state.set_incremental_orientation(&Vector3::zeros());
    state.set_velocity(&Vector3::zeros());
    state.set_angular_velocity(&Vector3::zeros());

    let mut diag = BodyStateVector::zeros();
    for i in 0..3 {
        diag[i] = INITIAL_POSITION_STATE_ERROR;
        diag[i + 3] = INITIAL_ORIENTATION_STATE_ERROR;
        diag[i + 6] = INITIAL_VELOCITY_STATE_ERROR;
        diag[i + 9] = INITIAL_VELOCITY_STATE_ERROR;
    }
    state.set_error_covariance(&crate::filter::state::BodyStateMatrix::from_diagonal(&diag));
}
