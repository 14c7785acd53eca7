// estimator/ransac_kalman.rs

// RANSAC-seeded Kalman estimator: instead of overwriting the body state,
// the bootstrap pose is filtered in as two measurements - an absolute
// orientation with fixed isotropic variance, then an absolute position
// whose variance grows with the square of the depth (farther targets are
// noisier in the image).

// Dependencies
use nalgebra::Vector3;

use super::ransac::RansacPoseEstimator;
use super::EstimationContext;
use crate::filter::measurement::{AbsoluteOrientationMeasurement, AbsolutePositionMeasurement};
use crate::filter::{correct, predict};
use crate::vision::led::Led;
use crate::Timestamp;

const POSITION_VARIANCE_SCALE: f64 = 1e-1;
const ORIENTATION_VARIANCE: f64 = 1.0;

pub struct RansacKalmanPoseEstimator {
    ransac: RansacPoseEstimator,
}

impl Default for RansacKalmanPoseEstimator {
    fn default() -> Self {
        RansacKalmanPoseEstimator {
            ransac: RansacPoseEstimator::default(),
        }
    }
}

impl RansacKalmanPoseEstimator {
    pub fn with_seed(seed: u64) -> Self {
        RansacKalmanPoseEstimator {
            ransac: RansacPoseEstimator::with_seed(seed),
        }
    }

    /// Runs the RANSAC bootstrap and, on success, filters the pose into
    /// the body state. Returns whether a pose was obtained.
    pub fn estimate(
        &mut self,
        ctx: &mut EstimationContext<'_>,
        leds: &mut [Led],
        usable: &[usize],
        frame_time: Timestamp,
    ) -> bool {
        let beacon_positions: Vec<Vector3<f64>> =
            ctx.beacons.iter().map(|b| b.position()).collect();
        let pose = match self
            .ransac
            .estimate_pose(ctx.intrinsics, leds, usable, &beacon_positions)
        {
            Some(pose) => pose,
            None => return false,
        };

        // Advance the filter to the frame time before correcting.
        if ctx.starting_time != frame_time {
            let dt = frame_time.seconds_since(ctx.starting_time);
            predict(ctx.state, ctx.process, dt);
        }

        let orientation = AbsoluteOrientationMeasurement::new(
            &pose.rotation,
            &Vector3::from_element(ORIENTATION_VARIANCE),
        );
        correct(ctx.state, &orientation, true);

        // Farther is noisier: variance scales with depth squared.
        let depth = pose.translation.z;
        let position = AbsolutePositionMeasurement::new(
            &pose.translation,
            &Vector3::from_element(POSITION_VARIANCE_SCALE * depth * depth),
        );
        correct(ctx.state, &position, true);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParams;
    use crate::estimator::BeaconDebug;
    use crate::filter::process::DampedConstantVelocity;
    use crate::filter::state::{BeaconState, BodyState};
    use crate::vision::camera::CameraIntrinsics;
    use crate::vision::led::BeaconId;
    use crate::vision::pattern::FixedIdentifier;
    use crate::vision::BlobMeasurement;
    use nalgebra::{Matrix3, UnitQuaternion, Vector2};

    #[test]
    fn bootstrap_pose_is_filtered_toward_truth() {
        let params = ConfigParams::default();
        let intrinsics = CameraIntrinsics::simulated();
        let positions = [
            Vector3::new(-0.04, -0.03, 0.0),
            Vector3::new(0.04, -0.03, 0.0),
            Vector3::new(0.04, 0.03, 0.01),
            Vector3::new(-0.04, 0.03, 0.0),
        ];
        let truth_rotation = UnitQuaternion::from_euler_angles(0.0, 0.1, 0.0);
        let truth_translation = Vector3::new(0.0, 0.0, 0.4);

        let mut beacons: Vec<BeaconState> = positions
            .iter()
            .map(|p| BeaconState::new(*p, Matrix3::identity() * 1e-9))
            .collect();
        let mut leds: Vec<Led> = positions
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let pixel = intrinsics
                    .project(&(truth_rotation * p + truth_translation))
                    .unwrap();
                Led::new(
                    BlobMeasurement::from_center_and_area(pixel, 25.0),
                    &FixedIdentifier::new(BeaconId(i as i32)),
                )
            })
            .collect();
        let usable: Vec<usize> = (0..4).collect();

        let mut state = BodyState::default();
        let process =
            DampedConstantVelocity::new(0.9, 0.9, &params.process_noise_autocorrelation);
        let variances = vec![3.0; 4];
        let fixed = vec![true; 4];
        let emission = vec![Vector3::new(0.0, 0.0, -1.0); 4];
        let mut debug = vec![BeaconDebug::default(); 4];

        let mut estimator = RansacKalmanPoseEstimator::with_seed(3);
        let mut ctx = EstimationContext {
            intrinsics: &intrinsics,
            beacons: &mut beacons,
            base_measurement_variance: &variances,
            beacon_fixed: &fixed,
            emission_directions: &emission,
            starting_time: Timestamp::from_secs(0.0),
            state: &mut state,
            process: &process,
            beacon_debug: &mut debug,
        };
        let got = estimator.estimate(
            &mut ctx,
            &mut leds,
            &usable,
            Timestamp::from_secs(1.0 / 30.0),
        );
        assert!(got);
        // the default state had generous covariance, so the corrections
        // should pull most of the way to the bootstrap pose
        assert!((state.position() - truth_translation).norm() < 0.05);
        assert!(state.quaternion().angle_to(&truth_rotation) < 0.15);
    }
}
