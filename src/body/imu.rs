// body/imu.rs

// The body's IMU: yaw-calibrated preprocessing of orientation and
// angular-velocity reports into "canned" measurements, and the application
// of a canned measurement to a body state (predict to the report time,
// rotate into camera space, correct, with the non-finite guard).

// Dependencies
use log::debug;
use nalgebra::{UnitQuaternion, Vector3};

use crate::filter::measurement::{AbsoluteOrientationMeasurement, AngularVelocityMeasurement};
use crate::filter::process::DampedConstantVelocity;
use crate::filter::state::BodyState;
use crate::filter::{begin_correction, correct, predict, FilterState};
use crate::math::{angular_velocity_from_delta_quat, quat_exp, quat_ln};
use crate::Timestamp;

/// A self-contained IMU measurement ready to apply to a body state:
/// either an orientation or an angular velocity, each with a diagonal
/// variance. Both may be absent, in which case applying it only
/// normalizes the state.
#[derive(Debug, Clone, Default)]
pub struct CannedImuMeasurement {
    orientation: Option<(UnitQuaternion<f64>, Vector3<f64>)>,
    angular_velocity: Option<(Vector3<f64>, Vector3<f64>)>,
}

impl CannedImuMeasurement {
    pub fn set_orientation(&mut self, quat: UnitQuaternion<f64>, variance: Vector3<f64>) {
        self.orientation = Some((quat, variance));
    }

    pub fn set_angular_velocity(&mut self, velocity: Vector3<f64>, variance: Vector3<f64>) {
        self.angular_velocity = Some((velocity, variance));
    }

    pub fn orientation_valid(&self) -> bool {
        self.orientation.is_some()
    }

    pub fn angular_velocity_valid(&self) -> bool {
        self.angular_velocity.is_some()
    }

    pub fn orientation(&self) -> Option<&(UnitQuaternion<f64>, Vector3<f64>)> {
        self.orientation.as_ref()
    }

    pub fn angular_velocity(&self) -> Option<&(Vector3<f64>, Vector3<f64>)> {
        self.angular_velocity.as_ref()
    }
}

/// The (at most one) IMU integrated into a tracked body.
pub struct TrackedBodyImu {
    orientation_variance: f64,
    angular_velocity_variance: f64,
    /// Yaw correction from room calibration; reports are useless for
    /// fusion until this is known.
    yaw_correction: Option<UnitQuaternion<f64>>,
    latest_orientation: Option<UnitQuaternion<f64>>,
    last_update: Timestamp,
}

impl TrackedBodyImu {
    pub fn new(orientation_variance: f64, angular_velocity_variance: f64) -> Self {
        TrackedBodyImu {
            orientation_variance,
            angular_velocity_variance,
            yaw_correction: None,
            latest_orientation: None,
            last_update: Timestamp::default(),
        }
    }

    pub fn calibration_yaw_known(&self) -> bool {
        self.yaw_correction.is_some()
    }

    /// Installs the yaw offset recovered by room calibration, in radians
    /// about +Y.
    pub fn set_calibration_yaw(&mut self, yaw: f64) {
        self.yaw_correction = Some(UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw));
    }

    pub fn has_pose_estimate(&self) -> bool {
        self.latest_orientation.is_some()
    }

    /// Latest yaw-corrected orientation, if any report has arrived since
    /// calibration.
    pub fn pose_estimate(&self) -> Option<UnitQuaternion<f64>> {
        self.latest_orientation
    }

    pub fn last_update(&self) -> Timestamp {
        self.last_update
    }

    /// Cans an orientation report. Returns None until the calibration yaw
    /// is known (such reports belong to room calibration instead).
    pub fn preprocess_orientation(
        &mut self,
        tv: Timestamp,
        quat: &UnitQuaternion<f64>,
    ) -> Option<CannedImuMeasurement> {
        let corrected = self.yaw_correction? * quat;
        self.latest_orientation = Some(corrected);
        self.last_update = tv;

        let mut canned = CannedImuMeasurement::default();
        canned.set_orientation(
            corrected,
            Vector3::from_element(self.orientation_variance),
        );
        Some(canned)
    }

    /// Cans an angular-velocity report given as a small-rotation
    /// quaternion over `dt` seconds. None until calibrated (angular
    /// velocity is no use to room calibration).
    pub fn preprocess_angular_velocity(
        &mut self,
        tv: Timestamp,
        delta_quat: &UnitQuaternion<f64>,
        dt: f64,
    ) -> Option<CannedImuMeasurement> {
        self.yaw_correction?;
        self.last_update = tv;
        let velocity = angular_velocity_from_delta_quat(delta_quat, dt);

        let mut canned = CannedImuMeasurement::default();
        canned.set_angular_velocity(
            velocity,
            Vector3::from_element(self.angular_velocity_variance),
        );
        Some(canned)
    }
}

/// Applies a canned IMU measurement to a body state: predicts forward to
/// the report time (externalizing any accumulated rotation), then corrects
/// with whichever measurement kind is present, rotated into camera space.
///
/// `camera_from_room` is the rotation taking room-frame quantities into
/// the camera frame the filter works in.
pub fn apply_imu_to_state(
    camera_from_room: &UnitQuaternion<f64>,
    initial_time: Timestamp,
    state: &mut BodyState,
    process: &DampedConstantVelocity,
    new_time: Timestamp,
    measurement: &CannedImuMeasurement,
) {
    if new_time != initial_time {
        let dt = new_time.seconds_since(initial_time);
        predict(state, process, dt);
        state.externalize_rotation();
    }

    if let Some((quat, variance)) = measurement.orientation() {
        let camera_space = camera_from_room * quat;
        let kalman_meas = AbsoluteOrientationMeasurement::new(&camera_space, variance);
        let in_progress = begin_correction(state, &kalman_meas);
        if !in_progress.state_correction_finite {
            debug!("Non-finite state correction applying IMU orientation; discarded");
            return;
        }
        if !in_progress.finish_correction(true) {
            debug!("Non-finite error covariance applying IMU orientation; discarded");
        }
    } else if let Some((velocity, variance)) = measurement.angular_velocity() {
        // The report is a body-frame rate; conjugate it through the
        // current orientation to express it in camera space.
        let c_from_b = state.quaternion();
        let conjugated = c_from_b * quat_exp(velocity) * c_from_b.inverse();
        let camera_space = quat_ln(&conjugated);
        let kalman_meas = AngularVelocityMeasurement::new(&camera_space, variance);
        correct(state, &kalman_meas, true);
    } else {
        // Totally empty measurement: just normalize and move on.
        state.post_correct();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterState;
    use approx::assert_abs_diff_eq;

    fn process() -> DampedConstantVelocity {
        DampedConstantVelocity::new(0.9, 0.9, &[0.01, 0.01, 0.01, 0.1, 0.1, 0.1])
    }

    #[test]
    fn uncalibrated_imu_produces_no_canned_measurements() {
        let mut imu = TrackedBodyImu::new(1e-4, 1e-3);
        let q = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.2);
        assert!(imu
            .preprocess_orientation(Timestamp::from_secs(0.0), &q)
            .is_none());
        assert!(imu
            .preprocess_angular_velocity(Timestamp::from_secs(0.0), &q, 0.01)
            .is_none());
        assert!(!imu.has_pose_estimate());
    }

    #[test]
    fn yaw_correction_is_applied_to_orientation() {
        let mut imu = TrackedBodyImu::new(1e-4, 1e-3);
        imu.set_calibration_yaw(0.5);
        let raw = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), -0.5);
        let canned = imu
            .preprocess_orientation(Timestamp::from_secs(1.0), &raw)
            .unwrap();
        let (corrected, _) = canned.orientation().unwrap();
        // yaw 0.5 composed with -0.5 cancels
        assert!(corrected.angle_to(&UnitQuaternion::identity()) < 1e-12);
        assert_eq!(imu.last_update(), Timestamp::from_secs(1.0));
    }

    #[test]
    fn orientation_measurement_corrects_the_state() {
        let mut state = BodyState::default();
        let target = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.3);
        let mut canned = CannedImuMeasurement::default();
        canned.set_orientation(target, Vector3::from_element(1e-8));
        for i in 0..5 {
            apply_imu_to_state(
                &UnitQuaternion::identity(),
                Timestamp::from_secs(i as f64 * 0.01),
                &mut state,
                &process(),
                Timestamp::from_secs((i + 1) as f64 * 0.01),
                &canned,
            );
        }
        assert!(state.quaternion().angle_to(&target) < 1e-2);
        assert_eq!(state.incremental_orientation(), Vector3::zeros());
    }

    #[test]
    fn angular_velocity_measurement_fills_the_velocity_block() {
        let mut state = BodyState::default();
        let omega = Vector3::new(0.0, 1.5, 0.0);
        let mut canned = CannedImuMeasurement::default();
        canned.set_angular_velocity(omega, Vector3::from_element(1e-8));
        for _ in 0..5 {
            apply_imu_to_state(
                &UnitQuaternion::identity(),
                Timestamp::from_secs(0.0),
                &mut state,
                &process(),
                Timestamp::from_secs(0.0),
                &canned,
            );
        }
        // identity orientation: conjugation is a no-op
        assert_abs_diff_eq!(state.angular_velocity(), omega, epsilon = 1e-3);
    }

    #[test]
    fn empty_measurement_only_normalizes() {
        let mut state = BodyState::default();
        state.set_incremental_orientation(&Vector3::new(0.01, 0.0, 0.0));
        let before_quat = state.combined_quaternion();
        apply_imu_to_state(
            &UnitQuaternion::identity(),
            Timestamp::from_secs(0.0),
            &mut state,
            &process(),
            Timestamp::from_secs(0.0),
            &CannedImuMeasurement::default(),
        );
        assert_eq!(state.incremental_orientation(), Vector3::zeros());
        assert!(state.quaternion().angle_to(&before_quat) < 1e-12);
    }

    #[test]
    fn non_finite_orientation_report_is_discarded() {
        let mut state = BodyState::default();
        let before = state.state_vector();
        let mut canned = CannedImuMeasurement::default();
        canned.set_orientation(
            UnitQuaternion::identity(),
            Vector3::new(f64::NAN, 1.0, 1.0),
        );
        apply_imu_to_state(
            &UnitQuaternion::identity(),
            Timestamp::from_secs(0.0),
            &mut state,
            &process(),
            Timestamp::from_secs(0.0),
            &canned,
        );
        assert_eq!(state.state_vector(), before);
    }
}
