// system/calibration.rs

// Room calibration: the startup procedure that learns the pose of the
// camera in the room and the yaw offset of the IMU, by correlating the
// IMU's orientation with RANSAC video poses while the user holds the
// device steady in front of the camera. The rotation estimate is a proper
// average on the manifold: the log of imu-versus-video rotations is
// accumulated over the steady frames and exponentiated at the end.

// Dependencies
use log::{info, warn};
use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

use crate::body::BodyId;
use crate::math::filters::{OneEuroParams, OneEuroQuatFilter, OneEuroVectorFilter};
use crate::math::{extract_yaw, flip_quat_sign_to_match, quat_exp, quat_ln};
use crate::Timestamp;

/// Velocity ceilings (filtered m/s and rad/s) below which the device
/// counts as held still. RANSAC poses are noisy, hence the loose bounds.
const LINEAR_VELOCITY_CUTOFF: f64 = 0.75;
const ANGULAR_VELOCITY_CUTOFF: f64 = 0.75;
/// Number of consecutive steady video frames required.
const REQUIRED_SAMPLES: usize = 15;
/// Distance from the camera (m) inside which beacons are seen well enough
/// for a good start; beyond it the user is asked to move closer.
const NEAR_MESSAGE_CUTOFF: f64 = 0.4;

/// User-guidance progression during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionState {
    Uninstructed,
    ToldToMoveCloser,
    ToldDistanceIsGood,
}

/// What calibration hands back to the tracking system once finished.
#[derive(Debug, Clone)]
pub struct CalibrationOutput {
    /// Transform from camera space to room space.
    pub camera_pose: Isometry3<f64>,
    /// The body whose IMU was used.
    pub imu_body: BodyId,
    /// Yaw correction for that IMU, radians about +Y.
    pub imu_yaw: f64,
}

pub struct RoomCalibration {
    supplied_camera_position: Vector3<f64>,
    camera_is_forward: bool,

    position_filter: OneEuroVectorFilter,
    orientation_filter: OneEuroQuatFilter,
    last_video_data: Option<Timestamp>,
    linear_velocity: f64,
    angular_velocity: f64,

    steady_video_reports: usize,
    rtc_ln_accum: Vector3<f64>,

    imu_body: Option<BodyId>,
    imu_orientation: UnitQuaternion<f64>,
    video_target: Option<(BodyId, u8)>,

    instruction_state: InstructionState,
    complete: bool,
}

impl RoomCalibration {
    pub fn new(camera_position: Vector3<f64>, camera_is_forward: bool) -> Self {
        RoomCalibration {
            supplied_camera_position: camera_position,
            camera_is_forward,
            position_filter: OneEuroVectorFilter::new(OneEuroParams::default()),
            orientation_filter: OneEuroQuatFilter::new(OneEuroParams::default()),
            last_video_data: None,
            linear_velocity: 0.0,
            angular_velocity: 0.0,
            steady_video_reports: 0,
            rtc_ln_accum: Vector3::zeros(),
            imu_body: None,
            imu_orientation: UnitQuaternion::identity(),
            video_target: None,
            instruction_state: InstructionState::Uninstructed,
            complete: false,
        }
    }

    pub fn calibration_complete(&self) -> bool {
        self.complete
    }

    pub fn instruction_state(&self) -> InstructionState {
        self.instruction_state
    }

    fn have_imu_data(&self) -> bool {
        self.imu_body.is_some()
    }

    fn have_video_data(&self) -> bool {
        self.video_target.is_some()
    }

    /// Whether calibration wants video poses from this target. Only one
    /// target ever plays: the first one seen on the IMU's own body.
    pub fn want_video_data(&self, target: (BodyId, u8)) -> bool {
        if !self.have_imu_data() {
            // video is useless until there is an IMU to correlate against
            return false;
        }
        match self.video_target {
            None => Some(target.0) == self.imu_body,
            Some(chosen) => chosen == target,
        }
    }

    /// Feeds a raw (uncalibrated) video pose of the target in camera
    /// space.
    pub fn process_video_data(
        &mut self,
        target: (BodyId, u8),
        timestamp: Timestamp,
        xlate: &Vector3<f64>,
        quat: &UnitQuaternion<f64>,
    ) {
        if self.complete || !self.want_video_data(target) {
            return;
        }
        if !xlate.iter().all(|v| v.is_finite())
            || !quat.coords.iter().all(|v| v.is_finite())
        {
            return;
        }
        let first_data = !self.have_video_data();
        if first_data {
            info!("Got first video report from target {}:{}", target.0 .0, target.1);
        }
        self.video_target = Some(target);

        let dt = match self.last_video_data {
            Some(last) => {
                let dt = timestamp.seconds_since(last);
                if dt <= 0.0 {
                    1.0
                } else {
                    dt
                }
            }
            None => 1.0,
        };
        self.last_video_data = Some(timestamp);

        let prev_position = self.position_filter.value();
        let prev_orientation = self.orientation_filter.value();

        // Pre-filter the camera data; RANSAC poses are noisy.
        let filtered_position = self.position_filter.filter(dt, xlate);
        let filtered_orientation = self.orientation_filter.filter(dt, quat);

        // rTc: camera in IMU-aligned (room, modulo yaw) space.
        let rtc = self.imu_orientation * filtered_orientation.inverse();
        let rtc_ln = quat_ln(&rtc);

        if !first_data {
            // Velocities of the filtered output, not the raw input.
            if let (Some(prev_p), Some(prev_q)) = (prev_position, prev_orientation) {
                self.linear_velocity = (filtered_position - prev_p).norm() / dt;
                self.angular_velocity =
                    quat_ln(&(filtered_orientation * prev_q.inverse())).norm() / dt;
            }
        }

        if self.linear_velocity < LINEAR_VELOCITY_CUTOFF
            && self.angular_velocity < ANGULAR_VELOCITY_CUTOFF
        {
            if self.steady_video_reports == 0 {
                info!("Hold still, performing room calibration");
            }
            self.rtc_ln_accum += rtc_ln;
            self.steady_video_reports += 1;
        } else {
            self.handle_excess_velocity(xlate.z);
        }
    }

    fn handle_excess_velocity(&mut self, z_translation: f64) {
        if self.steady_video_reports > 0 {
            info!(
                "Restarting room calibration: linear velocity {:.3}, angular velocity {:.3}",
                self.linear_velocity, self.angular_velocity
            );
        }
        self.steady_video_reports = 0;
        self.rtc_ln_accum = Vector3::zeros();

        match self.instruction_state {
            InstructionState::Uninstructed => {
                if z_translation > NEAR_MESSAGE_CUTOFF {
                    info!(
                        "For best results, hold the device still closer than {} m \
                         from the camera, then rotate slowly in all directions",
                        NEAR_MESSAGE_CUTOFF
                    );
                    self.instruction_state = InstructionState::ToldToMoveCloser;
                }
            }
            InstructionState::ToldToMoveCloser => {
                if z_translation < 0.9 * NEAR_MESSAGE_CUTOFF {
                    info!(
                        "That distance looks good; rotate the device gently until \
                         calibration completes"
                    );
                    self.instruction_state = InstructionState::ToldDistanceIsGood;
                }
            }
            InstructionState::ToldDistanceIsGood => {}
        }
    }

    /// Feeds an IMU orientation report. The first IMU (on a body that can
    /// be seen by video) wins the calibration role.
    pub fn process_imu_data(
        &mut self,
        body: BodyId,
        body_has_target: bool,
        _timestamp: Timestamp,
        quat: &UnitQuaternion<f64>,
    ) {
        if self.complete {
            return;
        }
        if let Some(chosen) = self.imu_body {
            if chosen != body {
                // Already correlating against a different IMU.
                return;
            }
        }
        if !quat.coords.iter().all(|v| v.is_finite()) {
            warn!("Non-finite IMU orientation during calibration");
            return;
        }

        if self.imu_body.is_none() {
            if !body_has_target {
                // An IMU on a body with no video target cannot be
                // correlated.
                return;
            }
            info!("Got first IMU report from body {}", body.0);
            self.imu_body = Some(body);
            // Constrain w to be positive for a stable starting hemisphere.
            self.imu_orientation = if quat.w >= 0.0 {
                *quat
            } else {
                UnitQuaternion::new_unchecked(-quat.into_inner())
            };
            return;
        }

        // Keep the sequence hemisphere-continuous so the average of logs
        // stays meaningful.
        self.imu_orientation = flip_quat_sign_to_match(&self.imu_orientation, quat);
    }

    /// Checks for completion; returns the derived transforms exactly once.
    pub fn post_calibration_update(&mut self) -> Option<CalibrationOutput> {
        if self.complete || self.steady_video_reports < REQUIRED_SAMPLES {
            return None;
        }
        let imu_body = self.imu_body?;
        info!("Room calibration process complete");

        // Average of logs over the steady window, back onto the manifold.
        let mut irc = quat_exp(&(self.rtc_ln_accum / self.steady_video_reports as f64));

        let imu_yaw = if self.camera_is_forward {
            // Remove the yaw so the camera looks down the room's Z axis;
            // the IMU learns the removed yaw so it can undo it.
            let yaw = extract_yaw(&irc);
            irc = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), -yaw) * irc;
            -yaw
        } else {
            0.0
        };

        let camera_pose = Isometry3::from_parts(
            Translation3::from(self.supplied_camera_position),
            irc,
        );
        info!(
            "Camera pose: translation {:?}, rotation angle {:.4} rad",
            camera_pose.translation.vector,
            irc.angle()
        );

        self.complete = true;
        Some(CalibrationOutput {
            camera_pose,
            imu_body,
            imu_yaw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ts(s: f64) -> Timestamp {
        Timestamp::from_secs(s)
    }

    fn calibration() -> RoomCalibration {
        RoomCalibration::new(Vector3::new(0.0, 1.2, -0.5), false)
    }

    #[test]
    fn video_is_unwanted_until_imu_arrives() {
        let mut calib = calibration();
        assert!(!calib.want_video_data((BodyId(0), 0)));
        calib.process_imu_data(BodyId(0), true, ts(0.0), &UnitQuaternion::identity());
        assert!(calib.want_video_data((BodyId(0), 0)));
        // a target on another body is never wanted
        assert!(!calib.want_video_data((BodyId(1), 0)));
    }

    #[test]
    fn steady_identical_poses_converge_to_relative_rotation() {
        let mut calib = calibration();
        let q_imu = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.4);
        let q_video = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), -0.2);
        calib.process_imu_data(BodyId(0), true, ts(0.0), &q_imu);

        let xlate = Vector3::new(0.0, 0.0, 0.35);
        let mut output = None;
        for i in 0..30 {
            calib.process_video_data((BodyId(0), 0), ts(i as f64 / 30.0), &xlate, &q_video);
            if let Some(out) = calib.post_calibration_update() {
                output = Some(out);
                break;
            }
        }
        let output = output.expect("calibration never completed");
        assert!(calib.calibration_complete());
        let expected = q_imu * q_video.inverse();
        let got = output.camera_pose.rotation;
        // modulo short-arc sign
        assert!(got.angle_to(&expected) < 1e-6);
        assert_abs_diff_eq!(
            output.camera_pose.translation.vector,
            Vector3::new(0.0, 1.2, -0.5),
            epsilon = 1e-12
        );
        assert_eq!(output.imu_yaw, 0.0);
    }

    #[test]
    fn camera_forward_extracts_yaw_into_imu_offset() {
        let mut calib = RoomCalibration::new(Vector3::new(0.0, 1.2, -0.5), true);
        let yaw = 0.3;
        let q_imu = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw);
        calib.process_imu_data(BodyId(0), true, ts(0.0), &q_imu);
        let xlate = Vector3::new(0.0, 0.0, 0.3);
        let mut output = None;
        for i in 0..30 {
            calib.process_video_data(
                (BodyId(0), 0),
                ts(i as f64 / 30.0),
                &xlate,
                &UnitQuaternion::identity(),
            );
            if let Some(out) = calib.post_calibration_update() {
                output = Some(out);
                break;
            }
        }
        let output = output.expect("calibration never completed");
        // the camera rotation ends up yaw-free...
        assert_abs_diff_eq!(extract_yaw(&output.camera_pose.rotation), 0.0, epsilon = 1e-6);
        // ...and the IMU inherits the removed yaw
        assert_abs_diff_eq!(output.imu_yaw, -yaw, epsilon = 1e-6);
    }

    #[test]
    fn movement_resets_the_steady_count() {
        let mut calib = calibration();
        calib.process_imu_data(BodyId(0), true, ts(0.0), &UnitQuaternion::identity());
        let q = UnitQuaternion::identity();
        // a few steady frames
        for i in 0..5 {
            calib.process_video_data(
                (BodyId(0), 0),
                ts(i as f64 / 30.0),
                &Vector3::new(0.0, 0.0, 0.3),
                &q,
            );
        }
        // a huge jump: filtered velocity blows past the cutoff
        calib.process_video_data(
            (BodyId(0), 0),
            ts(5.0 / 30.0),
            &Vector3::new(1.5, 0.0, 0.3),
            &q,
        );
        assert!(calib.post_calibration_update().is_none());
        // needs the full 15 again afterwards; 10 more is not enough
        for i in 6..16 {
            calib.process_video_data(
                (BodyId(0), 0),
                ts(i as f64 / 30.0),
                &Vector3::new(1.5, 0.0, 0.3),
                &q,
            );
        }
        assert!(!calib.calibration_complete());
    }

    #[test]
    fn instruction_state_walks_through_guidance() {
        let mut calib = calibration();
        calib.process_imu_data(BodyId(0), true, ts(0.0), &UnitQuaternion::identity());
        assert_eq!(calib.instruction_state(), InstructionState::Uninstructed);

        // moving fast while far away: told to move closer
        calib.process_video_data(
            (BodyId(0), 0),
            ts(0.0),
            &Vector3::new(0.0, 0.0, 1.0),
            &UnitQuaternion::identity(),
        );
        calib.process_video_data(
            (BodyId(0), 0),
            ts(1.0 / 30.0),
            &Vector3::new(0.5, 0.0, 1.0),
            &UnitQuaternion::identity(),
        );
        assert_eq!(calib.instruction_state(), InstructionState::ToldToMoveCloser);

        // moving fast but close now: distance is good
        calib.process_video_data(
            (BodyId(0), 0),
            ts(2.0 / 30.0),
            &Vector3::new(0.0, 0.0, 0.3),
            &UnitQuaternion::identity(),
        );
        assert_eq!(calib.instruction_state(), InstructionState::ToldDistanceIsGood);
    }

    #[test]
    fn non_finite_video_poses_are_ignored() {
        let mut calib = calibration();
        calib.process_imu_data(BodyId(0), true, ts(0.0), &UnitQuaternion::identity());
        calib.process_video_data(
            (BodyId(0), 0),
            ts(0.0),
            &Vector3::new(f64::NAN, 0.0, 0.3),
            &UnitQuaternion::identity(),
        );
        assert!(!calib.calibration_complete());
        assert!(calib.post_calibration_update().is_none());
    }
}
