// system/reporting.rs

// The downstream reporting surface: one mutex-protected slot per body,
// written only by the tracker thread and read by external consumers, plus
// three synthetic slots (camera pose, raw IMU orientation, IMU rotated
// into camera space) appended after the body slots. Reports are expressed
// in the room frame once the tracker-to-room transform is installed, and
// the configured additional prediction is applied at publish time only.

// Dependencies
use std::sync::{Arc, Mutex};

use nalgebra::{Isometry3, UnitQuaternion, Vector3};

use crate::filter::state::{BodyState, BodyStateMatrix};
use crate::math::quat_exp;
use crate::Timestamp;

/// A published pose snapshot for one body.
#[derive(Debug, Clone)]
pub struct BodyReport {
    pub pose_valid: bool,
    pub timestamp: Timestamp,
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub velocity: Vector3<f64>,
    pub angular_velocity: Vector3<f64>,
    pub covariance: BodyStateMatrix,
}

impl Default for BodyReport {
    fn default() -> Self {
        BodyReport {
            pose_valid: false,
            timestamp: Timestamp::default(),
            position: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
            velocity: Vector3::zeros(),
            angular_velocity: Vector3::zeros(),
            covariance: BodyStateMatrix::identity(),
        }
    }
}

/// One slot of the reporting surface.
pub struct ReportingSlot {
    report: Mutex<BodyReport>,
    tracker_to_room: Mutex<Isometry3<f64>>,
}

impl Default for ReportingSlot {
    fn default() -> Self {
        ReportingSlot {
            report: Mutex::new(BodyReport::default()),
            tracker_to_room: Mutex::new(Isometry3::identity()),
        }
    }
}

impl ReportingSlot {
    /// Installs the transform applied to all subsequently published
    /// states.
    pub fn set_tracker_to_room(&self, xform: Isometry3<f64>) {
        *self.tracker_to_room.lock().unwrap() = xform;
    }

    /// Publishes a filter state, optionally predicted forward by
    /// `additional_prediction` seconds (constant-velocity extrapolation,
    /// reporting only).
    pub fn update_from_state(
        &self,
        timestamp: Timestamp,
        state: &BodyState,
        additional_prediction: f64,
    ) {
        let xform = *self.tracker_to_room.lock().unwrap();
        let dt = additional_prediction;

        let predicted_position = state.position() + state.velocity() * dt;
        let predicted_orientation = quat_exp(&(state.angular_velocity() * dt)) * state.quaternion();

        let rotation = xform.rotation;
        let mut report = self.report.lock().unwrap();
        report.pose_valid = true;
        report.timestamp = timestamp;
        report.position = xform
            .transform_point(&nalgebra::Point3::from(predicted_position))
            .coords;
        report.orientation = rotation * predicted_orientation;
        report.velocity = rotation * state.velocity();
        report.angular_velocity = rotation * state.angular_velocity();
        report.covariance = crate::filter::FilterState::error_covariance(state);
    }

    /// Publishes a bare pose (synthetic reports).
    pub fn update_pose(
        &self,
        timestamp: Timestamp,
        position: Vector3<f64>,
        orientation: UnitQuaternion<f64>,
    ) {
        let mut report = self.report.lock().unwrap();
        report.pose_valid = true;
        report.timestamp = timestamp;
        report.position = position;
        report.orientation = orientation;
        report.velocity = Vector3::zeros();
        report.angular_velocity = Vector3::zeros();
    }

    pub fn mark_invalid(&self) {
        self.report.lock().unwrap().pose_valid = false;
    }

    /// Reader side: a coherent copy of the latest report.
    pub fn get(&self) -> BodyReport {
        self.report.lock().unwrap().clone()
    }
}

/// The shared reporting surface: `num_bodies` body slots followed by the
/// camera-pose slot and the two IMU debugging slots.
pub type BodyReportingVector = Arc<Vec<ReportingSlot>>;

/// Index of the camera-pose synthetic report.
pub fn camera_pose_slot(num_bodies: usize) -> usize {
    num_bodies
}

/// Index of the room-aligned IMU orientation report.
pub fn imu_slot(num_bodies: usize) -> usize {
    num_bodies + 1
}

/// Index of the camera-space IMU orientation report.
pub fn imu_in_camera_slot(num_bodies: usize) -> usize {
    num_bodies + 2
}

pub fn make_reporting_vector(num_bodies: usize) -> BodyReportingVector {
    let mut slots = Vec::with_capacity(num_bodies + 3);
    for _ in 0..num_bodies + 3 {
        slots.push(ReportingSlot::default());
    }
    Arc::new(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Translation3;

    #[test]
    fn vector_has_three_synthetic_slots() {
        let reporting = make_reporting_vector(2);
        assert_eq!(reporting.len(), 5);
        assert_eq!(camera_pose_slot(2), 2);
        assert_eq!(imu_in_camera_slot(2), 4);
    }

    #[test]
    fn publish_applies_additional_prediction() {
        let slot = ReportingSlot::default();
        let mut state = BodyState::default();
        state.set_position(&Vector3::new(1.0, 0.0, 0.0));
        state.set_velocity(&Vector3::new(0.5, 0.0, 0.0));
        slot.update_from_state(Timestamp::from_secs(1.0), &state, 0.1);
        let report = slot.get();
        assert!(report.pose_valid);
        assert_abs_diff_eq!(report.position.x, 1.05, epsilon = 1e-12);
        // internal state untouched
        assert_eq!(state.position().x, 1.0);
    }

    #[test]
    fn room_transform_is_applied_at_publish() {
        let slot = ReportingSlot::default();
        let xform = Isometry3::from_parts(
            Translation3::new(0.0, 1.2, -0.5),
            UnitQuaternion::from_axis_angle(&Vector3::y_axis(), std::f64::consts::FRAC_PI_2),
        );
        slot.set_tracker_to_room(xform);
        let mut state = BodyState::default();
        state.set_position(&Vector3::new(0.0, 0.0, 1.0));
        slot.update_from_state(Timestamp::from_secs(0.0), &state, 0.0);
        let report = slot.get();
        // +Z rotates to +X under a +90 degree yaw, then the offset applies
        assert_abs_diff_eq!(
            report.position,
            Vector3::new(1.0, 1.2, -0.5),
            epsilon = 1e-12
        );
    }

    #[test]
    fn invalid_mark_clears_validity_only() {
        let slot = ReportingSlot::default();
        let state = BodyState::default();
        slot.update_from_state(Timestamp::from_secs(0.0), &state, 0.0);
        slot.mark_invalid();
        assert!(!slot.get().pose_valid);
    }
}
