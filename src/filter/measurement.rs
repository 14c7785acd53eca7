// filter/measurement.rs

// Measurement models against the 12-D body state: absolute orientation (in
// tangent space, with the short-arc sign choice), absolute position, and
// angular velocity. Each keeps its measured value mutable through
// set_measurement so one instance can be reused across reports.

// Dependencies
use nalgebra::{Matrix3, SMatrix, UnitQuaternion, Vector3};

use super::state::{BodyState, BODY_STATE_DIM};
use super::MeasurementModel;
use crate::math::quat_ln;

type Jacobian3x12 = SMatrix<f64, 3, BODY_STATE_DIM>;

/// Absolute orientation measurement.
///
/// The residual lives in the tangent space: `r = ln(z * prediction^-1)`,
/// with the sign of the quaternion chosen by the dot product against the
/// prediction so the log always takes the short arc. Skipping that choice
/// produces periodic sign flips in the corrected state.
#[derive(Debug, Clone)]
pub struct AbsoluteOrientationMeasurement {
    quat: UnitQuaternion<f64>,
    covariance: Matrix3<f64>,
}

impl AbsoluteOrientationMeasurement {
    /// `variance` is the diagonal tangent-space (Euler-like) variance.
    pub fn new(quat: &UnitQuaternion<f64>, variance: &Vector3<f64>) -> Self {
        AbsoluteOrientationMeasurement {
            quat: *quat,
            covariance: Matrix3::from_diagonal(variance),
        }
    }

    pub fn set_measurement(&mut self, quat: &UnitQuaternion<f64>) {
        self.quat = *quat;
    }
}

impl MeasurementModel<BodyState, BODY_STATE_DIM, 3> for AbsoluteOrientationMeasurement {
    fn jacobian(&self, _state: &BodyState) -> Jacobian3x12 {
        let mut h = Jacobian3x12::zeros();
        h.fixed_view_mut::<3, 3>(0, 3).copy_from(&Matrix3::identity());
        h
    }

    fn residual(&self, state: &BodyState) -> Vector3<f64> {
        let prediction = state.combined_quaternion();
        let residual = self.quat * prediction.inverse();
        // Pick whichever of the two equivalent quaternions shares a
        // hemisphere with the prediction before taking the log.
        let dot = prediction.coords.dot(&residual.coords);
        if dot >= 0.0 {
            quat_ln(&residual)
        } else {
            quat_ln(&UnitQuaternion::new_unchecked(-residual.into_inner()))
        }
    }

    fn covariance(&self, _state: &BodyState) -> Matrix3<f64> {
        self.covariance
    }
}

/// Absolute position measurement: linear in the position block.
#[derive(Debug, Clone)]
pub struct AbsolutePositionMeasurement {
    pos: Vector3<f64>,
    covariance: Matrix3<f64>,
}

impl AbsolutePositionMeasurement {
    pub fn new(pos: &Vector3<f64>, variance: &Vector3<f64>) -> Self {
        AbsolutePositionMeasurement {
            pos: *pos,
            covariance: Matrix3::from_diagonal(variance),
        }
    }

    pub fn set_measurement(&mut self, pos: &Vector3<f64>) {
        self.pos = *pos;
    }
}

impl MeasurementModel<BodyState, BODY_STATE_DIM, 3> for AbsolutePositionMeasurement {
    fn jacobian(&self, _state: &BodyState) -> Jacobian3x12 {
        let mut h = Jacobian3x12::zeros();
        h.fixed_view_mut::<3, 3>(0, 0).copy_from(&Matrix3::identity());
        h
    }

    fn residual(&self, state: &BodyState) -> Vector3<f64> {
        self.pos - state.position()
    }

    fn covariance(&self, _state: &BodyState) -> Matrix3<f64> {
        self.covariance
    }
}

/// Angular velocity measurement: linear in the angular-velocity block.
#[derive(Debug, Clone)]
pub struct AngularVelocityMeasurement {
    vel: Vector3<f64>,
    covariance: Matrix3<f64>,
}

impl AngularVelocityMeasurement {
    pub fn new(vel: &Vector3<f64>, variance: &Vector3<f64>) -> Self {
        AngularVelocityMeasurement {
            vel: *vel,
            covariance: Matrix3::from_diagonal(variance),
        }
    }

    pub fn set_measurement(&mut self, vel: &Vector3<f64>) {
        self.vel = *vel;
    }
}

impl MeasurementModel<BodyState, BODY_STATE_DIM, 3> for AngularVelocityMeasurement {
    fn jacobian(&self, _state: &BodyState) -> Jacobian3x12 {
        let mut h = Jacobian3x12::zeros();
        h.fixed_view_mut::<3, 3>(0, 9).copy_from(&Matrix3::identity());
        h
    }

    fn residual(&self, state: &BodyState) -> Vector3<f64> {
        self.vel - state.angular_velocity()
    }

    fn covariance(&self, _state: &BodyState) -> Matrix3<f64> {
        self.covariance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::correct;
    use approx::assert_abs_diff_eq;

    #[test]
    fn orientation_residual_is_zero_at_the_prediction() {
        let q = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.4);
        let mut state = BodyState::default();
        state.set_quaternion(&q);
        let meas = AbsoluteOrientationMeasurement::new(&q, &Vector3::from_element(0.01));
        assert_abs_diff_eq!(meas.residual(&state), Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn orientation_residual_takes_the_short_arc() {
        let mut state = BodyState::default();
        state.set_quaternion(&UnitQuaternion::identity());
        // A measurement presented with the "far" quaternion sign must still
        // produce a small-angle residual.
        let z = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 0.1);
        let flipped = UnitQuaternion::new_unchecked(-z.into_inner());
        let meas = AbsoluteOrientationMeasurement::new(&flipped, &Vector3::from_element(0.01));
        let r = meas.residual(&state);
        assert!(r.norm() < 0.2, "expected short-arc residual, got {}", r.norm());
    }

    #[test]
    fn orientation_correction_moves_external_quaternion() {
        let mut state = BodyState::default();
        let target = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.3);
        let meas = AbsoluteOrientationMeasurement::new(&target, &Vector3::from_element(1e-6));
        for _ in 0..6 {
            assert!(correct(&mut state, &meas, true));
        }
        assert!(state.quaternion().angle_to(&target) < 1e-3);
        // the tangent block must be re-zeroed every time
        assert_eq!(state.incremental_orientation(), Vector3::zeros());
    }

    #[test]
    fn position_residual_is_linear() {
        let mut state = BodyState::default();
        state.set_position(&Vector3::new(1.0, 2.0, 3.0));
        let meas = AbsolutePositionMeasurement::new(
            &Vector3::new(1.5, 2.0, 3.0),
            &Vector3::from_element(0.01),
        );
        assert_abs_diff_eq!(
            meas.residual(&state),
            Vector3::new(0.5, 0.0, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn angular_velocity_correction_converges() {
        let mut state = BodyState::default();
        let meas = AngularVelocityMeasurement::new(
            &Vector3::new(0.0, 1.0, 0.0),
            &Vector3::from_element(1e-8),
        );
        for _ in 0..4 {
            assert!(correct(&mut state, &meas, true));
        }
        assert_abs_diff_eq!(state.angular_velocity().y, 1.0, epsilon = 1e-3);
    }
}
