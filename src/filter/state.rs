// filter/state.rs

// The two concrete filter states: the 12-dimensional body pose state with
// its externalized rotation quaternion, and the 3-dimensional beacon
// position state used for auto-calibration.
//
// Body state vector layout (12 scalars, in order): position (3),
// incremental rotation in tangent space (3), linear velocity (3), angular
// velocity (3). The unit quaternion is carried OUTSIDE the vector; the
// incremental-rotation block accumulates small rotations between
// corrections and is folded into the external quaternion by post_correct,
// which re-zeros the block ("reset to origin of the tangent chart").

// Dependencies
use nalgebra::{Matrix3, SMatrix, SVector, UnitQuaternion, Vector3};

use super::FilterState;
use crate::math::quat_exp;

pub const BODY_STATE_DIM: usize = 12;
pub type BodyStateVector = SVector<f64, BODY_STATE_DIM>;
pub type BodyStateMatrix = SMatrix<f64, BODY_STATE_DIM, BODY_STATE_DIM>;

/// State transition matrix for a constant-velocity pose model: identity
/// plus `dt * I` coupling the velocity blocks into the pose blocks.
pub fn state_transition_matrix(dt: f64) -> BodyStateMatrix {
    let mut a = BodyStateMatrix::identity();
    for i in 0..6 {
        a[(i, i + 6)] = dt;
    }
    a
}

/// 12-D pose state with externalized rotation.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyState {
    state: BodyStateVector,
    error_covariance: BodyStateMatrix,
    /// Externally-maintained orientation; unit within normalization
    /// tolerance at all times.
    orientation: UnitQuaternion<f64>,
}

impl Default for BodyState {
    fn default() -> Self {
        BodyState {
            state: BodyStateVector::zeros(),
            error_covariance: BodyStateMatrix::identity(),
            orientation: UnitQuaternion::identity(),
        }
    }
}

impl BodyState {
    /// Position block (elements 0..3).
    pub fn position(&self) -> Vector3<f64> {
        self.state.fixed_rows::<3>(0).into_owned()
    }

    pub fn set_position(&mut self, p: &Vector3<f64>) {
        self.state.fixed_rows_mut::<3>(0).copy_from(p);
    }

    /// Incremental tangent-space rotation block (elements 3..6). Zero
    /// immediately after `post_correct`.
    pub fn incremental_orientation(&self) -> Vector3<f64> {
        self.state.fixed_rows::<3>(3).into_owned()
    }

    pub fn set_incremental_orientation(&mut self, v: &Vector3<f64>) {
        self.state.fixed_rows_mut::<3>(3).copy_from(v);
    }

    /// Linear velocity block (elements 6..9).
    pub fn velocity(&self) -> Vector3<f64> {
        self.state.fixed_rows::<3>(6).into_owned()
    }

    pub fn set_velocity(&mut self, v: &Vector3<f64>) {
        self.state.fixed_rows_mut::<3>(6).copy_from(v);
    }

    /// Angular velocity block (elements 9..12).
    pub fn angular_velocity(&self) -> Vector3<f64> {
        self.state.fixed_rows::<3>(9).into_owned()
    }

    pub fn set_angular_velocity(&mut self, v: &Vector3<f64>) {
        self.state.fixed_rows_mut::<3>(9).copy_from(v);
    }

    /// The external quaternion alone, without any pending incremental
    /// rotation.
    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        self.orientation
    }

    /// Intended for startup and pose resets.
    pub fn set_quaternion(&mut self, q: &UnitQuaternion<f64>) {
        self.orientation = *q;
    }

    /// The effective orientation: pending incremental rotation composed
    /// onto the external quaternion.
    pub fn combined_quaternion(&self) -> UnitQuaternion<f64> {
        quat_exp(&self.incremental_orientation()) * self.orientation
    }

    /// Folds the incremental rotation into the external quaternion and
    /// zeros the incremental block.
    pub fn externalize_rotation(&mut self) {
        self.orientation = self.combined_quaternion();
        self.set_incremental_orientation(&Vector3::zeros());
    }

    /// Advances pose blocks by their velocities: `x += v*dt`, `phi += w*dt`.
    pub fn apply_velocity(&mut self, dt: f64) {
        let p = self.position() + self.velocity() * dt;
        self.set_position(&p);
        let inc = self.incremental_orientation() + self.angular_velocity() * dt;
        self.set_incremental_orientation(&inc);
    }

    /// Attenuates the two velocity blocks by independent factors.
    pub fn attenuate_velocities(&mut self, linear: f64, angular: f64) {
        let v = self.velocity() * linear;
        self.set_velocity(&v);
        let w = self.angular_velocity() * angular;
        self.set_angular_velocity(&w);
    }
}

impl FilterState<BODY_STATE_DIM> for BodyState {
    fn state_vector(&self) -> BodyStateVector {
        self.state
    }

    fn set_state_vector(&mut self, x: &BodyStateVector) {
        self.state = *x;
    }

    fn error_covariance(&self) -> BodyStateMatrix {
        self.error_covariance
    }

    fn set_error_covariance(&mut self, p: &BodyStateMatrix) {
        self.error_covariance = *p;
    }

    fn post_correct(&mut self) {
        self.externalize_rotation();
    }
}

/// 3-D pure vector state: a beacon's auto-calibrated position in the
/// target frame, with its own 3x3 error covariance.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconState {
    state: Vector3<f64>,
    error_covariance: Matrix3<f64>,
}

impl BeaconState {
    pub fn new(position: Vector3<f64>, covariance: Matrix3<f64>) -> Self {
        BeaconState {
            state: position,
            error_covariance: covariance,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        self.state
    }
}

impl FilterState<3> for BeaconState {
    fn state_vector(&self) -> Vector3<f64> {
        self.state
    }

    fn set_state_vector(&mut self, x: &Vector3<f64>) {
        self.state = *x;
    }

    fn error_covariance(&self) -> Matrix3<f64> {
        self.error_covariance
    }

    fn set_error_covariance(&mut self, p: &Matrix3<f64>) {
        self.error_covariance = *p;
    }

    fn post_correct(&mut self) {}
}
