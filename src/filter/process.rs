// filter/process.rs

// Process models: the separately-damped constant-velocity model driving the
// body pose state, and the constant process used for beacon
// auto-calibration (prediction only inflates uncertainty).

// Dependencies
use nalgebra::{Matrix3, SVector, Vector3};

use super::state::{state_transition_matrix, BeaconState, BodyState, BodyStateMatrix};
use super::{predict_error_covariance, ProcessModel};
use crate::math::compute_attenuation;

/// Constant-velocity pose process with independent exponential damping of
/// the linear and angular velocity blocks.
///
/// The damping coefficients are read as "fraction of velocity remaining
/// after one second" and must lie in (0, 1); out-of-range values are
/// ignored by the setter.
#[derive(Debug, Clone)]
pub struct DampedConstantVelocity {
    /// Autocorrelation of the noise sources: position (3), orientation (3).
    mu: SVector<f64, 6>,
    position_damping: f64,
    orientation_damping: f64,
}

impl DampedConstantVelocity {
    pub fn new(position_damping: f64, orientation_damping: f64, noise: &[f64; 6]) -> Self {
        let mut model = DampedConstantVelocity {
            mu: SVector::from_column_slice(noise),
            position_damping: 0.2,
            orientation_damping: 0.01,
        };
        model.set_damping(position_damping, orientation_damping);
        model
    }

    /// Sets the damping coefficients; each must be in (0, 1) to take
    /// effect.
    pub fn set_damping(&mut self, position: f64, orientation: f64) {
        if position > 0.0 && position < 1.0 {
            self.position_damping = position;
        }
        if orientation > 0.0 && orientation < 1.0 {
            self.orientation_damping = orientation;
        }
    }

    pub fn set_noise_autocorrelation(&mut self, noise: &[f64; 6]) {
        self.mu = SVector::from_column_slice(noise);
    }

    /// The process-model Jacobian A(dt), with the velocity blocks
    /// pre-attenuated by `damping^dt`.
    pub fn transition_matrix(&self, dt: f64) -> BodyStateMatrix {
        let mut a = state_transition_matrix(dt);
        let linear = compute_attenuation(self.position_damping, dt);
        let angular = compute_attenuation(self.orientation_damping, dt);
        for i in 6..9 {
            a[(i, i)] = linear;
        }
        for i in 9..12 {
            a[(i, i)] = angular;
        }
        a
    }

    /// Sampled process noise Q(dt): for each of the six pose scalars and
    /// its derivative, the canonical [dt^3/3, dt^2/2; dt^2/2, dt] * mu_i
    /// structure.
    pub fn sampled_process_noise(&self, dt: f64) -> BodyStateMatrix {
        let mut q = BodyStateMatrix::zeros();
        let dt3 = dt * dt * dt / 3.0;
        let dt2 = dt * dt / 2.0;
        for i in 0..6 {
            let j = i + 6;
            let mu = self.mu[i];
            q[(i, i)] = mu * dt3;
            q[(i, j)] = mu * dt2;
            q[(j, i)] = mu * dt2;
            q[(j, j)] = mu * dt;
        }
        q
    }
}

impl ProcessModel<12> for DampedConstantVelocity {
    type State = BodyState;

    fn predict_state(&self, state: &mut BodyState, dt: f64) {
        use super::FilterState;
        let a = self.transition_matrix(dt);
        let q = self.sampled_process_noise(dt);
        let p_minus = predict_error_covariance(&state.error_covariance(), &a, &q);

        state.apply_velocity(dt);
        state.attenuate_velocities(
            compute_attenuation(self.position_damping, dt),
            compute_attenuation(self.orientation_damping, dt),
        );
        state.set_error_covariance(&p_minus);
    }
}

/// A process for a "constant" quantity: prediction does nothing but grow
/// the uncertainty linearly with elapsed time. Used for beacon
/// auto-calibration.
#[derive(Debug, Clone)]
pub struct ConstantProcess {
    noise: Matrix3<f64>,
}

impl Default for ConstantProcess {
    fn default() -> Self {
        ConstantProcess {
            noise: Matrix3::zeros(),
        }
    }
}

impl ConstantProcess {
    pub fn new(noise_autocorrelation: f64) -> Self {
        let mut p = ConstantProcess::default();
        p.set_noise_autocorrelation(noise_autocorrelation);
        p
    }

    pub fn set_noise_autocorrelation(&mut self, noise: f64) {
        self.noise = Matrix3::from_diagonal(&Vector3::from_element(noise));
    }
}

impl ProcessModel<3> for ConstantProcess {
    type State = BeaconState;

    fn predict_state(&self, state: &mut BeaconState, dt: f64) {
        // Identity transition, so A*P*A' + Q collapses to a sum.
        use super::FilterState;
        let p_minus = state.error_covariance() + self.noise * dt;
        state.set_error_covariance(&p_minus);
    }
}
