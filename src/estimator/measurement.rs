// estimator/measurement.rs

// The projected-image-point measurement used by the SCAAT estimator: a 2-D
// pixel observation of one beacon, measured against the augmented
// (body + beacon) 15-dimensional state. The Jacobian covers the body's
// position and incremental-rotation blocks and the beacon's position,
// derived by the chain rule through the quaternion Jacobian of the
// exponential map.

// Dependencies
use nalgebra::{Matrix2, Matrix3, SMatrix, UnitQuaternion, Vector2, Vector3};

use crate::filter::augmented::{AugmentedState, AUGMENTED_DIM};
use crate::filter::{FilterState, MeasurementModel};
use crate::math::{quat_exp_jacobian, skew_symmetric};
use crate::vision::camera::CameraIntrinsics;

/// The slice of camera intrinsics the measurement model needs. Points fed
/// to it are undistorted, so only the pinhole part applies.
#[derive(Debug, Clone, Copy)]
pub struct CameraModel {
    pub focal_lengths: Vector2<f64>,
    pub principal_point: Vector2<f64>,
}

impl From<&CameraIntrinsics> for CameraModel {
    fn from(intrinsics: &CameraIntrinsics) -> Self {
        CameraModel {
            focal_lengths: intrinsics.focal_lengths(),
            principal_point: intrinsics.principal_point(),
        }
    }
}

/// Jacobian of the rotation `r(q, u) = q * u * q^-1` with respect to the
/// quaternion coefficients, columns ordered (x, y, z, w) to match the
/// exponential-map Jacobian's rows.
fn rotation_by_quat_jacobian(q: &UnitQuaternion<f64>, u: &Vector3<f64>) -> SMatrix<f64, 3, 4> {
    let w = q.w;
    let v = q.imag();
    let d_dv: Matrix3<f64> = (v * u.transpose() + Matrix3::identity() * v.dot(u)
        - u * v.transpose() * 2.0
        - skew_symmetric(u) * w)
        * 2.0;
    let d_dw = v.cross(u) * 2.0;
    let mut ret = SMatrix::<f64, 3, 4>::zeros();
    ret.fixed_view_mut::<3, 3>(0, 0).copy_from(&d_dv);
    ret.fixed_view_mut::<3, 1>(0, 3).copy_from(&d_dw);
    ret
}

/// One beacon's pixel observation against the augmented state.
#[derive(Debug, Clone)]
pub struct ImagePointMeasurement {
    camera: CameraModel,
    measurement: Vector2<f64>,
    variance: f64,
}

impl ImagePointMeasurement {
    pub fn new(camera: CameraModel) -> Self {
        ImagePointMeasurement {
            camera,
            measurement: Vector2::zeros(),
            variance: 1.0,
        }
    }

    pub fn set_measurement(&mut self, pixel: &Vector2<f64>) {
        self.measurement = *pixel;
    }

    /// Isotropic pixel variance, already scaled by the caller.
    pub fn set_variance(&mut self, variance: f64) {
        self.variance = variance;
    }

    /// Beacon position in camera space under the current augmented state.
    fn camera_space_point(&self, state: &AugmentedState<'_>) -> Vector3<f64> {
        state.body().combined_quaternion() * state.beacon().position() + state.body().position()
    }

    fn predict(&self, state: &AugmentedState<'_>) -> Vector2<f64> {
        let x = self.camera_space_point(state);
        Vector2::new(
            self.camera.focal_lengths.x * x.x / x.z,
            self.camera.focal_lengths.y * x.y / x.z,
        ) + self.camera.principal_point
    }
}

impl<'a> MeasurementModel<AugmentedState<'a>, AUGMENTED_DIM, 2> for ImagePointMeasurement {
    fn jacobian(&self, state: &AugmentedState<'a>) -> SMatrix<f64, 2, AUGMENTED_DIM> {
        let x = self.camera_space_point(state);
        let fx = self.camera.focal_lengths.x;
        let fy = self.camera.focal_lengths.y;
        // d pixel / d camera-space point
        let dproj = SMatrix::<f64, 2, 3>::new(
            fx / x.z,
            0.0,
            -fx * x.x / (x.z * x.z),
            0.0,
            fy / x.z,
            -fy * x.y / (x.z * x.z),
        );

        // X = exp(phi) * (q_ext * b) + t: derivative with respect to the
        // incremental rotation goes through the quaternion Jacobian of the
        // exponential map.
        let body = state.body();
        let phi = body.incremental_orientation();
        let p = crate::math::quat_exp(&phi);
        let u = body.quaternion() * state.beacon().position();
        let dx_dphi = rotation_by_quat_jacobian(&p, &u) * quat_exp_jacobian(&phi);

        // Beacon half: X moves with the full rotation.
        let r_total = body.combined_quaternion().to_rotation_matrix();

        let mut h = SMatrix::<f64, 2, AUGMENTED_DIM>::zeros();
        h.fixed_view_mut::<2, 3>(0, 0).copy_from(&dproj);
        h.fixed_view_mut::<2, 3>(0, 3).copy_from(&(dproj * dx_dphi));
        h.fixed_view_mut::<2, 3>(0, 12)
            .copy_from(&(dproj * r_total.matrix()));
        h
    }

    fn residual(&self, state: &AugmentedState<'a>) -> Vector2<f64> {
        self.measurement - self.predict(state)
    }

    fn covariance(&self, _state: &AugmentedState<'a>) -> Matrix2<f64> {
        Matrix2::identity() * self.variance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::state::{BeaconState, BodyState};
    use approx::assert_abs_diff_eq;

    fn camera() -> CameraModel {
        CameraModel {
            focal_lengths: Vector2::new(700.0, 700.0),
            principal_point: Vector2::new(320.0, 240.0),
        }
    }

    fn state_pair() -> (BodyState, BeaconState) {
        let mut body = BodyState::default();
        body.set_position(&Vector3::new(0.01, -0.02, 0.4));
        body.set_quaternion(&UnitQuaternion::from_euler_angles(0.05, -0.1, 0.02));
        body.set_incremental_orientation(&Vector3::new(0.002, -0.001, 0.003));
        let beacon = BeaconState::new(Vector3::new(0.03, 0.02, 0.0), Matrix3::identity() * 1e-6);
        (body, beacon)
    }

    #[test]
    fn residual_is_zero_at_the_predicted_pixel() {
        let (mut body, mut beacon) = state_pair();
        let mut meas = ImagePointMeasurement::new(camera());
        let aug = AugmentedState::new(&mut body, &mut beacon);
        let predicted = meas.predict(&aug);
        meas.set_measurement(&predicted);
        assert_abs_diff_eq!(meas.residual(&aug), Vector2::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn jacobian_matches_finite_differences() {
        let (mut body, mut beacon) = state_pair();
        let mut meas = ImagePointMeasurement::new(camera());
        meas.set_measurement(&Vector2::new(300.0, 260.0));

        let analytic = {
            let aug = AugmentedState::new(&mut body, &mut beacon);
            meas.jacobian(&aug)
        };

        let h = 1e-7;
        for col in 0..AUGMENTED_DIM {
            // residual = z - predict, so d residual/d x = -d predict/d x;
            // compare against the measurement function itself.
            let (mut body_p, mut beacon_p) = (body.clone(), beacon.clone());
            let (mut body_m, mut beacon_m) = (body.clone(), beacon.clone());
            {
                let mut aug = AugmentedState::new(&mut body_p, &mut beacon_p);
                let mut x = aug.state_vector();
                x[col] += h;
                aug.set_state_vector(&x);
            }
            {
                let mut aug = AugmentedState::new(&mut body_m, &mut beacon_m);
                let mut x = aug.state_vector();
                x[col] -= h;
                aug.set_state_vector(&x);
            }
            let plus = {
                let aug = AugmentedState::new(&mut body_p, &mut beacon_p);
                meas.predict(&aug)
            };
            let minus = {
                let aug = AugmentedState::new(&mut body_m, &mut beacon_m);
                meas.predict(&aug)
            };
            let numeric = (plus - minus) / (2.0 * h);
            for row in 0..2 {
                assert_abs_diff_eq!(analytic[(row, col)], numeric[row], epsilon = 2e-3);
            }
        }
    }

    #[test]
    fn velocity_columns_are_zero() {
        let (mut body, mut beacon) = state_pair();
        let meas = ImagePointMeasurement::new(camera());
        let aug = AugmentedState::new(&mut body, &mut beacon);
        let j = meas.jacobian(&aug);
        for col in 6..12 {
            assert_eq!(j[(0, col)], 0.0);
            assert_eq!(j[(1, col)], 0.0);
        }
    }

    #[test]
    fn variance_scales_the_covariance() {
        let (mut body, mut beacon) = state_pair();
        let mut meas = ImagePointMeasurement::new(camera());
        meas.set_variance(2.5);
        let aug = AugmentedState::new(&mut body, &mut beacon);
        assert_eq!(meas.covariance(&aug), Matrix2::identity() * 2.5);
    }
}
