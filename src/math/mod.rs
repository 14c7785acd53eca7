// math/mod.rs

// Fixed-size math kernel for the tracking filter: skew-symmetric matrices,
// the quaternion exponential/log map pair used by the externalized-rotation
// state, the 4x3 Jacobian of the tangent-vector-to-quaternion map, the
// Rodrigues rotation formula, and a handful of quaternion utilities shared
// by the estimators and room calibration.
//
// Every function returns finite outputs for finite inputs in its documented
// domain; near-zero branches use Taylor expansions below SMALL_ANGLE_CUTOFF
// so the formulas stay finite as the angle goes to zero.

pub mod filters;

// Dependencies
use nalgebra::{Matrix3, Quaternion, SMatrix, UnitQuaternion, Vector3};

/// Below this rotation angle (radians) the trigonometric forms are replaced
/// by their Taylor expansions. Machine epsilon is roughly 1e-16; its fourth
/// root, about 1e-4, is the recommended cutoff for swapping a two-term
/// Taylor series in for the direct computation.
pub const SMALL_ANGLE_CUTOFF: f64 = 1e-4;

/// Produces the skew-symmetric "hat" matrix of a 3-vector: the matrix M
/// such that `M * u == v.cross(&u)` for any u.
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// sinc(x) = sin(x)/x, defined (and smooth) at x = 0.
fn sinc(x: f64) -> f64 {
    if x.abs() < SMALL_ANGLE_CUTOFF {
        1.0 - x * x / 6.0
    } else {
        x.sin() / x
    }
}

/// Exponential map: converts a rotation vector (axis * angle, radians) into
/// a unit quaternion. Finite for every finite input.
pub fn quat_exp(v: &Vector3<f64>) -> UnitQuaternion<f64> {
    let theta = v.norm();
    // vector part is sin(theta/2) * axis = 0.5 * sinc(theta/2) * v
    let scale = 0.5 * sinc(theta / 2.0);
    let q = Quaternion::from_parts((theta / 2.0).cos(), scale * v);
    UnitQuaternion::new_normalize(q)
}

/// Log map: converts a unit quaternion into a rotation vector with
/// magnitude in [0, pi]. Inverse of `quat_exp` on that domain.
pub fn quat_ln(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    // Canonicalize to the hemisphere with non-negative scalar part so the
    // result is the short rotation.
    let (w, vec) = if q.w >= 0.0 {
        (q.w, q.imag())
    } else {
        (-q.w, -q.imag())
    };
    let n = vec.norm();
    if n < SMALL_ANGLE_CUTOFF {
        // theta/n = 2*atan2(n, w)/n expanded about n = 0
        vec * (2.0 / w) * (1.0 - n * n / (3.0 * w * w))
    } else {
        vec * (2.0 * n.atan2(w) / n)
    }
}

/// Jacobian of `quat_exp` with respect to the rotation vector: a 4x3 matrix
/// with rows ordered (x, y, z, w) to match quaternion coefficient order.
pub fn quat_exp_jacobian(v: &Vector3<f64>) -> SMatrix<f64, 4, 3> {
    let theta = v.norm();
    // vec(v) = f(theta) * v with f = sin(theta/2)/theta;
    // d vec/d v = f I + (f'(theta)/theta) v v^T
    let (f, g) = if theta < SMALL_ANGLE_CUTOFF {
        (0.5 - theta * theta / 48.0, -1.0 / 24.0)
    } else {
        let f = (theta / 2.0).sin() / theta;
        let g = (theta / 2.0).cos() / (2.0 * theta * theta)
            - (theta / 2.0).sin() / (theta * theta * theta);
        (f, g)
    };
    let top = Matrix3::identity() * f + v * v.transpose() * g;
    // w(v) = cos(theta/2); d w/d v = -0.5 * f * v^T
    let bottom = -0.5 * f * v.transpose();

    let mut ret = SMatrix::<f64, 4, 3>::zeros();
    ret.fixed_view_mut::<3, 3>(0, 0).copy_from(&top);
    ret.fixed_view_mut::<1, 3>(3, 0).copy_from(&bottom);
    ret
}

/// Rodrigues' formula: rotation matrix of a rotation vector.
pub fn rodrigues(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();
    let big_omega = skew_symmetric(omega);
    let (k1, k2) = if theta < SMALL_ANGLE_CUTOFF {
        (1.0 - theta * theta / 6.0, 0.5 - theta * theta / 24.0)
    } else {
        (theta.sin() / theta, (1.0 - theta.cos()) / (theta * theta))
    };
    Matrix3::identity() + big_omega * k1 + big_omega * big_omega * k2
}

/// Velocity attenuation over a time step: `damping^dt`, with damping read
/// as the fraction of velocity remaining after one second.
pub fn compute_attenuation(damping: f64, dt: f64) -> f64 {
    damping.powf(dt)
}

/// Extracts the yaw component (rotation about +Y) of an orientation, as the
/// heading of the rotated forward (+Z) axis.
pub fn extract_yaw(q: &UnitQuaternion<f64>) -> f64 {
    let fwd = q * Vector3::z();
    fwd.x.atan2(fwd.z)
}

/// Returns `q` or `-q`, whichever lies in the same hemisphere as
/// `reference`. Keeps quaternion sequences continuous so averages of logs
/// stay meaningful.
pub fn flip_quat_sign_to_match(
    reference: &UnitQuaternion<f64>,
    q: &UnitQuaternion<f64>,
) -> UnitQuaternion<f64> {
    if reference.coords.dot(&q.coords) < 0.0 {
        UnitQuaternion::new_unchecked(-q.into_inner())
    } else {
        *q
    }
}

/// Reconstructs an angular velocity vector from a small-rotation quaternion
/// spanning `dt` seconds: magnitude `2*acos(w)/dt` about the vector part's
/// axis, with the usual near-identity cutoff.
pub fn angular_velocity_from_delta_quat(dq: &UnitQuaternion<f64>, dt: f64) -> Vector3<f64> {
    if dq.w >= 1.0 || dq.imag().norm() < 1e-10 || dt <= 0.0 {
        return Vector3::zeros();
    }
    let angle = dq.w.min(1.0).acos();
    dq.imag().normalize() * (angle * 2.0 / dt)
}
