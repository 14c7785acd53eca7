// estimator/pnp.rs

// Minimal-case camera pose recovery: the classical three-point resection
// (Grunert's distance system reduced to a quartic, solved by companion
// matrix eigenvalues), point-set alignment by SVD, fourth-point candidate
// disambiguation, and an iterative Gauss-Newton polish over all inliers.

// Dependencies
use nalgebra::{Matrix3, Matrix4, Matrix6, SMatrix, SVector, UnitQuaternion, Vector2, Vector3};

use crate::math::{quat_exp, skew_symmetric};
use crate::vision::camera::CameraIntrinsics;

/// A rigid transform taking target-space points into camera space:
/// `X = rotation * p + translation`.
#[derive(Debug, Clone, Copy)]
pub struct Pose {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn transform(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }
}

/// Multiplies two dense little polynomials (coefficients lowest-order
/// first).
fn poly_mul(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, &ai) in a.iter().enumerate() {
        for (j, &bj) in b.iter().enumerate() {
            out[i + j] += ai * bj;
        }
    }
    out
}

fn poly_add_scaled(target: &mut Vec<f64>, source: &[f64], scale: f64) {
    if target.len() < source.len() {
        target.resize(source.len(), 0.0);
    }
    for (i, &s) in source.iter().enumerate() {
        target[i] += s * scale;
    }
}

fn poly_eval(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, &c| acc * x + c)
}

/// Real roots of a polynomial up to degree four, via the eigenvalues of
/// the companion matrix. Leading coefficients that are negligibly small
/// deflate to the next lower degree.
fn real_roots(coeffs: &[f64]) -> Vec<f64> {
    let max_mag = coeffs.iter().fold(0.0f64, |m, c| m.max(c.abs()));
    if max_mag == 0.0 {
        return Vec::new();
    }
    let mut coeffs: Vec<f64> = coeffs.to_vec();
    while coeffs
        .last()
        .map(|c| c.abs() < 1e-12 * max_mag)
        .unwrap_or(false)
    {
        coeffs.pop();
    }
    let degree = coeffs.len().saturating_sub(1);
    let imag_tolerance = 1e-6;
    match degree {
        0 => Vec::new(),
        1 => vec![-coeffs[0] / coeffs[1]],
        2 => {
            let (a, b, c) = (coeffs[2], coeffs[1], coeffs[0]);
            let disc = b * b - 4.0 * a * c;
            if disc < 0.0 {
                Vec::new()
            } else {
                let s = disc.sqrt();
                vec![(-b + s) / (2.0 * a), (-b - s) / (2.0 * a)]
            }
        }
        3 => {
            let lead = coeffs[3];
            let c: Vec<f64> = coeffs.iter().map(|v| v / lead).collect();
            let mut m = Matrix3::<f64>::zeros();
            m[(1, 0)] = 1.0;
            m[(2, 1)] = 1.0;
            m[(0, 2)] = -c[0];
            m[(1, 2)] = -c[1];
            m[(2, 2)] = -c[2];
            m.complex_eigenvalues()
                .iter()
                .filter(|e| e.im.abs() < imag_tolerance)
                .map(|e| e.re)
                .collect()
        }
        4 => {
            let lead = coeffs[4];
            let c: Vec<f64> = coeffs.iter().map(|v| v / lead).collect();
            let mut m = Matrix4::<f64>::zeros();
            m[(1, 0)] = 1.0;
            m[(2, 1)] = 1.0;
            m[(3, 2)] = 1.0;
            m[(0, 3)] = -c[0];
            m[(1, 3)] = -c[1];
            m[(2, 3)] = -c[2];
            m[(3, 3)] = -c[3];
            m.complex_eigenvalues()
                .iter()
                .filter(|e| e.im.abs() < imag_tolerance)
                .map(|e| e.re)
                .collect()
        }
        _ => Vec::new(),
    }
}

/// Rigid alignment of three (or more) point pairs: finds R, t minimizing
/// `sum |R*a_i + t - b_i|^2`.
fn align_point_sets(a: &[Vector3<f64>], b: &[Vector3<f64>]) -> Option<Pose> {
    let n = a.len();
    if n < 3 || b.len() != n {
        return None;
    }
    let inv = 1.0 / n as f64;
    let ac = a.iter().sum::<Vector3<f64>>() * inv;
    let bc = b.iter().sum::<Vector3<f64>>() * inv;

    let mut h = Matrix3::<f64>::zeros();
    for i in 0..n {
        h += (a[i] - ac) * (b[i] - bc).transpose();
    }
    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut d = Matrix3::identity();
    let det = (v_t.transpose() * u.transpose()).determinant();
    d[(2, 2)] = det.signum();
    let r = v_t.transpose() * d * u.transpose();
    if !r.iter().all(|v| v.is_finite()) {
        return None;
    }
    let rotation = UnitQuaternion::from_matrix(&r);
    let translation = bc - r * ac;
    Some(Pose {
        rotation,
        translation,
    })
}

/// Three-point resection: all camera poses consistent with three world
/// points observed along three bearing vectors. Up to four solutions.
pub fn solve_p3p(world: &[Vector3<f64>; 3], bearings: &[Vector3<f64>; 3]) -> Vec<Pose> {
    // Inter-point distances and inter-ray angles.
    let a = (world[1] - world[2]).norm(); // opposite point 0's ray pairing
    let b = (world[0] - world[2]).norm();
    let c = (world[0] - world[1]).norm();
    if a <= 0.0 || b <= 0.0 || c <= 0.0 {
        return Vec::new();
    }
    let cos_alpha = bearings[1].dot(&bearings[2]);
    let cos_beta = bearings[0].dot(&bearings[2]);
    let cos_gamma = bearings[0].dot(&bearings[1]);

    let a_b = (a * a) / (b * b);
    let c_b = (c * c) / (b * b);

    // With u = s2/s1 and v = s3/s1, the three distance equations reduce to
    //   u = N(v) / D(v),   N quadratic, D linear,
    // and substituting into the first equation gives a quartic in v:
    //   D^2 + N^2 - 2 cos(gamma) N D - c_b * q * D^2 = 0,
    // where q(v) = 1 + v^2 - 2 cos(beta) v.
    let q = [1.0, -2.0 * cos_beta, 1.0];
    let n = [
        (c_b - a_b) - 1.0,
        (c_b - a_b) * (-2.0 * cos_beta),
        (c_b - a_b) + 1.0,
    ];
    let d = [-2.0 * cos_gamma, 2.0 * cos_alpha];

    let d2 = poly_mul(&d, &d);
    let mut quartic = d2.clone();
    poly_add_scaled(&mut quartic, &poly_mul(&n, &n), 1.0);
    poly_add_scaled(&mut quartic, &poly_mul(&n, &d), -2.0 * cos_gamma);
    poly_add_scaled(&mut quartic, &poly_mul(&q, &d2), -c_b);

    let mut poses = Vec::new();
    for v in real_roots(&quartic) {
        if !(v.is_finite() && v > 0.0) {
            continue;
        }
        let denom = poly_eval(&d, v);
        if denom.abs() < 1e-12 {
            continue;
        }
        let u = poly_eval(&n, v) / denom;
        if !(u.is_finite() && u > 0.0) {
            continue;
        }
        let q_v = 1.0 + v * v - 2.0 * v * cos_beta;
        if q_v <= 0.0 {
            continue;
        }
        let s1 = b / q_v.sqrt();
        let (s2, s3) = (u * s1, v * s1);
        let camera_points = [bearings[0] * s1, bearings[1] * s2, bearings[2] * s3];
        if let Some(pose) = align_point_sets(world, &camera_points) {
            poses.push(pose);
        }
    }
    poses
}

/// Reprojection error of one correspondence, in pixels; infinite when the
/// point lands behind the camera.
pub fn reprojection_error(
    pose: &Pose,
    intrinsics: &CameraIntrinsics,
    world: &Vector3<f64>,
    pixel: &Vector2<f64>,
) -> f64 {
    match intrinsics.project(&pose.transform(world)) {
        Some(projected) => (projected - pixel).norm(),
        None => f64::INFINITY,
    }
}

/// Pose from four or more correspondences: P3P on the first three, the
/// remaining points vote for the candidate with the least total
/// reprojection error.
pub fn solve_pnp(
    world: &[Vector3<f64>],
    pixels: &[Vector2<f64>],
    intrinsics: &CameraIntrinsics,
) -> Option<Pose> {
    if world.len() < 4 || world.len() != pixels.len() {
        return None;
    }
    let bearings = [
        intrinsics.bearing(&pixels[0]),
        intrinsics.bearing(&pixels[1]),
        intrinsics.bearing(&pixels[2]),
    ];
    let tri = [world[0], world[1], world[2]];
    let candidates = solve_p3p(&tri, &bearings);

    let mut best: Option<(f64, Pose)> = None;
    for pose in candidates {
        let total: f64 = world
            .iter()
            .zip(pixels.iter())
            .map(|(w, z)| reprojection_error(&pose, intrinsics, w, z))
            .sum();
        if !total.is_finite() {
            continue;
        }
        if best.map(|(err, _)| total < err).unwrap_or(true) {
            best = Some((total, pose));
        }
    }
    best.map(|(_, pose)| pose)
}

/// Gauss-Newton reprojection polish of a pose over a correspondence set.
pub fn refine_pose(
    pose: &Pose,
    world: &[Vector3<f64>],
    pixels: &[Vector2<f64>],
    intrinsics: &CameraIntrinsics,
    iterations: usize,
) -> Pose {
    let mut current = *pose;
    for _ in 0..iterations {
        let mut jtj = Matrix6::<f64>::zeros();
        let mut jtr = SVector::<f64, 6>::zeros();
        for (w, z) in world.iter().zip(pixels.iter()) {
            let x = current.transform(w);
            if x.z <= 1e-9 {
                continue;
            }
            let projected = match intrinsics.project(&x) {
                Some(p) => p,
                None => continue,
            };
            let residual = projected - z;
            // d pixel / d camera-space point
            let dproj = SMatrix::<f64, 2, 3>::new(
                intrinsics.fx / x.z,
                0.0,
                -intrinsics.fx * x.x / (x.z * x.z),
                0.0,
                intrinsics.fy / x.z,
                -intrinsics.fy * x.y / (x.z * x.z),
            );
            // update model: t += dt, R <- exp(dphi) * R, so
            // dX/dt = I and dX/dphi = -[X - t]x
            let mut jac = SMatrix::<f64, 2, 6>::zeros();
            jac.fixed_view_mut::<2, 3>(0, 0).copy_from(&dproj);
            jac.fixed_view_mut::<2, 3>(0, 3)
                .copy_from(&(-dproj * skew_symmetric(&(x - current.translation))));
            jtj += jac.transpose() * jac;
            jtr += jac.transpose() * residual;
        }
        let delta = match jtj.cholesky() {
            Some(chol) => chol.solve(&(-jtr)),
            None => break,
        };
        if !delta.iter().all(|v| v.is_finite()) {
            break;
        }
        current.translation += delta.fixed_rows::<3>(0).into_owned();
        current.rotation =
            quat_exp(&delta.fixed_rows::<3>(3).into_owned()) * current.rotation;
        if delta.norm() < 1e-12 {
            break;
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::Vector3;

    fn square_target() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(-0.04, -0.03, 0.0),
            Vector3::new(0.04, -0.03, 0.0),
            Vector3::new(0.04, 0.03, 0.01),
            Vector3::new(-0.04, 0.03, 0.0),
        ]
    }

    fn true_pose() -> Pose {
        Pose {
            rotation: UnitQuaternion::from_euler_angles(0.1, -0.2, 0.05),
            translation: Vector3::new(0.02, -0.01, 0.35),
        }
    }

    fn project_all(
        pose: &Pose,
        world: &[Vector3<f64>],
        intrinsics: &CameraIntrinsics,
    ) -> Vec<Vector2<f64>> {
        world
            .iter()
            .map(|w| intrinsics.project(&pose.transform(w)).unwrap())
            .collect()
    }

    #[test]
    fn quartic_roots_include_known_values() {
        // (v-1)(v-2)(v-3)(v-4) = 24 - 50v + 35v^2 - 10v^3 + v^4
        let mut roots = real_roots(&[24.0, -50.0, 35.0, -10.0, 1.0]);
        roots.sort_by(f64::total_cmp);
        assert_eq!(roots.len(), 4);
        for (root, expected) in roots.iter().zip([1.0, 2.0, 3.0, 4.0]) {
            assert_abs_diff_eq!(*root, expected, epsilon = 1e-6);
        }
    }

    #[test]
    fn p3p_recovers_a_known_pose_among_candidates() {
        let cam = CameraIntrinsics::simulated();
        let world_all = square_target();
        let truth = true_pose();
        let pixels = project_all(&truth, &world_all, &cam);
        let world = [world_all[0], world_all[1], world_all[2]];
        let bearings = [
            cam.bearing(&pixels[0]),
            cam.bearing(&pixels[1]),
            cam.bearing(&pixels[2]),
        ];
        let poses = solve_p3p(&world, &bearings);
        assert!(!poses.is_empty());
        let best = poses
            .iter()
            .map(|p| (p.translation - truth.translation).norm())
            .fold(f64::INFINITY, f64::min);
        assert!(best < 1e-6, "closest candidate off by {}", best);
    }

    #[test]
    fn pnp_recovers_pose_to_sub_millimeter_with_exact_pixels() {
        let cam = CameraIntrinsics::simulated();
        let world = square_target();
        let truth = true_pose();
        let pixels = project_all(&truth, &world, &cam);
        let pose = solve_pnp(&world, &pixels, &cam).expect("pose");
        assert!((pose.translation - truth.translation).norm() < 1e-4);
        assert!(pose.rotation.angle_to(&truth.rotation) < 1e-3);
    }

    #[test]
    fn refinement_improves_a_perturbed_pose() {
        let cam = CameraIntrinsics::simulated();
        let world = square_target();
        let truth = true_pose();
        let pixels = project_all(&truth, &world, &cam);
        let rough = Pose {
            rotation: UnitQuaternion::from_euler_angles(0.12, -0.18, 0.04),
            translation: truth.translation + Vector3::new(0.004, -0.003, 0.01),
        };
        let polished = refine_pose(&rough, &world, &pixels, &cam, 10);
        let before: f64 = world
            .iter()
            .zip(&pixels)
            .map(|(w, z)| reprojection_error(&rough, &cam, w, z))
            .sum();
        let after: f64 = world
            .iter()
            .zip(&pixels)
            .map(|(w, z)| reprojection_error(&polished, &cam, w, z))
            .sum();
        assert!(after < before / 10.0, "before {} after {}", before, after);
        assert!((polished.translation - truth.translation).norm() < 1e-5);
    }

    #[test]
    fn degenerate_input_produces_no_pose() {
        let cam = CameraIntrinsics::simulated();
        // collinear world points
        let world = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.01, 0.0, 0.0),
            Vector3::new(0.02, 0.0, 0.0),
            Vector3::new(0.03, 0.0, 0.0),
        ];
        let truth = true_pose();
        let pixels = project_all(&truth, &world, &cam);
        // Either no pose or a pose that still reprojects; just must not panic.
        let _ = solve_pnp(&world, &pixels, &cam);
    }
}
