//! SE(3) rigid transforms.
//!
//! `SE3` is the pose type used everywhere in the estimator: body poses in
//! the sliding window, sensor extrinsics, relative motions from the
//! scan-to-scan tracker. Composition follows the usual convention
//! `a * b` = apply `b` first, then `a`, so a world-from-body pose times a
//! body-from-sensor extrinsic yields a world-from-sensor transform.

use nalgebra::{Matrix3, Matrix4, Matrix6, Rotation3, UnitQuaternion, Vector3, Vector6};

use super::so3::{left_jacobian_so3, left_jacobian_so3_inv};

/// A rigid transform in SE(3): unit quaternion + translation.
///
/// The quaternion is renormalized on every construction path, so
/// `‖q‖ = 1` holds for any value that exists.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from a quaternion (renormalized) and a translation.
    pub fn from_qt(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::new_normalize(*rotation.quaternion()),
            translation,
        }
    }

    /// Construct from a rotation matrix and a translation.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot),
            translation,
        }
    }

    /// Construct from a homogeneous 4×4 matrix.
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        Self::from_rt(m.fixed_view::<3, 3>(0, 0).into_owned(), m.fixed_view::<3, 1>(0, 3).into_owned())
    }

    /// The homogeneous 4×4 matrix form of this transform.
    pub fn matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation.to_rotation_matrix().into_inner());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Compose with another transform: apply `other` first, then `self`.
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// The inverse transform.
    pub fn inverse(&self) -> SE3 {
        let rot_inv = self.rotation.inverse();
        SE3 {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// SE(3) logarithm, rotation-first: ξ = [ω; ρ] with
    /// `exp(ξ) == self`.
    pub fn log(&self) -> Vector6<f64> {
        let omega = self.rotation.scaled_axis();
        let rho = left_jacobian_so3_inv(&omega) * self.translation;
        let mut xi = Vector6::zeros();
        xi.fixed_rows_mut::<3>(0).copy_from(&omega);
        xi.fixed_rows_mut::<3>(3).copy_from(&rho);
        xi
    }

    /// SE(3) exponential of a rotation-first twist ξ = [ω; ρ].
    pub fn exp(xi: &Vector6<f64>) -> SE3 {
        let omega: Vector3<f64> = xi.fixed_rows::<3>(0).into_owned();
        let rho: Vector3<f64> = xi.fixed_rows::<3>(3).into_owned();
        SE3 {
            rotation: UnitQuaternion::from_scaled_axis(omega),
            translation: left_jacobian_so3(&omega) * rho,
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for &SE3 {
    type Output = SE3;

    fn mul(self, rhs: &SE3) -> SE3 {
        self.compose(rhs)
    }
}

impl std::fmt::Display for SE3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = &self.translation;
        let q = self.rotation.quaternion();
        write!(
            f,
            "t: [{:.3}, {:.3}, {:.3}], q: [{:.3}, {:.3}, {:.3}, {:.3}]",
            t.x, t.y, t.z, q.i, q.j, q.k, q.w
        )
    }
}

/// Weighted mean of a set of poses in se(3), with sample covariance.
///
/// The mean twist is `ξ̄ = Σ wₖ ξₖ / Σ wₖ` and the returned pose is
/// `exp(ξ̄)`; the covariance is `Σ wₖ² (ξₖ − ξ̄)(ξₖ − ξ̄)ᵀ / (K − 1)`.
/// This is the small-dispersion approximation, adequate when the inputs
/// cluster around a common value (calibration candidates do).
///
/// A singleton returns its sole input with zero covariance. Empty input
/// is a caller error and returns identity with zero covariance.
pub fn mean_pose(poses: &[(f64, SE3)]) -> (SE3, Matrix6<f64>) {
    let mut cov = Matrix6::zeros();
    match poses.len() {
        0 => return (SE3::identity(), cov),
        1 => return (poses[0].1.clone(), cov),
        _ => {}
    }

    let mut weight_total = 0.0;
    let mut xi_total = Vector6::zeros();
    for (w, pose) in poses {
        weight_total += w;
        xi_total += *w * pose.log();
    }
    let xi_mean = xi_total / weight_total;
    let pose_mean = SE3::exp(&xi_mean);

    for (w, pose) in poses {
        let d = pose.log() - xi_mean;
        cov += w.powi(2) * d * d.transpose();
    }
    cov /= (poses.len() - 1) as f64;

    (pose_mean, cov)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            translation: Vector3::new(1.0, -2.0, 0.5),
        }
    }

    #[test]
    fn test_matrix_roundtrip() {
        let pose = sample_pose();
        let recovered = SE3::from_matrix(&pose.matrix());

        assert_relative_eq!(pose.translation, recovered.translation, epsilon = 1e-12);
        // Quaternions may differ by sign; compare rotation matrices.
        assert_relative_eq!(
            pose.rotation.to_rotation_matrix().into_inner(),
            recovered.rotation.to_rotation_matrix().into_inner(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_log_exp_roundtrip() {
        let pose = sample_pose();
        let xi = pose.log();
        let recovered = SE3::exp(&xi);

        assert_relative_eq!(pose.translation, recovered.translation, epsilon = 1e-10);
        assert_relative_eq!(
            pose.rotation.to_rotation_matrix().into_inner(),
            recovered.rotation.to_rotation_matrix().into_inner(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_compose_inverse() {
        let a = sample_pose();
        let b = SE3 {
            rotation: UnitQuaternion::from_euler_angles(-0.4, 0.1, 0.2),
            translation: Vector3::new(0.3, 0.7, -1.1),
        };

        let ab_inv = a.compose(&b).inverse();
        let b_inv_a_inv = b.inverse().compose(&a.inverse());

        assert_relative_eq!(ab_inv.translation, b_inv_a_inv.translation, epsilon = 1e-12);
        assert_relative_eq!(
            ab_inv.rotation.to_rotation_matrix().into_inner(),
            b_inv_a_inv.rotation.to_rotation_matrix().into_inner(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_compose_then_invert_is_identity() {
        let pose = sample_pose();
        let ident = pose.compose(&pose.inverse());

        assert_relative_eq!(ident.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(ident.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_transform_point_matches_matrix() {
        let pose = sample_pose();
        let p = Vector3::new(0.5, 1.5, -0.7);

        let direct = pose.transform_point(&p);
        let via_matrix = (pose.matrix() * p.push(1.0)).fixed_rows::<3>(0).into_owned();

        assert_relative_eq!(direct, via_matrix, epsilon = 1e-12);
    }

    #[test]
    fn test_mean_pose_singleton() {
        let pose = sample_pose();
        let (mean, cov) = mean_pose(&[(2.0, pose.clone())]);

        assert_relative_eq!(mean.translation, pose.translation, epsilon = 1e-12);
        assert_relative_eq!(cov, Matrix6::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_mean_pose_equal_duplicates() {
        let pose = sample_pose();
        let (mean, cov) = mean_pose(&[(1.0, pose.clone()), (1.0, pose.clone())]);

        assert_relative_eq!(mean.translation, pose.translation, epsilon = 1e-9);
        assert_relative_eq!(
            mean.rotation.to_rotation_matrix().into_inner(),
            pose.rotation.to_rotation_matrix().into_inner(),
            epsilon = 1e-9
        );
        assert_relative_eq!(cov, Matrix6::zeros(), epsilon = 1e-12);
    }
}
