//! SO(3) Lie group utilities shared by the pose algebra and the
//! residual factors.
//!
//! Provides skew-symmetric matrix construction and the left/right
//! Jacobians of SO(3) following the convention in Barfoot, "State
//! Estimation for Robotics".

use nalgebra::{Matrix3, Vector3};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Computes the left Jacobian Jl(φ) of SO(3).
///
/// Jl relates increments of the rotation vector to increments applied on
/// the left of the group element; it is also the `V` matrix coupling
/// rotation and translation in the SE(3) exponential:
///
/// ```text
/// Jl(φ) = I + (1 - cos|φ|)/|φ|² [φ]× + (|φ| - sin|φ|)/|φ|³ [φ]×²
/// ```
pub fn left_jacobian_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + 0.5 * skew(phi);
    }

    let theta_sq = theta * theta;
    let theta_cu = theta_sq * theta;
    let sin_theta = theta.sin();
    let cos_theta = theta.cos();

    let skew_phi = skew(phi);
    let skew_phi_sq = skew_phi * skew_phi;

    Matrix3::identity()
        + ((1.0 - cos_theta) / theta_sq) * skew_phi
        + ((theta - sin_theta) / theta_cu) * skew_phi_sq
}

/// Computes the inverse of the left Jacobian Jl⁻¹(φ).
///
/// ```text
/// Jl⁻¹(φ) = I - 0.5 [φ]× + (1/|φ|² - (1 + cos|φ|)/(2|φ| sin|φ|)) [φ]×²
/// ```
pub fn left_jacobian_so3_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();

    if theta < SMALL_ANGLE_THRESHOLD {
        let skew_phi = skew(phi);
        return Matrix3::identity() - 0.5 * skew_phi + (1.0 / 12.0) * skew_phi * skew_phi;
    }

    let theta_sq = theta * theta;
    let sin_theta = theta.sin();
    let cos_theta = theta.cos();

    let skew_phi = skew(phi);
    let skew_phi_sq = skew_phi * skew_phi;

    let coeff = 1.0 / theta_sq - (1.0 + cos_theta) / (2.0 * theta * sin_theta);

    Matrix3::identity() - 0.5 * skew_phi + coeff * skew_phi_sq
}

/// Computes the right Jacobian Jr(φ) of SO(3).
///
/// Jr(φ) = Jl(-φ). Used when perturbations are applied on the right of
/// the group element, which is the convention for every parameter block
/// in the optimizer.
pub fn right_jacobian_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    left_jacobian_so3(&-phi)
}

/// Computes the inverse of the right Jacobian Jr⁻¹(φ).
pub fn right_jacobian_so3_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    left_jacobian_so3_inv(&-phi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        let cross_direct = v.cross(&u);
        let cross_skew = skew(&v) * u;

        assert_relative_eq!(cross_direct, cross_skew, epsilon = 1e-12);
    }

    #[test]
    fn test_skew_antisymmetric() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let skew_v = skew(&v);

        assert_relative_eq!(skew_v, -skew_v.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn test_left_jacobian_identity_at_zero() {
        let phi = Vector3::zeros();

        assert_relative_eq!(left_jacobian_so3(&phi), Matrix3::identity(), epsilon = 1e-10);
        assert_relative_eq!(
            left_jacobian_so3_inv(&phi),
            Matrix3::identity(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_left_jacobian_inverse_relationship() {
        let phi = Vector3::new(0.1, 0.2, 0.3);
        let jl = left_jacobian_so3(&phi);
        let jl_inv = left_jacobian_so3_inv(&phi);

        assert_relative_eq!(jl * jl_inv, Matrix3::identity(), epsilon = 1e-10);
    }

    #[test]
    fn test_right_left_jacobian_relation() {
        // Jr(φ) = Jl(φ)ᵀ for SO(3)
        let phi = Vector3::new(-0.3, 0.5, 0.2);
        let jr = right_jacobian_so3(&phi);
        let jl = left_jacobian_so3(&phi);

        assert_relative_eq!(jr, jl.transpose(), epsilon = 1e-10);
    }
}
