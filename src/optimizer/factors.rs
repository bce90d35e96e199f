//! Residual factors of the sliding-window problem.
//!
//! Every factor evaluates a residual and analytic Jacobians with respect
//! to the 6-DOF local increments `[δθ; δt]` of the parameter blocks it
//! touches, with rotation perturbations applied on the right
//! (`q ← q ⊗ Exp(δθ)`) and translations added in the global frame.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector, Matrix3, UnitQuaternion, Vector3, Vector4, Vector6};
use tracing::debug;

use crate::geometry::so3::{right_jacobian_so3_inv, skew};
use crate::geometry::SE3;

use super::marginalization::MarginalPrior;

/// Scan-to-map plane constraint tying the pivot pose, one live pose and
/// one extrinsic.
///
/// The feature `point` lives in the sensor frame of the live scan; the
/// plane `(n, d)` lives in the pivot frame. The residual is the scaled
/// point-to-plane distance after chaining live pose and extrinsic into
/// the pivot frame.
#[derive(Debug, Clone)]
pub struct PlaneNormFactor {
    pub point: Vector3<f64>,
    pub coeffs: Vector4<f64>,
    pub score: f64,
}

/// Plane constraint on an extrinsic alone: the point is in the sensor
/// frame at the pivot stamp, the plane in the pivot frame, and the body
/// poses drop out. Used by the batched calibration factors.
#[derive(Debug, Clone)]
pub struct TargetPlaneFactor {
    pub point: Vector3<f64>,
    pub coeffs: Vector4<f64>,
    pub score: f64,
}

/// Gaussian prior anchoring an extrinsic near its configured value.
#[derive(Debug, Clone)]
pub struct ExtrinsicPriorFactor {
    pub t_prior: Vector3<f64>,
    pub q_prior: UnitQuaternion<f64>,
    pub pos_info: f64,
    pub rot_info: f64,
}

/// The factors a residual block can carry.
#[derive(Debug, Clone)]
pub enum FactorKind {
    PlaneNorm(PlaneNormFactor),
    TargetPlane(TargetPlaneFactor),
    ExtrinsicPrior(ExtrinsicPriorFactor),
    Marginal(Arc<MarginalPrior>),
}

impl FactorKind {
    /// Residual dimension.
    pub fn dim(&self) -> usize {
        match self {
            FactorKind::PlaneNorm(_) | FactorKind::TargetPlane(_) => 1,
            FactorKind::ExtrinsicPrior(_) => 6,
            FactorKind::Marginal(prior) => prior.residual.len(),
        }
    }

    /// Number of parameter blocks touched.
    pub fn num_blocks(&self) -> usize {
        match self {
            FactorKind::PlaneNorm(_) => 3,
            FactorKind::TargetPlane(_) | FactorKind::ExtrinsicPrior(_) => 1,
            FactorKind::Marginal(prior) => prior.keys.len(),
        }
    }

    /// Huber threshold for this factor, if robustified.
    pub fn huber_delta(&self) -> Option<f64> {
        match self {
            FactorKind::PlaneNorm(_) | FactorKind::TargetPlane(_) => Some(0.5),
            FactorKind::ExtrinsicPrior(_) | FactorKind::Marginal(_) => None,
        }
    }

    /// Evaluate the residual and, when requested, the per-block
    /// Jacobians (each `dim × 6`, columns ordered `[δθ; δt]`).
    pub fn evaluate(
        &self,
        values: &[&SE3],
        jacobians: Option<&mut Vec<DMatrix<f64>>>,
    ) -> DVector<f64> {
        match self {
            FactorKind::PlaneNorm(f) => {
                let (pivot, live, ext) = (values[0], values[1], values[2]);
                let n = self.normal();
                let d = f.coeffs[3];
                let s = f.score;

                let r0t = pivot.rotation.to_rotation_matrix().into_inner().transpose();
                let r1 = live.rotation.to_rotation_matrix().into_inner();
                let re = ext.rotation.to_rotation_matrix().into_inner();

                let p_body = re * f.point + ext.translation;
                let p_world = r1 * p_body + live.translation;
                let p_pivot = r0t * (p_world - pivot.translation);

                if let Some(jacs) = jacobians {
                    let nt = n.transpose();
                    let mut j_pivot = DMatrix::zeros(1, 6);
                    j_pivot
                        .view_mut((0, 0), (1, 3))
                        .copy_from(&(s * nt * skew(&p_pivot)));
                    j_pivot.view_mut((0, 3), (1, 3)).copy_from(&(-s * nt * r0t));

                    let mut j_live = DMatrix::zeros(1, 6);
                    j_live
                        .view_mut((0, 0), (1, 3))
                        .copy_from(&(-s * nt * r0t * r1 * skew(&p_body)));
                    j_live.view_mut((0, 3), (1, 3)).copy_from(&(s * nt * r0t));

                    let mut j_ext = DMatrix::zeros(1, 6);
                    j_ext
                        .view_mut((0, 0), (1, 3))
                        .copy_from(&(-s * nt * r0t * r1 * re * skew(&f.point)));
                    j_ext
                        .view_mut((0, 3), (1, 3))
                        .copy_from(&(s * nt * r0t * r1));

                    jacs.clear();
                    jacs.push(j_pivot);
                    jacs.push(j_live);
                    jacs.push(j_ext);
                }

                DVector::from_element(1, s * (n.dot(&p_pivot) + d))
            }
            FactorKind::TargetPlane(f) => {
                let ext = values[0];
                let n = self.normal();
                let d = f.coeffs[3];
                let s = f.score;

                let re = ext.rotation.to_rotation_matrix().into_inner();
                let p_pivot = re * f.point + ext.translation;

                if let Some(jacs) = jacobians {
                    let nt = n.transpose();
                    let mut j_ext = DMatrix::zeros(1, 6);
                    j_ext
                        .view_mut((0, 0), (1, 3))
                        .copy_from(&(-s * nt * re * skew(&f.point)));
                    j_ext.view_mut((0, 3), (1, 3)).copy_from(&(s * nt));

                    jacs.clear();
                    jacs.push(j_ext);
                }

                DVector::from_element(1, s * (n.dot(&p_pivot) + d))
            }
            FactorKind::ExtrinsicPrior(f) => {
                let ext = values[0];
                let phi = (f.q_prior.inverse() * ext.rotation).scaled_axis();

                let mut r = DVector::zeros(6);
                r.fixed_rows_mut::<3>(0).copy_from(&(f.rot_info * phi));
                r.fixed_rows_mut::<3>(3)
                    .copy_from(&(f.pos_info * (ext.translation - f.t_prior)));

                if let Some(jacs) = jacobians {
                    let mut j = DMatrix::zeros(6, 6);
                    j.view_mut((0, 0), (3, 3))
                        .copy_from(&(f.rot_info * right_jacobian_so3_inv(&phi)));
                    j.view_mut((3, 3), (3, 3))
                        .copy_from(&(f.pos_info * Matrix3::identity()));

                    jacs.clear();
                    jacs.push(j);
                }

                r
            }
            FactorKind::Marginal(prior) => {
                let mut dx = DVector::zeros(6 * prior.keys.len());
                for (k, value) in values.iter().enumerate() {
                    let lin = &prior.lin_points[k];
                    let phi = (lin.rotation.inverse() * value.rotation).scaled_axis();
                    let dt = value.translation - lin.translation;
                    let mut block: Vector6<f64> = Vector6::zeros();
                    block.fixed_rows_mut::<3>(0).copy_from(&phi);
                    block.fixed_rows_mut::<3>(3).copy_from(&dt);
                    dx.rows_mut(6 * k, 6).copy_from(&block);
                }

                if let Some(jacs) = jacobians {
                    jacs.clear();
                    for k in 0..prior.keys.len() {
                        jacs.push(prior.jacobian.columns(6 * k, 6).into_owned());
                    }
                }

                &prior.residual + &prior.jacobian * dx
            }
        }
    }

    fn normal(&self) -> Vector3<f64> {
        match self {
            FactorKind::PlaneNorm(f) => Vector3::new(f.coeffs[0], f.coeffs[1], f.coeffs[2]),
            FactorKind::TargetPlane(f) => Vector3::new(f.coeffs[0], f.coeffs[1], f.coeffs[2]),
            _ => unreachable!("only plane factors carry a normal"),
        }
    }

    /// Compare analytic against central-difference Jacobians and return
    /// the largest absolute deviation. A development aid, wired to the
    /// `check_jacobian` switch.
    pub fn check(&self, values: &[&SE3]) -> f64 {
        let mut analytic = Vec::new();
        self.evaluate(values, Some(&mut analytic));
        let numeric = numeric_jacobians(self, values);

        let mut max_err: f64 = 0.0;
        for (a, n) in analytic.iter().zip(numeric.iter()) {
            max_err = max_err.max((a - n).amax());
        }
        debug!(max_err, "factor jacobian check");
        max_err
    }
}

/// Central finite differences over the manifold increments.
pub fn numeric_jacobians(factor: &FactorKind, values: &[&SE3]) -> Vec<DMatrix<f64>> {
    const EPS: f64 = 1e-6;
    let dim = factor.dim();
    let mut out = Vec::with_capacity(values.len());

    for b in 0..values.len() {
        let mut jac = DMatrix::zeros(dim, 6);
        for c in 0..6 {
            let mut delta = Vector6::zeros();
            delta[c] = EPS;
            let plus = perturb(values[b], &delta);
            delta[c] = -EPS;
            let minus = perturb(values[b], &delta);

            let mut vals_plus: Vec<&SE3> = values.to_vec();
            vals_plus[b] = &plus;
            let r_plus = factor.evaluate(&vals_plus, None);

            let mut vals_minus: Vec<&SE3> = values.to_vec();
            vals_minus[b] = &minus;
            let r_minus = factor.evaluate(&vals_minus, None);

            jac.set_column(c, &((r_plus - r_minus) / (2.0 * EPS)));
        }
        out.push(jac);
    }
    out
}

/// Apply a `[δθ; δt]` increment to a pose the way the solver does.
pub fn perturb(pose: &SE3, delta: &Vector6<f64>) -> SE3 {
    let dtheta: Vector3<f64> = delta.fixed_rows::<3>(0).into_owned();
    let dt: Vector3<f64> = delta.fixed_rows::<3>(3).into_owned();
    SE3 {
        rotation: pose.rotation * UnitQuaternion::from_scaled_axis(dtheta),
        translation: pose.translation + dt,
    }
}
