//! Hand-eye style extrinsic initialization.
//!
//! While the estimator bootstraps, every sensor is tracked independently
//! and its sequence of relative motions accumulates here. The classic
//! hand-eye identity `T_ref,k · T_ex = T_ex · T_n,k` is solved in two
//! phases: rotation first (quaternion nullspace via SVD), then
//! translation (linear least squares with the rotation fixed). Each
//! phase declares convergence from its own excitation criterion, so
//! planar or rotation-poor motion simply keeps the bootstrap open
//! instead of producing a bad extrinsic.

use nalgebra::{DMatrix, DVector, Matrix3, Matrix4, Matrix6, Quaternion, UnitQuaternion, Vector3};
use serde::Serialize;
use tracing::debug;

use crate::geometry::{mean_pose, SE3};

/// Second-smallest singular value of the stacked rotation system must
/// exceed this for the rotation estimate to count as constrained.
const ROT_SINGULAR_THRESHOLD: f64 = 0.25;

/// Smallest eigenvalue of the translation normal matrix must exceed
/// this, i.e. the motion must have rotational excitation seen from the
/// translation system.
const POS_EIG_THRESHOLD: f64 = 0.02;

/// Huber threshold on the per-frame rotation residual, degrees.
const HUBER_ANGLE_DEG: f64 = 5.0;

/// Minimum relative-pose pairs before a solve is attempted.
const MIN_FRAME_PAIRS: usize = 4;

/// Per-sensor calibration summary reported when the bootstrap finishes.
#[derive(Debug, Clone, Serialize)]
pub struct CalibStatistics {
    pub sensor: usize,
    pub candidates: usize,
    pub translation: [f64; 3],
    pub rotation_xyzw: [f64; 4],
    pub covariance_diag: [f64; 6],
}

/// Accumulates per-sensor relative poses and solves the two-phase
/// hand-eye bootstrap.
pub struct ExtrinsicInitializer {
    num_sensors: usize,
    idx_ref: usize,

    rel_poses: Vec<Vec<SE3>>,
    rot_est: Vec<UnitQuaternion<f64>>,
    candidates: Vec<Vec<SE3>>,

    pub cov_rot_state: Vec<bool>,
    pub cov_pos_state: Vec<bool>,
    pub full_cov_rot_state: bool,
    pub full_cov_pos_state: bool,
}

impl ExtrinsicInitializer {
    pub fn new(num_sensors: usize, idx_ref: usize) -> Self {
        Self {
            num_sensors,
            idx_ref,
            rel_poses: vec![Vec::new(); num_sensors],
            rot_est: vec![UnitQuaternion::identity(); num_sensors],
            candidates: vec![Vec::new(); num_sensors],
            cov_rot_state: vec![false; num_sensors],
            cov_pos_state: vec![false; num_sensors],
            full_cov_rot_state: false,
            full_cov_pos_state: false,
        }
    }

    pub fn clear(&mut self) {
        let n = self.num_sensors;
        self.rel_poses = vec![Vec::new(); n];
        self.rot_est = vec![UnitQuaternion::identity(); n];
        self.candidates = vec![Vec::new(); n];
        self.cov_rot_state = vec![false; n];
        self.cov_pos_state = vec![false; n];
        self.full_cov_rot_state = false;
        self.full_cov_pos_state = false;
    }

    /// Feed one relative pose (frame k-1 ← frame k) for `sensor`.
    pub fn add_pose(&mut self, rel: SE3, sensor: usize) {
        self.rel_poses[sensor].push(rel);
    }

    /// Number of relative-pose pairs available for `sensor`.
    pub fn frame_count(&self, sensor: usize) -> usize {
        self.rel_poses[self.idx_ref]
            .len()
            .min(self.rel_poses[sensor].len())
    }

    pub fn set_cov_rotation(&mut self, sensor: usize) {
        self.cov_rot_state[sensor] = true;
        self.full_cov_rot_state = self.cov_rot_state.iter().all(|&s| s);
    }

    pub fn set_cov_translation(&mut self, sensor: usize) {
        self.cov_pos_state[sensor] = true;
        self.full_cov_pos_state = self.cov_pos_state.iter().all(|&s| s);
    }

    /// Phase one: solve `min ‖A q_ex‖` over the stacked quaternion
    /// constraints. Returns the rotation once the nullspace is
    /// one-dimensional enough (second-smallest singular value above
    /// threshold).
    pub fn calib_rotation(&mut self, sensor: usize) -> Option<UnitQuaternion<f64>> {
        let pairs = self.frame_count(sensor);
        if pairs < MIN_FRAME_PAIRS {
            return None;
        }

        let mut a = DMatrix::zeros(4 * pairs, 4);
        for k in 0..pairs {
            let q_ref = self.rel_poses[self.idx_ref][k].rotation;
            let q_n = self.rel_poses[sensor][k].rotation;

            // Robust weight from the angular residual of the current
            // estimate.
            let predicted = self.rot_est[sensor] * q_n * self.rot_est[sensor].inverse();
            let ang_deg = q_ref.angle_to(&predicted).to_degrees();
            let weight = if ang_deg > HUBER_ANGLE_DEG {
                HUBER_ANGLE_DEG / ang_deg
            } else {
                1.0
            };

            let block = weight * (quat_left(&q_ref) - quat_right(&q_n));
            a.view_mut((4 * k, 0), (4, 4)).copy_from(&block);
        }

        let svd = a.svd(true, true);
        let v_t = svd.v_t.as_ref()?;
        // Singular values are in descending order; the solution is the
        // right singular vector of the smallest one.
        let x = v_t.row(3);
        let q_ex = UnitQuaternion::new_normalize(Quaternion::new(x[0], x[1], x[2], x[3]));
        self.rot_est[sensor] = q_ex;

        let sigma = &svd.singular_values;
        debug!(sensor, pairs, sigma2 = sigma[2], "hand-eye rotation solve");
        if sigma[2] > ROT_SINGULAR_THRESHOLD {
            Some(q_ex)
        } else {
            None
        }
    }

    /// Phase two: with the rotation fixed, solve
    /// `(R_ref,k − I) t_ex = R_ex t_n,k − t_ref,k` in least squares.
    /// Returns the full extrinsic once the normal matrix is well
    /// conditioned (translational excitation present).
    pub fn calib_translation(&mut self, sensor: usize) -> Option<SE3> {
        let pairs = self.frame_count(sensor);
        if pairs < MIN_FRAME_PAIRS {
            return None;
        }
        let rot_ex = self.rot_est[sensor];

        let mut a = DMatrix::zeros(3 * pairs, 3);
        let mut b = DVector::zeros(3 * pairs);
        let mut normal = Matrix3::zeros();
        for k in 0..pairs {
            let ref_pose = &self.rel_poses[self.idx_ref][k];
            let n_pose = &self.rel_poses[sensor][k];

            let a_k = ref_pose.rotation.to_rotation_matrix().into_inner() - Matrix3::identity();
            let b_k = rot_ex * n_pose.translation - ref_pose.translation;

            a.view_mut((3 * k, 0), (3, 3)).copy_from(&a_k);
            b.rows_mut(3 * k, 3).copy_from(&b_k);
            normal += a_k.transpose() * a_k;
        }

        let eig = nalgebra::SymmetricEigen::new(normal);
        let min_eig = eig.eigenvalues.min();
        debug!(sensor, pairs, min_eig, "hand-eye translation solve");
        if min_eig <= POS_EIG_THRESHOLD {
            return None;
        }

        let svd = a.svd(true, true);
        let t_ex = svd.solve(&b, 1e-10).ok()?;
        let result = SE3::from_qt(rot_ex, Vector3::new(t_ex[0], t_ex[1], t_ex[2]));
        self.candidates[sensor].push(result.clone());
        Some(result)
    }

    /// Weighted-mean summary of the accepted candidates for `sensor`.
    /// Meaningful once the sensor's calibration has converged.
    pub fn statistics(&self, sensor: usize) -> Option<CalibStatistics> {
        let candidates = &self.candidates[sensor];
        if candidates.is_empty() {
            return None;
        }
        let weighted: Vec<(f64, SE3)> =
            candidates.iter().map(|p| (1.0, p.clone())).collect();
        let (mean, cov): (SE3, Matrix6<f64>) = mean_pose(&weighted);
        let q = mean.rotation.quaternion();
        Some(CalibStatistics {
            sensor,
            candidates: candidates.len(),
            translation: [mean.translation.x, mean.translation.y, mean.translation.z],
            rotation_xyzw: [q.i, q.j, q.k, q.w],
            covariance_diag: std::array::from_fn(|i| cov[(i, i)]),
        })
    }
}

/// Left-multiplication matrix of a quaternion over [w, x, y, z]
/// coefficients: `q ⊗ p = L(q) · p`.
fn quat_left(q: &UnitQuaternion<f64>) -> Matrix4<f64> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    Matrix4::new(
        w, -x, -y, -z,
        x, w, -z, y,
        y, z, w, -x,
        z, -y, x, w,
    )
}

/// Right-multiplication matrix: `q ⊗ p = R(p) · q`.
fn quat_right(p: &UnitQuaternion<f64>) -> Matrix4<f64> {
    let (w, x, y, z) = (p.w, p.i, p.j, p.k);
    Matrix4::new(
        w, -x, -y, -z,
        x, w, z, -y,
        y, -z, w, x,
        z, y, -x, w,
    )
}
