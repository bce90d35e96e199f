//! Estimator configuration.
//!
//! Everything here is frozen when the estimator is constructed. The
//! calibration mode is the one knob with runtime dynamics, so the config
//! only supplies its initial value; the live value belongs to the
//! estimator state.

use anyhow::{bail, Result};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;

/// How sensor extrinsics are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtrinsicMode {
    /// Extrinsics are known and held constant; trajectory only.
    Frozen,
    /// Extrinsics are approximately known and refined online.
    Refine,
    /// Extrinsics are unknown: hand-eye bootstrap before anything else.
    Bootstrap,
}

/// Initial guess for one sensor's mounting, as plain numbers so configs
/// serialize without ceremony. Quaternion coefficients are `[x, y, z, w]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtrinsicGuess {
    pub qbl: [f64; 4],
    pub tbl: [f64; 3],
    pub tdbl: f64,
}

impl ExtrinsicGuess {
    pub fn identity() -> Self {
        Self {
            qbl: [0.0, 0.0, 0.0, 1.0],
            tbl: [0.0, 0.0, 0.0],
            tdbl: 0.0,
        }
    }

    pub fn to_pose(&self) -> SE3 {
        let [x, y, z, w] = self.qbl;
        SE3::from_qt(
            UnitQuaternion::new_normalize(Quaternion::new(w, x, y, z)),
            Vector3::new(self.tbl[0], self.tbl[1], self.tbl[2]),
        )
    }
}

/// Process-wide constants, frozen at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Sensor count N.
    pub num_lasers: usize,
    /// Window size W; the window holds W + 1 frames.
    pub window_size: usize,
    /// Optimization window size O; pivot index is W − O.
    pub opt_window_size: usize,
    /// Reference sensor; its extrinsic stays fixed.
    pub idx_ref: usize,
    /// Initial calibration mode.
    pub estimate_extrinsic: ExtrinsicMode,
    /// Run the worker thread; otherwise `input_cloud` drives cycles
    /// inline.
    pub multiple_thread: bool,

    /// Solver iteration cap.
    pub num_iterations: usize,
    /// Solver wall-clock cap, seconds.
    pub solver_time: f64,

    /// Factor switches.
    pub prior_factor: bool,
    pub point_plane_factor: bool,
    pub point_edge_factor: bool,
    pub marginalization_factor: bool,

    /// Extrinsic-prior information weights.
    pub prior_factor_pos: f64,
    pub prior_factor_rot: f64,

    /// Cycles over which non-reference pivot features accumulate before
    /// a batched calibration-factor injection.
    pub n_cumu_feature: usize,

    /// Degeneracy thresholds: the per-block floor and the convergence
    /// level for calibration.
    pub eig_initial: f64,
    pub eig_thre_calib: f64,

    /// Per-sensor initial extrinsics (body ← sensor).
    pub extrinsics: Vec<ExtrinsicGuess>,

    /// Compare analytic factor Jacobians against finite differences on
    /// the first residual of each cycle. Development aid.
    pub check_jacobian: bool,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            num_lasers: 1,
            window_size: 8,
            opt_window_size: 4,
            idx_ref: 0,
            estimate_extrinsic: ExtrinsicMode::Frozen,
            multiple_thread: false,
            num_iterations: 15,
            solver_time: 0.1,
            prior_factor: true,
            point_plane_factor: true,
            point_edge_factor: false,
            marginalization_factor: true,
            prior_factor_pos: 10.0,
            prior_factor_rot: 25.0,
            n_cumu_feature: 10,
            eig_initial: 100.0,
            eig_thre_calib: 1000.0,
            extrinsics: vec![ExtrinsicGuess::identity()],
            check_jacobian: false,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_lasers == 0 {
            bail!("at least one sensor is required");
        }
        if self.window_size == 0 {
            bail!("window_size must be positive");
        }
        if self.opt_window_size == 0 || self.opt_window_size > self.window_size {
            bail!(
                "opt_window_size must be in 1..={}, got {}",
                self.window_size,
                self.opt_window_size
            );
        }
        if self.idx_ref >= self.num_lasers {
            bail!(
                "idx_ref {} out of range for {} sensors",
                self.idx_ref,
                self.num_lasers
            );
        }
        if self.extrinsics.len() != self.num_lasers {
            bail!(
                "expected {} extrinsic guesses, got {}",
                self.num_lasers,
                self.extrinsics.len()
            );
        }
        if self.n_cumu_feature == 0 {
            bail!("n_cumu_feature must be positive");
        }
        Ok(())
    }

    /// Pivot slot index.
    pub fn pivot_idx(&self) -> usize {
        self.window_size - self.opt_window_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EstimatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_opt_window() {
        let cfg = EstimatorConfig {
            opt_window_size: 9,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_mismatched_extrinsics() {
        let cfg = EstimatorConfig {
            num_lasers: 2,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_extrinsic_guess_roundtrip() {
        let guess = ExtrinsicGuess {
            qbl: [0.0, 0.0, 0.7071067811865476, 0.7071067811865476],
            tbl: [0.3, -0.1, 0.2],
            tdbl: 0.0,
        };
        let pose = guess.to_pose();
        assert!((pose.rotation.angle() - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
        assert!((pose.translation.x - 0.3).abs() < 1e-12);
    }
}
