//! Point-to-plane ICP between consecutive scans.
//!
//! The tracker provides the frame-to-frame motion prior the estimator
//! composes into the newest window slot. It is deliberately short-sighted:
//! a handful of Gauss-Newton iterations against the previous scan only,
//! seeded with the last relative motion (constant-velocity assumption).

use nalgebra::{Matrix6, Vector3, Vector6};
use tracing::debug;

use crate::features::matcher::{build_index, match_surf_to_map};
use crate::features::ScanFeatures;
use crate::geometry::so3::skew;
use crate::geometry::SE3;

/// Contract for the per-sensor scan-to-scan tracker.
///
/// Returns the relative pose `prev ← cur`. Implementations must accept
/// the previous estimate as the seed and degrade to it gracefully when
/// the scan pair is uninformative.
pub trait ScanTracker: Send {
    fn track(&mut self, prev: &ScanFeatures, cur: &ScanFeatures, guess: &SE3) -> SE3;
}

/// Default tracker: point-to-plane ICP of the current sharp surface
/// points against the previous dense surface cloud.
#[derive(Debug, Clone)]
pub struct IcpTracker {
    pub max_iterations: usize,
    pub min_correspondences: usize,
    pub translation_epsilon: f64,
    pub rotation_epsilon: f64,
}

impl Default for IcpTracker {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            min_correspondences: 10,
            translation_epsilon: 1e-5,
            rotation_epsilon: 1e-5,
        }
    }
}

impl ScanTracker for IcpTracker {
    fn track(&mut self, prev: &ScanFeatures, cur: &ScanFeatures, guess: &SE3) -> SE3 {
        let map = &prev.surf_less;
        if map.len() < self.min_correspondences {
            return guess.clone();
        }
        let scan = if cur.surf_sharp.is_empty() {
            &cur.surf_less
        } else {
            &cur.surf_sharp
        };

        let tree = build_index(map);
        let mut pose = guess.clone();

        for iter in 0..self.max_iterations {
            let features = match_surf_to_map(&tree, map, scan, &pose, 5);
            if features.len() < self.min_correspondences {
                debug!(
                    iter,
                    correspondences = features.len(),
                    "tracker: too few correspondences, keeping seed"
                );
                return guess.clone();
            }

            // Gauss-Newton step on the 6-DOF increment [δθ; δt], applied
            // on the right of the current estimate.
            let rot = pose.rotation.to_rotation_matrix().into_inner();
            let mut h = Matrix6::<f64>::zeros();
            let mut g = Vector6::<f64>::zeros();
            for f in &features {
                let n = Vector3::new(f.coeffs[0], f.coeffs[1], f.coeffs[2]);
                let r = f.score * (n.dot(&pose.transform_point(&f.point)) + f.coeffs[3]);

                let mut jac = Vector6::<f64>::zeros();
                jac.fixed_rows_mut::<3>(0)
                    .copy_from(&(-f.score * (n.transpose() * rot * skew(&f.point)).transpose()));
                jac.fixed_rows_mut::<3>(3).copy_from(&(f.score * n));

                h += jac * jac.transpose();
                g -= jac * r;
            }

            let delta = match h.lu().solve(&g) {
                Some(d) => d,
                None => break,
            };

            let dtheta: Vector3<f64> = delta.fixed_rows::<3>(0).into_owned();
            let dt: Vector3<f64> = delta.fixed_rows::<3>(3).into_owned();
            pose = SE3 {
                rotation: pose.rotation
                    * nalgebra::UnitQuaternion::from_scaled_axis(dtheta),
                translation: pose.translation + dt,
            };

            if dtheta.norm() < self.rotation_epsilon && dt.norm() < self.translation_epsilon {
                break;
            }
        }

        pose
    }
}
