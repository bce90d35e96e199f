//! Parameter blocks and problem assembly.
//!
//! Blocks are addressed by stable identities, not raw storage: a pose
//! slot relative to the pivot (`Pose(0)` is the pivot itself) or a
//! sensor extrinsic. The marginalization prior stores these identities
//! and is re-bound on entry to each new problem, so the post-slide
//! relabeling is a pure key renaming.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector, Matrix6};

use crate::geometry::SE3;

use super::factors::{perturb, FactorKind};

/// Stable identity of a parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKey {
    /// Pose slot relative to the pivot: `0..=O`, `0` = pivot.
    Pose(usize),
    /// Sensor extrinsic (body ← sensor).
    Extrinsic(usize),
}

/// One 6-DOF manifold block.
#[derive(Debug, Clone)]
pub struct ParamBlock {
    pub key: BlockKey,
    pub value: SE3,
    pub fixed: bool,
    /// Degeneracy projector installed by the analyzer; confines the
    /// solver's update to the observable subspace of this block.
    pub projector: Option<Matrix6<f64>>,
}

/// A factor bound to the blocks it touches.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    pub factor: FactorKind,
    pub block_ids: Vec<usize>,
}

/// The sliding-window least-squares problem.
#[derive(Debug, Clone, Default)]
pub struct Problem {
    pub blocks: Vec<ParamBlock>,
    index: HashMap<BlockKey, usize>,
    pub residuals: Vec<ResidualBlock>,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&mut self, key: BlockKey, value: SE3, fixed: bool) {
        let id = self.blocks.len();
        self.index.insert(key, id);
        self.blocks.push(ParamBlock {
            key,
            value,
            fixed,
            projector: None,
        });
    }

    pub fn block_id(&self, key: BlockKey) -> Option<usize> {
        self.index.get(&key).copied()
    }

    pub fn value(&self, key: BlockKey) -> Option<&SE3> {
        self.block_id(key).map(|id| &self.blocks[id].value)
    }

    pub fn set_fixed(&mut self, key: BlockKey) {
        if let Some(id) = self.block_id(key) {
            self.blocks[id].fixed = true;
        }
    }

    /// Attach a factor to the blocks named by `keys`. Every key must
    /// have been added; factor wiring errors are programmer errors.
    pub fn add_residual(&mut self, factor: FactorKind, keys: &[BlockKey]) {
        debug_assert_eq!(factor.num_blocks(), keys.len());
        let block_ids = keys
            .iter()
            .map(|k| self.block_id(*k).expect("residual references unknown block"))
            .collect();
        self.residuals.push(ResidualBlock { factor, block_ids });
    }

    /// Total residual dimension.
    pub fn residual_dim(&self) -> usize {
        self.residuals.iter().map(|r| r.factor.dim()).sum()
    }

    /// Number of local parameters (6 per block, fixed blocks included).
    pub fn param_dim(&self) -> usize {
        6 * self.blocks.len()
    }

    /// Evaluate the stacked robustified residual vector and, when
    /// requested, the dense Jacobian over all blocks. Huber weighting
    /// is folded in as square-root scales so `‖r‖²` is the robust cost.
    pub fn evaluate(&self, with_jacobian: bool) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let mut residuals = DVector::zeros(self.residual_dim());
        let mut jacobian = if with_jacobian {
            Some(DMatrix::zeros(self.residual_dim(), self.param_dim()))
        } else {
            None
        };

        let mut row = 0;
        let mut jacs: Vec<DMatrix<f64>> = Vec::new();
        for rb in &self.residuals {
            let values: Vec<&SE3> = rb.block_ids.iter().map(|&id| &self.blocks[id].value).collect();
            let r = if with_jacobian {
                rb.factor.evaluate(&values, Some(&mut jacs))
            } else {
                rb.factor.evaluate(&values, None)
            };
            let dim = r.len();

            let sqrt_w = match rb.factor.huber_delta() {
                Some(delta) => {
                    let norm = r.norm();
                    if norm > delta {
                        (delta / norm).sqrt()
                    } else {
                        1.0
                    }
                }
                None => 1.0,
            };

            residuals.rows_mut(row, dim).copy_from(&(&r * sqrt_w));
            if let Some(jacobian) = jacobian.as_mut() {
                for (k, &id) in rb.block_ids.iter().enumerate() {
                    jacobian
                        .view_mut((row, 6 * id), (dim, 6))
                        .copy_from(&(&jacs[k] * sqrt_w));
                }
            }
            row += dim;
        }

        (residuals, jacobian)
    }

    /// Apply a stacked local increment. Fixed blocks are skipped;
    /// degenerate blocks have their increment projected onto the
    /// observable subspace first.
    pub fn apply_delta(&mut self, delta: &DVector<f64>) {
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if block.fixed {
                continue;
            }
            let mut d: nalgebra::Vector6<f64> = delta.fixed_rows::<6>(6 * i).into_owned();
            if let Some(v) = &block.projector {
                d = v * d;
            }
            block.value = perturb(&block.value, &d);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::factors::{ExtrinsicPriorFactor, PlaneNormFactor};
    use nalgebra::{UnitQuaternion, Vector3, Vector4};

    #[test]
    fn test_fixed_block_never_moves() {
        let mut problem = Problem::new();
        problem.add_block(BlockKey::Pose(0), SE3::identity(), true);
        problem.add_block(BlockKey::Pose(1), SE3::identity(), false);

        let delta = DVector::from_element(12, 0.1);
        problem.apply_delta(&delta);

        assert_eq!(problem.blocks[0].value, SE3::identity());
        assert!(problem.blocks[1].value.translation.norm() > 0.0);
    }

    #[test]
    fn test_projector_confines_update() {
        let mut problem = Problem::new();
        problem.add_block(BlockKey::Extrinsic(0), SE3::identity(), false);
        // Projector that zeroes everything: the block must not move.
        problem.blocks[0].projector = Some(Matrix6::zeros());

        let delta = DVector::from_element(6, 0.5);
        problem.apply_delta(&delta);
        assert_eq!(problem.blocks[0].value, SE3::identity());
    }

    #[test]
    fn test_evaluate_shapes() {
        let mut problem = Problem::new();
        problem.add_block(BlockKey::Pose(0), SE3::identity(), true);
        problem.add_block(
            BlockKey::Pose(1),
            SE3 {
                rotation: UnitQuaternion::identity(),
                translation: Vector3::new(0.1, 0.0, 0.0),
            },
            false,
        );
        problem.add_block(BlockKey::Extrinsic(0), SE3::identity(), true);

        problem.add_residual(
            FactorKind::PlaneNorm(PlaneNormFactor {
                point: Vector3::new(1.0, 0.0, 0.0),
                coeffs: Vector4::new(1.0, 0.0, 0.0, -1.0),
                score: 1.0,
            }),
            &[BlockKey::Pose(0), BlockKey::Pose(1), BlockKey::Extrinsic(0)],
        );
        problem.add_residual(
            FactorKind::ExtrinsicPrior(ExtrinsicPriorFactor {
                t_prior: Vector3::zeros(),
                q_prior: UnitQuaternion::identity(),
                pos_info: 1.0,
                rot_info: 1.0,
            }),
            &[BlockKey::Extrinsic(0)],
        );

        let (r, j) = problem.evaluate(true);
        assert_eq!(r.len(), 7);
        let j = j.unwrap();
        assert_eq!((j.nrows(), j.ncols()), (7, 18));

        // The plane residual sees the 0.1 translation along the normal.
        assert!((r[0] - 0.1).abs() < 1e-12);
    }
}
