//! Degeneracy analysis of the problem Jacobian.
//!
//! Online calibration is ill-posed whenever the motion fails to excite a
//! direction (planar trajectories, rotation-only segments). Instead of
//! freezing whole blocks, the analyzer eigendecomposes each block's 6×6
//! Gramian sub-block and installs a projector that confines the solver's
//! update to the observed subspace, so information along observable axes
//! is still absorbed.

use nalgebra::{DMatrix, Matrix6, Vector6};
use tracing::debug;

use super::problem::Problem;

/// Inspect `H = JᵀJ` block-diagonals against the per-block eigenvalue
/// thresholds `tau`, install projectors on degenerate blocks, and run
/// the adaptive threshold for extrinsic blocks (indices above
/// `opt_window_size`). Returns, per block, the number of directions
/// projected out (0 = fully observable).
///
/// `tau` entries for extrinsic blocks only ever grow, which is what the
/// calibration-convergence monitor keys off.
pub fn analyze(
    problem: &mut Problem,
    jacobian: &DMatrix<f64>,
    tau: &mut [f64],
    opt_window_size: usize,
) -> Vec<usize> {
    let jtj = jacobian.transpose() * jacobian;
    let num_blocks = problem.blocks.len();
    debug_assert_eq!(tau.len(), num_blocks);

    let mut nullity = vec![0usize; num_blocks];
    for i in 0..num_blocks {
        let h_block: Matrix6<f64> = jtj.fixed_view::<6, 6>(6 * i, 6 * i).into_owned();
        let eig = nalgebra::SymmetricEigen::new(h_block);

        // Eigenpairs sorted ascending so degenerate directions come first.
        let mut order: Vec<usize> = (0..6).collect();
        order.sort_by(|&a, &b| eig.eigenvalues[a].partial_cmp(&eig.eigenvalues[b]).unwrap());

        let mut eigenvalues = Vector6::zeros();
        let mut v_full = Matrix6::zeros();
        for (col, &src) in order.iter().enumerate() {
            eigenvalues[col] = eig.eigenvalues[src];
            v_full.set_column(col, &eig.eigenvectors.column(src));
        }

        let mut v_proj = v_full;
        let mut zeroed = 0;
        for col in 0..6 {
            if eigenvalues[col] < tau[i] {
                v_proj.set_column(col, &Vector6::zeros());
                zeroed += 1;
            } else {
                break;
            }
        }
        let degenerate = zeroed > 0;

        // V = (Vfᵀ)⁻¹ Vpᵀ; Vf is orthogonal, so the inverse transpose is
        // Vf itself.
        let mut projector = v_full * v_proj.transpose();

        let min_eig = eigenvalues[0];
        if i > opt_window_size {
            if min_eig > tau[i] {
                tau[i] = min_eig;
            } else {
                projector = Matrix6::zeros();
            }
        }

        nullity[i] = zeroed;
        problem.blocks[i].projector = if degenerate { Some(projector) } else { None };

        debug!(
            block = i,
            min_eig,
            threshold = tau[i],
            zeroed,
            "degeneracy analysis"
        );
    }

    nullity
}
