//! Damped Gauss-Newton / Levenberg-Marquardt over the manifold blocks.
//!
//! The window is small (a handful of 6-DOF blocks), so the normal
//! equations are assembled and solved densely. Fixed blocks are pinned
//! by clearing their rows and columns; degeneracy projectors are applied
//! per block when the increment is taken, so updates along unobservable
//! directions never reach the state.

use std::time::{Duration, Instant};

use nalgebra::DVector;

use super::problem::Problem;

/// Solver budget and tolerances.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub max_iterations: usize,
    pub max_time: Duration,
    pub gradient_tolerance: f64,
    pub step_tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_time: Duration::from_millis(100),
            gradient_tolerance: 1e-10,
            step_tolerance: 1e-10,
        }
    }
}

/// One-line report of a solve, logged by the driver.
#[derive(Debug, Clone)]
pub struct SolverSummary {
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub termination: &'static str,
}

impl std::fmt::Display for SolverSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "iterations: {}, initial cost: {:.6e}, final cost: {:.6e}, termination: {}",
            self.iterations, self.initial_cost, self.final_cost, self.termination
        )
    }
}

/// Minimize the robustified cost over the problem's free blocks.
pub fn solve(problem: &mut Problem, options: &SolverOptions) -> SolverSummary {
    let start = Instant::now();

    let (residuals, _) = problem.evaluate(false);
    let initial_cost = 0.5 * residuals.norm_squared();
    let mut current_cost = initial_cost;

    let mut lambda = 1e-4;
    let lambda_up = 10.0;
    let lambda_down = 0.1;
    let min_lambda = 1e-12;
    let max_lambda = 1e8;

    let mut iterations = 0;
    let mut termination = "max iterations";

    for _ in 0..options.max_iterations {
        if start.elapsed() > options.max_time {
            termination = "time budget";
            break;
        }
        iterations += 1;

        let (residuals, jacobian) = problem.evaluate(true);
        let jacobian = jacobian.expect("jacobian requested");

        let gradient = jacobian.transpose() * &residuals;
        if gradient.amax() < options.gradient_tolerance {
            termination = "gradient tolerance";
            break;
        }

        let mut h = jacobian.transpose() * &jacobian;
        let n = h.nrows();
        for i in 0..n {
            h[(i, i)] += lambda * h[(i, i)].max(1e-8);
        }
        // Pin fixed blocks so the system stays well posed.
        for (b, block) in problem.blocks.iter().enumerate() {
            if !block.fixed {
                continue;
            }
            for k in 0..6 {
                let i = 6 * b + k;
                for j in 0..n {
                    h[(i, j)] = 0.0;
                    h[(j, i)] = 0.0;
                }
                h[(i, i)] = 1.0;
            }
        }
        let mut rhs = -gradient;
        for (b, block) in problem.blocks.iter().enumerate() {
            if block.fixed {
                rhs.rows_mut(6 * b, 6).fill(0.0);
            }
        }

        let delta: DVector<f64> = match h.lu().solve(&rhs) {
            Some(d) => d,
            None => {
                termination = "singular normal equations";
                break;
            }
        };

        if delta.norm() < options.step_tolerance {
            termination = "step tolerance";
            break;
        }

        let backup: Vec<_> = problem.blocks.iter().map(|b| b.value.clone()).collect();
        problem.apply_delta(&delta);

        let (trial_residuals, _) = problem.evaluate(false);
        let trial_cost = 0.5 * trial_residuals.norm_squared();

        if trial_cost < current_cost {
            current_cost = trial_cost;
            lambda = (lambda * lambda_down).max(min_lambda);
        } else {
            for (block, value) in problem.blocks.iter_mut().zip(backup) {
                block.value = value;
            }
            lambda = (lambda * lambda_up).min(max_lambda);
            if lambda >= max_lambda {
                termination = "damping saturated";
                break;
            }
        }
    }

    SolverSummary {
        iterations,
        initial_cost,
        final_cost: current_cost,
        termination,
    }
}
