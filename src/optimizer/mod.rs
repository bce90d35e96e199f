//! Sliding-window nonlinear least squares: factors, problem assembly,
//! degeneracy handling, marginalization, and the LM backend.

pub mod degeneracy;
pub mod factors;
pub mod lm;
pub mod marginalization;
pub mod problem;

pub use factors::{ExtrinsicPriorFactor, FactorKind, PlaneNormFactor, TargetPlaneFactor};
pub use lm::{solve, SolverOptions, SolverSummary};
pub use marginalization::{marginalize, MarginalFactorEntry, MarginalPrior};
pub use problem::{BlockKey, ParamBlock, Problem, ResidualBlock};
