//! Estimator driver, configuration and local-map construction.

pub mod config;
mod estimator;
pub mod local_map;

pub use config::{EstimatorConfig, ExtrinsicGuess, ExtrinsicMode};
pub use estimator::{
    Estimator, EstimatorSnapshot, FeatureFrame, SensorExtrinsic, SolverFlag,
};
pub use local_map::LocalMaps;
