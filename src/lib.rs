//! Multi-LiDAR odometry and online extrinsic self-calibration.
//!
//! The estimator ingests synchronized point clouds from N rigidly
//! mounted LiDARs and maintains a body-frame trajectory together with
//! refined sensor-to-body extrinsics, by matching features against a
//! rolling local map and solving a sliding-window nonlinear least
//! squares problem with marginalization of the oldest pose.

pub mod calib;
pub mod cloud;
pub mod estimator;
pub mod features;
pub mod geometry;
pub mod io;
pub mod optimizer;
pub mod tracking;
pub mod window;

pub use estimator::{Estimator, EstimatorConfig, EstimatorSnapshot, ExtrinsicMode};
pub use geometry::SE3;
