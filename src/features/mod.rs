//! Feature types and the front-end extractor contract.
//!
//! The estimator consumes per-sensor feature clouds, not raw scans. A
//! `FeatureExtractor` turns a raw scan into surface/edge channels at two
//! grades: `sharp` (sparse, used for scan-to-scan tracking) and `less`
//! (dense, stacked into the sliding window and matched against the local
//! map). Real deployments plug in a scan-line curvature extractor; the
//! bundled `PlanarExtractor` is enough for structured scenes and tests.

pub mod matcher;

use nalgebra::{Vector3, Vector4};

use crate::cloud::{PointCloud, VoxelGrid};

/// A single feature-to-map correspondence.
///
/// `point` is in the sensor frame of its scan; `coeffs` holds the plane
/// `(n, d)` the point should lie on, expressed in the map (pivot) frame.
/// Edge correspondences are encoded the same way, as the plane through
/// the fitted line perpendicular to the point's offset. `score` weights
/// the residual.
#[derive(Debug, Clone)]
pub struct Feature {
    pub point: Vector3<f64>,
    pub coeffs: Vector4<f64>,
    pub score: f64,
}

/// Surface and edge features of one scan, at both grades.
#[derive(Debug, Clone, Default)]
pub struct ScanFeatures {
    pub surf_sharp: PointCloud,
    pub surf_less: PointCloud,
    pub edge_sharp: PointCloud,
    pub edge_less: PointCloud,
}

impl ScanFeatures {
    /// A copy keeping only the `less` grades. The driver retains this
    /// for the previous frame to bound memory between cycles.
    pub fn less_only(&self) -> ScanFeatures {
        ScanFeatures {
            surf_sharp: PointCloud::new(),
            surf_less: self.surf_less.clone(),
            edge_sharp: PointCloud::new(),
            edge_less: self.edge_less.clone(),
        }
    }
}

/// Front-end contract: raw scan in sensor frame → feature channels.
pub trait FeatureExtractor: Send {
    fn extract(&self, t: f64, cloud: &PointCloud) -> ScanFeatures;
}

/// Minimal extractor for structured scenes: the whole scan is treated as
/// surface geometry. The sharp grade is a voxel-thinned subset so the
/// scan-to-scan tracker stays cheap; edges are left empty.
#[derive(Debug, Clone)]
pub struct PlanarExtractor {
    sharp_filter: VoxelGrid,
}

impl PlanarExtractor {
    pub fn new() -> Self {
        Self {
            sharp_filter: VoxelGrid::new(0.8),
        }
    }
}

impl Default for PlanarExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureExtractor for PlanarExtractor {
    fn extract(&self, _t: f64, cloud: &PointCloud) -> ScanFeatures {
        ScanFeatures {
            surf_sharp: self.sharp_filter.filter(cloud),
            surf_less: cloud.clone(),
            edge_sharp: PointCloud::new(),
            edge_less: PointCloud::new(),
        }
    }
}
