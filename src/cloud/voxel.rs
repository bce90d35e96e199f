//! Voxel-grid downsampling.

use std::collections::BTreeMap;

use nalgebra::Vector3;

use super::PointCloud;

/// Centroid-per-voxel downsampling filter.
///
/// Points are bucketed on a regular grid of edge length `leaf`; each
/// occupied voxel contributes the centroid of its points. Output order
/// follows the voxel index, so filtering is deterministic.
#[derive(Debug, Clone, Copy)]
pub struct VoxelGrid {
    pub leaf: f64,
}

impl VoxelGrid {
    pub fn new(leaf: f64) -> Self {
        Self { leaf }
    }

    pub fn filter(&self, cloud: &PointCloud) -> PointCloud {
        if self.leaf <= 0.0 {
            return cloud.clone();
        }

        struct Cell {
            sum: Vector3<f64>,
            count: usize,
            tag: u32,
        }

        let inv_leaf = 1.0 / self.leaf;
        let mut cells: BTreeMap<(i64, i64, i64), Cell> = BTreeMap::new();
        for i in 0..cloud.len() {
            let p = cloud.point(i);
            let key = (
                (p.x * inv_leaf).floor() as i64,
                (p.y * inv_leaf).floor() as i64,
                (p.z * inv_leaf).floor() as i64,
            );
            let cell = cells.entry(key).or_insert(Cell {
                sum: Vector3::zeros(),
                count: 0,
                tag: cloud.tag(i),
            });
            cell.sum += p;
            cell.count += 1;
        }

        let mut out = PointCloud::with_capacity(cells.len());
        for cell in cells.values() {
            out.push_tagged(cell.sum / cell.count as f64, cell.tag);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_merges_within_voxel() {
        let mut cloud = PointCloud::new();
        cloud.push(Vector3::new(0.01, 0.01, 0.01));
        cloud.push(Vector3::new(0.02, 0.02, 0.02));
        cloud.push(Vector3::new(1.0, 1.0, 1.0));

        let filtered = VoxelGrid::new(0.1).filter(&cloud);
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn test_filter_preserves_isolated_points() {
        let mut cloud = PointCloud::new();
        for i in 0..10 {
            cloud.push(Vector3::new(i as f64, 0.0, 0.0));
        }

        let filtered = VoxelGrid::new(0.5).filter(&cloud);
        assert_eq!(filtered.len(), 10);
    }

    #[test]
    fn test_zero_leaf_is_passthrough() {
        let mut cloud = PointCloud::new();
        cloud.push(Vector3::new(0.0, 0.0, 0.0));
        cloud.push(Vector3::new(0.001, 0.0, 0.0));

        let filtered = VoxelGrid::new(0.0).filter(&cloud);
        assert_eq!(filtered.len(), 2);
    }
}
