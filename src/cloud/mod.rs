//! Point-cloud container shared by the feature pipeline and the
//! local-map builder.

pub mod voxel;

pub use voxel::VoxelGrid;

use nalgebra::Vector3;

use crate::geometry::SE3;

/// A 3D point cloud where every point carries a `tag` identifying the
/// window slot it originated from. Tags let the local-map builder trim
/// the contribution of a dropped frame off the front of an accumulated
/// cloud without re-deriving ownership.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    points: Vec<Vector3<f64>>,
    tags: Vec<u32>,
}

impl PointCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            points: Vec::with_capacity(cap),
            tags: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn push(&mut self, p: Vector3<f64>) {
        self.push_tagged(p, 0);
    }

    pub fn push_tagged(&mut self, p: Vector3<f64>, tag: u32) {
        self.points.push(p);
        self.tags.push(tag);
    }

    pub fn point(&self, i: usize) -> &Vector3<f64> {
        &self.points[i]
    }

    pub fn tag(&self, i: usize) -> u32 {
        self.tags[i]
    }

    pub fn points(&self) -> &[Vector3<f64>] {
        &self.points
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vector3<f64>> {
        self.points.iter()
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.tags.clear();
    }

    /// Transform every point in place.
    pub fn transform(&mut self, pose: &SE3) {
        for p in &mut self.points {
            *p = pose.transform_point(p);
        }
    }

    /// A transformed copy, with every tag overwritten by `tag`.
    pub fn transformed_tagged(&self, pose: &SE3, tag: u32) -> PointCloud {
        let mut out = PointCloud::with_capacity(self.len());
        for p in &self.points {
            out.push_tagged(pose.transform_point(p), tag);
        }
        out
    }

    /// A transformed copy preserving tags.
    pub fn transformed(&self, pose: &SE3) -> PointCloud {
        let mut out = self.clone();
        out.transform(pose);
        out
    }

    /// Append all points of `other`.
    pub fn extend_from(&mut self, other: &PointCloud) {
        self.points.extend_from_slice(&other.points);
        self.tags.extend_from_slice(&other.tags);
    }

    /// Remove the first `n` points (the oldest contribution of an
    /// accumulated cloud). Removing more points than exist empties the
    /// cloud.
    pub fn drop_front(&mut self, n: usize) {
        let n = n.min(self.points.len());
        self.points.drain(..n);
        self.tags.drain(..n);
    }
}

impl FromIterator<Vector3<f64>> for PointCloud {
    fn from_iter<T: IntoIterator<Item = Vector3<f64>>>(iter: T) -> Self {
        let points: Vec<Vector3<f64>> = iter.into_iter().collect();
        let tags = vec![0; points.len()];
        Self { points, tags }
    }
}
