//! Feature-to-map matching.
//!
//! For each point of a live scan, transformed into the map frame by its
//! current pose estimate, the matcher finds nearest neighbors in the
//! (downsampled) local map, fits a plane or a line through them, and
//! emits a weighted correspondence when the fit is tight enough.

use kiddo::float::kdtree::KdTree;
use kiddo::SquaredEuclidean;
use nalgebra::{DMatrix, DVector, Vector3, Vector4};

use crate::cloud::PointCloud;
use crate::geometry::SE3;

use super::Feature;

/// Neighbors farther than this from the fitted plane invalidate the fit.
const PLANE_FIT_THRESHOLD: f64 = 0.2;

/// Bucket size for the map k-d tree. Larger than kiddo's default (32) so
/// that dense, near-coplanar clusters of map points (common for LiDAR
/// surface features) don't overflow a single leaf on one axis.
const KDTREE_BUCKET_SIZE: usize = 4096;

/// Line fits need the dominant eigenvalue to exceed the middle one by
/// this ratio.
const EDGE_EIG_RATIO: f64 = 3.0;

/// Correspondences scoring below this are dropped.
const MIN_SCORE: f64 = 0.1;

/// Build a nearest-neighbor index over a map cloud.
pub fn build_index(map: &PointCloud) -> KdTree<f64, u64, 3, KDTREE_BUCKET_SIZE, u32> {
    let mut tree: KdTree<f64, u64, 3, KDTREE_BUCKET_SIZE, u32> = KdTree::new();
    for (i, p) in map.iter().enumerate() {
        tree.add(&[p.x, p.y, p.z], i as u64);
    }
    tree
}

/// Match surface points of `scan` (sensor frame) against `map` (map
/// frame), bringing scan points into the map frame with `pose_local`.
///
/// For each point: `k` nearest map neighbors, least-squares plane fit
/// `n·p + d = 0`, residual-based score. Only tight fits survive.
pub fn match_surf_to_map(
    tree: &KdTree<f64, u64, 3, KDTREE_BUCKET_SIZE, u32>,
    map: &PointCloud,
    scan: &PointCloud,
    pose_local: &SE3,
    k: usize,
) -> Vec<Feature> {
    let mut features = Vec::new();
    if map.len() < k {
        return features;
    }

    for p_sensor in scan.iter() {
        let p_map = pose_local.transform_point(p_sensor);
        let neighbors = tree.nearest_n::<SquaredEuclidean>(&[p_map.x, p_map.y, p_map.z], k);
        if neighbors.len() < k || neighbors[k - 1].distance > 1.0 {
            continue;
        }

        // Solve A·n = -1 over the neighbors, then normalize to (n, d).
        let mut a = DMatrix::zeros(k, 3);
        for (row, n) in neighbors.iter().enumerate() {
            let q = map.point(n.item as usize);
            a[(row, 0)] = q.x;
            a[(row, 1)] = q.y;
            a[(row, 2)] = q.z;
        }
        let b = DVector::from_element(k, -1.0);
        let svd = a.svd(true, true);
        let normal_raw = match svd.solve(&b, 1e-10) {
            Ok(x) => Vector3::new(x[0], x[1], x[2]),
            Err(_) => continue,
        };
        let norm = normal_raw.norm();
        if norm < 1e-10 {
            continue;
        }
        let normal = normal_raw / norm;
        let d = 1.0 / norm;

        // All neighbors must actually lie on the plane.
        let planar = neighbors.iter().all(|n| {
            let q = map.point(n.item as usize);
            (normal.dot(q) + d).abs() <= PLANE_FIT_THRESHOLD
        });
        if !planar {
            continue;
        }

        let residual = normal.dot(&p_map) + d;
        let score = 1.0 - 0.9 * residual.abs() / p_sensor.norm().sqrt().max(1e-3);
        if score <= MIN_SCORE {
            continue;
        }

        features.push(Feature {
            point: *p_sensor,
            coeffs: Vector4::new(normal.x, normal.y, normal.z, d),
            score,
        });
    }

    features
}

/// Match edge points of `scan` against a map of edge points.
///
/// Fits a line through the neighbors (dominant eigenvector of their
/// covariance) and encodes the point-to-line constraint as the plane
/// through the line whose normal is the in-plane perpendicular from the
/// query point, so edge correspondences reuse the plane residual.
pub fn match_edge_to_map(
    tree: &KdTree<f64, u64, 3, KDTREE_BUCKET_SIZE, u32>,
    map: &PointCloud,
    scan: &PointCloud,
    pose_local: &SE3,
    k: usize,
) -> Vec<Feature> {
    let mut features = Vec::new();
    if map.len() < k {
        return features;
    }

    for p_sensor in scan.iter() {
        let p_map = pose_local.transform_point(p_sensor);
        let neighbors = tree.nearest_n::<SquaredEuclidean>(&[p_map.x, p_map.y, p_map.z], k);
        if neighbors.len() < k || neighbors[k - 1].distance > 1.0 {
            continue;
        }

        let mut centroid = Vector3::zeros();
        for n in &neighbors {
            centroid += map.point(n.item as usize);
        }
        centroid /= k as f64;

        let mut cov = nalgebra::Matrix3::zeros();
        for n in &neighbors {
            let d = map.point(n.item as usize) - centroid;
            cov += d * d.transpose();
        }
        cov /= k as f64;

        let eig = nalgebra::SymmetricEigen::new(cov);
        // nalgebra does not order eigenpairs; sort descending.
        let mut order: Vec<usize> = (0..3).collect();
        order.sort_by(|&a, &b| eig.eigenvalues[b].partial_cmp(&eig.eigenvalues[a]).unwrap());
        let lambda_max = eig.eigenvalues[order[0]];
        let lambda_mid = eig.eigenvalues[order[1]];
        if lambda_max < EDGE_EIG_RATIO * lambda_mid.max(1e-12) {
            continue;
        }
        let direction: Vector3<f64> = eig.eigenvectors.column(order[0]).into_owned();

        let offset = p_map - centroid;
        let perp = offset - offset.dot(&direction) * direction;
        let dist = perp.norm();
        if dist < 1e-6 {
            continue;
        }
        let normal = perp / dist;
        let foot = p_map - perp;
        let d = -normal.dot(&foot);

        let score = 1.0 - 0.9 * dist / p_sensor.norm().sqrt().max(1e-3);
        if score <= MIN_SCORE {
            continue;
        }

        features.push(Feature {
            point: *p_sensor,
            coeffs: Vector4::new(normal.x, normal.y, normal.z, d),
            score,
        });
    }

    features
}
