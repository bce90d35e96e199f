//! Local-map construction in the pivot frame.
//!
//! The map is a pure function of the window contents and the current
//! extrinsics, rebuilt from scratch every cycle. Frozen history
//! `[0..=P]` is collapsed once into a per-sensor snapshot stored at the
//! pivot slot, in the pivot's sensor frame; live slots are brought into
//! the pivot body frame through `pose_local[n][i] = T_p⁻¹ · T_i ·
//! T_ext(n)` (which degenerates to `T_ext(n)` for the snapshot itself).

use crate::cloud::{PointCloud, VoxelGrid};
use crate::features::matcher::{build_index, match_edge_to_map, match_surf_to_map};
use crate::features::Feature;
use crate::geometry::SE3;
use crate::window::SlidingWindow;

/// Voxel leaf for reference-sensor and odometry-mode maps.
const MAP_LEAF: f64 = 0.4;
/// Voxel leaf for the cross-sensor maps used during calibration.
const CALIB_MAP_LEAF: f64 = 0.3;

/// Nearest-neighbor counts for matching.
const K_NEIGH_REF: usize = 5;
const K_NEIGH_OTHER: usize = 10;

/// The per-cycle map products consumed by the problem assembler.
#[derive(Debug, Clone, Default)]
pub struct LocalMaps {
    /// Downsampled per-sensor maps, pivot body frame.
    pub surf_filtered: Vec<PointCloud>,
    pub edge_filtered: Vec<PointCloud>,
    /// `pose_local[n][i]`: slot-i sensor frame → pivot body frame.
    pub pose_local: Vec<Vec<SE3>>,
    /// Per-sensor, per-slot correspondences.
    pub surf_features: Vec<Vec<Vec<Feature>>>,
    pub edge_features: Vec<Vec<Vec<Feature>>>,
}

/// Collapse frames `[0..=pivot]` of one sensor into its pivot slot, in
/// the pivot sensor frame. Runs once per map epoch; the slide keeps the
/// snapshot current afterwards.
fn freeze_history(
    window: &mut SlidingWindow,
    ext: &SE3,
    pivot_idx: usize,
    sensor: usize,
    edges: bool,
) {
    let pose_pivot = window.poses.get(pivot_idx).clone();
    let sensor_pivot = pose_pivot.compose(ext); // world ← pivot sensor

    let mut surf_union = PointCloud::new();
    let mut edge_union = PointCloud::new();
    for i in 0..=pivot_idx {
        let pose_i = window.poses.get(i).clone();
        // slot-i sensor frame → pivot sensor frame
        let pose_spi = sensor_pivot.inverse().compose(&pose_i).compose(ext);
        surf_union.extend_from(
            &window.surf_stack[sensor]
                .get(i)
                .transformed_tagged(&pose_spi, i as u32),
        );
        if edges {
            edge_union.extend_from(
                &window.edge_stack[sensor]
                    .get(i)
                    .transformed_tagged(&pose_spi, i as u32),
            );
        }
    }
    *window.surf_stack[sensor].get_mut(pivot_idx) = surf_union;
    if edges {
        *window.edge_stack[sensor].get_mut(pivot_idx) = edge_union;
    }
}

fn local_poses(window: &SlidingWindow, ext: &SE3, pivot_idx: usize) -> Vec<SE3> {
    let pivot_inv = window.poses.get(pivot_idx).inverse();
    (0..window.poses.len())
        .map(|i| pivot_inv.compose(window.poses.get(i)).compose(ext))
        .collect()
}

/// Union the slots `[pivot..W)` of one channel into the pivot body frame.
fn accumulate(
    stack: &crate::window::CircBuf<PointCloud>,
    pose_local: &[SE3],
    pivot_idx: usize,
    window_size: usize,
) -> PointCloud {
    let mut map = PointCloud::new();
    for i in pivot_idx..window_size {
        map.extend_from(&stack.get(i).transformed_tagged(&pose_local[i], i as u32));
    }
    map
}

/// Odometry-mode map: every sensor accumulates its own history and is
/// matched over every live slot.
pub fn build_local_map(
    window: &mut SlidingWindow,
    extrinsics: &[SE3],
    pivot_idx: usize,
    ini_fixed_local_map: &mut bool,
    edges: bool,
) -> LocalMaps {
    let num_sensors = window.num_sensors();
    let window_size = window.window_size();

    if !*ini_fixed_local_map {
        for n in 0..num_sensors {
            freeze_history(window, &extrinsics[n], pivot_idx, n, edges);
        }
        *ini_fixed_local_map = true;
    }

    let mut maps = LocalMaps::default();
    let filter = VoxelGrid::new(MAP_LEAF);
    for n in 0..num_sensors {
        let pose_local = local_poses(window, &extrinsics[n], pivot_idx);

        let surf_map = accumulate(&window.surf_stack[n], &pose_local, pivot_idx, window_size);
        let surf_filtered = filter.filter(&surf_map);
        let edge_filtered = if edges {
            filter.filter(&accumulate(
                &window.edge_stack[n],
                &pose_local,
                pivot_idx,
                window_size,
            ))
        } else {
            PointCloud::new()
        };

        let mut surf_features = vec![Vec::new(); window_size + 1];
        let mut edge_features = vec![Vec::new(); window_size + 1];
        let surf_tree = build_index(&surf_filtered);
        let edge_tree = build_index(&edge_filtered);
        for i in pivot_idx + 1..=window_size {
            surf_features[i] = match_surf_to_map(
                &surf_tree,
                &surf_filtered,
                window.surf_stack[n].get(i),
                &pose_local[i],
                K_NEIGH_REF,
            );
            if edges {
                edge_features[i] = match_edge_to_map(
                    &edge_tree,
                    &edge_filtered,
                    window.edge_stack[n].get(i),
                    &pose_local[i],
                    K_NEIGH_REF,
                );
            }
        }

        maps.surf_filtered.push(surf_filtered);
        maps.edge_filtered.push(edge_filtered);
        maps.pose_local.push(pose_local);
        maps.surf_features.push(surf_features);
        maps.edge_features.push(edge_features);
    }

    maps
}

/// Calibration-mode map: the reference sensor builds and matches its own
/// map over the live slots; non-reference sensors match only their pivot
/// scan, against the reference map re-filtered at a finer leaf.
pub fn build_calib_map(
    window: &mut SlidingWindow,
    extrinsics: &[SE3],
    pivot_idx: usize,
    idx_ref: usize,
    ini_fixed_local_map: &mut bool,
    edges: bool,
) -> LocalMaps {
    let num_sensors = window.num_sensors();
    let window_size = window.window_size();

    if !*ini_fixed_local_map {
        freeze_history(window, &extrinsics[idx_ref], pivot_idx, idx_ref, edges);
        *ini_fixed_local_map = true;
    }

    // Reference map first; the others are seeded from it.
    let ref_pose_local = local_poses(window, &extrinsics[idx_ref], pivot_idx);
    let ref_surf_map = accumulate(
        &window.surf_stack[idx_ref],
        &ref_pose_local,
        pivot_idx,
        window_size,
    );
    let ref_edge_map = if edges {
        accumulate(
            &window.edge_stack[idx_ref],
            &ref_pose_local,
            pivot_idx,
            window_size,
        )
    } else {
        PointCloud::new()
    };

    let mut maps = LocalMaps::default();
    for n in 0..num_sensors {
        let pose_local = local_poses(window, &extrinsics[n], pivot_idx);
        let (surf_filtered, edge_filtered) = if n == idx_ref {
            let filter = VoxelGrid::new(MAP_LEAF);
            (filter.filter(&ref_surf_map), filter.filter(&ref_edge_map))
        } else {
            let filter = VoxelGrid::new(CALIB_MAP_LEAF);
            (filter.filter(&ref_surf_map), filter.filter(&ref_edge_map))
        };

        let k = if n == idx_ref { K_NEIGH_REF } else { K_NEIGH_OTHER };
        let mut surf_features = vec![Vec::new(); window_size + 1];
        let mut edge_features = vec![Vec::new(); window_size + 1];
        let surf_tree = build_index(&surf_filtered);
        let edge_tree = build_index(&edge_filtered);
        for i in pivot_idx..=window_size {
            // Reference contributes over the live slots; the others only
            // at the pivot, where cross-sensor overlap is densest.
            let skip = (n == idx_ref && i == pivot_idx) || (n != idx_ref && i != pivot_idx);
            if skip {
                continue;
            }
            surf_features[i] = match_surf_to_map(
                &surf_tree,
                &surf_filtered,
                window.surf_stack[n].get(i),
                &pose_local[i],
                k,
            );
            if edges {
                edge_features[i] = match_edge_to_map(
                    &edge_tree,
                    &edge_filtered,
                    window.edge_stack[n].get(i),
                    &pose_local[i],
                    k,
                );
            }
        }

        maps.surf_filtered.push(surf_filtered);
        maps.edge_filtered.push(edge_filtered);
        maps.pose_local.push(pose_local);
        maps.surf_features.push(surf_features);
        maps.edge_features.push(edge_features);
    }

    maps
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn window_with_plane(window_size: usize) -> SlidingWindow {
        let mut window = SlidingWindow::new(window_size, 1);
        // Every slot sees the same dense plane z = 2 from the origin.
        let mut cloud = PointCloud::new();
        for i in -10..=10 {
            for j in -10..=10 {
                cloud.push(Vector3::new(i as f64 * 0.3, j as f64 * 0.3, 2.0));
            }
        }
        for i in 0..=window_size {
            *window.surf_stack[0].get_mut(i) = cloud.clone();
            *window.surf_stack_size[0].get_mut(i) = cloud.len();
        }
        while !window.is_full() {
            window.advance_fill();
        }
        window
    }

    #[test]
    fn test_build_local_map_freezes_once_and_matches() {
        let mut window = window_with_plane(4);
        let extrinsics = vec![SE3::identity()];
        let mut frozen = false;

        let maps = build_local_map(&mut window, &extrinsics, 2, &mut frozen, false);
        assert!(frozen);
        assert_eq!(maps.surf_filtered.len(), 1);
        assert!(!maps.surf_filtered[0].is_empty());

        // Live slots above the pivot all found correspondences.
        for i in 3..=4 {
            assert!(
                !maps.surf_features[0][i].is_empty(),
                "slot {i} found no correspondences"
            );
        }
        // Frozen history was collapsed into the pivot slot.
        assert!(window.surf_stack[0].get(2).len() > window.surf_stack[0].get(3).len());
    }

    #[test]
    fn test_pose_local_at_pivot_is_extrinsic() {
        let mut window = window_with_plane(4);
        let ext = SE3 {
            rotation: nalgebra::UnitQuaternion::from_euler_angles(0.0, 0.0, 0.3),
            translation: Vector3::new(0.1, 0.0, 0.0),
        };
        let extrinsics = vec![ext.clone()];
        let mut frozen = false;

        let maps = build_local_map(&mut window, &extrinsics, 2, &mut frozen, false);
        let at_pivot = &maps.pose_local[0][2];
        assert!((at_pivot.translation - ext.translation).norm() < 1e-12);
        assert!(at_pivot.rotation.angle_to(&ext.rotation) < 1e-12);
    }
}
