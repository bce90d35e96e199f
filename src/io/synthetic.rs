//! Synthetic structured scenes for the demo binary and the end-to-end
//! tests.
//!
//! The world is a deterministic grid sampling of a few large planes, so
//! plane fitting and scan-to-scan tracking behave the way they do on
//! indoor LiDAR data, without any dataset on disk.

use nalgebra::Vector3;

use crate::cloud::PointCloud;
use crate::geometry::SE3;

/// Room-like world: a floor plus two orthogonal walls.
pub fn structured_world() -> PointCloud {
    let mut world = PointCloud::new();
    for i in -12..=12 {
        for j in -12..=12 {
            let (a, b) = (i as f64 * 0.25, j as f64 * 0.25);
            world.push(Vector3::new(a, b, -1.0)); // floor z = -1
            world.push(Vector3::new(5.0, a, b)); // wall x = 5
            world.push(Vector3::new(a, 4.0, b)); // wall y = 4
        }
    }
    world
}

/// Degenerate world: a single infinite-looking floor plane.
pub fn single_plane_world() -> PointCloud {
    let mut world = PointCloud::new();
    for i in -20..=20 {
        for j in -20..=20 {
            world.push(Vector3::new(i as f64 * 0.25, j as f64 * 0.25, -1.0));
        }
    }
    world
}

/// Sample the world from a sensor at `pose_world_sensor`, keeping points
/// within `max_range` of the sensor, expressed in the sensor frame.
pub fn sample_cloud(world: &PointCloud, pose_world_sensor: &SE3, max_range: f64) -> PointCloud {
    let inv = pose_world_sensor.inverse();
    let mut cloud = PointCloud::new();
    for p in world.iter() {
        let p_sensor = inv.transform_point(p);
        if p_sensor.norm() <= max_range {
            cloud.push(p_sensor);
        }
    }
    cloud
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    #[test]
    fn test_sample_cloud_roundtrip() {
        let world = structured_world();
        let pose = SE3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.0, 0.4),
            translation: Vector3::new(0.5, -0.2, 0.1),
        };

        let cloud = sample_cloud(&world, &pose, 100.0);
        assert_eq!(cloud.len(), world.len());

        // A sensor-frame point mapped back lands on a world point.
        let back = pose.transform_point(cloud.point(0));
        assert_relative_eq!(back, *world.point(0), epsilon = 1e-12);
    }

    #[test]
    fn test_range_limit() {
        let world = structured_world();
        let near = sample_cloud(&world, &SE3::identity(), 2.0);
        assert!(near.len() < world.len());
        for p in near.iter() {
            assert!(p.norm() <= 2.0);
        }
    }
}
