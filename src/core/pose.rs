// src/core/pose.rs

// 6-DOF poses for parts, product targets and tray frames. Poses are plain
// nalgebra isometries; this file only adds the few measurements the cell
// needs (planar offsets, the flip test) and a YAML-friendly representation.

use nalgebra::{Isometry3, Quaternion, Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};

/// Rigid transform used for every pose in the cell (meters, unit quaternion)
pub type Pose = Isometry3<f64>;

/// Serialized pose: position `[x, y, z]` and orientation `[x, y, z, w]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseConfig {
    /// Position in meters
    pub position: [f64; 3],
    /// Quaternion, scalar last
    #[serde(default = "identity_orientation")]
    pub orientation: [f64; 4],
}

fn identity_orientation() -> [f64; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

impl Default for PoseConfig {
    fn default() -> Self {
        PoseConfig {
            position: [0.0; 3],
            orientation: identity_orientation(),
        }
    }
}

impl From<PoseConfig> for Pose {
    fn from(config: PoseConfig) -> Self {
        let [x, y, z, w] = config.orientation;
        let rotation = UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z));
        Isometry3::from_parts(Translation3::from(config.position), rotation)
    }
}

impl From<&Pose> for PoseConfig {
    fn from(pose: &Pose) -> Self {
        let q = pose.rotation.quaternion();
        PoseConfig {
            position: [pose.translation.x, pose.translation.y, pose.translation.z],
            orientation: [q.i, q.j, q.k, q.w],
        }
    }
}

/// Pose at (x, y, z) with identity orientation
pub fn at(x: f64, y: f64, z: f64) -> Pose {
    Isometry3::translation(x, y, z)
}

/// Absolute planar deviation |dx|, |dy| between an observed and a required pose
pub fn planar_offset(observed: &Pose, target: &Pose) -> (f64, f64) {
    (
        (observed.translation.x - target.translation.x).abs(),
        (observed.translation.y - target.translation.y).abs(),
    )
}

/// True when the target orientation rotates about the flip (x) axis,
/// i.e. the part has to be turned over before it can be placed.
pub fn requires_flip(target: &Pose, epsilon: f64) -> bool {
    target.rotation.quaternion().i.abs() > epsilon
}

/// Same position, identity orientation: what a flipped part is placed as
pub fn flattened(pose: &Pose) -> Pose {
    Isometry3::from_parts(pose.translation, UnitQuaternion::identity())
}

/// Pose shifted down along world z
pub fn lowered(pose: &Pose, clearance: f64) -> Pose {
    let mut out = *pose;
    out.translation.z -= clearance;
    out
}

/// Serde adapter so model types can hold a `Pose` directly
pub mod serde_pose {
    use super::{Pose, PoseConfig};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize as a `PoseConfig`
    pub fn serialize<S: Serializer>(pose: &Pose, serializer: S) -> Result<S::Ok, S::Error> {
        PoseConfig::from(pose).serialize(serializer)
    }

    /// Deserialize from a `PoseConfig`
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Pose, D::Error> {
        PoseConfig::deserialize(deserializer).map(Pose::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn planar_offset_ignores_height() {
        let (dx, dy) = planar_offset(&at(0.131, -0.2, 0.9), &at(0.1, -0.19, 0.1));
        assert!((dx - 0.031).abs() < 1e-9);
        assert!((dy - 0.01).abs() < 1e-9);
    }

    #[test]
    fn flip_only_for_rotation_about_x() {
        let upright = at(0.0, 0.0, 0.0);
        let yawed = Isometry3::from_parts(
            Translation3::new(0.0, 0.0, 0.0),
            UnitQuaternion::from_euler_angles(0.0, 0.0, FRAC_PI_2),
        );
        let flipped = Isometry3::from_parts(
            Translation3::new(0.0, 0.0, 0.0),
            UnitQuaternion::from_euler_angles(std::f64::consts::PI, 0.0, 0.0),
        );
        assert!(!requires_flip(&upright, 1e-6));
        assert!(!requires_flip(&yawed, 1e-6));
        assert!(requires_flip(&flipped, 1e-6));
        assert!(!requires_flip(&flattened(&flipped), 1e-6));
    }

    #[test]
    fn pose_config_round_trip_keeps_orientation() {
        let config = PoseConfig {
            position: [1.0, 2.0, 3.0],
            orientation: [1.0, 0.0, 0.0, 0.0],
        };
        let pose = Pose::from(config);
        assert!(requires_flip(&pose, 1e-6));
        let back = PoseConfig::from(&pose);
        assert_eq!(back.position, [1.0, 2.0, 3.0]);
        assert!((back.orientation[0].abs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn lowered_moves_only_z() {
        let pose = lowered(&at(1.0, 2.0, 0.5), 0.19);
        assert_eq!(pose.translation.x, 1.0);
        assert!((pose.translation.z - 0.31).abs() < 1e-9);
    }
}
