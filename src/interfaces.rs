// src/interfaces.rs

//! Collaborators the orchestration core drives but does not implement:
//! perception, gantry motion, quality inspection and shipment submission.
//! Every call blocks until its action finishes; failures come back as
//! values, never as silent no-ops.

use std::fmt;

use crate::core::{AgvId, Arm, Observation, Part, Pose};

/// Where the gantry should go
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Preset location known to the motion layer, e.g. `agv1` or `bin9`
    Named(String),
    /// Arbitrary world pose
    Pose(Pose),
}

impl Target {
    /// Preset location by name
    pub fn named(name: &str) -> Self {
        Target::Named(name.to_string())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Target::Named(name) => write!(f, "{}", name),
            Target::Pose(pose) => write!(
                f,
                "({:.3}, {:.3}, {:.3})",
                pose.translation.x, pose.translation.y, pose.translation.z
            ),
        }
    }
}

/// A placement request for the motion layer
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    /// Type of the part being placed
    pub part_type: String,
    /// Pose relative to the AGV tray
    pub tray_pose: Pose,
    /// Arm holding the part
    pub arm: Arm,
}

/// Gripper feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GripState {
    /// A part is attached to the gripper
    pub attached: bool,
}

/// Quality sensor reading for one AGV tray
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QualityReading {
    /// A faulty part lies on the tray
    pub faulty: bool,
}

/// Response of the submission service
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubmissionResponse {
    /// The shipment was accepted
    pub success: bool,
    /// Service message, usually the failure reason
    pub message: String,
}

/// Failure reported by the motion layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionError(pub String);

impl fmt::Display for MotionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MotionError {}

/// Camera and breakbeam input, read as latest snapshot
#[cfg_attr(test, mockall::automock)]
pub trait Perception {
    /// Every part currently seen by every sensor. Never blocks.
    fn snapshot(&self) -> Vec<Observation>;

    /// True while an object interrupts the conveyor breakbeam
    fn conveyor_occupied(&self) -> bool;
}

/// Gantry motion and grippers
#[cfg_attr(test, mockall::automock)]
pub trait Motion {
    /// Move to a preset location or a pose
    fn move_to(&mut self, target: &Target) -> Result<(), MotionError>;

    /// Approach and grasp a part with the left arm
    fn pick(&mut self, part: &Part) -> Result<(), MotionError>;

    /// Put the held part down on an AGV tray
    fn place(&mut self, placement: &Placement, agv: AgvId) -> Result<(), MotionError>;

    /// Switch a gripper on
    fn activate_gripper(&mut self, arm: Arm) -> Result<(), MotionError>;

    /// Switch a gripper off, dropping whatever it holds
    fn release(&mut self, arm: Arm) -> Result<(), MotionError>;

    /// Current gripper feedback
    fn grip_state(&self, arm: Arm) -> GripState;
}

/// Quality inspection of AGV trays
#[cfg_attr(test, mockall::automock)]
pub trait Quality {
    /// Read the quality sensor above the given AGV
    fn inspect(&self, agv: AgvId) -> QualityReading;
}

/// Remote shipment finalization
#[cfg_attr(test, mockall::automock)]
pub trait Submission {
    /// Send the AGV off with the named shipment
    fn submit(&mut self, agv: AgvId, shipment_label: &str) -> SubmissionResponse;
}
