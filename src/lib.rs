//! Gantry kitting cell orchestration
//!
//! This library drives a two-armed gantry robot through a stream of kitting
//! orders: it matches required parts against what the cameras see, pulls
//! parts off the conveyor before they pass out of reach, places them on AGV
//! trays, checks every placement for faults and pose errors, and submits
//! each finished shipment.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

pub mod conveyor;
pub mod core;
pub mod events;
pub mod interfaces;
#[cfg(feature = "ros")]
pub mod ros_interface;
pub mod scheduler;
pub mod sim;
pub mod verification;

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

// Re-export commonly used items for easier access
pub use conveyor::{BeltConfig, BeltFeedCoordinator};
pub use crate::core::{AgvId, CancelToken, InventorySnapshot, Order, OrderStore, Shipment};
pub use events::{EventSink, FulfillmentEvent, LogSink, RecordingSink};
pub use interfaces::{Motion, MotionError, Perception, Quality, Submission};
pub use scheduler::{AgvStation, FulfillmentScheduler, MotionConfig, RunSummary, SchedulerConfig};
pub use verification::{PlacementVerifier, VerificationConfig, Verdict};

use crate::core::WaitPolicy;

/// Bound on every sensor wait in a simulated run
pub const SIM_WAIT_MS: u64 = 50;

/// Configuration of the whole cell, loaded from YAML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellConfig {
    /// Placement checks and fault handling
    pub verification: VerificationConfig,
    /// First AGV station
    pub agv1: AgvStation,
    /// Second AGV station
    pub agv2: AgvStation,
    /// Conveyor extraction
    pub belt: BeltConfig,
    /// Manipulator timings
    pub motion: MotionConfig,
    /// Control loop
    pub scheduler: SchedulerConfig,
}

impl Default for CellConfig {
    fn default() -> Self {
        CellConfig {
            verification: VerificationConfig::default(),
            agv1: AgvStation::for_agv(AgvId::Agv1),
            agv2: AgvStation::for_agv(AgvId::Agv2),
            belt: BeltConfig::default(),
            motion: MotionConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl CellConfig {
    /// Load a configuration file. Missing sections and fields keep their defaults.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, KittingError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| KittingError::Config(format!("{}: {}", path.display(), e)))?;
        let config: CellConfig = serde_yaml::from_reader(file)?;
        log::info!("Cell configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Parse a configuration from YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self, KittingError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Station settings of an AGV
    pub fn station(&self, agv: AgvId) -> &AgvStation {
        match agv {
            AgvId::Agv1 => &self.agv1,
            AgvId::Agv2 => &self.agv2,
        }
    }

    /// Same configuration shortened for simulation. Settle times become
    /// zero, sensor waits poll without sleeping and give up after
    /// `SIM_WAIT_MS`.
    pub fn without_pauses(mut self) -> Self {
        self.verification.settle_ms = 0;
        self.motion.settle_ms = 0;
        self.motion.grip_wait = WaitPolicy::new(SIM_WAIT_MS, 0);
        self.belt.grip_settle_ms = 0;
        self.belt.arrival = WaitPolicy::new(SIM_WAIT_MS, 0);
        self.belt.detection = WaitPolicy::new(SIM_WAIT_MS, 0);
        self.scheduler.idle_backoff_ms = 0;
        self
    }
}

/// Kitting error types
#[derive(Debug, Clone, PartialEq)]
pub enum KittingError {
    /// No unconsumed part of the required type is visible
    MatchNotFound(String),
    /// Gripper did not attach within its retry bound
    PickFailed(String),
    /// Placed part failed quality inspection
    VerifiedFaulty(String),
    /// Placed part is outside the pose tolerance
    PoseDeviation(String),
    /// Submission service refused a shipment
    SubmissionFailed(String),
    /// Order, shipment or product index out of range
    IndexError(String),
    /// Bounded wait expired
    Timeout(String),
    /// Stop requested
    Cancelled,
    /// Motion collaborator reported a failure
    Motion(String),
    /// Configuration or scenario error
    Config(String),
}

impl std::fmt::Display for KittingError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            KittingError::MatchNotFound(part_type) => write!(f, "No match for part type: {}", part_type),
            KittingError::PickFailed(msg) => write!(f, "Pick failed: {}", msg),
            KittingError::VerifiedFaulty(msg) => write!(f, "Faulty part: {}", msg),
            KittingError::PoseDeviation(msg) => write!(f, "Pose deviation: {}", msg),
            KittingError::SubmissionFailed(msg) => write!(f, "Submission failed: {}", msg),
            KittingError::IndexError(msg) => write!(f, "Index error: {}", msg),
            KittingError::Timeout(what) => write!(f, "Timed out waiting for {}", what),
            KittingError::Cancelled => write!(f, "Cancelled"),
            KittingError::Motion(msg) => write!(f, "Motion error: {}", msg),
            KittingError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for KittingError {}

impl From<MotionError> for KittingError {
    fn from(error: MotionError) -> Self {
        KittingError::Motion(error.0)
    }
}

impl From<serde_yaml::Error> for KittingError {
    fn from(error: serde_yaml::Error) -> Self {
        KittingError::Config(error.to_string())
    }
}

impl From<std::io::Error> for KittingError {
    fn from(error: std::io::Error) -> Self {
        KittingError::Config(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config = CellConfig::from_yaml_str(
            "verification:\n  pose_tolerance: 0.05\nagv2:\n  station: agv2_far\n",
        )
        .unwrap();
        assert_eq!(config.verification.pose_tolerance, 0.05);
        assert_eq!(config.verification.discard_location, "agv_faulty");
        assert_eq!(config.agv2.station, "agv2_far");
        assert!(config.agv2.flip_waypoints.is_empty());
        assert_eq!(config.agv1, AgvStation::for_agv(AgvId::Agv1));
        assert_eq!(config.belt.max_grip_attempts, 5);
    }

    #[test]
    fn malformed_yaml_is_a_config_error() {
        let result = CellConfig::from_yaml_str("scheduler: [1, 2");
        assert!(matches!(result, Err(KittingError::Config(_))));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let result = CellConfig::from_yaml_file("does/not/exist.yaml");
        assert!(matches!(result, Err(KittingError::Config(_))));
    }

    #[test]
    fn simulation_waits_are_short_and_sleepless() {
        let config = CellConfig::default().without_pauses();
        for wait in [config.motion.grip_wait, config.belt.arrival, config.belt.detection] {
            assert_eq!(wait, WaitPolicy::new(SIM_WAIT_MS, 0));
        }
        assert_eq!(config.motion.settle_ms, 0);
        assert_eq!(config.scheduler.idle_backoff_ms, 0);
    }

    #[test]
    fn motion_errors_convert() {
        let error: KittingError = MotionError("joint limit".to_string()).into();
        assert_eq!(error.to_string(), "Motion error: joint limit");
    }
}
