// src/core/model.rs

// Data model shared by every part of the cell: parts as seen by perception,
// the order -> shipment -> product tree, AGV identities and sensor identities.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::pose::{serde_pose, Pose};

/// Automated guided vehicle a shipment is built on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgvId {
    /// First AGV
    Agv1,
    /// Second AGV
    Agv2,
}

impl AgvId {
    /// Numeric id used by the submission service (1 or 2)
    pub fn number(&self) -> u8 {
        match self {
            AgvId::Agv1 => 1,
            AgvId::Agv2 => 2,
        }
    }
}

impl fmt::Display for AgvId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "agv{}", self.number())
    }
}

/// Where a product has to be placed. `Unassigned` ("any" in order messages)
/// is resolved once, the first time the product is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Destination {
    /// Fixed AGV
    Agv(AgvId),
    /// Any AGV
    Unassigned,
}

impl TryFrom<String> for Destination {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "agv1" => Ok(Destination::Agv(AgvId::Agv1)),
            "agv2" => Ok(Destination::Agv(AgvId::Agv2)),
            "any" | "" => Ok(Destination::Unassigned),
            other => Err(format!("unknown destination '{}'", other)),
        }
    }
}

impl From<Destination> for String {
    fn from(destination: Destination) -> Self {
        match destination {
            Destination::Agv(agv) => agv.to_string(),
            Destination::Unassigned => "any".to_string(),
        }
    }
}

impl Destination {
    /// The concrete AGV, if already assigned
    pub fn agv(&self) -> Option<AgvId> {
        match self {
            Destination::Agv(agv) => Some(*agv),
            Destination::Unassigned => None,
        }
    }
}

impl From<AgvId> for Destination {
    fn from(agv: AgvId) -> Self {
        Destination::Agv(agv)
    }
}

/// What kind of area a sensor watches. Declaration order is the scan
/// priority used when matching parts: storage first, trays last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorRole {
    /// Bins and shelves holding stable parts
    Storage,
    /// Camera above the conveyor pick-up zone
    Conveyor,
    /// Confirmation camera above an AGV tray
    AgvTray(AgvId),
}

/// Sensor identity: role plus the name it is published under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorId {
    /// Area the sensor watches
    pub role: SensorRole,
    /// Topic-like name, e.g. `logical_camera_3`
    pub name: String,
}

impl SensorId {
    /// Storage sensor
    pub fn storage(name: &str) -> Self {
        SensorId { role: SensorRole::Storage, name: name.to_string() }
    }

    /// Conveyor camera
    pub fn conveyor(name: &str) -> Self {
        SensorId { role: SensorRole::Conveyor, name: name.to_string() }
    }

    /// Tray confirmation camera of an AGV
    pub fn tray(agv: AgvId, name: &str) -> Self {
        SensorId { role: SensorRole::AgvTray(agv), name: name.to_string() }
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A physical part as reported by perception
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    /// Part type, e.g. `pulley_part_red`
    pub part_type: String,
    /// World pose
    pub pose: Pose,
    /// Set once the part has been matched and picked
    pub consumed: bool,
}

impl Part {
    /// Fresh, unconsumed part
    pub fn new(part_type: &str, pose: Pose) -> Self {
        Part { part_type: part_type.to_string(), pose, consumed: false }
    }
}

/// One entry of a perception snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Sensor that saw the part
    pub sensor: SensorId,
    /// Index of the part within that sensor's report
    pub slot: usize,
    /// Observed part type
    pub part_type: String,
    /// Observed world pose
    pub pose: Pose,
}

/// A product a shipment requires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRequirement {
    /// Required part type
    #[serde(rename = "type")]
    pub part_type: String,
    /// Target pose relative to the AGV tray
    #[serde(with = "serde_pose")]
    pub target_pose: Pose,
    /// AGV the product goes to
    #[serde(default = "unassigned")]
    pub destination: Destination,
}

fn unassigned() -> Destination {
    Destination::Unassigned
}

impl ProductRequirement {
    /// Requirement with an explicit destination
    pub fn new(part_type: &str, target_pose: Pose, destination: Destination) -> Self {
        ProductRequirement { part_type: part_type.to_string(), target_pose, destination }
    }
}

/// Ordered products delivered together on one AGV
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    /// Label passed to the submission service
    pub label: String,
    /// Products in declared order
    pub products: Vec<ProductRequirement>,
}

/// An order as received from the order channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier, e.g. `order_0`
    pub id: String,
    /// Shipments in declared order
    pub shipments: Vec<Shipment>,
}

/// Gripper arms of the gantry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arm {
    /// Arm used for every regular pick
    Left,
    /// Arm that receives the part during a flip
    Right,
}

impl Arm {
    /// Name used by the motion layer
    pub fn as_str(&self) -> &'static str {
        match self {
            Arm::Left => "left_arm",
            Arm::Right => "right_arm",
        }
    }
}
