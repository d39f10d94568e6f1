// src/sim/scenario.rs
// YAML description of a simulated shift: what sits in storage, what the
// belt will deliver, the orders and the disturbances to inject.

use std::fs::File;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::KittingError;
use crate::core::{Order, PoseConfig};

/// A part lying in a storage bin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPart {
    /// Part type
    #[serde(rename = "type")]
    pub part_type: String,
    /// World pose; laid out on the bin grid when omitted
    #[serde(default)]
    pub pose: Option<PoseConfig>,
    /// Fails quality inspection once placed
    #[serde(default)]
    pub faulty: bool,
}

impl StoredPart {
    /// Good part at an automatic position
    pub fn new(part_type: &str) -> Self {
        StoredPart { part_type: part_type.to_string(), pose: None, faulty: false }
    }

    /// Part that fails inspection
    pub fn faulty(part_type: &str) -> Self {
        StoredPart { faulty: true, ..StoredPart::new(part_type) }
    }
}

/// Contents of one storage bin and the camera above it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageBin {
    /// Camera watching the bin
    pub sensor: String,
    /// Parts in slot order
    pub parts: Vec<StoredPart>,
}

impl StorageBin {
    /// Bin holding one good part per listed type
    pub fn with_types(sensor: &str, types: &[&str]) -> Self {
        StorageBin { sensor: sensor.to_string(), parts: types.iter().map(|t| StoredPart::new(t)).collect() }
    }
}

/// An order that shows up while the cell is busy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Injection {
    /// Sent right after this many placements
    pub after_placements: usize,
    /// The order
    pub order: Order,
}

/// A complete simulated shift
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    /// Storage bins
    pub storage: Vec<StorageBin>,
    /// Part types the conveyor delivers, in order
    pub belt: Vec<String>,
    /// Orders known at start
    pub orders: Vec<Order>,
    /// Orders arriving mid-run
    pub injections: Vec<Injection>,
    /// Planar error `[dx, dy]` of successive placements, in tray coordinates
    pub placement_offsets: Vec<[f64; 2]>,
    /// Pick attempts that fail to attach before the gripper starts working
    pub grip_failures: u32,
    /// Shipment labels the submission service refuses
    pub rejected_shipments: Vec<String>,
}

impl Scenario {
    /// Load a scenario file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, KittingError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| KittingError::Config(format!("{}: {}", path.display(), e)))?;
        let scenario: Scenario = serde_yaml::from_reader(file)?;
        log::info!(
            "Scenario {} loaded: {} order(s), {} storage bin(s), {} belt part(s)",
            path.display(),
            scenario.orders.len(),
            scenario.storage.len(),
            scenario.belt.len()
        );
        Ok(scenario)
    }

    /// Parse a scenario from YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self, KittingError> {
        Ok(serde_yaml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AgvId, Destination};

    #[test]
    fn parses_orders_and_disturbances() {
        let scenario = Scenario::from_yaml_str(
            r#"
storage:
  - sensor: logical_camera_1
    parts:
      - type: gear_part
      - type: gear_part
        faulty: true
belt: [pulley_part_red]
orders:
  - id: order_0
    shipments:
      - label: order_0_shipment_0
        products:
          - type: gear_part
            target_pose: { position: [0.1, 0.1, 0.0] }
            destination: agv2
          - type: pulley_part_red
            target_pose: { position: [-0.1, 0.1, 0.0] }
            destination: any
placement_offsets: [[0.05, 0.0]]
rejected_shipments: [order_0_shipment_0]
"#,
        )
        .unwrap();

        assert_eq!(scenario.storage[0].parts.len(), 2);
        assert!(scenario.storage[0].parts[1].faulty);
        assert_eq!(scenario.belt, vec!["pulley_part_red".to_string()]);
        let products = &scenario.orders[0].shipments[0].products;
        assert_eq!(products[0].destination, Destination::Agv(AgvId::Agv2));
        assert_eq!(products[1].destination, Destination::Unassigned);
        assert_eq!(products[1].target_pose.translation.x, -0.1);
        assert_eq!(scenario.placement_offsets, vec![[0.05, 0.0]]);
        assert!(scenario.injections.is_empty());
        assert_eq!(scenario.grip_failures, 0);
    }
}
