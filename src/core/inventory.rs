// src/core/inventory.rs

// Point-in-time view of every part the cameras report, keyed by sensor and
// slot. Refreshing builds a new map from the latest perception snapshot and
// swaps it in; consumed flags survive only where the same part type is still
// seen in the same slot.

use std::collections::{BTreeMap, HashMap};

use super::model::{AgvId, Observation, Part, SensorId, SensorRole};
use crate::interfaces::Perception;

/// Key of an inventory entry
pub type SlotKey = (SensorId, usize);

/// A part chosen to supply a product
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPart {
    /// Sensor that reported the part
    pub sensor: SensorId,
    /// Slot within the sensor report
    pub slot: usize,
    /// The part itself
    pub part: Part,
}

/// Inventory snapshot owned by the control loop
#[derive(Debug, Clone, Default)]
pub struct InventorySnapshot {
    entries: BTreeMap<SlotKey, Part>,
    generation: u64,
}

impl InventorySnapshot {
    /// Empty snapshot
    pub fn new() -> Self {
        InventorySnapshot::default()
    }

    /// Pull the latest observations from perception and swap them in
    pub fn refresh<P: Perception + ?Sized>(&mut self, perception: &P) {
        self.apply(perception.snapshot());
    }

    /// Replace the snapshot with `observations`, carrying over consumed
    /// flags of slots whose part type is unchanged.
    pub fn apply(&mut self, observations: Vec<Observation>) {
        let mut next = BTreeMap::new();
        for obs in observations {
            if obs.part_type.is_empty() {
                continue;
            }
            let key = (obs.sensor, obs.slot);
            let consumed = self
                .entries
                .get(&key)
                .map(|old| old.consumed && old.part_type == obs.part_type)
                .unwrap_or(false);
            next.insert(
                key,
                Part { part_type: obs.part_type, pose: obs.pose, consumed },
            );
        }
        self.entries = next;
        self.generation += 1;
        log::debug!("Inventory refreshed: {} parts (generation {})", self.entries.len(), self.generation);
    }

    /// First unconsumed pickable part of `part_type`. Sensors are scanned
    /// storage first, then conveyor, each in name and slot order; tray
    /// cameras only show placed products and are never offered.
    pub fn find_match(&self, part_type: &str) -> Option<MatchedPart> {
        self.entries
            .iter()
            .filter(|((sensor, _), _)| is_pickable(sensor.role))
            .find(|(_, part)| !part.consumed && part.part_type == part_type)
            .map(|((sensor, slot), part)| MatchedPart {
                sensor: sensor.clone(),
                slot: *slot,
                part: part.clone(),
            })
    }

    /// Like `find_match`, but looks at one named sensor first
    pub fn find_match_preferring(&self, part_type: &str, sensor_name: Option<&str>) -> Option<MatchedPart> {
        let preferred = sensor_name.and_then(|name| {
            self.entries
                .iter()
                .filter(|((sensor, _), _)| sensor.name == name && is_pickable(sensor.role))
                .find(|(_, part)| !part.consumed && part.part_type == part_type)
                .map(|((sensor, slot), part)| MatchedPart {
                    sensor: sensor.clone(),
                    slot: *slot,
                    part: part.clone(),
                })
        });
        preferred.or_else(|| self.find_match(part_type))
    }

    /// One-way transition to consumed. Returns false for unknown slots.
    pub fn mark_consumed(&mut self, sensor: &SensorId, slot: usize) -> bool {
        match self.entries.get_mut(&(sensor.clone(), slot)) {
            Some(part) => {
                part.consumed = true;
                true
            }
            None => false,
        }
    }

    /// Unconsumed storage parts per type, used to decide which products
    /// have to come off the conveyor
    pub fn storage_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for ((sensor, _), part) in &self.entries {
            if sensor.role == SensorRole::Storage && !part.consumed {
                *counts.entry(part.part_type.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Parts the conveyor camera currently sees, in slot order
    pub fn conveyor_parts(&self) -> Vec<(SensorId, usize, Part)> {
        self.entries
            .iter()
            .filter(|((sensor, _), _)| sensor.role == SensorRole::Conveyor)
            .map(|((sensor, slot), part)| (sensor.clone(), *slot, part.clone()))
            .collect()
    }

    /// Parts a tray camera sees on the given AGV
    pub fn tray_parts(&self, agv: AgvId) -> Vec<&Part> {
        self.entries
            .iter()
            .filter(|((sensor, _), _)| sensor.role == SensorRole::AgvTray(agv))
            .map(|(_, part)| part)
            .collect()
    }

    /// Entry at a slot
    pub fn get(&self, sensor: &SensorId, slot: usize) -> Option<&Part> {
        self.entries.get(&(sensor.clone(), slot))
    }

    /// Number of parts in the snapshot
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no part is seen
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_pickable(role: SensorRole) -> bool {
    matches!(role, SensorRole::Storage | SensorRole::Conveyor)
}
