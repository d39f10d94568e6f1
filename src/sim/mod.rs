// src/sim/mod.rs

//! Deterministic in-process workcell.
//!
//! `SimCell` plays every collaborator the scheduler talks to: cameras and
//! breakbeam, the gantry with its two grippers, the quality sensors and
//! the submission service. All handles share one state, so a test keeps a
//! clone to inspect trays, bins and submissions after a run. The conveyor
//! delivers one part per breakbeam edge and holds it under the pick-up
//! camera until it is gripped.

pub mod scenario;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::mpsc::Sender;

pub use scenario::{Injection, Scenario, StorageBin, StoredPart};

use crate::CellConfig;
use crate::core::{AgvId, Arm, CancelToken, Observation, Order, Part, Pose, SensorId, at};
use crate::interfaces::{
    GripState, Motion, MotionError, Perception, Placement, Quality, QualityReading, Submission, SubmissionResponse,
    Target,
};
use crate::scheduler::FulfillmentScheduler;

/// Scheduler wired to a simulated cell
pub type SimScheduler = FulfillmentScheduler<SimCell, SimCell, SimCell, SimCell>;

/// Name of the camera above the conveyor pick-up zone
pub const BELT_CAMERA: &str = "logical_camera_belt";

/// Planar distance under which a pick finds a part
const PICK_RADIUS: f64 = 0.01;
const SLOT_PITCH: f64 = 0.15;

#[derive(Debug, Clone)]
struct SimPart {
    part_type: String,
    pose: Pose,
    faulty: bool,
}

#[derive(Debug)]
struct Bin {
    base_x: f64,
    slots: Vec<Option<SimPart>>,
}

impl Bin {
    fn next_pose(&self) -> Pose {
        at(self.base_x, SLOT_PITCH * self.slots.len() as f64, 0.72)
    }
}

/// Submission as the service saw it
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedShipment {
    /// AGV sent off
    pub agv: AgvId,
    /// Shipment label
    pub label: String,
    /// Accepted
    pub success: bool,
    /// Part types on the tray at that moment
    pub tray: Vec<String>,
}

#[derive(Debug, Default)]
struct SimState {
    bins: BTreeMap<String, Bin>,
    belt_queue: VecDeque<SimPart>,
    beam_occupied: bool,
    on_belt: Option<SimPart>,
    trays: HashMap<AgvId, Vec<SimPart>>,
    tray_frames: HashMap<AgvId, Pose>,
    left: Option<SimPart>,
    right: Option<SimPart>,
    location: String,
    placements: usize,
    offsets: VecDeque<[f64; 2]>,
    grip_failures: u32,
    rejected: Vec<String>,
    injections: Vec<Injection>,
    initial_orders: Vec<Order>,
    inbox: Option<Sender<Order>>,
    cancel_after: Option<(usize, CancelToken)>,
    bin_drops: HashMap<String, String>,
    discard_location: String,
    discarded: Vec<String>,
    submissions: Vec<SubmittedShipment>,
}

impl SimState {
    fn bin_mut(&mut self, sensor: &str) -> &mut Bin {
        let base_x = 1.0 + 0.5 * self.bins.len() as f64;
        self.bins
            .entry(sensor.to_string())
            .or_insert_with(|| Bin { base_x, slots: Vec::new() })
    }

    /// Remove and return the part at `pose`, wherever it is
    fn take_part_at(&mut self, part_type: &str, pose: &Pose) -> Option<SimPart> {
        let near = |candidate: &SimPart| {
            candidate.part_type == part_type
                && (candidate.pose.translation.x - pose.translation.x).abs() < PICK_RADIUS
                && (candidate.pose.translation.y - pose.translation.y).abs() < PICK_RADIUS
        };
        for bin in self.bins.values_mut() {
            if let Some(slot) = bin.slots.iter_mut().find(|slot| slot.as_ref().is_some_and(near)) {
                return slot.take();
            }
        }
        for tray in self.trays.values_mut() {
            if let Some(index) = tray.iter().position(near) {
                return Some(tray.remove(index));
            }
        }
        if self.on_belt.as_ref().is_some_and(near) {
            return self.on_belt.take();
        }
        None
    }

    fn after_placement(&mut self) {
        self.placements += 1;
        let due: Vec<Injection> = self
            .injections
            .iter()
            .filter(|injection| injection.after_placements == self.placements)
            .cloned()
            .collect();
        for injection in due {
            log::info!("[sim] order {} arrives", injection.order.id);
            if let Some(inbox) = &self.inbox {
                if let Err(lost) = inbox.send(injection.order) {
                    log::warn!("[sim] order {} dropped, the scheduler is gone", lost.0.id);
                }
            }
        }
        if let Some((after, token)) = &self.cancel_after {
            if self.placements >= *after {
                log::info!("[sim] stop requested after {} placements", self.placements);
                token.cancel();
            }
        }
    }
}

/// Shared handle on the simulated cell
#[derive(Debug, Clone)]
pub struct SimCell {
    state: Rc<RefCell<SimState>>,
}

impl SimCell {
    /// Cell laid out per `config` and stocked per `scenario`
    pub fn new(config: &CellConfig, scenario: &Scenario) -> Self {
        let mut state = SimState {
            location: config.motion.home_location.clone(),
            discard_location: config.verification.discard_location.clone(),
            offsets: scenario.placement_offsets.iter().copied().collect(),
            grip_failures: scenario.grip_failures,
            rejected: scenario.rejected_shipments.clone(),
            injections: scenario.injections.clone(),
            initial_orders: scenario.orders.clone(),
            ..SimState::default()
        };
        for agv in [AgvId::Agv1, AgvId::Agv2] {
            state.tray_frames.insert(agv, Pose::from(config.station(agv).tray_frame));
            state.trays.insert(agv, Vec::new());
        }
        for route in config.belt.routes.iter().chain(std::iter::once(&config.belt.default_route)) {
            state.bin_drops.insert(route.bin_location.clone(), route.bin_sensor.clone());
        }
        for stored in &scenario.storage {
            for part in &stored.parts {
                let bin = state.bin_mut(&stored.sensor);
                let pose = part.pose.map(Pose::from).unwrap_or_else(|| bin.next_pose());
                bin.slots.push(Some(SimPart { part_type: part.part_type.clone(), pose, faulty: part.faulty }));
            }
        }
        state.belt_queue = scenario
            .belt
            .iter()
            .map(|part_type| SimPart { part_type: part_type.clone(), pose: at(0.0, 3.0, 0.9), faulty: false })
            .collect();
        SimCell { state: Rc::new(RefCell::new(state)) }
    }

    /// Scheduler driving this cell, with the scenario's initial orders
    /// received and injections routed to its inbox
    pub fn scheduler(&self, config: CellConfig) -> SimScheduler {
        let mut scheduler = FulfillmentScheduler::new(config, self.clone(), self.clone(), self.clone(), self.clone());
        let orders = {
            let mut state = self.state.borrow_mut();
            state.inbox = Some(scheduler.order_sender());
            std::mem::take(&mut state.initial_orders)
        };
        for order in orders {
            scheduler.receive_order(order);
        }
        scheduler
    }

    /// Request a stop through `token` once `placements` parts were put down
    pub fn cancel_after(&self, placements: usize, token: CancelToken) {
        self.state.borrow_mut().cancel_after = Some((placements, token));
    }

    /// Every submission, in order
    pub fn submissions(&self) -> Vec<SubmittedShipment> {
        self.state.borrow().submissions.clone()
    }

    /// Part types currently on an AGV tray
    pub fn tray_types(&self, agv: AgvId) -> Vec<String> {
        self.state
            .borrow()
            .trays
            .get(&agv)
            .map(|tray| tray.iter().map(|part| part.part_type.clone()).collect())
            .unwrap_or_default()
    }

    /// Types dropped at the discard location
    pub fn discarded(&self) -> Vec<String> {
        self.state.borrow().discarded.clone()
    }

    /// Placements so far, re-placements included
    pub fn placements(&self) -> usize {
        self.state.borrow().placements
    }

    /// Parts of a type left in storage
    pub fn stored(&self, part_type: &str) -> usize {
        self.state
            .borrow()
            .bins
            .values()
            .flat_map(|bin| bin.slots.iter().flatten())
            .filter(|part| part.part_type == part_type)
            .count()
    }

    /// Parts the belt has not delivered yet
    pub fn belt_remaining(&self) -> usize {
        self.state.borrow().belt_queue.len()
    }
}

impl Perception for SimCell {
    fn snapshot(&self) -> Vec<Observation> {
        let state = self.state.borrow();
        let mut observations = Vec::new();
        for (name, bin) in &state.bins {
            for (slot, part) in bin.slots.iter().enumerate() {
                if let Some(part) = part {
                    observations.push(Observation {
                        sensor: SensorId::storage(name),
                        slot,
                        part_type: part.part_type.clone(),
                        pose: part.pose,
                    });
                }
            }
        }
        if let Some(part) = &state.on_belt {
            observations.push(Observation {
                sensor: SensorId::conveyor(BELT_CAMERA),
                slot: 0,
                part_type: part.part_type.clone(),
                pose: part.pose,
            });
        }
        for (agv, tray) in &state.trays {
            let camera = format!("logical_camera_{}", agv);
            for (slot, part) in tray.iter().enumerate() {
                observations.push(Observation {
                    sensor: SensorId::tray(*agv, &camera),
                    slot,
                    part_type: part.part_type.clone(),
                    pose: part.pose,
                });
            }
        }
        observations
    }

    fn conveyor_occupied(&self) -> bool {
        let mut state = self.state.borrow_mut();
        if state.on_belt.is_some() || state.belt_queue.is_empty() {
            return false;
        }
        if state.beam_occupied {
            // Part cleared the beam and reached the pick-up zone
            state.beam_occupied = false;
            state.on_belt = state.belt_queue.pop_front();
            false
        } else {
            state.beam_occupied = true;
            true
        }
    }
}

impl Motion for SimCell {
    fn move_to(&mut self, target: &Target) -> Result<(), MotionError> {
        let mut state = self.state.borrow_mut();
        state.location = match target {
            Target::Named(name) => name.clone(),
            Target::Pose(_) => "free_pose".to_string(),
        };
        Ok(())
    }

    fn pick(&mut self, part: &Part) -> Result<(), MotionError> {
        let mut state = self.state.borrow_mut();
        if let Some(held) = &state.left {
            return Err(MotionError(format!("left gripper already holds {}", held.part_type)));
        }
        if state.grip_failures > 0 {
            state.grip_failures -= 1;
            log::debug!("[sim] grip on {} slipped", part.part_type);
            return Ok(());
        }
        match state.take_part_at(&part.part_type, &part.pose) {
            Some(found) => {
                state.left = Some(found);
                Ok(())
            }
            None => Err(MotionError(format!(
                "no {} at ({:.3}, {:.3})",
                part.part_type, part.pose.translation.x, part.pose.translation.y
            ))),
        }
    }

    fn place(&mut self, placement: &Placement, agv: AgvId) -> Result<(), MotionError> {
        let mut state = self.state.borrow_mut();
        let held = match placement.arm {
            Arm::Left => state.left.take(),
            Arm::Right => state.right.take(),
        };
        let Some(mut part) = held else {
            return Err(MotionError(format!("{} holds nothing", placement.arm.as_str())));
        };
        let [dx, dy] = state.offsets.pop_front().unwrap_or([0.0, 0.0]);
        let mut tray_pose = placement.tray_pose;
        tray_pose.translation.x += dx;
        tray_pose.translation.y += dy;
        let frame = state.tray_frames.get(&agv).copied().unwrap_or_else(Pose::identity);
        part.pose = frame * tray_pose;
        state.trays.entry(agv).or_default().push(part);
        state.after_placement();
        Ok(())
    }

    fn activate_gripper(&mut self, arm: Arm) -> Result<(), MotionError> {
        let mut state = self.state.borrow_mut();
        match arm {
            Arm::Left if state.left.is_none() => {
                if state.grip_failures > 0 && state.on_belt.is_some() {
                    state.grip_failures -= 1;
                } else {
                    state.left = state.on_belt.take();
                }
            }
            Arm::Right if state.right.is_none() => state.right = state.left.take(),
            _ => {}
        }
        Ok(())
    }

    fn release(&mut self, arm: Arm) -> Result<(), MotionError> {
        let mut state = self.state.borrow_mut();
        let dropped = match arm {
            Arm::Left => state.left.take(),
            Arm::Right => state.right.take(),
        };
        let Some(mut part) = dropped else {
            return Ok(());
        };
        let location = state.location.clone();
        if location == state.discard_location {
            log::debug!("[sim] {} discarded", part.part_type);
            state.discarded.push(part.part_type);
        } else if let Some(sensor) = state.bin_drops.get(&location).cloned() {
            let bin = state.bin_mut(&sensor);
            part.pose = bin.next_pose();
            bin.slots.push(Some(part));
        } else {
            log::warn!("[sim] {} dropped at {}", part.part_type, location);
        }
        Ok(())
    }

    fn grip_state(&self, arm: Arm) -> GripState {
        let state = self.state.borrow();
        let attached = match arm {
            Arm::Left => state.left.is_some(),
            Arm::Right => state.right.is_some(),
        };
        GripState { attached }
    }
}

impl Quality for SimCell {
    fn inspect(&self, agv: AgvId) -> QualityReading {
        let state = self.state.borrow();
        let faulty = state.trays.get(&agv).is_some_and(|tray| tray.iter().any(|part| part.faulty));
        QualityReading { faulty }
    }
}

impl Submission for SimCell {
    fn submit(&mut self, agv: AgvId, shipment_label: &str) -> SubmissionResponse {
        let mut state = self.state.borrow_mut();
        let success = !state.rejected.iter().any(|label| label == shipment_label);
        let tray = state
            .trays
            .get(&agv)
            .map(|tray| tray.iter().map(|part| part.part_type.clone()).collect())
            .unwrap_or_default();
        state.submissions.push(SubmittedShipment { agv, label: shipment_label.to_string(), success, tray });
        if success {
            // AGV leaves and comes back empty
            state.trays.insert(agv, Vec::new());
            SubmissionResponse { success, message: String::new() }
        } else {
            SubmissionResponse { success, message: format!("{} rejected", shipment_label) }
        }
    }
}
