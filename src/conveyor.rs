// src/conveyor.rs

//! Belt feed coordinator.
//!
//! Parts that storage cannot supply arrive one at a time on the conveyor.
//! They pass out of reach, so the scheduler hands control to this module
//! before any storage pick while the belt still owes parts for the current
//! batch. Each extraction waits for the breakbeam to see the part pass,
//! waits for the pick-up camera to confirm it, grips it with a bounded
//! number of attempts and drops it into a staging bin chosen by part type.

use serde::{Deserialize, Serialize};

use crate::KittingError;
use crate::core::{Arm, CancelToken, Observation, ProductRef, SensorRole, WaitPolicy, settle};
use crate::interfaces::{Motion, Perception, Target};

/// Where parts of one type family are staged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeltRoute {
    /// Part types starting with this prefix take the route
    pub type_prefix: String,
    /// Gripping position above the pick-up zone for this family
    pub approach: String,
    /// Staging bin location the part is dropped at
    pub bin_location: String,
    /// Storage sensor watching that bin
    pub bin_sensor: String,
}

/// Conveyor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeltConfig {
    /// Waiting position next to the belt
    pub pickup_location: String,
    /// Type-keyed staging routes, first matching prefix wins
    pub routes: Vec<BeltRoute>,
    /// Route for types no prefix matches
    pub default_route: BeltRoute,
    /// Gripper activations before giving up on a belt part
    pub max_grip_attempts: u32,
    /// Pause after each gripper activation
    pub grip_settle_ms: u64,
    /// Bound on each breakbeam edge wait
    pub arrival: WaitPolicy,
    /// Bound on the pick-up camera confirmation
    pub detection: WaitPolicy,
}

impl Default for BeltConfig {
    fn default() -> Self {
        let shaft = BeltRoute {
            type_prefix: "piston_rod_part".to_string(),
            approach: "belt_b1".to_string(),
            bin_location: "bin9".to_string(),
            bin_sensor: "logical_camera_9".to_string(),
        };
        let pulley = BeltRoute {
            type_prefix: "pulley_part".to_string(),
            approach: "belt_b2".to_string(),
            bin_location: "bin14".to_string(),
            bin_sensor: "logical_camera_14".to_string(),
        };
        BeltConfig {
            pickup_location: "belt_a".to_string(),
            default_route: shaft.clone(),
            routes: vec![shaft, pulley],
            max_grip_attempts: 5,
            grip_settle_ms: 200,
            arrival: WaitPolicy::new(60_000, 10),
            detection: WaitPolicy::new(5_000, 10),
        }
    }
}

/// Extraction state of the single belt slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeltState {
    /// No part expected
    Idle,
    /// Waiting for the breakbeam edge of the next part
    AwaitingArrival,
    /// Camera sees a part that has not been picked
    ArrivedUncaptured,
    /// Part moved to staging, reservation not yet recorded
    Captured,
}

/// A product the current batch sources from the conveyor
#[derive(Debug, Clone, PartialEq)]
pub struct BeltDemand {
    /// Product to supply
    pub product: ProductRef,
    /// Its part type
    pub part_type: String,
}

/// Extraction index -> product it was staged for
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    /// Position in the batch's extraction order
    pub index: usize,
    /// Product the staged part belongs to
    pub product: ProductRef,
    /// Type actually extracted
    pub part_type: String,
    /// Storage sensor of the staging bin
    pub bin_sensor: String,
}

/// Drives conveyor extraction for one batch at a time
#[derive(Debug)]
pub struct BeltFeedCoordinator {
    config: BeltConfig,
    state: BeltState,
    batch: Vec<BeltDemand>,
    extracted: usize,
    reservations: Vec<Reservation>,
    staged: Option<(String, String)>,
}

impl BeltFeedCoordinator {
    /// Idle coordinator
    pub fn new(config: BeltConfig) -> Self {
        BeltFeedCoordinator {
            config,
            state: BeltState::Idle,
            batch: Vec::new(),
            extracted: 0,
            reservations: Vec::new(),
            staged: None,
        }
    }

    /// Start a new batch, dropping the counters of the previous one
    pub fn begin_batch(&mut self, batch: Vec<BeltDemand>) {
        log::info!("Belt batch of {} part(s)", batch.len());
        self.state = if batch.is_empty() { BeltState::Idle } else { BeltState::AwaitingArrival };
        self.batch = batch;
        self.extracted = 0;
        self.reservations.clear();
        self.staged = None;
    }

    /// Parts the belt still owes for this batch
    pub fn owed(&self) -> usize {
        self.batch.len().saturating_sub(self.extracted)
    }

    /// Current extraction state
    pub fn state(&self) -> BeltState {
        self.state
    }

    /// Parts extracted in this batch
    pub fn extracted(&self) -> usize {
        self.extracted
    }

    /// Reservations recorded so far, in extraction order
    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    /// Reservation made for a product, if its part came off the belt
    pub fn reservation_for(&self, product: ProductRef) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.product == product)
    }

    /// Extract parts until the belt owes nothing. Stops at the first error;
    /// the state is left where it failed so a later call resumes there.
    pub fn catch_up<P, M>(&mut self, perception: &P, motion: &mut M, cancel: &CancelToken) -> Result<usize, KittingError>
    where
        P: Perception + ?Sized,
        M: Motion + ?Sized,
    {
        let mut count = 0;
        while self.owed() > 0 {
            self.extract_one(perception, motion, cancel)?;
            count += 1;
        }
        Ok(count)
    }

    /// Run the state machine through one full extraction
    pub fn extract_one<P, M>(
        &mut self,
        perception: &P,
        motion: &mut M,
        cancel: &CancelToken,
    ) -> Result<Reservation, KittingError>
    where
        P: Perception + ?Sized,
        M: Motion + ?Sized,
    {
        if self.state == BeltState::Idle && self.owed() > 0 {
            self.state = BeltState::AwaitingArrival;
        }
        loop {
            match self.state {
                BeltState::Idle => {
                    return Err(KittingError::IndexError("belt batch owes no parts".to_string()));
                }
                BeltState::AwaitingArrival => self.await_arrival(perception, motion, cancel)?,
                BeltState::ArrivedUncaptured => self.capture(perception, motion, cancel)?,
                BeltState::Captured => {
                    return self
                        .record_capture()
                        .ok_or_else(|| KittingError::IndexError("belt part staged with no demand left".to_string()));
                }
            }
        }
    }

    fn await_arrival<P, M>(&mut self, perception: &P, motion: &mut M, cancel: &CancelToken) -> Result<(), KittingError>
    where
        P: Perception + ?Sized,
        M: Motion + ?Sized,
    {
        if conveyor_part(perception).is_none() {
            log::info!("Waiting for part {} of {} on the belt", self.extracted + 1, self.batch.len());
            motion.move_to(&Target::Named(self.config.pickup_location.clone()))?;
            self.config.arrival.wait_until("conveyor breakbeam", cancel, || perception.conveyor_occupied())?;
            self.config.arrival.wait_until("conveyor breakbeam to clear", cancel, || !perception.conveyor_occupied())?;
            self.config
                .detection
                .wait_until("pick-up camera detection", cancel, || conveyor_part(perception).is_some())?;
        }
        self.state = BeltState::ArrivedUncaptured;
        Ok(())
    }

    fn capture<P, M>(&mut self, perception: &P, motion: &mut M, cancel: &CancelToken) -> Result<(), KittingError>
    where
        P: Perception + ?Sized,
        M: Motion + ?Sized,
    {
        let Some(part) = conveyor_part(perception) else {
            self.state = BeltState::AwaitingArrival;
            return Err(KittingError::PickFailed("belt part left the pick-up zone".to_string()));
        };
        let route = self.route_for(&part.part_type).clone();
        log::info!("Picking {} from the belt via {}", part.part_type, route.approach);
        motion.move_to(&Target::Named(route.approach.clone()))?;

        let mut attached = false;
        for attempt in 1..=self.config.max_grip_attempts {
            cancel.check()?;
            motion.activate_gripper(Arm::Left)?;
            settle(self.config.grip_settle_ms, cancel)?;
            if motion.grip_state(Arm::Left).attached {
                attached = true;
                break;
            }
            log::debug!("Grip attempt {} on {} failed", attempt, part.part_type);
        }
        if !attached {
            motion.release(Arm::Left)?;
            return Err(KittingError::PickFailed(format!(
                "{} not attached after {} attempts",
                part.part_type, self.config.max_grip_attempts
            )));
        }

        motion.move_to(&Target::Named(self.config.pickup_location.clone()))?;
        motion.move_to(&Target::Named(route.bin_location.clone()))?;
        motion.release(Arm::Left)?;
        self.staged = Some((part.part_type, route.bin_sensor));
        self.state = BeltState::Captured;
        Ok(())
    }

    fn record_capture(&mut self) -> Option<Reservation> {
        let (part_type, bin_sensor) = self.staged.take()?;
        let unreserved: Vec<&BeltDemand> = self
            .batch
            .iter()
            .filter(|demand| self.reservations.iter().all(|r| r.product != demand.product))
            .collect();
        // First unreserved demand of the extracted type, else the first unreserved one
        let product = unreserved
            .iter()
            .find(|demand| demand.part_type == part_type)
            .or_else(|| unreserved.first())
            .map(|demand| demand.product)?;

        let reservation = Reservation { index: self.extracted, product, part_type, bin_sensor };
        log::info!(
            "Belt extraction {} staged in {} for product {} of shipment {}",
            reservation.index, reservation.bin_sensor, product.product, product.shipment.shipment
        );
        self.reservations.push(reservation.clone());
        self.extracted += 1;
        self.state = if self.owed() > 0 { BeltState::AwaitingArrival } else { BeltState::Idle };
        Some(reservation)
    }

    fn route_for(&self, part_type: &str) -> &BeltRoute {
        self.config
            .routes
            .iter()
            .find(|route| part_type.starts_with(&route.type_prefix))
            .unwrap_or(&self.config.default_route)
    }
}

/// First part the conveyor camera currently reports
fn conveyor_part<P: Perception + ?Sized>(perception: &P) -> Option<Observation> {
    perception
        .snapshot()
        .into_iter()
        .filter(|obs| obs.sensor.role == SensorRole::Conveyor && !obs.part_type.is_empty())
        .min_by_key(|obs| obs.slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OrderKey, SensorId, ShipmentKey, at};
    use crate::interfaces::{GripState, MockMotion, MockPerception};
    use std::sync::{Arc, Mutex};

    /// Belt that delivers `types` in order: each part interrupts the beam
    /// for one poll, then sits under the pick-up camera until released.
    #[derive(Default)]
    struct BeltScript {
        types: Vec<&'static str>,
        polls: usize,
        arrived: usize,
        captured: usize,
    }

    fn product(k: usize) -> ProductRef {
        ProductRef { shipment: ShipmentKey { order: OrderKey(0), shipment: 0 }, product: k }
    }

    fn quick_config() -> BeltConfig {
        BeltConfig {
            grip_settle_ms: 0,
            max_grip_attempts: 3,
            arrival: WaitPolicy::new(200, 0),
            detection: WaitPolicy::new(200, 0),
            ..BeltConfig::default()
        }
    }

    fn scripted_perception(script: Arc<Mutex<BeltScript>>) -> MockPerception {
        let mut perception = MockPerception::new();
        let beam = script.clone();
        perception.expect_conveyor_occupied().returning(move || {
            let mut s = beam.lock().unwrap();
            if s.arrived >= s.types.len() {
                return false;
            }
            let occupied = s.polls % 2 == 0;
            s.polls += 1;
            if !occupied {
                s.arrived += 1;
            }
            occupied
        });
        perception.expect_snapshot().returning(move || {
            let s = script.lock().unwrap();
            if s.arrived > s.captured {
                vec![Observation {
                    sensor: SensorId::conveyor("logical_camera_12"),
                    slot: 0,
                    part_type: s.types[s.captured].to_string(),
                    pose: at(0.0, 3.0, 0.9),
                }]
            } else {
                Vec::new()
            }
        });
        perception
    }

    fn gripping_motion(script: Arc<Mutex<BeltScript>>, attaches: bool) -> MockMotion {
        let mut motion = MockMotion::new();
        motion.expect_move_to().returning(|_| Ok(()));
        motion.expect_activate_gripper().returning(|_| Ok(()));
        motion.expect_grip_state().returning(move |_| GripState { attached: attaches });
        motion.expect_release().returning(move |_| {
            if attaches {
                script.lock().unwrap().captured += 1;
            }
            Ok(())
        });
        motion
    }

    #[test]
    fn extraction_indices_follow_unmet_requirements() {
        let script = Arc::new(Mutex::new(BeltScript {
            types: vec!["pulley_part_red", "piston_rod_part_blue"],
            ..BeltScript::default()
        }));
        let perception = scripted_perception(script.clone());
        let mut motion = gripping_motion(script.clone(), true);

        let mut belt = BeltFeedCoordinator::new(quick_config());
        belt.begin_batch(vec![
            BeltDemand { product: product(0), part_type: "pulley_part_red".to_string() },
            BeltDemand { product: product(2), part_type: "piston_rod_part_blue".to_string() },
        ]);
        assert_eq!(belt.state(), BeltState::AwaitingArrival);

        let count = belt.catch_up(&perception, &mut motion, &CancelToken::new()).unwrap();
        assert_eq!(count, 2);
        assert_eq!(belt.owed(), 0);
        assert_eq!(belt.state(), BeltState::Idle);

        let reservations = belt.reservations();
        assert_eq!(reservations[0].index, 0);
        assert_eq!(reservations[0].product, product(0));
        assert_eq!(reservations[0].bin_sensor, "logical_camera_14");
        assert_eq!(reservations[1].index, 1);
        assert_eq!(reservations[1].product, product(2));
        assert_eq!(reservations[1].bin_sensor, "logical_camera_9");
        assert_eq!(script.lock().unwrap().polls, 4, "one present and one clear edge per part");
    }

    #[test]
    fn out_of_order_delivery_reserves_by_type() {
        let script = Arc::new(Mutex::new(BeltScript {
            types: vec!["piston_rod_part_blue"],
            ..BeltScript::default()
        }));
        let perception = scripted_perception(script.clone());
        let mut motion = gripping_motion(script, true);

        let mut belt = BeltFeedCoordinator::new(quick_config());
        belt.begin_batch(vec![
            BeltDemand { product: product(0), part_type: "pulley_part_red".to_string() },
            BeltDemand { product: product(1), part_type: "piston_rod_part_blue".to_string() },
        ]);
        let reservation = belt.extract_one(&perception, &mut motion, &CancelToken::new()).unwrap();
        assert_eq!(reservation.index, 0);
        assert_eq!(reservation.product, product(1));
        assert_eq!(belt.reservation_for(product(1)), Some(&reservation));
        assert_eq!(belt.owed(), 1);
        assert_eq!(belt.state(), BeltState::AwaitingArrival);
    }

    #[test]
    fn grip_retries_are_bounded() {
        let script = Arc::new(Mutex::new(BeltScript {
            types: vec!["pulley_part_red"],
            ..BeltScript::default()
        }));
        let perception = scripted_perception(script.clone());
        let mut motion = MockMotion::new();
        motion.expect_move_to().returning(|_| Ok(()));
        motion.expect_activate_gripper().times(3).returning(|_| Ok(()));
        motion.expect_grip_state().returning(|_| GripState { attached: false });
        motion.expect_release().times(1).returning(|_| Ok(()));

        let mut belt = BeltFeedCoordinator::new(quick_config());
        belt.begin_batch(vec![BeltDemand { product: product(0), part_type: "pulley_part_red".to_string() }]);
        let result = belt.catch_up(&perception, &mut motion, &CancelToken::new());
        assert!(matches!(result, Err(KittingError::PickFailed(_))));
        assert_eq!(belt.state(), BeltState::ArrivedUncaptured, "part left for a later pass");
        assert_eq!(belt.extracted(), 0);
    }

    #[test]
    fn missing_delivery_times_out() {
        let mut perception = MockPerception::new();
        perception.expect_conveyor_occupied().returning(|| false);
        perception.expect_snapshot().returning(Vec::new);
        let mut motion = MockMotion::new();
        motion.expect_move_to().returning(|_| Ok(()));

        let mut belt = BeltFeedCoordinator::new(quick_config());
        belt.begin_batch(vec![BeltDemand { product: product(0), part_type: "gear_part".to_string() }]);
        let result = belt.catch_up(&perception, &mut motion, &CancelToken::new());
        assert!(matches!(result, Err(KittingError::Timeout(_))));
        assert_eq!(belt.state(), BeltState::AwaitingArrival);
    }

    #[test]
    fn empty_batch_is_idle() {
        let mut belt = BeltFeedCoordinator::new(BeltConfig::default());
        belt.begin_batch(Vec::new());
        assert_eq!(belt.state(), BeltState::Idle);
        assert_eq!(belt.owed(), 0);
    }
}
