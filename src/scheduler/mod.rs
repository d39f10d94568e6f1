// src/scheduler/mod.rs

//! Fulfillment scheduler.
//!
//! One control loop owns the manipulator, the inventory snapshot and the
//! order store. It pops shipments off the work queue and drives each of
//! their pending products through match, pick, transport, place and
//! verification. Products that cannot be supplied right now are skipped
//! rather than waited on; a shipment that makes no progress goes back to
//! the end of the queue. Errors are logged and absorbed per product, only
//! a cancellation request ends a run early.

pub mod routing;
pub mod submission;

use std::collections::HashMap;
use std::sync::mpsc::Sender;

use serde::{Deserialize, Serialize};

use crate::conveyor::{BeltDemand, BeltFeedCoordinator};
use crate::core::{
    AgvId, Arm, CancelToken, InventorySnapshot, MarkOutcome, MatchedPart, Order, OrderKey, OrderStore, Pose,
    PoseConfig, ProductRef, ProductRequirement, ShipmentKey, WaitPolicy, WorkItem, flattened, requires_flip, settle,
};
use crate::events::{EventSink, FulfillmentEvent, LogSink};
use crate::interfaces::{Motion, Perception, Placement, Quality, Submission, Target};
use crate::verification::{PlacedProduct, PlacementVerifier, Verdict};
use crate::{CellConfig, KittingError};

/// Loop-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Full passes over the queue without progress before the run gives up
    pub max_idle_passes: u32,
    /// Pause between two idle passes
    pub idle_backoff_ms: u64,
    /// Smallest x-axis quaternion component that calls for a flip
    pub flip_epsilon: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { max_idle_passes: 3, idle_backoff_ms: 500, flip_epsilon: 0.1 }
    }
}

/// Manipulator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Parking location at startup and shutdown
    pub home_location: String,
    /// Pause after a pick and after a placement
    pub settle_ms: u64,
    /// Bound on gripper attachment confirmation
    pub grip_wait: WaitPolicy,
}

impl Default for MotionConfig {
    fn default() -> Self {
        MotionConfig {
            home_location: "home".to_string(),
            settle_ms: 200,
            grip_wait: WaitPolicy::new(2_000, 10),
        }
    }
}

/// Everything the loop needs to know about one AGV
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgvStation {
    /// Named location above the tray
    pub station: String,
    /// Locations visited while handing a part from the left to the right arm
    #[serde(default)]
    pub flip_waypoints: Vec<String>,
    /// Tray frame in world coordinates
    #[serde(default)]
    pub tray_frame: PoseConfig,
}

impl AgvStation {
    /// Stock layout of the cell
    pub fn for_agv(agv: AgvId) -> Self {
        let side = match agv {
            AgvId::Agv1 => 1.0,
            AgvId::Agv2 => -1.0,
        };
        AgvStation {
            station: agv.to_string(),
            flip_waypoints: vec![format!("{}_flip_left", agv), format!("{}_flip_right", agv)],
            tray_frame: PoseConfig { position: [0.12, 3.36 * side, 0.75], ..PoseConfig::default() },
        }
    }

    /// World pose of a tray-relative target
    pub fn world_pose(&self, tray_pose: &Pose) -> Pose {
        Pose::from(self.tray_frame) * tray_pose
    }
}

/// One submission attempt
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRecord {
    /// AGV sent off
    pub agv: AgvId,
    /// Shipment label
    pub label: String,
    /// Accepted by the service
    pub success: bool,
}

/// What a run achieved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    /// Labels of completed shipments, in completion order
    pub completed: Vec<String>,
    /// Every submission attempt
    pub submissions: Vec<SubmissionRecord>,
    /// Shipments still queued when the run ended
    pub unfinished: Vec<String>,
    /// Parts put down on a tray, including discarded ones
    pub placements: usize,
    /// Faulty parts taken back off a tray
    pub discarded: usize,
    /// Placements corrected after a pose deviation
    pub corrected: usize,
    /// The run ended on a cancellation request
    pub cancelled: bool,
}

enum ProductOutcome {
    Placed { agv: AgvId, outcome: MarkOutcome },
    Discarded,
}

enum ShipmentPass {
    Complete,
    Stuck { progressed: bool },
}

/// The control loop and the state it exclusively owns
pub struct FulfillmentScheduler<P, M, Q, S> {
    perception: P,
    motion: M,
    quality: Q,
    submission: S,
    orders: OrderStore,
    inventory: InventorySnapshot,
    belt: BeltFeedCoordinator,
    verifier: PlacementVerifier,
    agv1: AgvStation,
    agv2: AgvStation,
    motion_config: MotionConfig,
    config: SchedulerConfig,
    cancel: CancelToken,
    events: Box<dyn EventSink>,
    batch_order: Option<OrderKey>,
    belt_paused: bool,
    used_agvs: HashMap<ShipmentKey, Vec<AgvId>>,
    summary: RunSummary,
}

impl<P, M, Q, S> FulfillmentScheduler<P, M, Q, S>
where
    P: Perception,
    M: Motion,
    Q: Quality,
    S: Submission,
{
    /// Scheduler over the given collaborators. Events go to the log until
    /// another sink is set with `with_events`.
    pub fn new(config: CellConfig, perception: P, motion: M, quality: Q, submission: S) -> Self {
        FulfillmentScheduler {
            perception,
            motion,
            quality,
            submission,
            orders: OrderStore::new(),
            inventory: InventorySnapshot::new(),
            belt: BeltFeedCoordinator::new(config.belt),
            verifier: PlacementVerifier::new(config.verification),
            agv1: config.agv1,
            agv2: config.agv2,
            motion_config: config.motion,
            config: config.scheduler,
            cancel: CancelToken::new(),
            events: Box::new(LogSink),
            batch_order: None,
            belt_paused: false,
            used_agvs: HashMap::new(),
            summary: RunSummary::default(),
        }
    }

    /// Replace the event sink
    pub fn with_events<E: EventSink + 'static>(mut self, sink: E) -> Self {
        self.events = Box::new(sink);
        self
    }

    /// Channel for orders arriving from other threads
    pub fn order_sender(&self) -> Sender<Order> {
        self.orders.sender()
    }

    /// Hand an order to the store directly
    pub fn receive_order(&mut self, order: Order) -> OrderKey {
        let key = self.orders.receive_order(order);
        self.announce(key);
        key
    }

    /// Token that stops the loop at its next check
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Order state
    pub fn orders(&self) -> &OrderStore {
        &self.orders
    }

    /// Inventory as of the last refresh
    pub fn inventory(&self) -> &InventorySnapshot {
        &self.inventory
    }

    /// Conveyor coordinator
    pub fn belt(&self) -> &BeltFeedCoordinator {
        &self.belt
    }

    /// Work the queue until every shipment is complete, the loop stops
    /// making progress or a cancellation is requested.
    pub fn run(&mut self) -> RunSummary {
        log::info!("Fulfillment run started");
        self.summary = RunSummary::default();
        if let Err(error) = self.motion.move_to(&Target::Named(self.motion_config.home_location.clone())) {
            log::warn!("Could not reach {}: {}", self.motion_config.home_location, error);
        }

        let mut stalled = 0;
        let mut idle_passes = 0;
        loop {
            if self.cancel.is_cancelled() {
                self.summary.cancelled = true;
                break;
            }
            self.absorb_inbox();
            let Some(item) = self.orders.next_work() else {
                break;
            };

            match self.work_shipment(item) {
                Ok(ShipmentPass::Complete) => {
                    self.orders.finish_active();
                    stalled = 0;
                    idle_passes = 0;
                    continue;
                }
                Ok(ShipmentPass::Stuck { progressed: true }) => {
                    self.defer(item);
                    stalled = 0;
                    idle_passes = 0;
                    continue;
                }
                Ok(ShipmentPass::Stuck { progressed: false }) => self.defer(item),
                Err(KittingError::Cancelled) => {
                    self.defer(item);
                    self.summary.cancelled = true;
                    break;
                }
                Err(error) => {
                    log::error!("Shipment {} abandoned for this pass: {}", self.shipment_label(item.shipment), error);
                    self.defer(item);
                }
            }

            stalled += 1;
            if stalled >= self.orders.queued().len() {
                stalled = 0;
                idle_passes += 1;
                if idle_passes >= self.config.max_idle_passes {
                    log::error!("No progress after {} full passes, stopping", idle_passes);
                    break;
                }
                if settle(self.config.idle_backoff_ms, &self.cancel).is_err() {
                    self.summary.cancelled = true;
                    break;
                }
            }
        }

        self.summary.unfinished = self
            .orders
            .queued()
            .into_iter()
            .map(|item| self.shipment_label(item.shipment))
            .collect();
        if self.summary.cancelled {
            log::warn!("Fulfillment run cancelled");
        }
        log::info!(
            "Fulfillment run finished: {} shipment(s) completed, {} unfinished",
            self.summary.completed.len(),
            self.summary.unfinished.len()
        );
        self.summary.clone()
    }

    /// Repeat passes over the shipment's pending products until it is
    /// complete or a pass places nothing.
    fn work_shipment(&mut self, item: WorkItem) -> Result<ShipmentPass, KittingError> {
        let key = item.shipment;
        if self.batch_order != Some(key.order) {
            self.plan_belt_batch(key.order)?;
        }
        self.belt_paused = false;
        self.emit(FulfillmentEvent::ShipmentStarted { label: self.shipment_label(key) });

        let mut progressed = false;
        loop {
            let order_idx = self.order_index(key.order)?;
            let mut placed_any = false;
            for product in self.orders.pending_products(order_idx, key.shipment)? {
                self.cancel.check()?;
                let product = ProductRef { shipment: key, product };
                match self.attempt_product(product) {
                    Ok(ProductOutcome::Placed { agv, outcome }) => {
                        placed_any = true;
                        if outcome == MarkOutcome::ShipmentComplete {
                            self.submit_shipment(key, agv);
                            self.absorb_inbox();
                            return Ok(ShipmentPass::Complete);
                        }
                        self.absorb_inbox();
                    }
                    Ok(ProductOutcome::Discarded) => placed_any = true,
                    Err(KittingError::Cancelled) => return Err(KittingError::Cancelled),
                    Err(error) => self.log_product_error(product, &error),
                }
            }
            if !placed_any {
                return Ok(ShipmentPass::Stuck { progressed });
            }
            progressed = true;
        }
    }

    /// Decide which products of the order the conveyor has to supply:
    /// every pending product beyond what storage holds of its type.
    fn plan_belt_batch(&mut self, key: OrderKey) -> Result<(), KittingError> {
        let order_idx = self.order_index(key)?;
        self.inventory.refresh(&self.perception);
        let mut stock = self.inventory.storage_counts();

        let mut batch = Vec::new();
        let order = self.orders.order(order_idx)?;
        for (s, shipment) in order.shipments.iter().enumerate() {
            for p in self.orders.pending_products(order_idx, s)? {
                let part_type = &shipment.products[p].part_type;
                match stock.get_mut(part_type) {
                    Some(count) if *count > 0 => *count -= 1,
                    _ => batch.push(BeltDemand {
                        product: ProductRef { shipment: ShipmentKey { order: key, shipment: s }, product: p },
                        part_type: part_type.clone(),
                    }),
                }
            }
        }
        log::info!("Order {} needs {} part(s) from the belt", order.id, batch.len());
        self.belt.begin_batch(batch);
        self.batch_order = Some(key);
        Ok(())
    }

    fn feed_belt(&mut self) -> Result<(), KittingError> {
        while self.belt.owed() > 0 {
            self.cancel.check()?;
            let reservation = self.belt.extract_one(&self.perception, &mut self.motion, &self.cancel)?;
            self.emit(FulfillmentEvent::BeltPartStaged {
                part_type: reservation.part_type,
                bin_sensor: reservation.bin_sensor,
            });
        }
        Ok(())
    }

    fn attempt_product(&mut self, product: ProductRef) -> Result<ProductOutcome, KittingError> {
        // Belt parts pass out of reach, storage parts wait
        if !self.belt_paused {
            if let Err(error) = self.feed_belt() {
                if matches!(error, KittingError::Cancelled) {
                    return Err(error);
                }
                log::warn!("Belt feed interrupted, storage only until the next pass: {}", error);
                self.belt_paused = true;
            }
        }

        let key = product.shipment;
        let order_idx = self.order_index(key.order)?;
        let requirement = self.orders.product(order_idx, key.shipment, product.product)?.clone();
        let agv = self
            .orders
            .resolve_destination(order_idx, key.shipment, product.product, routing::resolve_destination)?;

        self.inventory.refresh(&self.perception);
        let staged_in = self.belt.reservation_for(product).map(|r| r.bin_sensor.clone());
        let matched = self
            .inventory
            .find_match_preferring(&requirement.part_type, staged_in.as_deref())
            .ok_or_else(|| KittingError::MatchNotFound(requirement.part_type.clone()))?;
        log::info!(
            "Product {} of {} ({}) matched to {} slot {}",
            product.product,
            self.shipment_label(key),
            requirement.part_type,
            matched.sensor,
            matched.slot
        );

        self.pick(&matched)?;
        self.inventory.mark_consumed(&matched.sensor, matched.slot);

        match self.deliver(product, &requirement, agv, order_idx) {
            Err(error) if !matches!(error, KittingError::Cancelled) => {
                self.clear_grippers();
                Err(error)
            }
            result => result,
        }
    }

    /// Carry the held part to its AGV, place it and verify the placement
    fn deliver(
        &mut self,
        product: ProductRef,
        requirement: &ProductRequirement,
        agv: AgvId,
        order_idx: usize,
    ) -> Result<ProductOutcome, KittingError> {
        let key = product.shipment;
        let station = self.station(agv).clone();
        self.motion.move_to(&Target::Named(station.station.clone()))?;
        let (tray_pose, arm) = if requires_flip(&requirement.target_pose, self.config.flip_epsilon) {
            self.flip(&station)?;
            (flattened(&requirement.target_pose), Arm::Right)
        } else {
            (requirement.target_pose, Arm::Left)
        };
        self.motion.place(&Placement { part_type: requirement.part_type.clone(), tray_pose, arm }, agv)?;
        settle(self.motion_config.settle_ms, &self.cancel)?;
        self.summary.placements += 1;

        let placed = PlacedProduct {
            agv,
            station: station.station.clone(),
            part_type: requirement.part_type.clone(),
            tray_pose,
            world_target: station.world_pose(&tray_pose),
        };
        let verdict = self
            .verifier
            .verify(&self.perception, &mut self.motion, &self.quality, &placed, &self.cancel)?;
        self.emit(FulfillmentEvent::ProductPlaced {
            label: self.shipment_label(key),
            product: product.product,
            agv,
            verdict,
        });

        match verdict {
            Verdict::VerifiedFaulty => {
                self.summary.discarded += 1;
                return Ok(ProductOutcome::Discarded);
            }
            Verdict::PoseCorrected => self.summary.corrected += 1,
            Verdict::VerifiedOk => {}
        }

        let outcome = self.orders.mark_product_done(order_idx, key.shipment, product.product)?;
        self.used_agvs.entry(key).or_default().push(agv);
        self.inventory.refresh(&self.perception);
        Ok(ProductOutcome::Placed { agv, outcome })
    }

    /// Approach, grip, and wait for the gripper to report the part attached
    fn pick(&mut self, matched: &MatchedPart) -> Result<(), KittingError> {
        self.motion.move_to(&Target::Pose(matched.part.pose))?;
        self.motion.pick(&matched.part)?;
        let attached = self
            .motion_config
            .grip_wait
            .wait_until("gripper attachment", &self.cancel, || self.motion.grip_state(Arm::Left).attached);
        match attached {
            Ok(()) => settle(self.motion_config.settle_ms, &self.cancel),
            Err(KittingError::Timeout(_)) => {
                self.motion.release(Arm::Left)?;
                Err(KittingError::PickFailed(format!(
                    "{} at {} slot {} never attached",
                    matched.part.part_type, matched.sensor, matched.slot
                )))
            }
            Err(error) => Err(error),
        }
    }

    /// Drop whatever the arms still hold into the faulty-part bin
    fn clear_grippers(&mut self) {
        let held: Vec<Arm> =
            [Arm::Left, Arm::Right].into_iter().filter(|arm| self.motion.grip_state(*arm).attached).collect();
        if held.is_empty() {
            return;
        }
        let discard = self.verifier.discard_location().to_string();
        log::warn!("Clearing {} held part(s) at {}", held.len(), discard);
        if let Err(error) = self.motion.move_to(&Target::Named(discard.clone())) {
            log::error!("Could not reach {}: {}", discard, error);
        }
        for arm in held {
            if let Err(error) = self.motion.release(arm) {
                log::error!("Could not release {}: {}", arm.as_str(), error);
            }
        }
    }

    /// Hand the part over to the right arm so it ends up upside down
    fn flip(&mut self, station: &AgvStation) -> Result<(), KittingError> {
        log::info!("Flipping part above {}", station.station);
        for waypoint in &station.flip_waypoints {
            self.motion.move_to(&Target::Named(waypoint.clone()))?;
        }
        self.motion.activate_gripper(Arm::Right)?;
        self.motion_config
            .grip_wait
            .wait_until("right arm handover", &self.cancel, || self.motion.grip_state(Arm::Right).attached)?;
        self.motion.release(Arm::Left)?;
        self.motion.move_to(&Target::Named(station.station.clone()))?;
        Ok(())
    }

    fn submit_shipment(&mut self, key: ShipmentKey, agv: AgvId) {
        let label = self.shipment_label(key);
        if let Some(used) = self.used_agvs.remove(&key) {
            if used.iter().any(|other| *other != agv) {
                log::warn!("Shipment {} spans both AGVs, submitting {}", label, agv);
            }
        }
        let success = submission::submit(&mut self.submission, agv, &label).is_ok();
        self.summary.completed.push(label.clone());
        self.summary.submissions.push(SubmissionRecord { agv, label: label.clone(), success });
        self.emit(FulfillmentEvent::ShipmentSubmitted { label, agv, success });
    }

    fn defer(&mut self, item: WorkItem) {
        self.orders.defer(item);
        self.emit(FulfillmentEvent::ShipmentDeferred { label: self.shipment_label(item.shipment) });
    }

    fn absorb_inbox(&mut self) {
        for key in self.orders.poll_inbox() {
            self.announce(key);
        }
    }

    fn announce(&mut self, key: OrderKey) {
        let Some(position) = self.orders.index_of(key) else {
            return;
        };
        if let Ok(order) = self.orders.order(position) {
            let order_id = order.id.clone();
            self.emit(FulfillmentEvent::OrderReceived { order_id, position });
        }
    }

    fn log_product_error(&self, product: ProductRef, error: &KittingError) {
        let label = self.shipment_label(product.shipment);
        match error {
            KittingError::MatchNotFound(_) => {
                log::debug!("Product {} of {} skipped this pass: {}", product.product, label, error)
            }
            KittingError::PickFailed(_)
            | KittingError::PoseDeviation(_)
            | KittingError::VerifiedFaulty(_)
            | KittingError::Timeout(_)
            | KittingError::Motion(_) => {
                log::warn!("Product {} of {} failed: {}", product.product, label, error)
            }
            _ => log::error!("Product {} of {}: {}", product.product, label, error),
        }
    }

    fn order_index(&self, key: OrderKey) -> Result<usize, KittingError> {
        self.orders
            .index_of(key)
            .ok_or_else(|| KittingError::IndexError(format!("order key {} is not in the store", key.0)))
    }

    fn shipment_label(&self, key: ShipmentKey) -> String {
        self.orders
            .index_of(key.order)
            .and_then(|idx| self.orders.order(idx).ok())
            .and_then(|order| order.shipments.get(key.shipment))
            .map(|shipment| shipment.label.clone())
            .unwrap_or_else(|| format!("order{}_shipment{}", key.order.0, key.shipment))
    }

    fn station(&self, agv: AgvId) -> &AgvStation {
        match agv {
            AgvId::Agv1 => &self.agv1,
            AgvId::Agv2 => &self.agv2,
        }
    }

    fn emit(&mut self, event: FulfillmentEvent) {
        self.events.emit(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::at;
    use crate::interfaces::{MockMotion, MockPerception, MockQuality, MockSubmission};
    use mockall::predicate::eq;

    #[test]
    fn tray_targets_follow_the_tray_frame() {
        let station = AgvStation::for_agv(AgvId::Agv2);
        let world = station.world_pose(&at(0.1, 0.2, 0.0));
        assert!((world.translation.x - 0.22).abs() < 1e-9);
        assert!((world.translation.y + 3.16).abs() < 1e-9);
        assert!((world.translation.z - 0.75).abs() < 1e-9);
    }

    #[test]
    fn empty_queue_parks_and_returns() {
        let mut motion = MockMotion::new();
        motion.expect_move_to().with(eq(Target::named("home"))).times(1).returning(|_| Ok(()));
        let mut submission = MockSubmission::new();
        submission.expect_submit().never();

        let mut scheduler = FulfillmentScheduler::new(
            CellConfig::default(),
            MockPerception::new(),
            motion,
            MockQuality::new(),
            submission,
        );
        let summary = scheduler.run();
        assert_eq!(summary, RunSummary::default());
    }

    #[test]
    fn cancelled_before_start_does_nothing() {
        let mut motion = MockMotion::new();
        motion.expect_move_to().returning(|_| Ok(()));
        let mut scheduler = FulfillmentScheduler::new(
            CellConfig::default(),
            MockPerception::new(),
            motion,
            MockQuality::new(),
            MockSubmission::new(),
        );
        scheduler.receive_order(Order { id: "order_0".to_string(), shipments: Vec::new() });
        scheduler.cancel_token().cancel();
        let summary = scheduler.run();
        assert!(summary.cancelled);
        assert!(summary.completed.is_empty());
    }
}
