// src/core/orders.rs

// Order state store: the order -> shipment -> product tree, per-product and
// per-shipment completion flags, and the work queue of shipments the
// scheduler pops from. Orders received while a shipment is in progress are
// injected right after the active order, both in the order sequence and in
// the work queue, so they run next.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};

use super::model::{AgvId, Destination, Order, ProductRequirement};
use crate::KittingError;

/// Stable identity of a received order. Sequence positions shift when an
/// order is injected; keys never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderKey(pub u64);

/// A shipment within an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShipmentKey {
    /// Owning order
    pub order: OrderKey,
    /// Shipment index within the order
    pub shipment: usize,
}

/// A product within a shipment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProductRef {
    /// Owning shipment
    pub shipment: ShipmentKey,
    /// Product index within the shipment
    pub product: usize,
}

/// Entry of the work queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    /// Shipment to fulfill
    pub shipment: ShipmentKey,
    /// Higher runs first; each injection gets a level above all earlier ones
    pub priority: u32,
}

/// Result of marking a product as placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The product was already done; nothing changed
    AlreadyDone,
    /// Flag set, shipment still has pending products
    Marked,
    /// Flag set and it was the last one: the shipment is now complete
    ShipmentComplete,
}

#[derive(Debug)]
struct OrderRecord {
    key: OrderKey,
    order: Order,
    product_done: Vec<Vec<bool>>,
    shipment_done: Vec<bool>,
}

impl OrderRecord {
    fn new(key: OrderKey, order: Order) -> Self {
        let product_done = order.shipments.iter().map(|s| vec![false; s.products.len()]).collect();
        // An empty shipment has nothing to place and is never scheduled
        let shipment_done = order.shipments.iter().map(|s| s.products.is_empty()).collect();
        OrderRecord { key, order, product_done, shipment_done }
    }
}

/// Orders, completion matrices and the shipment work queue
#[derive(Debug)]
pub struct OrderStore {
    sequence: Vec<OrderRecord>,
    queue: VecDeque<WorkItem>,
    active: Option<ShipmentKey>,
    next_key: u64,
    injection_level: u32,
    inbox: Receiver<Order>,
    inbox_sender: Sender<Order>,
}

impl Default for OrderStore {
    fn default() -> Self {
        OrderStore::new()
    }
}

impl OrderStore {
    /// Empty store
    pub fn new() -> Self {
        let (inbox_sender, inbox) = mpsc::channel();
        OrderStore {
            sequence: Vec::new(),
            queue: VecDeque::new(),
            active: None,
            next_key: 0,
            injection_level: 0,
            inbox,
            inbox_sender,
        }
    }

    /// Handle other threads use to deliver orders; drained by `poll_inbox`
    pub fn sender(&self) -> Sender<Order> {
        self.inbox_sender.clone()
    }

    /// Receive every order waiting in the inbox
    pub fn poll_inbox(&mut self) -> Vec<OrderKey> {
        let mut received = Vec::new();
        while let Ok(order) = self.inbox.try_recv() {
            received.push(self.receive_order(order));
        }
        received
    }

    /// Add an order. With no shipment in progress it is appended. While a
    /// shipment is being fulfilled it is inserted right after the active
    /// order and its shipments go to the front of the work queue.
    pub fn receive_order(&mut self, order: Order) -> OrderKey {
        let key = OrderKey(self.next_key);
        self.next_key += 1;

        let active_position = self.active.and_then(|active| self.index_of(active.order));
        let record = OrderRecord::new(key, order);
        let pending: Vec<usize> = (0..record.shipment_done.len())
            .filter(|&s| !record.shipment_done[s])
            .collect();
        let id = record.order.id.clone();

        match active_position {
            Some(position) => {
                self.sequence.insert(position + 1, record);
                self.injection_level += 1;
                let priority = self.injection_level;
                // Insert ahead of every lower-priority item, keeping shipment order
                let at = self
                    .queue
                    .iter()
                    .position(|item| item.priority < priority)
                    .unwrap_or(self.queue.len());
                for (offset, shipment) in pending.into_iter().enumerate() {
                    self.queue.insert(
                        at + offset,
                        WorkItem { shipment: ShipmentKey { order: key, shipment }, priority },
                    );
                }
                log::info!("Order {} injected at position {} (priority {})", id, position + 1, priority);
            }
            None => {
                self.sequence.push(record);
                for shipment in pending {
                    self.queue.push_back(WorkItem { shipment: ShipmentKey { order: key, shipment }, priority: 0 });
                }
                log::info!("Order {} received at position {}", id, self.sequence.len() - 1);
            }
        }
        key
    }

    /// Pop the next shipment that still has work. Marks it active.
    pub fn next_work(&mut self) -> Option<WorkItem> {
        while let Some(item) = self.queue.pop_front() {
            if self.shipment_complete_by_key(item.shipment) {
                continue;
            }
            self.active = Some(item.shipment);
            return Some(item);
        }
        self.active = None;
        None
    }

    /// Put an unfinished shipment back at the end of the queue
    pub fn defer(&mut self, item: WorkItem) {
        if self.active == Some(item.shipment) {
            self.active = None;
        }
        self.queue.push_back(WorkItem { shipment: item.shipment, priority: 0 });
    }

    /// The active shipment is finished (complete or abandoned)
    pub fn finish_active(&mut self) {
        self.active = None;
    }

    /// Shipment currently being fulfilled
    pub fn active(&self) -> Option<ShipmentKey> {
        self.active
    }

    /// Shipments still queued, front first
    pub fn queued(&self) -> Vec<WorkItem> {
        self.queue.iter().copied().collect()
    }

    /// Current sequence position of an order
    pub fn index_of(&self, key: OrderKey) -> Option<usize> {
        self.sequence.iter().position(|record| record.key == key)
    }

    /// Key of the order at a sequence position
    pub fn key_at(&self, order_idx: usize) -> Result<OrderKey, KittingError> {
        self.record(order_idx).map(|record| record.key)
    }

    /// Number of orders received so far
    pub fn order_count(&self) -> usize {
        self.sequence.len()
    }

    /// Order at a sequence position
    pub fn order(&self, order_idx: usize) -> Result<&Order, KittingError> {
        self.record(order_idx).map(|record| &record.order)
    }

    /// Product requirement at (order, shipment, product)
    pub fn product(
        &self,
        order_idx: usize,
        shipment_idx: usize,
        product_idx: usize,
    ) -> Result<&ProductRequirement, KittingError> {
        let record = self.record(order_idx)?;
        record
            .order
            .shipments
            .get(shipment_idx)
            .ok_or_else(|| index_error(order_idx, Some(shipment_idx), None))?
            .products
            .get(product_idx)
            .ok_or_else(|| index_error(order_idx, Some(shipment_idx), Some(product_idx)))
    }

    /// Fix the destination of an unassigned product using `policy`, which
    /// receives the shipment index. Assigned products are returned as is.
    pub fn resolve_destination<F>(
        &mut self,
        order_idx: usize,
        shipment_idx: usize,
        product_idx: usize,
        policy: F,
    ) -> Result<AgvId, KittingError>
    where
        F: FnOnce(usize) -> AgvId,
    {
        self.product(order_idx, shipment_idx, product_idx)?;
        let product = &mut self.sequence[order_idx].order.shipments[shipment_idx].products[product_idx];
        match product.destination {
            Destination::Agv(agv) => Ok(agv),
            Destination::Unassigned => {
                let agv = policy(shipment_idx);
                product.destination = Destination::Agv(agv);
                log::info!(
                    "Product {} of shipment {} resolved to {}",
                    product_idx, shipment_idx, agv
                );
                Ok(agv)
            }
        }
    }

    /// Set a product's completion flag. Idempotent; reports when the
    /// shipment became complete with this call.
    pub fn mark_product_done(
        &mut self,
        order_idx: usize,
        shipment_idx: usize,
        product_idx: usize,
    ) -> Result<MarkOutcome, KittingError> {
        self.product(order_idx, shipment_idx, product_idx)?;
        let record = &mut self.sequence[order_idx];
        let flags = &mut record.product_done[shipment_idx];
        if flags[product_idx] {
            return Ok(MarkOutcome::AlreadyDone);
        }
        flags[product_idx] = true;
        if flags.iter().all(|done| *done) {
            record.shipment_done[shipment_idx] = true;
            Ok(MarkOutcome::ShipmentComplete)
        } else {
            Ok(MarkOutcome::Marked)
        }
    }

    /// Lowest product index of the shipment not yet placed
    pub fn next_pending(&self, order_idx: usize, shipment_idx: usize) -> Result<Option<usize>, KittingError> {
        Ok(self.pending_products(order_idx, shipment_idx)?.first().copied())
    }

    /// Every product index of the shipment not yet placed, in declared order
    pub fn pending_products(&self, order_idx: usize, shipment_idx: usize) -> Result<Vec<usize>, KittingError> {
        let flags = self
            .record(order_idx)?
            .product_done
            .get(shipment_idx)
            .ok_or_else(|| index_error(order_idx, Some(shipment_idx), None))?;
        Ok(flags.iter().enumerate().filter(|(_, done)| !**done).map(|(k, _)| k).collect())
    }

    /// Completion flag of a product
    pub fn is_product_done(&self, order_idx: usize, shipment_idx: usize, product_idx: usize) -> Result<bool, KittingError> {
        self.product(order_idx, shipment_idx, product_idx)?;
        Ok(self.sequence[order_idx].product_done[shipment_idx][product_idx])
    }

    /// Completion flag of a shipment
    pub fn is_shipment_done(&self, order_idx: usize, shipment_idx: usize) -> Result<bool, KittingError> {
        self.record(order_idx)?
            .shipment_done
            .get(shipment_idx)
            .copied()
            .ok_or_else(|| index_error(order_idx, Some(shipment_idx), None))
    }

    /// Every shipment of every order is complete
    pub fn all_done(&self) -> bool {
        self.sequence.iter().all(|record| record.shipment_done.iter().all(|done| *done))
    }

    fn shipment_complete_by_key(&self, key: ShipmentKey) -> bool {
        self.index_of(key.order)
            .and_then(|idx| self.sequence[idx].shipment_done.get(key.shipment).copied())
            .unwrap_or(true)
    }

    fn record(&self, order_idx: usize) -> Result<&OrderRecord, KittingError> {
        self.sequence.get(order_idx).ok_or_else(|| index_error(order_idx, None, None))
    }
}

fn index_error(order: usize, shipment: Option<usize>, product: Option<usize>) -> KittingError {
    let mut at = format!("order {}", order);
    if let Some(s) = shipment {
        at.push_str(&format!(", shipment {}", s));
    }
    if let Some(p) = product {
        at.push_str(&format!(", product {}", p));
    }
    KittingError::IndexError(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::Shipment;
    use crate::core::pose::at;
    use rstest::rstest;

    fn order(id: &str, shipments: &[usize]) -> Order {
        Order {
            id: id.to_string(),
            shipments: shipments
                .iter()
                .enumerate()
                .map(|(s, &n)| Shipment {
                    label: format!("{}_shipment_{}", id, s),
                    products: (0..n)
                        .map(|k| ProductRequirement::new("gear", at(k as f64 * 0.1, 0.0, 0.0), Destination::Unassigned))
                        .collect(),
                })
                .collect(),
        }
    }

    fn labels(store: &OrderStore, items: &[WorkItem]) -> Vec<String> {
        items
            .iter()
            .map(|item| {
                let idx = store.index_of(item.shipment.order).unwrap();
                store.order(idx).unwrap().shipments[item.shipment.shipment].label.clone()
            })
            .collect()
    }

    #[test]
    fn marking_twice_is_idempotent() {
        let mut store = OrderStore::new();
        store.receive_order(order("order_0", &[2]));
        assert_eq!(store.mark_product_done(0, 0, 0).unwrap(), MarkOutcome::Marked);
        let pending_once = store.pending_products(0, 0).unwrap();
        assert_eq!(store.mark_product_done(0, 0, 0).unwrap(), MarkOutcome::AlreadyDone);
        assert_eq!(store.pending_products(0, 0).unwrap(), pending_once);
        assert!(!store.is_shipment_done(0, 0).unwrap());
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    fn shipment_completes_exactly_with_last_product(#[case] n: usize) {
        let mut store = OrderStore::new();
        store.receive_order(order("order_0", &[n]));
        for k in (0..n).rev() {
            assert!(!store.is_shipment_done(0, 0).unwrap());
            let outcome = store.mark_product_done(0, 0, k).unwrap();
            if k == 0 {
                assert_eq!(outcome, MarkOutcome::ShipmentComplete);
            } else {
                assert_eq!(outcome, MarkOutcome::Marked);
            }
        }
        assert!(store.is_shipment_done(0, 0).unwrap());
        assert_eq!(store.mark_product_done(0, 0, 0).unwrap(), MarkOutcome::AlreadyDone);
    }

    #[test]
    fn next_pending_is_lowest_unset_index() {
        let mut store = OrderStore::new();
        store.receive_order(order("order_0", &[3]));
        assert_eq!(store.next_pending(0, 0).unwrap(), Some(0));
        store.mark_product_done(0, 0, 0).unwrap();
        store.mark_product_done(0, 0, 2).unwrap();
        assert_eq!(store.next_pending(0, 0).unwrap(), Some(1));
        store.mark_product_done(0, 0, 1).unwrap();
        assert_eq!(store.next_pending(0, 0).unwrap(), None);
    }

    #[test]
    fn out_of_range_indices_are_index_errors() {
        let mut store = OrderStore::new();
        store.receive_order(order("order_0", &[1]));
        assert!(matches!(store.mark_product_done(1, 0, 0), Err(KittingError::IndexError(_))));
        assert!(matches!(store.next_pending(0, 4), Err(KittingError::IndexError(_))));
        assert!(matches!(store.product(0, 0, 9), Err(KittingError::IndexError(_))));
    }

    #[test]
    fn injected_order_runs_after_active_shipment_and_before_later_orders() {
        let mut store = OrderStore::new();
        let a = store.receive_order(order("a", &[1, 1]));
        store.receive_order(order("c", &[1]));

        let first = store.next_work().unwrap();
        assert_eq!(first.shipment, ShipmentKey { order: a, shipment: 0 });

        let b = store.receive_order(order("b", &[1, 1]));
        assert_eq!(store.index_of(b), Some(1), "inserted right after the active order");
        assert_eq!(store.index_of(a), Some(0));

        let queued = store.queued();
        assert_eq!(
            labels(&store, &queued),
            ["b_shipment_0", "b_shipment_1", "a_shipment_1", "c_shipment_0"]
        );
    }

    #[test]
    fn nested_injection_goes_ahead_of_earlier_injection() {
        let mut store = OrderStore::new();
        store.receive_order(order("a", &[1]));
        store.next_work().unwrap();
        store.receive_order(order("b", &[1, 1]));
        store.next_work().unwrap();
        store.receive_order(order("c", &[1]));
        assert_eq!(labels(&store, &store.queued()), ["c_shipment_0", "b_shipment_1"]);
    }

    #[test]
    fn appended_orders_keep_arrival_order() {
        let mut store = OrderStore::new();
        store.receive_order(order("a", &[1]));
        store.receive_order(order("b", &[1]));
        assert_eq!(labels(&store, &store.queued()), ["a_shipment_0", "b_shipment_0"]);
        assert!(store.active().is_none());
    }

    #[test]
    fn completed_shipments_are_skipped_and_deferred_ones_requeued() {
        let mut store = OrderStore::new();
        store.receive_order(order("a", &[1, 1]));
        store.mark_product_done(0, 0, 0).unwrap();
        let item = store.next_work().unwrap();
        assert_eq!(item.shipment.shipment, 1);
        store.defer(item);
        assert!(store.active().is_none());
        assert_eq!(store.next_work().unwrap().shipment.shipment, 1);
        assert!(store.next_work().is_none());
    }

    #[test]
    fn destination_resolves_once() {
        let mut store = OrderStore::new();
        store.receive_order(order("a", &[1]));
        assert_eq!(store.resolve_destination(0, 0, 0, |_| AgvId::Agv2).unwrap(), AgvId::Agv2);
        assert_eq!(store.resolve_destination(0, 0, 0, |_| AgvId::Agv1).unwrap(), AgvId::Agv2);
        assert_eq!(store.product(0, 0, 0).unwrap().destination, Destination::Agv(AgvId::Agv2));
    }

    #[test]
    fn inbox_delivers_orders_from_other_threads() {
        let mut store = OrderStore::new();
        let sender = store.sender();
        std::thread::spawn(move || sender.send(order("remote", &[1])).unwrap())
            .join()
            .unwrap();
        let keys = store.poll_inbox();
        assert_eq!(keys.len(), 1);
        assert_eq!(store.order(0).unwrap().id, "remote");
    }
}
