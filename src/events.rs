// src/events.rs

// Progress reporting. The scheduler emits a `FulfillmentEvent` at every
// milestone; sinks decide where it goes (the log, a test recorder, or a
// ROS 2 status topic when the `ros` feature is on).

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::core::AgvId;
use crate::verification::Verdict;

/// Milestones of a fulfillment run
#[derive(Debug, Clone, PartialEq)]
pub enum FulfillmentEvent {
    /// An order arrived
    OrderReceived {
        /// Order identifier
        order_id: String,
        /// Position in the order sequence
        position: usize,
    },
    /// A shipment became the active one
    ShipmentStarted {
        /// Shipment label
        label: String,
    },
    /// A part was placed and verified
    ProductPlaced {
        /// Shipment label
        label: String,
        /// Product index within the shipment
        product: usize,
        /// Destination AGV
        agv: AgvId,
        /// Verification outcome
        verdict: Verdict,
    },
    /// A part came off the conveyor into staging
    BeltPartStaged {
        /// Extracted type
        part_type: String,
        /// Staging bin sensor
        bin_sensor: String,
    },
    /// A shipment was sent to the submission service
    ShipmentSubmitted {
        /// Shipment label
        label: String,
        /// AGV submitted
        agv: AgvId,
        /// Service accepted it
        success: bool,
    },
    /// A shipment went back to the queue without progress
    ShipmentDeferred {
        /// Shipment label
        label: String,
    },
}

impl fmt::Display for FulfillmentEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FulfillmentEvent::OrderReceived { order_id, position } => {
                write!(f, "order {} received at position {}", order_id, position)
            }
            FulfillmentEvent::ShipmentStarted { label } => write!(f, "shipment {} started", label),
            FulfillmentEvent::ProductPlaced { label, product, agv, verdict } => {
                write!(f, "shipment {} product {} on {}: {:?}", label, product, agv, verdict)
            }
            FulfillmentEvent::BeltPartStaged { part_type, bin_sensor } => {
                write!(f, "belt part {} staged under {}", part_type, bin_sensor)
            }
            FulfillmentEvent::ShipmentSubmitted { label, agv, success } => {
                write!(f, "shipment {} submitted on {} (success: {})", label, agv, success)
            }
            FulfillmentEvent::ShipmentDeferred { label } => write!(f, "shipment {} deferred", label),
        }
    }
}

/// Receiver of fulfillment events
pub trait EventSink {
    /// Handle one event. Must not block the control loop for long.
    fn emit(&mut self, event: &FulfillmentEvent);
}

/// Writes events to the `log` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&mut self, event: &FulfillmentEvent) {
        log::info!("[event] {}", event);
    }
}

/// Keeps every event; clones share the same buffer
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<FulfillmentEvent>>>,
}

impl RecordingSink {
    /// Empty recorder
    pub fn new() -> Self {
        RecordingSink::default()
    }

    /// Copy of everything recorded so far
    pub fn events(&self) -> Vec<FulfillmentEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&mut self, event: &FulfillmentEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_clones_share_buffer() {
        let recorder = RecordingSink::new();
        let mut handle = recorder.clone();
        handle.emit(&FulfillmentEvent::ShipmentStarted { label: "s0".to_string() });
        assert_eq!(recorder.events().len(), 1);
        assert_eq!(recorder.events()[0].to_string(), "shipment s0 started");
    }
}
