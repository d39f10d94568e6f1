// src/core/mod.rs

// Declares and exposes the state the orchestration loop works on: the data
// model, poses, the order state store, the inventory snapshot and the
// bounded-wait helpers every blocking step goes through.

pub mod inventory;
pub mod model;
pub mod orders;
pub mod pose;
pub mod wait;

// Re-export key types for a flat API
pub use inventory::{InventorySnapshot, MatchedPart};
pub use model::{AgvId, Arm, Destination, Observation, Order, Part, ProductRequirement, SensorId, SensorRole, Shipment};
pub use orders::{MarkOutcome, OrderKey, OrderStore, ProductRef, ShipmentKey, WorkItem};
pub use pose::{Pose, PoseConfig, at, flattened, lowered, planar_offset, requires_flip};
pub use wait::{CancelToken, WaitPolicy, settle};
