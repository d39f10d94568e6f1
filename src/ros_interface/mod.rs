//! ROS 2 interface for the kitting cell
//!
//! Fulfillment events are published as `std_msgs/String` on a status
//! topic so dashboards and recorders can follow a run. Only built with the
//! `ros` feature; it needs a sourced ROS 2 environment.

mod publisher;

pub use publisher::StatusPublisher;
