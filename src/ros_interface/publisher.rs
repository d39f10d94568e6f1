// src/ros_interface/publisher.rs
// Publishes fulfillment events on a ROS 2 topic.

use r2r::QosProfile;

use crate::events::{EventSink, FulfillmentEvent};

/// Event sink backed by a `std_msgs/String` publisher
pub struct StatusPublisher {
    inner: r2r::Publisher<r2r::std_msgs::msg::String>,
    topic: String,
}

impl StatusPublisher {
    /// Create a publisher on `topic` with the default QoS
    pub fn new(node: &mut r2r::Node, topic: &str) -> Result<Self, r2r::Error> {
        let inner = node.create_publisher::<r2r::std_msgs::msg::String>(topic, QosProfile::default())?;
        Ok(StatusPublisher { inner, topic: topic.to_string() })
    }
}

impl EventSink for StatusPublisher {
    fn emit(&mut self, event: &FulfillmentEvent) {
        let message = r2r::std_msgs::msg::String { data: event.to_string() };
        // A dropped status message never stops fulfillment
        if let Err(e) = self.inner.publish(&message) {
            log::warn!("Failed to publish on {}: {}", self.topic, e);
        }
    }
}
