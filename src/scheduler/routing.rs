// src/scheduler/routing.rs
// Destination policy for products ordered for "any" AGV.

use crate::core::AgvId;

/// Resolve an unassigned destination from the shipment's position in its
/// order: the first shipment is built on AGV1, every later one on AGV2.
pub fn resolve_destination(shipment_index: usize) -> AgvId {
    if shipment_index == 0 { AgvId::Agv1 } else { AgvId::Agv2 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, AgvId::Agv1)]
    #[case(1, AgvId::Agv2)]
    #[case(4, AgvId::Agv2)]
    fn first_shipment_goes_to_agv1(#[case] shipment: usize, #[case] expected: AgvId) {
        assert_eq!(resolve_destination(shipment), expected);
    }
}
