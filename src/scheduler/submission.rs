// src/scheduler/submission.rs
// One-shot shipment submission. Failures are logged and reported, never
// propagated: the next shipment still gets built.

use crate::KittingError;
use crate::core::AgvId;
use crate::interfaces::Submission;

/// Ask the submission service to send `agv` off with `shipment_label`
pub fn submit<S: Submission + ?Sized>(service: &mut S, agv: AgvId, shipment_label: &str) -> Result<(), KittingError> {
    log::info!("Sending {} to submit shipment {}", agv, shipment_label);
    let response = service.submit(agv, shipment_label);
    if response.success {
        log::info!("Shipment {} submitted", shipment_label);
        Ok(())
    } else {
        log::error!("Failed to submit {}: {}", shipment_label, response.message);
        Err(KittingError::SubmissionFailed(response.message))
    }
}
