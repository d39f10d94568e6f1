// src/core/wait.rs

// Bounded sensor waits and cooperative cancellation. Every blocking wait in
// the cell (conveyor arrival, gripper attachment, settle times) goes through
// here so it is bounded by a timeout and can be interrupted.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::KittingError;

/// Shared shutdown flag, checked at iteration boundaries and before waits
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// New, not cancelled
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Request a graceful stop
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once a stop was requested
    pub fn check(&self) -> Result<(), KittingError> {
        if self.is_cancelled() {
            Err(KittingError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Timeout and poll interval of a sensor wait
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaitPolicy {
    /// Give up after this long
    pub timeout_ms: u64,
    /// Sleep between polls
    pub poll_ms: u64,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy { timeout_ms: 30_000, poll_ms: 50 }
    }
}

impl WaitPolicy {
    /// Policy with the given timeout and poll interval in milliseconds
    pub fn new(timeout_ms: u64, poll_ms: u64) -> Self {
        WaitPolicy { timeout_ms, poll_ms }
    }

    /// Poll `condition` until it holds, the timeout expires or `cancel` fires.
    /// The condition is always evaluated at least once.
    pub fn wait_until<F>(&self, what: &str, cancel: &CancelToken, mut condition: F) -> Result<(), KittingError>
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + Duration::from_millis(self.timeout_ms);
        loop {
            cancel.check()?;
            if condition() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                log::warn!("Timed out after {} ms waiting for {}", self.timeout_ms, what);
                return Err(KittingError::Timeout(what.to_string()));
            }
            if self.poll_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.poll_ms));
            }
        }
    }
}

/// Fixed settle pause after approach or placement
pub fn settle(millis: u64, cancel: &CancelToken) -> Result<(), KittingError> {
    cancel.check()?;
    if millis > 0 {
        std::thread::sleep(Duration::from_millis(millis));
    }
    Ok(())
}
