// Single-fire latch deciding who settles a delivery

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Claimed at most once across all clones.
///
/// The normal completion path and the shutdown listener of a job both race
/// for it; only the winner may acknowledge or requeue the delivery.
#[derive(Clone, Default)]
pub struct TerminalLatch {
    fired: Arc<AtomicBool>,
}

impl TerminalLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// True for exactly one caller
    pub fn claim(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
