//! In-flight gate
//!
//! Single-bit exclusion enforcing at most one outstanding TX transfer. The
//! entity about to submit sets it with a compare-and-set; only the completion
//! of that transfer (or the submitter, when submission never happened) clears
//! it. Never set or cleared under the queue lock.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct InFlightGate {
    busy: AtomicBool,
}

impl InFlightGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gate if it is clear. Returns false if it was already held.
    pub fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Clear the gate
    pub fn release(&self) {
        let was_held = self.busy.swap(false, Ordering::SeqCst);
        debug_assert!(was_held, "in-flight gate released while clear");
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}
