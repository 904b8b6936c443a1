//! Engine activation around top-level operations.
//!
//! Detect, plan, apply, and elevate are bracketed by
//! activate/deactivate so the UX cannot issue a second overlapping
//! operation from a callback.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use ember_core::error::{EmberError, EmberResult};

/// Single-writer serialization for the engine's top-level operations.
#[derive(Clone, Default)]
pub struct UxHost {
    active: Arc<AtomicBool>,
}

/// Guard holding the activation; deactivates on drop.
pub struct Activation {
    active: Arc<AtomicBool>,
}

impl UxHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the exclusive section. Fails when another operation is
    /// already running.
    pub fn activate(&self) -> EmberResult<Activation> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EmberError::Validation(
                "engine is busy with another operation".to_string(),
            ));
        }
        Ok(Activation {
            active: Arc::clone(&self.active),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}
