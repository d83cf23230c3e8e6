//! Assure completion notifications.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::model::Policy;

/// Receives `(policy, matched)` once per assure evaluation.
pub trait StatusHandler: Send + Sync {
    fn on_status(&self, policy: &Policy, matched: bool);
}

impl<F> StatusHandler for F
where
    F: Fn(&Policy, bool) + Send + Sync,
{
    fn on_status(&self, policy: &Policy, matched: bool) {
        self(policy, matched)
    }
}

/// Replaceable handler slot; empty means no-op.
#[derive(Default, Clone)]
pub struct StatusSlot {
    handler: Arc<RwLock<Option<Arc<dyn StatusHandler>>>>,
}

impl std::fmt::Debug for StatusSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusSlot")
            .field("set", &self.handler.read().is_some())
            .finish()
    }
}

impl StatusSlot {
    /// Install `handler`; `None` resets to no-op.
    pub fn set(&self, handler: Option<Arc<dyn StatusHandler>>) {
        *self.handler.write() = handler;
    }

    pub fn report(&self, policy: &Policy, matched: bool) {
        // Clone out so the handler runs without the lock held.
        let handler = self.handler.read().clone();
        if let Some(handler) = handler {
            handler.on_status(policy, matched);
        }
    }
}
