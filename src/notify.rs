//! Change notification for UI binding.
//!
//! Protocols and probes publish "attribute changed" events through a
//! [`ChangeNotifier`]. Subscribers receive the id of the changed object and the
//! name of the attribute.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Attribute names published by this crate.
pub mod attribute {
    pub const NAME: &str = "name";
    pub const RUNNING: &str = "running";
    pub const PROBES: &str = "probes";
    pub const STATE: &str = "state";
}

/// A single change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    /// Id of the object whose attribute changed
    pub source_id: String,
    /// Name of the changed attribute
    pub attribute: &'static str,
}

/// Callback receiving change events.
pub type ChangeHandler = Arc<dyn Fn(&PropertyChange) + Send + Sync>;

/// Token returned by [`ChangeNotifier::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Publisher of change events for one object.
pub struct ChangeNotifier {
    source_id: String,
    handlers: RwLock<Vec<(SubscriptionId, ChangeHandler)>>,
    next_id: AtomicU64,
}

impl ChangeNotifier {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn subscribe(&self, handler: ChangeHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Publish a change of `attribute` to every subscriber.
    pub fn notify(&self, attribute: &'static str) {
        let change = PropertyChange {
            source_id: self.source_id.clone(),
            attribute,
        };

        // Snapshot so handlers may subscribe or unsubscribe re-entrantly.
        let handlers: Vec<ChangeHandler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler(&change);
        }
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("source_id", &self.source_id)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
