//! Reading-source contracts that probes acquire data through.
//!
//! Platform sensor bindings sit behind these traits; probes never talk to
//! hardware directly.

use crate::probe::types::SourceError;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked by a push source for every new reading.
pub type Listener<R> = Arc<dyn Fn(R) + Send + Sync>;

/// Handle identifying a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// A source that pushes readings to registered listeners.
pub trait PushSource: Send + Sync {
    type Reading: Send + 'static;

    /// Register a listener. Readings published after this returns are delivered to it.
    fn add_listener(&self, listener: Listener<Self::Reading>) -> Result<ListenerId, SourceError>;

    /// Unregister a listener. Returns false if it was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// A source that produces a reading on demand.
pub trait PullSource: Send + Sync {
    type Reading: Send + 'static;

    /// Take a reading, waiting at most `timeout`.
    fn get_reading(&self, timeout: Duration) -> Result<Self::Reading, SourceError>;
}

impl<S: PushSource + ?Sized> PushSource for Arc<S> {
    type Reading = S::Reading;

    fn add_listener(&self, listener: Listener<Self::Reading>) -> Result<ListenerId, SourceError> {
        (**self).add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        (**self).remove_listener(id)
    }
}

impl<S: PullSource + ?Sized> PullSource for Arc<S> {
    type Reading = S::Reading;

    fn get_reading(&self, timeout: Duration) -> Result<Self::Reading, SourceError> {
        (**self).get_reading(timeout)
    }
}
