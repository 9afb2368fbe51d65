//! Probes: the units that acquire readings and hand them to the data store.
//!
//! Two acquisition models exist:
//! - [`ListeningProbe`] registers with a [`PushSource`] and keeps the device
//!   awake while started. Stored data is rate limited.
//! - [`PollingProbe`] pulls from a [`PullSource`] on a timer. Concurrent polls
//!   are serialized.
//!
//! Both follow the same lifecycle:
//!
//! ```text
//! Uninitialized ──initialize──▶ Initialized ──start──▶ Started ──stop──▶ Stopped
//!                                    ▲                                     │
//!                                    └────────────initialize───────────────┘
//! ```

pub mod listening;
pub mod location;
pub mod polling;
pub mod rate_limit;
pub mod source;
pub mod types;
pub mod wake_lock;

pub use listening::ListeningProbe;
pub use location::{GpsReceiver, LocationMeasure, Position, SimulatedGps};
pub use polling::PollingProbe;
pub use rate_limit::RateLimiter;
pub use source::{Listener, ListenerId, PullSource, PushSource};
pub use types::{Datum, DatumKind, ProbeError, ProbeState, ProbeStats, SourceError};
pub use wake_lock::{NoopPowerControl, PowerControl, WakeLock, WakeLockGuard};

use crate::datastore::SharedSink;
use crate::notify::{attribute, ChangeNotifier};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Common interface the protocol drives every probe through.
pub trait Probe: Send + Sync {
    /// Stable identifier.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn display_name(&self) -> &str;

    fn state(&self) -> ProbeState;

    /// Prepare for a run, attaching the sink that stored data goes to.
    ///
    /// Valid from `Uninitialized` or `Stopped`. On failure the state is unchanged.
    fn initialize(&self, sink: SharedSink) -> Result<(), ProbeError>;

    /// Begin acquiring. Valid only from `Initialized`.
    fn start(&self) -> Result<(), ProbeError>;

    /// Stop acquiring. Valid only from `Started`.
    ///
    /// Once this returns, the probe no longer hands data to its sink.
    fn stop(&self) -> Result<(), ProbeError>;

    /// Publisher of this probe's change events.
    fn notifier(&self) -> &ChangeNotifier;

    fn stats(&self) -> ProbeStats;
}

struct StoreState {
    sink: Option<SharedSink>,
    limiter: Option<RateLimiter>,
}

/// State shared between a probe and the callbacks or threads feeding it.
pub(crate) struct ProbeCore {
    id: String,
    name: String,
    state: RwLock<ProbeState>,
    store: Mutex<StoreState>,
    notifier: ChangeNotifier,
    stored: AtomicU64,
    rate_limited: AtomicU64,
}

impl ProbeCore {
    pub(crate) fn new(id: String, name: String, limiter: Option<RateLimiter>) -> Self {
        Self {
            notifier: ChangeNotifier::new(id.clone()),
            id,
            name,
            state: RwLock::new(ProbeState::Uninitialized),
            store: Mutex::new(StoreState {
                sink: None,
                limiter,
            }),
            stored: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> ProbeState {
        *self.state.read()
    }

    pub(crate) fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub(crate) fn initialize(&self, sink: SharedSink) -> Result<(), ProbeError> {
        {
            let mut store = self.store.lock();
            let mut state = self.state.write();
            if !matches!(*state, ProbeState::Uninitialized | ProbeState::Stopped) {
                return Err(ProbeError::InvalidTransition {
                    operation: "initialize",
                    state: *state,
                });
            }

            store.sink = Some(sink);
            if let Some(limiter) = store.limiter.as_mut() {
                limiter.reset();
            }
            *state = ProbeState::Initialized;
        }

        debug!(probe = %self.name, "Probe initialized");
        self.notifier.notify(attribute::STATE);
        Ok(())
    }

    /// Fail with `InvalidTransition` unless the probe is in `expected`.
    pub(crate) fn require(&self, expected: ProbeState, operation: &'static str) -> Result<(), ProbeError> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(ProbeError::InvalidTransition { operation, state })
        }
    }

    /// Set the state without waiting on in-flight stores.
    pub(crate) fn set_state(&self, state: ProbeState) {
        *self.state.write() = state;
    }

    /// Set the state once no store is in progress.
    ///
    /// Used on stop: after this returns no further datum reaches the sink.
    pub(crate) fn halt(&self, state: ProbeState) {
        let _store = self.store.lock();
        *self.state.write() = state;
    }

    /// Hand a datum to the sink if the probe is started and the rate limiter allows it.
    ///
    /// Returns whether the datum was stored. Rejections are silent.
    pub(crate) fn store_datum(&self, datum: Datum) -> bool {
        let mut store = self.store.lock();

        if self.state() != ProbeState::Started {
            trace!(probe = %self.name, "Dropping datum from probe that is not started");
            return false;
        }

        if let Some(limiter) = store.limiter.as_mut() {
            if !limiter.try_accept(Utc::now()) {
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
                debug!(probe = %self.name, "Datum dropped by rate limiter");
                return false;
            }
        }

        match store.sink.as_ref() {
            Some(sink) => {
                sink.accept(datum);
                self.stored.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub(crate) fn max_per_second(&self) -> Option<f64> {
        self.store
            .lock()
            .limiter
            .as_ref()
            .map(RateLimiter::max_per_second)
    }

    pub(crate) fn set_max_per_second(&self, max_per_second: f64) {
        if let Some(limiter) = self.store.lock().limiter.as_mut() {
            limiter.set_max_per_second(max_per_second);
        }
    }

    pub(crate) fn stats(&self) -> ProbeStats {
        ProbeStats {
            stored: self.stored.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe shared probe handle.
pub type SharedProbe = Arc<dyn Probe>;
