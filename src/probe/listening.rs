//! Push-driven probes.
//!
//! A listening probe holds the device wake lock for as long as it is started,
//! since the device must stay awake to hear its source. Start and stop are
//! serialized by a per-probe lock so the wake lock and the listener
//! registration always change together.

use crate::datastore::SharedSink;
use crate::notify::{attribute, ChangeNotifier};
use crate::probe::rate_limit::RateLimiter;
use crate::probe::source::{Listener, ListenerId, PushSource};
use crate::probe::types::{Datum, DatumKind, ProbeError, ProbeState, ProbeStats};
use crate::probe::wake_lock::{WakeLock, WakeLockGuard};
use crate::probe::{Probe, ProbeCore};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Default cap on stored data per second.
pub const DEFAULT_MAX_DATA_PER_SECOND: f64 = 1.0;

/// Maps a raw reading to the datum it should produce, if any.
pub type Converter<R> = Arc<dyn Fn(R) -> Option<DatumKind> + Send + Sync>;

#[derive(Default)]
struct Session {
    listener: Option<ListenerId>,
    wake: Option<WakeLockGuard>,
}

/// A probe fed by a [`PushSource`].
pub struct ListeningProbe<S: PushSource> {
    core: Arc<ProbeCore>,
    source: S,
    convert: Converter<S::Reading>,
    wake_lock: WakeLock,
    session: Mutex<Session>,
}

impl<S: PushSource> ListeningProbe<S> {
    /// Create a probe limited to [`DEFAULT_MAX_DATA_PER_SECOND`].
    pub fn new(
        name: impl Into<String>,
        source: S,
        wake_lock: WakeLock,
        convert: impl Fn(S::Reading) -> Option<DatumKind> + Send + Sync + 'static,
    ) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), name, source, wake_lock, convert)
    }

    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        source: S,
        wake_lock: WakeLock,
        convert: impl Fn(S::Reading) -> Option<DatumKind> + Send + Sync + 'static,
    ) -> Self {
        Self {
            core: Arc::new(ProbeCore::new(
                id.into(),
                name.into(),
                Some(RateLimiter::new(DEFAULT_MAX_DATA_PER_SECOND)),
            )),
            source,
            convert: Arc::new(convert),
            wake_lock,
            session: Mutex::new(Session::default()),
        }
    }

    /// Builder-style rate cap.
    pub fn with_max_data_per_second(self, max_per_second: f64) -> Self {
        self.core.set_max_per_second(max_per_second);
        self
    }

    pub fn max_data_per_second(&self) -> f64 {
        self.core
            .max_per_second()
            .unwrap_or(DEFAULT_MAX_DATA_PER_SECOND)
    }

    pub fn set_max_data_per_second(&self, max_per_second: f64) {
        self.core.set_max_per_second(max_per_second);
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Whether a listener is currently registered with the source.
    pub fn is_listening(&self) -> bool {
        self.session.lock().listener.is_some()
    }

    /// Store a datum through the rate limiter. Returns whether it was stored.
    pub fn store_datum(&self, datum: Datum) -> bool {
        self.core.store_datum(datum)
    }

    fn listener(&self) -> Listener<S::Reading> {
        let core = Arc::clone(&self.core);
        let convert = Arc::clone(&self.convert);
        Arc::new(move |reading: S::Reading| {
            if let Some(kind) = convert(reading) {
                core.store_datum(Datum::new(core.id(), kind));
            }
        })
    }
}

impl<S: PushSource> Probe for ListeningProbe<S> {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn display_name(&self) -> &str {
        self.core.name()
    }

    fn state(&self) -> ProbeState {
        self.core.state()
    }

    fn initialize(&self, sink: SharedSink) -> Result<(), ProbeError> {
        self.core.initialize(sink)
    }

    fn start(&self) -> Result<(), ProbeError> {
        {
            let mut session = self.session.lock();
            self.core.require(ProbeState::Initialized, "start")?;

            // Dropped, and so released, if the listener cannot be attached.
            let wake = self.wake_lock.acquire();
            let listener = self.source.add_listener(self.listener())?;

            session.listener = Some(listener);
            session.wake = Some(wake);
            self.core.set_state(ProbeState::Started);
        }

        info!(probe = %self.core.name(), "Started listening");
        self.core.notifier().notify(attribute::STATE);
        Ok(())
    }

    fn stop(&self) -> Result<(), ProbeError> {
        {
            let mut session = self.session.lock();
            self.core.require(ProbeState::Started, "stop")?;

            let _wake = session.wake.take();
            if let Some(listener) = session.listener.take() {
                if !self.source.remove_listener(listener) {
                    warn!(probe = %self.core.name(), "Listener was already detached from its source");
                }
            }
            self.core.halt(ProbeState::Stopped);
        }

        info!(probe = %self.core.name(), "Stopped listening");
        self.core.notifier().notify(attribute::STATE);
        Ok(())
    }

    fn notifier(&self) -> &ChangeNotifier {
        self.core.notifier()
    }

    fn stats(&self) -> ProbeStats {
        self.core.stats()
    }
}

impl<S: PushSource> Drop for ListeningProbe<S> {
    fn drop(&mut self) {
        let mut session = self.session.lock();
        if let Some(listener) = session.listener.take() {
            self.source.remove_listener(listener);
        }
        session.wake.take();
    }
}
