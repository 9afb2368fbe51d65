//! Pull-driven probes.
//!
//! A polling probe runs a background thread that takes a reading every poll
//! interval. `poll()` may also be called directly; concurrent callers queue on
//! a per-probe lock instead of issuing overlapping reads against the source.

use crate::datastore::SharedSink;
use crate::notify::{attribute, ChangeNotifier};
use crate::probe::listening::Converter;
use crate::probe::source::PullSource;
use crate::probe::types::{Datum, DatumKind, ProbeError, ProbeState, ProbeStats};
use crate::probe::{Probe, ProbeCore};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default wait between polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Default bound on a single reading.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

struct Poller<S: PullSource> {
    core: Arc<ProbeCore>,
    source: S,
    convert: Converter<S::Reading>,
    poll_lock: Mutex<()>,
    timeout: Duration,
}

impl<S: PullSource> Poller<S> {
    fn poll(&self) -> Result<Option<Datum>, ProbeError> {
        let _serial = self.poll_lock.lock();
        debug!(probe = %self.core.name(), "Polling reading source");

        let reading = self.source.get_reading(self.timeout)?;
        Ok((self.convert)(reading).map(|kind| Datum::new(self.core.id(), kind)))
    }

    fn run(&self, interval: Duration, stop: crossbeam_channel::Receiver<()>) {
        loop {
            match self.poll() {
                Ok(Some(datum)) => {
                    self.core.store_datum(datum);
                }
                Ok(None) => {}
                Err(e) => warn!(probe = %self.core.name(), "Poll failed: {e}"),
            }

            match stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

#[derive(Default)]
struct Session {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

/// A probe fed by a [`PullSource`].
pub struct PollingProbe<S: PullSource + 'static> {
    poller: Arc<Poller<S>>,
    interval: Duration,
    session: Mutex<Session>,
}

impl<S: PullSource + 'static> PollingProbe<S> {
    pub fn new(
        name: impl Into<String>,
        source: S,
        interval: Duration,
        timeout: Duration,
        convert: impl Fn(S::Reading) -> Option<DatumKind> + Send + Sync + 'static,
    ) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), name, source, interval, timeout, convert)
    }

    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        source: S,
        interval: Duration,
        timeout: Duration,
        convert: impl Fn(S::Reading) -> Option<DatumKind> + Send + Sync + 'static,
    ) -> Self {
        Self {
            poller: Arc::new(Poller {
                core: Arc::new(ProbeCore::new(id.into(), name.into(), None)),
                source,
                convert: Arc::new(convert),
                poll_lock: Mutex::new(()),
                timeout,
            }),
            interval,
            session: Mutex::new(Session::default()),
        }
    }

    /// Take one reading now without storing it.
    ///
    /// Blocks while another poll on this probe is in flight.
    pub fn poll(&self) -> Result<Option<Datum>, ProbeError> {
        self.poller.poll()
    }

    pub fn poll_interval(&self) -> Duration {
        self.interval
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poller.timeout
    }

    pub fn source(&self) -> &S {
        &self.poller.source
    }
}

impl<S: PullSource + 'static> Probe for PollingProbe<S> {
    fn id(&self) -> &str {
        self.poller.core.id()
    }

    fn display_name(&self) -> &str {
        self.poller.core.name()
    }

    fn state(&self) -> ProbeState {
        self.poller.core.state()
    }

    fn initialize(&self, sink: SharedSink) -> Result<(), ProbeError> {
        self.poller.core.initialize(sink)
    }

    fn start(&self) -> Result<(), ProbeError> {
        let core = &self.poller.core;
        {
            let mut session = self.session.lock();
            core.require(ProbeState::Initialized, "start")?;

            let (stop_tx, stop_rx) = bounded(1);
            let poller = Arc::clone(&self.poller);
            let interval = self.interval;

            // Started before the thread exists so its first reading is kept.
            core.set_state(ProbeState::Started);
            let spawned = thread::Builder::new()
                .name(format!("poll-{}", core.name().replace('\0', "")))
                .spawn(move || poller.run(interval, stop_rx));

            match spawned {
                Ok(handle) => {
                    session.stop = Some(stop_tx);
                    session.thread = Some(handle);
                }
                Err(e) => {
                    core.set_state(ProbeState::Initialized);
                    return Err(ProbeError::Thread(e));
                }
            }
        }

        info!(probe = %core.name(), interval_ms = self.interval.as_millis() as u64, "Started polling");
        core.notifier().notify(attribute::STATE);
        Ok(())
    }

    fn stop(&self) -> Result<(), ProbeError> {
        let core = &self.poller.core;
        {
            let mut session = self.session.lock();
            core.require(ProbeState::Started, "stop")?;

            if let Some(stop) = session.stop.take() {
                let _ = stop.send(());
            }
            if let Some(handle) = session.thread.take() {
                if handle.join().is_err() {
                    warn!(probe = %core.name(), "Poll thread panicked");
                }
            }
            core.halt(ProbeState::Stopped);
        }

        info!(probe = %core.name(), "Stopped polling");
        core.notifier().notify(attribute::STATE);
        Ok(())
    }

    fn notifier(&self) -> &ChangeNotifier {
        self.poller.core.notifier()
    }

    fn stats(&self) -> ProbeStats {
        self.poller.core.stats()
    }
}

impl<S: PullSource + 'static> Drop for PollingProbe<S> {
    fn drop(&mut self) {
        let mut session = self.session.lock();
        session.stop.take();
        if let Some(handle) = session.thread.take() {
            let _ = handle.join();
        }
    }
}
