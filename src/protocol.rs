//! Protocols: a set of probes plus one data store with a single running flag.
//!
//! Setting `running` is the only way to start or stop acquisition:
//!
//! ```text
//! running = true                         running = false
//!   sink.test() ── fail ──▶ abort          stop every started probe
//!   initialize every probe                 sink.stop()
//!   start every initialized probe
//!   sink.start() if any probe started
//! ```
//!
//! Change events raised during a transition are published once it is over,
//! so subscribers may start or stop the protocol from their handler.

use crate::datastore::{DataStoreError, SharedSink};
use crate::notify::{attribute, ChangeHandler, ChangeNotifier, PropertyChange, SubscriptionId};
use crate::probe::{ProbeState, SharedProbe};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("probe {0} is already part of this protocol")]
    DuplicateProbe(String),

    #[error("probe {0} is not part of this protocol")]
    UnknownProbe(String),

    #[error("cannot change probes while the protocol is running")]
    Running,

    #[error(transparent)]
    DataStore(#[from] DataStoreError),
}

/// Outcome of a start attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The protocol was already running
    AlreadyRunning,
    /// The data store test failed; nothing was started
    DataStoreUnavailable,
    /// No probe could be started; the data store was left untouched
    NoProbesStarted,
    /// The data store refused to start; started probes were stopped again
    DataStoreStartFailed,
    /// Running with this many probes started
    Started(usize),
}

/// Publishes change events, holding them back while a transition is in progress.
struct Outbox {
    notifier: ChangeNotifier,
    held: Mutex<Option<Vec<&'static str>>>,
}

impl Outbox {
    fn post(&self, attribute: &'static str) {
        if let Some(held) = self.held.lock().as_mut() {
            held.push(attribute);
            return;
        }
        self.notifier.notify(attribute);
    }

    fn hold(&self) {
        *self.held.lock() = Some(Vec::new());
    }

    fn release(&self) -> Vec<&'static str> {
        self.held.lock().take().unwrap_or_default()
    }

    fn publish(&self, attributes: Vec<&'static str>) {
        for attribute in attributes {
            self.notifier.notify(attribute);
        }
    }
}

/// A data-collection plan.
pub struct Protocol {
    id: String,
    name: RwLock<String>,
    probes: RwLock<Vec<SharedProbe>>,
    relays: Mutex<HashMap<String, SubscriptionId>>,
    sink: SharedSink,
    running: AtomicBool,
    transition: Mutex<()>,
    outbox: Arc<Outbox>,
    relay: ChangeHandler,
}

impl Protocol {
    pub fn new(name: impl Into<String>, sink: SharedSink) -> Self {
        let id = Uuid::new_v4().to_string();
        let outbox = Arc::new(Outbox {
            notifier: ChangeNotifier::new(id.clone()),
            held: Mutex::new(None),
        });

        let forward = Arc::clone(&outbox);
        let relay: ChangeHandler = Arc::new(move |_change: &PropertyChange| {
            forward.post(attribute::PROBES);
        });

        Self {
            id,
            name: RwLock::new(name.into()),
            probes: RwLock::new(Vec::new()),
            relays: Mutex::new(HashMap::new()),
            sink,
            running: AtomicBool::new(false),
            transition: Mutex::new(()),
            outbox,
            relay,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Rename the protocol. Notifies only when the name actually changes.
    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        {
            let mut current = self.name.write();
            if *current == name {
                return;
            }
            *current = name;
        }
        self.outbox.post(attribute::NAME);
    }

    /// Probes in insertion order.
    pub fn probes(&self) -> Vec<SharedProbe> {
        self.probes.read().clone()
    }

    pub fn probe(&self, id: &str) -> Option<SharedProbe> {
        self.probes.read().iter().find(|probe| probe.id() == id).cloned()
    }

    pub fn sink(&self) -> &SharedSink {
        &self.sink
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.outbox.notifier
    }

    /// Run `f` under the transition lock, publishing its change events after the lock is released.
    fn transition<T>(&self, f: impl FnOnce() -> T) -> T {
        let (result, changes) = {
            let _transition = self.transition.lock();
            self.outbox.hold();
            let result = f();
            (result, self.outbox.release())
        };
        self.outbox.publish(changes);
        result
    }

    /// Add a probe and relay its change events as "probes" changes of this protocol.
    pub fn add_probe(&self, probe: SharedProbe) -> Result<(), ProtocolError> {
        self.transition(|| {
            if self.is_running() {
                return Err(ProtocolError::Running);
            }

            {
                let mut probes = self.probes.write();
                if probes.iter().any(|existing| existing.id() == probe.id()) {
                    return Err(ProtocolError::DuplicateProbe(probe.id().to_string()));
                }

                let subscription = probe.notifier().subscribe(Arc::clone(&self.relay));
                self.relays.lock().insert(probe.id().to_string(), subscription);
                probes.push(probe);
            }

            self.outbox.post(attribute::PROBES);
            Ok(())
        })
    }

    /// Remove a probe and stop relaying its change events.
    pub fn remove_probe(&self, id: &str) -> Result<SharedProbe, ProtocolError> {
        self.transition(|| {
            if self.is_running() {
                return Err(ProtocolError::Running);
            }

            let removed = {
                let mut probes = self.probes.write();
                let index = probes
                    .iter()
                    .position(|probe| probe.id() == id)
                    .ok_or_else(|| ProtocolError::UnknownProbe(id.to_string()))?;
                probes.remove(index)
            };

            if let Some(subscription) = self.relays.lock().remove(id) {
                removed.notifier().unsubscribe(subscription);
            }

            self.outbox.post(attribute::PROBES);
            Ok(removed)
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start or stop acquisition. Setting the current value is a no-op.
    pub fn set_running(&self, running: bool) {
        if running {
            self.start();
        } else {
            self.stop();
        }
    }

    /// Start acquisition, reporting how far the start sequence got.
    ///
    /// Only `Started` leaves the protocol running.
    pub fn start(&self) -> StartOutcome {
        self.transition(|| self.run_start_sequence())
    }

    fn run_start_sequence(&self) -> StartOutcome {
        if self.is_running() {
            return StartOutcome::AlreadyRunning;
        }

        self.running.store(true, Ordering::SeqCst);
        self.outbox.post(attribute::RUNNING);
        let name = self.name();

        if let Err(e) = self.sink.test() {
            error!(protocol = %name, "Local data store test failed: {e}");
            self.abort_start();
            return StartOutcome::DataStoreUnavailable;
        }

        let probes = self.probes();
        for probe in &probes {
            if let Err(e) = probe.initialize(Arc::clone(&self.sink)) {
                warn!(protocol = %name, probe = probe.display_name(), "Failed to initialize probe: {e}");
            }
        }

        let mut started = 0;
        for probe in probes.iter().filter(|probe| probe.state() == ProbeState::Initialized) {
            match probe.start() {
                Ok(()) => started += 1,
                Err(e) => warn!(protocol = %name, probe = probe.display_name(), "Failed to start probe: {e}"),
            }
        }

        if started == 0 {
            warn!(protocol = %name, "No probes started; data store left untouched");
            self.abort_start();
            return StartOutcome::NoProbesStarted;
        }

        if let Err(e) = self.sink.start(&name) {
            error!(protocol = %name, "Failed to start data store: {e}");
            self.stop_probes();
            self.abort_start();
            return StartOutcome::DataStoreStartFailed;
        }

        info!(protocol = %name, probes = started, "Protocol started");
        StartOutcome::Started(started)
    }

    /// Stop acquisition: every started probe, then the data store.
    pub fn stop(&self) {
        self.transition(|| {
            if !self.is_running() {
                return;
            }

            self.running.store(false, Ordering::SeqCst);
            self.outbox.post(attribute::RUNNING);

            self.stop_probes();
            if let Err(e) = self.sink.stop() {
                error!(protocol = %self.name(), "Failed to stop data store: {e}");
            }
            info!(protocol = %self.name(), "Protocol stopped");
        })
    }

    fn stop_probes(&self) {
        for probe in self.probes() {
            if probe.state() == ProbeState::Started {
                if let Err(e) = probe.stop() {
                    warn!(probe = probe.display_name(), "Failed to stop probe: {e}");
                }
            }
        }
    }

    fn abort_start(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.outbox.post(attribute::RUNNING);
    }
}

impl Drop for Protocol {
    fn drop(&mut self) {
        let relays = std::mem::take(&mut *self.relays.lock());
        for probe in self.probes.read().iter() {
            if let Some(subscription) = relays.get(probe.id()) {
                probe.notifier().unsubscribe(*subscription);
            }
        }
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("probes", &self.probes.read().len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{DataStoreSink, LocalDataStore};
    use crate::probe::{Datum, Probe, ProbeError, ProbeStats};
    use std::sync::atomic::AtomicUsize;

    /// Probe whose initialize/start outcome is scripted.
    struct ScriptedProbe {
        id: String,
        state: RwLock<ProbeState>,
        fail_initialize: bool,
        fail_start: bool,
        notifier: ChangeNotifier,
    }

    impl ScriptedProbe {
        fn new(id: &str, fail_initialize: bool, fail_start: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                state: RwLock::new(ProbeState::Uninitialized),
                fail_initialize,
                fail_start,
                notifier: ChangeNotifier::new(id),
            })
        }

        fn set(&self, state: ProbeState) {
            *self.state.write() = state;
            self.notifier.notify(attribute::STATE);
        }
    }

    impl Probe for ScriptedProbe {
        fn id(&self) -> &str {
            &self.id
        }

        fn display_name(&self) -> &str {
            &self.id
        }

        fn state(&self) -> ProbeState {
            *self.state.read()
        }

        fn initialize(&self, _sink: SharedSink) -> Result<(), ProbeError> {
            if self.fail_initialize {
                return Err(ProbeError::Initialization("no hardware".to_string()));
            }
            self.set(ProbeState::Initialized);
            Ok(())
        }

        fn start(&self) -> Result<(), ProbeError> {
            if self.fail_start {
                return Err(ProbeError::Initialization("refused".to_string()));
            }
            self.set(ProbeState::Started);
            Ok(())
        }

        fn stop(&self) -> Result<(), ProbeError> {
            self.set(ProbeState::Stopped);
            Ok(())
        }

        fn notifier(&self) -> &ChangeNotifier {
            &self.notifier
        }

        fn stats(&self) -> ProbeStats {
            ProbeStats::default()
        }
    }

    #[derive(Default)]
    struct TrackingSink {
        fail_test: bool,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl DataStoreSink for TrackingSink {
        fn test(&self) -> Result<(), DataStoreError> {
            if self.fail_test {
                Err(DataStoreError::TestFailed("disk full".to_string()))
            } else {
                Ok(())
            }
        }

        fn start(&self, _protocol_name: &str) -> Result<(), DataStoreError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) -> Result<(), DataStoreError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn accept(&self, _datum: Datum) {}
    }

    #[test]
    fn test_failed_sink_test_aborts_start() {
        let sink = Arc::new(TrackingSink {
            fail_test: true,
            ..TrackingSink::default()
        });
        let protocol = Protocol::new("study", sink.clone());
        let probe = ScriptedProbe::new("gps", false, false);
        protocol.add_probe(probe.clone()).unwrap();

        assert_eq!(protocol.start(), StartOutcome::DataStoreUnavailable);
        assert!(!protocol.is_running());
        assert_eq!(probe.state(), ProbeState::Uninitialized);
        assert_eq!(sink.starts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_probes_started_leaves_sink_untouched() {
        let sink = Arc::new(TrackingSink::default());
        let protocol = Protocol::new("study", sink.clone());
        protocol.add_probe(ScriptedProbe::new("a", true, false)).unwrap();
        protocol.add_probe(ScriptedProbe::new("b", false, true)).unwrap();

        assert_eq!(protocol.start(), StartOutcome::NoProbesStarted);
        assert!(!protocol.is_running());
        assert_eq!(sink.starts.load(Ordering::SeqCst), 0);
        assert_eq!(sink.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_initialize_failure_does_not_block_others() {
        let sink = Arc::new(TrackingSink::default());
        let protocol = Protocol::new("study", sink.clone());
        let broken = ScriptedProbe::new("broken", true, false);
        let working = ScriptedProbe::new("working", false, false);
        protocol.add_probe(broken.clone()).unwrap();
        protocol.add_probe(working.clone()).unwrap();

        protocol.set_running(true);
        assert!(protocol.is_running());
        assert_eq!(broken.state(), ProbeState::Uninitialized);
        assert_eq!(working.state(), ProbeState::Started);
        assert_eq!(sink.starts.load(Ordering::SeqCst), 1);

        protocol.set_running(false);
        assert_eq!(working.state(), ProbeState::Stopped);
        assert_eq!(sink.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_running_is_idempotent() {
        let sink = Arc::new(TrackingSink::default());
        let protocol = Protocol::new("study", sink.clone());
        protocol.add_probe(ScriptedProbe::new("gps", false, false)).unwrap();

        protocol.set_running(false);
        assert_eq!(sink.stops.load(Ordering::SeqCst), 0);

        assert_eq!(protocol.start(), StartOutcome::Started(1));
        assert_eq!(protocol.start(), StartOutcome::AlreadyRunning);
        assert_eq!(sink.starts.load(Ordering::SeqCst), 1);

        protocol.stop();
        protocol.stop();
        assert_eq!(sink.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_restart_reinitializes_probes() {
        let protocol = Protocol::new("study", Arc::new(LocalDataStore::in_memory()));
        let probe = ScriptedProbe::new("gps", false, false);
        protocol.add_probe(probe.clone()).unwrap();

        protocol.set_running(true);
        protocol.set_running(false);
        protocol.set_running(true);
        assert_eq!(probe.state(), ProbeState::Started);
    }

    #[test]
    fn test_probe_changes_relayed_until_removed() {
        let protocol = Protocol::new("study", Arc::new(TrackingSink::default()));
        let probe = ScriptedProbe::new("gps", false, false);
        protocol.add_probe(probe.clone()).unwrap();

        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        protocol.notifier().subscribe(Arc::new(move |change: &PropertyChange| {
            if change.attribute == attribute::PROBES {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        probe.set(ProbeState::Initialized);
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        protocol.remove_probe("gps").unwrap();
        assert_eq!(changes.load(Ordering::SeqCst), 2);
        assert_eq!(probe.notifier().subscriber_count(), 0);

        probe.set(ProbeState::Started);
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_name_change_notifies_once() {
        let protocol = Protocol::new("study", Arc::new(TrackingSink::default()));
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        protocol.notifier().subscribe(Arc::new(move |_change: &PropertyChange| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        protocol.set_name("study");
        protocol.set_name("pilot");
        assert_eq!(protocol.name(), "pilot");
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_can_stop_protocol_it_was_notified_by() {
        let sink = Arc::new(TrackingSink::default());
        let protocol = Arc::new(Protocol::new("study", sink.clone()));
        let probe = ScriptedProbe::new("gps", false, false);
        protocol.add_probe(probe.clone()).unwrap();

        let weak = Arc::downgrade(&protocol);
        let stopped = Arc::new(AtomicBool::new(false));
        let once = Arc::clone(&stopped);
        protocol.notifier().subscribe(Arc::new(move |change: &PropertyChange| {
            if change.attribute != attribute::PROBES {
                return;
            }
            if let Some(protocol) = weak.upgrade() {
                if protocol.is_running() && !once.swap(true, Ordering::SeqCst) {
                    protocol.stop();
                }
            }
        }));

        let (tx, rx) = crossbeam_channel::bounded(1);
        let starter = {
            let protocol = Arc::clone(&protocol);
            std::thread::spawn(move || {
                let _ = tx.send(protocol.start());
            })
        };

        let outcome = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        starter.join().unwrap();
        assert_eq!(outcome, StartOutcome::Started(1));
        assert!(stopped.load(Ordering::SeqCst));
        assert!(!protocol.is_running());
        assert_eq!(probe.state(), ProbeState::Stopped);
        assert_eq!(sink.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_events_published_after_transition() {
        let protocol = Arc::new(Protocol::new("study", Arc::new(TrackingSink::default())));
        protocol.add_probe(ScriptedProbe::new("gps", false, false)).unwrap();

        let weak = Arc::downgrade(&protocol);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        protocol.notifier().subscribe(Arc::new(move |change: &PropertyChange| {
            let running = weak.upgrade().map(|protocol| protocol.is_running());
            log.lock().push((change.attribute, running));
        }));

        assert_eq!(protocol.start(), StartOutcome::Started(1));
        let seen = seen.lock().clone();
        assert_eq!(seen.first(), Some(&(attribute::RUNNING, Some(true))));
        assert_eq!(seen.iter().filter(|(name, _)| *name == attribute::PROBES).count(), 2);
    }

    #[test]
    fn test_probe_set_locked_while_running() {
        let protocol = Protocol::new("study", Arc::new(TrackingSink::default()));
        protocol.add_probe(ScriptedProbe::new("gps", false, false)).unwrap();
        assert!(matches!(
            protocol.add_probe(ScriptedProbe::new("gps", false, false)),
            Err(ProtocolError::DuplicateProbe(_))
        ));

        protocol.set_running(true);
        assert!(matches!(
            protocol.add_probe(ScriptedProbe::new("other", false, false)),
            Err(ProtocolError::Running)
        ));
        assert!(matches!(protocol.remove_probe("gps"), Err(ProtocolError::Running)));
    }
}
