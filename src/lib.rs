//! Sensus Collector - probe-based mobile sensing runtime.
//!
//! This library runs a research protocol: a set of probes that acquire
//! sensor data under rate limits and hand it to a data store, plus surveys
//! (scripts of prompts) that are scheduled, asked one prompt at a time, and
//! reported back as data.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Protocol                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │ GpsReceiver │──▶│   Probes    │──▶│  DataStore  │       │
//! │  │ (push/pull) │   │ (listening/ │   │   (sink)    │       │
//! │  └─────────────┘   │  polling)   │   └─────────────┘       │
//! │                    └─────────────┘          ▲              │
//! │  ┌─────────────┐   ┌─────────────┐          │              │
//! │  │  Scheduler  │──▶│   Script    │──────────┘              │
//! │  │   (tokio)   │   │  (prompts)  │                         │
//! │  └─────────────┘   └─────────────┘                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use sensus_collector::datastore::LocalDataStore;
//! use sensus_collector::probe::{GpsReceiver, LocationMeasure, WakeLock};
//! use sensus_collector::Protocol;
//! use std::sync::Arc;
//!
//! let receiver = Arc::new(GpsReceiver::new());
//! let protocol = Protocol::new("Study", Arc::new(LocalDataStore::in_memory()));
//! let probe = LocationMeasure::Location.listening_probe(receiver, WakeLock::default(), 1.0);
//! protocol.add_probe(Arc::new(probe)).expect("protocol is stopped");
//!
//! protocol.start();
//! // ...
//! protocol.stop();
//! ```

pub mod config;
pub mod datastore;
pub mod notify;
pub mod probe;
pub mod protocol;
pub mod script;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError, LocationConfig, ProbeMode, ScriptConfig};
pub use datastore::{DataStoreError, DataStoreSink, LocalDataStore, SharedSink};
pub use notify::{ChangeNotifier, PropertyChange};
pub use probe::{Datum, DatumKind, Probe, ProbeError, ProbeState, SharedProbe};
pub use protocol::{Protocol, ProtocolError, StartOutcome};
pub use script::{Prompt, PromptInput, Scheduler, Script, ScriptError, TokioScheduler};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
