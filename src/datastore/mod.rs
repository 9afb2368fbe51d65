//! Data store boundary.
//!
//! Probes and protocols only see the narrow [`DataStoreSink`] contract; how the
//! buffered data is persisted is up to the implementation.

pub mod local;

pub use local::{DataStoreStats, LocalDataStore};

use crate::probe::Datum;
use std::sync::Arc;
use thiserror::Error;

/// Sink that accepted data is written into.
pub trait DataStoreSink: Send + Sync {
    /// Check the store is usable before a protocol starts.
    fn test(&self) -> Result<(), DataStoreError>;

    /// Open the store for the named protocol.
    fn start(&self, protocol_name: &str) -> Result<(), DataStoreError>;

    /// Close the store, flushing anything buffered.
    fn stop(&self) -> Result<(), DataStoreError>;

    /// Take ownership of a datum.
    fn accept(&self, datum: Datum);
}

/// Thread-safe shared sink.
pub type SharedSink = Arc<dyn DataStoreSink>;

/// Data store errors.
#[derive(Debug, Error)]
pub enum DataStoreError {
    #[error("data store test failed: {0}")]
    TestFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
