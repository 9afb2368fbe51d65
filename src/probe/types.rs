//! Readings and lifecycle types shared by every probe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle state of a probe.
///
/// `Stopped` ends a run; a stopped probe may be initialized again for the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeState {
    Uninitialized,
    Initialized,
    Started,
    Stopped,
}

impl std::fmt::Display for ProbeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProbeState::Uninitialized => "uninitialized",
            ProbeState::Initialized => "initialized",
            ProbeState::Started => "started",
            ProbeState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What a datum measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatumKind {
    Location {
        latitude: f64,
        longitude: f64,
        /// Horizontal accuracy in meters
        accuracy: f64,
    },
    Altitude {
        meters: f64,
    },
    Speed {
        meters_per_second: f64,
    },
    /// A user's answer to one prompt of a script
    ScriptResponse {
        script_id: String,
        prompt_id: String,
        response: serde_json::Value,
    },
}

/// One immutable, timestamped reading.
///
/// Ownership passes to the data store once a probe hands it over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    id: Uuid,
    probe_id: String,
    timestamp: DateTime<Utc>,
    kind: DatumKind,
}

impl Datum {
    /// Create a datum stamped with the current time.
    pub fn new(probe_id: impl Into<String>, kind: DatumKind) -> Self {
        Self::at(probe_id, Utc::now(), kind)
    }

    /// Create a datum with an explicit timestamp.
    pub fn at(probe_id: impl Into<String>, timestamp: DateTime<Utc>, kind: DatumKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            probe_id: probe_id.into(),
            timestamp,
            kind,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Identifier of the probe (or script) that produced this datum.
    pub fn probe_id(&self) -> &str {
        &self.probe_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn kind(&self) -> &DatumKind {
        &self.kind
    }
}

/// Counters kept by each probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeStats {
    /// Data handed to the data store
    pub stored: u64,
    /// Data dropped by the rate limiter
    pub rate_limited: u64,
}

/// Errors raised by a reading source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("no reading within {0} ms")]
    Timeout(u64),

    #[error("reading source unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by probe lifecycle operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("cannot {operation} probe in state {state}")]
    InvalidTransition {
        operation: &'static str,
        state: ProbeState,
    },

    #[error("probe initialization failed: {0}")]
    Initialization(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("failed to spawn poll thread: {0}")]
    Thread(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datum_serializes_with_kind_tag() {
        let datum = Datum::new(
            "gps",
            DatumKind::Location {
                latitude: 38.03,
                longitude: -78.5,
                accuracy: 5.0,
            },
        );

        let json = serde_json::to_value(&datum).unwrap();
        assert_eq!(json["kind"]["type"], "location");
        assert_eq!(json["probe_id"], "gps");
    }

    #[test]
    fn test_distinct_ids() {
        let a = Datum::new("p", DatumKind::Altitude { meters: 1.0 });
        let b = Datum::new("p", DatumKind::Altitude { meters: 1.0 });
        assert_ne!(a.id(), b.id());
    }
}
