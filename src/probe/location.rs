//! Location probes over a shared GPS receiver.
//!
//! The platform location binding publishes positions into a [`GpsReceiver`],
//! which fans them out to listening probes and serves polling probes. On hosts
//! without a receiver, [`SimulatedGps`] publishes a random walk instead.

use crate::probe::listening::ListeningProbe;
use crate::probe::polling::PollingProbe;
use crate::probe::source::{Listener, ListenerId, PullSource, PushSource};
use crate::probe::types::{DatumKind, SourceError};
use crate::probe::wake_lock::WakeLock;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// A fix reported by the GPS hardware.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Meters above sea level, when the fix includes it
    pub altitude: Option<f64>,
    /// Horizontal accuracy in meters
    pub accuracy: f64,
    /// Ground speed, when the fix includes it
    pub speed: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: None,
            accuracy: 0.0,
            speed: None,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Default)]
struct Latest {
    sequence: u64,
    position: Option<Position>,
}

/// Shared GPS receiver.
///
/// Pushes every published position to its listeners; `get_reading` waits for a
/// fresh one, or returns the latest if it is younger than the configured max age.
pub struct GpsReceiver {
    listeners: RwLock<Vec<(ListenerId, Listener<Position>)>>,
    next_listener: AtomicU64,
    latest: Mutex<Latest>,
    published: Condvar,
    max_reading_age: Option<chrono::Duration>,
}

impl GpsReceiver {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            latest: Mutex::new(Latest::default()),
            published: Condvar::new(),
            max_reading_age: None,
        }
    }

    /// Let `get_reading` reuse a cached position younger than `age`.
    pub fn with_max_reading_age(mut self, age: Duration) -> Self {
        self.max_reading_age = chrono::Duration::from_std(age).ok();
        self
    }

    /// Publish a new position to listeners and waiting pollers.
    pub fn publish(&self, position: Position) {
        {
            let mut latest = self.latest.lock();
            latest.sequence += 1;
            latest.position = Some(position);
        }
        self.published.notify_all();

        let listeners: Vec<Listener<Position>> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        trace!(listeners = listeners.len(), "Received position change notification");

        for listener in listeners {
            listener(position);
        }
    }

    pub fn latest(&self) -> Option<Position> {
        self.latest.lock().position
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl Default for GpsReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl PushSource for GpsReceiver {
    type Reading = Position;

    fn add_listener(&self, listener: Listener<Position>) -> Result<ListenerId, SourceError> {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        Ok(id)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }
}

impl PullSource for GpsReceiver {
    type Reading = Position;

    fn get_reading(&self, timeout: Duration) -> Result<Position, SourceError> {
        let mut latest = self.latest.lock();

        if let (Some(max_age), Some(position)) = (self.max_reading_age, latest.position) {
            if Utc::now() - position.timestamp <= max_age {
                return Ok(position);
            }
        }

        let seen = latest.sequence;
        let deadline = Instant::now() + timeout;
        while latest.sequence == seen {
            if self.published.wait_until(&mut latest, deadline).timed_out() {
                break;
            }
        }

        match latest.position {
            Some(position) if latest.sequence != seen => Ok(position),
            _ => Err(SourceError::Timeout(timeout.as_millis() as u64)),
        }
    }
}

/// Which part of a GPS fix a probe records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationMeasure {
    Location,
    Altitude,
    Speed,
}

impl LocationMeasure {
    pub fn display_name(self) -> &'static str {
        match self {
            LocationMeasure::Location => "Location",
            LocationMeasure::Altitude => "Altitude",
            LocationMeasure::Speed => "Speed",
        }
    }

    /// Convert a fix to this measure's datum, if the fix carries it.
    pub fn convert(self, position: Position) -> Option<DatumKind> {
        match self {
            LocationMeasure::Location => Some(DatumKind::Location {
                latitude: position.latitude,
                longitude: position.longitude,
                accuracy: position.accuracy,
            }),
            LocationMeasure::Altitude => position.altitude.map(|meters| DatumKind::Altitude { meters }),
            LocationMeasure::Speed => position
                .speed
                .map(|meters_per_second| DatumKind::Speed { meters_per_second }),
        }
    }

    pub fn listening_probe(
        self,
        receiver: Arc<GpsReceiver>,
        wake_lock: WakeLock,
        max_data_per_second: f64,
    ) -> ListeningProbe<Arc<GpsReceiver>> {
        ListeningProbe::new(self.display_name(), receiver, wake_lock, move |position| {
            self.convert(position)
        })
        .with_max_data_per_second(max_data_per_second)
    }

    pub fn polling_probe(
        self,
        receiver: Arc<GpsReceiver>,
        interval: Duration,
        timeout: Duration,
    ) -> PollingProbe<Arc<GpsReceiver>> {
        PollingProbe::new(self.display_name(), receiver, interval, timeout, move |position| {
            self.convert(position)
        })
    }
}

/// Background driver publishing a random walk into a receiver.
pub struct SimulatedGps {
    receiver: Arc<GpsReceiver>,
    period: Duration,
    origin: (f64, f64),
    stop: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl SimulatedGps {
    pub fn new(receiver: Arc<GpsReceiver>, period: Duration) -> Self {
        Self {
            receiver,
            period,
            // Charlottesville, VA
            origin: (38.0336, -78.508),
            stop: None,
            thread_handle: None,
        }
    }

    pub fn with_origin(mut self, latitude: f64, longitude: f64) -> Self {
        self.origin = (latitude, longitude);
        self
    }

    /// Start publishing in a background thread.
    pub fn start(&mut self) -> Result<(), std::io::Error> {
        if self.is_running() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let receiver = Arc::clone(&self.receiver);
        let period = self.period;
        let (mut latitude, mut longitude) = self.origin;

        let handle = thread::Builder::new()
            .name("simulated-gps".to_string())
            .spawn(move || {
                let mut rng = rand::thread_rng();
                let mut altitude = 150.0;
                loop {
                    latitude += rng.gen_range(-1e-4..1e-4);
                    longitude += rng.gen_range(-1e-4..1e-4);
                    altitude += rng.gen_range(-0.5..0.5);

                    receiver.publish(Position {
                        latitude,
                        longitude,
                        altitude: Some(altitude),
                        accuracy: rng.gen_range(3.0..15.0),
                        speed: Some(rng.gen_range(0.0..2.0)),
                        timestamp: Utc::now(),
                    });

                    match stop_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        debug!(period_ms = self.period.as_millis() as u64, "Simulated GPS started");
        self.stop = Some(stop_tx);
        self.thread_handle = Some(handle);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }
}

impl Drop for SimulatedGps {
    fn drop(&mut self) {
        self.stop();
    }
}
