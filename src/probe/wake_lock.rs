//! Device wake lock shared by listening probes.
//!
//! The device stays awake while at least one guard is alive. Guards release on
//! drop, so every exit path out of a probe start or stop gives the lock back.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Platform hook that actually keeps the device awake.
pub trait PowerControl: Send + Sync {
    fn keep_awake(&self);
    fn allow_sleep(&self);
}

/// Power control for hosts without a sleep policy (desktop, tests).
#[derive(Debug, Default)]
pub struct NoopPowerControl;

impl PowerControl for NoopPowerControl {
    fn keep_awake(&self) {
        debug!("Keeping device awake");
    }

    fn allow_sleep(&self) {
        debug!("Letting device sleep");
    }
}

struct Inner {
    holders: Mutex<usize>,
    power: Arc<dyn PowerControl>,
}

/// Reference-counted device wake lock.
#[derive(Clone)]
pub struct WakeLock {
    inner: Arc<Inner>,
}

impl WakeLock {
    pub fn new(power: Arc<dyn PowerControl>) -> Self {
        Self {
            inner: Arc::new(Inner {
                holders: Mutex::new(0),
                power,
            }),
        }
    }

    /// Take a hold on the lock. The device is kept awake until the guard drops.
    pub fn acquire(&self) -> WakeLockGuard {
        let mut holders = self.inner.holders.lock();
        *holders += 1;
        if *holders == 1 {
            self.inner.power.keep_awake();
        }

        WakeLockGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of live guards.
    pub fn holders(&self) -> usize {
        *self.inner.holders.lock()
    }

    pub fn is_held(&self) -> bool {
        self.holders() > 0
    }
}

impl Default for WakeLock {
    fn default() -> Self {
        Self::new(Arc::new(NoopPowerControl))
    }
}

impl std::fmt::Debug for WakeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeLock")
            .field("holders", &self.holders())
            .finish()
    }
}

/// A live hold on a [`WakeLock`].
#[must_use = "the wake lock is released as soon as the guard is dropped"]
pub struct WakeLockGuard {
    inner: Arc<Inner>,
}

impl Drop for WakeLockGuard {
    fn drop(&mut self) {
        let mut holders = self.inner.holders.lock();
        *holders = holders.saturating_sub(1);
        if *holders == 0 {
            self.inner.power.allow_sleep();
        }
    }
}

impl std::fmt::Debug for WakeLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WakeLockGuard")
    }
}
