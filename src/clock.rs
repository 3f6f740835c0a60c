//! Time abstraction for testable delays and expirations.
//!
//! Retry backoff, KV entry TTLs, and signature time windows all consult a
//! [`Clock`] instead of the system time directly, so tests can advance time
//! without real sleeps.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::sleep as tokio_sleep;

/// Source of the current instant and of delays.
#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time.
    #[must_use]
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Production clock backed by the system time and tokio's timer.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Creates a new system clock.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Creates a shared system clock.
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio_sleep(duration).await;
    }
}

/// Test clock with a manually advanced instant.
///
/// `sleep` advances the clock immediately instead of waiting, yielding once
/// so concurrent tasks get a chance to run.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<std::sync::Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Creates a manual clock starting at the given instant.
    #[must_use]
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(std::sync::Mutex::new(now)),
        }
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now += TimeDelta::from_std(delta).unwrap_or(TimeDelta::MAX);
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
