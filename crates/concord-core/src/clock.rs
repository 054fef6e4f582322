//! Time abstraction
//!
//! The relay grace window is the only timer in the connector. It goes
//! through [`Clock`] so tests can drive it with [`ManualClock`] instead of
//! waiting on real time.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Time abstraction for testability
pub trait Clock: Send + Sync + 'static {
    /// Get the current instant (monotonic time)
    fn now(&self) -> Instant;

    /// Get the current UTC datetime
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleep for a duration (async)
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Real clock backed by Tokio's timer
///
/// `now` reads Tokio's clock so that paused test runtimes see the same
/// virtual time as `sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that only advances when [`ManualClock::advance`] is called
///
/// Clones share the same timeline. Sleepers wake as soon as the elapsed
/// time reaches their deadline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<ManualClockInner>,
}

#[derive(Debug)]
struct ManualClockInner {
    origin: Instant,
    origin_utc: DateTime<Utc>,
    elapsed: watch::Sender<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant
    pub fn new() -> Self {
        let (elapsed, _) = watch::channel(Duration::ZERO);
        Self {
            inner: Arc::new(ManualClockInner {
                origin: Instant::now(),
                origin_utc: Utc::now(),
                elapsed,
            }),
        }
    }

    /// Move time forward, waking every sleeper whose deadline has passed
    pub fn advance(&self, by: Duration) {
        self.inner.elapsed.send_modify(|elapsed| *elapsed += by);
    }

    /// Total time advanced since creation
    pub fn elapsed(&self) -> Duration {
        *self.inner.elapsed.borrow()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner.origin + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let offset =
            chrono::Duration::from_std(self.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.inner.origin_utc + offset
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        let mut elapsed = self.inner.elapsed.subscribe();
        let deadline = *elapsed.borrow() + duration;
        async move {
            // A dropped clock can never reach the deadline; wake instead of hanging.
            let _ = elapsed.wait_for(|now| *now >= deadline).await;
        }
    }
}
