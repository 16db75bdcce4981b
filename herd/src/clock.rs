//! Time sources.
//!
//! Everything in the engine that waits or timestamps goes through a [`Clock`],
//! so retry delays, polling intervals and inactivity windows can be driven
//! by a [`ManualClock`] in tests without real delays.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{oneshot, Notify};

/// Source of the current time and of delayed wakeups.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Convert a chrono delta into a std duration, clamping negatives to zero.
pub fn elapsed_since(clock: &dyn Clock, earlier: DateTime<Utc>) -> Duration {
    (clock.now() - earlier).to_std().unwrap_or(Duration::ZERO)
}

/// Repeating timer driven by a [`Clock`].
#[derive(Debug, Clone)]
pub struct Ticker {
    clock: Arc<dyn Clock>,
    period: Duration,
}

impl Ticker {
    pub fn new(clock: Arc<dyn Clock>, period: Duration) -> Self {
        Self { clock, period }
    }

    /// Wait for the next tick.
    pub async fn tick(&mut self) {
        self.clock.sleep(self.period).await;
    }

    pub const fn period(&self) -> Duration {
        self.period
    }
}

/// Real time, backed by tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock that only moves when told to.
///
/// Sleepers stay suspended until [`ManualClock::advance`] moves time past
/// their deadline. Every requested sleep is recorded so tests can assert on
/// the delays an algorithm asked for.
#[derive(Debug)]
pub struct ManualClock {
    inner: Mutex<ManualInner>,
    changed: Notify,
}

#[derive(Debug)]
struct ManualInner {
    now: DateTime<Utc>,
    sleepers: Vec<Sleeper>,
    history: Vec<Duration>,
}

#[derive(Debug)]
struct Sleeper {
    deadline: DateTime<Utc>,
    wake: oneshot::Sender<()>,
}

impl ManualClock {
    /// Start the clock at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(ManualInner {
                now: start,
                sleepers: Vec::new(),
                history: Vec::new(),
            }),
            changed: Notify::new(),
        }
    }

    /// Move time forward and wake every sleeper whose deadline has passed.
    pub fn advance(&self, by: Duration) {
        let due = {
            let mut inner = self.lock();
            inner.now += to_delta(by);
            let now = inner.now;
            let (due, pending): (Vec<_>, Vec<_>) = inner
                .sleepers
                .drain(..)
                .partition(|s| s.deadline <= now);
            inner.sleepers = pending;
            due
        };
        for sleeper in due {
            let _ = sleeper.wake.send(());
        }
        self.changed.notify_waiters();
    }

    /// Number of tasks currently suspended in [`Clock::sleep`].
    pub fn pending_sleepers(&self) -> usize {
        self.lock()
            .sleepers
            .iter()
            .filter(|s| !s.wake.is_closed())
            .count()
    }

    /// Wait until at least `count` tasks are suspended on this clock.
    pub async fn wait_for_sleepers(&self, count: usize) {
        loop {
            let notified = self.changed.notified();
            if self.pending_sleepers() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Every duration passed to [`Clock::sleep`], in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().history.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ManualInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        let wake = {
            let mut inner = self.lock();
            inner.history.push(duration);
            if duration.is_zero() {
                return;
            }
            let (tx, rx) = oneshot::channel();
            let deadline = inner.now + to_delta(duration);
            inner.sleepers.push(Sleeper { deadline, wake: tx });
            rx
        };
        self.changed.notify_waiters();
        let _ = wake.await;
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_sleep_waits_for_advance() {
        let clock = Arc::new(ManualClock::default());
        let start = clock.now();

        let sleeper = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep(Duration::from_secs(10)).await })
        };

        clock.wait_for_sleepers(1).await;
        clock.advance(Duration::from_secs(5));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(5));
        sleeper.await.unwrap();

        assert_eq!(clock.now() - start, TimeDelta::seconds(10));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(10)]);
        assert_eq!(clock.pending_sleepers(), 0);
    }

    #[tokio::test]
    async fn test_zero_sleep_returns_immediately() {
        let clock = ManualClock::default();
        clock.sleep(Duration::ZERO).await;
        assert_eq!(clock.sleeps(), vec![Duration::ZERO]);
    }

    #[tokio::test]
    async fn test_elapsed_is_measured_on_the_clock() {
        let clock = ManualClock::default();
        let start = clock.now();
        clock.advance(Duration::from_millis(150));
        assert_eq!(elapsed_since(&clock, start), Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_ticker_fires_once_per_period() {
        let clock = Arc::new(ManualClock::default());
        let mut ticker = Ticker::new(clock.clone(), Duration::from_secs(1));

        let ticks = tokio::spawn(async move {
            ticker.tick().await;
            ticker.tick().await;
        });

        for _ in 0..2 {
            clock.wait_for_sleepers(1).await;
            clock.advance(Duration::from_secs(1));
        }
        ticks.await.unwrap();
        assert_eq!(clock.sleeps().len(), 2);
    }
}
