//! Injectable time and sleeping.
//!
//! The control loop never reads the wall clock or sleeps directly; it goes
//! through these traits so tests can drive it with a manual clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::debug;

/// Source of the current time.
pub trait TimeService: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock.
#[derive(Debug, Default, Clone)]
pub struct SystemTimeService;

impl TimeService for SystemTimeService {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualTimeService {
    now: Mutex<DateTime<Utc>>,
}

impl ManualTimeService {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let step = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = now.checked_add_signed(step).unwrap_or(*now);
    }
}

impl Default for ManualTimeService {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl TimeService for ManualTimeService {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Sleeps between poll cycles, and can be woken early.
#[async_trait]
pub trait TimedSleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);

    /// Ends the current sleep, or the next one if nobody is sleeping.
    fn interrupt(&self, reason: &str);
}

/// Real sleeper which races the timer against an interrupt.
#[derive(Debug, Default)]
pub struct InterruptibleSleeper {
    wake: Notify,
}

impl InterruptibleSleeper {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimedSleeper for InterruptibleSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => debug!("Sleep interrupted"),
        }
    }

    fn interrupt(&self, reason: &str) {
        debug!(reason, "Interrupting sleep");
        self.wake.notify_one();
    }
}

/// Test sleeper: returns at once and moves a [`ManualTimeService`] forward.
#[derive(Debug)]
pub struct ManualSleeper {
    time: Arc<ManualTimeService>,
    slept: Mutex<Vec<Duration>>,
    interrupts: Mutex<Vec<String>>,
}

impl ManualSleeper {
    pub fn new(time: Arc<ManualTimeService>) -> Self {
        Self {
            time,
            slept: Mutex::new(Vec::new()),
            interrupts: Mutex::new(Vec::new()),
        }
    }

    /// Every duration slept so far, in order.
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn interrupts(&self) -> Vec<String> {
        self.interrupts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl TimedSleeper for ManualSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(duration);
        self.time.advance(duration);
        tokio::task::yield_now().await;
    }

    fn interrupt(&self, reason: &str) {
        self.interrupts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(reason.to_string());
    }
}
