use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;

use crate::util::lock_unpoisoned;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    /// Resolves once `duration` has passed on this clock.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
///
/// Sleeps started on it complete when [`ManualClock::advance`] reaches their
/// deadline.
pub struct ManualClock {
    origin: Instant,
    system_origin: SystemTime,
    offset_nanos: AtomicU64,
    sleepers: Mutex<Vec<(u64, oneshot::Sender<()>)>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            system_origin: SystemTime::now(),
            offset_nanos: AtomicU64::new(0),
            sleepers: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        let due: Vec<oneshot::Sender<()>> = {
            // Held across the update so no sleep registers against a stale offset.
            let mut sleepers = lock_unpoisoned(&self.sleepers);
            let now = self
                .offset_nanos
                .fetch_add(nanos, Ordering::SeqCst)
                .saturating_add(nanos);
            let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut *sleepers)
                .into_iter()
                .partition(|(deadline, _)| *deadline <= now);
            *sleepers = waiting;
            due.into_iter().map(|(_, sender)| sender).collect()
        };
        for sender in due {
            let _ = sender.send(());
        }
    }

    fn offset(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.offset()
    }

    fn now_system(&self) -> SystemTime {
        self.system_origin + self.offset()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        if duration.is_zero() {
            return futures_util::future::ready(()).boxed();
        }
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let (sender, receiver) = oneshot::channel();
        let mut sleepers = lock_unpoisoned(&self.sleepers);
        let deadline = self.offset_nanos.load(Ordering::SeqCst).saturating_add(nanos);
        sleepers.push((deadline, sender));
        drop(sleepers);
        receiver.map(|_| ()).boxed()
    }
}

impl std::fmt::Debug for ManualClock {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ManualClock")
            .field("offset", &self.offset())
            .field("sleepers", &lock_unpoisoned(&self.sleepers).len())
            .finish()
    }
}

pub(crate) fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Nanoseconds elapsed since `origin`, saturating into `u64`.
pub(crate) fn nanos_since(origin: Instant, now: Instant) -> u64 {
    u64::try_from(now.saturating_duration_since(origin).as_nanos()).unwrap_or(u64::MAX)
}
