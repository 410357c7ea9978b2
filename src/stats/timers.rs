use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::clock::{SharedClock, nanos_since};

const EMPTY_SLOT: u64 = 0;

/// Start times of operations that are still running.
///
/// A fixed number of slots hold start timestamps; past that capacity timers
/// are still counted but their age is not tracked.
pub struct RunningTimers {
    clock: SharedClock,
    origin: Instant,
    slots: Box<[AtomicU64]>,
    active: AtomicUsize,
    next_slot: AtomicUsize,
}

/// Handle for one running operation; stops the timer when dropped.
#[must_use = "the timer stops as soon as the handle is dropped"]
pub struct RunningTimer {
    timers: Arc<RunningTimers>,
    slot: Option<usize>,
}

impl RunningTimers {
    pub fn new(clock: SharedClock, tracked_slots: usize) -> Self {
        let origin = clock.now();
        Self {
            clock,
            origin,
            slots: (0..tracked_slots.max(1))
                .map(|_| AtomicU64::new(EMPTY_SLOT))
                .collect(),
            active: AtomicUsize::new(0),
            next_slot: AtomicUsize::new(0),
        }
    }

    pub fn start(self: &Arc<Self>) -> RunningTimer {
        self.active.fetch_add(1, Ordering::AcqRel);
        // Stamps are offset by one so that zero can mark an empty slot.
        let stamp = nanos_since(self.origin, self.clock.now()).saturating_add(1);
        let len = self.slots.len();
        let first = self.next_slot.fetch_add(1, Ordering::Relaxed) % len;
        let slot = (0..len).map(|offset| (first + offset) % len).find(|&index| {
            self.slots[index]
                .compare_exchange(EMPTY_SLOT, stamp, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        });
        RunningTimer {
            timers: Arc::clone(self),
            slot,
        }
    }

    pub fn count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Age of the longest-running tracked operation.
    pub fn oldest(&self) -> Option<Duration> {
        let now = nanos_since(self.origin, self.clock.now()).saturating_add(1);
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|stamp| *stamp != EMPTY_SLOT)
            .min()
            .map(|stamp| Duration::from_nanos(now.saturating_sub(stamp)))
    }
}

impl Drop for RunningTimer {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.timers.slots[slot].store(EMPTY_SLOT, Ordering::Release);
        }
        self.timers.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for RunningTimers {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RunningTimers")
            .field("active", &self.count())
            .field("slots", &self.slots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::RunningTimers;
    use crate::clock::ManualClock;

    #[test]
    fn tracks_count_and_oldest_age() {
        let clock = Arc::new(ManualClock::new());
        let timers = Arc::new(RunningTimers::new(clock.clone(), 4));
        assert_eq!(timers.oldest(), None);

        let first = timers.start();
        clock.advance(Duration::from_secs(3));
        let second = timers.start();
        clock.advance(Duration::from_secs(1));

        assert_eq!(timers.count(), 2);
        assert_eq!(timers.oldest(), Some(Duration::from_secs(4)));

        drop(first);
        assert_eq!(timers.count(), 1);
        assert_eq!(timers.oldest(), Some(Duration::from_secs(1)));

        drop(second);
        assert_eq!(timers.count(), 0);
        assert_eq!(timers.oldest(), None);
    }

    #[test]
    fn overflow_timers_are_counted_but_untimed() {
        let clock = Arc::new(ManualClock::new());
        let timers = Arc::new(RunningTimers::new(clock, 1));
        let handles: Vec<_> = (0..3).map(|_| timers.start()).collect();
        assert_eq!(timers.count(), 3);
        drop(handles);
        assert_eq!(timers.count(), 0);
    }
}
