use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::clock::{SharedClock, nanos_since};

const TAG_BITS: u32 = 24;
const COUNT_BITS: u32 = 64 - TAG_BITS;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

/// Event counts over a trailing time window, kept in a ring of buckets.
///
/// Each bucket packs a truncated bucket epoch with its count into one atomic
/// word, so a writer that lands on a bucket left over from an earlier lap
/// resets it in the same compare-and-swap that records the event.
pub struct SlidingWindow {
    clock: SharedClock,
    origin: Instant,
    bucket_nanos: u64,
    buckets: Box<[AtomicU64]>,
}

impl SlidingWindow {
    pub fn new(clock: SharedClock, window: Duration, bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        let window_nanos = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX).max(1);
        let origin = clock.now();
        Self {
            clock,
            origin,
            bucket_nanos: (window_nanos / bucket_count as u64).max(1),
            buckets: (0..bucket_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn record(&self, count: u64) {
        let epoch = self.current_epoch();
        let tag = epoch & TAG_MASK;
        let bucket = &self.buckets[self.bucket_index(epoch)];
        let _ = bucket.fetch_update(Ordering::AcqRel, Ordering::Acquire, |packed| {
            let (stored_tag, stored_count) = unpack(packed);
            if stored_tag == tag {
                Some(pack(tag, stored_count.saturating_add(count)))
            } else {
                Some(pack(tag, count))
            }
        });
    }

    pub fn increment(&self) {
        self.record(1);
    }

    /// Sum of the events recorded within the window ending now.
    pub fn sum(&self) -> u64 {
        let epoch = self.current_epoch();
        let tag = epoch & TAG_MASK;
        let span = self.buckets.len() as u64;
        self.buckets
            .iter()
            .map(|bucket| unpack(bucket.load(Ordering::Acquire)))
            .filter(|(stored_tag, _)| (tag.wrapping_sub(*stored_tag) & TAG_MASK) < span)
            .map(|(_, count)| count)
            .fold(0_u64, u64::saturating_add)
    }

    fn current_epoch(&self) -> u64 {
        nanos_since(self.origin, self.clock.now()) / self.bucket_nanos
    }

    fn bucket_index(&self, epoch: u64) -> usize {
        (epoch % self.buckets.len() as u64) as usize
    }
}

fn pack(tag: u64, count: u64) -> u64 {
    (tag << COUNT_BITS) | count.min(COUNT_MASK)
}

fn unpack(packed: u64) -> (u64, u64) {
    (packed >> COUNT_BITS, packed & COUNT_MASK)
}

impl std::fmt::Debug for SlidingWindow {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SlidingWindow")
            .field("bucket_nanos", &self.bucket_nanos)
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::SlidingWindow;
    use crate::clock::ManualClock;

    #[test]
    fn events_expire_after_window() {
        let clock = Arc::new(ManualClock::new());
        let window = SlidingWindow::new(clock.clone(), Duration::from_secs(10), 10);

        window.record(3);
        clock.advance(Duration::from_secs(4));
        window.increment();
        assert_eq!(window.sum(), 4);

        clock.advance(Duration::from_secs(7));
        assert_eq!(window.sum(), 1);

        clock.advance(Duration::from_secs(10));
        assert_eq!(window.sum(), 0);
    }

    #[test]
    fn lapped_bucket_is_reset_on_write() {
        let clock = Arc::new(ManualClock::new());
        let window = SlidingWindow::new(clock.clone(), Duration::from_secs(2), 2);

        window.record(5);
        clock.advance(Duration::from_secs(2));
        window.record(1);
        assert_eq!(window.sum(), 1);
    }

    #[test]
    fn concurrent_records_are_counted() {
        let clock = Arc::new(ManualClock::new());
        let window = Arc::new(SlidingWindow::new(clock, Duration::from_secs(60), 6));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let window = Arc::clone(&window);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        window.increment();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker thread");
        }
        assert_eq!(window.sum(), 4000);
    }
}
