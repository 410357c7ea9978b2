use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::clock::{SharedClock, nanos_since};

const DECAY_STEPS_PER_HALF_LIFE: u64 = 16;

/// A counter whose value halves every `half_life`.
///
/// Decay is applied lazily in coarse steps on read and write. Concurrent
/// updates never block; a decay step is claimed by exactly one thread through
/// a compare-and-swap on the step timestamp.
pub struct DecayingCounter {
    clock: SharedClock,
    origin: Instant,
    half_life_nanos: u64,
    step_nanos: u64,
    value_bits: AtomicU64,
    last_decay_nanos: AtomicU64,
}

impl DecayingCounter {
    pub fn new(clock: SharedClock, half_life: Duration) -> Self {
        let origin = clock.now();
        let half_life_nanos = u64::try_from(half_life.as_nanos())
            .unwrap_or(u64::MAX)
            .max(1);
        Self {
            clock,
            origin,
            half_life_nanos,
            step_nanos: (half_life_nanos / DECAY_STEPS_PER_HALF_LIFE).max(1),
            value_bits: AtomicU64::new(0.0_f64.to_bits()),
            last_decay_nanos: AtomicU64::new(0),
        }
    }

    pub fn update(&self, delta: f64) {
        self.decay_if_necessary();
        let _ = self
            .value_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) + delta).max(0.0).to_bits())
            });
    }

    pub fn get(&self) -> f64 {
        self.decay_if_necessary();
        f64::from_bits(self.value_bits.load(Ordering::Acquire))
    }

    fn decay_if_necessary(&self) {
        let now = nanos_since(self.origin, self.clock.now());
        let last = self.last_decay_nanos.load(Ordering::Acquire);
        let elapsed = now.saturating_sub(last);
        if elapsed < self.step_nanos {
            return;
        }
        let steps = elapsed / self.step_nanos;
        let decayed_nanos = steps.saturating_mul(self.step_nanos);
        if self
            .last_decay_nanos
            .compare_exchange(
                last,
                last.saturating_add(decayed_nanos),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        let factor = 0.5_f64.powf(decayed_nanos as f64 / self.half_life_nanos as f64);
        let _ = self
            .value_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) * factor).to_bits())
            });
    }
}

impl std::fmt::Debug for DecayingCounter {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DecayingCounter")
            .field("value", &f64::from_bits(self.value_bits.load(Ordering::Relaxed)))
            .field("half_life_nanos", &self.half_life_nanos)
            .finish()
    }
}
