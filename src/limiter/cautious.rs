use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use http::StatusCode;

use super::{ConcurrencyLimiter, Permit, PermitOutcome, PermitState};
use crate::channel::LimitEnforcement;
use crate::config::LimiterTuning;
use crate::error::Error;
use crate::response::Response;

/// Which signals shrink a [`CautiousLimiter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimiterBehavior {
    /// Overload and redirect codes, plus transport failures, shrink the limit.
    HostLevel,
    /// Only codes that blame the endpoint itself shrink the limit. Transport
    /// failures are left to the host-level limiter.
    EndpointLevel,
}

impl LimiterBehavior {
    fn classify_status(self, status: StatusCode) -> PermitOutcome {
        let overloaded = match self {
            Self::HostLevel => matches!(status.as_u16(), 308 | 429 | 503),
            Self::EndpointLevel => matches!(status.as_u16(), 429 | 599),
        };
        if overloaded {
            PermitOutcome::Dropped
        } else {
            PermitOutcome::Success
        }
    }

    fn classify_error(self, error: &Error) -> PermitOutcome {
        match self {
            Self::HostLevel if error.is_io() => PermitOutcome::Dropped,
            _ => PermitOutcome::Ignored,
        }
    }
}

/// Limiter that grows its limit additively while it is well used and shrinks
/// it multiplicatively on overload.
#[derive(Clone)]
pub struct CautiousLimiter {
    state: Arc<CautiousState>,
}

struct CautiousState {
    behavior: LimiterBehavior,
    tuning: LimiterTuning,
    limit_bits: AtomicU64,
    inflight: AtomicUsize,
}

impl CautiousLimiter {
    pub fn new(behavior: LimiterBehavior, tuning: LimiterTuning) -> Self {
        let floor = tuning.min_limit.max(1.0);
        let ceiling = tuning.max_limit.max(floor);
        let initial = if tuning.initial_limit.is_nan() {
            floor
        } else {
            tuning.initial_limit.clamp(floor, ceiling)
        };
        Self {
            state: Arc::new(CautiousState {
                behavior,
                tuning,
                limit_bits: AtomicU64::new(initial.to_bits()),
                inflight: AtomicUsize::new(0),
            }),
        }
    }

    pub fn behavior(&self) -> LimiterBehavior {
        self.state.behavior
    }
}

impl ConcurrencyLimiter for CautiousLimiter {
    fn acquire(&self, enforcement: LimitEnforcement) -> Option<Permit> {
        let state = &self.state;
        let mut current = state.inflight.load(Ordering::Acquire);
        loop {
            if enforcement.enforced() && current as f64 >= state.current_limit().floor() {
                return None;
            }
            match state.inflight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let permit_state: Arc<dyn PermitState> = state.clone();
                    return Some(Permit::new(permit_state, current + 1));
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn inflight(&self) -> usize {
        self.state.inflight.load(Ordering::Acquire)
    }

    fn limit(&self) -> f64 {
        self.state.current_limit()
    }
}

impl CautiousState {
    fn current_limit(&self) -> f64 {
        f64::from_bits(self.limit_bits.load(Ordering::Acquire))
    }

    fn update_limit(&self, update: impl Fn(f64) -> f64) {
        let min_limit = self.tuning.min_limit.max(1.0);
        let max_limit = self.tuning.max_limit.max(min_limit);
        let _ = self
            .limit_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let next = update(f64::from_bits(bits)).clamp(min_limit, max_limit);
                Some(next.to_bits())
            });
    }
}

impl PermitState for CautiousState {
    fn release(&self, inflight_at_acquire: usize, outcome: PermitOutcome) {
        match outcome {
            PermitOutcome::Success => {
                let threshold = self.tuning.utilization_threshold;
                let step = self.tuning.increase_step;
                self.update_limit(|limit| {
                    if inflight_at_acquire as f64 >= limit * threshold {
                        limit + step
                    } else {
                        limit
                    }
                });
            }
            PermitOutcome::Dropped => {
                let ratio = self.tuning.backoff_ratio;
                self.update_limit(|limit| limit * ratio);
            }
            PermitOutcome::Ignored => {}
        }
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }

    fn classify_response(&self, response: &Response) -> PermitOutcome {
        self.behavior.classify_status(response.status())
    }

    fn classify_error(&self, error: &Error) -> PermitOutcome {
        self.behavior.classify_error(error)
    }
}

impl std::fmt::Debug for CautiousLimiter {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CautiousLimiter")
            .field("behavior", &self.state.behavior)
            .field("limit", &self.limit())
            .field("inflight", &self.inflight())
            .finish()
    }
}
