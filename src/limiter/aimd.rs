use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{ConcurrencyLimiter, Permit, PermitOutcome, PermitState};
use crate::channel::LimitEnforcement;
use crate::error::Error;
use crate::response::Response;

const AIMD_BACKOFF_RATIO: f64 = 0.9;

/// Integer additive-increase, multiplicative-decrease limiter used by the
/// single-host call path.
///
/// The limit grows by one when a successful permit was issued at the limit,
/// and shrinks by a fixed ratio on overload, never below one.
#[derive(Clone)]
pub struct AimdLimiter {
    state: Arc<AimdState>,
}

struct AimdState {
    limit: AtomicUsize,
    max_limit: usize,
    inflight: AtomicUsize,
}

impl AimdLimiter {
    pub fn new(initial_limit: usize, max_limit: usize) -> Self {
        let max_limit = max_limit.max(1);
        Self {
            state: Arc::new(AimdState {
                limit: AtomicUsize::new(initial_limit.clamp(1, max_limit)),
                max_limit,
                inflight: AtomicUsize::new(0),
            }),
        }
    }
}

impl ConcurrencyLimiter for AimdLimiter {
    fn acquire(&self, enforcement: LimitEnforcement) -> Option<Permit> {
        let state = &self.state;
        let mut current = state.inflight.load(Ordering::Acquire);
        loop {
            if enforcement.enforced() && current >= state.limit.load(Ordering::Acquire) {
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
        self.state.limit.load(Ordering::Acquire) as f64
    }
}

impl PermitState for AimdState {
    fn release(&self, inflight_at_acquire: usize, outcome: PermitOutcome) {
        match outcome {
            PermitOutcome::Success => {
                let _ = self
                    .limit
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |limit| {
                        (inflight_at_acquire >= limit && limit < self.max_limit)
                            .then_some(limit + 1)
                    });
            }
            PermitOutcome::Dropped => {
                let _ = self
                    .limit
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |limit| {
                        Some(((limit as f64 * AIMD_BACKOFF_RATIO).floor() as usize).max(1))
                    });
            }
            PermitOutcome::Ignored => {}
        }
        self.inflight.fetch_sub(1, Ordering::AcqRel);
    }

    fn classify_response(&self, response: &Response) -> PermitOutcome {
        if matches!(response.status().as_u16(), 308 | 429 | 503) {
            PermitOutcome::Dropped
        } else {
            PermitOutcome::Success
        }
    }

    fn classify_error(&self, error: &Error) -> PermitOutcome {
        if error.is_io() {
            PermitOutcome::Dropped
        } else {
            PermitOutcome::Ignored
        }
    }
}

impl std::fmt::Debug for AimdLimiter {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AimdLimiter")
            .field("limit", &self.state.limit.load(Ordering::Relaxed))
            .field("inflight", &self.inflight())
            .finish()
    }
}
