//! Concurrency limiters bounding the calls in flight per host or per endpoint.

mod aimd;
mod cautious;
mod channel;

use std::sync::Arc;

use crate::channel::LimitEnforcement;
use crate::error::Error;
use crate::response::Response;

pub use aimd::AimdLimiter;
pub use cautious::{CautiousLimiter, LimiterBehavior};
pub use channel::{ConcurrencyLimitedChannel, EndpointLimitedChannel};

/// How a completed permit affects the limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PermitOutcome {
    /// Release and possibly grow the limit.
    Success,
    /// Release and shrink the limit.
    Dropped,
    /// Release without touching the limit.
    Ignored,
}

/// A source of permits.
pub trait ConcurrencyLimiter: Send + Sync + 'static {
    /// Returns `None` when the limiter is saturated and `enforcement` allows
    /// turning the call away.
    fn acquire(&self, enforcement: LimitEnforcement) -> Option<Permit>;

    fn inflight(&self) -> usize;

    fn limit(&self) -> f64;
}

/// Limiter state a permit reports back to.
pub(crate) trait PermitState: Send + Sync {
    fn release(&self, inflight_at_acquire: usize, outcome: PermitOutcome);

    fn classify_response(&self, response: &Response) -> PermitOutcome;

    fn classify_error(&self, error: &Error) -> PermitOutcome;
}

/// Capacity token issued by a [`ConcurrencyLimiter`].
///
/// Every permit is released exactly once: by one of the consuming methods, or
/// as [`PermitOutcome::Ignored`] when dropped unreported.
#[must_use = "a permit holds limiter capacity until it is reported"]
pub struct Permit {
    state: Option<Arc<dyn PermitState>>,
    inflight_at_acquire: usize,
}

impl Permit {
    pub(crate) fn new(state: Arc<dyn PermitState>, inflight_at_acquire: usize) -> Self {
        Self {
            state: Some(state),
            inflight_at_acquire,
        }
    }

    /// Number of permits outstanding right after this one was issued.
    pub fn inflight_at_acquire(&self) -> usize {
        self.inflight_at_acquire
    }

    pub fn success(self) {
        self.finish(|_| PermitOutcome::Success);
    }

    pub fn dropped(self) {
        self.finish(|_| PermitOutcome::Dropped);
    }

    pub fn ignore(self) {
        self.finish(|_| PermitOutcome::Ignored);
    }

    pub fn on_success(self, response: &Response) {
        self.finish(|state| state.classify_response(response));
    }

    pub fn on_failure(self, error: &Error) {
        self.finish(|state| state.classify_error(error));
    }

    pub fn complete(self, result: &Result<Response, Error>) {
        match result {
            Ok(response) => self.on_success(response),
            Err(error) => self.on_failure(error),
        }
    }

    fn finish(mut self, outcome: impl FnOnce(&dyn PermitState) -> PermitOutcome) {
        if let Some(state) = self.state.take() {
            let outcome = outcome(state.as_ref());
            state.release(self.inflight_at_acquire, outcome);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.release(self.inflight_at_acquire, PermitOutcome::Ignored);
        }
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Permit")
            .field("inflight_at_acquire", &self.inflight_at_acquire)
            .field("reported", &self.state.is_none())
            .finish()
    }
}
