use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;

use super::{CautiousLimiter, ConcurrencyLimiter, LimiterBehavior, Permit};
use crate::channel::{Dispatch, LimitEnforcement, LimitedChannel, LimitedChannelRef};
use crate::config::LimiterTuning;
use crate::endpoint::{Endpoint, TAG_DISABLE_ENDPOINT_CONCURRENCY_LIMIT};
use crate::request::Request;

/// Gates a delegate behind a [`ConcurrencyLimiter`].
///
/// The permit is released when the response future completes, or ignored if
/// the future is dropped first or the delegate hands the request back.
pub struct ConcurrencyLimitedChannel {
    limiter: Arc<dyn ConcurrencyLimiter>,
    delegate: LimitedChannelRef,
}

impl ConcurrencyLimitedChannel {
    pub fn new(limiter: Arc<dyn ConcurrencyLimiter>, delegate: LimitedChannelRef) -> Self {
        Self { limiter, delegate }
    }

    pub fn limiter(&self) -> &Arc<dyn ConcurrencyLimiter> {
        &self.limiter
    }
}

impl LimitedChannel for ConcurrencyLimitedChannel {
    fn maybe_execute(
        &self,
        endpoint: &Endpoint,
        request: Request,
        enforcement: LimitEnforcement,
    ) -> Dispatch {
        let Some(permit) = self.limiter.acquire(enforcement) else {
            return Dispatch::Rejected(request);
        };
        dispatch_with_permit(self.delegate.as_ref(), permit, endpoint, request, enforcement)
    }
}

/// Per-endpoint limiters in front of one host.
///
/// Endpoints tagged with `disable-endpoint-concurrency-limit` skip straight to
/// the delegate.
pub struct EndpointLimitedChannel {
    tuning: LimiterTuning,
    limiters: DashMap<Endpoint, CautiousLimiter>,
    delegate: LimitedChannelRef,
}

impl EndpointLimitedChannel {
    pub fn new(tuning: LimiterTuning, delegate: LimitedChannelRef) -> Self {
        Self {
            tuning,
            limiters: DashMap::new(),
            delegate,
        }
    }

    fn limiter_for(&self, endpoint: &Endpoint) -> CautiousLimiter {
        if let Some(limiter) = self.limiters.get(endpoint) {
            return limiter.clone();
        }
        self.limiters
            .entry(endpoint.clone())
            .or_insert_with(|| {
                CautiousLimiter::new(LimiterBehavior::EndpointLevel, self.tuning.clone())
            })
            .clone()
    }
}

impl LimitedChannel for EndpointLimitedChannel {
    fn maybe_execute(
        &self,
        endpoint: &Endpoint,
        request: Request,
        enforcement: LimitEnforcement,
    ) -> Dispatch {
        if endpoint.has_tag(TAG_DISABLE_ENDPOINT_CONCURRENCY_LIMIT) {
            return self.delegate.maybe_execute(endpoint, request, enforcement);
        }
        let Some(permit) = self.limiter_for(endpoint).acquire(enforcement) else {
            return Dispatch::Rejected(request);
        };
        dispatch_with_permit(self.delegate.as_ref(), permit, endpoint, request, enforcement)
    }
}

fn dispatch_with_permit(
    delegate: &dyn LimitedChannel,
    permit: Permit,
    endpoint: &Endpoint,
    request: Request,
    enforcement: LimitEnforcement,
) -> Dispatch {
    match delegate.maybe_execute(endpoint, request, enforcement) {
        Dispatch::Accepted(future) => Dispatch::Accepted(
            async move {
                let result = future.await;
                permit.complete(&result);
                result
            }
            .boxed(),
        ),
        Dispatch::Rejected(request) => {
            permit.ignore();
            Dispatch::Rejected(request)
        }
    }
}
