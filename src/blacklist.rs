use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tracing::{debug, warn};

use crate::channel::{Dispatch, LimitEnforcement, LimitedChannel, LimitedChannelRef};
use crate::clock::{SharedClock, nanos_since};
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::observe::Instrumentation;
use crate::request::Request;
use crate::response::Response;

const NOT_BLACKLISTED: u64 = 0;

/// Invoked once a blacklist window has passed, so callers waiting for
/// capacity can be offered to the host again.
pub(crate) type ExpiryHook = Arc<dyn Fn() + Send + Sync>;

/// Keeps new calls away from a host for a fixed period after it fails.
///
/// Calls already in flight when the host fails are left alone. Offers check
/// expiry directly; the expiry hook fires from a timer on the pipeline clock.
pub struct BlacklistingChannel {
    delegate: LimitedChannelRef,
    state: Arc<BlacklistState>,
}

struct BlacklistState {
    host_index: usize,
    clock: SharedClock,
    origin: Instant,
    duration: Duration,
    // Offset by one from the origin so zero means "not blacklisted".
    until_nanos: AtomicU64,
    instrumentation: Instrumentation,
    on_expiry: Option<ExpiryHook>,
}

impl BlacklistingChannel {
    pub(crate) fn new(
        host_index: usize,
        duration: Duration,
        clock: SharedClock,
        instrumentation: Instrumentation,
        on_expiry: Option<ExpiryHook>,
        delegate: LimitedChannelRef,
    ) -> Self {
        let origin = clock.now();
        Self {
            delegate,
            state: Arc::new(BlacklistState {
                host_index,
                clock,
                origin,
                duration,
                until_nanos: AtomicU64::new(NOT_BLACKLISTED),
                instrumentation,
                on_expiry,
            }),
        }
    }

    pub fn is_blacklisted(&self) -> bool {
        self.state.is_blacklisted()
    }
}

impl BlacklistState {
    fn now_nanos(&self) -> u64 {
        nanos_since(self.origin, self.clock.now()).saturating_add(1)
    }

    fn is_blacklisted(&self) -> bool {
        let until = self.until_nanos.load(Ordering::Acquire);
        until != NOT_BLACKLISTED && self.now_nanos() < until
    }

    fn observe(self: &Arc<Self>, endpoint: &Endpoint, result: &Result<Response, Error>) {
        let failed = match result {
            Ok(response) => response.status().is_server_error(),
            Err(error) => error.is_io(),
        };
        if !failed {
            return;
        }
        let duration_nanos = u64::try_from(self.duration.as_nanos()).unwrap_or(u64::MAX);
        let until = self.now_nanos().saturating_add(duration_nanos);
        let previous = self.until_nanos.fetch_max(until, Ordering::AcqRel);
        if previous == NOT_BLACKLISTED || previous <= self.now_nanos() {
            warn!(
                host_index = self.host_index,
                endpoint = %endpoint,
                duration_ms = self.duration.as_millis() as u64,
                "blacklisting host after failure"
            );
            self.instrumentation
                .host_blacklisted(self.host_index, self.duration);
            self.arm_expiry();
        }
    }

    /// Waits out the window, following any extensions, then fires the hook.
    fn arm_expiry(self: &Arc<Self>) {
        let Some(hook) = self.on_expiry.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let state = Arc::clone(self);
        runtime.spawn(async move {
            loop {
                let until = state.until_nanos.load(Ordering::Acquire);
                let remaining = until.saturating_sub(state.now_nanos());
                if remaining == 0 {
                    break;
                }
                state.clock.sleep(Duration::from_nanos(remaining)).await;
            }
            debug!(host_index = state.host_index, "host blacklist expired");
            hook();
        });
    }
}

impl LimitedChannel for BlacklistingChannel {
    fn maybe_execute(
        &self,
        endpoint: &Endpoint,
        request: Request,
        enforcement: LimitEnforcement,
    ) -> Dispatch {
        if self.state.is_blacklisted() {
            return Dispatch::Rejected(request);
        }
        let state = Arc::clone(&self.state);
        let endpoint_for_result = endpoint.clone();
        self.delegate
            .maybe_execute(endpoint, request, enforcement)
            .map_accepted(move |future| {
                async move {
                    let result = future.await;
                    state.observe(&endpoint_for_result, &result);
                    result
                }
                .boxed()
            })
    }
}
