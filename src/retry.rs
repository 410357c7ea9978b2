use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use http::StatusCode;
use rand::Rng;
use tracing::warn;

use crate::channel::{Channel, LimitEnforcement, ResponseFuture};
use crate::clock::SharedClock;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::observe::{Instrumentation, RetryCause};
use crate::request::Request;
use crate::response::Response;
use crate::stats::SlidingWindow;
use crate::util::{has_location, is_throttle_or_unavailable, parse_retry_after};

const BUDGET_BUCKETS: usize = 10;

/// How throttling and unavailability responses are handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ServerQos {
    /// 429 and 503 are retried with backoff.
    #[default]
    AutomaticRetry,
    /// 429 and 503 are returned to the caller untouched.
    PropagateToCaller,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_retries: usize,
    backoff_slot_size: Duration,
    max_backoff: Duration,
    retry_on_socket_timeout: bool,
    server_qos: ServerQos,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy {
    pub const fn standard() -> Self {
        Self {
            max_retries: 4,
            backoff_slot_size: Duration::from_millis(250),
            max_backoff: Duration::from_secs(20),
            retry_on_socket_timeout: false,
            server_qos: ServerQos::AutomaticRetry,
        }
    }

    pub const fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::standard()
        }
    }

    /// Retries after the first attempt. Zero disables retrying.
    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn backoff_slot_size(mut self, backoff_slot_size: Duration) -> Self {
        self.backoff_slot_size = backoff_slot_size;
        self
    }

    pub fn max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Also retry read timeouts. The server may already have acted on the call.
    pub const fn retry_on_socket_timeout(mut self, enabled: bool) -> Self {
        self.retry_on_socket_timeout = enabled;
        self
    }

    pub const fn server_qos(mut self, server_qos: ServerQos) -> Self {
        self.server_qos = server_qos;
        self
    }

    pub(crate) const fn configured_max_retries(&self) -> usize {
        self.max_retries
    }

    /// Jittered exponential backoff for the `retry_index`th retry (1-based).
    pub(crate) fn backoff_for_retry(&self, retry_index: usize) -> Duration {
        let exponent = retry_index.saturating_sub(1).min(31) as u32;
        let ceiling = self
            .backoff_slot_size
            .saturating_mul(1_u32 << exponent)
            .min(self.max_backoff);
        apply_jitter(ceiling)
    }

    fn decide(
        &self,
        endpoint: &Endpoint,
        result: &Result<Response, Error>,
        retry_index: usize,
        clock: &SharedClock,
    ) -> Option<Duration> {
        match result {
            Err(error) => error
                .is_retryable_io(self.retry_on_socket_timeout)
                .then(|| self.backoff_for_retry(retry_index)),
            Ok(response) => {
                let status = response.status();
                if status == StatusCode::PERMANENT_REDIRECT && has_location(response.headers()) {
                    return Some(Duration::ZERO);
                }
                if is_throttle_or_unavailable(status) {
                    if self.server_qos == ServerQos::PropagateToCaller {
                        return None;
                    }
                    let delay = parse_retry_after(response.headers(), clock.now_system())
                        .map(|delay| delay.min(self.max_backoff))
                        .unwrap_or_else(|| self.backoff_for_retry(retry_index));
                    return Some(delay);
                }
                (status.is_server_error() && endpoint.is_idempotent())
                    .then(|| self.backoff_for_retry(retry_index))
            }
        }
    }
}

fn apply_jitter(ceiling: Duration) -> Duration {
    let ceiling_ms = ceiling.as_millis().min(u128::from(u64::MAX)) as u64;
    if ceiling_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=ceiling_ms))
}

/// Caps retries relative to recent successful attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryBudgetPolicy {
    window: Duration,
    retry_ratio: f64,
    min_retries_per_window: usize,
}

impl Default for RetryBudgetPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryBudgetPolicy {
    pub const fn standard() -> Self {
        Self {
            window: Duration::from_secs(10),
            retry_ratio: 0.2,
            min_retries_per_window: 3,
        }
    }

    pub const fn disabled() -> Self {
        Self {
            window: Duration::from_secs(1),
            retry_ratio: 1.0,
            min_retries_per_window: usize::MAX,
        }
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window.max(Duration::from_millis(1));
        self
    }

    pub fn retry_ratio(mut self, retry_ratio: f64) -> Self {
        self.retry_ratio = retry_ratio.clamp(0.0, 1.0);
        self
    }

    pub const fn min_retries_per_window(mut self, min_retries_per_window: usize) -> Self {
        self.min_retries_per_window = min_retries_per_window;
        self
    }
}

/// Retries allowed per window: `ratio * successes + minimum`.
///
/// Both sides are sliding windows, so the check is lock-free. Two racing
/// callers may both take the last slot; the overshoot is bounded by the
/// number of concurrent retries.
pub(crate) struct RetryBudget {
    policy: RetryBudgetPolicy,
    successes: SlidingWindow,
    retries: SlidingWindow,
}

impl RetryBudget {
    pub(crate) fn new(policy: RetryBudgetPolicy, clock: SharedClock) -> Self {
        Self {
            successes: SlidingWindow::new(clock.clone(), policy.window, BUDGET_BUCKETS),
            retries: SlidingWindow::new(clock, policy.window, BUDGET_BUCKETS),
            policy,
        }
    }

    pub(crate) fn record_success(&self) {
        self.successes.increment();
    }

    pub(crate) fn try_consume_retry(&self) -> bool {
        let earned = (self.successes.sum() as f64 * self.policy.retry_ratio) as u64;
        let minimum = u64::try_from(self.policy.min_retries_per_window).unwrap_or(u64::MAX);
        if self.retries.sum() >= earned.saturating_add(minimum) {
            return false;
        }
        self.retries.increment();
        true
    }
}

/// Re-issues failed calls through the downstream channel.
///
/// Every attempt re-enters the downstream, so a retried call queues and is
/// routed like a fresh one. Responses superseded by a retry are closed; the
/// final response is returned open. Dropping the returned future cancels the
/// attempt in flight along with any pending backoff.
pub struct RetryingChannel {
    state: Arc<RetryState>,
}

struct RetryState {
    delegate: Arc<dyn Channel>,
    policy: RetryPolicy,
    budget: Option<Arc<RetryBudget>>,
    clock: SharedClock,
    instrumentation: Instrumentation,
}

impl RetryingChannel {
    pub(crate) fn new(
        delegate: Arc<dyn Channel>,
        policy: RetryPolicy,
        budget: Option<Arc<RetryBudget>>,
        clock: SharedClock,
        instrumentation: Instrumentation,
    ) -> Self {
        Self {
            state: Arc::new(RetryState {
                delegate,
                policy,
                budget,
                clock,
                instrumentation,
            }),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.state.policy
    }
}

impl Channel for RetryingChannel {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        let state = Arc::clone(&self.state);
        let endpoint = endpoint.clone();
        async move { state.run(endpoint, request).await }.boxed()
    }
}

impl RetryState {
    async fn run(&self, endpoint: Endpoint, mut request: Request) -> Result<Response, Error> {
        let repeatable = request.is_repeatable();
        let mut attempt = 1;
        loop {
            let result = self.delegate.execute(&endpoint, request.clone()).await;
            if let Some(budget) = &self.budget {
                if is_success(&result) {
                    budget.record_success();
                }
            }

            let delay = if repeatable && attempt <= self.policy.configured_max_retries() {
                self.policy.decide(&endpoint, &result, attempt, &self.clock)
            } else {
                None
            };
            let Some(delay) = delay else {
                return finish(result, attempt);
            };

            if let Some(budget) = &self.budget {
                if !budget.try_consume_retry() {
                    warn!(attempt, "retry budget exhausted, surfacing last outcome");
                    self.instrumentation
                        .metrics()
                        .record_retry_budget_exhausted();
                    return match result {
                        Ok(response) => Ok(response),
                        Err(_) => Err(Error::RetryBudgetExhausted {
                            service: endpoint.service_name().to_owned(),
                            endpoint: endpoint.endpoint_name().to_owned(),
                        }),
                    };
                }
            }

            let delay_ms = delay.as_millis() as u64;
            match &result {
                Ok(response) => warn!(
                    attempt,
                    delay_ms,
                    status = response.status().as_u16(),
                    "retrying call after response"
                ),
                Err(error) => warn!(attempt, delay_ms, error = %error, "retrying call after error"),
            }
            let cause = match &result {
                Ok(response) => RetryCause::Status(response.status()),
                Err(error) => RetryCause::Error(error),
            };
            self.instrumentation
                .retry_scheduled(&endpoint, attempt, delay, cause);

            if let Ok(response) = result {
                response.close();
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if attempt == 1 {
                // Only the first attempt may skip the limits.
                request.attachments_mut().remove::<LimitEnforcement>();
            }
            attempt += 1;
        }
    }
}

fn is_success(result: &Result<Response, Error>) -> bool {
    result.as_ref().is_ok_and(|response| {
        let status = response.status();
        !status.is_server_error() && !is_throttle_or_unavailable(status)
    })
}

fn finish(result: Result<Response, Error>, attempts: usize) -> Result<Response, Error> {
    match result {
        Err(error) if attempts > 1 && error.is_io() => Err(Error::RetriesExhausted {
            attempts,
            source: Box::new(error),
        }),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures_util::FutureExt;
    use http::header::{HeaderValue, LOCATION, RETRY_AFTER};
    use http::Method;

    use super::{RetryBudget, RetryBudgetPolicy, RetryPolicy, RetryingChannel, ServerQos};
    use crate::channel::{Channel, LimitEnforcement, channel_fn};
    use crate::clock::{ManualClock, system_clock};
    use crate::endpoint::Endpoint;
    use crate::error::{Error, ErrorCode, TimeoutPhase, TransportErrorKind};
    use crate::observe::Instrumentation;
    use crate::request::{Request, RequestBody};
    use crate::response::Response;

    #[derive(Clone, Copy)]
    enum Step {
        Refused,
        ReadTimeout,
        QueueFull,
        Status(u16),
    }

    struct Script {
        steps: Mutex<VecDeque<Step>>,
        attempts: AtomicUsize,
        closed: Arc<AtomicUsize>,
    }

    impl Script {
        fn new(steps: &[Step]) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.iter().copied().collect()),
                attempts: AtomicUsize::new(0),
                closed: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        fn closed(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }

        fn channel(self: &Arc<Self>) -> Arc<dyn Channel> {
            let script = Arc::clone(self);
            Arc::new(channel_fn(move |_: &Endpoint, _: Request| {
                script.attempts.fetch_add(1, Ordering::SeqCst);
                let step = script
                    .steps
                    .lock()
                    .expect("script lock")
                    .pop_front()
                    .unwrap_or(Step::Status(200));
                let closed = Arc::clone(&script.closed);
                let result = match step {
                    Step::Refused => Err(Error::transport(TransportErrorKind::Connect, "refused")),
                    Step::ReadTimeout => Err(Error::timeout(TimeoutPhase::Read)),
                    Step::QueueFull => Err(Error::QueueFull {
                        service: "svc".to_owned(),
                        endpoint: "ep".to_owned(),
                        max_queue_size: 0,
                    }),
                    Step::Status(status) => Ok(Response::from_status(status)
                        .with_close_hook(move || {
                            closed.fetch_add(1, Ordering::SeqCst);
                        })),
                };
                futures_util::future::ready(result).boxed()
            }))
        }
    }

    fn retrying(script: &Arc<Script>, policy: RetryPolicy) -> RetryingChannel {
        RetryingChannel::new(
            script.channel(),
            policy,
            None,
            system_clock(),
            Instrumentation::default(),
        )
    }

    fn get() -> Endpoint {
        Endpoint::new("svc", "ep", Method::GET)
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_recover_within_max_retries() {
        let script = Script::new(&[Step::Refused, Step::Refused, Step::Refused]);
        let channel = retrying(&script, RetryPolicy::standard().max_retries(3));
        let response = channel
            .execute(&get(), Request::new())
            .await
            .expect("fourth attempt succeeds");
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(script.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_transport_failures_report_attempt_count() {
        let script = Script::new(&[Step::Refused, Step::Refused, Step::Refused]);
        let channel = retrying(&script, RetryPolicy::standard().max_retries(2));
        let error = channel
            .execute(&get(), Request::new())
            .await
            .expect_err("all attempts fail");
        assert_eq!(script.attempts(), 3);
        assert_eq!(error.code(), ErrorCode::RetriesExhausted);
        assert_eq!(error.attempts(), 3);
        assert_eq!(error.last_attempt_error().code(), ErrorCode::Transport);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_responses_close_and_final_stays_open() {
        let script = Script::new(&[Step::Status(503), Step::Status(503), Step::Status(503)]);
        let channel = retrying(&script, RetryPolicy::standard().max_retries(2));
        let response = channel
            .execute(&get(), Request::new())
            .await
            .expect("qos exhaustion returns the last response");
        assert_eq!(response.status().as_u16(), 503);
        assert_eq!(script.closed(), 2);
        assert!(response.body().is_open());
        drop(response);
        assert_eq!(script.closed(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn read_timeout_only_retried_when_opted_in() {
        let script = Script::new(&[Step::ReadTimeout]);
        let error = retrying(&script, RetryPolicy::standard())
            .execute(&get(), Request::new())
            .await
            .expect_err("read timeout surfaces");
        assert_eq!(error.code(), ErrorCode::Timeout);
        assert_eq!(script.attempts(), 1);

        let script = Script::new(&[Step::ReadTimeout]);
        retrying(&script, RetryPolicy::standard().retry_on_socket_timeout(true))
            .execute(&get(), Request::new())
            .await
            .expect("second attempt succeeds");
        assert_eq!(script.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_retry_only_idempotent_methods() {
        let script = Script::new(&[Step::Status(500)]);
        let post = Endpoint::new("svc", "ep", Method::POST);
        let response = retrying(&script, RetryPolicy::standard())
            .execute(&post, Request::new())
            .await
            .expect("response");
        assert_eq!(response.status().as_u16(), 500);
        assert_eq!(script.attempts(), 1);

        let script = Script::new(&[Step::Status(500)]);
        let response = retrying(&script, RetryPolicy::standard())
            .execute(&get(), Request::new())
            .await
            .expect("response");
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(script.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn propagate_to_caller_returns_throttling() {
        let script = Script::new(&[Step::Status(429)]);
        let channel = retrying(
            &script,
            RetryPolicy::standard().server_qos(ServerQos::PropagateToCaller),
        );
        let response = channel.execute(&get(), Request::new()).await.expect("response");
        assert_eq!(response.status().as_u16(), 429);
        assert_eq!(script.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_body_and_queue_full_are_never_retried() {
        let script = Script::new(&[Step::Refused]);
        let request = Request::new().with_body(RequestBody::one_shot("payload"));
        let error = retrying(&script, RetryPolicy::standard())
            .execute(&get(), request)
            .await
            .expect_err("original failure surfaces");
        assert_eq!(error.code(), ErrorCode::Transport);
        assert_eq!(script.attempts(), 1);

        let script = Script::new(&[Step::QueueFull]);
        let error = retrying(&script, RetryPolicy::standard())
            .execute(&get(), Request::new())
            .await
            .expect_err("queue full surfaces");
        assert_eq!(error.code(), ErrorCode::QueueFull);
        assert_eq!(script.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_redirect_retries_without_backoff() {
        let script = Arc::new(Script {
            steps: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        });
        let counter = Arc::clone(&script);
        let transport: Arc<dyn Channel> = Arc::new(channel_fn(move |_: &Endpoint, _: Request| {
            let attempt = counter.attempts.fetch_add(1, Ordering::SeqCst);
            let response = if attempt == 0 {
                Response::from_status(308)
                    .with_header(LOCATION, HeaderValue::from_static("https://other.example"))
            } else {
                Response::from_status(200)
            };
            futures_util::future::ready(Ok(response)).boxed()
        }));
        let channel = RetryingChannel::new(
            transport,
            RetryPolicy::standard(),
            None,
            system_clock(),
            Instrumentation::default(),
        );

        let started = tokio::time::Instant::now();
        let response = channel.execute(&get(), Request::new()).await.expect("response");
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(script.attempts(), 2);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_header_sets_the_delay() {
        let counter = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::clone(&counter);
        let transport: Arc<dyn Channel> = Arc::new(channel_fn(move |_: &Endpoint, _: Request| {
            let response = if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Response::from_status(429).with_header(RETRY_AFTER, HeaderValue::from_static("3"))
            } else {
                Response::from_status(200)
            };
            futures_util::future::ready(Ok(response)).boxed()
        }));
        let channel = RetryingChannel::new(
            transport,
            RetryPolicy::standard(),
            None,
            system_clock(),
            Instrumentation::default(),
        );

        let started = tokio::time::Instant::now();
        channel.execute(&get(), Request::new()).await.expect("response");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_refusal_surfaces_budget_error() {
        let script = Script::new(&[Step::Refused, Step::Refused, Step::Refused]);
        let clock = Arc::new(ManualClock::new());
        let budget = RetryBudget::new(
            RetryBudgetPolicy::standard()
                .retry_ratio(0.0)
                .min_retries_per_window(1),
            clock.clone(),
        );
        let channel = RetryingChannel::new(
            script.channel(),
            RetryPolicy::standard(),
            Some(Arc::new(budget)),
            clock,
            Instrumentation::default(),
        );
        let error = channel
            .execute(&get(), Request::new())
            .await
            .expect_err("budget refuses the second retry");
        assert_eq!(error.code(), ErrorCode::RetryBudgetExhausted);
        assert_eq!(script.attempts(), 2);
    }

    #[test]
    fn budget_grows_with_successes_and_refills_after_window() {
        let clock = Arc::new(ManualClock::new());
        let budget = RetryBudget::new(
            RetryBudgetPolicy::standard()
                .window(Duration::from_secs(10))
                .retry_ratio(0.5)
                .min_retries_per_window(0),
            clock.clone(),
        );
        assert!(!budget.try_consume_retry());
        for _ in 0..4 {
            budget.record_success();
        }
        assert!(budget.try_consume_retry());
        assert!(budget.try_consume_retry());
        assert!(!budget.try_consume_retry());

        clock.advance(Duration::from_secs(11));
        for _ in 0..2 {
            budget.record_success();
        }
        assert!(budget.try_consume_retry());
        assert!(!budget.try_consume_retry());
    }

    #[test]
    fn jittered_backoff_never_exceeds_configured_max_backoff() {
        let policy = RetryPolicy::standard()
            .backoff_slot_size(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(350));
        for retry_index in 1..20 {
            for _ in 0..50 {
                assert!(policy.backoff_for_retry(retry_index) <= Duration::from_millis(350));
            }
        }
        assert!(policy.backoff_for_retry(1) <= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_do_not_inherit_a_limit_bypass() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let delegate: Arc<dyn Channel> =
            Arc::new(channel_fn(move |_: &Endpoint, request: Request| {
                let mut seen = recorder.lock().expect("seen lock");
                seen.push(request.attachments().get::<LimitEnforcement>().copied());
                let status = if seen.len() == 1 { 503 } else { 200 };
                futures_util::future::ready(Ok(Response::from_status(status))).boxed()
            }));
        let channel = RetryingChannel::new(
            delegate,
            RetryPolicy::standard(),
            None,
            system_clock(),
            Instrumentation::default(),
        );
        let mut request = Request::new();
        request
            .attachments_mut()
            .insert(LimitEnforcement::DangerousBypassLimits);

        let response = channel
            .execute(&Endpoint::new("svc", "ep", Method::GET), request)
            .await
            .expect("second attempt succeeds");
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(
            *seen.lock().expect("seen lock"),
            vec![Some(LimitEnforcement::DangerousBypassLimits), None]
        );
    }
}
