use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dispatchx::prelude::{
    Channel, Endpoint, Error, ErrorCode, HostTarget, NodeSelectionStrategy, Pipeline,
    PipelineConfig, Request, Response, ResponseFuture, RetryPolicy,
};
use dispatchx::{LimiterTuning, ManualClock, NODE_SELECTION_STRATEGY_HEADER, Observer};
use futures_util::FutureExt;
use http::header::{HeaderName, HeaderValue};
use tokio::sync::oneshot;

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Answers every call with a configurable status.
struct FakeHost {
    status: AtomicU16,
    calls: AtomicUsize,
    advertised: Mutex<Option<&'static str>>,
}

impl FakeHost {
    fn new(status: u16) -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU16::new(status),
            calls: AtomicUsize::new(0),
            advertised: Mutex::new(None),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }
}

impl Channel for FakeHost {
    fn execute(&self, _endpoint: &Endpoint, _request: Request) -> ResponseFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut response = Response::from_status(self.status.load(Ordering::SeqCst));
        if let Some(advertised) = *lock_unpoisoned(&self.advertised) {
            response = response.with_header(
                HeaderName::from_static(NODE_SELECTION_STRATEGY_HEADER),
                HeaderValue::from_static(advertised),
            );
        }
        futures_util::future::ready(Ok(response)).boxed()
    }
}

/// Holds every call open until the test releases it.
struct GatedHost {
    started: AtomicUsize,
    gates: Mutex<Vec<oneshot::Sender<()>>>,
}

impl GatedHost {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicUsize::new(0),
            gates: Mutex::new(Vec::new()),
        })
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn release_one(&self) {
        let mut gates = lock_unpoisoned(&self.gates);
        if !gates.is_empty() {
            let _ = gates.remove(0).send(());
        }
    }
}

impl Channel for GatedHost {
    fn execute(&self, _endpoint: &Endpoint, _request: Request) -> ResponseFuture {
        self.started.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        lock_unpoisoned(&self.gates).push(sender);
        async move {
            let _ = receiver.await;
            Ok::<_, Error>(Response::from_status(200))
        }
        .boxed()
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn get() -> Endpoint {
    Endpoint::new("catalog", "getItem", http::Method::GET)
}

#[tokio::test]
async fn queued_calls_dispatch_one_per_completion_and_overflow_is_terminal() {
    let host = GatedHost::new();
    let limiter = LimiterTuning::default().initial_limit(2.0).max_limit(2.0);
    let pipeline = Pipeline::builder("catalog")
        .host("https://catalog-1", host.clone())
        .config(
            PipelineConfig::default()
                .with_host_limiter(limiter)
                .with_max_queue_size(3),
        )
        .build();

    let calls: Vec<_> = (0..5)
        .map(|_| tokio::spawn(pipeline.execute(&get(), Request::new())))
        .collect();
    settle().await;
    assert_eq!(host.started(), 2);
    assert_eq!(pipeline.metrics_snapshot().queued, 3);

    let error = pipeline
        .execute(&get(), Request::new())
        .await
        .expect_err("queue holds three calls");
    assert_eq!(error.code(), ErrorCode::QueueFull);
    assert_eq!(host.started(), 2);

    host.release_one();
    settle().await;
    assert_eq!(host.started(), 3);
    assert_eq!(pipeline.metrics_snapshot().queued, 2);

    for _ in 0..4 {
        host.release_one();
        settle().await;
    }
    for call in calls {
        call.await.expect("task").expect("response");
    }
    let snapshot = pipeline.metrics_snapshot();
    assert_eq!(snapshot.calls_succeeded, 5);
    assert_eq!(snapshot.queue_rejections, 1);
    assert_eq!(snapshot.retries, 0);
}

#[tokio::test]
async fn failed_host_is_blacklisted_until_the_deadline() {
    let clock = Arc::new(ManualClock::new());
    let healthy = FakeHost::new(200);
    let failing = FakeHost::new(500);
    let pipeline = Pipeline::builder("catalog")
        .host("https://catalog-1", failing.clone())
        .host("https://catalog-2", healthy.clone())
        .config(
            PipelineConfig::default()
                .with_default_strategy(NodeSelectionStrategy::RoundRobin)
                .with_blacklist_duration(Duration::from_secs(5)),
        )
        .retry_policy(RetryPolicy::disabled())
        .clock(clock.clone())
        .build();

    for _ in 0..2 {
        let _ = pipeline.execute(&get(), Request::new()).await;
    }
    assert_eq!(failing.calls(), 1);
    assert!(pipeline.host_snapshots()[0].blacklisted);

    failing.set_status(200);
    for _ in 0..10 {
        pipeline.execute(&get(), Request::new()).await.expect("response");
    }
    assert_eq!(failing.calls(), 1);

    clock.advance(Duration::from_secs(6));
    for _ in 0..10 {
        pipeline.execute(&get(), Request::new()).await.expect("response");
    }
    assert!(failing.calls() > 1);
    assert!(!pipeline.host_snapshots()[0].blacklisted);
    assert_eq!(pipeline.metrics_snapshot().blacklistings, 1);
}

#[tokio::test]
async fn queued_call_resumes_when_the_blacklist_expires() {
    let clock = Arc::new(ManualClock::new());
    let host = FakeHost::new(500);
    let pipeline = Pipeline::builder("catalog")
        .host("https://catalog-1", host.clone())
        .config(PipelineConfig::default().with_blacklist_duration(Duration::from_secs(1)))
        .retry_policy(RetryPolicy::disabled())
        .clock(clock.clone())
        .build();

    let failed = pipeline
        .execute(&get(), Request::new())
        .await
        .expect("server errors are responses");
    assert_eq!(failed.status().as_u16(), 500);
    assert!(pipeline.host_snapshots()[0].blacklisted);

    host.set_status(200);
    let waiting = tokio::spawn(pipeline.execute(&get(), Request::new()));
    settle().await;
    assert_eq!(host.calls(), 1);
    assert_eq!(pipeline.metrics_snapshot().queued, 1);

    clock.advance(Duration::from_secs(5));
    let response = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("queued call is dispatched after expiry")
        .expect("task")
        .expect("response");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(host.calls(), 2);
    assert_eq!(pipeline.metrics_snapshot().queued, 0);
}

#[tokio::test]
async fn hosts_advertising_one_strategy_switch_the_pipeline() {
    let hosts = [FakeHost::new(200), FakeHost::new(200)];
    for host in &hosts {
        *lock_unpoisoned(&host.advertised) = Some("BALANCED,PIN_UNTIL_ERROR");
    }
    let pipeline = Pipeline::builder("catalog")
        .host("https://catalog-1", hosts[0].clone())
        .host("https://catalog-2", hosts[1].clone())
        .build();
    assert_eq!(pipeline.strategy(), Some(NodeSelectionStrategy::PinUntilError));

    pipeline.execute(&get(), Request::new()).await.expect("response");
    assert_eq!(pipeline.strategy(), Some(NodeSelectionStrategy::Balanced));
    assert_eq!(pipeline.metrics_snapshot().strategy_changes, 1);
}

#[tokio::test]
async fn calls_on_removed_hosts_finish_and_new_calls_use_the_new_host() {
    let removed = GatedHost::new();
    let added = FakeHost::new(200);
    let pipeline = Pipeline::builder("catalog")
        .host("https://catalog-1", removed.clone())
        .build();

    let in_flight = tokio::spawn(pipeline.execute(&get(), Request::new()));
    settle().await;
    assert_eq!(removed.started(), 1);

    pipeline
        .update_hosts([HostTarget::new("https://catalog-2", added.clone())])
        .expect("routed pipeline");
    let hosts = pipeline.host_snapshots();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].index, 1);
    assert_eq!(hosts[0].uri, "https://catalog-2");

    pipeline.execute(&get(), Request::new()).await.expect("response");
    assert_eq!(added.calls(), 1);

    removed.release_one();
    let response = in_flight.await.expect("task").expect("response");
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn waiting_calls_resume_when_hosts_are_added() {
    let first = GatedHost::new();
    let second = FakeHost::new(200);
    let limiter = LimiterTuning::default().initial_limit(1.0).max_limit(1.0);
    let pipeline = Pipeline::builder("catalog")
        .host("https://catalog-1", first.clone())
        .config(
            PipelineConfig::default()
                .with_default_strategy(NodeSelectionStrategy::RoundRobin)
                .with_host_limiter(limiter),
        )
        .build();

    let _running = tokio::spawn(pipeline.execute(&get(), Request::new()));
    let waiting = tokio::spawn(pipeline.execute(&get(), Request::new()));
    settle().await;
    assert_eq!(pipeline.metrics_snapshot().queued, 1);

    pipeline
        .update_hosts([
            HostTarget::new("https://catalog-1", first.clone()),
            HostTarget::new("https://catalog-2", second.clone()),
        ])
        .expect("routed pipeline");
    settle().await;
    assert_eq!(pipeline.metrics_snapshot().queued, 0);

    waiting.await.expect("task").expect("response");
    assert_eq!(second.calls(), 1);
    first.release_one();
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl Observer for RecordingObserver {
    fn on_retry_scheduled(
        &self,
        endpoint: &Endpoint,
        attempt: usize,
        _delay: Duration,
        _cause: dispatchx::RetryCause<'_>,
    ) {
        lock_unpoisoned(&self.events).push(format!("retry {endpoint} {attempt}"));
    }

    fn on_pin_switched(&self, from_host: usize, to_host: usize) {
        lock_unpoisoned(&self.events).push(format!("pin {from_host}->{to_host}"));
    }
}

#[tokio::test(start_paused = true)]
async fn retries_move_off_a_failing_pinned_host() {
    let observer = Arc::new(RecordingObserver::default());
    let failures_left = Arc::new(AtomicUsize::new(1));
    let flaky = |failures_left: Arc<AtomicUsize>| -> Arc<dyn Channel> {
        Arc::new(dispatchx::channel_fn(move |_: &Endpoint, _: Request| {
            let failing = failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            let status = if failing { 503 } else { 200 };
            futures_util::future::ready(Ok(Response::from_status(status))).boxed()
        }))
    };
    let pipeline = Pipeline::builder("catalog")
        .host("https://catalog-1", flaky(Arc::clone(&failures_left)))
        .host("https://catalog-2", flaky(Arc::clone(&failures_left)))
        .config(PipelineConfig::default().with_rng_seed(7))
        .observer(observer.clone())
        .build();

    let response = pipeline
        .execute(&get(), Request::new())
        .await
        .expect("second attempt succeeds");
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(pipeline.metrics_snapshot().retries, 1);

    let events = lock_unpoisoned(&observer.events).clone();
    assert_eq!(events.len(), 2, "{events:?}");
    assert!(events.iter().any(|event| event == "pin 0->1" || event == "pin 1->0"));
    assert!(events.iter().any(|event| event == "retry catalog.getItem 1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_all_complete_and_release_capacity() {
    let hosts = [FakeHost::new(200), FakeHost::new(200), FakeHost::new(200)];
    let limiter = LimiterTuning::default().initial_limit(4.0).max_limit(8.0);
    let pipeline = Pipeline::builder("catalog")
        .host("https://catalog-1", hosts[0].clone())
        .host("https://catalog-2", hosts[1].clone())
        .host("https://catalog-3", hosts[2].clone())
        .config(
            PipelineConfig::default()
                .with_default_strategy(NodeSelectionStrategy::Balanced)
                .with_host_limiter(limiter),
        )
        .build();

    let calls: Vec<_> = (0..200)
        .map(|_| tokio::spawn(pipeline.execute(&get(), Request::new())))
        .collect();
    for call in calls {
        let response = call.await.expect("task").expect("response");
        assert_eq!(response.status().as_u16(), 200);
    }

    let total: usize = hosts.iter().map(|host| host.calls()).sum();
    assert_eq!(total, 200);
    let snapshot = pipeline.metrics_snapshot();
    assert_eq!(snapshot.calls_succeeded, 200);
    assert_eq!(snapshot.calls_in_flight, 0);
    assert_eq!(snapshot.queued, 0);
    assert!(pipeline.host_snapshots().iter().all(|host| host.inflight == 0));
}
