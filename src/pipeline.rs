use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures_util::FutureExt;
use tracing::{Instrument, debug, info_span};

use crate::blacklist::BlacklistingChannel;
use crate::channel::{Channel, LimitedChannelRef, ResponseFuture, TransportChannel, failed};
use crate::clock::{SharedClock, system_clock};
use crate::config::PipelineConfig;
use crate::endpoint::{Endpoint, TAG_DISABLE_ENDPOINT_QUEUE};
use crate::error::Error;
use crate::limiter::{
    AimdLimiter, CautiousLimiter, ConcurrencyLimitedChannel, ConcurrencyLimiter,
    EndpointLimitedChannel, LimiterBehavior,
};
use crate::metrics::{HostSnapshot, PipelineMetrics, PipelineMetricsSnapshot};
use crate::observe::{Instrumentation, Observer};
use crate::queue::{DrainGroup, QueuedChannel};
use crate::request::Request;
use crate::retry::{RetryBudget, RetryBudgetPolicy, RetryPolicy, RetryingChannel};
use crate::selection::{HostChannel, NodeSelectionStrategy, StrategyChannel};
use crate::sticky::{SessionCell, StickyHosts, StickySession, StickyToken, StickyTokenChannel};
use crate::util::lock_unpoisoned;

/// One host the pipeline can send calls to.
#[derive(Clone)]
pub struct HostTarget {
    uri: String,
    transport: Arc<dyn Channel>,
}

impl HostTarget {
    pub fn new(uri: impl Into<String>, transport: Arc<dyn Channel>) -> Self {
        Self {
            uri: uri.into(),
            transport,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl std::fmt::Debug for HostTarget {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HostTarget")
            .field("uri", &self.uri)
            .finish()
    }
}

struct HostEntry {
    uri: String,
    channel: HostChannel,
    routed: LimitedChannelRef,
    limiter: Arc<dyn ConcurrencyLimiter>,
    blacklist: Option<Arc<BlacklistingChannel>>,
}

impl HostEntry {
    fn snapshot(&self) -> HostSnapshot {
        HostSnapshot {
            index: self.channel.index(),
            uri: self.uri.clone(),
            inflight: self.limiter.inflight(),
            limit: self.limiter.limit(),
            blacklisted: self
                .blacklist
                .as_ref()
                .is_some_and(|blacklist| blacklist.is_blacklisted()),
        }
    }
}

/// Host slots by index. Removed hosts leave an empty slot so the indices of
/// the remaining hosts never change.
#[derive(Default)]
struct HostDirectory {
    slots: ArcSwap<Vec<Option<Arc<HostEntry>>>>,
}

impl HostDirectory {
    fn live(&self) -> Vec<HostChannel> {
        self.slots
            .load()
            .iter()
            .flatten()
            .map(|entry| entry.channel.clone())
            .collect()
    }

    fn has_hosts(&self) -> bool {
        self.slots.load().iter().any(Option::is_some)
    }
}

impl StickyHosts for HostDirectory {
    fn host(&self, index: usize) -> Option<LimitedChannelRef> {
        let slots = self.slots.load();
        let entry = slots.get(index)?.as_ref()?;
        Some(Arc::clone(&entry.routed))
    }
}

/// Builds the per-host chain: host limiter, endpoint limiters, optional
/// blacklisting, transport.
struct HostFactory {
    config: PipelineConfig,
    clock: SharedClock,
    instrumentation: Instrumentation,
    drain_group: Arc<DrainGroup>,
}

impl HostFactory {
    fn build(&self, index: usize, target: HostTarget) -> HostEntry {
        let transport: LimitedChannelRef = Arc::new(TransportChannel::new(target.transport));
        let (below_limits, blacklist) = match self.config.blacklist_duration() {
            Some(duration) => {
                // Queued calls may be waiting for this host to come back.
                let group = Arc::clone(&self.drain_group);
                let blacklist = Arc::new(BlacklistingChannel::new(
                    index,
                    duration,
                    self.clock.clone(),
                    self.instrumentation.clone(),
                    Some(Arc::new(move || group.drain_all())),
                    transport,
                ));
                (Arc::clone(&blacklist) as LimitedChannelRef, Some(blacklist))
            }
            None => (transport, None),
        };
        let endpoint_limited: LimitedChannelRef = Arc::new(EndpointLimitedChannel::new(
            self.config.endpoint_limiter.clone(),
            below_limits,
        ));
        let limiter: Arc<dyn ConcurrencyLimiter> = Arc::new(CautiousLimiter::new(
            LimiterBehavior::HostLevel,
            self.config.host_limiter.clone(),
        ));
        let host_limited: LimitedChannelRef = Arc::new(ConcurrencyLimitedChannel::new(
            Arc::clone(&limiter),
            endpoint_limited,
        ));
        let channel = HostChannel::new(index, host_limited);
        HostEntry {
            uri: target.uri,
            routed: Arc::new(channel.clone()),
            channel,
            limiter,
            blacklist,
        }
    }
}

/// Sends each endpoint to its own queue, or to the shared queue when the
/// endpoint opts out.
struct Router {
    selector: LimitedChannelRef,
    max_queue_size: usize,
    queues: DashMap<Endpoint, Arc<QueuedChannel>>,
    shared: Arc<QueuedChannel>,
    group: Arc<DrainGroup>,
    instrumentation: Instrumentation,
}

impl Router {
    fn new(
        selector: LimitedChannelRef,
        max_queue_size: usize,
        instrumentation: Instrumentation,
        group: Arc<DrainGroup>,
    ) -> Self {
        let shared = Arc::new(QueuedChannel::in_group(
            Arc::clone(&selector),
            max_queue_size,
            instrumentation.clone(),
            Arc::clone(&group),
        ));
        Self {
            selector,
            max_queue_size,
            queues: DashMap::new(),
            shared,
            group,
            instrumentation,
        }
    }

    fn queue_for(&self, endpoint: &Endpoint) -> Arc<QueuedChannel> {
        if endpoint.has_tag(TAG_DISABLE_ENDPOINT_QUEUE) {
            return Arc::clone(&self.shared);
        }
        if let Some(queue) = self.queues.get(endpoint) {
            return Arc::clone(queue.value());
        }
        let queue = self.queues.entry(endpoint.clone()).or_insert_with(|| {
            Arc::new(QueuedChannel::in_group(
                Arc::clone(&self.selector),
                self.max_queue_size,
                self.instrumentation.clone(),
                Arc::clone(&self.group),
            ))
        });
        Arc::clone(queue.value())
    }
}

impl Channel for Router {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        let queue = self.queue_for(endpoint);
        queue.execute(endpoint, request)
    }
}

/// Top of the chain: tracing span, call metrics, and the empty-membership check.
struct CallEntry {
    service: String,
    delegate: Arc<dyn Channel>,
    directory: Arc<HostDirectory>,
    clock: SharedClock,
    metrics: PipelineMetrics,
}

impl Channel for CallEntry {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        let span = info_span!(
            "dispatchx.call",
            service = %self.service,
            endpoint = %endpoint.endpoint_name()
        );
        if !self.directory.has_hosts() {
            return failed(Error::NoHostsConfigured {
                service: self.service.clone(),
            });
        }
        let metrics = self.metrics.clone();
        metrics.record_call_started();
        let in_flight = metrics.enter_in_flight();
        let clock = self.clock.clone();
        let started = clock.now();
        let future = span.in_scope(|| self.delegate.execute(endpoint, request));
        async move {
            let result = future.await;
            drop(in_flight);
            let latency = clock.now().saturating_duration_since(started);
            metrics.record_call_completed(&result, latency);
            result
        }
        .instrument(span)
        .boxed()
    }
}

struct Membership {
    update_lock: Mutex<()>,
    factory: HostFactory,
    strategy: Arc<StrategyChannel>,
}

struct PipelineInner {
    service: String,
    entry: Arc<dyn Channel>,
    directory: Arc<HostDirectory>,
    router: Arc<Router>,
    membership: Option<Membership>,
    instrumentation: Instrumentation,
}

/// The dispatch pipeline for one logical service.
///
/// A call flows through sticky routing, the retry loop, its endpoint's queue,
/// node selection, the host and endpoint limiters, blacklisting and finally
/// the host's transport. Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn builder(service: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(service)
    }

    /// A single-host pipeline: retry, queue, an AIMD limiter, transport.
    ///
    /// There is no node selection, so [`Pipeline::update_hosts`] is rejected.
    pub fn simple(
        service: impl Into<String>,
        target: HostTarget,
        config: PipelineConfig,
    ) -> crate::Result<Self> {
        config.validate()?;
        let service = service.into();
        let clock = system_clock();
        let instrumentation = Instrumentation::new(None, PipelineMetrics::new(true));

        let limiter: Arc<dyn ConcurrencyLimiter> = Arc::new(AimdLimiter::new(
            config.host_limiter.initial_limit as usize,
            config.host_limiter.max_limit as usize,
        ));
        let transport: LimitedChannelRef = Arc::new(TransportChannel::new(target.transport));
        let limited: LimitedChannelRef = Arc::new(ConcurrencyLimitedChannel::new(
            Arc::clone(&limiter),
            transport,
        ));
        let channel = HostChannel::new(0, limited);
        let routed: LimitedChannelRef = Arc::new(channel.clone());
        let directory = Arc::new(HostDirectory::default());
        directory.slots.store(Arc::new(vec![Some(Arc::new(HostEntry {
            uri: target.uri,
            channel,
            routed: Arc::clone(&routed),
            limiter,
            blacklist: None,
        }))]));

        let router = Arc::new(Router::new(
            routed,
            config.max_queue_size,
            instrumentation.clone(),
            Arc::new(DrainGroup::default()),
        ));
        Ok(Self::assemble(
            service,
            router,
            directory,
            None,
            RetryPolicy::standard(),
            None,
            clock,
            instrumentation,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        service: String,
        router: Arc<Router>,
        directory: Arc<HostDirectory>,
        membership: Option<Membership>,
        retry_policy: RetryPolicy,
        retry_budget: Option<Arc<RetryBudget>>,
        clock: SharedClock,
        instrumentation: Instrumentation,
    ) -> Self {
        let retrying: Arc<dyn Channel> = Arc::new(RetryingChannel::new(
            Arc::clone(&router) as Arc<dyn Channel>,
            retry_policy,
            retry_budget,
            clock.clone(),
            instrumentation.clone(),
        ));
        let sticky: Arc<dyn Channel> = Arc::new(StickyTokenChannel::new(
            retrying,
            Arc::clone(&directory) as Arc<dyn StickyHosts>,
        ));
        let entry: Arc<dyn Channel> = Arc::new(CallEntry {
            service: service.clone(),
            delegate: sticky,
            directory: Arc::clone(&directory),
            clock,
            metrics: instrumentation.metrics().clone(),
        });
        Self {
            inner: Arc::new(PipelineInner {
                service,
                entry,
                directory,
                router,
                membership,
                instrumentation,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Dispatches a call. Never blocks; waiting happens in the returned future.
    pub fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        self.inner.entry.execute(endpoint, request)
    }

    /// Starts a session whose calls all go to the host that serves the first.
    pub fn sticky_session(&self) -> StickySession {
        StickySession::new(Arc::clone(&self.inner.entry), SessionCell::default())
    }

    /// Continues a session from a token obtained earlier.
    pub fn resume_session(&self, token: StickyToken) -> StickySession {
        StickySession::new(
            Arc::clone(&self.inner.entry),
            SessionCell::established(token),
        )
    }

    /// Replaces the host list.
    ///
    /// Hosts are matched by uri. Retained hosts keep their index and state,
    /// removed hosts leave their slot empty, new hosts are appended. Calls
    /// already running on a removed host finish normally.
    pub fn update_hosts(&self, targets: impl IntoIterator<Item = HostTarget>) -> crate::Result<()> {
        let Some(membership) = &self.inner.membership else {
            return Err(Error::InvalidConfig {
                message: "single-host pipelines do not support host updates",
            });
        };
        let _update = lock_unpoisoned(&membership.update_lock);

        let mut wanted: Vec<HostTarget> = Vec::new();
        for target in targets {
            if !wanted.iter().any(|existing| existing.uri == target.uri) {
                wanted.push(target);
            }
        }

        let current = self.inner.directory.slots.load_full();
        let mut slots: Vec<Option<Arc<HostEntry>>> = current
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .filter(|entry| wanted.iter().any(|target| target.uri == entry.uri))
                    .cloned()
            })
            .collect();
        let removed = current.iter().flatten().count() - slots.iter().flatten().count();
        let mut added = 0;
        for target in wanted {
            if slots.iter().flatten().any(|entry| entry.uri == target.uri) {
                continue;
            }
            let index = slots.len();
            slots.push(Some(Arc::new(membership.factory.build(index, target))));
            added += 1;
        }

        self.inner.directory.slots.store(Arc::new(slots));
        let live = self.inner.directory.live();
        let hosts = live.len();
        membership.strategy.update_hosts(live);
        // New hosts add capacity that queued calls may be waiting for.
        self.inner.router.group.drain_all();
        debug!(
            service = %self.inner.service,
            added,
            removed,
            hosts,
            "updated pipeline hosts"
        );
        Ok(())
    }

    /// The node selection strategy in effect, or `None` for a single-host
    /// pipeline.
    pub fn strategy(&self) -> Option<NodeSelectionStrategy> {
        self.inner
            .membership
            .as_ref()
            .map(|membership| membership.strategy.strategy())
    }

    pub fn metrics_snapshot(&self) -> PipelineMetricsSnapshot {
        self.inner.instrumentation.metrics().snapshot()
    }

    pub fn host_snapshots(&self) -> Vec<HostSnapshot> {
        self.inner
            .directory
            .slots
            .load()
            .iter()
            .flatten()
            .map(|entry| entry.snapshot())
            .collect()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Pipeline")
            .field("service", &self.inner.service)
            .field("hosts", &self.inner.directory.live().len())
            .field("strategy", &self.strategy())
            .finish()
    }
}

pub struct PipelineBuilder {
    service: String,
    hosts: Vec<HostTarget>,
    config: PipelineConfig,
    retry_policy: RetryPolicy,
    retry_budget_policy: Option<RetryBudgetPolicy>,
    clock: Option<SharedClock>,
    observer: Option<Arc<dyn Observer>>,
    metrics_enabled: bool,
}

impl PipelineBuilder {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            hosts: Vec::new(),
            config: PipelineConfig::default(),
            retry_policy: RetryPolicy::standard(),
            retry_budget_policy: None,
            clock: None,
            observer: None,
            metrics_enabled: true,
        }
    }

    pub fn host(mut self, uri: impl Into<String>, transport: Arc<dyn Channel>) -> Self {
        self.hosts.push(HostTarget::new(uri, transport));
        self
    }

    pub fn hosts(mut self, hosts: impl IntoIterator<Item = HostTarget>) -> Self {
        self.hosts.extend(hosts);
        self
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn retry_budget_policy(mut self, retry_budget_policy: RetryBudgetPolicy) -> Self {
        self.retry_budget_policy = Some(retry_budget_policy);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn try_build(self) -> crate::Result<Pipeline> {
        self.config.validate()?;
        if self.service.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "service name must not be empty",
            });
        }

        let clock = self.clock.unwrap_or_else(system_clock);
        let instrumentation = Instrumentation::new(
            self.observer,
            PipelineMetrics::new(self.metrics_enabled),
        );
        let drain_group = Arc::new(DrainGroup::default());
        let factory = HostFactory {
            config: self.config.clone(),
            clock: clock.clone(),
            instrumentation: instrumentation.clone(),
            drain_group: Arc::clone(&drain_group),
        };

        let mut slots: Vec<Option<Arc<HostEntry>>> = Vec::new();
        for target in self.hosts {
            if slots.iter().flatten().any(|entry| entry.uri == target.uri) {
                continue;
            }
            let index = slots.len();
            slots.push(Some(Arc::new(factory.build(index, target))));
        }
        let directory = Arc::new(HostDirectory::default());
        directory.slots.store(Arc::new(slots));

        let strategy = Arc::new(StrategyChannel::new(
            self.service.clone(),
            directory.live(),
            self.config.clone(),
            clock.clone(),
            instrumentation.clone(),
        ));
        let router = Arc::new(Router::new(
            Arc::clone(&strategy) as LimitedChannelRef,
            self.config.max_queue_size,
            instrumentation.clone(),
            drain_group,
        ));
        let retry_budget = self
            .retry_budget_policy
            .map(|policy| Arc::new(RetryBudget::new(policy, clock.clone())));
        let membership = Membership {
            update_lock: Mutex::new(()),
            factory,
            strategy,
        };

        Ok(Pipeline::assemble(
            self.service,
            router,
            directory,
            Some(membership),
            self.retry_policy,
            retry_budget,
            clock,
            instrumentation,
        ))
    }

    #[track_caller]
    pub fn build(self) -> Pipeline {
        self.try_build()
            .unwrap_or_else(|error| panic!("failed to build dispatch pipeline: {error}"))
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PipelineBuilder")
            .field("service", &self.service)
            .field("hosts", &self.hosts)
            .field("config", &self.config)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::FutureExt;
    use http::Method;

    use super::{HostTarget, Pipeline};
    use crate::channel::{Channel, channel_fn};
    use crate::config::PipelineConfig;
    use crate::endpoint::Endpoint;
    use crate::error::ErrorCode;
    use crate::request::Request;
    use crate::response::Response;

    fn counting(status: u16) -> (Arc<AtomicUsize>, Arc<dyn Channel>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let transport: Arc<dyn Channel> = Arc::new(channel_fn(move |_: &Endpoint, _: Request| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures_util::future::ready(Ok(Response::from_status(status))).boxed()
        }));
        (calls, transport)
    }

    fn get() -> Endpoint {
        Endpoint::new("svc", "ep", Method::GET)
    }

    #[tokio::test]
    async fn empty_membership_fails_fast() {
        let pipeline = Pipeline::builder("svc").build();
        let error = pipeline
            .execute(&get(), Request::new())
            .await
            .expect_err("no hosts");
        assert_eq!(error.code(), ErrorCode::NoHostsConfigured);

        let (calls, transport) = counting(200);
        pipeline
            .update_hosts([HostTarget::new("https://a", transport)])
            .expect("routed pipeline");
        pipeline.execute(&get(), Request::new()).await.expect("response");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn update_keeps_indices_of_retained_hosts() {
        let (_, a) = counting(200);
        let (_, b) = counting(200);
        let (_, c) = counting(200);
        let pipeline = Pipeline::builder("svc")
            .host("https://a", Arc::clone(&a))
            .host("https://b", b)
            .build();

        pipeline
            .update_hosts([
                HostTarget::new("https://c", c),
                HostTarget::new("https://a", a),
            ])
            .expect("routed pipeline");
        let hosts: Vec<(usize, String)> = pipeline
            .host_snapshots()
            .into_iter()
            .map(|host| (host.index, host.uri))
            .collect();
        assert_eq!(
            hosts,
            vec![(0, "https://a".to_owned()), (2, "https://c".to_owned())]
        );
    }

    #[tokio::test]
    async fn simple_pipeline_serves_calls_and_rejects_updates() {
        let (calls, transport) = counting(200);
        let pipeline = Pipeline::simple(
            "svc",
            HostTarget::new("https://only", transport),
            PipelineConfig::default(),
        )
        .expect("valid config");
        pipeline.execute(&get(), Request::new()).await.expect("response");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.strategy(), None);

        let error = pipeline.update_hosts(Vec::new()).expect_err("no selection layer");
        assert_eq!(error.code(), ErrorCode::InvalidConfig);
        assert_eq!(pipeline.metrics_snapshot().calls_succeeded, 1);
    }

    #[test]
    fn invalid_config_is_reported_by_try_build() {
        let config = PipelineConfig::default()
            .with_default_strategy(crate::selection::NodeSelectionStrategy::Unknown);
        let error = Pipeline::builder("svc")
            .config(config)
            .try_build()
            .expect_err("unknown default strategy");
        assert_eq!(error.code(), ErrorCode::InvalidConfig);
    }
}
