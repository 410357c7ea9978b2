use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use futures_util::FutureExt;
use tracing::debug;

use super::{
    BalancedChannel, HostChannel, HostSelector, NodeSelectionStrategy, PinUntilErrorChannel,
    RandomChannel, RoundRobinChannel, ServedBy, advertised_strategies, converge_strategy,
};
use crate::channel::{Dispatch, LimitEnforcement, LimitedChannel};
use crate::clock::SharedClock;
use crate::config::PipelineConfig;
use crate::endpoint::Endpoint;
use crate::observe::Instrumentation;
use crate::request::Request;
use crate::response::Response;
use crate::util::lock_unpoisoned;

/// Routes calls through the selector for the strategy the hosts agreed on.
///
/// Responses are inspected for advertised strategies. When the converged
/// strategy changes, a fresh selector over the same hosts replaces the old
/// one; calls already dispatched through the old selector complete normally.
/// Host list updates keep the current selector and its state.
pub struct StrategyChannel {
    state: Arc<StrategyState>,
}

struct StrategyState {
    service: String,
    default: NodeSelectionStrategy,
    factory: SelectorFactory,
    selector: ArcSwap<Selector>,
    observed: DashMap<usize, Vec<NodeSelectionStrategy>>,
    hosts: Mutex<Arc<[HostChannel]>>,
}

struct Selector {
    strategy: NodeSelectionStrategy,
    channel: Arc<dyn HostSelector>,
}

#[derive(Clone)]
struct SelectorFactory {
    config: PipelineConfig,
    clock: SharedClock,
    instrumentation: Instrumentation,
}

impl SelectorFactory {
    fn build(&self, strategy: NodeSelectionStrategy, hosts: Arc<[HostChannel]>) -> Selector {
        let reshuffle_interval: Option<Duration> =
            Some(self.config.pin_until_error.reshuffle_interval());
        let channel: Arc<dyn HostSelector> = match strategy {
            NodeSelectionStrategy::Balanced => Arc::new(BalancedChannel::new(
                hosts,
                self.config.balanced.clone(),
                self.clock.clone(),
            )),
            NodeSelectionStrategy::RoundRobin => Arc::new(RoundRobinChannel::new(hosts)),
            NodeSelectionStrategy::Random => Arc::new(RandomChannel::new(hosts)),
            NodeSelectionStrategy::PinUntilErrorWithoutReshuffle => {
                Arc::new(PinUntilErrorChannel::new(
                    hosts,
                    None,
                    self.clock.clone(),
                    self.config.rng_seed,
                    self.instrumentation.clone(),
                ))
            }
            NodeSelectionStrategy::PinUntilError | NodeSelectionStrategy::Unknown => {
                Arc::new(PinUntilErrorChannel::new(
                    hosts,
                    reshuffle_interval,
                    self.clock.clone(),
                    self.config.rng_seed,
                    self.instrumentation.clone(),
                ))
            }
        };
        Selector { strategy, channel }
    }
}

impl StrategyChannel {
    pub(crate) fn new(
        service: impl Into<String>,
        hosts: Vec<HostChannel>,
        config: PipelineConfig,
        clock: SharedClock,
        instrumentation: Instrumentation,
    ) -> Self {
        let default = config.default_strategy;
        let factory = SelectorFactory {
            config,
            clock,
            instrumentation,
        };
        let hosts: Arc<[HostChannel]> = Arc::from(hosts);
        let selector = factory.build(default, Arc::clone(&hosts));
        Self {
            state: Arc::new(StrategyState {
                service: service.into(),
                default,
                factory,
                selector: ArcSwap::from_pointee(selector),
                observed: DashMap::new(),
                hosts: Mutex::new(hosts),
            }),
        }
    }

    pub fn strategy(&self) -> NodeSelectionStrategy {
        self.state.selector.load().strategy
    }

    /// Replaces the host list. Advertisements from removed hosts are forgotten.
    ///
    /// The selector is only rebuilt when the remaining votes change the
    /// strategy. Otherwise it adopts the new hosts in place.
    pub(crate) fn update_hosts(&self, hosts: Vec<HostChannel>) {
        let state = &self.state;
        let mut current_hosts = lock_unpoisoned(&state.hosts);
        *current_hosts = Arc::from(hosts);
        state
            .observed
            .retain(|index, _| current_hosts.iter().any(|host| host.index() == *index));
        let selector = state.selector.load_full();
        let previous = selector.strategy;
        let strategy = state.converged();
        if strategy == previous {
            selector.channel.update_hosts(Arc::clone(&current_hosts));
        } else {
            state
                .selector
                .store(Arc::new(state.factory.build(strategy, Arc::clone(&current_hosts))));
        }
        drop(current_hosts);
        if previous != strategy {
            state.announce(previous, strategy);
        }
    }
}

impl StrategyState {
    fn converged(&self) -> NodeSelectionStrategy {
        let observed: Vec<Vec<NodeSelectionStrategy>> = self
            .observed
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        converge_strategy(observed.iter().map(Vec::as_slice), self.default)
    }

    fn observe(&self, response: &Response) {
        let Some(ServedBy(index)) = response.attachments().get::<ServedBy>().copied() else {
            return;
        };
        let advertised = advertised_strategies(response.headers());
        if advertised.is_empty()
            || self
                .observed
                .get(&index)
                .is_some_and(|known| *known == advertised)
        {
            return;
        }

        let hosts = lock_unpoisoned(&self.hosts);
        if !hosts.iter().any(|host| host.index() == index) {
            return;
        }
        self.observed.insert(index, advertised);
        let previous = self.selector.load().strategy;
        let strategy = self.converged();
        if strategy == previous {
            return;
        }
        self.selector
            .store(Arc::new(self.factory.build(strategy, Arc::clone(&hosts))));
        drop(hosts);
        self.announce(previous, strategy);
    }

    fn announce(&self, previous: NodeSelectionStrategy, current: NodeSelectionStrategy) {
        debug!(
            service = %self.service,
            previous = %previous,
            current = %current,
            "node selection strategy changed"
        );
        self.factory
            .instrumentation
            .strategy_changed(&self.service, previous, current);
    }
}

impl LimitedChannel for StrategyChannel {
    fn maybe_execute(
        &self,
        endpoint: &Endpoint,
        request: Request,
        enforcement: LimitEnforcement,
    ) -> Dispatch {
        let selector = self.state.selector.load_full();
        let state = Arc::clone(&self.state);
        selector
            .channel
            .maybe_execute(endpoint, request, enforcement)
            .map_accepted(move |future| {
                future
                    .inspect(move |result| {
                        if let Ok(response) = result {
                            state.observe(response);
                        }
                    })
                    .boxed()
            })
    }
}

impl std::fmt::Debug for StrategyChannel {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("StrategyChannel")
            .field("service", &self.state.service)
            .field("strategy", &self.strategy())
            .finish()
    }
}
