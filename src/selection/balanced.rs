use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::FutureExt;
use rand::Rng;

use super::{HostChannel, HostSelector};
use crate::channel::{Dispatch, LimitEnforcement, LimitedChannel};
use crate::clock::SharedClock;
use crate::config::BalancedTuning;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use crate::stats::{DecayingCounter, RunningTimers};

const TRACKED_TIMERS_PER_HOST: usize = 64;

/// Prefers the hosts with the fewest calls in flight, heavily penalizing
/// hosts that failed recently.
///
/// Scores are read into an immutable snapshot before ranking. A random host
/// among those scoring within the tiebreak window of the best goes first so
/// that many clients do not converge on a single host.
pub struct BalancedChannel {
    members: ArcSwap<Members>,
    tuning: BalancedTuning,
    clock: SharedClock,
}

/// Hosts and their stats, position for position.
struct Members {
    hosts: Arc<[HostChannel]>,
    stats: Vec<Arc<HostStats>>,
}

struct HostStats {
    inflight: Arc<RunningTimers>,
    failures: DecayingCounter,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ScoreSnapshot {
    position: usize,
    inflight: u64,
    recently_failed: bool,
    score: u64,
}

impl BalancedChannel {
    pub fn new(hosts: Arc<[HostChannel]>, tuning: BalancedTuning, clock: SharedClock) -> Self {
        let stats = hosts
            .iter()
            .map(|_| HostStats::new(&tuning, &clock))
            .collect();
        Self {
            members: ArcSwap::from_pointee(Members { hosts, stats }),
            tuning,
            clock,
        }
    }

    fn snapshot(&self) -> Vec<ScoreSnapshot> {
        self.members.load().snapshot(&self.tuning)
    }
}

impl Members {
    fn snapshot(&self, tuning: &BalancedTuning) -> Vec<ScoreSnapshot> {
        self.stats
            .iter()
            .enumerate()
            .map(|(position, stats)| {
                let inflight = stats.inflight.count() as u64;
                let recently_failed = stats.failures.get() >= tuning.failure_threshold;
                let penalty = if recently_failed {
                    tuning.failure_penalty
                } else {
                    0
                };
                ScoreSnapshot {
                    position,
                    inflight,
                    recently_failed,
                    score: inflight.saturating_add(penalty),
                }
            })
            .collect()
    }

    /// Positions in the order hosts should be offered the next call.
    fn ranked(&self, tuning: &BalancedTuning, rng: &mut impl Rng) -> Vec<usize> {
        let mut scores = self.snapshot(tuning);
        scores.sort_by_key(|snapshot| snapshot.score);
        let Some(best) = scores.first().map(|snapshot| snapshot.score) else {
            return Vec::new();
        };
        let window_end = best.saturating_add(tuning.tiebreak_window);
        let tied = scores
            .iter()
            .take_while(|snapshot| snapshot.score <= window_end)
            .count();
        if tied > 1 {
            let chosen = rng.random_range(0..tied);
            scores[..=chosen].rotate_right(1);
        }
        scores.into_iter().map(|snapshot| snapshot.position).collect()
    }

    fn stats_for(&self, index: usize) -> Option<Arc<HostStats>> {
        let position = self.hosts.iter().position(|host| host.index() == index)?;
        self.stats.get(position).cloned()
    }
}

impl HostStats {
    fn new(tuning: &BalancedTuning, clock: &SharedClock) -> Arc<Self> {
        Arc::new(Self {
            inflight: Arc::new(RunningTimers::new(clock.clone(), TRACKED_TIMERS_PER_HOST)),
            failures: DecayingCounter::new(clock.clone(), tuning.failure_half_life()),
        })
    }

    fn record(&self, result: &Result<Response, Error>) {
        let failed = match result {
            Ok(response) => {
                let status = response.status();
                status.is_server_error() || status == http::StatusCode::TOO_MANY_REQUESTS
            }
            Err(error) => error.is_io(),
        };
        if failed {
            self.failures.update(1.0);
        }
    }
}

impl HostSelector for BalancedChannel {
    /// Hosts that stay keep their in-flight counts and failure history.
    fn update_hosts(&self, hosts: Arc<[HostChannel]>) {
        self.members.rcu(|current| {
            let stats = hosts
                .iter()
                .map(|host| {
                    current
                        .stats_for(host.index())
                        .unwrap_or_else(|| HostStats::new(&self.tuning, &self.clock))
                })
                .collect();
            Members {
                hosts: Arc::clone(&hosts),
                stats,
            }
        });
    }
}

impl LimitedChannel for BalancedChannel {
    fn maybe_execute(
        &self,
        endpoint: &Endpoint,
        mut request: Request,
        enforcement: LimitEnforcement,
    ) -> Dispatch {
        let members = self.members.load_full();
        let order = members.ranked(&self.tuning, &mut rand::rng());
        for position in order {
            let stats = Arc::clone(&members.stats[position]);
            let timer = stats.inflight.start();
            match members.hosts[position].maybe_execute(endpoint, request, enforcement) {
                Dispatch::Accepted(future) => {
                    return Dispatch::Accepted(
                        async move {
                            let result = future.await;
                            stats.record(&result);
                            drop(timer);
                            result
                        }
                        .boxed(),
                    );
                }
                Dispatch::Rejected(returned) => request = returned,
            }
        }
        Dispatch::Rejected(request)
    }
}

impl std::fmt::Debug for BalancedChannel {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BalancedChannel")
            .field("hosts", &self.members.load().hosts.len())
            .field("scores", &self.snapshot())
            .finish()
    }
}
