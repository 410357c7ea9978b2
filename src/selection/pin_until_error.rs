use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures_util::FutureExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::debug;

use super::{HostChannel, HostSelector};
use crate::channel::{Dispatch, LimitEnforcement, LimitedChannel};
use crate::clock::{SharedClock, nanos_since};
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::observe::Instrumentation;
use crate::request::Request;
use crate::response::Response;
use crate::util::{is_host_failure, lock_unpoisoned, seeded_rng};

/// Sends every call to one host until that host signals it is broken, then
/// moves on to the next host in a shuffled ordering.
///
/// Each pin carries a generation. A failure only moves the pin if it was
/// produced under the current generation, so a late failure from a host that
/// was already abandoned cannot cause a second switch.
pub struct PinUntilErrorChannel {
    state: Arc<PinState>,
}

struct PinState {
    pin: ArcSwap<Pin>,
    reshuffle: Option<Reshuffle>,
    rng: Mutex<StdRng>,
    instrumentation: Instrumentation,
}

/// The host list and the order it is walked in always change together.
struct Pin {
    generation: u64,
    hosts: Arc<[HostChannel]>,
    ordering: Arc<[usize]>,
    position: usize,
}

impl Pin {
    fn host(&self) -> Option<&HostChannel> {
        let position = *self.ordering.get(self.position)?;
        self.hosts.get(position)
    }

    fn pinned_index(&self) -> Option<usize> {
        self.host().map(HostChannel::index)
    }
}

struct Reshuffle {
    clock: SharedClock,
    origin: Instant,
    interval_nanos: u64,
    next_at_nanos: AtomicU64,
}

impl PinUntilErrorChannel {
    /// `reshuffle_interval` of `None` keeps the initial ordering forever.
    pub(crate) fn new(
        hosts: Arc<[HostChannel]>,
        reshuffle_interval: Option<Duration>,
        clock: SharedClock,
        rng_seed: Option<u64>,
        instrumentation: Instrumentation,
    ) -> Self {
        let mut rng = seeded_rng(rng_seed);
        let mut ordering: Vec<usize> = (0..hosts.len()).collect();
        ordering.shuffle(&mut rng);
        let reshuffle = reshuffle_interval.map(|interval| {
            let interval_nanos = u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX).max(1);
            Reshuffle {
                origin: clock.now(),
                clock,
                interval_nanos,
                next_at_nanos: AtomicU64::new(interval_nanos),
            }
        });
        Self {
            state: Arc::new(PinState {
                pin: ArcSwap::from_pointee(Pin {
                    generation: 0,
                    hosts,
                    ordering: Arc::from(ordering),
                    position: 0,
                }),
                reshuffle,
                rng: Mutex::new(rng),
                instrumentation,
            }),
        }
    }

    /// Index of the host currently receiving calls.
    pub fn pinned_host(&self) -> Option<usize> {
        self.state.pin.load().pinned_index()
    }

    fn reshuffle_if_due(&self) {
        let Some(reshuffle) = &self.state.reshuffle else {
            return;
        };
        let now = nanos_since(reshuffle.origin, reshuffle.clock.now());
        let due = reshuffle.next_at_nanos.load(Ordering::Acquire);
        if now < due
            || reshuffle
                .next_at_nanos
                .compare_exchange(
                    due,
                    now.saturating_add(reshuffle.interval_nanos),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
        {
            return;
        }

        let current = self.state.pin.load_full();
        if current.ordering.len() < 2 {
            return;
        }
        let pinned = current.ordering[current.position];
        let mut ordering = current.ordering.to_vec();
        ordering.shuffle(&mut *lock_unpoisoned(&self.state.rng));
        // A reshuffle always moves the pin so load actually spreads.
        if ordering[0] == pinned {
            ordering.swap(0, 1);
        }
        let next = Arc::new(Pin {
            generation: current.generation.wrapping_add(1),
            hosts: Arc::clone(&current.hosts),
            ordering: Arc::from(ordering),
            position: 0,
        });
        let to_host = next.pinned_index();
        let previous = self.state.pin.compare_and_swap(&current, next);
        if Arc::ptr_eq(&*previous, &current) {
            debug!(
                from_host = ?current.pinned_index(),
                to_host = ?to_host,
                "reshuffled pin-until-error host ordering"
            );
        }
    }
}

impl PinState {
    fn observe(&self, generation: u64, result: &Result<Response, Error>) {
        let broken = match result {
            Ok(response) => is_host_failure(response.status()),
            Err(error) => error.is_io(),
        };
        if !broken {
            return;
        }
        let current = self.pin.load_full();
        if current.generation != generation || current.ordering.is_empty() {
            return;
        }
        let next = Arc::new(Pin {
            generation: current.generation.wrapping_add(1),
            hosts: Arc::clone(&current.hosts),
            ordering: Arc::clone(&current.ordering),
            position: (current.position + 1) % current.ordering.len(),
        });
        let (Some(from_host), Some(to_host)) = (current.pinned_index(), next.pinned_index()) else {
            return;
        };
        let previous = self.pin.compare_and_swap(&current, next);
        if Arc::ptr_eq(&*previous, &current) {
            debug!(from_host, to_host, "pinned host failed, switching");
            self.instrumentation.pin_switched(from_host, to_host);
        }
    }
}

impl HostSelector for PinUntilErrorChannel {
    /// Surviving hosts keep their place in the ordering and the pinned host
    /// stays pinned. New hosts join the end of the ordering in random order.
    fn update_hosts(&self, hosts: Arc<[HostChannel]>) {
        let mut rng = lock_unpoisoned(&self.state.rng);
        let previous = self.state.pin.rcu(|current| {
            let mut ordering: Vec<usize> = current
                .ordering
                .iter()
                .filter_map(|&position| {
                    let index = current.hosts[position].index();
                    hosts.iter().position(|host| host.index() == index)
                })
                .collect();
            let mut added: Vec<usize> = (0..hosts.len())
                .filter(|position| !ordering.contains(position))
                .collect();
            added.shuffle(&mut *rng);
            ordering.extend(added);
            let position = current
                .pinned_index()
                .and_then(|index| {
                    ordering
                        .iter()
                        .position(|&position| hosts[position].index() == index)
                })
                .unwrap_or(0);
            Pin {
                generation: current.generation.wrapping_add(1),
                hosts: Arc::clone(&hosts),
                ordering: Arc::from(ordering),
                position,
            }
        });
        drop(rng);
        let from_host = previous.pinned_index();
        let to_host = self.pinned_host();
        if from_host != to_host {
            debug!(?from_host, ?to_host, "host update moved the pin");
        }
    }
}

impl LimitedChannel for PinUntilErrorChannel {
    fn maybe_execute(
        &self,
        endpoint: &Endpoint,
        request: Request,
        enforcement: LimitEnforcement,
    ) -> Dispatch {
        self.reshuffle_if_due();
        let pin = self.state.pin.load_full();
        let Some(host) = pin.host() else {
            return Dispatch::Rejected(request);
        };
        let generation = pin.generation;
        let state = Arc::clone(&self.state);
        host.maybe_execute(endpoint, request, enforcement)
            .map_accepted(move |future| {
                async move {
                    let result = future.await;
                    state.observe(generation, &result);
                    result
                }
                .boxed()
            })
    }
}

impl std::fmt::Debug for PinUntilErrorChannel {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pin = self.state.pin.load();
        formatter
            .debug_struct("PinUntilErrorChannel")
            .field("hosts", &pin.hosts.len())
            .field("generation", &pin.generation)
            .field("pinned_host", &pin.pinned_index())
            .finish()
    }
}
