use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::Rng;

use super::{HostChannel, HostSelector, offer_in_order};
use crate::channel::{Dispatch, LimitEnforcement, LimitedChannel};
use crate::endpoint::Endpoint;
use crate::request::Request;

/// Starts each call at a random host, then tries the rest in order.
pub struct RandomChannel {
    hosts: ArcSwap<Vec<HostChannel>>,
}

impl RandomChannel {
    pub fn new(hosts: Arc<[HostChannel]>) -> Self {
        Self {
            hosts: ArcSwap::from_pointee(hosts.to_vec()),
        }
    }
}

impl HostSelector for RandomChannel {
    fn update_hosts(&self, hosts: Arc<[HostChannel]>) {
        self.hosts.store(Arc::new(hosts.to_vec()));
    }
}

impl LimitedChannel for RandomChannel {
    fn maybe_execute(
        &self,
        endpoint: &Endpoint,
        request: Request,
        enforcement: LimitEnforcement,
    ) -> Dispatch {
        let hosts = self.hosts.load();
        let count = hosts.len();
        if count == 0 {
            return Dispatch::Rejected(request);
        }
        let start = rand::rng().random_range(0..count);
        let order = (0..count).map(|offset| &hosts[(start + offset) % count]);
        offer_in_order(order, endpoint, request, enforcement)
    }
}
