use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use arc_swap::ArcSwap;

use super::{HostChannel, HostSelector, offer_in_order};
use crate::channel::{Dispatch, LimitEnforcement, LimitedChannel};
use crate::endpoint::Endpoint;
use crate::request::Request;

/// Rotates the first host offered each call, falling through to the others.
pub struct RoundRobinChannel {
    hosts: ArcSwap<Vec<HostChannel>>,
    cursor: AtomicUsize,
}

impl RoundRobinChannel {
    pub fn new(hosts: Arc<[HostChannel]>) -> Self {
        Self {
            hosts: ArcSwap::from_pointee(hosts.to_vec()),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl HostSelector for RoundRobinChannel {
    fn update_hosts(&self, hosts: Arc<[HostChannel]>) {
        self.hosts.store(Arc::new(hosts.to_vec()));
    }
}

impl LimitedChannel for RoundRobinChannel {
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
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        let order = (0..count).map(|offset| &hosts[(start + offset) % count]);
        offer_in_order(order, endpoint, request, enforcement)
    }
}
