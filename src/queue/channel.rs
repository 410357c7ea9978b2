use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::task::{Context, Poll, ready};

use futures_util::FutureExt;
use tokio::sync::oneshot;
use tracing::debug;

use super::QueueOverride;
use super::fair::{FairQueue, SubmissionKey};
use crate::channel::{
    Channel, Dispatch, LimitEnforcement, LimitedChannelRef, ResponseFuture, failed,
    guarded_maybe_execute,
};
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::observe::Instrumentation;
use crate::request::Request;
use crate::response::Response;
use crate::util::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};

/// Holds calls until the downstream channel has capacity.
///
/// A call is dispatched at once when nothing is waiting and the downstream
/// accepts it. Otherwise it joins a [`FairQueue`] and the returned future
/// resolves once a drain hands it a dispatched response future. Draining runs
/// after every enqueue and whenever a dispatched call completes or is
/// cancelled.
pub struct QueuedChannel {
    state: Arc<QueueState>,
}

struct QueueState {
    delegate: LimitedChannelRef,
    max_queue_size: usize,
    queue: Mutex<FairQueue<Pending>>,
    queued: AtomicUsize,
    draining: AtomicBool,
    rerun: AtomicBool,
    instrumentation: Instrumentation,
    group: Option<Arc<DrainGroup>>,
}

struct Pending {
    endpoint: Endpoint,
    request: Request,
    sender: oneshot::Sender<ResponseFuture>,
}

impl QueuedChannel {
    pub(crate) fn new(
        delegate: LimitedChannelRef,
        max_queue_size: usize,
        instrumentation: Instrumentation,
    ) -> Self {
        Self {
            state: Arc::new(QueueState {
                delegate,
                max_queue_size,
                queue: Mutex::new(FairQueue::new()),
                queued: AtomicUsize::new(0),
                draining: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                instrumentation,
                group: None,
            }),
        }
    }

    /// A queue that shares downstream capacity with the other members of
    /// `group`.
    pub(crate) fn in_group(
        delegate: LimitedChannelRef,
        max_queue_size: usize,
        instrumentation: Instrumentation,
        group: Arc<DrainGroup>,
    ) -> Self {
        let state = Arc::new(QueueState {
            delegate,
            max_queue_size,
            queue: Mutex::new(FairQueue::new()),
            queued: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            instrumentation,
            group: Some(Arc::clone(&group)),
        });
        group.join(&state);
        Self { state }
    }

    /// Number of calls currently waiting.
    pub fn queued(&self) -> usize {
        self.state.queued.load(Ordering::Acquire)
    }
}

impl Channel for QueuedChannel {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        let state = &self.state;
        let mut request = request;
        // Calls allowed past the limits also skip the line.
        if state.queued.load(Ordering::Acquire) == 0 || bypasses_limits(&request) {
            match state.offer(endpoint, request) {
                Dispatch::Accepted(future) => return state.track(future),
                Dispatch::Rejected(returned) => request = returned,
            }
        }

        let (sender, receiver) = oneshot::channel();
        let key = SubmissionKey::for_request(&request);
        {
            let mut queue = lock_unpoisoned(&state.queue);
            if queue.len() >= state.max_queue_size {
                drop(queue);
                debug!(
                    endpoint = %endpoint,
                    max_queue_size = state.max_queue_size,
                    "request queue is full"
                );
                state
                    .instrumentation
                    .queue_rejected(endpoint, state.max_queue_size);
                return failed(Error::QueueFull {
                    service: endpoint.service_name().to_owned(),
                    endpoint: endpoint.endpoint_name().to_owned(),
                    max_queue_size: state.max_queue_size,
                });
            }
            queue.push(
                key,
                Pending {
                    endpoint: endpoint.clone(),
                    request,
                    sender,
                },
            );
            state.queued.store(queue.len(), Ordering::Release);
        }
        state.instrumentation.metrics().record_enqueued();
        // Capacity may have been freed between the failed offer and the push.
        state.schedule_drain();

        async move {
            match receiver.await {
                Ok(future) => future.await,
                Err(_) => Err(Error::DispatchAbandoned),
            }
        }
        .boxed()
    }
}

/// Queues whose calls share downstream capacity.
///
/// A completion through any member may free capacity another member is
/// waiting on, so each completion re-drains every non-empty member.
#[derive(Default)]
pub(crate) struct DrainGroup {
    members: RwLock<Vec<Weak<QueueState>>>,
}

impl DrainGroup {
    pub(crate) fn drain_all(&self) {
        let members: Vec<Arc<QueueState>> = read_unpoisoned(&self.members)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for member in members {
            if member.queued.load(Ordering::Acquire) > 0 {
                member.schedule_drain();
            }
        }
    }

    fn join(&self, state: &Arc<QueueState>) {
        let mut members = write_unpoisoned(&self.members);
        members.retain(|member| member.strong_count() > 0);
        members.push(Arc::downgrade(state));
    }
}

impl QueueState {
    /// Offers a call to its override target, if any, else the delegate.
    fn offer(&self, endpoint: &Endpoint, request: Request) -> Dispatch {
        let enforcement = request
            .attachments()
            .get::<LimitEnforcement>()
            .copied()
            .unwrap_or_default();
        match request.attachments().get::<QueueOverride>().cloned() {
            Some(QueueOverride(target)) => {
                guarded_maybe_execute(target.as_ref(), endpoint, request, enforcement)
            }
            None => guarded_maybe_execute(self.delegate.as_ref(), endpoint, request, enforcement),
        }
    }

    fn track(self: &Arc<Self>, future: ResponseFuture) -> ResponseFuture {
        TrackedFuture {
            future: Some(future),
            state: Arc::clone(self),
        }
        .boxed()
    }

    fn capacity_freed(self: &Arc<Self>) {
        self.schedule_drain();
        if let Some(group) = &self.group {
            group.drain_all();
        }
    }

    fn schedule_drain(self: &Arc<Self>) {
        self.rerun.store(true, Ordering::Release);
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // The active drainer picks up the rerun flag.
                return;
            }
            while self.rerun.swap(false, Ordering::AcqRel) {
                self.drain();
            }
            self.draining.store(false, Ordering::Release);
            if !self.rerun.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn drain(self: &Arc<Self>) {
        loop {
            let Some((key, pending)) = self.pop_live() else {
                return;
            };
            let Pending {
                endpoint,
                request,
                sender,
            } = pending;
            match self.offer(&endpoint, request) {
                Dispatch::Accepted(future) => {
                    // A caller that went away drops the tracked future, which
                    // releases its permit and requests another drain.
                    let _ = sender.send(self.track(future));
                }
                Dispatch::Rejected(request) => {
                    let mut queue = lock_unpoisoned(&self.queue);
                    queue.push_front(
                        key,
                        Pending {
                            endpoint,
                            request,
                            sender,
                        },
                    );
                    self.queued.store(queue.len(), Ordering::Release);
                    drop(queue);
                    self.instrumentation.metrics().record_enqueued();
                    return;
                }
            }
        }
    }

    /// Pops the next call whose caller is still waiting.
    fn pop_live(&self) -> Option<(SubmissionKey, Pending)> {
        let mut queue = lock_unpoisoned(&self.queue);
        let mut dequeued = 0;
        let next = loop {
            match queue.pop() {
                Some((key, pending)) => {
                    dequeued += 1;
                    if !pending.sender.is_closed() {
                        break Some((key, pending));
                    }
                }
                None => break None,
            }
        };
        self.queued.store(queue.len(), Ordering::Release);
        drop(queue);
        self.instrumentation.metrics().record_dequeued(dequeued);
        next
    }
}

fn bypasses_limits(request: &Request) -> bool {
    request
        .attachments()
        .get::<LimitEnforcement>()
        .is_some_and(|enforcement| !enforcement.enforced())
}

/// Response future that triggers a drain when it completes or is dropped.
struct TrackedFuture {
    future: Option<ResponseFuture>,
    state: Arc<QueueState>,
}

impl Future for TrackedFuture {
    type Output = Result<Response, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(future) = self.future.as_mut() else {
            return Poll::Ready(Err(Error::Internal {
                message: "response future polled after completion".to_owned(),
            }));
        };
        let output = ready!(future.poll_unpin(cx));
        self.future = None;
        self.state.capacity_freed();
        Poll::Ready(output)
    }
}

impl Drop for TrackedFuture {
    fn drop(&mut self) {
        if self.future.take().is_some() {
            self.state.capacity_freed();
        }
    }
}

impl std::fmt::Debug for QueuedChannel {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("QueuedChannel")
            .field("queued", &self.queued())
            .field("max_queue_size", &self.state.max_queue_size)
            .finish()
    }
}
