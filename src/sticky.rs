use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::channel::{Channel, LimitEnforcement, LimitedChannelRef, ResponseFuture, failed};
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::queue::QueueOverride;
use crate::request::Request;
use crate::response::Response;
use crate::selection::ServedBy;

/// Binds a logical session to the host that served its first call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StickyToken {
    host_index: usize,
}

impl StickyToken {
    /// A token for a host index obtained from an earlier session.
    pub const fn new(host_index: usize) -> Self {
        Self { host_index }
    }

    pub const fn host_index(self) -> usize {
        self.host_index
    }
}

/// Request attachment carrying the session a call belongs to.
#[derive(Clone, Debug, Default)]
pub(crate) struct SessionCell(Arc<OnceCell<StickyToken>>);

impl SessionCell {
    pub(crate) fn established(token: StickyToken) -> Self {
        Self(Arc::new(OnceCell::from(token)))
    }

    pub(crate) fn token(&self) -> Option<StickyToken> {
        self.0.get().copied()
    }
}

/// Resolves a sticky token to the channel of the host it names.
pub(crate) trait StickyHosts: Send + Sync + 'static {
    fn host(&self, index: usize) -> Option<LimitedChannelRef>;
}

/// Routes calls that belong to a sticky session.
///
/// One call at a time establishes a session: it goes through normal
/// selection with limits bypassed, and the host that answered becomes the
/// session's token. Calls issued meanwhile wait for that token. Once it is
/// set, calls are sent straight to its host through the queue, under the
/// normal limits. Calls without a session pass through untouched.
pub struct StickyTokenChannel {
    delegate: Arc<dyn Channel>,
    hosts: Arc<dyn StickyHosts>,
}

impl StickyTokenChannel {
    pub(crate) fn new(delegate: Arc<dyn Channel>, hosts: Arc<dyn StickyHosts>) -> Self {
        Self { delegate, hosts }
    }
}

impl Channel for StickyTokenChannel {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        let Some(session) = request.attachments().get::<SessionCell>().cloned() else {
            return self.delegate.execute(endpoint, request);
        };
        if let Some(token) = session.token() {
            return route_to_host(&self.delegate, self.hosts.as_ref(), endpoint, request, token);
        }

        let delegate = Arc::clone(&self.delegate);
        let hosts = Arc::clone(&self.hosts);
        let endpoint = endpoint.clone();
        async move {
            let mut pending = Some(request);
            let mut first_response = None;
            let (delegate_ref, endpoint_ref) = (&delegate, &endpoint);
            let pending_slot = &mut pending;
            let response_slot = &mut first_response;
            // Runs at most one establishing call at a time. A failed attempt
            // leaves the cell empty for the next waiter to try.
            let token = *session
                .0
                .get_or_try_init(move || {
                    establish(delegate_ref, endpoint_ref, pending_slot, response_slot)
                })
                .await?;
            match (first_response, pending) {
                (Some(response), _) => Ok(response),
                (None, Some(request)) => {
                    route_to_host(&delegate, hosts.as_ref(), &endpoint, request, token).await
                }
                (None, None) => Err(Error::Internal {
                    message: "sticky call lost its request".to_owned(),
                }),
            }
        }
        .boxed()
    }
}

/// Sends a call to the token's host, under the normal limits.
fn route_to_host(
    delegate: &Arc<dyn Channel>,
    hosts: &dyn StickyHosts,
    endpoint: &Endpoint,
    mut request: Request,
    token: StickyToken,
) -> ResponseFuture {
    let Some(host) = hosts.host(token.host_index) else {
        return failed(Error::StickyHostRemoved {
            index: token.host_index,
        });
    };
    request.attachments_mut().remove::<LimitEnforcement>();
    request.attachments_mut().insert(QueueOverride(host));
    delegate.execute(endpoint, request)
}

/// Runs the first call of a session and reads the host that served it.
async fn establish(
    delegate: &Arc<dyn Channel>,
    endpoint: &Endpoint,
    pending: &mut Option<Request>,
    first_response: &mut Option<Response>,
) -> Result<StickyToken, Error> {
    let Some(mut request) = pending.take() else {
        return Err(Error::Internal {
            message: "sticky call lost its request".to_owned(),
        });
    };
    request
        .attachments_mut()
        .insert(LimitEnforcement::DangerousBypassLimits);
    let response = delegate.execute(endpoint, request).await?;
    let Some(ServedBy(host_index)) = response.attachments().get::<ServedBy>().copied() else {
        response.close();
        warn!(endpoint = %endpoint, "sticky call response did not name its host");
        return Err(Error::MissingStickyToken {
            service: endpoint.service_name().to_owned(),
            endpoint: endpoint.endpoint_name().to_owned(),
        });
    };
    debug!(endpoint = %endpoint, host_index, "sticky session established");
    *first_response = Some(response);
    Ok(StickyToken::new(host_index))
}

/// A sequence of calls pinned to one host.
///
/// Cloning shares the session. The token is set by the establishing call and
/// is never reassigned.
#[derive(Clone)]
pub struct StickySession {
    entry: Arc<dyn Channel>,
    cell: SessionCell,
}

impl StickySession {
    pub(crate) fn new(entry: Arc<dyn Channel>, cell: SessionCell) -> Self {
        Self { entry, cell }
    }

    /// The host binding, once the first call has completed.
    pub fn token(&self) -> Option<StickyToken> {
        self.cell.token()
    }

    pub fn execute(&self, endpoint: &Endpoint, mut request: Request) -> ResponseFuture {
        request.attachments_mut().insert(self.cell.clone());
        self.entry.execute(endpoint, request)
    }
}

impl std::fmt::Debug for StickySession {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("StickySession")
            .field("token", &self.token())
            .finish()
    }
}
