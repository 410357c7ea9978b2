use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture};
use tracing::warn;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;

pub type ResponseFuture = BoxFuture<'static, Result<Response, Error>>;

/// Whether a limiter may turn a call away for lack of capacity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LimitEnforcement {
    #[default]
    Enforce,
    /// Always issue a permit. Used to let a new sticky session establish itself.
    DangerousBypassLimits,
}

impl LimitEnforcement {
    pub const fn enforced(self) -> bool {
        matches!(self, Self::Enforce)
    }
}

/// Outcome of offering a call to a channel that may lack capacity.
///
/// A rejection hands the request back so the caller can queue it or offer it
/// elsewhere.
#[must_use = "a rejected request must be queued or offered to another channel"]
pub enum Dispatch {
    Accepted(ResponseFuture),
    Rejected(Request),
}

impl Dispatch {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// Wraps an accepted future, leaving rejections untouched.
    pub(crate) fn map_accepted(self, wrap: impl FnOnce(ResponseFuture) -> ResponseFuture) -> Self {
        match self {
            Self::Accepted(future) => Self::Accepted(wrap(future)),
            rejected @ Self::Rejected(_) => rejected,
        }
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted(_) => formatter.write_str("Dispatch::Accepted"),
            Self::Rejected(_) => formatter.write_str("Dispatch::Rejected"),
        }
    }
}

/// A channel that always accepts a call. Transports implement this.
pub trait Channel: Send + Sync + 'static {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture;
}

/// A channel that may decline a call when it has no capacity right now.
pub trait LimitedChannel: Send + Sync + 'static {
    fn maybe_execute(
        &self,
        endpoint: &Endpoint,
        request: Request,
        enforcement: LimitEnforcement,
    ) -> Dispatch;
}

impl<C: Channel + ?Sized> Channel for Arc<C> {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        (**self).execute(endpoint, request)
    }
}

impl<C: LimitedChannel + ?Sized> LimitedChannel for Arc<C> {
    fn maybe_execute(
        &self,
        endpoint: &Endpoint,
        request: Request,
        enforcement: LimitEnforcement,
    ) -> Dispatch {
        (**self).maybe_execute(endpoint, request, enforcement)
    }
}

/// A [`Channel`] backed by a closure.
pub struct FnChannel<F> {
    execute: F,
}

pub fn channel_fn<F>(execute: F) -> FnChannel<F>
where
    F: Fn(&Endpoint, Request) -> ResponseFuture + Send + Sync + 'static,
{
    FnChannel { execute }
}

impl<F> Channel for FnChannel<F>
where
    F: Fn(&Endpoint, Request) -> ResponseFuture + Send + Sync + 'static,
{
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        (self.execute)(endpoint, request)
    }
}

/// Shared handle to a limited channel, also used as a queue override target.
pub type LimitedChannelRef = Arc<dyn LimitedChannel>;

/// Adapts a transport into a [`LimitedChannel`] that never rejects.
///
/// Panics raised by the transport, either while creating the future or while
/// polling it, become failed responses instead of unwinding into the caller.
pub struct TransportChannel {
    transport: Arc<dyn Channel>,
}

impl TransportChannel {
    pub fn new(transport: Arc<dyn Channel>) -> Self {
        Self { transport }
    }
}

impl LimitedChannel for TransportChannel {
    fn maybe_execute(
        &self,
        endpoint: &Endpoint,
        request: Request,
        _enforcement: LimitEnforcement,
    ) -> Dispatch {
        Dispatch::Accepted(guarded_execute(self.transport.as_ref(), endpoint, request))
    }
}

impl Channel for TransportChannel {
    fn execute(&self, endpoint: &Endpoint, request: Request) -> ResponseFuture {
        guarded_execute(self.transport.as_ref(), endpoint, request)
    }
}

pub(crate) fn guarded_execute(
    channel: &dyn Channel,
    endpoint: &Endpoint,
    request: Request,
) -> ResponseFuture {
    match std::panic::catch_unwind(AssertUnwindSafe(|| channel.execute(endpoint, request))) {
        Ok(future) => AssertUnwindSafe(future)
            .catch_unwind()
            .map(|outcome| outcome.unwrap_or_else(|payload| Err(panic_error(payload.as_ref()))))
            .boxed(),
        Err(payload) => failed(panic_error(payload.as_ref())),
    }
}

/// Offers a call to a limited channel, converting a panic into a failed
/// response. The request is lost in that case, so the call is reported as
/// accepted-and-failed rather than rejected.
pub(crate) fn guarded_maybe_execute(
    channel: &dyn LimitedChannel,
    endpoint: &Endpoint,
    request: Request,
    enforcement: LimitEnforcement,
) -> Dispatch {
    match std::panic::catch_unwind(AssertUnwindSafe(|| {
        channel.maybe_execute(endpoint, request, enforcement)
    })) {
        Ok(dispatch) => dispatch,
        Err(payload) => Dispatch::Accepted(failed(panic_error(payload.as_ref()))),
    }
}

pub(crate) fn failed(error: Error) -> ResponseFuture {
    future::ready(Err(error)).boxed()
}

fn panic_error(payload: &(dyn std::any::Any + Send)) -> Error {
    let message = if let Some(text) = payload.downcast_ref::<&'static str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "channel panicked".to_owned()
    };
    warn!(message = %message, "caught panic at channel boundary");
    Error::Internal { message }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::FutureExt;
    use http::Method;

    use super::{Channel, Dispatch, LimitEnforcement, LimitedChannel, ResponseFuture};
    use super::{TransportChannel, channel_fn, guarded_execute};
    use crate::endpoint::Endpoint;
    use crate::error::{Error, ErrorCode};
    use crate::request::Request;
    use crate::response::Response;

    struct PanickingTransport;

    impl Channel for PanickingTransport {
        fn execute(&self, _endpoint: &Endpoint, _request: Request) -> ResponseFuture {
            panic!("transport bug");
        }
    }

    #[tokio::test]
    async fn synchronous_panic_becomes_failed_future() {
        let endpoint = Endpoint::new("svc", "ep", Method::GET);
        let error = guarded_execute(&PanickingTransport, &endpoint, Request::new())
            .await
            .expect_err("panic should surface as an error");
        assert_eq!(error.code(), ErrorCode::Internal);
    }

    #[tokio::test]
    async fn panic_while_polling_becomes_failed_future() {
        let transport: Arc<dyn Channel> = Arc::new(channel_fn(|_: &Endpoint, _: Request| {
            futures_util::future::lazy(|_| -> Result<Response, Error> { panic!("poll bug") })
                .boxed()
        }));
        let channel = TransportChannel::new(transport);
        let endpoint = Endpoint::new("svc", "ep", Method::GET);

        let Dispatch::Accepted(future) =
            channel.maybe_execute(&endpoint, Request::new(), LimitEnforcement::Enforce)
        else {
            panic!("transport channel never rejects");
        };
        let error = future.await.expect_err("panic should surface as an error");
        assert_eq!(error.code(), ErrorCode::Internal);
    }
}
