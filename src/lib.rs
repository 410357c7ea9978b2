//! `dispatchx` is the client-side dispatch pipeline for RPC service clients:
//! queueing, adaptive concurrency limits, node selection, retries,
//! blacklisting and sticky sessions in front of an opaque transport.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use dispatchx::prelude::{
//!     Channel, Endpoint, Pipeline, PipelineConfig, Request, Response, ResponseFuture,
//!     RetryPolicy,
//! };
//! use futures_util::FutureExt;
//!
//! struct Loopback;
//!
//! impl Channel for Loopback {
//!     fn execute(&self, _endpoint: &Endpoint, _request: Request) -> ResponseFuture {
//!         async { Ok(Response::from_status(200)) }.boxed()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::builder("catalog")
//!         .host("https://catalog-1.internal", Arc::new(Loopback))
//!         .host("https://catalog-2.internal", Arc::new(Loopback))
//!         .config(PipelineConfig::default().with_blacklist_duration(Duration::from_secs(5)))
//!         .retry_policy(RetryPolicy::standard().max_retries(3))
//!         .try_build()?;
//!
//!     let endpoint = Endpoint::new("catalog", "getItem", http::Method::GET);
//!     let response = pipeline.execute(&endpoint, Request::new()).await?;
//!     println!("status={}", response.status());
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Keep `RetryPolicy::standard()` and let hosts advertise a strategy.
//! - Configure a blacklist duration when hosts fail hard rather than slowly.
//! - Use `Pipeline::sticky_session()` for calls that must share one host.

mod blacklist;
mod channel;
mod clock;
mod config;
mod endpoint;
mod error;
mod limiter;
mod metrics;
mod observe;
mod pipeline;
mod queue;
mod request;
mod response;
mod retry;
mod selection;
mod stats;
mod sticky;
mod util;

pub use crate::blacklist::BlacklistingChannel;
pub use crate::channel::{
    Channel, Dispatch, FnChannel, LimitEnforcement, LimitedChannel, LimitedChannelRef,
    ResponseFuture, TransportChannel, channel_fn,
};
pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use crate::config::{BalancedTuning, LimiterTuning, PinUntilErrorTuning, PipelineConfig};
pub use crate::endpoint::{
    Endpoint, TAG_DISABLE_ENDPOINT_CONCURRENCY_LIMIT, TAG_DISABLE_ENDPOINT_QUEUE,
};
pub use crate::error::{Error, ErrorCode, TimeoutPhase, TransportErrorKind};
pub use crate::limiter::{
    AimdLimiter, CautiousLimiter, ConcurrencyLimitedChannel, ConcurrencyLimiter,
    EndpointLimitedChannel, LimiterBehavior, Permit, PermitOutcome,
};
pub use crate::metrics::{HostSnapshot, PipelineMetricsSnapshot};
pub use crate::observe::{Observer, RetryCause};
pub use crate::pipeline::{HostTarget, Pipeline, PipelineBuilder};
pub use crate::queue::QueuedChannel;
pub use crate::request::{Request, RequestBody, SubmissionContext};
pub use crate::response::{Response, ResponseBody};
pub use crate::retry::{RetryBudgetPolicy, RetryPolicy, RetryingChannel, ServerQos};
pub use crate::selection::{
    BalancedChannel, HostChannel, NODE_SELECTION_STRATEGY_HEADER, NodeSelectionStrategy,
    PinUntilErrorChannel, RandomChannel, RoundRobinChannel, StrategyChannel,
    advertised_strategies, converge_strategy,
};
pub use crate::stats::{DecayingCounter, RunningTimer, RunningTimers, SlidingWindow};
pub use crate::sticky::{StickySession, StickyToken, StickyTokenChannel};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        Channel, Endpoint, Error, ErrorCode, HostTarget, LimitedChannel, NodeSelectionStrategy,
        Pipeline, PipelineConfig, Request, RequestBody, Response, ResponseFuture,
        RetryBudgetPolicy, RetryPolicy, ServerQos, StickySession, StickyToken, TimeoutPhase,
        TransportErrorKind,
    };
}
