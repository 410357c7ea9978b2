//! Queueing of calls that find no downstream capacity.

mod channel;
mod fair;

use crate::channel::LimitedChannelRef;

pub use channel::QueuedChannel;
pub(crate) use channel::DrainGroup;

/// Request attachment that sends a queued call to a specific channel instead
/// of the queue's delegate. Sticky sessions use it to reach their host.
#[derive(Clone)]
pub(crate) struct QueueOverride(pub(crate) LimitedChannelRef);
