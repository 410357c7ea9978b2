//! Host selection: deciding which host channel serves a call.
//!
//! Every selector offers a call to its hosts in some order and hands the
//! request back when none of them has capacity. [`StrategyChannel`] swaps
//! selectors when the hosts agree on a different strategy.

mod balanced;
mod pin_until_error;
mod random;
mod round_robin;
mod strategy;

use std::str::FromStr;
use std::sync::Arc;

use futures_util::FutureExt;
use http::HeaderMap;
use serde::Deserialize;

use crate::channel::{Dispatch, LimitEnforcement, LimitedChannel, LimitedChannelRef};
use crate::endpoint::Endpoint;
use crate::request::Request;

pub use balanced::BalancedChannel;
pub use pin_until_error::PinUntilErrorChannel;
pub use random::RandomChannel;
pub use round_robin::RoundRobinChannel;
pub use strategy::StrategyChannel;

/// Response header in which a server advertises its preferred strategies.
pub const NODE_SELECTION_STRATEGY_HEADER: &str = "node-selection-strategy";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeSelectionStrategy {
    #[default]
    PinUntilError,
    PinUntilErrorWithoutReshuffle,
    Balanced,
    RoundRobin,
    Random,
    /// A name this client does not recognize.
    #[serde(other)]
    Unknown,
}

impl NodeSelectionStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PinUntilError => "PIN_UNTIL_ERROR",
            Self::PinUntilErrorWithoutReshuffle => "PIN_UNTIL_ERROR_WITHOUT_RESHUFFLE",
            Self::Balanced => "BALANCED",
            Self::RoundRobin => "ROUND_ROBIN",
            Self::Random => "RANDOM",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Parses a strategy name, ignoring case and treating `-` like `_`.
    /// Unrecognized names yield [`NodeSelectionStrategy::Unknown`].
    pub fn parse(name: &str) -> Self {
        let normalized = name.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "PIN_UNTIL_ERROR" => Self::PinUntilError,
            "PIN_UNTIL_ERROR_WITHOUT_RESHUFFLE" => Self::PinUntilErrorWithoutReshuffle,
            "BALANCED" => Self::Balanced,
            "ROUND_ROBIN" => Self::RoundRobin,
            "RANDOM" => Self::Random,
            _ => Self::Unknown,
        }
    }
}

impl FromStr for NodeSelectionStrategy {
    type Err = std::convert::Infallible;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(name))
    }
}

impl std::fmt::Display for NodeSelectionStrategy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Strategies advertised in a response, in the server's preference order.
pub fn advertised_strategies(headers: &HeaderMap) -> Vec<NodeSelectionStrategy> {
    headers
        .get_all(NODE_SELECTION_STRATEGY_HEADER)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter(|name| !name.trim().is_empty())
        .map(NodeSelectionStrategy::parse)
        .collect()
}

/// Reconciles what each host advertised with the client's default.
///
/// Each host contributes its most preferred recognized strategy. When all
/// contributing hosts agree that strategy wins; when none contribute or they
/// disagree the default wins.
pub fn converge_strategy<'a, I>(
    observed: I,
    default: NodeSelectionStrategy,
) -> NodeSelectionStrategy
where
    I: IntoIterator<Item = &'a [NodeSelectionStrategy]>,
{
    let mut agreed = None;
    for advertised in observed {
        let Some(preferred) = advertised
            .iter()
            .copied()
            .find(|strategy| *strategy != NodeSelectionStrategy::Unknown)
        else {
            continue;
        };
        match agreed {
            None => agreed = Some(preferred),
            Some(existing) if existing == preferred => {}
            Some(_) => return default,
        }
    }
    agreed.unwrap_or(default)
}

/// Response attachment naming the host that produced the response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ServedBy(pub(crate) usize);

/// One host's channel chain, labelled with its stable index.
#[derive(Clone)]
pub struct HostChannel {
    index: usize,
    channel: LimitedChannelRef,
}

impl HostChannel {
    pub fn new(index: usize, channel: LimitedChannelRef) -> Self {
        Self { index, channel }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// A selector whose host list can change while calls are in flight.
///
/// Updating keeps whatever state the selector holds for hosts that are still
/// present. Calls already accepted complete against the hosts they were
/// offered.
pub(crate) trait HostSelector: LimitedChannel {
    fn update_hosts(&self, hosts: Arc<[HostChannel]>);
}

impl LimitedChannel for HostChannel {
    fn maybe_execute(
        &self,
        endpoint: &Endpoint,
        request: Request,
        enforcement: LimitEnforcement,
    ) -> Dispatch {
        let index = self.index;
        self.channel
            .maybe_execute(endpoint, request, enforcement)
            .map_accepted(move |future| {
                future
                    .map(move |result| {
                        result.map(|mut response| {
                            response.attachments_mut().insert(ServedBy(index));
                            response
                        })
                    })
                    .boxed()
            })
    }
}

impl std::fmt::Debug for HostChannel {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HostChannel")
            .field("index", &self.index)
            .finish()
    }
}

/// Offers the request to `hosts` in the given order, returning the first
/// acceptance.
pub(crate) fn offer_in_order<'a>(
    hosts: impl IntoIterator<Item = &'a HostChannel>,
    endpoint: &Endpoint,
    mut request: Request,
    enforcement: LimitEnforcement,
) -> Dispatch {
    for host in hosts {
        match host.maybe_execute(endpoint, request, enforcement) {
            accepted @ Dispatch::Accepted(_) => return accepted,
            Dispatch::Rejected(returned) => request = returned,
        }
    }
    Dispatch::Rejected(request)
}


#[cfg(test)]
mod tests {
    use http::HeaderMap;
    use http::header::HeaderValue;

    use super::{
        NODE_SELECTION_STRATEGY_HEADER, NodeSelectionStrategy, advertised_strategies,
        converge_strategy,
    };

    #[test]
    fn parses_case_insensitive_header_lists() {
        let mut headers = HeaderMap::new();
        headers.insert(
            NODE_SELECTION_STRATEGY_HEADER,
            HeaderValue::from_static("fancy_new_thing, balanced ,Pin-Until-Error"),
        );
        assert_eq!(
            advertised_strategies(&headers),
            vec![
                NodeSelectionStrategy::Unknown,
                NodeSelectionStrategy::Balanced,
                NodeSelectionStrategy::PinUntilError,
            ]
        );
    }

    #[test]
    fn convergence_adopts_agreement_and_falls_back_on_conflict() {
        use NodeSelectionStrategy::*;
        let default = PinUntilError;

        assert_eq!(converge_strategy(Vec::<&[_]>::new(), default), default);
        assert_eq!(
            converge_strategy([&[Unknown, Balanced][..], &[][..]], default),
            Balanced
        );
        assert_eq!(
            converge_strategy([&[Balanced][..], &[Balanced, RoundRobin][..]], default),
            Balanced
        );
        assert_eq!(
            converge_strategy([&[Balanced][..], &[RoundRobin][..]], default),
            default
        );
        assert_eq!(converge_strategy([&[Unknown][..]], default), default);
    }

    #[test]
    fn deserializes_unrecognized_names_as_unknown() {
        let parsed: Vec<NodeSelectionStrategy> =
            serde_json::from_str(r#"["ROUND_ROBIN", "SOMETHING_ELSE"]"#).expect("valid json");
        assert_eq!(
            parsed,
            vec![NodeSelectionStrategy::RoundRobin, NodeSelectionStrategy::Unknown]
        );
    }
}
