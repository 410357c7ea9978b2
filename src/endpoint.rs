use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use http::Method;

/// Routes the endpoint through the pipeline-wide queue instead of its own.
pub const TAG_DISABLE_ENDPOINT_QUEUE: &str = "disable-endpoint-queue";
/// Skips the per-endpoint concurrency limiter; the host limiter still applies.
pub const TAG_DISABLE_ENDPOINT_CONCURRENCY_LIMIT: &str = "disable-endpoint-concurrency-limit";

/// Stable identity of a logical service call.
///
/// Cloning is cheap. Equality and hashing use the service and endpoint names
/// only, so two handles describing the same endpoint share queues and limiters.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    service_name: String,
    endpoint_name: String,
    method: Method,
    tags: BTreeSet<String>,
}

impl Endpoint {
    pub fn new(
        service_name: impl Into<String>,
        endpoint_name: impl Into<String>,
        method: Method,
    ) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                service_name: service_name.into(),
                endpoint_name: endpoint_name.into(),
                method,
                tags: BTreeSet::new(),
            }),
        }
    }

    pub fn with_tag(self, tag: impl Into<String>) -> Self {
        let mut tags = self.inner.tags.clone();
        tags.insert(tag.into());
        Self {
            inner: Arc::new(EndpointInner {
                service_name: self.inner.service_name.clone(),
                endpoint_name: self.inner.endpoint_name.clone(),
                method: self.inner.method.clone(),
                tags,
            }),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub fn endpoint_name(&self) -> &str {
        &self.inner.endpoint_name
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.inner.tags.contains(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.inner.tags.iter().map(String::as_str)
    }

    /// Whether repeating the call is harmless for the server.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.inner.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
        )
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.service_name == other.inner.service_name
                && self.inner.endpoint_name == other.inner.endpoint_name)
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.service_name.hash(state);
        self.inner.endpoint_name.hash(state);
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Endpoint")
            .field("service_name", &self.inner.service_name)
            .field("endpoint_name", &self.inner.endpoint_name)
            .field("method", &self.inner.method)
            .field("tags", &self.inner.tags)
            .finish()
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            formatter,
            "{}.{}",
            self.inner.service_name, self.inner.endpoint_name
        )
    }
}
