use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::metrics::PipelineMetrics;
use crate::selection::NodeSelectionStrategy;

/// Callbacks for pipeline decisions. Every hook defaults to a no-op.
pub trait Observer: Send + Sync {
    fn on_retry_scheduled(
        &self,
        _endpoint: &Endpoint,
        _attempt: usize,
        _delay: Duration,
        _cause: RetryCause<'_>,
    ) {
    }

    fn on_queue_rejected(&self, _endpoint: &Endpoint, _max_queue_size: usize) {}

    fn on_strategy_changed(
        &self,
        _service: &str,
        _previous: NodeSelectionStrategy,
        _current: NodeSelectionStrategy,
    ) {
    }

    fn on_host_blacklisted(&self, _host_index: usize, _duration: Duration) {}

    fn on_pin_switched(&self, _from_host: usize, _to_host: usize) {}
}

/// What made the retry loop schedule another attempt.
#[derive(Clone, Copy, Debug)]
pub enum RetryCause<'a> {
    Status(http::StatusCode),
    Error(&'a Error),
}

/// Observer and metrics handed to every layer of one pipeline.
#[derive(Clone, Default)]
pub(crate) struct Instrumentation {
    observer: Option<Arc<dyn Observer>>,
    metrics: PipelineMetrics,
}

impl Instrumentation {
    pub(crate) fn new(observer: Option<Arc<dyn Observer>>, metrics: PipelineMetrics) -> Self {
        Self { observer, metrics }
    }

    pub(crate) fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub(crate) fn retry_scheduled(
        &self,
        endpoint: &Endpoint,
        attempt: usize,
        delay: Duration,
        cause: RetryCause<'_>,
    ) {
        self.metrics.record_retry();
        if let Some(observer) = &self.observer {
            observer.on_retry_scheduled(endpoint, attempt, delay, cause);
        }
    }

    pub(crate) fn queue_rejected(&self, endpoint: &Endpoint, max_queue_size: usize) {
        self.metrics.record_queue_rejection();
        if let Some(observer) = &self.observer {
            observer.on_queue_rejected(endpoint, max_queue_size);
        }
    }

    pub(crate) fn strategy_changed(
        &self,
        service: &str,
        previous: NodeSelectionStrategy,
        current: NodeSelectionStrategy,
    ) {
        self.metrics.record_strategy_change();
        if let Some(observer) = &self.observer {
            observer.on_strategy_changed(service, previous, current);
        }
    }

    pub(crate) fn host_blacklisted(&self, host_index: usize, duration: Duration) {
        self.metrics.record_blacklisting();
        if let Some(observer) = &self.observer {
            observer.on_host_blacklisted(host_index, duration);
        }
    }

    pub(crate) fn pin_switched(&self, from_host: usize, to_host: usize) {
        self.metrics.record_pin_switch();
        if let Some(observer) = &self.observer {
            observer.on_pin_switched(from_host, to_host);
        }
    }
}

impl std::fmt::Debug for Instrumentation {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Instrumentation")
            .field("observer", &self.observer.is_some())
            .field("metrics", &self.metrics.is_enabled())
            .finish()
    }
}
