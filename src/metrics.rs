use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::Error;
use crate::response::Response;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PipelineMetricsSnapshot {
    pub calls_started: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub calls_in_flight: u64,
    pub retries: u64,
    pub retry_budget_exhausted: u64,
    pub queue_rejections: u64,
    pub queued: u64,
    pub strategy_changes: u64,
    pub blacklistings: u64,
    pub pin_switches: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

/// Point-in-time view of one host channel.
#[derive(Clone, Debug, PartialEq)]
pub struct HostSnapshot {
    pub index: usize,
    pub uri: String,
    pub inflight: usize,
    pub limit: f64,
    pub blacklisted: bool,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct PipelineMetrics {
    inner: Option<Arc<PipelineMetricsInner>>,
}

#[derive(Debug, Default)]
struct PipelineMetricsInner {
    calls_started: AtomicU64,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
    calls_in_flight: AtomicU64,
    retries: AtomicU64,
    retry_budget_exhausted: AtomicU64,
    queue_rejections: AtomicU64,
    queued: AtomicU64,
    strategy_changes: AtomicU64,
    blacklistings: AtomicU64,
    pin_switches: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    inner: Option<Arc<PipelineMetricsInner>>,
}

macro_rules! counter {
    ($name:ident, $field:ident) => {
        pub(crate) fn $name(&self) {
            if let Some(inner) = &self.inner {
                inner.$field.fetch_add(1, Ordering::Relaxed);
            }
        }
    };
}

impl PipelineMetrics {
    pub(crate) fn new(enabled: bool) -> Self {
        if enabled {
            Self {
                inner: Some(Arc::new(PipelineMetricsInner::default())),
            }
        } else {
            Self::default()
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    counter!(record_call_started, calls_started);
    counter!(record_retry, retries);
    counter!(record_retry_budget_exhausted, retry_budget_exhausted);
    counter!(record_queue_rejection, queue_rejections);
    counter!(record_strategy_change, strategy_changes);
    counter!(record_blacklisting, blacklistings);
    counter!(record_pin_switch, pin_switches);

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        if let Some(inner) = &self.inner {
            inner.calls_in_flight.fetch_add(1, Ordering::Relaxed);
        }
        InFlightGuard {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn record_enqueued(&self) {
        if let Some(inner) = &self.inner {
            inner.queued.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_dequeued(&self, count: usize) {
        if let Some(inner) = &self.inner {
            let count = count as u64;
            let _ = inner
                .queued
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |queued| {
                    Some(queued.saturating_sub(count))
                });
        }
    }

    pub(crate) fn record_call_completed(
        &self,
        result: &Result<Response, Error>,
        latency: Duration,
    ) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
        match result {
            Ok(response) => {
                inner.calls_succeeded.fetch_add(1, Ordering::Relaxed);
                let mut status_counts = lock_unpoisoned(&inner.status_counts);
                *status_counts.entry(response.status().as_u16()).or_insert(0) += 1;
            }
            Err(error) => {
                inner.calls_failed.fetch_add(1, Ordering::Relaxed);
                let key = match error.last_attempt_error() {
                    Error::Transport { kind, .. } => format!("transport:{kind}"),
                    Error::Timeout { phase } => format!("timeout:{phase}"),
                    other => other.code().as_str().to_owned(),
                };
                let mut error_counts = lock_unpoisoned(&inner.error_counts);
                *error_counts.entry(key).or_insert(0) += 1;
            }
        }
    }

    pub(crate) fn snapshot(&self) -> PipelineMetricsSnapshot {
        let Some(inner) = &self.inner else {
            return PipelineMetricsSnapshot::default();
        };
        let latency_samples = inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        PipelineMetricsSnapshot {
            calls_started: inner.calls_started.load(Ordering::Relaxed),
            calls_succeeded: inner.calls_succeeded.load(Ordering::Relaxed),
            calls_failed: inner.calls_failed.load(Ordering::Relaxed),
            calls_in_flight: inner.calls_in_flight.load(Ordering::Relaxed),
            retries: inner.retries.load(Ordering::Relaxed),
            retry_budget_exhausted: inner.retry_budget_exhausted.load(Ordering::Relaxed),
            queue_rejections: inner.queue_rejections.load(Ordering::Relaxed),
            queued: inner.queued.load(Ordering::Relaxed),
            strategy_changes: inner.strategy_changes.load(Ordering::Relaxed),
            blacklistings: inner.blacklistings.load(Ordering::Relaxed),
            pin_switches: inner.pin_switches.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            inner.calls_in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
