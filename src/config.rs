use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::selection::NodeSelectionStrategy;

const DEFAULT_MAX_QUEUE_SIZE: usize = 100_000;

/// Tuning for the cautious-increase, aggressive-decrease limiter.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LimiterTuning {
    pub initial_limit: f64,
    pub min_limit: f64,
    pub max_limit: f64,
    /// Multiplier applied to the limit when a permit is dropped.
    pub backoff_ratio: f64,
    /// Fraction of the limit that must have been in use at acquisition time
    /// for a success to grow the limit.
    pub utilization_threshold: f64,
    /// Amount added to the limit by a qualifying success.
    pub increase_step: f64,
}

impl Default for LimiterTuning {
    fn default() -> Self {
        Self {
            initial_limit: 20.0,
            min_limit: 1.0,
            max_limit: 1_000_000.0,
            backoff_ratio: 0.9,
            utilization_threshold: 0.9,
            increase_step: 1.0,
        }
    }
}

impl LimiterTuning {
    pub fn initial_limit(mut self, initial_limit: f64) -> Self {
        self.initial_limit = initial_limit;
        self
    }

    pub fn max_limit(mut self, max_limit: f64) -> Self {
        self.max_limit = max_limit;
        self
    }

    pub fn backoff_ratio(mut self, backoff_ratio: f64) -> Self {
        self.backoff_ratio = backoff_ratio;
        self
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if !(self.min_limit >= 1.0) {
            return Err(Error::InvalidConfig {
                message: "limiter min_limit must be >= 1",
            });
        }
        if !(self.initial_limit.is_finite() && self.initial_limit >= 1.0) {
            return Err(Error::InvalidConfig {
                message: "limiter initial_limit must be finite and >= 1",
            });
        }
        if !(self.max_limit >= self.min_limit) {
            return Err(Error::InvalidConfig {
                message: "limiter max_limit must be >= min_limit",
            });
        }
        if !(self.backoff_ratio > 0.0 && self.backoff_ratio < 1.0) {
            return Err(Error::InvalidConfig {
                message: "limiter backoff_ratio must be in (0, 1)",
            });
        }
        if !(self.utilization_threshold > 0.0 && self.utilization_threshold <= 1.0) {
            return Err(Error::InvalidConfig {
                message: "limiter utilization_threshold must be in (0, 1]",
            });
        }
        if !(self.increase_step >= 0.0) {
            return Err(Error::InvalidConfig {
                message: "limiter increase_step must be >= 0",
            });
        }
        Ok(())
    }
}

/// Tuning for balanced host scoring.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BalancedTuning {
    /// Half-life of the per-host failure counter.
    pub failure_half_life_ms: u64,
    /// Decayed failure count above which a host counts as recently failed.
    pub failure_threshold: f64,
    /// Score added to a recently failed host.
    pub failure_penalty: u64,
    /// Hosts scoring within this distance of the best are picked at random.
    pub tiebreak_window: u64,
}

impl Default for BalancedTuning {
    fn default() -> Self {
        Self {
            failure_half_life_ms: 30_000,
            failure_threshold: 0.5,
            failure_penalty: 1_000,
            tiebreak_window: 2,
        }
    }
}

impl BalancedTuning {
    pub fn failure_half_life(&self) -> Duration {
        Duration::from_millis(self.failure_half_life_ms.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PinUntilErrorTuning {
    pub reshuffle_interval_ms: u64,
}

impl Default for PinUntilErrorTuning {
    fn default() -> Self {
        Self {
            reshuffle_interval_ms: 10 * 60 * 1_000,
        }
    }
}

impl PinUntilErrorTuning {
    pub fn reshuffle_interval(&self) -> Duration {
        Duration::from_millis(self.reshuffle_interval_ms.max(1))
    }
}

/// Settings of one dispatch pipeline.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PipelineConfig {
    pub max_queue_size: usize,
    pub default_strategy: NodeSelectionStrategy,
    /// Exclusion period after a host fails; `None` disables blacklisting.
    pub blacklist_duration_ms: Option<u64>,
    pub host_limiter: LimiterTuning,
    pub endpoint_limiter: LimiterTuning,
    pub balanced: BalancedTuning,
    pub pin_until_error: PinUntilErrorTuning,
    /// Seed for shuffles and tiebreaks; random when unset.
    pub rng_seed: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            default_strategy: NodeSelectionStrategy::PinUntilError,
            blacklist_duration_ms: None,
            host_limiter: LimiterTuning::default(),
            endpoint_limiter: LimiterTuning::default(),
            balanced: BalancedTuning::default(),
            pin_until_error: PinUntilErrorTuning::default(),
            rng_seed: None,
        }
    }
}

impl PipelineConfig {
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn with_default_strategy(mut self, default_strategy: NodeSelectionStrategy) -> Self {
        self.default_strategy = default_strategy;
        self
    }

    pub fn with_blacklist_duration(mut self, blacklist_duration: Duration) -> Self {
        self.blacklist_duration_ms =
            Some(u64::try_from(blacklist_duration.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_host_limiter(mut self, host_limiter: LimiterTuning) -> Self {
        self.host_limiter = host_limiter;
        self
    }

    pub fn with_endpoint_limiter(mut self, endpoint_limiter: LimiterTuning) -> Self {
        self.endpoint_limiter = endpoint_limiter;
        self
    }

    pub fn with_balanced(mut self, balanced: BalancedTuning) -> Self {
        self.balanced = balanced;
        self
    }

    pub fn with_pin_until_error(mut self, pin_until_error: PinUntilErrorTuning) -> Self {
        self.pin_until_error = pin_until_error;
        self
    }

    pub fn with_rng_seed(mut self, rng_seed: u64) -> Self {
        self.rng_seed = Some(rng_seed);
        self
    }

    pub fn blacklist_duration(&self) -> Option<Duration> {
        self.blacklist_duration_ms
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis)
    }

    pub(crate) fn validate(&self) -> crate::Result<()> {
        if self.default_strategy == NodeSelectionStrategy::Unknown {
            return Err(Error::InvalidConfig {
                message: "default_strategy must be a known strategy",
            });
        }
        self.host_limiter.validate()?;
        self.endpoint_limiter.validate()
    }
}
