use thiserror::Error;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Which part of the exchange a transport timeout interrupted.
///
/// A connect timeout means no bytes reached the server. A read timeout means
/// the request may have been partially or fully processed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    Connect,
    Read,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::Read => "read",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    QueueFull,
    Transport,
    Timeout,
    RetriesExhausted,
    RetryBudgetExhausted,
    MissingStickyToken,
    StickyHostRemoved,
    NoHostsConfigured,
    DispatchAbandoned,
    Internal,
    InvalidConfig,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::RetriesExhausted => "retries_exhausted",
            Self::RetryBudgetExhausted => "retry_budget_exhausted",
            Self::MissingStickyToken => "missing_sticky_token",
            Self::StickyHostRemoved => "sticky_host_removed",
            Self::NoHostsConfigured => "no_hosts_configured",
            Self::DispatchAbandoned => "dispatch_abandoned",
            Self::Internal => "internal",
            Self::InvalidConfig => "invalid_config",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("request queue is full for {service}.{endpoint} (max_queue_size={max_queue_size})")]
    QueueFull {
        service: String,
        endpoint: String,
        max_queue_size: usize,
    },
    #[error("transport error ({kind}): {source}")]
    Transport {
        kind: TransportErrorKind,
        #[source]
        source: BoxError,
    },
    #[error("transport timed out during {phase}")]
    Timeout { phase: TimeoutPhase },
    #[error("call failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("retry budget exhausted for {service}.{endpoint}")]
    RetryBudgetExhausted { service: String, endpoint: String },
    #[error("response for sticky call {service}.{endpoint} did not carry a sticky token")]
    MissingStickyToken { service: String, endpoint: String },
    #[error("sticky session host {index} is no longer part of the host list")]
    StickyHostRemoved { index: usize },
    #[error("no hosts are configured for service {service}")]
    NoHostsConfigured { service: String },
    #[error("queued call was abandoned before it could be dispatched")]
    DispatchAbandoned,
    #[error("internal dispatch error: {message}")]
    Internal { message: String },
    #[error("invalid pipeline configuration: {message}")]
    InvalidConfig { message: &'static str },
}

impl Error {
    pub fn transport(
        kind: TransportErrorKind,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Transport {
            kind,
            source: source.into(),
        }
    }

    pub const fn timeout(phase: TimeoutPhase) -> Self {
        Self::Timeout { phase }
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::QueueFull { .. } => ErrorCode::QueueFull,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            Self::RetryBudgetExhausted { .. } => ErrorCode::RetryBudgetExhausted,
            Self::MissingStickyToken { .. } => ErrorCode::MissingStickyToken,
            Self::StickyHostRemoved { .. } => ErrorCode::StickyHostRemoved,
            Self::NoHostsConfigured { .. } => ErrorCode::NoHostsConfigured,
            Self::DispatchAbandoned => ErrorCode::DispatchAbandoned,
            Self::Internal { .. } => ErrorCode::Internal,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
        }
    }

    /// True for failures reported by the transport: socket errors and timeouts.
    pub fn is_io(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::RetriesExhausted { source, .. } => source.is_io(),
            _ => false,
        }
    }

    /// Whether another attempt may succeed where this one failed.
    ///
    /// Socket errors and connect timeouts are always safe to retry. A read
    /// timeout may mean the server already acted on the request, so it is only
    /// retried when the caller opts in.
    pub fn is_retryable_io(&self, retry_on_read_timeout: bool) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Timeout {
                phase: TimeoutPhase::Connect,
            } => true,
            Self::Timeout {
                phase: TimeoutPhase::Read,
            } => retry_on_read_timeout,
            _ => false,
        }
    }

    /// Number of attempts made before this error surfaced.
    pub fn attempts(&self) -> usize {
        match self {
            Self::RetriesExhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// The error reported by the final attempt, unwrapping retry exhaustion.
    pub fn last_attempt_error(&self) -> &Error {
        match self {
            Self::RetriesExhausted { source, .. } => source.last_attempt_error(),
            other => other,
        }
    }
}
