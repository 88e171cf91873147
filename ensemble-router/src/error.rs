//! Error types surfaced by the router
//!
//! Per-call failures ([`ProviderError`]) are recovered locally by the
//! dispatcher. Only quorum-level conditions become an [`EnsembleError`]
//! returned to the caller.

use std::time::Duration;

use crate::types::ProviderId;

/// Failure of a single provider call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited: retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Circuit open for {0}")]
    CircuitOpen(ProviderId),

    #[error("Cancelled")]
    Cancelled,

    /// The cycle deadline ran out before or during the call.
    #[error("Cycle deadline exceeded")]
    DeadlineExceeded,
}

impl ProviderError {
    /// Whether this failure should count against the provider's breaker.
    ///
    /// Short-circuits, caller cancellations and the caller's own deadline
    /// say nothing about the provider's health.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            ProviderError::CircuitOpen(_)
                | ProviderError::Cancelled
                | ProviderError::DeadlineExceeded
        )
    }

    /// Stable label for logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Transport(_) => "transport",
            ProviderError::Auth(_) => "auth",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::InvalidResponse(_) => "invalid_response",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::CircuitOpen(_) => "circuit_open",
            ProviderError::Cancelled => "cancelled",
            ProviderError::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

/// Result type for provider calls
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Cycle-level failure returned to callers of the router.
#[derive(Debug, thiserror::Error)]
pub enum EnsembleError {
    #[error("No providers available")]
    NoProvidersAvailable,

    #[error("Insufficient providers: {available} eligible, need {required}")]
    InsufficientProviders { available: usize, required: usize },

    #[error("Insufficient signals: got {got}, need {need} (attempted: {attempted:?})")]
    InsufficientSignals {
        got: usize,
        need: usize,
        attempted: Vec<ProviderId>,
    },

    #[error("Decision cycle cancelled")]
    Cancelled,

    #[error("Decision deadline exceeded: got {got} of {need} signals")]
    DeadlineExceeded { got: usize, need: usize },

    #[error("Batch queue closed")]
    BatchClosed,

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl EnsembleError {
    /// Copy of this error for another waiter on the same cycle.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            EnsembleError::NoProvidersAvailable => EnsembleError::NoProvidersAvailable,
            EnsembleError::InsufficientProviders {
                available,
                required,
            } => EnsembleError::InsufficientProviders {
                available: *available,
                required: *required,
            },
            EnsembleError::InsufficientSignals {
                got,
                need,
                attempted,
            } => EnsembleError::InsufficientSignals {
                got: *got,
                need: *need,
                attempted: attempted.clone(),
            },
            EnsembleError::Cancelled => EnsembleError::Cancelled,
            EnsembleError::DeadlineExceeded { got, need } => EnsembleError::DeadlineExceeded {
                got: *got,
                need: *need,
            },
            EnsembleError::BatchClosed => EnsembleError::BatchClosed,
            // io and parse sources are not Clone; keep the message
            EnsembleError::Config(e) => {
                EnsembleError::Config(crate::config::ConfigError::Invalid(e.to_string()))
            }
        }
    }
}

/// Result type for decision cycles
pub type EnsembleResult<T> = Result<T, EnsembleError>;
