//! Normalized trading signals
//!
//! One [`NormalizedSignal`] is produced per completed provider call. The
//! variant records whether the provider's output was usable; downstream
//! code never inspects raw provider text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Action, ProviderId};

/// A structured trading opinion from one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub action: Action,
    /// Always within [0, 1].
    pub confidence: f64,
    pub reasoning: String,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Suggested fraction of the allowed position (0 = none).
    pub position_size: f64,
    pub risk_reward: f64,
    /// Provider's volatility estimate as a fraction of price, if given.
    pub volatility: Option<f64>,
    pub provider: ProviderId,
    pub model: String,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Why a provider's output could not be used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ParseFailure {
    NoStructuredBlock,
    InvalidJson(String),
    MissingField(String),
    InvalidAction(String),
    InvalidConfidence(String),
}

impl std::fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoStructuredBlock => write!(f, "no structured block found"),
            Self::InvalidJson(e) => write!(f, "invalid JSON: {e}"),
            Self::MissingField(name) => write!(f, "missing field '{name}'"),
            Self::InvalidAction(a) => write!(f, "invalid action '{a}'"),
            Self::InvalidConfidence(c) => write!(f, "invalid confidence '{c}'"),
        }
    }
}

/// Outcome of normalizing one provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NormalizedSignal {
    /// The response parsed into a usable signal.
    Valid(Signal),
    /// The response was unusable; `signal` is a neutral HOLD at confidence 0.
    Fallback { signal: Signal, reason: ParseFailure },
}

impl NormalizedSignal {
    pub fn signal(&self) -> &Signal {
        match self {
            Self::Valid(signal) => signal,
            Self::Fallback { signal, .. } => signal,
        }
    }

    pub fn into_signal(self) -> Signal {
        match self {
            Self::Valid(signal) => signal,
            Self::Fallback { signal, .. } => signal,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }

    pub fn provider(&self) -> &ProviderId {
        &self.signal().provider
    }
}
