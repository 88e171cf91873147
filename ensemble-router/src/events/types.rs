//! Event types published by the router

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::feedback::Outcome;
use crate::types::{Action, MarketCondition, ProviderId};

/// Which spend ceiling forced a request to be shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    PerRequest,
    Daily,
}

/// All router notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnsembleEvent {
    /// A decision cycle produced a result
    DecisionMade {
        decision_id: Uuid,
        symbol: String,
        action: Action,
        confidence: f64,
        consensus: f64,
        providers: Vec<ProviderId>,
        ensemble: bool,
        cost: f64,
        timestamp: DateTime<Utc>,
    },

    /// A provider call failed and was excluded from the cycle
    ProviderFailed {
        provider: ProviderId,
        error_kind: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// A provider's breaker tripped
    CircuitOpened {
        provider: ProviderId,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },

    /// A half-open trial succeeded
    CircuitClosed {
        provider: ProviderId,
        timestamp: DateTime<Utc>,
    },

    /// A request was answered from the cache
    CacheHit {
        symbol: String,
        key: String,
        hits: u64,
        timestamp: DateTime<Utc>,
    },

    /// Too few signals survived dispatch
    QuorumFailed {
        symbol: String,
        got: usize,
        need: usize,
        attempted: Vec<ProviderId>,
        timestamp: DateTime<Utc>,
    },

    /// Response length was reduced to stay under a spend ceiling
    BudgetShaped {
        symbol: String,
        scope: BudgetScope,
        projected_cost: f64,
        requested_tokens: u32,
        granted_tokens: u32,
        timestamp: DateTime<Utc>,
    },

    /// Deferred low-priority requests were dispatched together
    BatchFlushed {
        size: usize,
        trigger: String,
        timestamp: DateTime<Utc>,
    },

    /// A realized trade outcome updated a provider profile
    OutcomeRecorded {
        provider: ProviderId,
        condition: MarketCondition,
        outcome: Outcome,
        accuracy: f64,
        timestamp: DateTime<Utc>,
    },
}

impl EnsembleEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EnsembleEvent::DecisionMade { timestamp, .. } => *timestamp,
            EnsembleEvent::ProviderFailed { timestamp, .. } => *timestamp,
            EnsembleEvent::CircuitOpened { timestamp, .. } => *timestamp,
            EnsembleEvent::CircuitClosed { timestamp, .. } => *timestamp,
            EnsembleEvent::CacheHit { timestamp, .. } => *timestamp,
            EnsembleEvent::QuorumFailed { timestamp, .. } => *timestamp,
            EnsembleEvent::BudgetShaped { timestamp, .. } => *timestamp,
            EnsembleEvent::BatchFlushed { timestamp, .. } => *timestamp,
            EnsembleEvent::OutcomeRecorded { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            EnsembleEvent::DecisionMade { .. } => "decision_made",
            EnsembleEvent::ProviderFailed { .. } => "provider_failed",
            EnsembleEvent::CircuitOpened { .. } => "circuit_opened",
            EnsembleEvent::CircuitClosed { .. } => "circuit_closed",
            EnsembleEvent::CacheHit { .. } => "cache_hit",
            EnsembleEvent::QuorumFailed { .. } => "quorum_failed",
            EnsembleEvent::BudgetShaped { .. } => "budget_shaped",
            EnsembleEvent::BatchFlushed { .. } => "batch_flushed",
            EnsembleEvent::OutcomeRecorded { .. } => "outcome_recorded",
        }
    }

    /// Get the provider if this event concerns a single provider
    pub fn provider(&self) -> Option<&ProviderId> {
        match self {
            EnsembleEvent::ProviderFailed { provider, .. } => Some(provider),
            EnsembleEvent::CircuitOpened { provider, .. } => Some(provider),
            EnsembleEvent::CircuitClosed { provider, .. } => Some(provider),
            EnsembleEvent::OutcomeRecorded { provider, .. } => Some(provider),
            _ => None,
        }
    }
}
