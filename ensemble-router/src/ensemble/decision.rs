//! Ensemble decision types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signal::NormalizedSignal;
use crate::types::{Action, MarketCondition, RiskLevel};

/// A contributing signal with the weight it carried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedSignal {
    pub signal: NormalizedSignal,
    pub weight: f64,
}

/// Weight mass accumulated by one action.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionMass {
    pub action: Action,
    pub weight: f64,
    pub votes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// Mean volatility reported by contributing signals.
    pub avg_volatility: f64,
    pub volume: f64,
    /// Volume fell below the configured liquidity floor.
    pub low_liquidity: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecommendation {
    pub execute: bool,
    /// Gates that blocked execution; empty when `execute` is true.
    pub blockers: Vec<String>,
}

/// Final output of a decision cycle. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleDecision {
    pub id: Uuid,
    pub symbol: String,
    pub action: Action,
    pub confidence: f64,
    /// Winning action's share of total vote weight.
    pub consensus: f64,
    pub condition: MarketCondition,
    pub breakdown: Vec<ActionMass>,
    pub signals: Vec<WeightedSignal>,
    pub risk: RiskAssessment,
    pub execution: ExecutionRecommendation,
    pub reasoning: String,
    /// USD spent on the provider calls behind this decision.
    pub total_cost: f64,
    pub created_at: DateTime<Utc>,
}

impl EnsembleDecision {
    pub fn should_execute(&self) -> bool {
        self.execution.execute
    }

    /// Number of signals that voted for the winning action.
    pub fn agreeing(&self) -> usize {
        self.signals
            .iter()
            .filter(|s| s.signal.signal().action == self.action)
            .count()
    }
}
