//! Weighted-voting aggregation
//!
//! Every signal votes for its action with its normalized weight. The action
//! with the most weight mass wins; equal mass goes to the action whose first
//! supporter appears earliest in dispatch order. The result depends only on
//! the set of signals and their order, never on arrival timing.

use std::collections::HashMap;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::config::EnsembleConfig;
use crate::error::{EnsembleError, EnsembleResult};
use crate::registry::ProviderProfile;
use crate::signal::NormalizedSignal;
use crate::types::{Action, MarketCondition, MarketSnapshot, ProviderId, RiskLevel};

use super::decision::{
    ActionMass, EnsembleDecision, ExecutionRecommendation, RiskAssessment, WeightedSignal,
};
use super::weights::{normalize, WeightPolicy};

/// Weight masses closer than this are a tie.
const TIE_EPSILON: f64 = 1e-9;
/// Providers named in the decision reasoning.
const TOP_CONTRIBUTORS: usize = 3;

/// Outcome of tallying weighted votes, before risk and execution gating.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteTally {
    pub winner: Action,
    pub confidence: f64,
    pub consensus: f64,
    pub breakdown: Vec<ActionMass>,
}

/// Tally `signals` with the given weights (normalized here).
///
/// Returns `None` for an empty batch.
pub fn tally(signals: &[NormalizedSignal], weights: &[f64]) -> Option<VoteTally> {
    if signals.is_empty() || signals.len() != weights.len() {
        return None;
    }
    let weights = normalize(weights);

    let mut breakdown: Vec<ActionMass> = Vec::with_capacity(Action::all().len());
    for (signal, weight) in signals.iter().zip(&weights) {
        let action = signal.signal().action;
        match breakdown.iter_mut().find(|m| m.action == action) {
            Some(mass) => {
                mass.weight += weight;
                mass.votes += 1;
            }
            None => breakdown.push(ActionMass {
                action,
                weight: *weight,
                votes: 1,
            }),
        }
    }

    // `breakdown` is in first-seen order, so keeping the earlier entry on a
    // tie implements the ordering tie-break.
    let mut best = breakdown[0];
    for mass in &breakdown[1..] {
        if mass.weight > best.weight + TIE_EPSILON {
            best = *mass;
        }
    }

    let total: f64 = breakdown.iter().map(|m| m.weight).sum();
    let consensus = if total > 0.0 { best.weight / total } else { 0.0 };

    let (weighted_conf, agreeing_weight) = signals
        .iter()
        .zip(&weights)
        .filter(|(s, _)| s.signal().action == best.action)
        .fold((0.0, 0.0), |(c, w), (s, weight)| {
            (c + s.signal().confidence * weight, w + weight)
        });
    let confidence = if agreeing_weight > 0.0 {
        (weighted_conf / agreeing_weight).clamp(0.0, 1.0)
    } else {
        0.0
    };

    Some(VoteTally {
        winner: best.action,
        confidence,
        consensus,
        breakdown,
    })
}

/// Combines normalized signals into an [`EnsembleDecision`].
#[derive(Debug, Clone)]
pub struct WeightedVoteAggregator {
    policy: WeightPolicy,
    confidence_threshold: f64,
    consensus_threshold: f64,
    low_volume_threshold: f64,
}

impl Default for WeightedVoteAggregator {
    fn default() -> Self {
        Self::from_config(&EnsembleConfig::default())
    }
}

impl WeightedVoteAggregator {
    pub fn from_config(config: &EnsembleConfig) -> Self {
        Self {
            policy: WeightPolicy {
                cost_weight: config.ensemble.cost_weight,
            },
            confidence_threshold: config.ensemble.confidence_threshold,
            consensus_threshold: config.ensemble.consensus_threshold,
            low_volume_threshold: config.risk.low_volume_threshold,
        }
    }

    pub fn policy(&self) -> &WeightPolicy {
        &self.policy
    }

    /// Weight signals from provider profiles and decide.
    pub fn aggregate(
        &self,
        symbol: &str,
        signals: Vec<NormalizedSignal>,
        profiles: &HashMap<ProviderId, ProviderProfile>,
        snapshot: &MarketSnapshot,
        total_cost: f64,
    ) -> EnsembleResult<EnsembleDecision> {
        let condition = MarketCondition::classify(snapshot);
        let weights: Vec<f64> = self
            .policy
            .compute(&signals, profiles, condition)
            .into_iter()
            .map(|w| w.normalized)
            .collect();
        self.aggregate_weighted(symbol, signals, &weights, snapshot, total_cost)
    }

    /// Decide from signals with explicit weights.
    pub fn aggregate_weighted(
        &self,
        symbol: &str,
        signals: Vec<NormalizedSignal>,
        weights: &[f64],
        snapshot: &MarketSnapshot,
        total_cost: f64,
    ) -> EnsembleResult<EnsembleDecision> {
        let tally = tally(&signals, weights).ok_or(EnsembleError::InsufficientSignals {
            got: signals.len(),
            need: 1,
            attempted: Vec::new(),
        })?;
        let weights = normalize(weights);

        let risk = self.assess_risk(&signals, snapshot);
        let execution = self.recommend(&tally, &risk);

        let weighted: Vec<WeightedSignal> = signals
            .into_iter()
            .zip(weights)
            .map(|(signal, weight)| WeightedSignal { signal, weight })
            .collect();
        let reasoning = summarize(&tally, &weighted);

        debug!(
            symbol,
            action = %tally.winner,
            confidence = tally.confidence,
            consensus = tally.consensus,
            risk = %risk.level,
            "Aggregated ensemble vote"
        );

        Ok(EnsembleDecision {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            action: tally.winner,
            confidence: tally.confidence,
            consensus: tally.consensus,
            condition: MarketCondition::classify(snapshot),
            breakdown: tally.breakdown,
            signals: weighted,
            risk,
            execution,
            reasoning,
            total_cost,
            created_at: Utc::now(),
        })
    }

    fn assess_risk(&self, signals: &[NormalizedSignal], snapshot: &MarketSnapshot) -> RiskAssessment {
        let avg_volatility = if signals.is_empty() {
            snapshot.volatility
        } else {
            signals
                .iter()
                .map(|s| s.signal().volatility.unwrap_or(snapshot.volatility))
                .sum::<f64>()
                / signals.len() as f64
        };
        let low_liquidity =
            self.low_volume_threshold > 0.0 && snapshot.volume < self.low_volume_threshold;
        let mut level = RiskLevel::from_volatility(avg_volatility);
        if low_liquidity {
            level = level.escalate();
        }
        RiskAssessment {
            level,
            avg_volatility,
            volume: snapshot.volume,
            low_liquidity,
        }
    }

    fn recommend(&self, tally: &VoteTally, risk: &RiskAssessment) -> ExecutionRecommendation {
        let mut blockers = Vec::new();
        if tally.winner == Action::Hold {
            blockers.push("winning action is HOLD".to_string());
        }
        if tally.confidence <= self.confidence_threshold {
            blockers.push(format!(
                "confidence {:.2} <= {:.2}",
                tally.confidence, self.confidence_threshold
            ));
        }
        if tally.consensus <= self.consensus_threshold {
            blockers.push(format!(
                "consensus {:.2} <= {:.2}",
                tally.consensus, self.consensus_threshold
            ));
        }
        if risk.level == RiskLevel::Extreme {
            blockers.push("risk is EXTREME".to_string());
        }
        ExecutionRecommendation {
            execute: blockers.is_empty(),
            blockers,
        }
    }
}

fn summarize(tally: &VoteTally, signals: &[WeightedSignal]) -> String {
    let agreeing: Vec<&WeightedSignal> = signals
        .iter()
        .filter(|s| s.signal.signal().action == tally.winner)
        .collect();
    let mut top = agreeing.clone();
    top.sort_by(|a, b| b.weight.total_cmp(&a.weight));
    let contributors = top
        .iter()
        .take(TOP_CONTRIBUTORS)
        .map(|s| format!("{} ({:.0}%)", s.signal.provider(), s.weight * 100.0))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{} backed by {}/{} providers ({:.0}% agreement, {:.0}% of vote weight); top contributors: {}",
        tally.winner,
        agreeing.len(),
        signals.len(),
        agreeing.len() as f64 / signals.len().max(1) as f64 * 100.0,
        tally.consensus * 100.0,
        contributors
    )
}
