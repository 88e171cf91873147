//! Per-signal vote weights
//!
//! raw = condition accuracy × reliability × (0.5 + 0.5 × recent performance)
//!       × 1 / (1 + cost_weight × cost per call)
//!
//! Raw weights are normalized to sum to 1 across the batch. Weights are
//! recomputed every cycle and never stored.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::registry::ProviderProfile;
use crate::signal::NormalizedSignal;
use crate::types::{MarketCondition, ProviderId};

/// Raw weight for a signal whose provider has no profile.
pub const NEUTRAL_RAW_WEIGHT: f64 = 0.5 * 1.0 * 0.75;

/// Tunables of the weight formula.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WeightPolicy {
    /// Penalty multiplier on cost per call; 0 ignores cost.
    pub cost_weight: f64,
}

/// Weight assigned to one signal in a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteWeight {
    pub provider: ProviderId,
    pub raw: f64,
    pub normalized: f64,
}

impl WeightPolicy {
    /// Unnormalized weight from a provider profile.
    pub fn raw_weight(&self, profile: &ProviderProfile, condition: MarketCondition) -> f64 {
        let recency = 0.5 + 0.5 * profile.recent_performance.clamp(0.0, 1.0);
        let cost = 1.0 / (1.0 + self.cost_weight.max(0.0) * profile.cost_per_call.max(0.0));
        (profile.accuracy_for(condition) * profile.reliability * recency * cost).max(0.0)
    }

    /// Weights for `signals` in order, normalized to sum to 1.
    ///
    /// If every raw weight is zero the batch is weighted uniformly.
    pub fn compute(
        &self,
        signals: &[NormalizedSignal],
        profiles: &HashMap<ProviderId, ProviderProfile>,
        condition: MarketCondition,
    ) -> Vec<VoteWeight> {
        let raws: Vec<f64> = signals
            .iter()
            .map(|s| {
                profiles
                    .get(s.provider())
                    .map(|p| self.raw_weight(p, condition))
                    .unwrap_or(NEUTRAL_RAW_WEIGHT)
            })
            .collect();
        let normalized = normalize(&raws);
        signals
            .iter()
            .zip(raws.iter().zip(normalized))
            .map(|(s, (raw, normalized))| VoteWeight {
                provider: s.provider().clone(),
                raw: *raw,
                normalized,
            })
            .collect()
    }
}

/// Scale non-negative values to sum to 1; uniform if they sum to 0.
pub fn normalize(raws: &[f64]) -> Vec<f64> {
    if raws.is_empty() {
        return Vec::new();
    }
    let total: f64 = raws.iter().map(|r| r.max(0.0)).sum();
    if total <= f64::EPSILON {
        let uniform = 1.0 / raws.len() as f64;
        return vec![uniform; raws.len()];
    }
    raws.iter().map(|r| r.max(0.0) / total).collect()
}
