//! Provider selection
//!
//! Scores eligible providers from their profiles and ranks them for either
//! an ensemble fan-out or a single best call. Selection is a pure read of
//! the registry and the breaker table.

use tracing::debug;

use crate::error::{EnsembleError, EnsembleResult};
use crate::registry::{ProviderProfile, SharedProviderRegistry};
use crate::types::{MarketCondition, Priority, ProviderId};

use super::circuit_breaker::SharedBreakerTable;

const ACCURACY_WEIGHT: f64 = 0.5;
const UPTIME_WEIGHT: f64 = 0.3;
const FAILURE_PENALTY: f64 = 0.2;
/// Extra weight given to the priority-specific term in single selection.
const PRIORITY_TERM_WEIGHT: f64 = 0.4;
const LOW_PRIORITY_COST_WEIGHT: f64 = 0.2;

/// A provider chosen by the selector, with the score it was ranked by.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedProvider {
    pub id: ProviderId,
    pub score: f64,
    pub load: u32,
    pub priority_tier: u8,
}

/// Base selection score: accuracy, uptime, and a recent-failure penalty.
pub fn base_score(profile: &ProviderProfile, condition: MarketCondition) -> f64 {
    ACCURACY_WEIGHT * profile.accuracy_for(condition) + UPTIME_WEIGHT * profile.uptime()
        - FAILURE_PENALTY * profile.failure_ratio()
}

fn rank(mut ranked: Vec<RankedProvider>) -> Vec<RankedProvider> {
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.load.cmp(&b.load))
            .then_with(|| a.priority_tier.cmp(&b.priority_tier))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

/// Ranks providers for a request.
#[derive(Clone)]
pub struct ProviderSelector {
    registry: SharedProviderRegistry,
    breakers: SharedBreakerTable,
    required_capability: Option<String>,
}

impl ProviderSelector {
    pub fn new(registry: SharedProviderRegistry, breakers: SharedBreakerTable) -> Self {
        Self {
            registry,
            breakers,
            required_capability: None,
        }
    }

    /// Only consider providers tagged with `capability`.
    pub fn with_required_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capability = Some(capability.into());
        self
    }

    /// Profiles of providers that can take a call right now: available,
    /// circuit not open, and carrying the required capability.
    pub fn eligible(&self, candidates: &[ProviderId]) -> Vec<ProviderProfile> {
        candidates
            .iter()
            .filter_map(|id| self.registry.profile(id))
            .filter(|p| p.available)
            .filter(|p| self.breakers.is_available(&p.id))
            .filter(|p| {
                self.required_capability
                    .as_deref()
                    .map(|c| p.has_capability(c))
                    .unwrap_or(true)
            })
            .collect()
    }

    fn ranked(
        &self,
        profiles: &[ProviderProfile],
        score: impl Fn(&ProviderProfile) -> f64,
    ) -> Vec<RankedProvider> {
        rank(
            profiles
                .iter()
                .map(|p| RankedProvider {
                    id: p.id.clone(),
                    score: score(p),
                    load: self.registry.load(&p.id),
                    priority_tier: p.priority_tier,
                })
                .collect(),
        )
    }

    /// Best `max_count` providers among `candidates` for an ensemble.
    pub fn select_for_ensemble(
        &self,
        candidates: &[ProviderId],
        condition: MarketCondition,
        max_count: usize,
    ) -> EnsembleResult<Vec<RankedProvider>> {
        let eligible = self.eligible(candidates);
        if eligible.is_empty() {
            return Err(EnsembleError::NoProvidersAvailable);
        }
        let mut ranked = self.ranked(&eligible, |p| base_score(p, condition));
        ranked.truncate(max_count.max(1));
        debug!(
            %condition,
            selected = ?ranked.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            "Selected ensemble providers"
        );
        Ok(ranked)
    }

    /// All eligible providers ranked for a single call at `priority`.
    ///
    /// HIGH favors low latency, MEDIUM favors low cost, LOW weighs cost
    /// lightly and ignores latency.
    pub fn rank_single(
        &self,
        candidates: &[ProviderId],
        priority: Priority,
        condition: MarketCondition,
    ) -> EnsembleResult<Vec<RankedProvider>> {
        let eligible = self.eligible(candidates);
        if eligible.is_empty() {
            return Err(EnsembleError::NoProvidersAvailable);
        }
        let max_latency = eligible
            .iter()
            .map(|p| p.avg_latency_ms)
            .fold(0.0_f64, f64::max);
        let max_cost = eligible
            .iter()
            .map(|p| p.cost_per_call)
            .fold(0.0_f64, f64::max);
        let relative = |value: f64, max: f64| if max > 0.0 { 1.0 - value / max } else { 1.0 };

        Ok(self.ranked(&eligible, |p| {
            let base = base_score(p, condition);
            match priority {
                Priority::High => {
                    base + PRIORITY_TERM_WEIGHT * relative(p.avg_latency_ms, max_latency)
                }
                Priority::Medium => {
                    base + PRIORITY_TERM_WEIGHT * relative(p.cost_per_call, max_cost)
                }
                Priority::Low => {
                    base + LOW_PRIORITY_COST_WEIGHT * relative(p.cost_per_call, max_cost)
                }
            }
        }))
    }

    /// The single best provider for `priority`.
    pub fn select_single_best(
        &self,
        candidates: &[ProviderId],
        priority: Priority,
        condition: MarketCondition,
    ) -> EnsembleResult<RankedProvider> {
        self.rank_single(candidates, priority, condition)?
            .into_iter()
            .next()
            .ok_or(EnsembleError::NoProvidersAvailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::registry::{ProviderProfile, ProviderRegistry};
    use crate::router::circuit_breaker::CircuitBreakerTable;

    fn setup(profiles: Vec<ProviderProfile>) -> (ProviderSelector, Vec<ProviderId>) {
        let registry = profiles
            .into_iter()
            .fold(ProviderRegistry::new(), |r, p| r.with_profile(p))
            .shared();
        let ids = registry.ids().to_vec();
        let breakers = CircuitBreakerTable::new(
            &ids,
            &BreakerConfig {
                failure_threshold: 1,
                recovery_timeout_ms: 60_000,
            },
        )
        .shared();
        (ProviderSelector::new(registry, breakers), ids)
    }

    #[test]
    fn test_ranks_by_accuracy() {
        let (selector, ids) = setup(vec![
            ProviderProfile::new("weak", 0.4),
            ProviderProfile::new("strong", 0.9),
            ProviderProfile::new("mid", 0.6),
        ]);
        let ranked = selector
            .select_for_ensemble(&ids, MarketCondition::Trending, 2)
            .unwrap();
        let names: Vec<&str> = ranked.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(names, vec!["strong", "mid"]);
    }

    #[test]
    fn test_condition_accuracy_changes_ranking() {
        let (selector, ids) = setup(vec![
            ProviderProfile::new("a", 0.7),
            ProviderProfile::new("b", 0.6).with_condition_accuracy(MarketCondition::Volatile, 0.95),
        ]);
        let trending = selector
            .select_for_ensemble(&ids, MarketCondition::Trending, 1)
            .unwrap();
        let volatile = selector
            .select_for_ensemble(&ids, MarketCondition::Volatile, 1)
            .unwrap();
        assert_eq!(trending[0].id.as_str(), "a");
        assert_eq!(volatile[0].id.as_str(), "b");
    }

    #[test]
    fn test_ties_broken_by_lowest_load() {
        let (selector, ids) = setup(vec![
            ProviderProfile::new("busy", 0.7),
            ProviderProfile::new("idle", 0.7),
        ]);
        let _guard = selector.registry.begin_call(&ids[0]).unwrap();
        let ranked = selector
            .select_for_ensemble(&ids, MarketCondition::Ranging, 2)
            .unwrap();
        assert_eq!(ranked[0].id.as_str(), "idle");
    }

    #[test]
    fn test_open_circuits_excluded() {
        let (selector, ids) = setup(vec![
            ProviderProfile::new("a", 0.9),
            ProviderProfile::new("b", 0.5),
        ]);
        selector
            .breakers
            .get(&ids[0])
            .unwrap()
            .try_acquire()
            .unwrap()
            .fail();
        let ranked = selector
            .select_for_ensemble(&ids, MarketCondition::Trending, 5)
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id.as_str(), "b");
    }

    #[test]
    fn test_no_eligible_providers() {
        let (selector, ids) = setup(vec![ProviderProfile::new("a", 0.9)]);
        selector.registry.mark_unavailable(&ids[0], "down");
        assert!(matches!(
            selector.select_for_ensemble(&ids, MarketCondition::Trending, 3),
            Err(EnsembleError::NoProvidersAvailable)
        ));
        let (empty, _) = setup(vec![]);
        assert!(matches!(
            empty.select_single_best(&[], Priority::High, MarketCondition::Trending),
            Err(EnsembleError::NoProvidersAvailable)
        ));
    }

    #[test]
    fn test_priority_reweighting() {
        let (selector, ids) = setup(vec![
            ProviderProfile::new("fast_expensive", 0.7)
                .with_latency_ms(200.0)
                .with_cost_per_call(0.05),
            ProviderProfile::new("slow_cheap", 0.7)
                .with_latency_ms(4_000.0)
                .with_cost_per_call(0.001),
        ]);
        let high = selector
            .select_single_best(&ids, Priority::High, MarketCondition::Trending)
            .unwrap();
        let medium = selector
            .select_single_best(&ids, Priority::Medium, MarketCondition::Trending)
            .unwrap();
        let low = selector
            .select_single_best(&ids, Priority::Low, MarketCondition::Trending)
            .unwrap();
        assert_eq!(high.id.as_str(), "fast_expensive");
        assert_eq!(medium.id.as_str(), "slow_cheap");
        assert_eq!(low.id.as_str(), "slow_cheap");
    }

    #[test]
    fn test_required_capability_filters() {
        let (selector, ids) = setup(vec![
            ProviderProfile::new("general", 0.9).with_capabilities(vec!["chat".into()]),
            ProviderProfile::new("trader", 0.5),
        ]);
        let selector = selector.with_required_capability("trading");
        let ranked = selector
            .select_for_ensemble(&ids, MarketCondition::Trending, 5)
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].id.as_str(), "trader");
    }
}
