//! Provider registry: performance profiles and live load
//!
//! Each provider's profile sits behind its own lock so dispatch reads and
//! feedback writes for unrelated providers never contend. The set of
//! providers is fixed when the registry is built.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::types::{MarketCondition, ProviderId};

/// Prompt size assumed when estimating a provider's per-call cost.
const NOMINAL_PROMPT_TOKENS: f64 = 500.0;
/// Completion size assumed when estimating a provider's per-call cost.
const NOMINAL_COMPLETION_TOKENS: f64 = 1_000.0;

/// Performance profile for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: ProviderId,
    pub capabilities: Vec<String>,
    /// Estimated USD per call.
    pub cost_per_call: f64,
    pub avg_latency_ms: f64,
    /// Success ratio over the recent call window.
    pub reliability: f64,
    /// Overall directional accuracy (0.0 - 1.0).
    pub accuracy: f64,
    pub condition_accuracy: BTreeMap<MarketCondition, f64>,
    /// Recency-weighted outcome score (0.0 - 1.0, neutral 0.5).
    pub recent_performance: f64,
    pub last_used: Option<DateTime<Utc>>,
    pub last_outcome_at: Option<DateTime<Utc>>,
    /// 1 is the most preferred tier.
    pub priority_tier: u8,
    /// False while a health sweep reports the provider down.
    pub available: bool,
    pub status_message: Option<String>,
    pub lifetime_successes: u64,
    pub lifetime_failures: u64,
    #[serde(skip)]
    recent_calls: VecDeque<bool>,
}

impl ProviderProfile {
    /// Fresh profile with neutral performance.
    pub fn new(id: impl Into<ProviderId>, base_accuracy: f64) -> Self {
        Self {
            id: id.into(),
            capabilities: vec!["trading".to_string()],
            cost_per_call: 0.0,
            avg_latency_ms: 0.0,
            reliability: 1.0,
            accuracy: base_accuracy.clamp(0.0, 1.0),
            condition_accuracy: BTreeMap::new(),
            recent_performance: 0.5,
            last_used: None,
            last_outcome_at: None,
            priority_tier: 2,
            available: true,
            status_message: None,
            lifetime_successes: 0,
            lifetime_failures: 0,
            recent_calls: VecDeque::new(),
        }
    }

    /// Profile seeded from a provider's config entry.
    pub fn from_config(config: &ProviderConfig) -> Self {
        let mut profile = Self::new(config.id.clone(), config.base_accuracy);
        profile.capabilities = config.capabilities.clone();
        profile.avg_latency_ms = config.expected_latency_ms as f64;
        profile.priority_tier = config.priority_tier;
        profile.available = config.enabled;
        profile.cost_per_call = config.pricing.input_per_1k * NOMINAL_PROMPT_TOKENS / 1_000.0
            + config.pricing.output_per_1k * NOMINAL_COMPLETION_TOKENS / 1_000.0;
        profile
    }

    pub fn with_cost_per_call(mut self, cost: f64) -> Self {
        self.cost_per_call = cost;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.avg_latency_ms = latency_ms;
        self
    }

    pub fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = reliability.clamp(0.0, 1.0);
        self
    }

    pub fn with_priority_tier(mut self, tier: u8) -> Self {
        self.priority_tier = tier;
        self
    }

    pub fn with_condition_accuracy(mut self, condition: MarketCondition, accuracy: f64) -> Self {
        self.condition_accuracy
            .insert(condition, accuracy.clamp(0.0, 1.0));
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Accuracy for a regime, falling back to the overall figure.
    pub fn accuracy_for(&self, condition: MarketCondition) -> f64 {
        self.condition_accuracy
            .get(&condition)
            .copied()
            .unwrap_or(self.accuracy)
    }

    /// Failure ratio over the recent call window.
    pub fn failure_ratio(&self) -> f64 {
        1.0 - self.reliability
    }

    /// Lifetime success ratio; 1.0 before any call.
    pub fn uptime(&self) -> f64 {
        let total = self.lifetime_successes + self.lifetime_failures;
        if total == 0 {
            1.0
        } else {
            self.lifetime_successes as f64 / total as f64
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Record a completed call into the reliability window.
    pub fn record_call(&mut self, success: bool, latency_ms: u64, window: usize) {
        let window = window.max(1);
        self.recent_calls.push_back(success);
        while self.recent_calls.len() > window {
            self.recent_calls.pop_front();
        }
        let ok = self.recent_calls.iter().filter(|s| **s).count();
        self.reliability = ok as f64 / self.recent_calls.len() as f64;

        if success {
            let n = self.lifetime_successes as f64;
            self.avg_latency_ms = if n == 0.0 {
                latency_ms as f64
            } else {
                (self.avg_latency_ms * n + latency_ms as f64) / (n + 1.0)
            };
            self.lifetime_successes += 1;
        } else {
            self.lifetime_failures += 1;
        }
        self.last_used = Some(Utc::now());
    }

    /// Calls currently held in the reliability window.
    pub fn window_len(&self) -> usize {
        self.recent_calls.len()
    }
}

/// A registered provider: its profile plus the in-flight call count.
#[derive(Debug)]
pub struct ProviderEntry {
    profile: RwLock<ProviderProfile>,
    load: AtomicU32,
}

impl ProviderEntry {
    fn new(profile: ProviderProfile) -> Self {
        Self {
            profile: RwLock::new(profile),
            load: AtomicU32::new(0),
        }
    }

    /// Clone of the current profile.
    pub fn profile(&self) -> ProviderProfile {
        self.profile
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Mutate the profile under its write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut ProviderProfile) -> R) -> R {
        let mut profile = self.profile.write().unwrap_or_else(|e| e.into_inner());
        f(&mut profile)
    }

    /// Current number of in-flight calls.
    pub fn load(&self) -> u32 {
        self.load.load(Ordering::Relaxed)
    }
}

/// Decrements the provider's load when dropped.
pub struct LoadGuard {
    entry: Arc<ProviderEntry>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.entry.load.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Shared reference to a ProviderRegistry
pub type SharedProviderRegistry = Arc<ProviderRegistry>;

/// Registry of provider profiles, in registration order.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    entries: HashMap<ProviderId, Arc<ProviderEntry>>,
    order: Vec<ProviderId>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from provider config entries.
    pub fn from_config(providers: &[ProviderConfig]) -> Self {
        providers
            .iter()
            .fold(Self::new(), |reg, p| reg.with_profile(ProviderProfile::from_config(p)))
    }

    /// Add (or replace) a profile.
    pub fn with_profile(mut self, profile: ProviderProfile) -> Self {
        let id = profile.id.clone();
        if !self.entries.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.entries.insert(id, Arc::new(ProviderEntry::new(profile)));
        self
    }

    pub fn shared(self) -> SharedProviderRegistry {
        Arc::new(self)
    }

    pub fn get(&self, id: &ProviderId) -> Option<&Arc<ProviderEntry>> {
        self.entries.get(id)
    }

    pub fn profile(&self, id: &ProviderId) -> Option<ProviderProfile> {
        self.entries.get(id).map(|e| e.profile())
    }

    /// Clones of all profiles in registration order.
    pub fn profiles(&self) -> Vec<ProviderProfile> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.profile())
            .collect()
    }

    pub fn ids(&self) -> &[ProviderId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Current in-flight count, 0 for unknown providers.
    pub fn load(&self, id: &ProviderId) -> u32 {
        self.entries.get(id).map(|e| e.load()).unwrap_or(0)
    }

    /// Mark a call as in flight until the guard drops.
    pub fn begin_call(&self, id: &ProviderId) -> Option<LoadGuard> {
        let entry = self.entries.get(id)?.clone();
        entry.load.fetch_add(1, Ordering::Relaxed);
        Some(LoadGuard { entry })
    }

    /// Apply a mutation to one provider's profile. Returns false if unknown.
    pub fn update(&self, id: &ProviderId, f: impl FnOnce(&mut ProviderProfile)) -> bool {
        match self.entries.get(id) {
            Some(entry) => {
                entry.update(f);
                true
            }
            None => false,
        }
    }

    pub fn mark_unavailable(&self, id: &ProviderId, reason: impl Into<String>) {
        let reason = reason.into();
        self.update(id, |p| {
            p.available = false;
            p.status_message = Some(reason);
        });
    }

    pub fn mark_available(&self, id: &ProviderId) {
        self.update(id, |p| {
            p.available = true;
            p.status_message = None;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PricingConfig;

    #[test]
    fn test_registry_preserves_registration_order() {
        let registry = ProviderRegistry::new()
            .with_profile(ProviderProfile::new("b", 0.6))
            .with_profile(ProviderProfile::new("a", 0.7))
            .with_profile(ProviderProfile::new("b", 0.9));
        let ids: Vec<&str> = registry.ids().iter().map(|i| i.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(registry.profile(&"b".into()).unwrap().accuracy, 0.9);
    }

    #[test]
    fn test_from_config_estimates_cost() {
        let mut config = ProviderConfig::new("openai");
        config.pricing = PricingConfig {
            input_per_1k: 0.01,
            output_per_1k: 0.03,
            tiers: vec![],
        };
        let profile = ProviderProfile::from_config(&config);
        assert!((profile.cost_per_call - (0.005 + 0.03)).abs() < 1e-9);
    }

    #[test]
    fn test_reliability_window_slides() {
        let mut p = ProviderProfile::new("p", 0.5);
        for _ in 0..3 {
            p.record_call(false, 0, 4);
        }
        p.record_call(true, 100, 4);
        assert_eq!(p.reliability, 0.25);

        for _ in 0..4 {
            p.record_call(true, 100, 4);
        }
        assert_eq!(p.reliability, 1.0);
        assert_eq!(p.window_len(), 4);
        assert_eq!(p.lifetime_failures, 3);
        assert!(p.uptime() < 1.0);
    }

    #[test]
    fn test_accuracy_falls_back_to_overall() {
        let p = ProviderProfile::new("p", 0.6)
            .with_condition_accuracy(MarketCondition::Volatile, 0.8);
        assert_eq!(p.accuracy_for(MarketCondition::Volatile), 0.8);
        assert_eq!(p.accuracy_for(MarketCondition::Ranging), 0.6);
    }

    #[test]
    fn test_load_guard_tracks_in_flight() {
        let registry = ProviderRegistry::new().with_profile(ProviderProfile::new("p", 0.5));
        let id = ProviderId::new("p");
        let g1 = registry.begin_call(&id).unwrap();
        let g2 = registry.begin_call(&id).unwrap();
        assert_eq!(registry.load(&id), 2);
        drop(g1);
        assert_eq!(registry.load(&id), 1);
        drop(g2);
        assert_eq!(registry.load(&id), 0);
    }

    #[test]
    fn test_mark_unavailable_round_trip() {
        let registry = ProviderRegistry::new().with_profile(ProviderProfile::new("p", 0.5));
        let id = ProviderId::new("p");
        registry.mark_unavailable(&id, "maintenance");
        let p = registry.profile(&id).unwrap();
        assert!(!p.available);
        assert_eq!(p.status_message.as_deref(), Some("maintenance"));
        registry.mark_available(&id);
        assert!(registry.profile(&id).unwrap().available);
    }
}
