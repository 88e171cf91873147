//! Ensemble service - entry point for decision requests
//!
//! Wires the cache, cost optimizer, selector, dispatcher, aggregator, and
//! feedback tracker into one explicitly constructed service. Build it with
//! [`EnsembleService::builder`] from inside a Tokio runtime; the feedback
//! tracker and the low-priority batch loop run as background tasks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EnsembleConfig;
use crate::cost::{
    estimate_tokens, Batcher, CacheMode, CacheStats, CostOptimizer, DecisionCache,
    MarketFingerprint, PricingTable, RequestShape,
};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::ensemble::{EnsembleDecision, WeightedVoteAggregator};
use crate::error::{EnsembleError, EnsembleResult, ProviderError};
use crate::events::{EnsembleEvent, EventBus, SharedEventBus};
use crate::feedback::{FeedbackSender, FeedbackTracker, Outcome};
use crate::provider::{
    PromptComposer, Provider, ProviderMetrics, ProviderRequest, ProviderResponse, SnapshotPrompt,
    Usage,
};
use crate::registry::{ProviderProfile, ProviderRegistry, SharedProviderRegistry};
use crate::router::{
    CircuitBreakerTable, CircuitSnapshot, FallbackLadder, ProviderSelector, RateLimiter,
    SharedBreakerTable,
};
use crate::signal::NormalizedSignal;
use crate::types::{Action, MarketCondition, MarketSnapshot, Priority, ProviderId};

/// Per-request knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionOptions {
    pub use_ensemble: bool,
    pub use_cache: bool,
    pub priority: Priority,
    /// Overall cycle deadline; the configured default when absent.
    pub timeout_ms: Option<u64>,
}

impl Default for DecisionOptions {
    fn default() -> Self {
        Self {
            use_ensemble: true,
            use_cache: true,
            priority: Priority::Medium,
            timeout_ms: None,
        }
    }
}

/// A request for a trading decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub symbol: String,
    pub snapshot: MarketSnapshot,
    #[serde(default)]
    pub options: DecisionOptions,
}

impl DecisionRequest {
    pub fn new(symbol: impl Into<String>, snapshot: MarketSnapshot) -> Self {
        Self {
            symbol: symbol.into(),
            snapshot,
            options: DecisionOptions::default(),
        }
    }

    pub fn single(mut self) -> Self {
        self.options.use_ensemble = false;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.options.use_cache = false;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.options.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.options.timeout_ms = Some(timeout_ms);
        self
    }

    fn cache_mode(&self) -> CacheMode {
        if self.options.use_ensemble {
            CacheMode::Ensemble
        } else {
            CacheMode::Single
        }
    }

    fn fingerprint(&self) -> MarketFingerprint {
        MarketFingerprint::new(&self.symbol, &self.snapshot, self.cache_mode())
    }
}

/// Result of the single-provider path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleResponse {
    pub id: Uuid,
    pub symbol: String,
    pub provider: ProviderId,
    pub model: String,
    pub condition: MarketCondition,
    pub signal: NormalizedSignal,
    pub content: String,
    pub usage: Usage,
    pub cost: f64,
    pub response_time_ms: u64,
    /// Providers tried and failed before `provider` answered.
    pub failed_attempts: Vec<ProviderId>,
    pub created_at: DateTime<Utc>,
}

/// What the caller gets back, tagged by shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutedDecision {
    Single(SingleResponse),
    Ensemble(EnsembleDecision),
}

impl RoutedDecision {
    pub fn id(&self) -> Uuid {
        match self {
            RoutedDecision::Single(s) => s.id,
            RoutedDecision::Ensemble(d) => d.id,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            RoutedDecision::Single(s) => s.signal.signal().action,
            RoutedDecision::Ensemble(d) => d.action,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            RoutedDecision::Single(s) => s.signal.signal().confidence,
            RoutedDecision::Ensemble(d) => d.confidence,
        }
    }

    pub fn cost(&self) -> f64 {
        match self {
            RoutedDecision::Single(s) => s.cost,
            RoutedDecision::Ensemble(d) => d.total_cost,
        }
    }

    /// Providers whose signals fed this result.
    pub fn providers(&self) -> Vec<ProviderId> {
        match self {
            RoutedDecision::Single(s) => vec![s.provider.clone()],
            RoutedDecision::Ensemble(d) => d
                .signals
                .iter()
                .map(|s| s.signal.provider().clone())
                .collect(),
        }
    }

    pub fn as_ensemble(&self) -> Option<&EnsembleDecision> {
        match self {
            RoutedDecision::Ensemble(d) => Some(d),
            RoutedDecision::Single(_) => None,
        }
    }

    pub fn as_single(&self) -> Option<&SingleResponse> {
        match self {
            RoutedDecision::Single(s) => Some(s),
            RoutedDecision::Ensemble(_) => None,
        }
    }
}

/// Result of probing one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub provider: ProviderId,
    pub healthy: bool,
}

struct BatchItem {
    request: DecisionRequest,
    deadline: Instant,
    cancel: CancellationToken,
}

/// Everything a decision cycle needs; shared with the batch loop.
struct RouterCore {
    config: EnsembleConfig,
    providers: HashMap<ProviderId, Arc<dyn Provider>>,
    registry: SharedProviderRegistry,
    breakers: SharedBreakerTable,
    selector: ProviderSelector,
    dispatcher: Dispatcher,
    aggregator: WeightedVoteAggregator,
    cache: Option<DecisionCache<RoutedDecision>>,
    cost: CostOptimizer,
    composer: Arc<dyn PromptComposer>,
    bus: SharedEventBus,
}

/// Builder for [`EnsembleService`].
pub struct EnsembleServiceBuilder {
    config: EnsembleConfig,
    providers: Vec<Arc<dyn Provider>>,
    profiles: Vec<ProviderProfile>,
    bus: Option<SharedEventBus>,
    composer: Option<Arc<dyn PromptComposer>>,
}

impl EnsembleServiceBuilder {
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn providers(mut self, providers: impl IntoIterator<Item = Arc<dyn Provider>>) -> Self {
        self.providers.extend(providers);
        self
    }

    /// Seed a provider's profile instead of deriving it from config.
    pub fn profile(mut self, profile: ProviderProfile) -> Self {
        self.profiles.push(profile);
        self
    }

    pub fn event_bus(mut self, bus: SharedEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn composer(mut self, composer: Arc<dyn PromptComposer>) -> Self {
        self.composer = Some(composer);
        self
    }

    /// Validate config and start background tasks.
    ///
    /// Providers disabled in config are left out. Must be called inside a
    /// Tokio runtime.
    pub fn build(self) -> EnsembleResult<EnsembleService> {
        let config = self.config;
        config.validate()?;

        let provider_configs: HashMap<&ProviderId, _> =
            config.providers.iter().map(|p| (&p.id, p)).collect();
        let seeded: HashMap<ProviderId, ProviderProfile> = self
            .profiles
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let mut providers = HashMap::new();
        let mut registry = ProviderRegistry::new();
        for provider in self.providers {
            let id = provider.id();
            let cfg = provider_configs.get(&id).copied();
            if cfg.is_some_and(|c| !c.enabled) {
                info!(provider = %id, "Provider disabled in config, skipping");
                continue;
            }
            let profile = match (seeded.get(&id), cfg) {
                (Some(profile), _) => profile.clone(),
                (None, Some(cfg)) => ProviderProfile::from_config(cfg),
                (None, None) => ProviderProfile::new(id.clone(), 0.5),
            };
            registry = registry.with_profile(profile);
            providers.insert(id, provider);
        }
        let registry = registry.shared();
        let breakers = CircuitBreakerTable::new(registry.ids(), &config.breaker).shared();
        let bus = self.bus.unwrap_or_else(|| EventBus::new().shared());

        let (feedback, _tracker) = FeedbackTracker::new(registry.clone(), config.feedback.clone())
            .with_event_bus(bus.clone())
            .spawn();

        let dispatcher = Dispatcher::new(
            registry.clone(),
            breakers.clone(),
            Arc::new(RateLimiter::from_config(&config.providers)),
            config.ensemble.per_call_timeout(),
        )
        .with_event_bus(bus.clone())
        .with_feedback(feedback.clone());

        let core = Arc::new(RouterCore {
            selector: ProviderSelector::new(registry.clone(), breakers.clone()),
            aggregator: WeightedVoteAggregator::from_config(&config),
            cache: config
                .cache
                .enabled
                .then(|| DecisionCache::from_config(&config.cache)),
            cost: CostOptimizer::new(
                config.cost.clone(),
                PricingTable::from_config(&config.providers),
            ),
            composer: self.composer.unwrap_or_else(|| Arc::new(SnapshotPrompt)),
            providers,
            registry,
            breakers,
            dispatcher,
            bus: bus.clone(),
            config,
        });

        let batcher = core.config.batch.enabled.then(|| {
            let batch_core = Arc::clone(&core);
            Batcher::spawn(&core.config.batch, Some(bus), move |items: Vec<BatchItem>| {
                let core = Arc::clone(&batch_core);
                async move { core.run_batch(items).await }
            })
        });

        info!(
            providers = core.registry.len(),
            cache = core.cache.is_some(),
            batching = batcher.is_some(),
            "Ensemble service ready"
        );
        Ok(EnsembleService {
            core,
            batcher,
            feedback,
        })
    }
}

/// Routes decision requests across the configured providers.
pub struct EnsembleService {
    core: Arc<RouterCore>,
    batcher: Option<Batcher<BatchItem, EnsembleResult<RoutedDecision>>>,
    feedback: FeedbackSender,
}

impl EnsembleService {
    pub fn builder(config: EnsembleConfig) -> EnsembleServiceBuilder {
        EnsembleServiceBuilder {
            config,
            providers: Vec::new(),
            profiles: Vec::new(),
            bus: None,
            composer: None,
        }
    }

    // =========================================================================
    // Decisions
    // =========================================================================

    /// Produce a decision for `request`.
    pub async fn decide(&self, request: DecisionRequest) -> EnsembleResult<RoutedDecision> {
        self.decide_with_cancel(request, CancellationToken::new()).await
    }

    /// Like [`decide`](Self::decide), but `cancel` aborts every in-flight
    /// provider call of the cycle.
    pub async fn decide_with_cancel(
        &self,
        request: DecisionRequest,
        cancel: CancellationToken,
    ) -> EnsembleResult<RoutedDecision> {
        let timeout = request
            .options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.core.config.ensemble.default_timeout());
        let deadline = Instant::now() + timeout;

        if let Some(hit) = self.core.cached(&request) {
            return Ok(hit);
        }

        match (&self.batcher, request.options.priority) {
            (Some(batcher), Priority::Low) => {
                debug!(symbol = %request.symbol, "Deferring low-priority request to batch");
                batcher
                    .submit(BatchItem {
                        request,
                        deadline,
                        cancel,
                    })
                    .await?
            }
            _ => self.core.run_cycle(&request, deadline, &cancel).await,
        }
    }

    // =========================================================================
    // Feedback
    // =========================================================================

    /// Handle for reporting trade outcomes.
    pub fn feedback(&self) -> FeedbackSender {
        self.feedback.clone()
    }

    /// Credit a realized outcome to every provider that backed the decided
    /// action. Dissenting and unparseable signals are not scored.
    pub fn record_decision_outcome(&self, decision: &RoutedDecision, outcome: Outcome) -> usize {
        let (condition, backers): (MarketCondition, Vec<ProviderId>) = match decision {
            RoutedDecision::Ensemble(d) => (
                d.condition,
                d.signals
                    .iter()
                    .filter(|s| !s.signal.is_fallback() && s.signal.signal().action == d.action)
                    .map(|s| s.signal.provider().clone())
                    .collect(),
            ),
            RoutedDecision::Single(s) if !s.signal.is_fallback() => {
                (s.condition, vec![s.provider.clone()])
            }
            RoutedDecision::Single(_) => return 0,
        };
        backers
            .into_iter()
            .filter(|p| self.feedback.record_outcome(p.clone(), condition, outcome))
            .count()
    }

    // =========================================================================
    // Health & Introspection
    // =========================================================================

    /// Probe every provider concurrently. Unhealthy providers are excluded
    /// from selection until a later sweep passes.
    pub async fn run_health_checks(&self) -> Vec<HealthReport> {
        let probe_timeout = self.core.config.ensemble.per_call_timeout();
        let ids = self.core.registry.ids().to_vec();
        let probes = ids.iter().filter_map(|id| {
            let provider = self.core.providers.get(id)?.clone();
            Some(async move {
                let healthy = timeout(probe_timeout, provider.health_check())
                    .await
                    .unwrap_or(false);
                (id.clone(), healthy)
            })
        });
        let results = join_all(probes).await;

        results
            .into_iter()
            .map(|(provider, healthy)| {
                if healthy {
                    self.core.registry.mark_available(&provider);
                } else {
                    warn!(provider = %provider, "Health check failed");
                    self.core
                        .registry
                        .mark_unavailable(&provider, "health check failed");
                }
                HealthReport { provider, healthy }
            })
            .collect()
    }

    /// Each adapter's own counters.
    pub fn provider_metrics(&self) -> BTreeMap<ProviderId, ProviderMetrics> {
        self.core
            .providers
            .iter()
            .map(|(id, p)| (id.clone(), p.metrics()))
            .collect()
    }

    pub fn profiles(&self) -> Vec<ProviderProfile> {
        self.core.registry.profiles()
    }

    pub fn circuit_snapshot(&self) -> Vec<CircuitSnapshot> {
        self.core.breakers.snapshot()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.core.cache.as_ref().map(|c| c.stats())
    }

    pub fn spent_today(&self) -> f64 {
        self.core.cost.spent_today()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnsembleEvent> {
        self.core.bus.subscribe()
    }

    pub fn event_bus(&self) -> SharedEventBus {
        self.core.bus.clone()
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.core.config
    }
}

impl RouterCore {
    fn cached(&self, request: &DecisionRequest) -> Option<RoutedDecision> {
        if !request.options.use_cache {
            return None;
        }
        let cache = self.cache.as_ref()?;
        let key = request.fingerprint();
        let hit = cache.get(&key)?;
        debug!(symbol = %request.symbol, hits = hit.hits, "Cache hit");
        self.bus.publish(EnsembleEvent::CacheHit {
            symbol: request.symbol.clone(),
            key: key.key(),
            hits: hit.hits,
            timestamp: Utc::now(),
        });
        Some(hit.value)
    }

    /// Answer one flushed batch.
    ///
    /// Cacheable requests with the same fingerprint share one cycle, and the
    /// cache is consulted again since an earlier batch may have filled it.
    /// Results come back in item order.
    async fn run_batch(&self, items: Vec<BatchItem>) -> Vec<EnsembleResult<RoutedDecision>> {
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut by_key: HashMap<MarketFingerprint, usize> = HashMap::new();
        for (i, item) in items.iter().enumerate() {
            if !item.request.options.use_cache {
                groups.push(vec![i]);
                continue;
            }
            let next = groups.len();
            let g = *by_key.entry(item.request.fingerprint()).or_insert(next);
            if g == next {
                groups.push(vec![i]);
            } else {
                groups[g].push(i);
            }
        }
        if groups.len() < items.len() {
            debug!(
                items = items.len(),
                cycles = groups.len(),
                "Coalesced identical batched requests"
            );
        }

        let settled = join_all(groups.iter().map(|members| self.run_group(&items, members))).await;

        let mut results: Vec<Option<EnsembleResult<RoutedDecision>>> =
            items.iter().map(|_| None).collect();
        for (members, result) in groups.iter().zip(settled) {
            for &i in &members[1..] {
                results[i] = Some(match &result {
                    Ok(decision) => Ok(decision.clone()),
                    Err(e) => Err(e.duplicate()),
                });
            }
            results[members[0]] = Some(result);
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(EnsembleError::BatchClosed)))
            .collect()
    }

    /// Run one cycle on behalf of every request in `members`.
    ///
    /// The cycle honours the tightest member deadline and is cancelled only
    /// once every member has cancelled.
    async fn run_group(
        &self,
        items: &[BatchItem],
        members: &[usize],
    ) -> EnsembleResult<RoutedDecision> {
        let leader = &items[members[0]];
        if let Some(hit) = self.cached(&leader.request) {
            return Ok(hit);
        }
        if members.len() == 1 {
            return self
                .run_cycle(&leader.request, leader.deadline, &leader.cancel)
                .await;
        }

        let deadline = members
            .iter()
            .map(|&i| items[i].deadline)
            .min()
            .unwrap_or(leader.deadline);
        let group_cancel = CancellationToken::new();
        let all_cancelled = join_all(members.iter().map(|&i| items[i].cancel.cancelled()));
        let cycle = self.run_cycle(&leader.request, deadline, &group_cancel);
        tokio::pin!(cycle);
        tokio::select! {
            result = &mut cycle => result,
            _ = all_cancelled => {
                group_cancel.cancel();
                cycle.await
            }
        }
    }

    async fn run_cycle(
        &self,
        request: &DecisionRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> EnsembleResult<RoutedDecision> {
        let condition = MarketCondition::classify(&request.snapshot);
        let decision = if request.options.use_ensemble {
            self.ensemble_cycle(request, condition, deadline, cancel).await?
        } else {
            self.single_cycle(request, condition, deadline, cancel).await?
        };

        if request.options.use_cache {
            if let Some(cache) = &self.cache {
                cache.insert(request.fingerprint(), decision.clone());
            }
        }

        info!(
            symbol = %request.symbol,
            action = %decision.action(),
            confidence = decision.confidence(),
            cost = decision.cost(),
            "Decision made"
        );
        self.bus.publish(EnsembleEvent::DecisionMade {
            decision_id: decision.id(),
            symbol: request.symbol.clone(),
            action: decision.action(),
            confidence: decision.confidence(),
            consensus: decision.as_ensemble().map(|d| d.consensus).unwrap_or(1.0),
            providers: decision.providers(),
            ensemble: decision.as_ensemble().is_some(),
            cost: decision.cost(),
            timestamp: Utc::now(),
        });
        Ok(decision)
    }

    fn provider_request(
        &self,
        request: &DecisionRequest,
        prompt: String,
        shape: &RequestShape,
    ) -> ProviderRequest {
        let metadata = HashMap::from([
            ("symbol".to_string(), request.symbol.clone()),
            ("priority".to_string(), request.options.priority.to_string()),
        ]);
        ProviderRequest {
            prompt,
            temperature: self.config.ensemble.temperature,
            max_tokens: shape.max_tokens,
            metadata,
        }
    }

    fn shape(&self, symbol: &str, providers: &[ProviderId], prompt: &str) -> RequestShape {
        let shape = self.cost.shape(providers, estimate_tokens(prompt), None);
        if let Some(scope) = shape.shaped_by {
            self.bus.publish(EnsembleEvent::BudgetShaped {
                symbol: symbol.to_string(),
                scope,
                projected_cost: shape.projected_cost,
                requested_tokens: shape.requested_tokens,
                granted_tokens: shape.max_tokens,
                timestamp: Utc::now(),
            });
        }
        shape
    }

    fn record_spend(&self, cost: f64, usage: &[(ProviderId, Usage)]) {
        self.cost.record_spend(cost);
        for (provider, usage) in usage {
            self.cost.pricing().record_usage(provider, usage);
        }
    }

    async fn ensemble_cycle(
        &self,
        request: &DecisionRequest,
        condition: MarketCondition,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> EnsembleResult<RoutedDecision> {
        let min = self.config.ensemble.min_providers;
        let ranked = self.selector.select_for_ensemble(
            self.registry.ids(),
            condition,
            self.config.ensemble.max_providers,
        )?;
        if ranked.len() < min {
            warn!(
                symbol = %request.symbol,
                available = ranked.len(),
                required = min,
                "Not enough eligible providers"
            );
            return Err(EnsembleError::InsufficientProviders {
                available: ranked.len(),
                required: min,
            });
        }

        let ids: Vec<ProviderId> = ranked.into_iter().map(|r| r.id).collect();
        let providers: Vec<Arc<dyn Provider>> = ids
            .iter()
            .filter_map(|id| self.providers.get(id).cloned())
            .collect();
        let prompt = self.composer.compose(&request.symbol, &request.snapshot);
        let shape = self.shape(&request.symbol, &ids, &prompt);
        let provider_request = self.provider_request(request, prompt, &shape);

        let outcome: DispatchOutcome = self
            .dispatcher
            .fan_out(
                &providers,
                &provider_request,
                request.snapshot.price,
                deadline,
                cancel,
            )
            .await;
        self.record_spend(outcome.total_cost, &outcome.usage);
        self.dispatcher
            .enforce_quorum(&request.symbol, &outcome, min, cancel)?;
        if cancel.is_cancelled() {
            return Err(EnsembleError::Cancelled);
        }

        let profiles: HashMap<ProviderId, ProviderProfile> = outcome
            .signals
            .iter()
            .filter_map(|s| self.registry.profile(s.provider()))
            .map(|p| (p.id.clone(), p))
            .collect();
        let decision = self.aggregator.aggregate(
            &request.symbol,
            outcome.signals,
            &profiles,
            &request.snapshot,
            outcome.total_cost,
        )?;
        Ok(RoutedDecision::Ensemble(decision))
    }

    async fn single_cycle(
        &self,
        request: &DecisionRequest,
        condition: MarketCondition,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> EnsembleResult<RoutedDecision> {
        let ranked = self.selector.rank_single(
            self.registry.ids(),
            request.options.priority,
            condition,
        )?;
        let ladder = FallbackLadder::new(ranked.into_iter().map(|r| r.id).collect());
        let prompt = self.composer.compose(&request.symbol, &request.snapshot);
        let mut failed = Vec::new();

        for id in ladder
            .available(&self.breakers)
            .into_iter()
            .take(self.config.ensemble.max_fallback_attempts.max(1))
        {
            let Some(provider) = self.providers.get(&id) else {
                continue;
            };
            let shape = self.shape(&request.symbol, std::slice::from_ref(&id), &prompt);
            let provider_request = self.provider_request(request, prompt.clone(), &shape);
            match self
                .dispatcher
                .call(provider, provider_request, deadline, cancel)
                .await
            {
                Ok(response) => {
                    self.record_spend(response.cost, &[(id.clone(), response.usage)]);
                    return Ok(RoutedDecision::Single(self.single_response(
                        request, id, response, failed,
                    )));
                }
                Err(_) if cancel.is_cancelled() => return Err(EnsembleError::Cancelled),
                Err(ProviderError::DeadlineExceeded) => {
                    warn!(
                        symbol = %request.symbol,
                        provider = %id,
                        "Deadline reached on single path"
                    );
                    return Err(EnsembleError::DeadlineExceeded { got: 0, need: 1 });
                }
                Err(e) => {
                    debug!(provider = %id, error = %e, "Falling back to next provider");
                    failed.push(id);
                }
            }
        }

        warn!(symbol = %request.symbol, attempted = failed.len(), "Every fallback failed");
        self.bus.publish(EnsembleEvent::QuorumFailed {
            symbol: request.symbol.clone(),
            got: 0,
            need: 1,
            attempted: failed.clone(),
            timestamp: Utc::now(),
        });
        Err(EnsembleError::InsufficientSignals {
            got: 0,
            need: 1,
            attempted: failed,
        })
    }

    fn single_response(
        &self,
        request: &DecisionRequest,
        provider: ProviderId,
        response: ProviderResponse,
        failed_attempts: Vec<ProviderId>,
    ) -> SingleResponse {
        let signal = self
            .dispatcher
            .normalize(&provider, &response, request.snapshot.price);
        SingleResponse {
            id: Uuid::new_v4(),
            symbol: request.symbol.clone(),
            provider,
            model: response.model,
            condition: MarketCondition::classify(&request.snapshot),
            signal,
            content: response.content,
            usage: response.usage,
            cost: response.cost,
            response_time_ms: response.response_time_ms,
            failed_attempts,
            created_at: Utc::now(),
        }
    }
}
