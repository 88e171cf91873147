//! Shared fixtures: a scripted provider and config helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use ensemble_router::{
    EnsembleConfig, EnsembleEvent, MarketSnapshot, MetricsRecorder, Provider, ProviderError,
    ProviderId, ProviderMetrics, ProviderRequest, ProviderResponse, ProviderResult, Trend, Usage,
};

/// What a scripted provider does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    Fail(ProviderError),
    /// Never answers within any realistic timeout.
    Hang,
}

pub fn buy(confidence: f64) -> Step {
    Step::Reply(format!(
        "```json\n{{\"action\": \"BUY\", \"confidence\": {confidence}, \"reasoning\": \"momentum\"}}\n```"
    ))
}

pub fn sell(confidence: f64) -> Step {
    Step::Reply(format!(
        "{{\"action\": \"SELL\", \"confidence\": {confidence}, \"reasoning\": \"overbought\"}}"
    ))
}

pub fn transport_error() -> Step {
    Step::Fail(ProviderError::Transport("connection reset".into()))
}

/// Provider that plays back a script, then repeats a default step.
pub struct ScriptedProvider {
    id: ProviderId,
    script: Mutex<VecDeque<Step>>,
    default: Mutex<Step>,
    healthy: AtomicBool,
    calls: AtomicUsize,
    requests: Mutex<Vec<ProviderRequest>>,
    metrics: MetricsRecorder,
}

impl ScriptedProvider {
    pub fn new(id: &str, default: Step) -> Arc<Self> {
        Arc::new(Self {
            id: ProviderId::new(id),
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(default),
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            metrics: MetricsRecorder::new(),
        })
    }

    pub fn then(self: &Arc<Self>, step: Step) -> Arc<Self> {
        self.script.lock().unwrap().push_back(step);
        Arc::clone(self)
    }

    pub fn set_default(&self, step: Step) {
        *self.default.lock().unwrap() = step;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ProviderRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    async fn submit(&self, request: ProviderRequest) -> ProviderResult<ProviderResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.lock().unwrap().clone());
        match step {
            Step::Reply(content) => {
                self.metrics.record_success(25, 0.001);
                Ok(ProviderResponse {
                    content,
                    model: format!("{}-model", self.id),
                    usage: Usage {
                        prompt_tokens: 100,
                        completion_tokens: 50,
                    },
                    cost: 0.001,
                    response_time_ms: 25,
                })
            }
            Step::Fail(error) => {
                self.metrics.record_failure();
                Err(error)
            }
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Err(ProviderError::Transport("hung call returned".into()))
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn metrics(&self) -> ProviderMetrics {
        self.metrics.snapshot()
    }
}

pub fn as_dyn(providers: &[Arc<ScriptedProvider>]) -> Vec<Arc<dyn Provider>> {
    providers
        .iter()
        .map(|p| Arc::clone(p) as Arc<dyn Provider>)
        .collect()
}

/// Route router logs to the test harness; `RUST_LOG` overrides the level.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ensemble_router=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Config with cache and batching off so every decision dispatches.
pub fn config(min_providers: usize, max_providers: usize) -> EnsembleConfig {
    let mut config = EnsembleConfig::default();
    config.ensemble.min_providers = min_providers;
    config.ensemble.max_providers = max_providers;
    config.ensemble.per_call_timeout_ms = 500;
    config.ensemble.default_timeout_ms = 5_000;
    config.cache.enabled = false;
    config.batch.enabled = false;
    config
}

pub fn snapshot() -> MarketSnapshot {
    MarketSnapshot {
        price: 42_000.0,
        volume: 1_500.0,
        volatility: 0.012,
        trend: Trend::Bullish,
        support: Some(41_200.0),
        resistance: Some(43_100.0),
    }
}

/// Everything published so far.
pub fn drain(rx: &mut broadcast::Receiver<EnsembleEvent>) -> Vec<EnsembleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn count(events: &[EnsembleEvent], event_type: &str) -> usize {
    events.iter().filter(|e| e.event_type() == event_type).count()
}
