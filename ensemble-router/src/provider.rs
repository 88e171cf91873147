//! Provider capability contract
//!
//! Adapters for concrete inference backends live outside this crate and
//! implement [`Provider`]. The router only ever talks to this trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderResult;
use crate::types::{MarketSnapshot, ProviderId};

/// A single completion request sent to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u64 {
        u64::from(self.prompt_tokens) + u64::from(self.completion_tokens)
    }
}

/// Raw completion returned by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    pub model: String,
    pub usage: Usage,
    /// USD charged for this call.
    pub cost: f64,
    pub response_time_ms: u64,
}

/// Lifetime counters an adapter reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: f64,
    pub total_cost: f64,
}

/// Contract every inference backend adapter implements.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier, matching the provider's config entry.
    fn id(&self) -> ProviderId;

    /// Submit a completion request.
    async fn submit(&self, request: ProviderRequest) -> ProviderResult<ProviderResponse>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> bool;

    /// Snapshot of the adapter's own counters.
    fn metrics(&self) -> ProviderMetrics;
}

/// Thread-safe counters adapters can embed to implement [`Provider::metrics`].
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    totals: Mutex<(f64, f64)>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, response_time_ms: u64, cost: f64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        totals.0 += response_time_ms as f64;
        totals.1 += cost;
    }

    pub fn record_failure(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProviderMetrics {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let (time_sum, cost_sum) = *self.totals.lock().unwrap_or_else(|e| e.into_inner());
        ProviderMetrics {
            total_requests: self.total.load(Ordering::Relaxed),
            successful_requests: succeeded,
            failed_requests: self.failed.load(Ordering::Relaxed),
            average_response_time_ms: if succeeded == 0 {
                0.0
            } else {
                time_sum / succeeded as f64
            },
            total_cost: cost_sum,
        }
    }
}

/// Builds the prompt text sent to providers for a snapshot.
///
/// Prompt engineering lives with the caller; the router only needs some
/// composer to produce text.
pub trait PromptComposer: Send + Sync {
    fn compose(&self, symbol: &str, snapshot: &MarketSnapshot) -> String;
}

/// Minimal composer that renders the snapshot and asks for a JSON block.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotPrompt;

impl PromptComposer for SnapshotPrompt {
    fn compose(&self, symbol: &str, snapshot: &MarketSnapshot) -> String {
        let mut prompt = format!(
            "Market snapshot for {symbol}:\n- price: {}\n- volume: {}\n- volatility: {:.4}\n- trend: {}\n",
            snapshot.price, snapshot.volume, snapshot.volatility, snapshot.trend
        );
        if let Some(support) = snapshot.support {
            prompt.push_str(&format!("- support: {support}\n"));
        }
        if let Some(resistance) = snapshot.resistance {
            prompt.push_str(&format!("- resistance: {resistance}\n"));
        }
        prompt.push_str(
            "\nRespond with a JSON block containing: action (BUY|SELL|HOLD), \
             confidence (0-1), reasoning, entry_price, stop_loss, take_profit, \
             position_size, risk_reward, volatility.",
        );
        prompt
    }
}
