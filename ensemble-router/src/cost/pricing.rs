//! Provider pricing with tiered monthly volume discounts

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{Datelike, Utc};

use crate::config::{PricingConfig, ProviderConfig};
use crate::provider::Usage;
use crate::types::ProviderId;

/// Rough characters-per-token ratio for English prompt text.
pub const CHARS_PER_TOKEN: usize = 4;

/// Heuristic token count for `text`.
pub fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count().div_ceil(CHARS_PER_TOKEN)).unwrap_or(u32::MAX)
}

type Month = (i32, u32);

fn current_month() -> Month {
    let now = Utc::now();
    (now.year(), now.month())
}

#[derive(Debug, Default)]
struct MonthlyUsage {
    month: Option<Month>,
    tokens: HashMap<ProviderId, u64>,
}

/// Per-provider price list plus the token volume used this calendar month.
#[derive(Debug, Default)]
pub struct PricingTable {
    prices: HashMap<ProviderId, PricingConfig>,
    usage: Mutex<MonthlyUsage>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(providers: &[ProviderConfig]) -> Self {
        providers
            .iter()
            .fold(Self::new(), |t, p| t.with_pricing(p.id.clone(), p.pricing.clone()))
    }

    pub fn with_pricing(mut self, provider: ProviderId, pricing: PricingConfig) -> Self {
        self.prices.insert(provider, pricing);
        self
    }

    fn lock(&self) -> MutexGuard<'_, MonthlyUsage> {
        self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Tokens billed to `provider` so far in `month`.
    fn tokens_in(&self, provider: &ProviderId, month: Month) -> u64 {
        let usage = self.lock();
        if usage.month == Some(month) {
            usage.tokens.get(provider).copied().unwrap_or(0)
        } else {
            0
        }
    }

    fn record_in(&self, provider: &ProviderId, tokens: u64, month: Month) {
        let mut usage = self.lock();
        if usage.month != Some(month) {
            usage.month = Some(month);
            usage.tokens.clear();
        }
        *usage.tokens.entry(provider.clone()).or_insert(0) += tokens;
    }

    fn discount_in(&self, provider: &ProviderId, month: Month) -> f64 {
        let Some(pricing) = self.prices.get(provider) else {
            return 0.0;
        };
        let volume = self.tokens_in(provider, month);
        pricing
            .tiers
            .iter()
            .filter(|t| volume >= t.min_monthly_tokens)
            .max_by_key(|t| t.min_monthly_tokens)
            .map(|t| t.discount.clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }

    pub fn monthly_tokens(&self, provider: &ProviderId) -> u64 {
        self.tokens_in(provider, current_month())
    }

    /// Fraction off list price from the highest tier reached this month.
    pub fn discount(&self, provider: &ProviderId) -> f64 {
        self.discount_in(provider, current_month())
    }

    /// Estimated USD for one call. Unknown providers cost nothing.
    pub fn estimate(&self, provider: &ProviderId, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        let Some(pricing) = self.prices.get(provider) else {
            return 0.0;
        };
        let list = pricing.input_per_1k * prompt_tokens as f64 / 1_000.0
            + pricing.output_per_1k * completion_tokens as f64 / 1_000.0;
        list * (1.0 - self.discount(provider))
    }

    /// Add a completed call's tokens to the monthly volume.
    pub fn record_usage(&self, provider: &ProviderId, usage: &Usage) {
        self.record_in(provider, usage.total(), current_month());
    }
}
