//! Spend ceilings and request shaping
//!
//! A request whose projected cost exceeds the per-request ceiling has its
//! response length scaled down in proportion. If the day's remaining budget
//! cannot cover it, the response length drops to the configured floor.
//! Requests are shaped, never rejected.

use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CostConfig;
use crate::events::BudgetScope;
use crate::types::ProviderId;

use super::pricing::PricingTable;

/// Token budget granted to a request after shaping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestShape {
    pub requested_tokens: u32,
    pub max_tokens: u32,
    /// Projected USD across all providers at `max_tokens`.
    pub projected_cost: f64,
    /// Ceiling that forced the reduction, if any.
    pub shaped_by: Option<BudgetScope>,
}

impl RequestShape {
    pub fn was_shaped(&self) -> bool {
        self.shaped_by.is_some()
    }
}

#[derive(Debug)]
struct DailySpend {
    day: NaiveDate,
    spent: f64,
}

/// Applies the cost ceilings from [`CostConfig`].
#[derive(Debug)]
pub struct CostOptimizer {
    config: CostConfig,
    pricing: PricingTable,
    daily: Mutex<DailySpend>,
}

impl CostOptimizer {
    pub fn new(config: CostConfig, pricing: PricingTable) -> Self {
        Self {
            config,
            pricing,
            daily: Mutex::new(DailySpend {
                day: Utc::now().date_naive(),
                spent: 0.0,
            }),
        }
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn config(&self) -> &CostConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, DailySpend> {
        self.daily.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remaining_on(&self, day: NaiveDate) -> f64 {
        let daily = self.lock();
        let spent = if daily.day == day { daily.spent } else { 0.0 };
        (self.config.ceiling_per_day - spent).max(0.0)
    }

    fn record_on(&self, cost: f64, day: NaiveDate) {
        let mut daily = self.lock();
        if daily.day != day {
            daily.day = day;
            daily.spent = 0.0;
        }
        daily.spent += cost.max(0.0);
    }

    /// Budget left for the current UTC day.
    pub fn remaining_today(&self) -> f64 {
        self.remaining_on(Utc::now().date_naive())
    }

    pub fn spent_today(&self) -> f64 {
        (self.config.ceiling_per_day - self.remaining_today()).max(0.0)
    }

    /// Charge actual spend against today's budget.
    pub fn record_spend(&self, cost: f64) {
        self.record_on(cost, Utc::now().date_naive());
    }

    fn projected(&self, providers: &[ProviderId], prompt_tokens: u32, max_tokens: u32) -> f64 {
        providers
            .iter()
            .map(|p| self.pricing.estimate(p, prompt_tokens, max_tokens))
            .sum()
    }

    /// Shape a request fanned out to `providers`. `requested` of `None`
    /// uses the configured default response length.
    pub fn shape(
        &self,
        providers: &[ProviderId],
        prompt_tokens: u32,
        requested: Option<u32>,
    ) -> RequestShape {
        self.shape_with_remaining(providers, prompt_tokens, requested, self.remaining_today())
    }

    fn shape_with_remaining(
        &self,
        providers: &[ProviderId],
        prompt_tokens: u32,
        requested: Option<u32>,
        remaining: f64,
    ) -> RequestShape {
        let requested = requested.unwrap_or(self.config.default_max_tokens);
        let floor = self.config.min_response_tokens.min(requested);
        let mut max_tokens = requested;
        let mut shaped_by = None;

        let projected = self.projected(providers, prompt_tokens, max_tokens);
        if projected > self.config.ceiling_per_request && projected > 0.0 {
            let scale = self.config.ceiling_per_request / projected;
            max_tokens = ((requested as f64 * scale).floor() as u32).max(floor);
            shaped_by = Some(BudgetScope::PerRequest);
        }

        let mut projected = self.projected(providers, prompt_tokens, max_tokens);
        if projected > remaining && max_tokens > floor {
            max_tokens = floor;
            shaped_by = Some(BudgetScope::Daily);
            projected = self.projected(providers, prompt_tokens, max_tokens);
        }

        if shaped_by.is_some() {
            debug!(
                requested,
                granted = max_tokens,
                projected_cost = projected,
                "Shaped request to fit budget"
            );
        }
        RequestShape {
            requested_tokens: requested,
            max_tokens,
            projected_cost: projected,
            shaped_by,
        }
    }
}
