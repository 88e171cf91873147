//! Per-provider request rate limiting over a sliding one-minute window.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::types::ProviderId;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Window {
    limit: u32,
    calls: Mutex<VecDeque<Instant>>,
}

/// Sliding-window limiter keyed by provider. Providers without a
/// configured limit are never throttled.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: HashMap<ProviderId, Window>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(providers: &[ProviderConfig]) -> Self {
        providers
            .iter()
            .filter_map(|p| p.rate_limit_per_minute.map(|l| (p.id.clone(), l)))
            .fold(Self::new(), |rl, (id, limit)| rl.with_limit(id, limit))
    }

    pub fn with_limit(mut self, provider: ProviderId, per_minute: u32) -> Self {
        self.windows.insert(
            provider,
            Window {
                limit: per_minute,
                calls: Mutex::new(VecDeque::new()),
            },
        );
        self
    }

    /// Record a call if the provider is under its limit, otherwise report
    /// how long until the oldest call leaves the window.
    pub fn try_acquire(&self, provider: &ProviderId) -> Result<(), ProviderError> {
        let Some(window) = self.windows.get(provider) else {
            return Ok(());
        };
        let now = Instant::now();
        let mut calls = window.calls.lock().unwrap_or_else(|e| e.into_inner());
        while calls
            .front()
            .is_some_and(|t| now.duration_since(*t) >= WINDOW)
        {
            calls.pop_front();
        }
        if calls.len() >= window.limit as usize {
            let retry_after = calls
                .front()
                .map(|t| WINDOW.saturating_sub(now.duration_since(*t)));
            return Err(ProviderError::RateLimited { retry_after });
        }
        calls.push_back(now);
        Ok(())
    }
}
