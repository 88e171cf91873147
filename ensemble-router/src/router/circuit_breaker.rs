//! Circuit breaker and fallback ladder for provider routing.
//!
//! Each provider gets its own [`CircuitBreaker`]. Consecutive failures past
//! a threshold *open* the circuit and calls are short-circuited without a
//! network attempt. Once the recovery timeout elapses exactly one trial call
//! is let through (*half-open*); its outcome closes or re-opens the circuit.
//!
//! Callers obtain a [`BreakerPermit`] before each call and resolve it with
//! [`BreakerPermit::succeed`] or [`BreakerPermit::fail`]. A permit dropped
//! unresolved frees the trial slot without touching the failure count.
//!
//! The [`FallbackLadder`] walks an ordered list of providers, skipping any
//! whose circuit is currently open.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::error::ProviderError;
use crate::types::ProviderId;

/// Circuit breaker state for a single provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy, requests allowed.
    Closed,
    /// Tripped; requests blocked until the recovery timeout expires.
    Open,
    /// Recovery timeout expired; one trial request allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A state change caused by resolving a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    Closed,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_transition: Instant,
    trial_in_flight: bool,
}

/// Per-provider circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: ProviderId,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider: ProviderId, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            provider,
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_transition: Instant::now(),
                trial_in_flight: false,
            }),
        }
    }

    pub fn from_config(provider: ProviderId, config: &BreakerConfig) -> Self {
        Self::new(provider, config.failure_threshold, config.recovery_timeout())
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn recovery_elapsed(&self, inner: &BreakerInner) -> bool {
        inner
            .opened_at
            .map(|t| t.elapsed() >= self.recovery_timeout)
            .unwrap_or(true)
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    /// Current state. An open circuit whose recovery timeout has elapsed
    /// reports `HalfOpen` even before the trial call is issued.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.state {
            CircuitState::Open if self.recovery_elapsed(&inner) => CircuitState::HalfOpen,
            state => state,
        }
    }

    /// Whether a call would currently be admitted.
    pub fn is_available(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => self.recovery_elapsed(&inner) && !inner.trial_in_flight,
            CircuitState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Consecutive failures recorded since the last success.
    pub fn failure_count(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Time since the last state transition.
    pub fn since_transition(&self) -> Duration {
        self.lock().last_transition.elapsed()
    }

    /// Ask to make a call. Fails with `CircuitOpen` without side effects
    /// when the circuit is open or the half-open trial is already taken.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, ProviderError> {
        let mut inner = self.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open | CircuitState::HalfOpen => {
                if inner.trial_in_flight || !self.recovery_elapsed(&inner) {
                    return Err(ProviderError::CircuitOpen(self.provider.clone()));
                }
                if inner.state == CircuitState::Open {
                    inner.state = CircuitState::HalfOpen;
                    inner.last_transition = Instant::now();
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            resolved: false,
        })
    }

    fn on_success(&self, trial: bool) -> Option<Transition> {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen if trial => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.last_transition = Instant::now();
                Some(Transition::Closed)
            }
            // A straggler from before the circuit opened proves nothing.
            _ => None,
        }
    }

    fn on_failure(&self, trial: bool) -> Option<Transition> {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            CircuitState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                let now = Instant::now();
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.last_transition = now;
                Some(Transition::Opened)
            }
            CircuitState::HalfOpen if trial => {
                let now = Instant::now();
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.last_transition = now;
                Some(Transition::Opened)
            }
            _ => None,
        }
    }

    fn on_abandon(&self, trial: bool) {
        if trial {
            self.lock().trial_in_flight = false;
        }
    }
}

/// Admission ticket for one call through a breaker.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit {
    /// Whether this is the single half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) -> Option<Transition> {
        self.resolved = true;
        self.breaker.on_success(self.trial)
    }

    pub fn fail(mut self) -> Option<Transition> {
        self.resolved = true;
        self.breaker.on_failure(self.trial)
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_abandon(self.trial);
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub provider: ProviderId,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub since_transition_ms: u64,
}

/// Shared reference to a CircuitBreakerTable
pub type SharedBreakerTable = Arc<CircuitBreakerTable>;

/// One breaker per provider.
#[derive(Debug, Default)]
pub struct CircuitBreakerTable {
    breakers: HashMap<ProviderId, Arc<CircuitBreaker>>,
}

impl CircuitBreakerTable {
    pub fn new<'a>(
        providers: impl IntoIterator<Item = &'a ProviderId>,
        config: &BreakerConfig,
    ) -> Self {
        let breakers = providers
            .into_iter()
            .map(|id| {
                (
                    id.clone(),
                    Arc::new(CircuitBreaker::from_config(id.clone(), config)),
                )
            })
            .collect();
        Self { breakers }
    }

    pub fn shared(self) -> SharedBreakerTable {
        Arc::new(self)
    }

    pub fn get(&self, provider: &ProviderId) -> Option<&Arc<CircuitBreaker>> {
        self.breakers.get(provider)
    }

    /// State for a provider; unknown providers report `Closed`.
    pub fn state(&self, provider: &ProviderId) -> CircuitState {
        self.breakers
            .get(provider)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn is_available(&self, provider: &ProviderId) -> bool {
        self.breakers
            .get(provider)
            .map(|b| b.is_available())
            .unwrap_or(true)
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut out: Vec<CircuitSnapshot> = self
            .breakers
            .values()
            .map(|b| CircuitSnapshot {
                provider: b.provider().clone(),
                state: b.state(),
                consecutive_failures: b.failure_count(),
                since_transition_ms: b.since_transition().as_millis() as u64,
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }
}

/// Ordered fallback ladder of providers.
///
/// The first provider whose circuit is not open is returned.
#[derive(Debug, Clone)]
pub struct FallbackLadder {
    providers: Vec<ProviderId>,
}

impl FallbackLadder {
    /// Create a ladder from an ordered list of providers.
    pub fn new(providers: Vec<ProviderId>) -> Self {
        Self { providers }
    }

    /// First provider in the ladder whose circuit is not open.
    pub fn next_available(&self, breakers: &CircuitBreakerTable) -> Option<ProviderId> {
        self.providers
            .iter()
            .find(|p| breakers.is_available(p))
            .cloned()
    }

    /// Providers whose circuits are not open, in ladder order.
    pub fn available(&self, breakers: &CircuitBreakerTable) -> Vec<ProviderId> {
        self.providers
            .iter()
            .filter(|p| breakers.is_available(p))
            .cloned()
            .collect()
    }

    /// The ordered list of providers.
    pub fn providers(&self) -> &[ProviderId] {
        &self.providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_ms: u64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            ProviderId::new("p1"),
            threshold,
            Duration::from_millis(recovery_ms),
        ))
    }

    fn fail_n(cb: &Arc<CircuitBreaker>, n: u32) {
        for _ in 0..n {
            cb.try_acquire().unwrap().fail();
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = breaker(3, 1_000);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_available());
    }

    #[test]
    fn test_circuit_opens_after_threshold() {
        let cb = breaker(2, 60_000);
        assert_eq!(cb.try_acquire().unwrap().fail(), None);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.try_acquire().unwrap().fail(), Some(Transition::Opened));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_available());
        assert!(matches!(
            cb.try_acquire(),
            Err(ProviderError::CircuitOpen(_))
        ));
    }

    #[test]
    fn test_success_resets_counter_while_closed() {
        let cb = breaker(3, 60_000);
        fail_n(&cb, 2);
        assert_eq!(cb.failure_count(), 2);
        cb.try_acquire().unwrap().succeed();
        assert_eq!(cb.failure_count(), 0);
        fail_n(&cb, 2);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let cb = breaker(1, 500);
        fail_n(&cb, 1);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(501)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let trial = cb.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert!(cb.try_acquire().is_err());
        assert!(!cb.is_available());

        assert_eq!(trial.succeed(), Some(Transition::Closed));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_restarts_recovery_timer() {
        let cb = breaker(1, 500);
        fail_n(&cb, 1);
        tokio::time::advance(Duration::from_millis(600)).await;

        let trial = cb.try_acquire().unwrap();
        assert_eq!(trial.fail(), Some(Transition::Opened));
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(cb.try_acquire().is_err());
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_slot() {
        let cb = breaker(1, 100);
        fail_n(&cb, 1);
        tokio::time::advance(Duration::from_millis(150)).await;

        let trial = cb.try_acquire().unwrap();
        drop(trial);
        assert_eq!(cb.failure_count(), 1);
        assert!(cb.try_acquire().unwrap().is_trial());
    }

    #[test]
    fn test_late_success_does_not_close_open_circuit() {
        let cb = breaker(1, 60_000);
        let straggler = cb.try_acquire().unwrap();
        fail_n(&cb, 1);
        assert_eq!(straggler.succeed(), None);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_fallback_skips_open() {
        let ids: Vec<ProviderId> = ["a", "b", "c"].into_iter().map(ProviderId::new).collect();
        let config = BreakerConfig {
            failure_threshold: 1,
            recovery_timeout_ms: 60_000,
        };
        let table = CircuitBreakerTable::new(&ids, &config);
        table.get(&ids[0]).unwrap().try_acquire().unwrap().fail();

        let ladder = FallbackLadder::new(ids.clone());
        assert_eq!(ladder.next_available(&table), Some(ids[1].clone()));
        assert_eq!(ladder.available(&table), vec![ids[1].clone(), ids[2].clone()]);
    }

    #[test]
    fn test_fallback_all_open() {
        let ids: Vec<ProviderId> = ["a", "b"].into_iter().map(ProviderId::new).collect();
        let config = BreakerConfig {
            failure_threshold: 1,
            recovery_timeout_ms: 60_000,
        };
        let table = CircuitBreakerTable::new(&ids, &config);
        for id in &ids {
            table.get(id).unwrap().try_acquire().unwrap().fail();
        }
        let ladder = FallbackLadder::new(ids);
        assert_eq!(ladder.next_available(&table), None);
    }
}
