//! Fan-out / fan-in dispatcher
//!
//! Every selected provider is called concurrently. Each call is gated by the
//! provider's circuit breaker and rate limiter and raced against its own
//! timeout and the cycle's cancellation token. The dispatcher waits for all
//! calls to settle; one slow or broken provider never blocks the rest.
//!
//! Results are collected in selection order, so aggregation only ever sees
//! the set of outcomes, never their arrival order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EnsembleError, EnsembleResult, ProviderError, ProviderResult};
use crate::events::{EnsembleEvent, SharedEventBus};
use crate::feedback::{FeedbackEvent, FeedbackSender};
use crate::normalizer::SignalNormalizer;
use crate::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use crate::registry::SharedProviderRegistry;
use crate::router::{RateLimiter, SharedBreakerTable, Transition};
use crate::signal::NormalizedSignal;
use crate::types::ProviderId;

/// A provider call that did not produce a response.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFailure {
    pub provider: ProviderId,
    pub error: ProviderError,
}

/// Settled outcome of one fan-out.
#[derive(Debug, Clone, Default)]
pub struct DispatchOutcome {
    /// One signal per successful call, in selection order.
    pub signals: Vec<NormalizedSignal>,
    pub failures: Vec<CallFailure>,
    /// Every provider a call was issued to, in selection order.
    pub attempted: Vec<ProviderId>,
    pub usage: Vec<(ProviderId, Usage)>,
    pub total_cost: f64,
}

impl DispatchOutcome {
    pub fn succeeded(&self) -> usize {
        self.signals.len()
    }
}

/// Issues gated, time-boxed provider calls.
pub struct Dispatcher {
    registry: SharedProviderRegistry,
    breakers: SharedBreakerTable,
    limiter: Arc<RateLimiter>,
    normalizer: SignalNormalizer,
    per_call_timeout: Duration,
    bus: Option<SharedEventBus>,
    feedback: Option<FeedbackSender>,
}

impl Dispatcher {
    pub fn new(
        registry: SharedProviderRegistry,
        breakers: SharedBreakerTable,
        limiter: Arc<RateLimiter>,
        per_call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            breakers,
            limiter,
            normalizer: SignalNormalizer::new(),
            per_call_timeout,
            bus: None,
            feedback: None,
        }
    }

    pub fn with_event_bus(mut self, bus: SharedEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_feedback(mut self, feedback: FeedbackSender) -> Self {
        self.feedback = Some(feedback);
        self
    }

    fn publish(&self, event: EnsembleEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }

    pub fn normalize(
        &self,
        provider: &ProviderId,
        response: &ProviderResponse,
        reference_price: f64,
    ) -> NormalizedSignal {
        self.normalizer.normalize(provider, response, reference_price)
    }

    /// Make one gated call. Never panics across providers; every failure is
    /// returned as a [`ProviderError`].
    pub async fn call(
        &self,
        provider: &Arc<dyn Provider>,
        request: ProviderRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> ProviderResult<ProviderResponse> {
        let id = provider.id();
        let result = self.gated_call(&id, provider, request, deadline, cancel).await;
        if let Err(e) = &result {
            warn!(provider = %id, kind = e.kind(), error = %e, "Provider call failed");
            self.publish(EnsembleEvent::ProviderFailed {
                provider: id.clone(),
                error_kind: e.kind().to_string(),
                message: e.to_string(),
                timestamp: Utc::now(),
            });
        }
        result
    }

    async fn gated_call(
        &self,
        id: &ProviderId,
        provider: &Arc<dyn Provider>,
        request: ProviderRequest,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> ProviderResult<ProviderResponse> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProviderError::DeadlineExceeded);
        }
        let permit = match self.breakers.get(id) {
            Some(breaker) => Some(breaker.try_acquire()?),
            None => None,
        };
        // an unresolved permit is released on drop
        self.limiter.try_acquire(id)?;
        let _load = self.registry.begin_call(id);

        let budget = self.per_call_timeout.min(remaining);
        // a budget cut short by the cycle deadline is not the provider's fault
        let expired = if budget < self.per_call_timeout {
            ProviderError::DeadlineExceeded
        } else {
            ProviderError::Timeout(budget)
        };
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::Cancelled),
            r = timeout(budget, provider.submit(request)) => r.unwrap_or(Err(expired)),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let counted = match &result {
            Ok(_) => Some(true),
            Err(e) if e.counts_as_failure() => Some(false),
            Err(_) => None,
        };
        if let Some(permit) = permit {
            let transition = match counted {
                Some(true) => permit.succeed(),
                Some(false) => permit.fail(),
                None => None,
            };
            self.on_transition(id, transition);
        }
        if let (Some(success), Some(feedback)) = (counted, &self.feedback) {
            let latency_ms = match &result {
                Ok(r) => r.response_time_ms,
                Err(_) => latency_ms,
            };
            feedback.send(FeedbackEvent::CallCompleted {
                provider: id.clone(),
                success,
                latency_ms,
            });
        }
        result
    }

    fn on_transition(&self, id: &ProviderId, transition: Option<Transition>) {
        match transition {
            Some(Transition::Opened) => {
                let failures = self
                    .breakers
                    .get(id)
                    .map(|b| b.failure_count())
                    .unwrap_or_default();
                warn!(provider = %id, failures, "Circuit opened");
                self.publish(EnsembleEvent::CircuitOpened {
                    provider: id.clone(),
                    consecutive_failures: failures,
                    timestamp: Utc::now(),
                });
            }
            Some(Transition::Closed) => {
                info!(provider = %id, "Circuit closed after successful trial");
                self.publish(EnsembleEvent::CircuitClosed {
                    provider: id.clone(),
                    timestamp: Utc::now(),
                });
            }
            None => {}
        }
    }

    /// Call every provider concurrently and wait for all to settle.
    pub async fn fan_out(
        &self,
        providers: &[Arc<dyn Provider>],
        request: &ProviderRequest,
        reference_price: f64,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let calls = providers.iter().map(|p| async move {
            let result = self.call(p, request.clone(), deadline, cancel).await;
            (p.id(), result)
        });
        let settled = join_all(calls).await;

        let mut outcome = DispatchOutcome::default();
        for (id, result) in settled {
            outcome.attempted.push(id.clone());
            match result {
                Ok(response) => {
                    outcome.total_cost += response.cost;
                    outcome.usage.push((id.clone(), response.usage));
                    outcome
                        .signals
                        .push(self.normalizer.normalize(&id, &response, reference_price));
                }
                Err(error) => outcome.failures.push(CallFailure { provider: id, error }),
            }
        }
        debug!(
            attempted = outcome.attempted.len(),
            succeeded = outcome.succeeded(),
            cost = outcome.total_cost,
            "Fan-out settled"
        );
        outcome
    }

    /// Fail the cycle unless at least `min_quorum` calls succeeded.
    pub fn enforce_quorum(
        &self,
        symbol: &str,
        outcome: &DispatchOutcome,
        min_quorum: usize,
        cancel: &CancellationToken,
    ) -> EnsembleResult<()> {
        if outcome.succeeded() >= min_quorum {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(EnsembleError::Cancelled);
        }
        let out_of_time = outcome
            .failures
            .iter()
            .any(|f| f.error == ProviderError::DeadlineExceeded);
        if out_of_time {
            warn!(
                symbol,
                got = outcome.succeeded(),
                need = min_quorum,
                "Deadline reached before quorum"
            );
            return Err(EnsembleError::DeadlineExceeded {
                got: outcome.succeeded(),
                need: min_quorum,
            });
        }
        warn!(
            symbol,
            got = outcome.succeeded(),
            need = min_quorum,
            "Quorum not met"
        );
        self.publish(EnsembleEvent::QuorumFailed {
            symbol: symbol.to_string(),
            got: outcome.succeeded(),
            need: min_quorum,
            attempted: outcome.attempted.clone(),
            timestamp: Utc::now(),
        });
        Err(EnsembleError::InsufficientSignals {
            got: outcome.succeeded(),
            need: min_quorum,
            attempted: outcome.attempted.clone(),
        })
    }
}
