//! Performance feedback tracker
//!
//! The only writer of evolved provider performance. Outcome and call-result
//! events arrive on a bounded channel and are applied by a background task,
//! so decision cycles never wait on profile updates. Senders use
//! `try_send`: when the queue is full the event is dropped with a warning
//! rather than stalling dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::FeedbackConfig;
use crate::events::{EnsembleEvent, SharedEventBus};
use crate::registry::{ProviderProfile, SharedProviderRegistry};
use crate::types::{MarketCondition, ProviderId};

/// How much a single outcome moves the recency-weighted score.
const RECENT_WEIGHT: f64 = 0.25;
/// Neutral value recent performance decays toward.
const NEUTRAL_PERFORMANCE: f64 = 0.5;

/// Realized result of a trade a provider voted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Profitable,
    Losing,
    Neutral,
}

impl Outcome {
    /// Accuracy sample contributed by this outcome.
    pub fn score(self) -> f64 {
        match self {
            Outcome::Profitable => 1.0,
            Outcome::Losing => 0.0,
            Outcome::Neutral => 0.5,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Profitable => write!(f, "profitable"),
            Outcome::Losing => write!(f, "losing"),
            Outcome::Neutral => write!(f, "neutral"),
        }
    }
}

/// Input to the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedbackEvent {
    /// A trade the provider contributed to has closed.
    TradeOutcome {
        provider: ProviderId,
        condition: MarketCondition,
        outcome: Outcome,
        closed_at: DateTime<Utc>,
    },
    /// A provider call finished, successfully or not.
    CallCompleted {
        provider: ProviderId,
        success: bool,
        latency_ms: u64,
    },
}

impl FeedbackEvent {
    pub fn provider(&self) -> &ProviderId {
        match self {
            FeedbackEvent::TradeOutcome { provider, .. } => provider,
            FeedbackEvent::CallCompleted { provider, .. } => provider,
        }
    }
}

/// Cloneable, non-blocking handle for feeding the tracker.
#[derive(Debug, Clone)]
pub struct FeedbackSender {
    tx: mpsc::Sender<FeedbackEvent>,
}

impl FeedbackSender {
    /// Queue an event. Returns false if it was dropped.
    pub fn send(&self, event: FeedbackEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(provider = %event.provider(), "Feedback queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn record_outcome(
        &self,
        provider: ProviderId,
        condition: MarketCondition,
        outcome: Outcome,
    ) -> bool {
        self.send(FeedbackEvent::TradeOutcome {
            provider,
            condition,
            outcome,
            closed_at: Utc::now(),
        })
    }
}

/// Applies feedback events to the provider registry.
pub struct FeedbackTracker {
    registry: SharedProviderRegistry,
    config: FeedbackConfig,
    bus: Option<SharedEventBus>,
}

impl FeedbackTracker {
    pub fn new(registry: SharedProviderRegistry, config: FeedbackConfig) -> Self {
        Self {
            registry,
            config,
            bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: SharedEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Run the tracker on a background task.
    ///
    /// The task exits once every [`FeedbackSender`] is dropped and the
    /// queue has drained.
    pub fn spawn(self) -> (FeedbackSender, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.apply(&event);
            }
            debug!("Feedback tracker stopped");
        });
        (FeedbackSender { tx }, handle)
    }

    /// Apply one event synchronously. Unknown providers are ignored.
    pub fn apply(&self, event: &FeedbackEvent) {
        match event {
            FeedbackEvent::TradeOutcome {
                provider,
                condition,
                outcome,
                closed_at,
            } => {
                let alpha = self.config.accuracy_alpha;
                let half_life = self.config.half_life_hours;
                let mut accuracy = None;
                let known = self.registry.update(provider, |p| {
                    apply_outcome(p, *condition, *outcome, *closed_at, alpha, half_life);
                    accuracy = Some(p.accuracy);
                });
                let Some(accuracy) = accuracy.filter(|_| known) else {
                    debug!(provider = %provider, "Outcome for unknown provider ignored");
                    return;
                };
                info!(
                    provider = %provider,
                    %condition,
                    %outcome,
                    accuracy,
                    "Recorded trade outcome"
                );
                if let Some(bus) = &self.bus {
                    bus.publish(EnsembleEvent::OutcomeRecorded {
                        provider: provider.clone(),
                        condition: *condition,
                        outcome: *outcome,
                        accuracy,
                        timestamp: Utc::now(),
                    });
                }
            }
            FeedbackEvent::CallCompleted {
                provider,
                success,
                latency_ms,
            } => {
                let window = self.config.reliability_window;
                self.registry
                    .update(provider, |p| p.record_call(*success, *latency_ms, window));
            }
        }
    }
}

/// Update accuracy, condition accuracy, and recent performance from one
/// outcome observed at `at`.
pub fn apply_outcome(
    profile: &mut ProviderProfile,
    condition: MarketCondition,
    outcome: Outcome,
    at: DateTime<Utc>,
    alpha: f64,
    half_life_hours: f64,
) {
    let alpha = alpha.clamp(0.0, 1.0);
    let score = outcome.score();

    // an unseen regime falls back to the overall figure, so read it first
    let prior = profile.accuracy_for(condition);
    profile
        .condition_accuracy
        .insert(condition, prior + alpha * (score - prior));
    profile.accuracy += alpha * (score - profile.accuracy);

    let decay = match profile.last_outcome_at {
        Some(last) if half_life_hours > 0.0 => {
            let hours = (at - last).num_milliseconds().max(0) as f64 / 3_600_000.0;
            0.5_f64.powf(hours / half_life_hours)
        }
        _ => 1.0,
    };
    let decayed = NEUTRAL_PERFORMANCE + (profile.recent_performance - NEUTRAL_PERFORMANCE) * decay;
    profile.recent_performance = (decayed + RECENT_WEIGHT * (score - decayed)).clamp(0.0, 1.0);
    profile.last_outcome_at = Some(at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProviderRegistry;
    use chrono::Duration;

    #[test]
    fn test_accuracy_moves_toward_outcome() {
        let mut p = ProviderProfile::new("p1", 0.5);
        let now = Utc::now();
        apply_outcome(&mut p, MarketCondition::Trending, Outcome::Profitable, now, 0.1, 24.0);
        assert!((p.accuracy - 0.55).abs() < 1e-12);
        assert!((p.accuracy_for(MarketCondition::Trending) - 0.55).abs() < 1e-12);
        // other regimes still read the overall figure
        assert_eq!(p.accuracy_for(MarketCondition::Ranging), p.accuracy);

        apply_outcome(&mut p, MarketCondition::Trending, Outcome::Losing, now, 0.1, 24.0);
        assert!(p.accuracy < 0.55);
    }

    #[test]
    fn test_first_outcome_in_new_regime_starts_from_prior_accuracy() {
        let mut p = ProviderProfile::new("p1", 0.5);
        let now = Utc::now();
        apply_outcome(&mut p, MarketCondition::Trending, Outcome::Profitable, now, 0.1, 24.0);
        apply_outcome(&mut p, MarketCondition::Trending, Outcome::Profitable, now, 0.1, 24.0);
        assert!((p.accuracy - 0.595).abs() < 1e-12);

        // Volatile has no history; it blends from 0.595, not from the updated 0.6355
        apply_outcome(&mut p, MarketCondition::Volatile, Outcome::Profitable, now, 0.1, 24.0);
        assert!((p.accuracy_for(MarketCondition::Volatile) - 0.6355).abs() < 1e-12);
        assert!((p.accuracy - 0.6355).abs() < 1e-12);
        assert!((p.accuracy_for(MarketCondition::Trending) - 0.595).abs() < 1e-12);
    }

    #[test]
    fn test_recent_performance_decays_with_half_life() {
        let t0 = Utc::now();
        let mut p = ProviderProfile::new("p1", 0.5);
        apply_outcome(&mut p, MarketCondition::Volatile, Outcome::Profitable, t0, 0.1, 24.0);
        let after_first = p.recent_performance;
        assert!((after_first - 0.625).abs() < 1e-12);

        // a neutral outcome one half-life later: excess over 0.5 halves, then blends
        apply_outcome(
            &mut p,
            MarketCondition::Volatile,
            Outcome::Neutral,
            t0 + Duration::hours(24),
            0.1,
            24.0,
        );
        let decayed = 0.5 + (after_first - 0.5) * 0.5;
        let expected = decayed + 0.25 * (0.5 - decayed);
        assert!((p.recent_performance - expected).abs() < 1e-9);
        assert_eq!(p.last_outcome_at, Some(t0 + Duration::hours(24)));
    }

    #[test]
    fn test_call_completed_updates_reliability() {
        let registry = ProviderRegistry::new()
            .with_profile(ProviderProfile::new("p1", 0.6))
            .shared();
        let tracker = FeedbackTracker::new(
            registry.clone(),
            FeedbackConfig {
                reliability_window: 4,
                ..Default::default()
            },
        );
        let id = ProviderId::new("p1");
        for success in [true, false, true, true, false] {
            tracker.apply(&FeedbackEvent::CallCompleted {
                provider: id.clone(),
                success,
                latency_ms: 100,
            });
        }
        let profile = registry.profile(&id).unwrap();
        assert_eq!(profile.window_len(), 4);
        assert!((profile.reliability - 0.5).abs() < 1e-12);
        assert_eq!(profile.lifetime_successes, 3);
        assert_eq!(profile.lifetime_failures, 2);
    }

    #[tokio::test]
    async fn test_spawned_tracker_applies_and_publishes() {
        let registry = ProviderRegistry::new()
            .with_profile(ProviderProfile::new("p1", 0.5))
            .shared();
        let bus = crate::events::EventBus::new().shared();
        let mut events = bus.subscribe();
        let (sender, handle) = FeedbackTracker::new(registry.clone(), FeedbackConfig::default())
            .with_event_bus(bus.clone())
            .spawn();

        assert!(sender.record_outcome(
            ProviderId::new("p1"),
            MarketCondition::Trending,
            Outcome::Profitable
        ));
        // unknown providers are skipped without an event
        assert!(sender.record_outcome(
            ProviderId::new("ghost"),
            MarketCondition::Trending,
            Outcome::Losing
        ));
        drop(sender);
        handle.await.unwrap();

        let profile = registry.profile(&ProviderId::new("p1")).unwrap();
        assert!(profile.accuracy > 0.5);
        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type(), "outcome_recorded");
        assert!(events.try_recv().is_err());
    }
}
