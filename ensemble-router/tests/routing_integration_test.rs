//! Integration tests for caching, circuit breaking, fallback, and health
//!
//! Time-sensitive tests run on a paused clock and step it explicitly.

mod common;

use std::time::Duration;

use common::*;
use ensemble_router::{
    Action, CircuitState, DecisionRequest, EnsembleError, EnsembleService, ProviderId,
    ProviderProfile,
};

/// Helper: breaker state of one provider.
fn state_of(service: &EnsembleService, id: &str) -> CircuitState {
    service
        .circuit_snapshot()
        .into_iter()
        .find(|s| s.provider.as_str() == id)
        .map(|s| s.state)
        .expect("breaker exists")
}

// ── Cache ───────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_cache_hit_skips_dispatch_until_ttl() {
    let providers = vec![
        ScriptedProvider::new("p1", buy(0.9)),
        ScriptedProvider::new("p2", buy(0.8)),
    ];
    let mut cfg = config(2, 5);
    cfg.cache.enabled = true;
    cfg.cache.ttl_secs = 60;
    let service = EnsembleService::builder(cfg)
        .providers(as_dyn(&providers))
        .build()
        .unwrap();
    let mut events = service.subscribe();

    let first = service
        .decide(DecisionRequest::new("BTC-USD", snapshot()))
        .await
        .unwrap();
    // a few ticks later the market fingerprint is unchanged
    let mut nudged = snapshot();
    nudged.price += 15.0;
    let second = service
        .decide(DecisionRequest::new("BTC-USD", nudged))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert!(providers.iter().all(|p| p.calls() == 1));
    let stats = service.cache_stats().unwrap();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.size, 1);
    assert_eq!(count(&drain(&mut events), "cache_hit"), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    let third = service
        .decide(DecisionRequest::new("BTC-USD", snapshot()))
        .await
        .unwrap();
    assert_ne!(third.id(), first.id());
    assert!(providers.iter().all(|p| p.calls() == 2));
    assert_eq!(service.cache_stats().unwrap().expirations, 1);
}

#[tokio::test]
async fn test_cache_separates_single_and_ensemble() {
    let providers = vec![
        ScriptedProvider::new("p1", buy(0.9)),
        ScriptedProvider::new("p2", buy(0.8)),
    ];
    let mut cfg = config(2, 5);
    cfg.cache.enabled = true;
    let service = EnsembleService::builder(cfg)
        .providers(as_dyn(&providers))
        .build()
        .unwrap();

    let ensemble = service
        .decide(DecisionRequest::new("ETH-USD", snapshot()))
        .await
        .unwrap();
    let single = service
        .decide(DecisionRequest::new("ETH-USD", snapshot()).single())
        .await
        .unwrap();

    assert!(ensemble.as_ensemble().is_some());
    assert!(single.as_single().is_some());
    let total: usize = providers.iter().map(|p| p.calls()).sum();
    assert_eq!(total, 3);
}

#[tokio::test]
async fn test_use_cache_false_always_dispatches() {
    let providers = vec![
        ScriptedProvider::new("p1", buy(0.9)),
        ScriptedProvider::new("p2", buy(0.8)),
    ];
    let mut cfg = config(2, 5);
    cfg.cache.enabled = true;
    let service = EnsembleService::builder(cfg)
        .providers(as_dyn(&providers))
        .build()
        .unwrap();

    for _ in 0..2 {
        service
            .decide(DecisionRequest::new("SOL-USD", snapshot()).without_cache())
            .await
            .unwrap();
    }
    assert!(providers.iter().all(|p| p.calls() == 2));
    assert_eq!(service.cache_stats().unwrap().size, 0);
}

// ── Circuit Breaker ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_open_circuit_short_circuits_then_recovers() {
    let providers = vec![
        ScriptedProvider::new("p1", buy(0.9)),
        ScriptedProvider::new("p2", buy(0.8)),
        ScriptedProvider::new("p3", transport_error()),
    ];
    let mut cfg = config(2, 3);
    cfg.breaker.failure_threshold = 2;
    cfg.breaker.recovery_timeout_ms = 1_000;
    let service = EnsembleService::builder(cfg)
        .providers(as_dyn(&providers))
        .build()
        .unwrap();
    let mut events = service.subscribe();
    let request = || DecisionRequest::new("BTC-USD", snapshot()).without_cache();

    service.decide(request()).await.unwrap();
    assert_eq!(state_of(&service, "p3"), CircuitState::Closed);
    service.decide(request()).await.unwrap();
    assert_eq!(state_of(&service, "p3"), CircuitState::Open);
    assert_eq!(count(&drain(&mut events), "circuit_opened"), 1);

    // open: the provider is skipped without a network call
    let decision = service.decide(request()).await.unwrap();
    assert_eq!(providers[2].calls(), 2);
    assert!(!decision.providers().contains(&ProviderId::new("p3")));

    tokio::time::advance(Duration::from_millis(1_001)).await;
    assert_eq!(state_of(&service, "p3"), CircuitState::HalfOpen);
    providers[2].set_default(buy(0.7));

    let decision = service.decide(request()).await.unwrap();
    assert_eq!(providers[2].calls(), 3);
    assert!(decision.providers().contains(&ProviderId::new("p3")));
    assert_eq!(state_of(&service, "p3"), CircuitState::Closed);
    assert_eq!(count(&drain(&mut events), "circuit_closed"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens_circuit() {
    let providers = vec![
        ScriptedProvider::new("p1", buy(0.9)),
        ScriptedProvider::new("p2", buy(0.8)),
        ScriptedProvider::new("p3", transport_error()),
    ];
    let mut cfg = config(2, 3);
    cfg.breaker.failure_threshold = 1;
    cfg.breaker.recovery_timeout_ms = 1_000;
    let service = EnsembleService::builder(cfg)
        .providers(as_dyn(&providers))
        .build()
        .unwrap();
    let request = || DecisionRequest::new("BTC-USD", snapshot()).without_cache();

    service.decide(request()).await.unwrap();
    assert_eq!(state_of(&service, "p3"), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(1_001)).await;
    service.decide(request()).await.unwrap();
    assert_eq!(providers[2].calls(), 2);
    assert_eq!(state_of(&service, "p3"), CircuitState::Open);

    // the recovery timer restarted with the failed trial
    tokio::time::advance(Duration::from_millis(500)).await;
    service.decide(request()).await.unwrap();
    assert_eq!(providers[2].calls(), 2);
}

// ── Single-Provider Path ────────────────────────────────────────────

/// Helper: service with three providers ranked p1 > p2 > p3.
fn ranked_service(providers: &[std::sync::Arc<ScriptedProvider>]) -> EnsembleService {
    let mut cfg = config(1, 5);
    cfg.breaker.failure_threshold = 1;
    EnsembleService::builder(cfg)
        .providers(as_dyn(providers))
        .profile(ProviderProfile::new("p1", 0.9))
        .profile(ProviderProfile::new("p2", 0.6))
        .profile(ProviderProfile::new("p3", 0.3))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_single_path_walks_fallback_ladder() {
    let providers = vec![
        ScriptedProvider::new("p1", transport_error()),
        ScriptedProvider::new("p2", sell(0.75)),
        ScriptedProvider::new("p3", buy(0.9)),
    ];
    let service = ranked_service(&providers);

    let decision = service
        .decide(DecisionRequest::new("BTC-USD", snapshot()).single())
        .await
        .unwrap();
    let single = decision.as_single().expect("single response");

    assert_eq!(single.provider.as_str(), "p2");
    assert_eq!(single.failed_attempts, vec![ProviderId::new("p1")]);
    assert_eq!(decision.action(), Action::Sell);
    assert_eq!(providers[2].calls(), 0);

    // p1's circuit is now open, so the next request goes straight to p2
    let decision = service
        .decide(DecisionRequest::new("BTC-USD", snapshot()).single())
        .await
        .unwrap();
    assert!(decision.as_single().unwrap().failed_attempts.is_empty());
    assert_eq!(providers[0].calls(), 1);
}

#[tokio::test]
async fn test_single_path_exhausted_ladder_fails() {
    let providers: Vec<_> = (1..=4)
        .map(|i| ScriptedProvider::new(&format!("p{i}"), transport_error()))
        .collect();
    let mut cfg = config(1, 5);
    cfg.ensemble.max_fallback_attempts = 3;
    let service = EnsembleService::builder(cfg)
        .providers(as_dyn(&providers))
        .build()
        .unwrap();
    let mut events = service.subscribe();

    let err = service
        .decide(DecisionRequest::new("BTC-USD", snapshot()).single())
        .await
        .unwrap_err();
    match err {
        EnsembleError::InsufficientSignals {
            got,
            need,
            attempted,
        } => {
            assert_eq!((got, need), (0, 1));
            assert_eq!(attempted.len(), 3);
        }
        other => panic!("unexpected error: {other}"),
    }
    let total: usize = providers.iter().map(|p| p.calls()).sum();
    assert_eq!(total, 3);
    assert_eq!(count(&drain(&mut events), "quorum_failed"), 1);
}

// ── Health ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_failed_health_check_excludes_provider() {
    let providers = vec![
        ScriptedProvider::new("p1", buy(0.9)),
        ScriptedProvider::new("p2", buy(0.8)),
    ];
    let service = EnsembleService::builder(config(2, 5))
        .providers(as_dyn(&providers))
        .build()
        .unwrap();

    providers[1].set_healthy(false);
    let reports = service.run_health_checks().await;
    assert_eq!(reports.len(), 2);
    assert!(reports
        .iter()
        .any(|r| r.provider.as_str() == "p2" && !r.healthy));

    let request = || DecisionRequest::new("BTC-USD", snapshot()).without_cache();
    let err = service.decide(request()).await.unwrap_err();
    assert!(matches!(
        err,
        EnsembleError::InsufficientProviders {
            available: 1,
            required: 2
        }
    ));

    providers[1].set_healthy(true);
    assert!(service.run_health_checks().await.iter().all(|r| r.healthy));
    assert!(service.decide(request()).await.is_ok());
}

#[tokio::test]
async fn test_provider_metrics_reflect_calls() {
    let providers = vec![
        ScriptedProvider::new("p1", buy(0.9)),
        ScriptedProvider::new("p2", transport_error()),
        ScriptedProvider::new("p3", buy(0.7)),
    ];
    let service = EnsembleService::builder(config(2, 5))
        .providers(as_dyn(&providers))
        .build()
        .unwrap();

    service
        .decide(DecisionRequest::new("BTC-USD", snapshot()))
        .await
        .unwrap();
    let metrics = service.provider_metrics();
    assert_eq!(metrics[&ProviderId::new("p1")].successful_requests, 1);
    assert_eq!(metrics[&ProviderId::new("p2")].failed_requests, 1);
}
