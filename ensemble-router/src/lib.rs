//! Ensemble Router Library
//!
//! Routes trading-decision requests across several independent, unreliable
//! AI inference providers and combines their answers into one governed
//! decision.
//!
//! # Features
//!
//! ## Routing
//! - Provider selection scored on accuracy, uptime, and recent failures
//! - Per-provider circuit breakers and rate limits
//! - Concurrent fan-out with per-call timeouts, cancellation, and quorum
//!
//! ## Aggregation
//! - Tolerant parsing of provider output into typed signals
//! - Performance-weighted voting with confidence, consensus, and risk gates
//!
//! ## Cost
//! - Fingerprint-keyed decision cache
//! - Per-request and daily spend ceilings with response-length shaping
//! - Batching of low-priority requests
//!
//! ## Adaptation
//! - Feedback tracker that evolves provider profiles from realized outcomes
//!
//! # Usage
//!
//! ```ignore
//! use ensemble_router::{DecisionRequest, EnsembleConfig, EnsembleService};
//!
//! let service = EnsembleService::builder(EnsembleConfig::load("router.toml")?)
//!     .providers(adapters)
//!     .build()?;
//!
//! let decision = service.decide(DecisionRequest::new("BTC-USD", snapshot)).await?;
//! ```

pub mod config;
pub mod cost;
pub mod dispatch;
pub mod ensemble;
pub mod error;
pub mod events;
pub mod feedback;
pub mod normalizer;
pub mod provider;
pub mod registry;
pub mod router;
pub mod service;
pub mod signal;
pub mod types;

// Re-export key service types
pub use service::{
    DecisionOptions, DecisionRequest, EnsembleService, EnsembleServiceBuilder, HealthReport,
    RoutedDecision, SingleResponse,
};

// Re-export configuration and error types
pub use config::{ConfigError, EnsembleConfig, PricingConfig, PricingTier, ProviderConfig};
pub use error::{EnsembleError, EnsembleResult, ProviderError, ProviderResult};

// Re-export provider contract
pub use provider::{
    MetricsRecorder, PromptComposer, Provider, ProviderMetrics, ProviderRequest, ProviderResponse,
    SnapshotPrompt, Usage,
};

// Re-export core domain types
pub use types::{
    Action, MarketCondition, MarketSnapshot, Priority, ProviderId, RiskLevel, Trend,
};

// Re-export aggregation types
pub use ensemble::{EnsembleDecision, WeightedVoteAggregator};
pub use signal::{NormalizedSignal, ParseFailure, Signal};

// Re-export event types
pub use events::{EnsembleEvent, EventBus, SharedEventBus};

// Re-export feedback types
pub use feedback::{FeedbackEvent, FeedbackSender, Outcome};

// Re-export routing types
pub use cost::CacheStats;
pub use registry::ProviderProfile;
pub use router::{CircuitSnapshot, CircuitState};
