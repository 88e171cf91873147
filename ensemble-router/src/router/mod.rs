//! Provider routing: selection, circuit breaking, and rate limiting.

pub mod circuit_breaker;
pub mod rate_limit;
pub mod selector;

pub use circuit_breaker::{
    BreakerPermit, CircuitBreaker, CircuitBreakerTable, CircuitSnapshot, CircuitState,
    FallbackLadder, SharedBreakerTable, Transition,
};
pub use rate_limit::RateLimiter;
pub use selector::{base_score, ProviderSelector, RankedProvider};
