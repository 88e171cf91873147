//! Cost and cache optimizer
//!
//! Runs before dispatch: answers repeat requests from the
//! fingerprint-keyed cache, shapes response length to fit the spend
//! ceilings, and defers low-priority requests into batches.

pub mod batch;
pub mod budget;
pub mod cache;
pub mod pricing;

pub use batch::{Batcher, FlushTrigger};
pub use budget::{CostOptimizer, RequestShape};
pub use cache::{CacheHit, CacheMode, CacheStats, DecisionCache, MarketFingerprint};
pub use pricing::{estimate_tokens, PricingTable, CHARS_PER_TOKEN};
