//! Ensemble aggregation
//!
//! Turns the normalized signals of one decision cycle into a single
//! [`EnsembleDecision`].
//!
//! # Flow
//!
//! ```text
//! signals ──▶ WeightPolicy ──▶ weights ──▶ tally ──▶ risk + gating ──▶ decision
//!              (profiles,                  (mass per
//!               condition)                  action)
//! ```
//!
//! # Components
//!
//! - **WeightPolicy**: per-signal weights from provider profiles
//! - **WeightedVoteAggregator**: tally, tie-break, risk and execution gates
//! - **EnsembleDecision**: immutable output of a cycle

pub mod decision;
pub mod voting;
pub mod weights;

pub use decision::{
    ActionMass, EnsembleDecision, ExecutionRecommendation, RiskAssessment, WeightedSignal,
};
pub use voting::{tally, VoteTally, WeightedVoteAggregator};
pub use weights::{VoteWeight, WeightPolicy, NEUTRAL_RAW_WEIGHT};
