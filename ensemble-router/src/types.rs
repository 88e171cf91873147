//! Core types shared across the router
//!
//! Identifiers, market context, and the small enums that flow from the
//! caller through selection, dispatch, and aggregation.

use serde::{Deserialize, Serialize};

/// Identifier of a configured inference provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProviderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Trading action voted on by providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    /// All actions in canonical order.
    pub fn all() -> &'static [Action] {
        &[Action::Buy, Action::Sell, Action::Hold]
    }

    /// Parse a free-form action label. Accepts common synonyms.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "buy" | "long" => Some(Action::Buy),
            "sell" | "short" => Some(Action::Sell),
            "hold" | "neutral" | "wait" => Some(Action::Hold),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Sell => write!(f, "SELL"),
            Action::Hold => write!(f, "HOLD"),
        }
    }
}

/// Coarse price direction reported with a market snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Bullish,
    Bearish,
    Sideways,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trend::Bullish => write!(f, "bullish"),
            Trend::Bearish => write!(f, "bearish"),
            Trend::Sideways => write!(f, "sideways"),
        }
    }
}

/// Market regime used to look up condition-specific provider accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketCondition {
    Trending,
    Ranging,
    Volatile,
}

impl MarketCondition {
    /// Volatility (as a fraction of price) above which a market is volatile.
    pub const VOLATILE_THRESHOLD: f64 = 0.05;

    /// Classify a snapshot into a regime.
    pub fn classify(snapshot: &MarketSnapshot) -> Self {
        if snapshot.volatility >= Self::VOLATILE_THRESHOLD {
            MarketCondition::Volatile
        } else if snapshot.trend == Trend::Sideways {
            MarketCondition::Ranging
        } else {
            MarketCondition::Trending
        }
    }
}

impl std::fmt::Display for MarketCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarketCondition::Trending => write!(f, "trending"),
            MarketCondition::Ranging => write!(f, "ranging"),
            MarketCondition::Volatile => write!(f, "volatile"),
        }
    }
}

/// Request priority class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// Latency tolerant; eligible for batching.
    Low,
    #[default]
    Medium,
    /// Latency sensitive.
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "LOW"),
            Priority::Medium => write!(f, "MEDIUM"),
            Priority::High => write!(f, "HIGH"),
        }
    }
}

/// Point-in-time market state handed to the router by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub price: f64,
    pub volume: f64,
    /// Recent volatility as a fraction of price (0.03 = 3%).
    pub volatility: f64,
    pub trend: Trend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resistance: Option<f64>,
}

/// Risk bucket attached to an ensemble decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Extreme,
}

impl RiskLevel {
    /// Bucket a volatility fraction.
    pub fn from_volatility(volatility: f64) -> Self {
        if volatility < 0.02 {
            RiskLevel::Low
        } else if volatility < 0.05 {
            RiskLevel::Medium
        } else if volatility < 0.10 {
            RiskLevel::High
        } else {
            RiskLevel::Extreme
        }
    }

    /// One level riskier, saturating at `Extreme`.
    pub fn escalate(self) -> Self {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium => RiskLevel::High,
            RiskLevel::High | RiskLevel::Extreme => RiskLevel::Extreme,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Extreme => write!(f, "EXTREME"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(volatility: f64, trend: Trend) -> MarketSnapshot {
        MarketSnapshot {
            price: 100.0,
            volume: 1_000.0,
            volatility,
            trend,
            support: None,
            resistance: None,
        }
    }

    #[test]
    fn test_action_parse_synonyms() {
        assert_eq!(Action::parse("BUY"), Some(Action::Buy));
        assert_eq!(Action::parse(" short "), Some(Action::Sell));
        assert_eq!(Action::parse("Neutral"), Some(Action::Hold));
        assert_eq!(Action::parse("moon"), None);
    }

    #[test]
    fn test_market_condition_classify() {
        assert_eq!(
            MarketCondition::classify(&snapshot(0.08, Trend::Bullish)),
            MarketCondition::Volatile
        );
        assert_eq!(
            MarketCondition::classify(&snapshot(0.01, Trend::Sideways)),
            MarketCondition::Ranging
        );
        assert_eq!(
            MarketCondition::classify(&snapshot(0.01, Trend::Bearish)),
            MarketCondition::Trending
        );
    }

    #[test]
    fn test_risk_buckets_and_escalation() {
        assert_eq!(RiskLevel::from_volatility(0.01), RiskLevel::Low);
        assert_eq!(RiskLevel::from_volatility(0.03), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_volatility(0.07), RiskLevel::High);
        assert_eq!(RiskLevel::from_volatility(0.2), RiskLevel::Extreme);
        assert_eq!(RiskLevel::High.escalate(), RiskLevel::Extreme);
        assert_eq!(RiskLevel::Extreme.escalate(), RiskLevel::Extreme);
    }

    #[test]
    fn test_action_serde_uppercase() {
        let json = serde_json::to_string(&Action::Sell).unwrap();
        assert_eq!(json, "\"SELL\"");
    }
}
