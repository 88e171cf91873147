//! Signal normalizer
//!
//! Pulls a structured block out of free-form provider output and turns it
//! into a [`Signal`]. Malformed output never fails the cycle: it becomes a
//! [`NormalizedSignal::Fallback`] holding a neutral HOLD signal.
//!
//! Block lookup order:
//! 1. a fenced code block (optionally tagged `json`) containing an object
//! 2. the span from the first `{` to the last `}`

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::provider::ProviderResponse;
use crate::signal::{NormalizedSignal, ParseFailure, Signal};
use crate::types::{Action, ProviderId};

/// Default stop distance from the reference price.
pub const DEFAULT_STOP_PCT: f64 = 0.02;
/// Default target distance from the reference price.
pub const DEFAULT_TARGET_PCT: f64 = 0.06;

const ACTION_KEYS: &[&str] = &["action", "signal", "decision", "recommendation"];
const CONFIDENCE_KEYS: &[&str] = &["confidence", "conviction", "probability"];
const REASONING_KEYS: &[&str] = &["reasoning", "rationale", "analysis", "explanation"];
const ENTRY_KEYS: &[&str] = &["entry_price", "entryPrice", "entry", "price"];
const STOP_KEYS: &[&str] = &["stop_loss", "stopLoss", "stop"];
const TARGET_KEYS: &[&str] = &["take_profit", "takeProfit", "target_price", "target"];
const SIZE_KEYS: &[&str] = &["position_size", "positionSize", "size"];
const RR_KEYS: &[&str] = &["risk_reward", "riskReward", "risk_reward_ratio"];
const VOLATILITY_KEYS: &[&str] = &["volatility", "expected_volatility"];

/// Parses provider responses into signals.
#[derive(Debug, Clone)]
pub struct SignalNormalizer {
    fenced: Regex,
}

impl Default for SignalNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalNormalizer {
    pub fn new() -> Self {
        Self {
            fenced: Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```")
                .expect("static regex is valid"),
        }
    }

    /// Normalize one response. `reference_price` anchors default levels
    /// when the provider gives no entry price.
    pub fn normalize(
        &self,
        provider: &ProviderId,
        response: &ProviderResponse,
        reference_price: f64,
    ) -> NormalizedSignal {
        match self.parse(provider, response, reference_price) {
            Ok(signal) => NormalizedSignal::Valid(signal),
            Err(reason) => {
                debug!(provider = %provider, %reason, "Falling back to neutral signal");
                NormalizedSignal::Fallback {
                    signal: fallback_signal(provider, response, reference_price, &reason),
                    reason,
                }
            }
        }
    }

    fn extract_block<'a>(&self, content: &'a str) -> Option<&'a str> {
        if let Some(caps) = self.fenced.captures(content) {
            return caps.get(1).map(|m| m.as_str());
        }
        let start = content.find('{')?;
        let end = content.rfind('}')?;
        (end > start).then(|| &content[start..=end])
    }

    fn parse(
        &self,
        provider: &ProviderId,
        response: &ProviderResponse,
        reference_price: f64,
    ) -> Result<Signal, ParseFailure> {
        let block = self
            .extract_block(&response.content)
            .ok_or(ParseFailure::NoStructuredBlock)?;
        let value: Value =
            serde_json::from_str(block).map_err(|e| ParseFailure::InvalidJson(e.to_string()))?;
        if !value.is_object() {
            return Err(ParseFailure::InvalidJson("structured block is not an object".into()));
        }

        let action_raw = lookup(&value, ACTION_KEYS)
            .ok_or_else(|| ParseFailure::MissingField("action".into()))?;
        let action_label = action_raw.as_str().unwrap_or_default();
        let action = Action::parse(action_label)
            .ok_or_else(|| ParseFailure::InvalidAction(action_raw.to_string()))?;

        let confidence_raw = lookup(&value, CONFIDENCE_KEYS)
            .ok_or_else(|| ParseFailure::MissingField("confidence".into()))?;
        let confidence = as_number(confidence_raw)
            .map(normalize_fraction)
            .ok_or_else(|| ParseFailure::InvalidConfidence(confidence_raw.to_string()))?;

        let reasoning = lookup(&value, REASONING_KEYS)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let entry = lookup_number(&value, ENTRY_KEYS)
            .filter(|p| *p > 0.0)
            .unwrap_or(reference_price);
        let (default_stop, default_target) = default_levels(action, entry);
        let stop_loss = lookup_number(&value, STOP_KEYS)
            .filter(|p| *p > 0.0)
            .unwrap_or(default_stop);
        let take_profit = lookup_number(&value, TARGET_KEYS)
            .filter(|p| *p > 0.0)
            .unwrap_or(default_target);
        let risk_reward = lookup_number(&value, RR_KEYS)
            .filter(|r| *r >= 0.0)
            .unwrap_or_else(|| risk_reward(entry, stop_loss, take_profit));
        let position_size = lookup_number(&value, SIZE_KEYS)
            .map(|s| s.max(0.0))
            .unwrap_or(0.0);
        let volatility = lookup_number(&value, VOLATILITY_KEYS)
            .filter(|v| *v >= 0.0)
            .map(|v| if v > 1.0 { v / 100.0 } else { v });

        Ok(Signal {
            action,
            confidence,
            reasoning,
            entry_price: entry,
            stop_loss,
            take_profit,
            position_size,
            risk_reward,
            volatility,
            provider: provider.clone(),
            model: response.model.clone(),
            latency_ms: response.response_time_ms,
            created_at: Utc::now(),
        })
    }
}

fn fallback_signal(
    provider: &ProviderId,
    response: &ProviderResponse,
    reference_price: f64,
    reason: &ParseFailure,
) -> Signal {
    let (stop_loss, take_profit) = default_levels(Action::Hold, reference_price);
    Signal {
        action: Action::Hold,
        confidence: 0.0,
        reasoning: format!("Unparseable response from {provider}: {reason}"),
        entry_price: reference_price,
        stop_loss,
        take_profit,
        position_size: 0.0,
        risk_reward: risk_reward(reference_price, stop_loss, take_profit),
        volatility: None,
        provider: provider.clone(),
        model: response.model.clone(),
        latency_ms: response.response_time_ms,
        created_at: Utc::now(),
    }
}

/// Default (stop, target) for an action around `entry`. Short positions
/// mirror the long levels.
pub fn default_levels(action: Action, entry: f64) -> (f64, f64) {
    match action {
        Action::Sell => (
            entry * (1.0 + DEFAULT_STOP_PCT),
            entry * (1.0 - DEFAULT_TARGET_PCT),
        ),
        Action::Buy | Action::Hold => (
            entry * (1.0 - DEFAULT_STOP_PCT),
            entry * (1.0 + DEFAULT_TARGET_PCT),
        ),
    }
}

fn risk_reward(entry: f64, stop: f64, target: f64) -> f64 {
    let risk = (entry - stop).abs();
    if risk > f64::EPSILON {
        (target - entry).abs() / risk
    } else {
        0.0
    }
}

/// Percentages (1 < x <= 100) become fractions, then clamp to [0, 1].
fn normalize_fraction(value: f64) -> f64 {
    let v = if value > 1.0 && value <= 100.0 {
        value / 100.0
    } else {
        value
    };
    v.clamp(0.0, 1.0)
}

fn lookup<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|k| value.get(*k))
        .filter(|v| !v.is_null())
}

fn lookup_number(value: &Value, keys: &[&str]) -> Option<f64> {
    lookup(value, keys).and_then(as_number)
}

/// Accepts JSON numbers and numeric strings such as `"0.8"`, `"85%"`,
/// or `"$42,100.50"`.
fn as_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| !matches!(c, '$' | ',' | '%'))
                .collect();
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }?;
    n.is_finite().then_some(n)
}
