//! Router configuration
//!
//! Every section is `#[serde(default)]` so a TOML file only needs to name
//! what it overrides. Credentials are never stored here: a provider names
//! the environment variable that holds its key.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::ProviderId;

/// Error type for configuration loading and validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level router configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub ensemble: EnsembleSection,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub breaker: BreakerConfig,
    pub cost: CostConfig,
    pub feedback: FeedbackConfig,
    pub risk: RiskConfig,
    pub providers: Vec<ProviderConfig>,
}

/// Quorum and decision thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleSection {
    pub min_providers: usize,
    pub max_providers: usize,
    pub consensus_threshold: f64,
    pub confidence_threshold: f64,
    pub per_call_timeout_ms: u64,
    pub default_timeout_ms: u64,
    pub temperature: f32,
    /// Providers tried in turn on the single-provider path.
    pub max_fallback_attempts: usize,
    /// Multiplier on cost-per-call in the vote weight (0 disables).
    pub cost_weight: f64,
}

impl Default for EnsembleSection {
    fn default() -> Self {
        Self {
            min_providers: 2,
            max_providers: 5,
            consensus_threshold: 0.6,
            confidence_threshold: 0.7,
            per_call_timeout_ms: 15_000,
            default_timeout_ms: 30_000,
            temperature: 0.3,
            max_fallback_attempts: 3,
            cost_weight: 0.0,
        }
    }
}

impl EnsembleSection {
    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_millis(self.per_call_timeout_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 60,
            capacity: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    pub size: usize,
    pub timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size: 5,
            timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_ms: 30_000,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Spend ceilings in USD.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub ceiling_per_request: f64,
    pub ceiling_per_day: f64,
    pub default_max_tokens: u32,
    pub min_response_tokens: u32,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            ceiling_per_request: 0.05,
            ceiling_per_day: 25.0,
            default_max_tokens: 1_024,
            min_response_tokens: 128,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    /// Smoothing factor of the accuracy moving average.
    pub accuracy_alpha: f64,
    pub half_life_hours: f64,
    /// Number of recent calls the reliability ratio is computed over.
    pub reliability_window: usize,
    pub channel_capacity: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            accuracy_alpha: 0.1,
            half_life_hours: 24.0,
            reliability_window: 50,
            channel_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Volume below this raises the risk level one step (0 disables).
    pub low_volume_threshold: f64,
}

/// Volume discount tier keyed by cumulative monthly tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTier {
    pub min_monthly_tokens: u64,
    /// Fraction taken off list price (0.1 = 10% off).
    pub discount: f64,
}

/// USD per thousand tokens.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub tiers: Vec<PricingTier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub id: ProviderId,
    pub enabled: bool,
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub rate_limit_per_minute: Option<u32>,
    /// 1 is the most preferred tier.
    pub priority_tier: u8,
    pub capabilities: Vec<String>,
    pub base_accuracy: f64,
    pub expected_latency_ms: u64,
    pub pricing: PricingConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: ProviderId::new("unnamed"),
            enabled: true,
            model: String::new(),
            base_url: String::new(),
            api_key_env: None,
            rate_limit_per_minute: None,
            priority_tier: 2,
            capabilities: vec!["trading".to_string()],
            base_accuracy: 0.5,
            expected_latency_ms: 2_000,
            pricing: PricingConfig::default(),
        }
    }
}

impl ProviderConfig {
    pub fn new(id: impl Into<ProviderId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

impl EnsembleConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        let config: EnsembleConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> ConfigResult<()> {
        let e = &self.ensemble;
        if e.min_providers == 0 {
            return Err(ConfigError::Invalid("ensemble.min_providers must be > 0".into()));
        }
        if e.max_providers < e.min_providers {
            return Err(ConfigError::Invalid(format!(
                "ensemble.max_providers ({}) < min_providers ({})",
                e.max_providers, e.min_providers
            )));
        }
        for (name, value) in [
            ("consensus_threshold", e.consensus_threshold),
            ("confidence_threshold", e.confidence_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "ensemble.{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.cache.enabled && self.cache.capacity == 0 {
            return Err(ConfigError::Invalid("cache.capacity must be > 0".into()));
        }
        if self.batch.size == 0 {
            return Err(ConfigError::Invalid("batch.size must be > 0".into()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid("breaker.failure_threshold must be > 0".into()));
        }
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider id: {}",
                    provider.id
                )));
            }
        }
        Ok(())
    }
}
