//! Router settings: the ensemble config file plus provider credentials
//! resolved from the environment.

use std::path::Path;

use anyhow::{Context, Result};
use ensemble_router::{EnsembleConfig, ProviderConfig, ProviderId};
use tracing::{debug, warn};

/// A configured provider that is ready to have an adapter built.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub config: ProviderConfig,
    /// `None` for endpoints that take no credential.
    pub api_key: Option<String>,
}

/// Everything the binary needs to build a service.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub ensemble: EnsembleConfig,
    pub providers: Vec<ProviderSettings>,
    /// Enabled providers left out because their credential is unset.
    pub missing_credentials: Vec<ProviderId>,
}

impl RouterSettings {
    /// Load `path` and resolve credentials from the process environment.
    pub fn load(path: &Path) -> Result<Self> {
        let ensemble = EnsembleConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        Ok(Self::resolve(ensemble, |name| std::env::var(name).ok()))
    }

    /// Pair each enabled provider with its credential, looked up through
    /// `lookup` by the env var name it declares.
    pub fn resolve(ensemble: EnsembleConfig, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut providers = Vec::new();
        let mut missing_credentials = Vec::new();

        for config in ensemble.providers.iter().filter(|p| p.enabled) {
            let api_key = match config.api_key_env.as_deref() {
                None => None,
                Some(var) => match lookup(var).filter(|k| !k.trim().is_empty()) {
                    Some(key) => Some(key),
                    None => {
                        warn!(provider = %config.id, var, "Credential not set, skipping provider");
                        missing_credentials.push(config.id.clone());
                        continue;
                    }
                },
            };
            debug!(provider = %config.id, model = %config.model, "Provider configured");
            providers.push(ProviderSettings {
                config: config.clone(),
                api_key,
            });
        }

        Self {
            ensemble,
            providers,
            missing_credentials,
        }
    }
}
