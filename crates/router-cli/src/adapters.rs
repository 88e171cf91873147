//! HTTP provider adapters for OpenAI-compatible chat completion endpoints

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use ensemble_router::{
    MetricsRecorder, PricingConfig, Provider, ProviderConfig, ProviderError, ProviderId,
    ProviderMetrics, ProviderRequest, ProviderResponse, ProviderResult, Usage,
};
use reqwest::{header::RETRY_AFTER, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ProviderSettings;

const SYSTEM_PROMPT: &str = "You are a disciplined trading analyst. Answer with a single JSON \
object containing action (BUY, SELL or HOLD), confidence (0-1), reasoning, entry_price, \
stop_loss, take_profit, and volatility.";

/// Adapter for any backend speaking the `/chat/completions` protocol.
pub struct OpenAiCompatible {
    config: ProviderConfig,
    api_key: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
    metrics: MetricsRecorder,
}

impl OpenAiCompatible {
    pub fn new(settings: ProviderSettings, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .with_context(|| format!("Failed to create HTTP client for {}", settings.config.id))?;
        Ok(Self {
            config: settings.config,
            api_key: settings.api_key,
            client,
            timeout,
            metrics: MetricsRecorder::new(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn transport_error(&self, error: reqwest::Error) -> ProviderError {
        if error.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else {
            ProviderError::Transport(error.to_string())
        }
    }

    async fn complete(&self, request: ProviderRequest) -> ProviderResult<ProviderResponse> {
        let start = Instant::now();
        let body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": request.prompt}
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature
        });

        let response = self
            .authorized(self.client.post(self.endpoint("chat/completions")))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after, &body));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        let (content, model, usage) = parse_completion(&payload, &self.config.model)?;

        Ok(ProviderResponse {
            cost: list_cost(&self.config.pricing, &usage),
            content,
            model,
            usage,
            response_time_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl Provider for OpenAiCompatible {
    fn id(&self) -> ProviderId {
        self.config.id.clone()
    }

    async fn submit(&self, request: ProviderRequest) -> ProviderResult<ProviderResponse> {
        let result = self.complete(request).await;
        match &result {
            Ok(response) => {
                self.metrics
                    .record_success(response.response_time_ms, response.cost);
            }
            Err(e) => {
                debug!(provider = %self.config.id, error = %e, "Completion failed");
                self.metrics.record_failure();
            }
        }
        result
    }

    async fn health_check(&self) -> bool {
        let probe = self.authorized(self.client.get(self.endpoint("models")));
        matches!(probe.send().await, Ok(r) if r.status().is_success())
    }

    fn metrics(&self) -> ProviderMetrics {
        self.metrics.snapshot()
    }
}

/// Build one adapter per configured provider.
pub fn build_adapters(
    providers: &[ProviderSettings],
    timeout: Duration,
) -> Result<Vec<Arc<dyn Provider>>> {
    providers
        .iter()
        .map(|p| {
            let adapter = OpenAiCompatible::new(p.clone(), timeout)?;
            Ok(Arc::new(adapter) as Arc<dyn Provider>)
        })
        .collect()
}

/// Map a non-success HTTP status to a provider error.
fn status_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        s if s.is_client_error() => ProviderError::InvalidResponse(detail),
        _ => ProviderError::Transport(detail),
    }
}

/// Pull content, model, and token usage out of a completion payload.
fn parse_completion(payload: &Value, default_model: &str) -> ProviderResult<(String, String, Usage)> {
    let content = payload["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| ProviderError::InvalidResponse("missing choices[0].message.content".into()))?
        .to_string();
    let model = payload["model"]
        .as_str()
        .unwrap_or(default_model)
        .to_string();
    let tokens = |key: &str| {
        let count = payload["usage"][key].as_u64().unwrap_or(0);
        u32::try_from(count).unwrap_or(u32::MAX)
    };
    let usage = Usage {
        prompt_tokens: tokens("prompt_tokens"),
        completion_tokens: tokens("completion_tokens"),
    };
    Ok((content, model, usage))
}

/// List-price cost of a call; volume discounts are applied by the router.
fn list_cost(pricing: &PricingConfig, usage: &Usage) -> f64 {
    pricing.input_per_1k * usage.prompt_tokens as f64 / 1_000.0
        + pricing.output_per_1k * usage.completion_tokens as f64 / 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, None, "bad key"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, None, ""),
            ProviderError::Auth(_)
        ));
        assert_eq!(
            status_error(
                StatusCode::TOO_MANY_REQUESTS,
                Some(Duration::from_secs(7)),
                ""
            ),
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, None, "context too long"),
            ProviderError::InvalidResponse(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, None, ""),
            ProviderError::Transport(_)
        ));
    }

    #[test]
    fn test_parse_completion() {
        let payload = json!({
            "model": "gpt-4o-2024-08-06",
            "choices": [{"message": {"role": "assistant", "content": "{\"action\": \"BUY\"}"}}],
            "usage": {"prompt_tokens": 120, "completion_tokens": 40}
        });
        let (content, model, usage) = parse_completion(&payload, "gpt-4o").unwrap();
        assert_eq!(content, "{\"action\": \"BUY\"}");
        assert_eq!(model, "gpt-4o-2024-08-06");
        assert_eq!(usage.prompt_tokens, 120);
        assert_eq!(usage.completion_tokens, 40);
    }

    #[test]
    fn test_parse_completion_saturates_oversized_usage() {
        let payload = json!({
            "choices": [{"message": {"content": "HOLD"}}],
            "usage": {"prompt_tokens": 5_000_000_000_u64, "completion_tokens": 7}
        });
        let (_, model, usage) = parse_completion(&payload, "fallback-model").unwrap();
        assert_eq!(model, "fallback-model");
        assert_eq!(usage.prompt_tokens, u32::MAX);
        assert_eq!(usage.completion_tokens, 7);
    }

    #[test]
    fn test_parse_completion_without_content() {
        let payload = json!({"choices": []});
        assert!(matches!(
            parse_completion(&payload, "m"),
            Err(ProviderError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_list_cost() {
        let pricing = PricingConfig {
            input_per_1k: 0.005,
            output_per_1k: 0.015,
            tiers: Vec::new(),
        };
        let usage = Usage {
            prompt_tokens: 1_000,
            completion_tokens: 2_000,
        };
        assert!((list_cost(&pricing, &usage) - 0.035).abs() < 1e-12);
    }

    #[test]
    fn test_endpoint_joins_paths() {
        let mut config = ProviderConfig::new("local");
        config.base_url = "http://localhost:8000/v1/".into();
        let adapter = OpenAiCompatible::new(
            ProviderSettings {
                config,
                api_key: None,
            },
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            adapter.endpoint("chat/completions"),
            "http://localhost:8000/v1/chat/completions"
        );
        assert_eq!(adapter.id().as_str(), "local");
    }
}
