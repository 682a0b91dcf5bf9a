//! Model Gateway
//!
//! A single `generate(prompt, role)` entry point over the configured
//! inference backend. The backend is chosen once at startup; the model is
//! chosen per call from the role.

pub mod backend;
pub mod offline;

use crate::config::{LlmConfig, Provider};
use crate::error::GatewayError;
use async_trait::async_trait;
use backend::{AttemptError, Flavor, HttpBackend};
use offline::OfflineModel;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Generator,
    Reviewer,
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ModelRole::Generator => "generator",
            ModelRole::Reviewer => "reviewer",
        })
    }
}

/// Anything that can turn a prompt into text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, role: ModelRole) -> Result<String, GatewayError>;

    /// Short label for logs and `/health`.
    fn describe(&self) -> String {
        "text-generator".to_string()
    }
}

enum Backend {
    HuggingFace(HttpBackend),
    Fireworks(HttpBackend),
    Offline(OfflineModel),
}

pub struct ModelGateway {
    backend: Backend,
    generator_model: String,
    reviewer_model: String,
    timeout: Duration,
    retry_backoff: Duration,
    max_retry_after: Duration,
}

impl ModelGateway {
    pub fn from_config(config: &LlmConfig) -> Self {
        let backend = match config.provider {
            Provider::HuggingFace => Backend::HuggingFace(HttpBackend::new(
                Flavor::HuggingFace,
                config.endpoint.clone(),
                config.api_key.clone(),
            )),
            Provider::Fireworks => Backend::Fireworks(HttpBackend::new(
                Flavor::Fireworks,
                config.endpoint.clone(),
                config.api_key.clone(),
            )),
            Provider::Offline => Backend::Offline(OfflineModel),
        };
        Self {
            backend,
            generator_model: config.generator_model.clone(),
            reviewer_model: config.reviewer_model.clone(),
            timeout: config.timeout,
            retry_backoff: config.retry_backoff,
            max_retry_after: config.max_retry_after,
        }
    }

    pub fn model_for(&self, role: ModelRole) -> &str {
        match role {
            ModelRole::Generator => &self.generator_model,
            ModelRole::Reviewer => &self.reviewer_model,
        }
    }

    /// Base backoff plus up to 50% jitter, or the server's Retry-After (capped).
    fn retry_delay(&self, retry_after: Option<Duration>) -> Duration {
        if let Some(requested) = retry_after {
            return requested.min(self.max_retry_after);
        }
        let base = self.retry_backoff.as_millis() as u64;
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..=base / 2)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    async fn call_http(&self, http: &HttpBackend, prompt: &str, role: ModelRole) -> Result<String, GatewayError> {
        let model = self.model_for(role);
        let mut retried = false;
        loop {
            let attempt = tokio::time::timeout(self.timeout, http.complete(model, prompt)).await;
            let (detail, retry_after) = match attempt {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(AttemptError::Permanent(detail))) => {
                    return Err(GatewayError::Rejected(detail));
                }
                Err(_) => {
                    return Err(GatewayError::Unavailable(format!(
                        "{} did not answer within {}s",
                        http.flavor().name(),
                        self.timeout.as_secs_f64()
                    )));
                }
                Ok(Err(AttemptError::Transient { detail, retry_after })) => (detail, retry_after),
            };

            if retried {
                return Err(GatewayError::Unavailable(detail));
            }
            retried = true;
            let delay = self.retry_delay(retry_after);
            warn!(
                "{} call for {} failed ({}), retrying once in {}ms",
                http.flavor().name(),
                role,
                detail,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl TextGenerator for ModelGateway {
    async fn generate(&self, prompt: &str, role: ModelRole) -> Result<String, GatewayError> {
        debug!("{} prompt ({} chars) -> {}", role, prompt.len(), self.model_for(role));
        let text = match &self.backend {
            Backend::HuggingFace(http) | Backend::Fireworks(http) => self.call_http(http, prompt, role).await?,
            Backend::Offline(model) => model.respond(prompt, role),
        };
        debug!("{} raw output: {}", role, text);
        Ok(text)
    }

    fn describe(&self) -> String {
        let provider = match self.backend {
            Backend::HuggingFace(_) => "hf",
            Backend::Fireworks(_) => "fireworks",
            Backend::Offline(_) => "offline",
        };
        format!(
            "{} (generator={}, reviewer={})",
            provider, self.generator_model, self.reviewer_model
        )
    }
}
