//! Runtime configuration
//!
//! Everything is read from the environment (a `.env` file is honoured by the
//! binaries through `dotenv`). `from_lookup` exists so tests can feed
//! variables without touching the process environment.

use crate::error::ConfigError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_HF_ENDPOINT: &str = "https://api-inference.huggingface.co/models";
pub const DEFAULT_FIREWORKS_ENDPOINT: &str = "https://api.fireworks.ai/inference/v1/completions";
pub const DEFAULT_GENERATOR_MODEL: &str = "defog/sqlcoder-7b-2";
pub const DEFAULT_REVIEWER_MODEL: &str = "mistralai/Mistral-7B-Instruct-v0.2";

/// Inference backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    HuggingFace,
    Fireworks,
    /// Deterministic, credential-free backend.
    Offline,
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hf" | "huggingface" => Ok(Provider::HuggingFace),
            "fireworks" | "fw" => Ok(Provider::Fireworks),
            "offline" | "local" => Ok(Provider::Offline),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Provider::HuggingFace => "hf",
            Provider::Fireworks => "fireworks",
            Provider::Offline => "offline",
        })
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: Provider,
    pub generator_model: String,
    pub reviewer_model: String,
    pub api_key: Option<String>,
    pub endpoint: String,
    pub timeout: Duration,
    /// Base delay before the single retry of a transient failure.
    pub retry_backoff: Duration,
    /// Upper bound applied to a server-provided Retry-After.
    pub max_retry_after: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub data_dir: PathBuf,
    pub schema_path: Option<PathBuf>,
    pub row_limit: usize,
    pub query_timeout: Duration,
    pub bind_addr: String,
    pub review_enabled: bool,
    /// Engine jobs allowed in flight at once.
    pub max_concurrent_queries: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let hf_key = get("HF_API_KEY");
        let fireworks_key = get("FIREWORKS_API_KEY");

        // With no provider and no credential there is nothing to call: run offline.
        let provider = match get("LLM_PROVIDER") {
            Some(p) => p.parse()?,
            None if hf_key.is_none() && fireworks_key.is_none() => Provider::Offline,
            None if hf_key.is_none() => Provider::Fireworks,
            None => Provider::HuggingFace,
        };

        let (api_key, endpoint) = match provider {
            Provider::HuggingFace => (
                hf_key,
                get("HF_ENDPOINT").unwrap_or_else(|| DEFAULT_HF_ENDPOINT.to_string()),
            ),
            Provider::Fireworks => (
                fireworks_key,
                get("FIREWORKS_ENDPOINT").unwrap_or_else(|| DEFAULT_FIREWORKS_ENDPOINT.to_string()),
            ),
            Provider::Offline => (None, String::new()),
        };

        let llm = LlmConfig {
            provider,
            generator_model: get("LLM_MODEL_GEN").unwrap_or_else(|| DEFAULT_GENERATOR_MODEL.to_string()),
            reviewer_model: get("LLM_MODEL_REV").unwrap_or_else(|| DEFAULT_REVIEWER_MODEL.to_string()),
            api_key,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(parse_or(&get, "LLM_TIMEOUT_SECS", 20)?),
            retry_backoff: Duration::from_millis(parse_or(&get, "LLM_RETRY_BACKOFF_MS", 500)?),
            max_retry_after: Duration::from_secs(5),
        };

        let row_limit: usize = parse_or(&get, "ROW_LIMIT", 200)?;
        if row_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ROW_LIMIT".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let max_concurrent_queries: usize = parse_or(&get, "MAX_CONCURRENT_QUERIES", 4)?;
        if max_concurrent_queries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_CONCURRENT_QUERIES".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            llm,
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("data")),
            schema_path: get("SCHEMA_PATH").map(PathBuf::from),
            row_limit,
            query_timeout: Duration::from_secs(parse_or(&get, "QUERY_TIMEOUT_SECS", 10)?),
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            review_enabled: parse_or(&get, "REVIEW_ENABLED", true)?,
            max_concurrent_queries,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_credentials_are_offline() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.llm.provider, Provider::Offline);
        assert_eq!(cfg.llm.timeout, Duration::from_secs(20));
        assert_eq!(cfg.row_limit, 200);
        assert_eq!(cfg.data_dir, PathBuf::from("data"));
        assert!(cfg.review_enabled);
        assert_eq!(cfg.max_concurrent_queries, 4);
        assert_ne!(cfg.llm.generator_model, cfg.llm.reviewer_model);
    }

    #[test]
    fn credential_selects_provider_and_endpoint() {
        let cfg = config(&[("HF_API_KEY", "hf_123"), ("LLM_MODEL_GEN", "gen"), ("LLM_MODEL_REV", "rev")]).unwrap();
        assert_eq!(cfg.llm.provider, Provider::HuggingFace);
        assert_eq!(cfg.llm.api_key.as_deref(), Some("hf_123"));
        assert_eq!(cfg.llm.endpoint, DEFAULT_HF_ENDPOINT);
        assert_eq!(cfg.llm.generator_model, "gen");

        let cfg = config(&[
            ("LLM_PROVIDER", "Fireworks"),
            ("FIREWORKS_API_KEY", "fw"),
            ("FIREWORKS_ENDPOINT", "http://localhost:9000/v1/completions/"),
        ])
        .unwrap();
        assert_eq!(cfg.llm.provider, Provider::Fireworks);
        assert_eq!(cfg.llm.endpoint, "http://localhost:9000/v1/completions");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            config(&[("LLM_PROVIDER", "openai")]),
            Err(ConfigError::UnknownProvider(p)) if p == "openai"
        ));
        assert!(matches!(
            config(&[("ROW_LIMIT", "lots")]),
            Err(ConfigError::InvalidValue { key, .. }) if key == "ROW_LIMIT"
        ));
        assert!(config(&[("ROW_LIMIT", "0")]).is_err());
        assert!(config(&[("REVIEW_ENABLED", "maybe")]).is_err());
        assert!(config(&[("MAX_CONCURRENT_QUERIES", "0")]).is_err());
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let cfg = config(&[("LLM_PROVIDER", "  "), ("ROW_LIMIT", "")]).unwrap();
        assert_eq!(cfg.llm.provider, Provider::Offline);
        assert_eq!(cfg.row_limit, 200);
    }
}
