//! Hosted inference backends
//!
//! One HTTP request per call; retry policy lives in the gateway. Each call
//! reports whether a failure is worth retrying.

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;

const MAX_NEW_TOKENS: u32 = 512;
const TEMPERATURE: f64 = 0.1;

/// Outcome of a single failed request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AttemptError {
    /// 5xx, 429, 408 or a connection failure.
    Transient {
        detail: String,
        retry_after: Option<Duration>,
    },
    /// Anything a retry cannot fix.
    Permanent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flavor {
    HuggingFace,
    Fireworks,
}

impl Flavor {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Flavor::HuggingFace => "huggingface",
            Flavor::Fireworks => "fireworks",
        }
    }
}

pub(crate) struct HttpBackend {
    flavor: Flavor,
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub(crate) fn new(flavor: Flavor, endpoint: String, api_key: Option<String>) -> Self {
        Self {
            flavor,
            client: Client::new(),
            endpoint,
            api_key,
        }
    }

    pub(crate) fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub(crate) async fn complete(&self, model: &str, prompt: &str) -> Result<String, AttemptError> {
        let request = match self.flavor {
            // POST {endpoint}/{model}
            Flavor::HuggingFace => self
                .client
                .post(format!("{}/{}", self.endpoint, model))
                .json(&serde_json::json!({
                    "inputs": prompt,
                    "parameters": {
                        "max_new_tokens": MAX_NEW_TOKENS,
                        "temperature": TEMPERATURE,
                        "return_full_text": false
                    }
                })),
            Flavor::Fireworks => self.client.post(&self.endpoint).json(&serde_json::json!({
                "model": model,
                "prompt": prompt,
                "max_tokens": MAX_NEW_TOKENS,
                "temperature": TEMPERATURE
            })),
        };
        let request = match self.api_key {
            Some(ref key) => request.bearer_auth(key),
            None => request,
        };

        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() || e.is_request() {
                AttemptError::Transient {
                    detail: format!("{} request failed: {}", self.flavor.name(), e),
                    retry_after: None,
                }
            } else {
                AttemptError::Permanent(format!("{} request failed: {}", self.flavor.name(), e))
            }
        })?;

        let response = check_status(self.flavor, response).await?;
        let body: Value = response.json().await.map_err(|e| {
            AttemptError::Permanent(format!("{} returned a non-JSON body: {}", self.flavor.name(), e))
        })?;

        let text = match self.flavor {
            Flavor::HuggingFace => huggingface_text(&body),
            Flavor::Fireworks => fireworks_text(&body),
        };
        text.map(str::to_string).ok_or_else(|| {
            AttemptError::Permanent(format!(
                "unexpected {} response shape: {}",
                self.flavor.name(),
                truncate(&body.to_string(), 200)
            ))
        })
    }
}

async fn check_status(flavor: Flavor, response: Response) -> Result<Response, AttemptError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = parse_retry_after(&response);
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{} returned {}: {}", flavor.name(), status, truncate(&body, 200));
    if is_transient(status) {
        Err(AttemptError::Transient { detail, retry_after })
    } else {
        Err(AttemptError::Permanent(detail))
    }
}

pub(crate) fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// `[{"generated_text": ...}]` or a bare `{"generated_text": ...}`.
fn huggingface_text(body: &Value) -> Option<&str> {
    match body {
        Value::Array(items) => items.first()?.get("generated_text")?.as_str(),
        Value::Object(_) => body.get("generated_text")?.as_str(),
        _ => None,
    }
}

/// Completions API (`choices[0].text`) or the older inference API (`results[0].text`).
fn fireworks_text(body: &Value) -> Option<&str> {
    ["choices", "results"]
        .iter()
        .find_map(|key| body.get(*key)?.get(0)?.get("text")?.as_str())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn huggingface_shapes() {
        assert_eq!(
            huggingface_text(&json!([{"generated_text": "SELECT 1"}])),
            Some("SELECT 1")
        );
        assert_eq!(huggingface_text(&json!({"generated_text": "x"})), Some("x"));
        assert_eq!(huggingface_text(&json!({"error": "loading"})), None);
        assert_eq!(huggingface_text(&json!([])), None);
    }

    #[test]
    fn fireworks_shapes() {
        assert_eq!(fireworks_text(&json!({"choices": [{"text": "a"}]})), Some("a"));
        assert_eq!(fireworks_text(&json!({"results": [{"text": "b"}]})), Some("b"));
        assert_eq!(fireworks_text(&json!({"choices": []})), None);
    }

    #[test]
    fn transient_statuses() {
        assert!(is_transient(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_transient(StatusCode::UNAUTHORIZED));
        assert!(!is_transient(StatusCode::UNPROCESSABLE_ENTITY));
    }
}
