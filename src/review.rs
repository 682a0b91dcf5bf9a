//! Review Engine
//!
//! Asks the reviewer model to critique a candidate and turns its answer into
//! a `ReviewVerdict`. A replacement statement is only kept if it survives the
//! same extraction and validation as a generated one.

use crate::error::GatewayError;
use crate::llm::{ModelRole, TextGenerator};
use crate::prompts::reviewer_prompt;
use crate::schema::SchemaDescriptor;
use crate::sql::extract::extract_as;
use crate::sql::{validate, CandidateSource, CandidateSql};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

lazy_static! {
    static ref JSON_OBJECT: Regex = Regex::new(r"(?s)\{.*\}").unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_sql: Option<CandidateSql>,
    pub comments: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewerReply {
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default, deserialize_with = "loose_bool")]
    ok: Option<bool>,
    #[serde(default)]
    fixed_sql: Option<String>,
}

/// Reviewers write `true`, `"true"`, `"yes"`...
fn loose_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Bool(b)) => Some(b),
        Some(serde_json::Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "ok" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

pub struct ReviewEngine {
    generator: Arc<dyn TextGenerator>,
    schema: Arc<SchemaDescriptor>,
}

impl ReviewEngine {
    pub fn new(generator: Arc<dyn TextGenerator>, schema: Arc<SchemaDescriptor>) -> Self {
        Self { generator, schema }
    }

    /// One reviewer call. Gateway failures are returned so the caller can
    /// decide they are advisory.
    pub async fn review(&self, candidate: &CandidateSql, question: &str) -> Result<ReviewVerdict, GatewayError> {
        let prompt = reviewer_prompt(question, &self.schema, candidate.executable_text());
        let raw = self.generator.generate(&prompt, ModelRole::Reviewer).await?;
        let verdict = interpret(&raw, candidate, &self.schema);
        info!(
            "Review {} ({} comment(s), revision: {})",
            if verdict.accepted { "accepted" } else { "rejected" },
            verdict.comments.len(),
            verdict.revised_sql.is_some()
        );
        Ok(verdict)
    }
}

/// Turn raw reviewer output into a verdict.
pub fn interpret(raw: &str, original: &CandidateSql, schema: &SchemaDescriptor) -> ReviewVerdict {
    let reply = JSON_OBJECT
        .find(raw)
        .and_then(|m| serde_json::from_str::<ReviewerReply>(m.as_str()).ok())
        .filter(|r| r.ok.is_some() || r.reasoning.is_some() || r.fixed_sql.is_some());

    let Some(reply) = reply else {
        debug!("Reviewer output is not the expected JSON");
        let mut comments = Vec::new();
        if !raw.trim().is_empty() {
            comments.push(raw.trim().to_string());
        }
        // A fenced block in free text is still a proposed fix.
        let revised = if raw.contains("```") {
            accept_revision(raw, original, schema, &mut comments)
        } else {
            None
        };
        return ReviewVerdict {
            accepted: false,
            revised_sql: revised,
            comments,
        };
    };

    let mut comments = Vec::new();
    if let Some(reasoning) = reply.reasoning.filter(|r| !r.trim().is_empty()) {
        comments.push(reasoning.trim().to_string());
    }
    let revised = match reply.fixed_sql {
        Some(ref text) if !text.trim().is_empty() => accept_revision(text, original, schema, &mut comments),
        _ => None,
    };

    ReviewVerdict {
        accepted: reply.ok.unwrap_or(false),
        revised_sql: revised,
        comments,
    }
}

fn accept_revision(
    text: &str,
    original: &CandidateSql,
    schema: &SchemaDescriptor,
    comments: &mut Vec<String>,
) -> Option<CandidateSql> {
    let revised = match extract_as(text, CandidateSource::ReviewerRevised) {
        Ok(c) => c,
        Err(e) => {
            comments.push(format!("Reviewer fix ignored: {}", e));
            return None;
        }
    };
    if revised.same_statement_as(original) {
        return None;
    }
    let verdict = validate(&revised, schema);
    if verdict.passed {
        Some(revised)
    } else {
        let reasons: Vec<String> = verdict.violations.iter().map(|v| v.to_string()).collect();
        comments.push(format!("Reviewer fix ignored: {}", reasons.join("; ")));
        None
    }
}
