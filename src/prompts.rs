//! Prompt templates for the generator and reviewer models.

use crate::schema::SchemaDescriptor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Line prefix that carries the user's question in every prompt.
pub const QUESTION_MARKER: &str = "Question:";
/// Line prefix that carries the candidate statement in the reviewer prompt.
pub const SQL_MARKER: &str = "SQL:";

/// A prior exchange in the same conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub question: String,
    #[serde(default)]
    pub sql: Option<String>,
}

/// Input to one `ask`. Consumed by the pipeline, never stored.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub question: String,
    pub schema: Arc<SchemaDescriptor>,
    pub history: Vec<Turn>,
}

impl GenerationRequest {
    pub fn new(question: impl Into<String>, schema: Arc<SchemaDescriptor>) -> Self {
        Self {
            question: question.into(),
            schema,
            history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.history = history;
        self
    }
}

/// Why the previous generation attempt was thrown away.
#[derive(Debug, Clone, Default)]
pub struct Correction {
    pub previous_sql: Option<String>,
    pub reasons: Vec<String>,
}

pub fn generator_prompt(request: &GenerationRequest, correction: Option<&Correction>) -> String {
    let mut prompt = format!(
        "You are a SQL expert. Convert this business question to a single read-only SQL SELECT query. \
         Use only the tables and columns in the schema. Output ONLY the SQL query.\n\
         Schema: {}\n",
        request.schema.prompt_text()
    );

    if !request.history.is_empty() {
        prompt.push_str("Earlier in this conversation:\n");
        for turn in &request.history {
            prompt.push_str(&format!("- Q: {}\n", one_line(&turn.question)));
            if let Some(ref sql) = turn.sql {
                prompt.push_str(&format!("  SQL: {}\n", one_line(sql)));
            }
        }
    }

    if let Some(correction) = correction {
        prompt.push_str("Your previous answer was rejected.\n");
        if let Some(ref sql) = correction.previous_sql {
            prompt.push_str(&format!("Previous SQL: {}\n", one_line(sql)));
        }
        prompt.push_str("Problems:\n");
        for reason in &correction.reasons {
            prompt.push_str(&format!("- {}\n", reason));
        }
        prompt.push_str("Return a corrected query that avoids every problem above.\n");
    }

    prompt.push_str(&format!("{} {}\n{}", QUESTION_MARKER, one_line(&request.question), SQL_MARKER));
    prompt
}

pub fn reviewer_prompt(question: &str, schema: &SchemaDescriptor, sql: &str) -> String {
    format!(
        r#"Review this SQL for the question and schema. Check that it answers the question, uses only schema columns, and is read-only.
Output JSON: {{"reasoning": "your analysis", "ok": true/false, "fixed_sql": "corrected SQL or empty"}}.
Schema: {}
{} {}
{} {}
JSON:"#,
        schema.prompt_text(),
        QUESTION_MARKER,
        one_line(question),
        SQL_MARKER,
        one_line(sql)
    )
}

/// Pull the question back out of a prompt built by this module.
pub fn question_from_prompt(prompt: &str) -> Option<&str> {
    prompt
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(QUESTION_MARKER))
        .map(str::trim)
}

/// Pull the candidate statement back out of a reviewer prompt.
pub fn sql_from_prompt(prompt: &str) -> Option<&str> {
    prompt
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(SQL_MARKER))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
