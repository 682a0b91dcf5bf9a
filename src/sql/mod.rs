//! SQL handling: extraction from model output, static validation, and the
//! deterministic repairs applied before validation.

pub mod extract;
pub mod repair;
pub mod validate;

use serde::{Deserialize, Serialize};
use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

pub use extract::extract;
pub use repair::apply_fallbacks;
pub use validate::{validate, ValidationVerdict, Violation, ViolationKind};

/// Where a candidate statement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Generated,
    ReviewerRevised,
    /// Supplied verbatim by the caller (`execute`/`review` entry points).
    UserSupplied,
}

/// A single SQL statement that has not yet been proven valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSql {
    pub raw_text: String,
    pub source: CandidateSource,
}

impl CandidateSql {
    pub fn new(raw_text: impl Into<String>, source: CandidateSource) -> Self {
        Self {
            raw_text: raw_text.into(),
            source,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw_text
    }

    /// Statement text without a trailing terminator, as handed to the engine.
    pub fn executable_text(&self) -> &str {
        self.raw_text.trim().trim_end_matches(';').trim_end()
    }

    /// Token-level comparison used to detect no-op revisions. Whitespace and
    /// the case of unquoted words are ignored; literals compare exactly.
    pub fn same_statement_as(&self, other: &CandidateSql) -> bool {
        normalize(self.executable_text()) == normalize(other.executable_text())
    }
}

fn normalize(sql: &str) -> Vec<String> {
    match Tokenizer::new(&GenericDialect {}, sql).tokenize() {
        Ok(tokens) => tokens
            .iter()
            .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
            .map(|t| match t {
                Token::Word(w) if w.quote_style.is_none() => w.value.to_uppercase(),
                other => other.to_string(),
            })
            .collect(),
        Err(_) => sql.split_whitespace().map(str::to_string).collect(),
    }
}

/// Byte offsets of every `;` outside string literals, quoted identifiers and comments.
pub(crate) fn top_level_terminators(sql: &str) -> Vec<usize> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == quote {
                        // doubled quote is an escape
                        if i + 1 < bytes.len() && bytes[i + 1] == quote {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 1;
            }
            b';' => out.push(i),
            _ => {}
        }
        i += 1;
    }
    out
}

/// Strip leading whitespace and SQL comments.
pub(crate) fn skip_comments(mut text: &str) -> &str {
    loop {
        text = text.trim_start();
        if let Some(rest) = text.strip_prefix("--") {
            text = rest.find('\n').map(|p| &rest[p + 1..]).unwrap_or("");
        } else if let Some(rest) = text.strip_prefix("/*") {
            text = rest.find("*/").map(|p| &rest[p + 2..]).unwrap_or("");
        } else {
            return text;
        }
    }
}

const STATEMENT_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "ATTACH", "COPY",
    "PRAGMA", "MERGE", "TRUNCATE", "GRANT", "REVOKE", "VACUUM", "DETACH",
];

/// True when the text reads as a SQL statement rather than a question.
pub fn looks_like_sql(text: &str) -> bool {
    let text = skip_comments(text).trim_start_matches('(');
    let keyword = leading_keyword(text);
    STATEMENT_KEYWORDS.contains(&keyword.as_str())
        && text[keyword.len()..]
            .chars()
            .next()
            .map_or(true, |c| c.is_whitespace() || c == '*' || c == '(')
}

/// First word of the statement, uppercased.
pub(crate) fn leading_keyword(sql: &str) -> String {
    skip_comments(sql)
        .trim_start_matches('(')
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_uppercase()
}
