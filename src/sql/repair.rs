//! Deterministic repairs applied to a candidate before validation.
//!
//! Small models regularly emit `SELECT SUM(revenue) WHERE ...` with the
//! FROM clause missing entirely. When the catalog has exactly one table there
//! is only one thing they could have meant.

use super::CandidateSql;
use crate::schema::SchemaDescriptor;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref FROM_KEYWORD: Regex = Regex::new(r"(?i)\bfrom\b").unwrap();
    static ref CLAUSE_START: Regex =
        Regex::new(r"(?i)\b(where|group\s+by|order\s+by|having|limit)\b").unwrap();
    static ref WORD: Regex = Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap();
}

/// Apply every applicable repair, returning the (possibly rewritten)
/// candidate and a note for each fix that was made.
pub fn apply_fallbacks(candidate: CandidateSql, schema: &SchemaDescriptor) -> (CandidateSql, Vec<String>) {
    let mut notes = Vec::new();
    let candidate = match insert_missing_from(&candidate, schema) {
        Some(fixed) => {
            notes.push(format!(
                "inserted missing FROM clause: `{}`",
                fixed.executable_text()
            ));
            fixed
        }
        None => candidate,
    };
    (candidate, notes)
}

fn insert_missing_from(candidate: &CandidateSql, schema: &SchemaDescriptor) -> Option<CandidateSql> {
    let table = schema.sole_table()?;
    let sql = candidate.executable_text();
    let code = blank_literals(sql);

    if FROM_KEYWORD.is_match(&code) {
        return None;
    }
    if WORD.find_iter(&code).any(|w| schema.has_table(w.as_str())) {
        return None;
    }

    let cut = CLAUSE_START.find(&code).map(|m| m.start()).unwrap_or(sql.len());
    let head = sql[..cut].trim_end();
    let tail = sql[cut..].trim_start();
    let fixed = if tail.is_empty() {
        format!("{} FROM {}", head, table.name)
    } else {
        format!("{} FROM {} {}", head, table.name, tail)
    };
    Some(CandidateSql::new(fixed, candidate.source))
}

/// Replace the contents of quoted literals and identifiers with spaces so
/// keyword searches only see code. Byte offsets are preserved.
fn blank_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    for c in sql.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                out.push(c);
            }
            Some(_) => {
                for _ in 0..c.len_utf8() {
                    out.push(' ');
                }
            }
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }
    out
}
