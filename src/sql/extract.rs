//! SQL Extractor
//!
//! Turns raw model output into exactly one candidate statement.

use super::{skip_comments, top_level_terminators, CandidateSource, CandidateSql};
use crate::error::ExtractionError;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // ```lang\n body ``` ; closing fence optional for truncated completions
    static ref FENCE: Regex =
        Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+-]*)[^\n]*\n(.*?)(?:```|\z)").unwrap();
    static ref QUERY_START: Regex = Regex::new(r"(?i)^(select|with)\b").unwrap();
    static ref STATEMENT_START: Regex = Regex::new(
        r"(?i)^(select|with|insert|update|delete|drop|alter|create|attach|detach|copy|pragma|merge|truncate|grant|revoke|vacuum|install|load|set|explain|show|describe)\b"
    )
    .unwrap();
    static ref LABEL: Regex = Regex::new(r"(?i)^\s*(sql|query|answer)\s*:\s*").unwrap();
}

const SQL_FENCE_TAGS: &[&str] = &["", "sql", "duckdb", "sqlite", "postgres", "postgresql", "psql", "mysql"];

/// Extract a single candidate statement from model output.
pub fn extract(raw_text: &str) -> Result<CandidateSql, ExtractionError> {
    extract_as(raw_text, CandidateSource::Generated)
}

pub fn extract_as(raw_text: &str, source: CandidateSource) -> Result<CandidateSql, ExtractionError> {
    let body = locate(raw_text).ok_or(ExtractionError::NoStatementFound)?;
    let statement = single_statement(body)?;
    if statement.is_empty() {
        return Err(ExtractionError::NoStatementFound);
    }
    Ok(CandidateSql::new(statement, source))
}

fn locate(raw_text: &str) -> Option<&str> {
    for caps in FENCE.captures_iter(raw_text) {
        let tag = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let body = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
        if !body.is_empty() && SQL_FENCE_TAGS.contains(&tag.to_lowercase().as_str()) {
            return Some(body);
        }
    }

    let trimmed = raw_text.trim();
    let unlabeled = match LABEL.find(trimmed) {
        Some(m) => trimmed[m.end()..].trim(),
        None => trimmed,
    };
    if QUERY_START.is_match(skip_comments(unlabeled)) {
        return Some(unlabeled);
    }

    // Prose followed by a query: take the first line that opens one, up to a blank line.
    let mut offset = 0;
    for line in trimmed.split_inclusive('\n') {
        let candidate = LABEL
            .find(line)
            .map(|m| &line[m.end()..])
            .unwrap_or(line)
            .trim_start();
        if QUERY_START.is_match(candidate) {
            let start = offset + (line.len() - line.trim_start().len());
            let start = start + LABEL.find(line.trim_start()).map(|m| m.end()).unwrap_or(0);
            let rest = &trimmed[start..];
            let end = rest.find("\n\n").or_else(|| rest.find("\r\n\r\n")).unwrap_or(rest.len());
            return Some(rest[..end].trim());
        }
        offset += line.len();
    }
    None
}

/// Reject text holding more than one statement; drop prose that trails a terminator.
fn single_statement(body: &str) -> Result<&str, ExtractionError> {
    let Some(&pos) = top_level_terminators(body).first() else {
        return Ok(body.trim());
    };
    let rest = skip_comments(&body[pos + 1..]);
    if rest.is_empty() {
        Ok(body.trim())
    } else if STATEMENT_START.is_match(rest) {
        Err(ExtractionError::MultipleStatements)
    } else {
        Ok(body[..=pos].trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_block_is_returned_trimmed_and_unchanged() {
        let raw = "Here is the query you asked for:\n\n```sql\n  SELECT product_title, SUM(revenue) AS total\nFROM daily_product_sales\nGROUP BY product_title;  \n```\nIt sums revenue per product.";
        let candidate = extract(raw).unwrap();
        assert_eq!(
            candidate.raw_text,
            "SELECT product_title, SUM(revenue) AS total\nFROM daily_product_sales\nGROUP BY product_title;"
        );
        assert_eq!(candidate.source, CandidateSource::Generated);
    }

    #[test]
    fn non_sql_fences_are_skipped() {
        let raw = "```json\n{\"a\": 1}\n```\n```\nselect 1\n```";
        assert_eq!(extract(raw).unwrap().raw_text, "select 1");
    }

    #[test]
    fn unterminated_fence_is_still_used() {
        let raw = "```sql\nSELECT units FROM daily_product_sales";
        assert_eq!(extract(raw).unwrap().raw_text, "SELECT units FROM daily_product_sales");
    }

    #[test]
    fn plain_text_query_with_label() {
        let raw = "  SQL: with t as (select 1) select * from t  ";
        assert_eq!(extract(raw).unwrap().raw_text, "with t as (select 1) select * from t");
    }

    #[test]
    fn query_after_prose_stops_at_blank_line() {
        let raw = "Sure! The answer is:\nSELECT category, SUM(units)\nFROM daily_product_sales\nGROUP BY category\n\nThis groups by category.";
        assert_eq!(
            extract(raw).unwrap().raw_text,
            "SELECT category, SUM(units)\nFROM daily_product_sales\nGROUP BY category"
        );
    }

    #[test]
    fn no_keyword_means_no_statement() {
        assert_eq!(
            extract("I cannot answer that question with the available data."),
            Err(ExtractionError::NoStatementFound)
        );
        assert_eq!(extract("   "), Err(ExtractionError::NoStatementFound));
        assert_eq!(extract("```sql\n\n```"), Err(ExtractionError::NoStatementFound));
    }

    #[test]
    fn two_statements_are_rejected() {
        assert_eq!(
            extract("SELECT 1; SELECT 2"),
            Err(ExtractionError::MultipleStatements)
        );
        assert_eq!(
            extract("```sql\nSELECT * FROM t;\nDROP TABLE t;\n```"),
            Err(ExtractionError::MultipleStatements)
        );
    }

    #[test]
    fn prose_after_terminator_is_dropped() {
        let raw = "SELECT units FROM daily_product_sales; This returns units.";
        assert_eq!(extract(raw).unwrap().raw_text, "SELECT units FROM daily_product_sales;");
    }

    #[test]
    fn semicolons_inside_literals_do_not_split() {
        let raw = "SELECT * FROM daily_product_sales WHERE product_title = 'a;b'";
        assert_eq!(extract(raw).unwrap().raw_text, raw);
    }

    #[test]
    fn fenced_mutation_is_still_a_candidate() {
        let raw = "```sql\nDELETE FROM daily_product_sales\n```";
        assert_eq!(extract(raw).unwrap().raw_text, "DELETE FROM daily_product_sales");
    }
}
