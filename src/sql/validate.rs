//! SQL Validator
//!
//! Static, name-based safety checks over the token stream of a candidate
//! statement. This is not a semantic parse: it answers "is this a single
//! read-only query that only names things the schema knows about".

use super::CandidateSql;
use crate::error::ErrorKind;
use crate::schema::SchemaDescriptor;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, Word};
use std::collections::HashSet;
use std::fmt;

/// Verbs that mutate state or reach outside the store.
const MUTATING_VERBS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "ATTACH", "COPY", "PRAGMA", "MERGE",
    "TRUNCATE", "GRANT", "REVOKE", "VACUUM", "DETACH",
];

/// Keywords that end a FROM list.
const CLAUSE_KEYWORDS: &[&str] = &[
    "SELECT", "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "UNION", "INTERSECT",
    "EXCEPT", "ON", "USING", "WINDOW", "QUALIFY", "FETCH",
];

/// Date-part words; bare only in `EXTRACT(part FROM ..)` or as an interval unit.
const DATE_PARTS: &[&str] = &[
    "YEAR", "QUARTER", "MONTH", "WEEK", "DAY", "DOW", "DOY", "ISODOW", "HOUR", "MINUTE",
    "SECOND", "EPOCH",
];

/// Keywords that may stand on their own inside a query body. Any other
/// unresolved word is treated as a column reference.
const EXPRESSION_KEYWORDS: &[&str] = &[
    "WITH", "RECURSIVE", "DISTINCT", "ALL", "AND", "OR", "NOT", "IN", "IS", "NULL", "LIKE",
    "ILIKE", "SIMILAR", "ESCAPE", "BETWEEN", "CASE", "WHEN", "THEN", "ELSE", "END", "BY", "ASC",
    "DESC", "NULLS", "FIRST", "LAST", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS",
    "NATURAL", "LATERAL", "OVER", "PARTITION", "ROWS", "RANGE", "UNBOUNDED", "PRECEDING",
    "FOLLOWING", "CURRENT", "ROW", "TRUE", "FALSE", "EXISTS", "ANY", "SOME", "FILTER", "WITHIN",
    "INTERVAL", "TOP", "NEXT", "ONLY", "TIES", "COLLATE", "AT", "ZONE", "PRECISION",
    "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "LOCALTIME", "LOCALTIMESTAMP",
];

/// Type names accepted as a cast target or in a typed literal (`DATE '2024-01-01'`).
const TYPE_NAMES: &[&str] = &[
    "DATE", "TIMESTAMP", "TIME", "INTERVAL", "INT", "INTEGER", "BIGINT", "SMALLINT", "TINYINT",
    "DOUBLE", "FLOAT", "REAL", "DECIMAL", "NUMERIC", "VARCHAR", "CHAR", "TEXT", "STRING",
    "BOOLEAN", "BOOL",
];

const SUGGESTION_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationKind {
    NotReadOnly,
    UnknownTable,
    UnknownColumn,
    MultiStatement,
    Malformed,
}

impl From<ViolationKind> for ErrorKind {
    fn from(kind: ViolationKind) -> Self {
        match kind {
            ViolationKind::NotReadOnly => ErrorKind::NotReadOnly,
            ViolationKind::UnknownTable => ErrorKind::UnknownTable,
            ViolationKind::UnknownColumn => ErrorKind::UnknownColumn,
            ViolationKind::MultiStatement => ErrorKind::MultiStatement,
            ViolationKind::Malformed => ErrorKind::Malformed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub detail: String,
}

impl Violation {
    fn new(kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub passed: bool,
    pub violations: Vec<Violation>,
}

impl ValidationVerdict {
    fn from_violations(mut violations: Vec<Violation>) -> Self {
        let mut seen = HashSet::new();
        violations.retain(|v| seen.insert(v.clone()));
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }

    pub fn into_result(self) -> std::result::Result<(), Vec<Violation>> {
        if self.passed {
            Ok(())
        } else {
            Err(self.violations)
        }
    }
}

/// Validate a candidate against the schema. Pure: identical inputs always
/// produce identical verdicts.
pub fn validate(candidate: &CandidateSql, schema: &SchemaDescriptor) -> ValidationVerdict {
    let dialect = GenericDialect {};
    let tokens = match Tokenizer::new(&dialect, candidate.as_str()).tokenize() {
        Ok(tokens) => tokens,
        Err(e) => {
            return ValidationVerdict::from_violations(vec![Violation::new(
                ViolationKind::Malformed,
                format!("statement could not be tokenized: {}", e),
            )])
        }
    };
    let sig: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
        .collect();
    if sig.is_empty() {
        return ValidationVerdict::from_violations(vec![Violation::new(
            ViolationKind::Malformed,
            "statement is empty",
        )]);
    }

    let mut violations = Vec::new();
    check_read_only(&sig, &mut violations);
    check_single_statement(&sig, &mut violations);

    // First pass learns CTE names and aliases, second pass reports.
    let mut names = Names::default();
    Scanner::new(&sig, schema, &mut names).run();
    violations.extend(Scanner::new(&sig, schema, &mut names).run());

    ValidationVerdict::from_violations(violations)
}

fn is_kw(token: &Token, keyword: &str) -> bool {
    matches!(token, Token::Word(w) if w.quote_style.is_none() && w.value.eq_ignore_ascii_case(keyword))
}

fn is_type_name(w: &Word) -> bool {
    w.quote_style.is_none() && TYPE_NAMES.iter().any(|t| w.value.eq_ignore_ascii_case(t))
}

fn check_read_only(sig: &[&Token], out: &mut Vec<Violation>) {
    let first = sig.iter().find(|t| !matches!(t, Token::LParen));
    let starts_with_query = first.map_or(false, |t| is_kw(t, "SELECT") || is_kw(t, "WITH"));
    if !starts_with_query {
        let found = first.map(|t| t.to_string()).unwrap_or_default();
        out.push(Violation::new(
            ViolationKind::NotReadOnly,
            format!("statement must begin with SELECT or WITH, found `{}`", found),
        ));
    }

    for token in sig {
        if let Token::Word(w) = token {
            if w.quote_style.is_none() {
                let upper = w.value.to_uppercase();
                if MUTATING_VERBS.contains(&upper.as_str()) {
                    out.push(Violation::new(
                        ViolationKind::NotReadOnly,
                        format!("`{}` is not allowed in a read-only query", upper),
                    ));
                }
            }
        }
    }
}

fn check_single_statement(sig: &[&Token], out: &mut Vec<Violation>) {
    if let Some(pos) = sig.iter().position(|t| matches!(t, Token::SemiColon)) {
        if sig[pos + 1..].iter().any(|t| !matches!(t, Token::SemiColon)) {
            out.push(Violation::new(
                ViolationKind::MultiStatement,
                "a statement terminator appears before the end of the text",
            ));
        }
    }
}

#[derive(Default)]
struct Names {
    /// CTE names
    relations: HashSet<String>,
    /// column and table aliases
    aliases: HashSet<String>,
}

#[derive(Default, Clone, Copy)]
struct Frame {
    function: bool,
    derived: bool,
    in_from: bool,
    expect_table: bool,
    after_table: bool,
}

struct Scanner<'a> {
    sig: &'a [&'a Token],
    schema: &'a SchemaDescriptor,
    names: &'a mut Names,
    frames: Vec<Frame>,
    violations: Vec<Violation>,
}

impl<'a> Scanner<'a> {
    fn new(sig: &'a [&'a Token], schema: &'a SchemaDescriptor, names: &'a mut Names) -> Self {
        Self {
            sig,
            schema,
            names,
            frames: vec![Frame::default()],
            violations: Vec::new(),
        }
    }

    fn run(mut self) -> Vec<Violation> {
        let mut i = 0;
        while i < self.sig.len() {
            i = self.step(i);
        }
        self.violations
    }

    fn frame(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn step(&mut self, i: usize) -> usize {
        let sig = self.sig;
        match sig[i] {
            Token::LParen => {
                let after_word = i > 0 && matches!(sig[i - 1], Token::Word(_));
                let opens_query = sig
                    .get(i + 1)
                    .map_or(false, |t| is_kw(t, "SELECT") || is_kw(t, "WITH"));
                let frame = self.frame();
                let derived = frame.expect_table;
                frame.expect_table = false;
                self.frames.push(Frame {
                    function: after_word && !opens_query,
                    derived,
                    ..Frame::default()
                });
                i + 1
            }
            Token::RParen => {
                if self.frames.len() > 1 {
                    if let Some(closed) = self.frames.pop() {
                        if closed.derived {
                            self.frame().after_table = true;
                        }
                    }
                }
                i + 1
            }
            Token::Comma => {
                let frame = self.frame();
                if frame.in_from {
                    frame.expect_table = true;
                    frame.after_table = false;
                }
                i + 1
            }
            // `expr::TYPE`
            Token::DoubleColon => match sig.get(i + 1) {
                Some(Token::Word(_)) => i + 2,
                _ => i + 1,
            },
            Token::Word(w) => self.word(i, w),
            _ => i + 1,
        }
    }

    fn word(&mut self, i: usize, w: &Word) -> usize {
        let sig = self.sig;
        let upper = w.value.to_uppercase();
        let lower = w.value.to_lowercase();
        let quoted = w.quote_style.is_some();
        let next = sig.get(i + 1).copied();

        if !quoted {
            match upper.as_str() {
                "FROM" => {
                    let frame = self.frame();
                    if !frame.function {
                        frame.in_from = true;
                        frame.expect_table = true;
                        frame.after_table = false;
                    }
                    return i + 1;
                }
                "JOIN" => {
                    let frame = self.frame();
                    frame.in_from = true;
                    frame.expect_table = true;
                    frame.after_table = false;
                    return i + 1;
                }
                "AS" => {
                    let in_function = self.frame().function;
                    self.frame().after_table = false;
                    if let Some(Token::Word(target)) = next {
                        // CAST(expr AS TYPE)
                        if in_function && is_type_name(target) {
                            return i + 2;
                        }
                    }
                    if let Some(Token::Word(alias)) = next {
                        self.names.aliases.insert(alias.value.to_lowercase());
                        return i + 2;
                    }
                    return i + 1;
                }
                u if CLAUSE_KEYWORDS.contains(&u) => {
                    let frame = self.frame();
                    frame.in_from = false;
                    frame.expect_table = false;
                    frame.after_table = false;
                    return i + 1;
                }
                _ => {}
            }
        }

        // name AS ( ... ) introduces a CTE
        if next.map_or(false, |t| is_kw(t, "AS"))
            && matches!(sig.get(i + 2), Some(Token::LParen))
        {
            self.names.relations.insert(lower);
            return i + 1;
        }

        if self.frame().expect_table {
            return self.table_reference(i, w);
        }

        if self.frame().after_table {
            self.frame().after_table = false;
            if quoted || w.keyword == Keyword::NoKeyword {
                self.names.aliases.insert(lower);
            }
            return i + 1;
        }

        if matches!(next, Some(Token::LParen)) {
            // function call
            return i + 1;
        }

        if matches!(next, Some(Token::Period)) {
            if !self.is_relation(&lower) && !self.names.aliases.contains(&lower) {
                self.report(
                    ViolationKind::UnknownTable,
                    format!("unknown table or alias `{}`", w.value),
                );
            }
            return match sig.get(i + 2) {
                Some(Token::Word(column)) => {
                    if !self.is_known_name(&column.value.to_lowercase()) {
                        self.report_unknown_column(&column.value);
                    }
                    i + 3
                }
                _ => i + 2,
            };
        }

        if self.is_known_name(&lower) {
            return i + 1;
        }
        if !quoted && self.is_bare_keyword(i, &upper) {
            return i + 1;
        }
        if self.is_implicit_alias(i) {
            self.names.aliases.insert(lower);
            return i + 1;
        }
        self.report_unknown_column(&w.value);
        i + 1
    }

    fn table_reference(&mut self, i: usize, w: &Word) -> usize {
        let sig = self.sig;
        self.frame().expect_table = false;
        self.frame().after_table = true;

        if matches!(sig.get(i + 1), Some(Token::LParen)) {
            self.report(
                ViolationKind::UnknownTable,
                format!("table function `{}` is not a schema table", w.value),
            );
            return i + 1;
        }

        // schema-qualified names resolve by their last part
        let mut j = i;
        let mut name = w.value.clone();
        while matches!(sig.get(j + 1), Some(Token::Period)) {
            match sig.get(j + 2) {
                Some(Token::Word(part)) => {
                    name = part.value.clone();
                    j += 2;
                }
                _ => break,
            }
        }
        if !self.is_relation(&name.to_lowercase()) {
            self.report(
                ViolationKind::UnknownTable,
                format!("table `{}` is not in the schema", name),
            );
        }
        j + 1
    }

    fn is_bare_keyword(&self, i: usize, upper: &str) -> bool {
        let next = self.sig.get(i + 1).copied();
        if EXPRESSION_KEYWORDS.contains(&upper) {
            return true;
        }
        if TYPE_NAMES.contains(&upper) && matches!(next, Some(Token::SingleQuotedString(_))) {
            return true;
        }
        if DATE_PARTS.contains(&upper) {
            let extract_part = self.frames.last().map_or(false, |f| f.function)
                && next.map_or(false, |t| is_kw(t, "FROM"));
            let interval_unit = i > 0
                && matches!(self.sig[i - 1], Token::Number(_, _) | Token::SingleQuotedString(_));
            return extract_part || interval_unit;
        }
        false
    }

    /// `expr alias` without AS: follows a value and precedes a list separator.
    fn is_implicit_alias(&self, i: usize) -> bool {
        if i == 0 {
            return false;
        }
        let follows_value = match self.sig[i - 1] {
            Token::RParen | Token::Number(_, _) | Token::SingleQuotedString(_) => true,
            Token::Word(prev) => {
                prev.quote_style.is_some()
                    || prev.keyword == Keyword::NoKeyword
                    || self.schema.has_column(&prev.value)
            }
            _ => false,
        };
        let ends_item = match self.sig.get(i + 1) {
            None => true,
            Some(t) => {
                matches!(t, Token::Comma | Token::RParen | Token::SemiColon) || is_kw(t, "FROM")
            }
        };
        follows_value && ends_item
    }

    fn is_relation(&self, lower: &str) -> bool {
        self.schema.has_table(lower) || self.names.relations.contains(lower)
    }

    fn is_known_name(&self, lower: &str) -> bool {
        self.schema.has_column(lower) || self.names.aliases.contains(lower) || self.is_relation(lower)
    }

    fn report(&mut self, kind: ViolationKind, detail: String) {
        self.violations.push(Violation::new(kind, detail));
    }

    fn report_unknown_column(&mut self, name: &str) {
        let mut detail = format!("column `{}` does not exist in the schema", name);
        if let Some(suggestion) = closest_column(self.schema, name) {
            detail.push_str(&format!(" (did you mean `{}`?)", suggestion));
        }
        self.report(ViolationKind::UnknownColumn, detail);
    }
}

fn closest_column<'s>(schema: &'s SchemaDescriptor, name: &str) -> Option<&'s str> {
    let lower = name.to_lowercase();
    schema
        .column_names()
        .map(|c| (c, strsim::jaro_winkler(&lower, &c.to_lowercase())))
        .filter(|(_, score)| *score >= SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(c, _)| c)
}
