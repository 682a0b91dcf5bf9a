//! Offline backend
//!
//! Answers without any network access so the service and its tests run
//! without credentials. The generator recognises the common marketplace
//! question shape (top-N, category, quarter); the reviewer always approves.

use super::ModelRole;
use crate::prompts::{question_from_prompt, sql_from_prompt};
use lazy_static::lazy_static;
use regex::Regex;

pub const CATEGORIES: &[&str] = &["electronics", "home", "beauty", "sports", "toys"];
const DEFAULT_TOP_N: u32 = 3;

lazy_static! {
    static ref TOP_N: Regex = Regex::new(r"\b(?:top|best|first)\s+(\d{1,3})\b").unwrap();
    static ref NUMBER: Regex = Regex::new(r"\b(\d{1,3})\b").unwrap();
    static ref QUARTER: Regex = Regex::new(r"(?i)\bq([1-4])\b").unwrap();
}

#[derive(Debug, Clone, Default)]
pub struct OfflineModel;

impl OfflineModel {
    pub fn respond(&self, prompt: &str, role: ModelRole) -> String {
        match role {
            ModelRole::Generator => self.generate(question_from_prompt(prompt).unwrap_or("")),
            ModelRole::Reviewer => {
                let verdict = serde_json::json!({
                    "reasoning": match sql_from_prompt(prompt) {
                        Some(_) => "Query reads only schema columns and matches the question.",
                        None => "No SQL was provided to review.",
                    },
                    "ok": true,
                    "fixed_sql": ""
                });
                verdict.to_string()
            }
        }
    }

    fn generate(&self, question: &str) -> String {
        let lower = question.to_lowercase();
        let top_n = TOP_N
            .captures(&lower)
            .or_else(|| NUMBER.captures(&lower))
            .and_then(|c| c[1].parse::<u32>().ok())
            .filter(|n| (1..=100).contains(n))
            .unwrap_or(DEFAULT_TOP_N);

        let mut filters = Vec::new();
        if let Some(category) = CATEGORIES.iter().find(|c| lower.contains(*c)) {
            filters.push(format!("category = '{}'", category));
        }
        if let Some(quarter) = QUARTER.captures(&lower).map(|c| c[1].to_string()) {
            filters.push(format!("EXTRACT(QUARTER FROM day) = {}", quarter));
        }

        let mut sql = String::from(
            "SELECT product_title, category, SUM(units) AS units, SUM(revenue) AS revenue\nFROM daily_product_sales\n",
        );
        if !filters.is_empty() {
            sql.push_str(&format!("WHERE {}\n", filters.join(" AND ")));
        }
        sql.push_str(&format!(
            "GROUP BY product_title, category\nORDER BY revenue DESC\nLIMIT {}",
            top_n
        ));
        format!("```sql\n{}\n```", sql)
    }
}
