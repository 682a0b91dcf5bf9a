//! Schema Catalog
//!
//! Holds the fixed table definitions the pipeline is allowed to query. The
//! descriptor is built once at startup and shared read-only by every request.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

pub const DEFAULT_TABLE: &str = "daily_product_sales";

/// Logical column type, independent of the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    Text,
    Integer,
    Double,
    Date,
    Timestamp,
    Boolean,
}

impl fmt::Display for SemanticType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SemanticType::Text => "TEXT",
            SemanticType::Integer => "INT",
            SemanticType::Double => "DOUBLE",
            SemanticType::Date => "DATE",
            SemanticType::Timestamp => "TIMESTAMP",
            SemanticType::Boolean => "BOOLEAN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: SemanticType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SchemaFile {
    tables: Vec<TableSchema>,
    #[serde(default)]
    dialect_hint: Option<String>,
}

/// Immutable description of every queryable table.
#[derive(Debug, Clone)]
pub struct SchemaDescriptor {
    tables: Vec<TableSchema>,
    dialect_hint: Option<String>,
    // lowercased lookups
    table_index: HashMap<String, usize>,
    column_names: HashSet<String>,
}

impl SchemaDescriptor {
    pub fn new(tables: Vec<TableSchema>) -> Self {
        let table_index = tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.to_lowercase(), i))
            .collect();
        let column_names = tables
            .iter()
            .flat_map(|t| t.columns.iter().map(|c| c.name.to_lowercase()))
            .collect();
        Self {
            tables,
            dialect_hint: None,
            table_index,
            column_names,
        }
    }

    pub fn with_dialect_hint(mut self, hint: impl Into<String>) -> Self {
        self.dialect_hint = Some(hint.into());
        self
    }

    /// The marketplace sales table the service ships with.
    pub fn daily_product_sales() -> Self {
        let col = |name: &str, ty| ColumnSchema {
            name: name.to_string(),
            ty,
        };
        Self::new(vec![TableSchema {
            name: DEFAULT_TABLE.to_string(),
            columns: vec![
                col("product_title", SemanticType::Text),
                col("category", SemanticType::Text),
                col("day", SemanticType::Date),
                col("units", SemanticType::Integer),
                col("revenue", SemanticType::Double),
            ],
        }])
        .with_dialect_hint(
            "Use EXTRACT(QUARTER FROM day) or EXTRACT(MONTH FROM day) for date parts.",
        )
    }

    /// Load a descriptor from a JSON file of the form
    /// `{"tables": [{"name": ..., "columns": [{"name": ..., "type": "text"}]}]}`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: SchemaFile = serde_json::from_str(&content)?;
        let schema = Self::new(file.tables);
        Ok(match file.dialect_hint {
            Some(hint) => schema.with_dialect_hint(hint),
            None => schema,
        })
    }

    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.table_index
            .get(&name.to_lowercase())
            .map(|&i| &self.tables[i])
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table_index.contains_key(&name.to_lowercase())
    }

    /// True if any table defines a column with this name.
    pub fn has_column(&self, name: &str) -> bool {
        self.column_names.contains(&name.to_lowercase())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.tables
            .iter()
            .flat_map(|t| t.columns.iter().map(|c| c.name.as_str()))
    }

    /// The only table, when the catalog has exactly one.
    pub fn sole_table(&self) -> Option<&TableSchema> {
        match self.tables.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    /// Schema text embedded in generator and reviewer prompts.
    pub fn prompt_text(&self) -> String {
        let mut out = self
            .tables
            .iter()
            .map(|t| {
                let cols: Vec<String> = t
                    .columns
                    .iter()
                    .map(|c| format!("{} {}", c.name, c.ty))
                    .collect();
                format!("Table {}({}).", t.name, cols.join(", "))
            })
            .collect::<Vec<_>>()
            .join("\n");
        if let Some(ref hint) = self.dialect_hint {
            out.push(' ');
            out.push_str(hint);
        }
        out
    }
}
