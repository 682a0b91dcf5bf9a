//! Execution Result - column metadata plus rows of scalars, ready for charting

use crate::error::ExecutionError;
use crate::schema::SemanticType;
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: SemanticType,
}

/// One cell. Dates and timestamps travel as ISO-8601 text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<ScalarValue>>,
    pub row_count: usize,
    /// Set when the engine produced more than `row_limit` rows.
    pub truncated: bool,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    pub fn from_frame(df: &DataFrame, truncated: bool, execution_time_ms: u64) -> Result<Self, ExecutionError> {
        let columns = df
            .get_columns()
            .iter()
            .map(|s| ColumnInfo {
                name: s.name().to_string(),
                ty: semantic_type(s.dtype()),
            })
            .collect();

        let mut rows = Vec::with_capacity(df.height());
        for row_idx in 0..df.height() {
            let mut row = Vec::with_capacity(df.width());
            for series in df.get_columns() {
                let value = series.get(row_idx).map_err(|e| {
                    ExecutionError::EngineRejected(format!("failed to read result value: {}", e))
                })?;
                row.push(scalar(value));
            }
            rows.push(row);
        }

        Ok(Self {
            columns,
            row_count: rows.len(),
            rows,
            truncated,
            execution_time_ms,
        })
    }

    /// Rows as `{column: value}` objects.
    pub fn records(&self) -> Vec<serde_json::Value> {
        self.rows
            .iter()
            .map(|row| {
                let map = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(c, v)| (c.name.clone(), serde_json::to_value(v).unwrap_or(serde_json::Value::Null)))
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(map)
            })
            .collect()
    }
}

pub(crate) fn semantic_type(dtype: &DataType) -> SemanticType {
    match dtype {
        DataType::Boolean => SemanticType::Boolean,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => SemanticType::Integer,
        DataType::Float32 | DataType::Float64 => SemanticType::Double,
        DataType::Date => SemanticType::Date,
        DataType::Datetime(_, _) => SemanticType::Timestamp,
        _ => SemanticType::Text,
    }
}

pub(crate) fn polars_type(ty: SemanticType) -> DataType {
    match ty {
        SemanticType::Text => DataType::String,
        SemanticType::Integer => DataType::Int64,
        SemanticType::Double => DataType::Float64,
        SemanticType::Date => DataType::Date,
        SemanticType::Timestamp => DataType::Datetime(TimeUnit::Microseconds, None),
        SemanticType::Boolean => DataType::Boolean,
    }
}

fn scalar(value: AnyValue) -> ScalarValue {
    match value {
        AnyValue::Null => ScalarValue::Null,
        AnyValue::Boolean(b) => ScalarValue::Bool(b),
        AnyValue::String(s) => ScalarValue::Text(s.to_string()),
        AnyValue::Int8(i) => ScalarValue::Int(i.into()),
        AnyValue::Int16(i) => ScalarValue::Int(i.into()),
        AnyValue::Int32(i) => ScalarValue::Int(i.into()),
        AnyValue::Int64(i) => ScalarValue::Int(i),
        AnyValue::UInt8(u) => ScalarValue::Int(u.into()),
        AnyValue::UInt16(u) => ScalarValue::Int(u.into()),
        AnyValue::UInt32(u) => ScalarValue::Int(u.into()),
        AnyValue::UInt64(u) => i64::try_from(u)
            .map(ScalarValue::Int)
            .unwrap_or(ScalarValue::Float(u as f64)),
        AnyValue::Float32(f) => float(f as f64),
        AnyValue::Float64(f) => float(f),
        AnyValue::Date(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days.into())))
            .map(|d| ScalarValue::Text(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(ScalarValue::Null),
        AnyValue::Datetime(v, unit, _) => {
            let micros = match unit {
                TimeUnit::Nanoseconds => v / 1_000,
                TimeUnit::Microseconds => v,
                TimeUnit::Milliseconds => v.saturating_mul(1_000),
            };
            NaiveDateTime::from_timestamp_micros(micros)
                .map(|ts| ScalarValue::Text(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
                .unwrap_or(ScalarValue::Null)
        }
        other => ScalarValue::Text(other.to_string()),
    }
}

/// NaN and infinities have no JSON form.
fn float(f: f64) -> ScalarValue {
    if f.is_finite() {
        ScalarValue::Float(f)
    } else {
        ScalarValue::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_frame_to_rows() {
        let df = df! {
            "product_title" => &["Product 1", "Product 2"],
            "units" => &[3i64, 5],
            "revenue" => &[Some(10.5f64), None],
        }
        .unwrap();
        let result = ExecutionResult::from_frame(&df, false, 7).unwrap();

        assert_eq!(result.row_count, 2);
        assert_eq!(
            result.columns.iter().map(|c| c.ty).collect::<Vec<_>>(),
            vec![SemanticType::Text, SemanticType::Integer, SemanticType::Double]
        );
        assert_eq!(
            result.rows[0],
            vec![
                ScalarValue::Text("Product 1".to_string()),
                ScalarValue::Int(3),
                ScalarValue::Float(10.5)
            ]
        );
        assert_eq!(result.rows[1][2], ScalarValue::Null);
        assert_eq!(result.records()[0]["units"], 3);
    }

    #[test]
    fn dates_render_as_iso_text() {
        let df = df! { "day" => &["2024-07-01"] }
            .unwrap()
            .lazy()
            .with_column(col("day").cast(DataType::Date))
            .collect()
            .unwrap();
        let result = ExecutionResult::from_frame(&df, false, 0).unwrap();
        assert_eq!(result.columns[0].ty, SemanticType::Date);
        assert_eq!(result.rows[0][0], ScalarValue::Text("2024-07-01".to_string()));
    }

    #[test]
    fn scalars_serialize_untagged() {
        let row = vec![ScalarValue::Null, ScalarValue::Int(1), ScalarValue::Text("a".to_string())];
        assert_eq!(serde_json::to_string(&row).unwrap(), r#"[null,1,"a"]"#);
    }
}
