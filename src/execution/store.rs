//! Analytical Store
//!
//! Tables are loaded once from `<data_dir>/<table>.parquet` or `.csv`, cast to
//! the descriptor's types, and kept in memory. Every query gets a fresh Polars
//! SQL context over those frames, so queries never see each other's state.

use super::result::{polars_type, ExecutionResult};
use super::SqlEngine;
use crate::error::{ExecutionError, StoreError};
use crate::schema::{SchemaDescriptor, TableSchema};
use polars::prelude::*;
use polars::sql::SQLContext;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

pub struct AnalyticalStore {
    data_dir: PathBuf,
    tables: Vec<(String, DataFrame)>,
}

impl AnalyticalStore {
    /// Load every table the descriptor names. Fails if a file is missing or
    /// lacks a described column.
    pub fn open(data_dir: &Path, schema: &SchemaDescriptor) -> Result<Self, StoreError> {
        let mut tables = Vec::with_capacity(schema.tables().len());
        for table in schema.tables() {
            let df = load_table(data_dir, table)?;
            info!("Loaded table {} ({} rows)", table.name, df.height());
            tables.push((table.name.clone(), df));
        }
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            tables,
        })
    }

    /// In-memory store over existing frames.
    pub fn from_frames(tables: Vec<(String, DataFrame)>) -> Self {
        Self {
            data_dir: PathBuf::new(),
            tables,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl SqlEngine for AnalyticalStore {
    fn name(&self) -> &'static str {
        "polars"
    }

    fn row_counts(&self) -> Vec<(String, usize)> {
        self.tables
            .iter()
            .map(|(name, df)| (name.clone(), df.height()))
            .collect()
    }

    fn run(&self, sql: &str, row_limit: usize) -> Result<ExecutionResult, ExecutionError> {
        let start = Instant::now();
        let mut ctx = SQLContext::new();
        for (name, df) in &self.tables {
            ctx.register(name, df.clone().lazy());
        }

        debug!("Executing: {}", sql);
        let plan = ctx
            .execute(sql)
            .map_err(|e| ExecutionError::EngineRejected(e.to_string()))?;

        // One extra row tells us whether the cap cut anything off.
        let fetch = IdxSize::try_from(row_limit.saturating_add(1)).unwrap_or(IdxSize::MAX);
        let df = plan
            .limit(fetch)
            .collect()
            .map_err(|e| ExecutionError::EngineRejected(e.to_string()))?;

        let truncated = df.height() > row_limit;
        let df = if truncated { df.head(Some(row_limit)) } else { df };
        ExecutionResult::from_frame(&df, truncated, start.elapsed().as_millis() as u64)
    }
}

fn load_table(data_dir: &Path, table: &TableSchema) -> Result<DataFrame, StoreError> {
    let load_err = |e: PolarsError| StoreError::Load {
        table: table.name.clone(),
        detail: e.to_string(),
    };

    let parquet = data_dir.join(format!("{}.parquet", table.name));
    let csv = data_dir.join(format!("{}.csv", table.name));
    let lf = if parquet.exists() {
        LazyFrame::scan_parquet(&parquet, ScanArgsParquet::default()).map_err(load_err)?
    } else if csv.exists() {
        LazyCsvReader::new(&csv)
            .with_has_header(true)
            .with_try_parse_dates(true)
            .with_infer_schema_length(Some(1000))
            .finish()
            .map_err(load_err)?
    } else {
        return Err(StoreError::TableNotFound {
            table: table.name.clone(),
            dir: data_dir.display().to_string(),
        });
    };

    let raw = lf.collect().map_err(load_err)?;
    let present: Vec<String> = raw.get_column_names().iter().map(|s| s.to_string()).collect();

    // Keep exactly the described columns, renamed to the descriptor's spelling.
    let mut exprs = Vec::with_capacity(table.columns.len());
    for column in &table.columns {
        let actual = present
            .iter()
            .find(|p| p.eq_ignore_ascii_case(&column.name))
            .ok_or_else(|| StoreError::MissingColumn {
                table: table.name.clone(),
                column: column.name.clone(),
            })?;
        exprs.push(col(actual).cast(polars_type(column.ty)).alias(&column.name));
    }

    raw.lazy().select(exprs).collect().map_err(load_err)
}
