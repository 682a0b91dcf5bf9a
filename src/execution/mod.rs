//! Query Executor
//!
//! Runs validated statements on the embedded store. Engine work is blocking,
//! so it goes to Tokio's blocking pool and is bounded by a wall-clock timeout.
//! Polars cannot interrupt a running query: a timed-out job runs to the end
//! in the background and keeps its concurrency slot until then.

pub mod result;
pub mod store;

pub use result::{ColumnInfo, ExecutionResult, ScalarValue};
pub use store::AnalyticalStore;

use crate::error::ExecutionError;
use crate::sql::CandidateSql;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_CONCURRENT_QUERIES: usize = 4;

/// Synchronous SQL engine over in-memory tables.
pub trait SqlEngine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Loaded tables and their sizes.
    fn row_counts(&self) -> Vec<(String, usize)> {
        Vec::new()
    }

    /// Run one statement, returning at most `row_limit` rows.
    fn run(&self, sql: &str, row_limit: usize) -> Result<ExecutionResult, ExecutionError>;
}

#[derive(Clone)]
pub struct QueryExecutor {
    engine: Arc<dyn SqlEngine>,
    slots: Arc<Semaphore>,
}

impl QueryExecutor {
    pub fn new(engine: Arc<dyn SqlEngine>) -> Self {
        Self {
            engine,
            slots: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT_QUERIES)),
        }
    }

    /// Cap the number of engine jobs in flight, abandoned ones included.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.slots = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn row_counts(&self) -> Vec<(String, usize)> {
        self.engine.row_counts()
    }

    pub async fn execute(
        &self,
        candidate: &CandidateSql,
        row_limit: usize,
        time_limit: Duration,
    ) -> Result<ExecutionResult, ExecutionError> {
        let sql = candidate.executable_text().to_string();
        let engine = Arc::clone(&self.engine);
        let slots = Arc::clone(&self.slots);

        // Waiting for a slot counts against the time limit.
        let run = async move {
            let permit = slots
                .acquire_owned()
                .await
                .map_err(|_| ExecutionError::EngineRejected("executor is shut down".to_string()))?;
            debug!("Acquired query slot");
            // The permit moves into the job and is released when the engine returns.
            let task = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                engine.run(&sql, row_limit)
            });
            task.await
                .map_err(|e| ExecutionError::EngineRejected(format!("query task failed: {}", e)))?
        };

        let result = match tokio::time::timeout(time_limit, run).await {
            Err(_) => {
                warn!("Query exceeded {}ms, abandoning", time_limit.as_millis());
                return Err(ExecutionError::Timeout(time_limit));
            }
            Ok(result) => result?,
        };

        info!(
            "Query returned {} row(s){} in {}ms on {}",
            result.row_count,
            if result.truncated { " (truncated)" } else { "" },
            result.execution_time_ms,
            self.engine.name()
        );
        Ok(result)
    }
}
