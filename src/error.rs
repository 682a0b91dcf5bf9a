use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::sql::validate::Violation;

/// Failure of a single model invocation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Timeout, transport failure, or transient backend failure that survived the retry.
    #[error("model backend unavailable: {0}")]
    Unavailable(String),

    /// Permanent failure: bad credentials, malformed request, unusable response.
    #[error("model backend rejected the request: {0}")]
    Rejected(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("no SQL statement found in model output")]
    NoStatementFound,

    #[error("model output contains more than one SQL statement")]
    MultipleStatements,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("engine rejected the query: {0}")]
    EngineRejected(String),

    #[error("query exceeded the {}ms time limit", .0.as_millis())]
    Timeout(Duration),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown LLM provider '{0}' (expected hf, fireworks or offline)")]
    UnknownProvider(String),

    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("table file not found for '{table}' under {dir}")]
    TableNotFound { table: String, dir: String },

    #[error("table '{table}' is missing column '{column}'")]
    MissingColumn { table: String, column: String },

    #[error("failed to load table '{table}': {detail}")]
    Load { table: String, detail: String },
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("generated SQL failed validation: {}", summarize(.0))]
    Validation(Vec<Violation>),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Stable tag callers use to tell failure classes apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Unavailable,
    Rejected,
    NoStatementFound,
    MultipleStatements,
    NotReadOnly,
    UnknownTable,
    UnknownColumn,
    MultiStatement,
    Malformed,
    EngineRejected,
    Timeout,
    Internal,
}

/// Pipeline step at which a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Generation,
    Extraction,
    Validation,
    Review,
    Execution,
    Internal,
}

/// Error object carried by a pipeline response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Unavailable(_) => ErrorKind::Unavailable,
            GatewayError::Rejected(_) => ErrorKind::Rejected,
        }
    }
}

impl ExtractionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractionError::NoStatementFound => ErrorKind::NoStatementFound,
            ExtractionError::MultipleStatements => ErrorKind::MultipleStatements,
        }
    }
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::EngineRejected(_) => ErrorKind::EngineRejected,
            ExecutionError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

impl From<&PipelineError> for ResponseError {
    fn from(err: &PipelineError) -> Self {
        let message = err.to_string();
        match err {
            PipelineError::Gateway(e) => ResponseError {
                kind: e.kind(),
                stage: Stage::Generation,
                message,
                violations: Vec::new(),
            },
            PipelineError::Extraction(e) => ResponseError {
                kind: e.kind(),
                stage: Stage::Extraction,
                message,
                violations: Vec::new(),
            },
            PipelineError::Validation(violations) => ResponseError {
                kind: violations
                    .first()
                    .map(|v| v.kind.into())
                    .unwrap_or(ErrorKind::Malformed),
                stage: Stage::Validation,
                message,
                violations: violations.clone(),
            },
            PipelineError::Execution(e) => ResponseError {
                kind: e.kind(),
                stage: Stage::Execution,
                message,
                violations: Vec::new(),
            },
            PipelineError::Config(_)
            | PipelineError::Store(_)
            | PipelineError::Io(_)
            | PipelineError::Json(_) => ResponseError {
                kind: ErrorKind::Internal,
                stage: Stage::Internal,
                message,
                violations: Vec::new(),
            },
        }
    }
}

impl From<PipelineError> for ResponseError {
    fn from(err: PipelineError) -> Self {
        ResponseError::from(&err)
    }
}
