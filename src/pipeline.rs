//! Pipeline Orchestrator
//!
//! Generate -> Extract -> Validate -> Review -> Execute, with a single
//! self-correction retry. The retry budget lives in the state itself: an
//! `Attempt::Final` state has no successor, so a third generation call cannot
//! be expressed.

use crate::config::AppConfig;
use crate::error::{PipelineError, ResponseError, Result};
use crate::execution::{AnalyticalStore, ExecutionResult, QueryExecutor};
use crate::llm::{ModelGateway, ModelRole, TextGenerator};
use crate::prompts::{generator_prompt, Correction, GenerationRequest, Turn};
use crate::review::{ReviewEngine, ReviewVerdict};
use crate::schema::SchemaDescriptor;
use crate::sql::{apply_fallbacks, extract, looks_like_sql, validate, CandidateSource, CandidateSql};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub row_limit: usize,
    pub query_timeout: Duration,
    pub review_enabled: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            row_limit: 200,
            query_timeout: Duration::from_secs(10),
            review_enabled: true,
        }
    }
}

/// Final answer to an `ask`. `execution` is always `None` when `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub request_id: Uuid,
    pub sql: Option<String>,
    pub execution: Option<ExecutionResult>,
    pub review: Option<ReviewVerdict>,
    pub error: Option<ResponseError>,
    pub warnings: Vec<String>,
    pub generation_attempts: u8,
    pub elapsed_ms: u64,
}

/// Result of the standalone `review` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewReport {
    pub sql: String,
    pub verdict: ReviewVerdict,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableHealth {
    pub name: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub ok: bool,
    pub backend: String,
    pub engine: String,
    pub tables: Vec<TableHealth>,
}

/// Generation attempt number. There is no attempt after `Final`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Final,
}

impl Attempt {
    fn next(self) -> Option<Attempt> {
        match self {
            Attempt::First => Some(Attempt::Final),
            Attempt::Final => None,
        }
    }

    fn number(self) -> u8 {
        match self {
            Attempt::First => 1,
            Attempt::Final => 2,
        }
    }
}

enum Step {
    Generating {
        attempt: Attempt,
        correction: Option<Correction>,
    },
    Extracting {
        attempt: Attempt,
        raw: String,
    },
    Validating {
        attempt: Attempt,
        candidate: CandidateSql,
    },
    Correcting {
        attempt: Attempt,
        error: PipelineError,
        correction: Correction,
    },
}

/// Per-request bookkeeping carried through the stages.
#[derive(Default)]
struct Trace {
    warnings: Vec<String>,
    generation_attempts: u8,
    last_sql: Option<String>,
}

pub struct Pipeline {
    schema: Arc<SchemaDescriptor>,
    generator: Arc<dyn TextGenerator>,
    reviewer: ReviewEngine,
    executor: QueryExecutor,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        schema: Arc<SchemaDescriptor>,
        generator: Arc<dyn TextGenerator>,
        executor: QueryExecutor,
        options: PipelineOptions,
    ) -> Self {
        let reviewer = ReviewEngine::new(Arc::clone(&generator), Arc::clone(&schema));
        Self {
            schema,
            generator,
            reviewer,
            executor,
            options,
        }
    }

    /// Build the whole pipeline from configuration: descriptor, store, gateway.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let schema = match config.schema_path {
            Some(ref path) => SchemaDescriptor::load(path)?,
            None => SchemaDescriptor::daily_product_sales(),
        };
        let store = AnalyticalStore::open(&config.data_dir, &schema)?;
        let gateway = ModelGateway::from_config(&config.llm);
        info!("Model backend: {}", gateway.describe());

        Ok(Self::new(
            Arc::new(schema),
            Arc::new(gateway),
            QueryExecutor::new(Arc::new(store)).with_max_concurrent(config.max_concurrent_queries),
            PipelineOptions {
                row_limit: config.row_limit,
                query_timeout: config.query_timeout,
                review_enabled: config.review_enabled,
            },
        ))
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Answer a question end to end. Failures are reported inside the response.
    pub async fn ask(&self, question: &str, history: Vec<Turn>) -> PipelineResponse {
        let request_id = Uuid::new_v4();
        let span = info_span!("ask", request_id = %request_id);
        self.run_ask(request_id, question, history).instrument(span).await
    }

    async fn run_ask(&self, request_id: Uuid, question: &str, history: Vec<Turn>) -> PipelineResponse {
        let started = Instant::now();
        let mut trace = Trace::default();
        info!("Question: {}", question);

        let request = GenerationRequest::new(question, Arc::clone(&self.schema)).with_history(history);
        let outcome = match self.generate_candidate(&request, &mut trace).await {
            Ok(candidate) => {
                let (candidate, review) = self.review_step(candidate, question, &mut trace).await;
                let sql = candidate.executable_text().to_string();
                let execution = self
                    .executor
                    .execute(&candidate, self.options.row_limit, self.options.query_timeout)
                    .await
                    .map_err(PipelineError::from);
                (Some(sql), review, execution)
            }
            Err(e) => (trace.last_sql.clone(), None, Err(e)),
        };

        let (sql, review, execution) = outcome;
        let (execution, error) = match execution {
            Ok(result) => (Some(result), None),
            Err(e) => {
                warn!("Request failed: {}", e);
                (None, Some(ResponseError::from(&e)))
            }
        };

        let response = PipelineResponse {
            request_id,
            sql,
            execution,
            review,
            error,
            warnings: trace.warnings,
            generation_attempts: trace.generation_attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "Done in {}ms after {} generation call(s){}",
            response.elapsed_ms,
            response.generation_attempts,
            if response.error.is_some() { " with error" } else { "" }
        );
        response
    }

    /// Generation, extraction and validation only.
    pub async fn generate_sql(&self, question: &str) -> Result<CandidateSql> {
        let span = info_span!("generate_sql", request_id = %Uuid::new_v4());
        let request = GenerationRequest::new(question, Arc::clone(&self.schema));
        self.generate_candidate(&request, &mut Trace::default())
            .instrument(span)
            .await
    }

    /// Review SQL as-is, or generate a candidate from a question and review it.
    /// Nothing is executed.
    pub async fn review(&self, sql_or_question: &str) -> Result<ReviewReport> {
        let span = info_span!("review", request_id = %Uuid::new_v4());
        self.run_review(sql_or_question).instrument(span).await
    }

    async fn run_review(&self, sql_or_question: &str) -> Result<ReviewReport> {
        let mut trace = Trace::default();
        let (candidate, question) = if looks_like_sql(sql_or_question) {
            // Broken SQL still goes to the reviewer; violations travel as warnings.
            let candidate = CandidateSql::new(sql_or_question.trim(), CandidateSource::UserSupplied);
            let verdict = validate(&candidate, &self.schema);
            if !verdict.passed {
                info!("Submitted SQL has {} violation(s)", verdict.violations.len());
                trace
                    .warnings
                    .extend(verdict.violations.iter().map(|v| format!("validation: {}", v)));
            }
            (candidate, "(no question supplied; judge the query on its own)")
        } else {
            let request = GenerationRequest::new(sql_or_question, Arc::clone(&self.schema));
            (self.generate_candidate(&request, &mut trace).await?, sql_or_question)
        };

        let verdict = self.reviewer.review(&candidate, question).await?;
        let sql = verdict
            .revised_sql
            .as_ref()
            .unwrap_or(&candidate)
            .executable_text()
            .to_string();
        Ok(ReviewReport {
            sql,
            verdict,
            warnings: trace.warnings,
        })
    }

    /// Validate then execute caller-supplied SQL. No model is involved.
    pub async fn execute(&self, sql: &str) -> Result<ExecutionResult> {
        let candidate = CandidateSql::new(sql.trim(), CandidateSource::UserSupplied);
        validate(&candidate, &self.schema)
            .into_result()
            .map_err(PipelineError::Validation)?;
        Ok(self
            .executor
            .execute(&candidate, self.options.row_limit, self.options.query_timeout)
            .await?)
    }

    pub fn health(&self) -> Health {
        Health {
            ok: true,
            backend: self.generator.describe(),
            engine: self.executor.engine_name().to_string(),
            tables: self
                .executor
                .row_counts()
                .into_iter()
                .map(|(name, rows)| TableHealth { name, rows })
                .collect(),
        }
    }

    async fn generate_candidate(&self, request: &GenerationRequest, trace: &mut Trace) -> Result<CandidateSql> {
        let mut step = Step::Generating {
            attempt: Attempt::First,
            correction: None,
        };
        loop {
            step = match step {
                Step::Generating { attempt, correction } => {
                    info!("Generating SQL (attempt {})", attempt.number());
                    trace.generation_attempts = attempt.number();
                    let prompt = generator_prompt(request, correction.as_ref());
                    let raw = self.generator.generate(&prompt, ModelRole::Generator).await?;
                    Step::Extracting { attempt, raw }
                }
                Step::Extracting { attempt, raw } => match extract(&raw) {
                    Ok(candidate) => {
                        let (candidate, notes) = apply_fallbacks(candidate, &request.schema);
                        for note in &notes {
                            info!("Repair: {}", note);
                        }
                        trace.warnings.extend(notes);
                        Step::Validating { attempt, candidate }
                    }
                    Err(e) => {
                        debug!("No usable SQL in: {}", raw);
                        Step::Correcting {
                            attempt,
                            correction: Correction {
                                previous_sql: None,
                                reasons: vec![e.to_string()],
                            },
                            error: e.into(),
                        }
                    }
                },
                Step::Validating { attempt, candidate } => {
                    trace.last_sql = Some(candidate.executable_text().to_string());
                    let verdict = validate(&candidate, &request.schema);
                    if verdict.passed {
                        info!("Candidate passed validation");
                        return Ok(candidate);
                    }
                    Step::Correcting {
                        attempt,
                        correction: Correction {
                            previous_sql: Some(candidate.executable_text().to_string()),
                            reasons: verdict.violations.iter().map(|v| v.to_string()).collect(),
                        },
                        error: PipelineError::Validation(verdict.violations),
                    }
                }
                Step::Correcting {
                    attempt,
                    error,
                    correction,
                } => match attempt.next() {
                    Some(next) => {
                        warn!("Attempt {} failed ({}), regenerating", attempt.number(), error);
                        Step::Generating {
                            attempt: next,
                            correction: Some(correction),
                        }
                    }
                    None => return Err(error),
                },
            };
        }
    }

    /// One reviewer call. A failure here never blocks execution.
    async fn review_step(
        &self,
        candidate: CandidateSql,
        question: &str,
        trace: &mut Trace,
    ) -> (CandidateSql, Option<ReviewVerdict>) {
        if !self.options.review_enabled {
            return (candidate, None);
        }
        match self.reviewer.review(&candidate, question).await {
            Ok(verdict) => {
                let chosen = match verdict.revised_sql {
                    Some(ref revised) => {
                        info!("Using reviewer-revised SQL");
                        trace
                            .warnings
                            .push("executed the reviewer's revised SQL instead of the generated one".to_string());
                        revised.clone()
                    }
                    None => candidate,
                };
                (chosen, Some(verdict))
            }
            Err(e) => {
                warn!("Review failed, continuing with the generated SQL: {}", e);
                trace.warnings.push(format!("review skipped: {}", e));
                (candidate, None)
            }
        }
    }
}
