use async_trait::async_trait;
use dataweaver::error::{ErrorKind, GatewayError, PipelineError, Stage};
use dataweaver::execution::{AnalyticalStore, QueryExecutor, ScalarValue};
use dataweaver::http::{route, HttpRequest};
use dataweaver::llm::{ModelRole, TextGenerator};
use dataweaver::pipeline::{Pipeline, PipelineOptions};
use dataweaver::sql::CandidateSource;
use dataweaver::SchemaDescriptor;
use polars::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TOP_ELECTRONICS: &str = "SELECT product_title, SUM(revenue) AS total_revenue \
     FROM daily_product_sales WHERE category = 'electronics' \
     GROUP BY product_title ORDER BY total_revenue DESC LIMIT 3";

/// Replays canned answers per role and records every prompt it sees.
#[derive(Default)]
struct ScriptedModel {
    generator: Mutex<VecDeque<Result<String, GatewayError>>>,
    reviewer: Mutex<VecDeque<Result<String, GatewayError>>>,
    prompts: Mutex<Vec<(ModelRole, String)>>,
}

impl ScriptedModel {
    fn new() -> Self {
        Self::default()
    }

    fn generates(self, reply: &str) -> Self {
        self.generator.lock().unwrap().push_back(Ok(reply.to_string()));
        self
    }

    fn generator_fails(self, err: GatewayError) -> Self {
        self.generator.lock().unwrap().push_back(Err(err));
        self
    }

    fn reviews(self, reply: &str) -> Self {
        self.reviewer.lock().unwrap().push_back(Ok(reply.to_string()));
        self
    }

    fn reviewer_fails(self, err: GatewayError) -> Self {
        self.reviewer.lock().unwrap().push_back(Err(err));
        self
    }

    fn calls(&self, role: ModelRole) -> usize {
        self.prompts.lock().unwrap().iter().filter(|(r, _)| *r == role).count()
    }

    fn prompt(&self, role: ModelRole, nth: usize) -> String {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| *r == role)
            .nth(nth)
            .map(|(_, p)| p.clone())
            .unwrap()
    }
}

#[async_trait]
impl TextGenerator for ScriptedModel {
    async fn generate(&self, prompt: &str, role: ModelRole) -> Result<String, GatewayError> {
        self.prompts.lock().unwrap().push((role, prompt.to_string()));
        let queue = match role {
            ModelRole::Generator => &self.generator,
            ModelRole::Reviewer => &self.reviewer,
        };
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GatewayError::Rejected(format!("no scripted {} reply left", role))))
    }
}

fn write_sales(dir: &Path) {
    let mut df = df! [
        "product_title" => ["Phone", "Laptop", "Headphones", "Cable", "Lamp", "Ball", "Phone"],
        "category" => ["electronics", "electronics", "electronics", "electronics", "home", "sports", "electronics"],
        "day" => ["2024-07-02", "2024-08-10", "2024-09-01", "2024-02-01", "2024-07-05", "2024-03-03", "2024-01-15"],
        "units" => [3i64, 1, 5, 10, 2, 4, 1],
        "revenue" => [900.0, 1200.0, 250.0, 50.0, 80.0, 60.0, 350.0]
    ]
    .unwrap()
    .lazy()
    .with_column(col("day").cast(DataType::Date))
    .collect()
    .unwrap();
    let mut file = std::fs::File::create(dir.join("daily_product_sales.parquet")).unwrap();
    ParquetWriter::new(&mut file).finish(&mut df).unwrap();
}

struct Fixture {
    _dir: tempfile::TempDir,
    model: Arc<ScriptedModel>,
    pipeline: Pipeline,
}

fn fixture_with(model: ScriptedModel, options: PipelineOptions) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    write_sales(dir.path());
    let schema = SchemaDescriptor::daily_product_sales();
    let store = AnalyticalStore::open(dir.path(), &schema).unwrap();
    let model = Arc::new(model);
    let pipeline = Pipeline::new(
        Arc::new(schema),
        model.clone(),
        QueryExecutor::new(Arc::new(store)),
        options,
    );
    Fixture {
        _dir: dir,
        model,
        pipeline,
    }
}

fn fixture(model: ScriptedModel) -> Fixture {
    fixture_with(model, PipelineOptions::default())
}

const ACCEPT: &str = r#"{"reasoning": "answers the question", "ok": true, "fixed_sql": ""}"#;

#[tokio::test]
async fn top_electronics_end_to_end() {
    let fx = fixture(
        ScriptedModel::new()
            .generates(&format!("Here is the query:\n```sql\n{}\n```", TOP_ELECTRONICS))
            .reviews(ACCEPT),
    );
    let response = fx.pipeline.ask("Top 3 selling electronics products", Vec::new()).await;

    assert!(response.error.is_none(), "{:?}", response.error);
    let sql = response.sql.as_deref().unwrap();
    assert!(sql.contains("category = 'electronics'"));
    assert!(sql.contains("ORDER BY total_revenue DESC"));

    let execution = response.execution.unwrap();
    assert!(execution.row_count <= 3);
    assert!(!execution.truncated);
    let names: Vec<_> = execution.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["product_title", "total_revenue"]);
    let titles: Vec<_> = execution.rows.iter().map(|r| r[0].clone()).collect();
    assert_eq!(
        titles,
        vec![
            ScalarValue::Text("Phone".to_string()),
            ScalarValue::Text("Laptop".to_string()),
            ScalarValue::Text("Headphones".to_string()),
        ]
    );

    assert!(response.review.unwrap().accepted);
    assert_eq!(response.generation_attempts, 1);
    assert_eq!(fx.model.calls(ModelRole::Generator), 1);
    assert_eq!(fx.model.calls(ModelRole::Reviewer), 1);
}

#[tokio::test]
async fn prose_without_sql_fails_extraction() {
    let fx = fixture(
        ScriptedModel::new()
            .generates("I'm sorry, I can't help with that.")
            .generates("Unfortunately the data does not say."),
    );
    let response = fx.pipeline.ask("What is the meaning of life?", Vec::new()).await;

    let error = response.error.unwrap();
    assert_eq!(error.kind, ErrorKind::NoStatementFound);
    assert_eq!(error.stage, Stage::Extraction);
    assert!(response.execution.is_none());
    assert!(response.review.is_none());
    assert_eq!(fx.model.calls(ModelRole::Generator), 2);
    assert_eq!(fx.model.calls(ModelRole::Reviewer), 0);
}

#[tokio::test]
async fn mutation_is_regenerated_once_then_fails() {
    let fx = fixture(
        ScriptedModel::new()
            .generates("```sql\nDELETE FROM daily_product_sales\n```")
            .generates("```sql\nDELETE FROM daily_product_sales WHERE units = 0\n```"),
    );
    let response = fx.pipeline.ask("Clean up the table", Vec::new()).await;

    let error = response.error.unwrap();
    assert_eq!(error.kind, ErrorKind::NotReadOnly);
    assert_eq!(error.stage, Stage::Validation);
    assert!(!error.violations.is_empty());
    assert!(response.execution.is_none());
    assert_eq!(
        response.sql.as_deref(),
        Some("DELETE FROM daily_product_sales WHERE units = 0")
    );
    assert_eq!(response.generation_attempts, 2);
    assert_eq!(fx.model.calls(ModelRole::Generator), 2);
    assert_eq!(fx.model.calls(ModelRole::Reviewer), 0);

    // the retry prompt explains what was wrong
    let retry = fx.model.prompt(ModelRole::Generator, 1);
    assert!(retry.contains("Previous SQL: DELETE FROM daily_product_sales"));
    assert!(retry.contains("NotReadOnly"));
}

#[tokio::test]
async fn self_correction_recovers_from_unknown_column() {
    let fx = fixture(
        ScriptedModel::new()
            .generates("SELECT product_title, price FROM daily_product_sales")
            .generates("SELECT product_title, revenue FROM daily_product_sales ORDER BY revenue DESC")
            .reviews(ACCEPT),
    );
    let response = fx.pipeline.ask("Most expensive sales", Vec::new()).await;

    assert!(response.error.is_none(), "{:?}", response.error);
    assert_eq!(response.generation_attempts, 2);
    assert_eq!(response.execution.unwrap().row_count, 7);
    let retry = fx.model.prompt(ModelRole::Generator, 1);
    assert!(retry.contains("UnknownColumn"));
    assert!(retry.contains("price"));
}

#[tokio::test]
async fn engine_rejection_keeps_the_review() {
    let fx = fixture(
        ScriptedModel::new()
            .generates("SELECT product_title, no_such_fn(revenue) AS r FROM daily_product_sales")
            .reviews(ACCEPT),
    );
    let response = fx.pipeline.ask("Something odd", Vec::new()).await;

    let error = response.error.unwrap();
    assert_eq!(error.kind, ErrorKind::EngineRejected);
    assert_eq!(error.stage, Stage::Execution);
    assert!(response.execution.is_none());
    assert!(response.review.unwrap().accepted);
    assert!(response.sql.is_some());
    // execution failures are never regenerated
    assert_eq!(fx.model.calls(ModelRole::Generator), 1);
}

#[tokio::test]
async fn review_failure_is_advisory() {
    let fx = fixture(
        ScriptedModel::new()
            .generates(TOP_ELECTRONICS)
            .reviewer_fails(GatewayError::Unavailable("reviewer timed out".to_string())),
    );
    let response = fx.pipeline.ask("Top 3 electronics", Vec::new()).await;

    assert!(response.error.is_none());
    assert!(response.review.is_none());
    assert_eq!(response.execution.unwrap().row_count, 3);
    assert!(response.warnings.iter().any(|w| w.contains("review skipped")));
    assert_eq!(fx.model.calls(ModelRole::Reviewer), 1);
}

#[tokio::test]
async fn valid_reviewer_revision_is_executed() {
    let fx = fixture(
        ScriptedModel::new()
            .generates("SELECT product_title FROM daily_product_sales")
            .reviews(r#"{"reasoning": "should be distinct", "ok": false, "fixed_sql": "SELECT DISTINCT category FROM daily_product_sales"}"#),
    );
    let response = fx.pipeline.ask("Which categories exist?", Vec::new()).await;

    assert_eq!(
        response.sql.as_deref(),
        Some("SELECT DISTINCT category FROM daily_product_sales")
    );
    let review = response.review.unwrap();
    assert!(!review.accepted);
    assert_eq!(review.revised_sql.unwrap().source, CandidateSource::ReviewerRevised);
    assert_eq!(response.execution.unwrap().row_count, 3);
}

#[tokio::test]
async fn invalid_reviewer_revision_is_ignored() {
    let fx = fixture(
        ScriptedModel::new()
            .generates("SELECT product_title FROM daily_product_sales")
            .reviews(r#"{"reasoning": "x", "ok": false, "fixed_sql": "SELECT secret FROM users"}"#),
    );
    let response = fx.pipeline.ask("Products", Vec::new()).await;

    assert_eq!(
        response.sql.as_deref(),
        Some("SELECT product_title FROM daily_product_sales")
    );
    assert!(response.review.unwrap().revised_sql.is_none());
    assert_eq!(response.execution.unwrap().row_count, 7);
}

#[tokio::test]
async fn rejected_gateway_is_not_retried() {
    let fx = fixture(ScriptedModel::new().generator_fails(GatewayError::Rejected("401 Unauthorized".to_string())));
    let response = fx.pipeline.ask("Top products", Vec::new()).await;

    let error = response.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Rejected);
    assert_eq!(error.stage, Stage::Generation);
    assert_eq!(fx.model.calls(ModelRole::Generator), 1);
}

#[tokio::test]
async fn missing_from_clause_is_repaired() {
    let fx = fixture(
        ScriptedModel::new()
            .generates("SELECT SUM(units) AS total_units WHERE category = 'home'")
            .reviews(ACCEPT),
    );
    let response = fx.pipeline.ask("Units sold in home", Vec::new()).await;

    assert!(response.error.is_none(), "{:?}", response.error);
    assert_eq!(
        response.sql.as_deref(),
        Some("SELECT SUM(units) AS total_units FROM daily_product_sales WHERE category = 'home'")
    );
    assert!(response.warnings.iter().any(|w| w.contains("FROM clause")));
    assert_eq!(response.execution.unwrap().rows, vec![vec![ScalarValue::Int(2)]]);
}

#[tokio::test]
async fn row_cap_truncates_results() {
    let fx = fixture_with(
        ScriptedModel::new()
            .generates("SELECT * FROM daily_product_sales")
            .reviews(ACCEPT),
        PipelineOptions {
            row_limit: 4,
            query_timeout: Duration::from_secs(5),
            review_enabled: true,
        },
    );
    let response = fx.pipeline.ask("Everything", Vec::new()).await;
    let execution = response.execution.unwrap();
    assert!(execution.truncated);
    assert_eq!(execution.row_count, 4);
    assert_eq!(execution.rows.len(), 4);
}

#[tokio::test]
async fn review_can_be_disabled() {
    let fx = fixture_with(
        ScriptedModel::new().generates(TOP_ELECTRONICS),
        PipelineOptions {
            review_enabled: false,
            ..PipelineOptions::default()
        },
    );
    let response = fx.pipeline.ask("Top 3 electronics", Vec::new()).await;
    assert!(response.review.is_none());
    assert!(response.execution.is_some());
    assert_eq!(fx.model.calls(ModelRole::Reviewer), 0);
}

#[tokio::test]
async fn execute_validates_before_running() {
    let fx = fixture(ScriptedModel::new());

    let err = fx
        .pipeline
        .execute("DROP TABLE daily_product_sales")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Validation(_)));

    let result = fx
        .pipeline
        .execute("SELECT category, SUM(units) AS units FROM daily_product_sales GROUP BY category ORDER BY category;")
        .await
        .unwrap();
    assert_eq!(result.row_count, 3);
    assert_eq!(fx.model.calls(ModelRole::Generator), 0);
}

#[tokio::test]
async fn review_operation_on_sql_and_question() {
    let fx = fixture(
        ScriptedModel::new()
            .reviews(ACCEPT)
            .generates(TOP_ELECTRONICS)
            .reviews(r#"{"reasoning": "fine", "ok": true, "fixed_sql": ""}"#),
    );

    let report = fx
        .pipeline
        .review("SELECT product_title FROM daily_product_sales")
        .await
        .unwrap();
    assert!(report.verdict.accepted);
    assert_eq!(fx.model.calls(ModelRole::Generator), 0);

    let report = fx.pipeline.review("Top 3 electronics products").await.unwrap();
    assert!(report.sql.contains("category = 'electronics'"));
    assert_eq!(fx.model.calls(ModelRole::Generator), 1);
    assert_eq!(fx.model.calls(ModelRole::Reviewer), 2);
    assert!(fx
        .model
        .prompt(ModelRole::Reviewer, 1)
        .contains("Question: Top 3 electronics products"));
}

#[tokio::test]
async fn invalid_sql_is_still_reviewed_and_fixed() {
    let fx = fixture(ScriptedModel::new().reviews(
        r#"{"reasoning": "the table has no date column", "ok": false, "fixed_sql": "SELECT day, SUM(revenue) AS revenue FROM daily_product_sales GROUP BY day"}"#,
    ));

    let report = fx
        .pipeline
        .review("SELECT date, SUM(revenue) FROM daily_product_sales GROUP BY date")
        .await
        .unwrap();

    assert_eq!(fx.model.calls(ModelRole::Reviewer), 1);
    assert!(!report.verdict.accepted);
    assert_eq!(
        report.sql,
        "SELECT day, SUM(revenue) AS revenue FROM daily_product_sales GROUP BY day"
    );
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("UnknownColumn") && w.contains("date")));
}

#[tokio::test]
async fn generate_sql_does_not_execute_or_review() {
    let fx = fixture(ScriptedModel::new().generates(TOP_ELECTRONICS));
    let candidate = fx.pipeline.generate_sql("Top 3 electronics").await.unwrap();
    assert_eq!(candidate.source, CandidateSource::Generated);
    assert_eq!(fx.model.calls(ModelRole::Reviewer), 0);
}

#[tokio::test]
async fn history_reaches_the_prompt() {
    let fx = fixture(ScriptedModel::new().generates(TOP_ELECTRONICS).reviews(ACCEPT));
    let history = vec![dataweaver::prompts::Turn {
        question: "Revenue for home goods".to_string(),
        sql: Some("SELECT SUM(revenue) FROM daily_product_sales WHERE category = 'home'".to_string()),
    }];
    fx.pipeline.ask("Now for electronics", history).await;
    assert!(fx
        .model
        .prompt(ModelRole::Generator, 0)
        .contains("Q: Revenue for home goods"));
}

fn get(path: &str) -> HttpRequest {
    HttpRequest {
        method: "GET".to_string(),
        path: path.to_string(),
        headers: HashMap::new(),
        body: Vec::new(),
    }
}

fn post(path: &str, body: &str) -> HttpRequest {
    HttpRequest {
        method: "POST".to_string(),
        path: path.to_string(),
        headers: HashMap::new(),
        body: body.as_bytes().to_vec(),
    }
}

#[tokio::test]
async fn http_routes() {
    let fx = fixture(ScriptedModel::new().generates(TOP_ELECTRONICS).reviews(ACCEPT));

    let health = route(&fx.pipeline, &get("/health")).await;
    assert_eq!(health.status, 200);
    let body: serde_json::Value = serde_json::from_str(&health.body).unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["tables"][0]["rows"], 7);

    let ask = route(&fx.pipeline, &post("/ask", r#"{"question": "Top 3 electronics"}"#)).await;
    assert_eq!(ask.status, 200);
    let body: serde_json::Value = serde_json::from_str(&ask.body).unwrap();
    assert_eq!(body["execution"]["row_count"], 3);
    assert!(body["error"].is_null());

    let exec = route(&fx.pipeline, &post("/execute", r#"{"sql": "DELETE FROM daily_product_sales"}"#)).await;
    assert_eq!(exec.status, 422);
    let body: serde_json::Value = serde_json::from_str(&exec.body).unwrap();
    assert_eq!(body["error"]["kind"], "NotReadOnly");

    assert_eq!(route(&fx.pipeline, &post("/ask", "not json")).await.status, 400);
    assert_eq!(route(&fx.pipeline, &get("/ask")).await.status, 405);
    assert_eq!(route(&fx.pipeline, &get("/nope")).await.status, 404);
}
