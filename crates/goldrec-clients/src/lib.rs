//! Warehouse and matching-service clients behind traits, so the orchestrator
//! can run against fakes in tests.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "goldrec-clients";

/// A warehouse row as a column-name to value mapping.
pub type Row = BTreeMap<String, JsonValue>;

/// Rows per INSERT statement; keeps bind-parameter counts well under the
/// Postgres protocol limit for any plausible column width.
const BULK_LOAD_CHUNK: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("connecting to warehouse")]
    Connect(#[source] sqlx::Error),
    #[error("warehouse query failed")]
    Query(#[source] sqlx::Error),
    #[error("bulk load failed after {rows_loaded} rows committed")]
    Load {
        rows_loaded: u64,
        #[source]
        source: sqlx::Error,
    },
}

impl WarehouseError {
    /// Rows durably committed before the failure; 0 for non-load errors.
    pub fn rows_loaded(&self) -> u64 {
        match self {
            WarehouseError::Load { rows_loaded, .. } => *rows_loaded,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Append,
    TruncateThenAppend,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// SQL type plus any default clause, e.g. `TIMESTAMPTZ DEFAULT now()`.
    pub definition: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: definition.into(),
        }
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Runs a parameterized query. Values always travel as bind parameters,
    /// never interpolated into the SQL text.
    async fn query(&self, sql: &str, params: &[JsonValue]) -> Result<Vec<Row>, WarehouseError>;

    /// Loads rows in chunked commits and returns the count loaded. On
    /// failure the error carries how many rows were committed before it.
    async fn bulk_load(
        &self,
        table: &str,
        rows: &[Row],
        mode: LoadMode,
    ) -> Result<u64, WarehouseError>;

    async fn ensure_table(
        &self,
        table: &str,
        columns: &[ColumnDef],
    ) -> Result<(), WarehouseError>;
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

pub fn insert_statement(table: &str, columns: &[String], row_count: usize) -> String {
    let cols = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut groups = Vec::with_capacity(row_count);
    let mut placeholder = 1usize;
    for _ in 0..row_count {
        let row = (0..columns.len())
            .map(|_| {
                let p = format!("${placeholder}");
                placeholder += 1;
                p
            })
            .collect::<Vec<_>>()
            .join(", ");
        groups.push(format!("({row})"));
    }
    format!(
        "INSERT INTO {table} ({cols}) VALUES {}",
        groups.join(", ")
    )
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &JsonValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        JsonValue::Null => query.bind(Option::<String>::None),
        JsonValue::Bool(b) => query.bind(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64())
            }
        }
        JsonValue::String(s) => query.bind(s.clone()),
        other => query.bind(other.clone()),
    }
}

fn column_value(row: &PgRow, index: usize) -> JsonValue {
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map(JsonValue::String).unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(JsonValue::from).unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<i32>, _>(index) {
        return value.map(JsonValue::from).unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return value.map(JsonValue::Bool).unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<NaiveDate>, _>(index) {
        return value
            .map(|d| JsonValue::String(d.to_string()))
            .unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<DateTime<Utc>>, _>(index) {
        return value
            .map(|t| JsonValue::String(t.to_rfc3339()))
            .unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<Uuid>, _>(index) {
        return value
            .map(|u| JsonValue::String(u.to_string()))
            .unwrap_or(JsonValue::Null);
    }
    if let Ok(value) = row.try_get::<Option<JsonValue>, _>(index) {
        return value.unwrap_or(JsonValue::Null);
    }
    JsonValue::Null
}

fn row_to_record(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(index, column)| (column.name().to_string(), column_value(row, index)))
        .collect()
}

/// Postgres-backed warehouse client. Connections are established lazily so
/// commands that never touch the warehouse do not require one.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn connect_lazy(url: &str) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)
            .map_err(WarehouseError::Connect)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn query(&self, sql: &str, params: &[JsonValue]) -> Result<Vec<Row>, WarehouseError> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(WarehouseError::Query)?;
        Ok(rows.iter().map(row_to_record).collect())
    }

    async fn bulk_load(
        &self,
        table: &str,
        rows: &[Row],
        mode: LoadMode,
    ) -> Result<u64, WarehouseError> {
        if mode == LoadMode::TruncateThenAppend {
            sqlx::query(&format!("TRUNCATE TABLE {table}"))
                .execute(&self.pool)
                .await
                .map_err(|source| WarehouseError::Load {
                    rows_loaded: 0,
                    source,
                })?;
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let columns: Vec<String> = rows[0].keys().cloned().collect();
        let mut loaded = 0u64;
        for chunk in rows.chunks(BULK_LOAD_CHUNK) {
            let sql = insert_statement(table, &columns, chunk.len());
            let mut query = sqlx::query(&sql);
            for row in chunk {
                for column in &columns {
                    query = bind_value(query, row.get(column).unwrap_or(&JsonValue::Null));
                }
            }
            query
                .execute(&self.pool)
                .await
                .map_err(|source| WarehouseError::Load {
                    rows_loaded: loaded,
                    source,
                })?;
            loaded += chunk.len() as u64;
            debug!(table, loaded, "bulk load chunk committed");
        }
        Ok(loaded)
    }

    async fn ensure_table(
        &self,
        table: &str,
        columns: &[ColumnDef],
    ) -> Result<(), WarehouseError> {
        let cols = columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), c.definition))
            .collect::<Vec<_>>()
            .join(", ");
        sqlx::query(&format!("CREATE TABLE IF NOT EXISTS {table} ({cols})"))
            .execute(&self.pool)
            .await
            .map_err(WarehouseError::Query)?;
        Ok(())
    }
}

/// Job status as reported by the matching service itself. The orchestrator's
/// client-side terminal states (timed out, cancelled) are layered on top in
/// the core model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceJobStatus {
    Submitted,
    Running,
    Succeeded,
    Failed,
}

/// One status snapshot for a submitted job. Fields beyond `status` are the
/// versioned external contract: present when the service has them, absent
/// otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: String,
    pub status: ServiceJobStatus,
    #[serde(default)]
    pub output_location: Option<String>,
    #[serde(default)]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub input_record_count: Option<u64>,
    #[serde(default)]
    pub matched_record_count: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum MatchingError {
    #[error("job submission rejected for workflow {workflow_id}: {detail}")]
    Submission { workflow_id: String, detail: String },
    #[error("matching service returned {status} for {url}: {detail}")]
    Api {
        status: u16,
        url: String,
        detail: String,
    },
    #[error("matching service request failed")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait MatchingService: Send + Sync {
    /// Submits a job and returns its id. Rejections (unknown workflow,
    /// unreadable input) surface here rather than later through polling.
    async fn submit(
        &self,
        workflow_id: &str,
        input_location: &str,
        output_prefix: &str,
    ) -> Result<String, MatchingError>;

    /// Idempotent, side-effect-free status snapshot.
    async fn get_status(&self, job_id: &str) -> Result<JobStatusReport, MatchingError>;

    /// Best-effort cancellation; a job that already reached a terminal state
    /// is not an error.
    async fn cancel(&self, job_id: &str) -> Result<(), MatchingError>;
}

#[derive(Debug, Clone)]
pub struct MatchingClientConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for MatchingClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: None,
            timeout: Duration::from_secs(30),
            user_agent: Some("goldrec/0.1".to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct SubmitJobRequest<'a> {
    input_location: &'a str,
    output_prefix: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubmitJobResponse {
    job_id: String,
}

/// Client for the matching service's REST contract.
#[derive(Debug, Clone)]
pub struct HttpMatchingService {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpMatchingService {
    pub fn new(config: MatchingClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building matching service client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token,
        })
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut request = self.client.request(method, url);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        request
    }

    async fn error_detail(response: reqwest::Response) -> String {
        response.text().await.unwrap_or_default()
    }
}

#[async_trait]
impl MatchingService for HttpMatchingService {
    async fn submit(
        &self,
        workflow_id: &str,
        input_location: &str,
        output_prefix: &str,
    ) -> Result<String, MatchingError> {
        let url = format!("{}/v1/workflows/{workflow_id}/jobs", self.base_url);
        let response = self
            .request(Method::POST, &url)
            .json(&SubmitJobRequest {
                input_location,
                output_prefix,
            })
            .send()
            .await?;

        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY
        ) {
            return Err(MatchingError::Submission {
                workflow_id: workflow_id.to_string(),
                detail: Self::error_detail(response).await,
            });
        }
        if !status.is_success() {
            return Err(MatchingError::Api {
                status: status.as_u16(),
                url,
                detail: Self::error_detail(response).await,
            });
        }
        let body: SubmitJobResponse = response.json().await?;
        Ok(body.job_id)
    }

    async fn get_status(&self, job_id: &str) -> Result<JobStatusReport, MatchingError> {
        let url = format!("{}/v1/jobs/{job_id}", self.base_url);
        let response = self.request(Method::GET, &url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MatchingError::Api {
                status: status.as_u16(),
                url,
                detail: Self::error_detail(response).await,
            });
        }
        Ok(response.json().await?)
    }

    async fn cancel(&self, job_id: &str) -> Result<(), MatchingError> {
        let url = format!("{}/v1/jobs/{job_id}/cancel", self.base_url);
        let response = self.request(Method::POST, &url).send().await?;
        let status = response.status();
        if status == StatusCode::CONFLICT {
            // Cancellation raced completion; the job is already terminal.
            debug!(job_id, "cancel skipped, job already terminal");
            return Ok(());
        }
        if !status.is_success() {
            return Err(MatchingError::Api {
                status: status.as_u16(),
                url,
                detail: Self::error_detail(response).await,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    #[test]
    fn qualified_table_quotes_both_parts() {
        assert_eq!(
            qualified_table("golden", "entity_records"),
            "\"golden\".\"entity_records\""
        );
    }

    #[test]
    fn insert_statement_numbers_placeholders_across_rows() {
        let columns = vec!["id".to_string(), "match_id".to_string()];
        let sql = insert_statement("\"golden\".\"records\"", &columns, 2);
        assert_eq!(
            sql,
            "INSERT INTO \"golden\".\"records\" (\"id\", \"match_id\") VALUES ($1, $2), ($3, $4)"
        );
    }

    #[test]
    fn job_status_report_parses_minimal_payload() {
        let report: JobStatusReport =
            serde_json::from_str(r#"{"job_id":"job-123","status":"running"}"#)
                .expect("parse report");
        assert_eq!(report.status, ServiceJobStatus::Running);
        assert_eq!(report.output_location, None);
        assert_eq!(report.error_detail, None);
    }

    #[test]
    fn job_status_report_parses_full_payload() {
        let report: JobStatusReport = serde_json::from_str(
            r#"{
                "job_id": "job-123",
                "status": "succeeded",
                "output_location": "customers/output/2024-01-01/20240101_120000/results.json",
                "input_record_count": 120,
                "matched_record_count": 87
            }"#,
        )
        .expect("parse report");
        assert_eq!(report.status, ServiceJobStatus::Succeeded);
        assert_eq!(report.input_record_count, Some(120));
        assert_eq!(report.matched_record_count, Some(87));
    }

    #[test]
    fn load_error_exposes_partial_count() {
        let err = WarehouseError::Load {
            rows_loaded: 2000,
            source: sqlx::Error::PoolClosed,
        };
        assert_eq!(err.rows_loaded(), 2000);
        assert_eq!(WarehouseError::Connect(sqlx::Error::PoolClosed).rows_loaded(), 0);
    }
}
