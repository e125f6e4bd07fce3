//! Pipeline orchestration: layered settings, the stage runner, and the
//! extract -> match -> load state machine with its poll-wait-timeout loop.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Value as YamlValue};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use goldrec_clients::{
    qualified_table, quote_ident, ColumnDef, JobStatusReport, MatchingClientConfig,
    MatchingError, MatchingService, Row, ServiceJobStatus, Warehouse,
};
use goldrec_core::{MatchJob, MatchJobStatus, PipelineContext, Stage, StageStatus};
use goldrec_storage::{retry_with_backoff, BackoffPolicy, ObjectStore};

pub use goldrec_clients::LoadMode;

pub const CRATE_NAME: &str = "goldrec-pipeline";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("resolving settings")]
    Resolve(#[source] serde_yaml::Error),
    #[error("missing required setting: {field}")]
    Missing { field: &'static str },
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub url: String,
    pub schema: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            schema: "public".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseSettings {
    pub source: ConnectionSettings,
    pub target: ConnectionSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreSettings {
    pub root: PathBuf,
    /// Leading path component for every object this pipeline writes; empty
    /// or `/`-terminated.
    pub prefix: String,
}

impl Default for ObjectStoreSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./objects"),
            prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingSettings {
    pub base_url: String,
    pub api_token: String,
    pub workflow_id: String,
    pub matching_threshold: f64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: String::new(),
            workflow_id: String::new(),
            matching_threshold: 0.9,
            http_timeout_secs: 30,
            user_agent: "goldrec/0.1".to_string(),
        }
    }
}

impl MatchingSettings {
    pub fn client_config(&self) -> MatchingClientConfig {
        MatchingClientConfig {
            base_url: self.base_url.clone(),
            api_token: if self.api_token.is_empty() {
                None
            } else {
                Some(self.api_token.clone())
            },
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            poll_timeout_secs: 3600,
            max_attempts: 3,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 30_000,
        }
    }
}

impl PipelineSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_attempts.saturating_sub(1) as usize,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainSettings {
    pub source_table: String,
    pub target_table: String,
    pub entity_attributes: Vec<String>,
    pub load_mode: LoadMode,
}

impl Default for DomainSettings {
    fn default() -> Self {
        Self {
            source_table: String::new(),
            target_table: "golden_entity_records".to_string(),
            entity_attributes: Vec::new(),
            load_mode: LoadMode::Append,
        }
    }
}

/// The immutable settings object constructed once at process start and
/// passed explicitly to every client and the orchestrator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub warehouse: WarehouseSettings,
    pub object_store: ObjectStoreSettings,
    pub matching: MatchingSettings,
    pub pipeline: PipelineSettings,
    pub notify: NotifySettings,
    pub domains: BTreeMap<String, DomainSettings>,
}

/// Explicit overrides for where configuration is read from; anything unset
/// falls back to the `GOLDREC_CONFIG` / `GOLDREC_SECRETS_FILE` environment
/// variables.
#[derive(Debug, Clone, Default)]
pub struct SettingsSources {
    pub config_file: Option<PathBuf>,
    pub secrets_file: Option<PathBuf>,
}

/// Credential-only fields a secret store may contribute. Everything else in
/// a secrets file is ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SecretsFile {
    warehouse_source_url: Option<String>,
    warehouse_target_url: Option<String>,
    matching_api_token: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum EnvKind {
    Text,
    Integer,
}

/// Recognized environment overrides, highest-precedence configuration
/// source. Each maps onto one settings field.
const ENV_OVERRIDES: &[(&str, &[&str], EnvKind)] = &[
    ("GOLDREC_WAREHOUSE_SOURCE_URL", &["warehouse", "source", "url"], EnvKind::Text),
    ("GOLDREC_WAREHOUSE_TARGET_URL", &["warehouse", "target", "url"], EnvKind::Text),
    ("GOLDREC_OBJECT_STORE_ROOT", &["object_store", "root"], EnvKind::Text),
    ("GOLDREC_OBJECT_STORE_PREFIX", &["object_store", "prefix"], EnvKind::Text),
    ("GOLDREC_MATCHING_BASE_URL", &["matching", "base_url"], EnvKind::Text),
    ("GOLDREC_MATCHING_API_TOKEN", &["matching", "api_token"], EnvKind::Text),
    ("GOLDREC_MATCHING_WORKFLOW_ID", &["matching", "workflow_id"], EnvKind::Text),
    ("GOLDREC_POLL_INTERVAL_SECS", &["pipeline", "poll_interval_secs"], EnvKind::Integer),
    ("GOLDREC_POLL_TIMEOUT_SECS", &["pipeline", "poll_timeout_secs"], EnvKind::Integer),
    ("GOLDREC_MAX_ATTEMPTS", &["pipeline", "max_attempts"], EnvKind::Integer),
    ("GOLDREC_NOTIFY_WEBHOOK_URL", &["notify", "webhook_url"], EnvKind::Text),
];

fn merge_yaml(base: &mut YamlValue, overlay: YamlValue) {
    match (base, overlay) {
        (YamlValue::Mapping(base_map), YamlValue::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn set_path(root: &mut YamlValue, path: &[&str], value: YamlValue) {
    if path.is_empty() {
        return;
    }
    if !matches!(root, YamlValue::Mapping(_)) {
        *root = YamlValue::Mapping(Mapping::new());
    }
    if let YamlValue::Mapping(map) = root {
        let key = YamlValue::String(path[0].to_string());
        if path.len() == 1 {
            map.insert(key, value);
            return;
        }
        if !map.contains_key(&key) {
            map.insert(key.clone(), YamlValue::Mapping(Mapping::new()));
        }
        if let Some(child) = map.get_mut(&key) {
            set_path(child, &path[1..], value);
        }
    }
}

impl Settings {
    /// Loads settings from the configured sources and the process
    /// environment, then validates the result.
    pub fn load(sources: &SettingsSources) -> Result<Settings, ConfigError> {
        let config_path = sources
            .config_file
            .clone()
            .or_else(|| std::env::var_os("GOLDREC_CONFIG").map(PathBuf::from));
        let secrets_path = sources
            .secrets_file
            .clone()
            .or_else(|| std::env::var_os("GOLDREC_SECRETS_FILE").map(PathBuf::from));

        let read = |path: &PathBuf| -> Result<(String, String), ConfigError> {
            let label = path.display().to_string();
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: label.clone(),
                source,
            })?;
            Ok((label, content))
        };
        let file = config_path.as_ref().map(read).transpose()?;
        let secrets = secrets_path.as_ref().map(read).transpose()?;

        let env: Vec<(String, String)> = std::env::vars()
            .filter(|(name, _)| name.starts_with("GOLDREC_"))
            .collect();

        Self::resolve(
            file.as_ref().map(|(l, c)| (l.as_str(), c.as_str())),
            secrets.as_ref().map(|(l, c)| (l.as_str(), c.as_str())),
            &env,
        )
    }

    /// Merges the configuration sources left-to-right (defaults, then
    /// secrets file, then config file, then environment) and validates the
    /// merged result.
    pub fn resolve(
        file: Option<(&str, &str)>,
        secrets: Option<(&str, &str)>,
        env: &[(String, String)],
    ) -> Result<Settings, ConfigError> {
        let mut merged = serde_yaml::to_value(Settings::default()).map_err(ConfigError::Resolve)?;

        if let Some((label, content)) = secrets {
            let parsed: SecretsFile =
                serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
                    path: label.to_string(),
                    source,
                })?;
            if let Some(url) = parsed.warehouse_source_url {
                set_path(&mut merged, &["warehouse", "source", "url"], YamlValue::String(url));
            }
            if let Some(url) = parsed.warehouse_target_url {
                set_path(&mut merged, &["warehouse", "target", "url"], YamlValue::String(url));
            }
            if let Some(token) = parsed.matching_api_token {
                set_path(&mut merged, &["matching", "api_token"], YamlValue::String(token));
            }
        }

        if let Some((label, content)) = file {
            let overlay: YamlValue =
                serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
                    path: label.to_string(),
                    source,
                })?;
            merge_yaml(&mut merged, overlay);
        }

        for (name, raw) in env {
            let Some(&(var, path, kind)) = ENV_OVERRIDES
                .iter()
                .find(|(var, _, _)| *var == name.as_str())
            else {
                continue;
            };
            let value = match kind {
                EnvKind::Text => YamlValue::String(raw.clone()),
                EnvKind::Integer => {
                    let parsed: u64 = raw.parse().map_err(|_| ConfigError::Invalid {
                        field: var,
                        reason: format!("expected an integer, got {raw:?}"),
                    })?;
                    YamlValue::Number(parsed.into())
                }
            };
            set_path(&mut merged, path, value);
        }

        let settings: Settings =
            serde_yaml::from_value(merged).map_err(ConfigError::Resolve)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn required(field: &'static str, value: &str) -> Result<(), ConfigError> {
            if value.trim().is_empty() {
                Err(ConfigError::Missing { field })
            } else {
                Ok(())
            }
        }

        required("warehouse.source.url", &self.warehouse.source.url)?;
        required("warehouse.target.url", &self.warehouse.target.url)?;
        required("matching.base_url", &self.matching.base_url)?;
        required("matching.workflow_id", &self.matching.workflow_id)?;
        if self.object_store.root.as_os_str().is_empty() {
            return Err(ConfigError::Missing {
                field: "object_store.root",
            });
        }
        let prefix = &self.object_store.prefix;
        if !prefix.is_empty() && !prefix.ends_with('/') {
            return Err(ConfigError::Invalid {
                field: "object_store.prefix",
                reason: "must be empty or end with '/'".to_string(),
            });
        }
        if self.pipeline.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.poll_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.pipeline.poll_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.poll_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.pipeline.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        let threshold = self.matching.matching_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "matching.matching_threshold",
                reason: format!("must be within (0, 1], got {threshold}"),
            });
        }
        if self.domains.is_empty() {
            return Err(ConfigError::Missing { field: "domains" });
        }
        for (name, domain) in &self.domains {
            if domain.source_table.trim().is_empty()
                || domain.target_table.trim().is_empty()
                || domain.entity_attributes.is_empty()
            {
                return Err(ConfigError::Invalid {
                    field: "domains",
                    reason: format!(
                        "domain {name} needs source_table, target_table and entity_attributes"
                    ),
                });
            }
        }
        Ok(())
    }
}

/// A stage failure with the stage attached, so the operator always learns
/// which stage failed and why.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: anyhow::Error,
}

impl StageError {
    pub fn new(stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}

fn err_in<E: Into<anyhow::Error>>(stage: Stage) -> impl FnOnce(E) -> StageError {
    move |source| StageError::new(stage, source)
}

#[derive(Debug, Clone)]
pub struct ExtractOutcome {
    pub source_location: String,
    pub record_count_in: u64,
}

#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub job_id: String,
    pub input_location: String,
    pub output_prefix: String,
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub output_location: String,
    pub rows_loaded: u64,
}

fn timestamp_slug() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

pub fn rows_to_ndjson(rows: &[Row]) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for row in rows {
        out.push_str(&serde_json::to_string(row)?);
        out.push('\n');
    }
    Ok(out)
}

/// Matched records arrive either as NDJSON or as one JSON array; an empty
/// object parses to zero records.
pub fn parse_matched_records(text: &str) -> anyhow::Result<Vec<Row>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("parsing matched records as a JSON array");
    }
    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .with_context(|| format!("parsing matched record line: {line}"))
        })
        .collect()
}

/// Lowercases column names and maps the service's `matchid`/`matchscore`
/// aliases onto the target table's `match_id`/`match_score`.
pub fn normalize_matched_row(row: Row) -> Row {
    row.into_iter()
        .map(|(key, value)| {
            let lower = key.to_ascii_lowercase();
            let name = match lower.as_str() {
                "matchid" => "match_id".to_string(),
                "matchscore" => "match_score".to_string(),
                _ => lower,
            };
            (name, value)
        })
        .collect()
}

/// Executes a single pipeline stage against a shared context, delegating all
/// real work to the leaf clients.
pub struct StageRunner {
    settings: Settings,
    store: Arc<dyn ObjectStore>,
    source_warehouse: Arc<dyn Warehouse>,
    target_warehouse: Arc<dyn Warehouse>,
    matching: Arc<dyn MatchingService>,
}

impl StageRunner {
    pub fn new(
        settings: Settings,
        store: Arc<dyn ObjectStore>,
        source_warehouse: Arc<dyn Warehouse>,
        target_warehouse: Arc<dyn Warehouse>,
        matching: Arc<dyn MatchingService>,
    ) -> Self {
        Self {
            settings,
            store,
            source_warehouse,
            target_warehouse,
            matching,
        }
    }

    fn domain(&self, name: &str) -> anyhow::Result<&DomainSettings> {
        self.settings
            .domains
            .get(name)
            .ok_or_else(|| anyhow!("domain {name} is not configured"))
    }

    fn prefix(&self) -> &str {
        &self.settings.object_store.prefix
    }

    pub fn input_prefix(&self, domain: &str) -> String {
        format!("{}{domain}/input/", self.prefix())
    }

    pub fn output_prefix(&self, domain: &str) -> String {
        format!("{}{domain}/output/", self.prefix())
    }

    /// Queries the source table for the context's domain and process date
    /// and serializes the rows to the object store as NDJSON.
    pub async fn extract(&self, ctx: &PipelineContext) -> Result<ExtractOutcome, StageError> {
        let stage = Stage::Extract;
        let domain = self.domain(&ctx.domain).map_err(err_in(stage))?;

        let columns = domain
            .entity_attributes
            .iter()
            .map(|attribute| quote_ident(attribute))
            .collect::<Vec<_>>()
            .join(", ");
        let table = qualified_table(&self.settings.warehouse.source.schema, &domain.source_table);
        let sql = format!("SELECT {columns} FROM {table} WHERE \"process_date\" = $1::date");
        let params = vec![JsonValue::String(ctx.process_date.to_string())];
        let rows = self
            .source_warehouse
            .query(&sql, &params)
            .await
            .map_err(err_in(stage))?;

        let body = rows_to_ndjson(&rows).map_err(err_in(stage))?;
        let key = format!(
            "{}{}/{}/entity_data.json",
            self.input_prefix(&ctx.domain),
            ctx.process_date,
            timestamp_slug()
        );
        self.store
            .put(&key, body.as_bytes())
            .await
            .map_err(err_in(stage))?;

        info!(
            run_id = %ctx.run_id,
            domain = %ctx.domain,
            records = rows.len(),
            location = %key,
            "extract complete"
        );
        Ok(ExtractOutcome {
            source_location: key,
            record_count_in: rows.len() as u64,
        })
    }

    /// Submits a matching job for the context's input. When the context
    /// carries no input location the newest extract output is used.
    pub async fn submit_match(&self, ctx: &PipelineContext) -> Result<SubmitOutcome, StageError> {
        let stage = Stage::Match;
        let input_location = match &ctx.source_location {
            Some(path) => path.clone(),
            None => {
                let prefix = self.input_prefix(&ctx.domain);
                self.store
                    .find_latest(&prefix)
                    .await
                    .map_err(err_in(stage))?
                    .ok_or_else(|| {
                        StageError::new(stage, anyhow!("no input data found under {prefix}"))
                    })?
            }
        };

        let output_prefix = format!(
            "{}{}/{}/",
            self.output_prefix(&ctx.domain),
            ctx.process_date,
            timestamp_slug()
        );
        let job_id = self
            .matching
            .submit(
                &self.settings.matching.workflow_id,
                &input_location,
                &output_prefix,
            )
            .await
            .map_err(err_in(stage))?;

        Ok(SubmitOutcome {
            job_id,
            input_location,
            output_prefix,
        })
    }

    /// Reads the matched records and bulk-loads them into the domain's
    /// target table. An empty output loads zero rows and still succeeds.
    pub async fn load(&self, ctx: &PipelineContext) -> Result<LoadOutcome, StageError> {
        let stage = Stage::Load;
        let domain = self.domain(&ctx.domain).map_err(err_in(stage))?;

        let location = match &ctx.output_location {
            Some(path) => path.clone(),
            None => {
                let prefix = self.output_prefix(&ctx.domain);
                self.store
                    .find_latest(&prefix)
                    .await
                    .map_err(err_in(stage))?
                    .ok_or_else(|| {
                        StageError::new(stage, anyhow!("no matched records found under {prefix}"))
                    })?
            }
        };
        // The service may report a prefix rather than an object.
        let key = if location.ends_with('/') {
            self.store
                .find_latest(&location)
                .await
                .map_err(err_in(stage))?
                .ok_or_else(|| {
                    StageError::new(stage, anyhow!("no objects under output prefix {location}"))
                })?
        } else {
            location
        };

        let bytes = self.store.get(&key).await.map_err(err_in(stage))?;
        let text = String::from_utf8(bytes).map_err(err_in(stage))?;
        let rows: Vec<Row> = parse_matched_records(&text)
            .map_err(err_in(stage))?
            .into_iter()
            .map(normalize_matched_row)
            .collect();

        let table = qualified_table(&self.settings.warehouse.target.schema, &domain.target_table);
        let rows_loaded = self
            .target_warehouse
            .bulk_load(&table, &rows, domain.load_mode)
            .await
            .map_err(err_in(stage))?;

        info!(
            run_id = %ctx.run_id,
            domain = %ctx.domain,
            rows_loaded,
            location = %key,
            "load complete"
        );
        Ok(LoadOutcome {
            output_location: key,
            rows_loaded,
        })
    }

    /// Ensures the domain's target table exists: entity attributes plus the
    /// match metadata columns the service adds.
    pub async fn setup_target_table(&self, domain_name: &str) -> Result<(), StageError> {
        let stage = Stage::Load;
        let domain = self.domain(domain_name).map_err(err_in(stage))?;

        let mut columns: Vec<ColumnDef> = domain
            .entity_attributes
            .iter()
            .map(|attribute| ColumnDef::new(attribute, "TEXT"))
            .collect();
        columns.push(ColumnDef::new("match_id", "TEXT"));
        columns.push(ColumnDef::new("match_score", "DOUBLE PRECISION"));
        columns.push(ColumnDef::new(
            "load_timestamp",
            "TIMESTAMPTZ NOT NULL DEFAULT now()",
        ));

        let table = qualified_table(&self.settings.warehouse.target.schema, &domain.target_table);
        self.target_warehouse
            .ensure_table(&table, &columns)
            .await
            .map_err(err_in(stage))?;
        info!(domain = domain_name, table = %table, "target table ensured");
        Ok(())
    }
}

/// Orchestrator states. `Failed` is absorbing and reachable from every
/// working state; `Succeeded` is the only other terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Extract,
    SubmitMatch,
    PollMatch,
    Load,
    Succeeded,
    Failed,
}

/// The one notification emitted when a run enters `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureNotice {
    pub run_id: Uuid,
    pub domain: String,
    pub failed_stage: Stage,
    pub cause: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &FailureNotice);
}

/// Default notifier: the notice lands in the structured log stream.
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notice: &FailureNotice) {
        error!(
            run_id = %notice.run_id,
            domain = %notice.domain,
            failed_stage = %notice.failed_stage,
            cause = %notice.cause,
            "pipeline run failed"
        );
    }
}

/// Posts the failure notice as JSON to a configured webhook. Delivery
/// problems are logged, never raised: notification must not mask the
/// original failure.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building notification client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notice: &FailureNotice) {
        let result = self
            .client
            .post(&self.url)
            .json(notice)
            .send()
            .await
            .and_then(|response| response.error_for_status());
        if let Err(err) = result {
            warn!(url = %self.url, error = %err, "failure notification was not delivered");
        }
    }
}

enum PollOutcome {
    Succeeded(JobStatusReport),
    Failed { job_id: String, detail: String },
    TimedOut { job_id: String, elapsed: Duration },
}

/// Sequences the stages for one run, persisting the context after every
/// transition and applying retry, poll-timeout, and notification policy.
pub struct Orchestrator {
    settings: Settings,
    runner: StageRunner,
    store: Arc<dyn ObjectStore>,
    matching: Arc<dyn MatchingService>,
    notifier: Arc<dyn Notifier>,
}

impl Orchestrator {
    pub fn new(
        settings: Settings,
        store: Arc<dyn ObjectStore>,
        source_warehouse: Arc<dyn Warehouse>,
        target_warehouse: Arc<dyn Warehouse>,
        matching: Arc<dyn MatchingService>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let runner = StageRunner::new(
            settings.clone(),
            store.clone(),
            source_warehouse,
            target_warehouse,
            matching.clone(),
        );
        Self {
            settings,
            runner,
            store,
            matching,
            notifier,
        }
    }

    pub fn context_key(&self, run_id: Uuid) -> String {
        format!("{}runs/{run_id}.json", self.settings.object_store.prefix)
    }

    /// Runs the full pipeline for one (domain, process_date), creating a
    /// fresh run id.
    pub async fn run(
        &self,
        domain: &str,
        process_date: NaiveDate,
    ) -> anyhow::Result<PipelineContext> {
        self.ensure_domain(domain)?;
        let ctx = PipelineContext::new(domain, process_date);
        info!(run_id = %ctx.run_id, domain, %process_date, "starting pipeline run");
        self.drive(ctx, RunState::Init, RunState::Succeeded).await
    }

    /// Re-enters a persisted run at the first stage that has not succeeded.
    pub async fn resume(&self, run_id: Uuid) -> anyhow::Result<PipelineContext> {
        let mut ctx = self.load_context(run_id).await?;
        ctx.reset_for_resume();
        let entry = match ctx.next_stage() {
            None => {
                info!(%run_id, "run already complete, nothing to resume");
                return Ok(ctx);
            }
            Some(Stage::Extract) => RunState::Extract,
            Some(Stage::Match) => RunState::SubmitMatch,
            Some(Stage::Load) => RunState::Load,
        };
        info!(%run_id, domain = %ctx.domain, ?entry, "resuming pipeline run");
        self.drive(ctx, entry, RunState::Succeeded).await
    }

    /// Submits and (optionally) polls a matching job over already-extracted
    /// input, stopping before the load stage.
    pub async fn run_process(
        &self,
        domain: &str,
        process_date: NaiveDate,
        input_uri: Option<String>,
        wait: bool,
    ) -> anyhow::Result<PipelineContext> {
        self.ensure_domain(domain)?;
        let mut ctx = PipelineContext::new(domain, process_date);
        ctx.source_location = input_uri;
        let exit = if wait { RunState::Load } else { RunState::PollMatch };
        self.drive(ctx, RunState::SubmitMatch, exit).await
    }

    /// Runs the load stage alone, against an explicit output object or the
    /// newest one under the domain's output prefix.
    pub async fn run_load(
        &self,
        domain: &str,
        process_date: NaiveDate,
        input_uri: Option<String>,
    ) -> anyhow::Result<PipelineContext> {
        self.ensure_domain(domain)?;
        let mut ctx = PipelineContext::new(domain, process_date);
        ctx.output_location = input_uri;
        self.drive(ctx, RunState::Load, RunState::Succeeded).await
    }

    /// Runs the extract stage alone.
    pub async fn run_extract(
        &self,
        domain: &str,
        process_date: NaiveDate,
    ) -> anyhow::Result<PipelineContext> {
        self.ensure_domain(domain)?;
        let ctx = PipelineContext::new(domain, process_date);
        self.drive(ctx, RunState::Extract, RunState::SubmitMatch).await
    }

    pub async fn setup(&self, domain: &str) -> anyhow::Result<()> {
        self.runner.setup_target_table(domain).await?;
        Ok(())
    }

    /// One status snapshot straight from the matching service.
    pub async fn job_status(&self, job_id: &str) -> Result<JobStatusReport, MatchingError> {
        self.matching.get_status(job_id).await
    }

    /// Operator-initiated cancellation of a submitted job, so abandoning a
    /// run does not orphan the service-side work.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), MatchingError> {
        self.matching.cancel(job_id).await
    }

    pub async fn load_context(&self, run_id: Uuid) -> anyhow::Result<PipelineContext> {
        let key = self.context_key(run_id);
        let bytes = self
            .store
            .get(&key)
            .await
            .with_context(|| format!("reading pipeline context {key}"))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing pipeline context {key}"))
    }

    fn ensure_domain(&self, domain: &str) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.settings.domains.contains_key(domain),
            "domain {domain} is not configured"
        );
        Ok(())
    }

    fn backoff(&self) -> BackoffPolicy {
        self.settings.pipeline.backoff_policy()
    }

    async fn persist(&self, ctx: &PipelineContext) -> anyhow::Result<()> {
        let key = self.context_key(ctx.run_id);
        let bytes = serde_json::to_vec_pretty(ctx).context("serializing pipeline context")?;
        self.store
            .put(&key, &bytes)
            .await
            .with_context(|| format!("persisting pipeline context to {key}"))
    }

    async fn fail(
        &self,
        ctx: &mut PipelineContext,
        stage: Stage,
        err: impl Into<anyhow::Error>,
    ) -> anyhow::Result<()> {
        let err = err.into();
        let cause = format!("{err:#}");
        ctx.mark_failed(stage, cause.clone());
        ctx.finished_at = Some(Utc::now());
        self.persist(ctx).await?;
        let notice = FailureNotice {
            run_id: ctx.run_id,
            domain: ctx.domain.clone(),
            failed_stage: stage,
            cause,
        };
        self.notifier.notify(&notice).await;
        Ok(())
    }

    /// Drives the state machine from `entry` until it reaches `exit` or a
    /// terminal state. Only object-store persistence problems surface as
    /// errors; stage failures end in a `Failed` context.
    async fn drive(
        &self,
        mut ctx: PipelineContext,
        entry: RunState,
        exit: RunState,
    ) -> anyhow::Result<PipelineContext> {
        let mut state = entry;
        let mut job: Option<MatchJob> = None;

        while state != exit && !matches!(state, RunState::Succeeded | RunState::Failed) {
            state = match state {
                RunState::Init | RunState::Extract => {
                    ctx.set_stage_status(Stage::Extract, StageStatus::Running);
                    self.persist(&ctx).await?;
                    let attempts = AtomicU32::new(0);
                    let result = retry_with_backoff(self.backoff(), "extract", |attempt| {
                        attempts.store(attempt, Ordering::Relaxed);
                        self.runner.extract(&ctx)
                    })
                    .await;
                    ctx.record_attempts(Stage::Extract, attempts.load(Ordering::Relaxed));
                    match result {
                        Ok(outcome) => {
                            ctx.source_location = Some(outcome.source_location);
                            ctx.record_count_in = outcome.record_count_in;
                            ctx.set_stage_status(Stage::Extract, StageStatus::Succeeded);
                            self.persist(&ctx).await?;
                            RunState::SubmitMatch
                        }
                        Err(err) => {
                            self.fail(&mut ctx, Stage::Extract, err).await?;
                            RunState::Failed
                        }
                    }
                }
                RunState::SubmitMatch => {
                    ctx.set_stage_status(Stage::Match, StageStatus::Running);
                    self.persist(&ctx).await?;
                    let attempts = AtomicU32::new(0);
                    let result = retry_with_backoff(self.backoff(), "submit-match", |attempt| {
                        attempts.store(attempt, Ordering::Relaxed);
                        self.runner.submit_match(&ctx)
                    })
                    .await;
                    ctx.record_attempts(Stage::Match, attempts.load(Ordering::Relaxed));
                    match result {
                        Ok(outcome) => {
                            if ctx.source_location.is_none() {
                                ctx.source_location = Some(outcome.input_location);
                            }
                            ctx.job_id = Some(outcome.job_id.clone());
                            // The submission timestamp starts the poll
                            // timeout budget.
                            job = Some(MatchJob::new(outcome.job_id, Utc::now()));
                            self.persist(&ctx).await?;
                            info!(
                                run_id = %ctx.run_id,
                                job_id = ctx.job_id.as_deref().unwrap_or_default(),
                                "matching job submitted"
                            );
                            RunState::PollMatch
                        }
                        Err(err) => {
                            self.fail(&mut ctx, Stage::Match, err).await?;
                            RunState::Failed
                        }
                    }
                }
                RunState::PollMatch => {
                    let outcome = match job.as_mut() {
                        Some(active) => self.poll_until_terminal(active).await,
                        None => {
                            self.fail(
                                &mut ctx,
                                Stage::Match,
                                anyhow!("no matching job in flight to poll"),
                            )
                            .await?;
                            break;
                        }
                    };
                    match outcome {
                        PollOutcome::Succeeded(report) => {
                            if ctx.record_count_in == 0 {
                                if let Some(count) = report.input_record_count {
                                    ctx.record_count_in = count;
                                }
                            }
                            if let Some(count) = report.matched_record_count {
                                ctx.record_count_matched = count;
                            }
                            ctx.output_location = report.output_location;
                            ctx.set_stage_status(Stage::Match, StageStatus::Succeeded);
                            self.persist(&ctx).await?;
                            RunState::Load
                        }
                        PollOutcome::Failed { job_id, detail } => {
                            self.fail(
                                &mut ctx,
                                Stage::Match,
                                anyhow!("matching job {job_id} failed: {detail}"),
                            )
                            .await?;
                            RunState::Failed
                        }
                        PollOutcome::TimedOut { job_id, elapsed } => {
                            self.fail(
                                &mut ctx,
                                Stage::Match,
                                anyhow!(
                                    "matching job {job_id} timed out after {elapsed:?} (budget {:?})",
                                    self.settings.pipeline.poll_timeout()
                                ),
                            )
                            .await?;
                            RunState::Failed
                        }
                    }
                }
                RunState::Load => {
                    ctx.set_stage_status(Stage::Load, StageStatus::Running);
                    self.persist(&ctx).await?;
                    let attempts = AtomicU32::new(0);
                    let result = retry_with_backoff(self.backoff(), "load", |attempt| {
                        attempts.store(attempt, Ordering::Relaxed);
                        self.runner.load(&ctx)
                    })
                    .await;
                    ctx.record_attempts(Stage::Load, attempts.load(Ordering::Relaxed));
                    match result {
                        Ok(outcome) => {
                            ctx.output_location = Some(outcome.output_location);
                            if ctx.record_count_matched == 0 {
                                ctx.record_count_matched = outcome.rows_loaded;
                            }
                            ctx.set_stage_status(Stage::Load, StageStatus::Succeeded);
                            ctx.finished_at = Some(Utc::now());
                            self.persist(&ctx).await?;
                            info!(
                                run_id = %ctx.run_id,
                                rows_loaded = outcome.rows_loaded,
                                "pipeline run succeeded"
                            );
                            RunState::Succeeded
                        }
                        Err(err) => {
                            self.fail(&mut ctx, Stage::Load, err).await?;
                            RunState::Failed
                        }
                    }
                }
                RunState::Succeeded | RunState::Failed => state,
            };
        }
        Ok(ctx)
    }

    /// The poll-wait loop, the single suspension point in the pipeline:
    /// sleep a fixed interval between idempotent status checks until the job
    /// reaches a terminal state or the wall-clock budget since submission
    /// runs out. Transient status errors are logged and swallowed; a timeout
    /// cancels the job best-effort before giving up.
    async fn poll_until_terminal(&self, job: &mut MatchJob) -> PollOutcome {
        let poll_interval = self.settings.pipeline.poll_interval();
        let timeout = self.settings.pipeline.poll_timeout();

        loop {
            match self.matching.get_status(&job.job_id).await {
                Ok(report) => {
                    job.last_polled_at = Some(Utc::now());
                    match report.status {
                        ServiceJobStatus::Succeeded => {
                            job.status = MatchJobStatus::Succeeded;
                            return PollOutcome::Succeeded(report);
                        }
                        ServiceJobStatus::Failed => {
                            job.status = MatchJobStatus::Failed;
                            return PollOutcome::Failed {
                                job_id: job.job_id.clone(),
                                detail: report
                                    .error_detail
                                    .unwrap_or_else(|| "no error detail reported".to_string()),
                            };
                        }
                        ServiceJobStatus::Submitted => {
                            job.status = MatchJobStatus::Submitted;
                        }
                        ServiceJobStatus::Running => {
                            job.status = MatchJobStatus::Running;
                            debug!(job_id = %job.job_id, "matching job still running");
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        job_id = %job.job_id,
                        error = %err,
                        "transient error polling job status, will poll again"
                    );
                }
            }

            let elapsed = job.elapsed(Utc::now()).to_std().unwrap_or_default();
            if elapsed >= timeout {
                if let Err(err) = self.matching.cancel(&job.job_id).await {
                    warn!(job_id = %job.job_id, error = %err, "cancel after timeout failed");
                }
                job.status = MatchJobStatus::TimedOut;
                return PollOutcome::TimedOut {
                    job_id: job.job_id.clone(),
                    elapsed,
                };
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_file_yaml() -> &'static str {
        r#"
warehouse:
  source: { url: "postgres://source-db/analytics" }
  target: { url: "postgres://target-db/golden", schema: "golden" }
matching:
  base_url: "https://matching.internal"
  workflow_id: "wf-1"
domains:
  customers:
    source_table: "customer_staging"
    target_table: "golden_customers"
    entity_attributes: ["name", "email", "phone"]
"#
    }

    #[test]
    fn file_settings_overlay_defaults() {
        let settings =
            Settings::resolve(Some(("config.yaml", minimal_file_yaml())), None, &[])
                .expect("resolve settings");
        assert_eq!(settings.warehouse.source.url, "postgres://source-db/analytics");
        assert_eq!(settings.warehouse.source.schema, "public");
        assert_eq!(settings.warehouse.target.schema, "golden");
        assert_eq!(settings.pipeline.poll_interval_secs, 60);
        assert_eq!(settings.matching.matching_threshold, 0.9);
        let domain = settings.domains.get("customers").expect("domain");
        assert_eq!(domain.load_mode, LoadMode::Append);
    }

    #[test]
    fn precedence_is_env_over_file_over_secrets() {
        let secrets = r#"
warehouse_source_url: "postgres://secrets-db/analytics"
matching_api_token: "token-from-secrets"
"#;
        let file = format!(
            "{}\nobject_store: {{ prefix: \"file-prefix/\" }}\n",
            minimal_file_yaml()
        );
        let env = vec![(
            "GOLDREC_OBJECT_STORE_PREFIX".to_string(),
            "env-prefix/".to_string(),
        )];

        let settings = Settings::resolve(
            Some(("config.yaml", file.as_str())),
            Some(("secrets.yaml", secrets)),
            &env,
        )
        .expect("resolve settings");

        // file beats secrets, env beats file
        assert_eq!(settings.warehouse.source.url, "postgres://source-db/analytics");
        assert_eq!(settings.matching.api_token, "token-from-secrets");
        assert_eq!(settings.object_store.prefix, "env-prefix/");
    }

    #[test]
    fn missing_workflow_id_fails_validation() {
        let file = r#"
warehouse:
  source: { url: "postgres://a" }
  target: { url: "postgres://b" }
matching:
  base_url: "https://matching.internal"
domains:
  customers:
    source_table: "t"
    entity_attributes: ["name"]
"#;
        let err = Settings::resolve(Some(("config.yaml", file)), None, &[])
            .expect_err("must fail validation");
        assert!(matches!(
            err,
            ConfigError::Missing {
                field: "matching.workflow_id"
            }
        ));
    }

    #[test]
    fn prefix_without_trailing_slash_is_rejected() {
        let file = format!(
            "{}\nobject_store: {{ prefix: \"no-slash\" }}\n",
            minimal_file_yaml()
        );
        let err = Settings::resolve(Some(("config.yaml", file.as_str())), None, &[])
            .expect_err("must fail validation");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "object_store.prefix",
                ..
            }
        ));
    }

    #[test]
    fn non_numeric_env_override_is_rejected() {
        let env = vec![(
            "GOLDREC_POLL_INTERVAL_SECS".to_string(),
            "soon".to_string(),
        )];
        let err = Settings::resolve(Some(("config.yaml", minimal_file_yaml())), None, &env)
            .expect_err("must fail");
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn parse_matched_records_accepts_ndjson_and_arrays() {
        let ndjson = "{\"name\":\"a\"}\n\n{\"name\":\"b\"}\n";
        let rows = parse_matched_records(ndjson).expect("ndjson");
        assert_eq!(rows.len(), 2);

        let array = r#"[{"name":"a"},{"name":"b"},{"name":"c"}]"#;
        let rows = parse_matched_records(array).expect("array");
        assert_eq!(rows.len(), 3);

        let rows = parse_matched_records("   \n  ").expect("empty");
        assert!(rows.is_empty());
    }

    #[test]
    fn normalize_matched_row_maps_service_aliases() {
        let mut row = Row::new();
        row.insert("Name".to_string(), JsonValue::String("acme".into()));
        row.insert("MatchId".to_string(), JsonValue::String("m-1".into()));
        row.insert("matchScore".to_string(), JsonValue::from(0.97));

        let row = normalize_matched_row(row);
        assert!(row.contains_key("name"));
        assert_eq!(row.get("match_id"), Some(&JsonValue::String("m-1".into())));
        assert_eq!(row.get("match_score"), Some(&JsonValue::from(0.97)));
    }

    #[test]
    fn rows_to_ndjson_emits_one_line_per_row() {
        let mut row = Row::new();
        row.insert("name".to_string(), JsonValue::String("acme".into()));
        let text = rows_to_ndjson(&[row.clone(), row]).expect("serialize");
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }
}
