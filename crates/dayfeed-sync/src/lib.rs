//! Feed run orchestration: configuration, the document store, the per-date
//! upsert and retention.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use chrono_tz::Tz;
use dayfeed_adapters::{decode_payload, local_midnight_utc, FeedSchema, RowNormalizer, SchemaError};
use dayfeed_core::{
    AggregateDocument, NormalizedRow, TargetWindow, UrlError, ROWS_FIELD, TARGET_DATE_FIELD,
    UPDATED_AT_FIELD,
};
use dayfeed_storage::{
    HttpClientConfig, Payload, PayloadArchive, PollingDownloader, RetrySchedule, TerminalFailure,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MIN_BODY_BYTES, DEFAULT_USER_AGENT,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::{Postgres, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dayfeed-sync";

pub const DEFAULT_CONFIG_FILE: &str = "feeds.yaml";
pub const LOCAL_CONFIG_FILE: &str = "feeds.local.yaml";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// `$$`, `${VAR}`, `${VAR:-default}`, `${VAR-default}` and `$VAR`.
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        |
        \$\{
            ([A-Za-z_][A-Za-z0-9_]*)
            (?:
                (:?-)
                ([^}]*)
            )?
        \}
        |
        \$([A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("env var pattern is valid")
});

#[derive(Debug)]
pub struct InterpolationResult {
    pub text: String,
    /// Every unresolved reference, so they can be reported together.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Substitute environment variables into raw config text.
pub fn interpolate(input: &str) -> InterpolationResult {
    let mut errors = Vec::new();

    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            let full_match = caps.get(0).map_or("", |m| m.as_str());
            if full_match == "$$" {
                return "$".to_string();
            }

            let var_name = caps
                .get(1)
                .or_else(|| caps.get(4))
                .map_or("", |m| m.as_str());
            let default_syntax = caps.get(2).map(|m| m.as_str());
            let default_value = caps.get(3).map(|m| m.as_str());

            match std::env::var(var_name) {
                Ok(value) if value.contains('\n') || value.contains('\r') => {
                    errors.push(format!(
                        "environment variable '{var_name}' contains newlines, which is not allowed"
                    ));
                    full_match.to_string()
                }
                Ok(value) if value.is_empty() && default_syntax == Some(":-") => {
                    default_value.unwrap_or("").to_string()
                }
                Ok(value) => value,
                Err(_) => match default_value {
                    Some(default) => default.to_string(),
                    None => {
                        errors.push(format!("environment variable '{var_name}' is not set"));
                        full_match.to_string()
                    }
                },
            }
        })
        .to_string();

    InterpolationResult { text, errors }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unresolved environment references in {}: {}", path.display(), errors.join("; "))]
    Interpolation { path: PathBuf, errors: Vec<String> },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("no feeds configured")]
    NoFeeds,
    #[error("unknown feed {0:?}")]
    UnknownFeed(String),
    #[error("several feeds configured and no default_feed; pass --feed")]
    NoFeedSelected,
    #[error("feed {feed:?}: {source}")]
    InvalidFeed {
        feed: String,
        #[source]
        source: SchemaError,
    },
    #[error("feed {0:?} has an empty url_template")]
    EmptyUrlTemplate(String),
    #[error("invalid http settings: {0}")]
    InvalidHttp(String),
    #[error("no database url: set database.url or DATABASE_URL")]
    MissingDatabaseUrl,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl DatabaseConfig {
    /// Configured url, else `DATABASE_URL`.
    pub fn resolve_url(&self) -> Result<String, ConfigError> {
        self.url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| std::env::var("DATABASE_URL").ok().filter(|u| !u.trim().is_empty()))
            .ok_or(ConfigError::MissingDatabaseUrl)
    }
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_min_body_bytes() -> usize {
    DEFAULT_MIN_BODY_BYTES
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_min_body_bytes")]
    pub min_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            min_body_bytes: default_min_body_bytes(),
        }
    }
}

impl HttpConfig {
    pub fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn schedule(&self) -> RetrySchedule {
        RetrySchedule::default().with_max_attempts(self.max_attempts)
    }

    pub fn build_downloader(&self) -> anyhow::Result<PollingDownloader> {
        Ok(PollingDownloader::from_http_config(&self.client_config())?
            .with_schedule(self.schedule())
            .with_min_body_bytes(self.min_body_bytes))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub url_template: String,
    /// Defaults to the feed key.
    #[serde(default)]
    pub collection: String,
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(flatten)]
    pub schema: FeedSchema,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
    #[serde(default)]
    pub default_feed: Option<String>,
    #[serde(default)]
    pub feeds: BTreeMap<String, FeedConfig>,
}

impl AppConfig {
    /// Interpolate, parse and validate config text. `origin` is only used in errors.
    pub fn from_yaml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let interpolated = interpolate(text);
        if !interpolated.is_ok() {
            return Err(ConfigError::Interpolation {
                path: origin.to_path_buf(),
                errors: interpolated.errors,
            });
        }
        let mut config: AppConfig =
            serde_yaml::from_str(&interpolated.text).map_err(|source| ConfigError::Parse {
                path: origin.to_path_buf(),
                source,
            })?;
        for (key, feed) in config.feeds.iter_mut() {
            if feed.collection.trim().is_empty() {
                feed.collection = key.clone();
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feeds.is_empty() {
            return Err(ConfigError::NoFeeds);
        }
        for (key, feed) in &self.feeds {
            if feed.url_template.trim().is_empty() {
                return Err(ConfigError::EmptyUrlTemplate(key.clone()));
            }
            feed.schema
                .validate()
                .map_err(|source| ConfigError::InvalidFeed {
                    feed: key.clone(),
                    source,
                })?;
        }
        if let Some(default) = &self.default_feed {
            if !self.feeds.contains_key(default) {
                return Err(ConfigError::UnknownFeed(default.clone()));
            }
        }
        if self.http.max_attempts == 0 {
            return Err(ConfigError::InvalidHttp("max_attempts must be at least 1".into()));
        }
        if self.http.timeout_secs == 0 {
            return Err(ConfigError::InvalidHttp("timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    /// Explicit key, else `default_feed`, else the only configured feed.
    pub fn feed<'a>(&'a self, key: Option<&'a str>) -> Result<(&'a str, &'a FeedConfig), ConfigError> {
        let key = match key.or(self.default_feed.as_deref()) {
            Some(key) => key,
            None if self.feeds.len() == 1 => self
                .feeds
                .keys()
                .next()
                .map(String::as_str)
                .ok_or(ConfigError::NoFeeds)?,
            None => return Err(ConfigError::NoFeedSelected),
        };
        self.feeds
            .get_key_value(key)
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| ConfigError::UnknownFeed(key.to_string()))
    }

    pub fn archive(&self) -> Option<PayloadArchive> {
        self.archive_dir.as_ref().map(PayloadArchive::new)
    }
}

/// Explicit path, else `feeds.local.yaml` in `base_dir` when present, else `feeds.yaml`.
pub fn resolve_config_path(explicit: Option<&Path>, base_dir: &Path) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    let local = base_dir.join(LOCAL_CONFIG_FILE);
    if local.is_file() {
        return local;
    }
    base_dir.join(DEFAULT_CONFIG_FILE)
}

pub fn load_config_file(path: &Path) -> Result<AppConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    AppConfig::from_yaml_str(&text, path)
}

pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let path = resolve_config_path(explicit, Path::new("."));
    info!(path = %path.display(), "loading configuration");
    load_config_file(&path)
}

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected: {detail}")]
    WriteRejected { detail: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    /// Field holds an RFC 3339 timestamp earlier than the bound.
    Before(DateTime<Utc>),
}

/// Conjunction of simple per-field conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.clauses.push((field.into(), Condition::Eq(value)));
        self
    }

    pub fn field_before(mut self, field: impl Into<String>, bound: DateTime<Utc>) -> Self {
        self.clauses.push((field.into(), Condition::Before(bound)));
        self
    }

    pub fn clauses(&self) -> &[(String, Condition)] {
        &self.clauses
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.clauses.iter().all(|(field, condition)| {
            let actual = document.get(field);
            match condition {
                Condition::Eq(expected) => actual == Some(expected),
                Condition::Before(bound) => actual
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .is_some_and(|t| t.with_timezone(&Utc) < *bound),
            }
        })
    }
}

pub fn timestamp_value(instant: DateTime<Utc>) -> Value {
    Value::String(instant.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Minimal document-store surface used by a run.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn connect(&self) -> Result<(), StoreError>;
    /// Ping, reconnecting once if the connection went away.
    async fn ensure_connection(&self) -> Result<(), StoreError>;
    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>, StoreError>;
    async fn insert_one(&self, collection: &str, document: Value) -> Result<(), StoreError>;
    /// Merge `set` into the first matching document; returns how many matched.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        set: Map<String, Value>,
    ) -> Result<u64, StoreError>;
    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError>;
    async fn close(&self);
}

/// Process-local store for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<BTreeMap<String, Vec<Value>>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `Unavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn documents(&self, collection: &str) -> Vec<Value> {
        self.collections
            .lock()
            .map(|c| c.get(collection).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn online(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<Value>>>, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        self.collections
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn connect(&self) -> Result<(), StoreError> {
        self.online().map(|_| ())
    }

    async fn ensure_connection(&self) -> Result<(), StoreError> {
        self.online().map(|_| ())
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>, StoreError> {
        let collections = self.online()?;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| filter.matches(d)))
            .cloned())
    }

    async fn insert_one(&self, collection: &str, document: Value) -> Result<(), StoreError> {
        if !document.is_object() {
            return Err(StoreError::WriteRejected {
                detail: "document must be a JSON object".into(),
            });
        }
        self.online()?
            .entry(collection.to_string())
            .or_default()
            .push(document);
        Ok(())
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        set: Map<String, Value>,
    ) -> Result<u64, StoreError> {
        let mut collections = self.online()?;
        let target = collections
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| filter.matches(d)))
            .and_then(Value::as_object_mut);
        match target {
            Some(document) => {
                document.extend(set);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let mut collections = self.online()?;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|d| !filter.matches(d));
        Ok((before - docs.len()) as u64)
    }

    async fn close(&self) {
        debug!("memory store closed");
    }
}

const CREATE_DOCUMENTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS documents (
        id BIGSERIAL PRIMARY KEY,
        collection TEXT NOT NULL,
        doc JSONB NOT NULL
    )
"#;

const CREATE_COLLECTION_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS documents_collection_idx ON documents (collection)";

/// At most one document per target date in each collection.
const CREATE_TARGET_DATE_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS documents_target_date_key \
     ON documents (collection, (doc ->> 'target_date'))";

const SCHEMA_STATEMENTS: [&str; 3] = [
    CREATE_DOCUMENTS_TABLE,
    CREATE_COLLECTION_INDEX,
    CREATE_TARGET_DATE_INDEX,
];

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

/// Documents kept as JSONB rows of a single `documents` table.
pub struct PgDocumentStore {
    url: String,
    options: DatabaseConfig,
    pool: RwLock<Option<PgPool>>,
}

impl PgDocumentStore {
    pub fn new(url: impl Into<String>, options: DatabaseConfig) -> Self {
        Self {
            url: url.into(),
            options,
            pool: RwLock::new(None),
        }
    }

    async fn open_pool(&self) -> Result<PgPool, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.options.max_connections)
            .min_connections(self.options.min_connections)
            .acquire_timeout(Duration::from_secs(self.options.acquire_timeout_secs))
            .idle_timeout(Duration::from_secs(self.options.idle_timeout_secs))
            .connect(&self.url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| StoreError::Unavailable(format!("preparing documents table: {e}")))?;
        }
        Ok(pool)
    }

    async fn pool(&self) -> Result<PgPool, StoreError> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| StoreError::Unavailable("not connected".into()))
    }
}

/// `collection = $first AND doc -> $n = $n+1 ...`
fn where_clause(filter: &Filter, first_param: usize) -> String {
    let mut sql = format!("collection = ${first_param}");
    let mut n = first_param + 1;
    for (_, condition) in filter.clauses() {
        match condition {
            Condition::Eq(_) => sql.push_str(&format!(" AND doc -> ${n}::text = ${}", n + 1)),
            Condition::Before(_) => {
                sql.push_str(&format!(" AND (doc ->> ${n}::text)::timestamptz < ${}", n + 1))
            }
        }
        n += 2;
    }
    sql
}

fn bind_filter<'q>(mut query: PgQuery<'q>, collection: &str, filter: &Filter) -> PgQuery<'q> {
    query = query.bind(collection.to_string());
    for (field, condition) in filter.clauses() {
        query = query.bind(field.clone());
        query = match condition {
            Condition::Eq(value) => query.bind(value.clone()),
            Condition::Before(bound) => query.bind(*bound),
        };
    }
    query
}

fn read_error(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn write_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db) => StoreError::WriteRejected {
            detail: db.to_string(),
        },
        other => StoreError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn connect(&self) -> Result<(), StoreError> {
        let pool = self.open_pool().await?;
        let previous = self.pool.write().await.replace(pool);
        if let Some(previous) = previous {
            previous.close().await;
        }
        info!("connected to document store");
        Ok(())
    }

    async fn ensure_connection(&self) -> Result<(), StoreError> {
        let current = self.pool.read().await.clone();
        if let Some(pool) = current {
            match sqlx::query("SELECT 1").execute(&pool).await {
                Ok(_) => return Ok(()),
                Err(err) => warn!(error = %err, "document store ping failed; reconnecting"),
            }
        }
        self.connect().await
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>, StoreError> {
        let pool = self.pool().await?;
        let sql = format!(
            "SELECT doc FROM documents WHERE {} ORDER BY id LIMIT 1",
            where_clause(filter, 1)
        );
        let row = bind_filter(sqlx::query(&sql), collection, filter)
            .fetch_optional(&pool)
            .await
            .map_err(read_error)?;
        row.map(|r| r.try_get::<Value, _>("doc"))
            .transpose()
            .map_err(read_error)
    }

    async fn insert_one(&self, collection: &str, document: Value) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        sqlx::query("INSERT INTO documents (collection, doc) VALUES ($1, $2)")
            .bind(collection.to_string())
            .bind(document)
            .execute(&pool)
            .await
            .map_err(write_error)?;
        Ok(())
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        set: Map<String, Value>,
    ) -> Result<u64, StoreError> {
        let pool = self.pool().await?;
        let sql = format!(
            "UPDATE documents SET doc = doc || $1 \
             WHERE id = (SELECT id FROM documents WHERE {} ORDER BY id LIMIT 1)",
            where_clause(filter, 2)
        );
        let query = sqlx::query(&sql).bind(Value::Object(set));
        let result = bind_filter(query, collection, filter)
            .execute(&pool)
            .await
            .map_err(write_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_many(&self, collection: &str, filter: &Filter) -> Result<u64, StoreError> {
        let pool = self.pool().await?;
        let sql = format!("DELETE FROM documents WHERE {}", where_clause(filter, 1));
        let result = bind_filter(sqlx::query(&sql), collection, filter)
            .execute(&pool)
            .await
            .map_err(write_error)?;
        Ok(result.rows_affected())
    }

    async fn close(&self) {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            info!("document store connection closed");
        }
    }
}

/// In-memory store for `--dry-run`, Postgres otherwise. Nothing connects yet.
pub fn open_store(config: &AppConfig, dry_run: bool) -> Result<Box<dyn DocumentStore>, ConfigError> {
    if dry_run {
        info!("dry run: writing to an in-memory store");
        return Ok(Box::new(MemoryStore::new()));
    }
    let url = config.database.resolve_url()?;
    Ok(Box::new(PgDocumentStore::new(url, config.database.clone())))
}

// ---------------------------------------------------------------------------
// Upsert and retention
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

impl std::fmt::Display for UpsertOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpsertOutcome::Inserted => write!(f, "inserted"),
            UpsertOutcome::Updated => write!(f, "updated"),
        }
    }
}

pub fn target_date_filter(target_date: DateTime<Utc>) -> Filter {
    Filter::new().field_eq(TARGET_DATE_FIELD, timestamp_value(target_date))
}

fn rejected(err: serde_json::Error) -> StoreError {
    StoreError::WriteRejected {
        detail: format!("serializing document: {err}"),
    }
}

/// Keep exactly one aggregate document per target date holding the latest rows.
pub async fn upsert(
    store: &dyn DocumentStore,
    collection: &str,
    target_date: DateTime<Utc>,
    rows: Vec<NormalizedRow>,
) -> Result<UpsertOutcome, StoreError> {
    let filter = target_date_filter(target_date);
    let now = Utc::now();
    let row_count = rows.len();

    if store.find_one(collection, &filter).await?.is_none() {
        let document = AggregateDocument::new(target_date, now, rows);
        let value = serde_json::to_value(&document).map_err(rejected)?;
        store.insert_one(collection, value).await?;
        info!(collection, %target_date, rows = row_count, "inserted aggregate document");
        return Ok(UpsertOutcome::Inserted);
    }

    let mut set = Map::new();
    set.insert(UPDATED_AT_FIELD.to_string(), timestamp_value(now));
    set.insert(
        ROWS_FIELD.to_string(),
        serde_json::to_value(&rows).map_err(rejected)?,
    );
    let matched = store.update_one(collection, &filter, set).await?;
    if matched == 0 {
        return Err(StoreError::WriteRejected {
            detail: format!("document for {target_date} disappeared before update"),
        });
    }
    info!(collection, %target_date, rows = row_count, "updated aggregate document");
    Ok(UpsertOutcome::Updated)
}

/// Delete documents whose target date is more than `retention_days` before `now`.
pub async fn prune_older_than(
    store: &dyn DocumentStore,
    collection: &str,
    retention_days: u32,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let cutoff = now - chrono::Duration::days(i64::from(retention_days));
    let deleted = store
        .delete_many(collection, &Filter::new().field_before(TARGET_DATE_FIELD, cutoff))
        .await?;
    info!(collection, deleted, %cutoff, "pruned expired documents");
    Ok(deleted)
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Tomorrow's civil date in `tz`.
pub fn tomorrow_in(tz: &Tz, now: DateTime<Utc>) -> NaiveDate {
    let today = now.with_timezone(tz).date_naive();
    today.succ_opt().unwrap_or(today)
}

/// Window from explicit dates, defaulting the start to tomorrow in `tz`.
pub fn resolve_window(
    date: Option<&str>,
    end_date: Option<&str>,
    tz: &Tz,
    now: DateTime<Utc>,
) -> Result<TargetWindow, UrlError> {
    match date {
        Some(date) => TargetWindow::parse(date, end_date),
        None => {
            let end = end_date.map(dayfeed_core::parse_dashed_date).transpose()?;
            Ok(TargetWindow::new(tomorrow_in(tz, now), end))
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Url(#[from] UrlError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Download(#[from] TerminalFailure),
    #[error("no rows survived normalization ({rows_read} read, {rows_dropped} dropped)")]
    EmptyResult { rows_read: usize, rows_dropped: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything one feed run needs; the caller owns the store and closes it.
pub struct RunContext<'a> {
    pub feed_key: &'a str,
    pub feed: &'a FeedConfig,
    pub window: TargetWindow,
    pub downloader: &'a PollingDownloader,
    pub store: &'a dyn DocumentStore,
    pub archive: Option<&'a PayloadArchive>,
    pub cancel: &'a CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub feed: String,
    pub target_date: DateTime<Utc>,
    pub url: String,
    pub bytes: usize,
    pub rows_read: usize,
    pub rows_kept: usize,
    pub rows_dropped: usize,
    pub outcome: UpsertOutcome,
    pub pruned: Option<u64>,
    pub attempts: u32,
    pub archived: Option<PathBuf>,
    pub elapsed: Duration,
}

/// Download, normalize and upsert one target date.
pub async fn run_feed(ctx: RunContext<'_>) -> Result<RunSummary, RunError> {
    let run_id = Uuid::new_v4();
    let span = info_span!("feed_run", %run_id, feed = ctx.feed_key, date = %ctx.window);
    execute_run(run_id, ctx).instrument(span).await
}

async fn execute_run(run_id: Uuid, ctx: RunContext<'_>) -> Result<RunSummary, RunError> {
    let started = Instant::now();
    let normalizer = RowNormalizer::new(ctx.feed.schema.clone())?;
    let url = ctx.window.render(&ctx.feed.url_template)?;
    info!(%url, collection = %ctx.feed.collection, "feed run started");

    let payload = ctx.downloader.download(&url, ctx.cancel).await?;
    let bytes = payload.bytes.len();
    let attempts = payload.attempts;

    let archived = match ctx.archive {
        Some(archive) => match archive.store_bytes(ctx.feed_key, &ctx.window, &payload.bytes).await {
            Ok(stored) => {
                debug!(path = %stored.absolute_path.display(), deduplicated = stored.deduplicated, "payload archived");
                Some(stored.absolute_path)
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "could not archive payload");
                None
            }
        },
        None => None,
    };

    let report = normalizer.normalize(payload.bytes);
    let rows_read = report.rows_read;
    let rows_dropped = report.dropped.len();
    let rows_kept = report.rows.len();
    if report.rows.is_empty() {
        warn!(rows_read, rows_dropped, "nothing to store");
        return Err(RunError::EmptyResult {
            rows_read,
            rows_dropped,
        });
    }

    ctx.store.ensure_connection().await?;
    let target_date = local_midnight_utc(normalizer.tz(), ctx.window.start());
    let outcome = upsert(ctx.store, &ctx.feed.collection, target_date, report.rows).await?;

    let pruned = match ctx.feed.retention_days {
        Some(days) => match prune_older_than(ctx.store, &ctx.feed.collection, days, Utc::now()).await {
            Ok(deleted) => Some(deleted),
            Err(err) => {
                warn!(error = %err, "retention pruning failed");
                None
            }
        },
        None => None,
    };

    let summary = RunSummary {
        run_id,
        feed: ctx.feed_key.to_string(),
        target_date,
        url,
        bytes,
        rows_read,
        rows_kept,
        rows_dropped,
        outcome,
        pruned,
        attempts,
        archived,
        elapsed: started.elapsed(),
    };
    info!(
        %outcome,
        rows_kept,
        rows_dropped,
        attempts,
        elapsed_secs = summary.elapsed.as_secs(),
        "feed run complete"
    );
    Ok(summary)
}

#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub path: PathBuf,
    pub url: String,
    pub payload: Payload,
}

/// One attempt, no retry; saves `<out_dir>/<FEED>_<YYYYMMDD>.csv`.
pub async fn fetch_to_dir(
    downloader: &PollingDownloader,
    feed_key: &str,
    feed: &FeedConfig,
    window: &TargetWindow,
    out_dir: &Path,
) -> anyhow::Result<FetchedFile> {
    let url = window.render(&feed.url_template)?;
    let payload = downloader
        .fetch_once(&url)
        .await
        .with_context(|| format!("fetching {url}"))?;

    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;
    let path = out_dir.join(fetched_file_name(feed_key, window));
    tokio::fs::write(&path, &payload.bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), bytes = payload.bytes.len(), "payload saved");

    Ok(FetchedFile { path, url, payload })
}

pub fn fetched_file_name(feed_key: &str, window: &TargetWindow) -> String {
    format!("{}_{}.csv", feed_key.to_uppercase(), window.compact())
}

/// Header plus the first `rows` lines of a payload, decoded for display.
pub fn preview_lines(bytes: &[u8], rows: usize) -> Vec<String> {
    let (text, _) = decode_payload(bytes);
    text.lines()
        .take(rows + 1)
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dayfeed_core::FieldValue;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
database:
  url: postgres://u:p@db:5432/feeds
http:
  max_attempts: 4
default_feed: prices
feeds:
  prices:
    url_template: "https://example.test/prices/{date}"
    int_columns: [Godzina]
    float_columns: [Cena]
    timestamp_columns: [Doba]
    utc_columns: [Doba]
    hour_offsets: { Doba: Godzina }
    hour_column: Godzina
    retention_days: 7
  volumes:
    url_template: "https://example.test/volumes/{date}/{end_date}"
    collection: vol
    delimiter: ","
"#;

    fn sample_config() -> AppConfig {
        AppConfig::from_yaml_str(SAMPLE, Path::new("inline.yaml")).expect("valid config")
    }

    fn row(value: i64) -> NormalizedRow {
        let mut row = NormalizedRow::new();
        row.insert("Godzina".into(), FieldValue::Int(value));
        row
    }

    #[test]
    fn interpolates_defaults_and_escapes() {
        std::env::set_var("DAYFEED_TEST_HOST", "db.internal");
        std::env::set_var("DAYFEED_TEST_EMPTY", "");
        std::env::remove_var("DAYFEED_TEST_UNSET");

        let result = interpolate(
            "a=$DAYFEED_TEST_HOST b=${DAYFEED_TEST_HOST} c=${DAYFEED_TEST_EMPTY:-fallback} \
             d=${DAYFEED_TEST_EMPTY-kept} e=${DAYFEED_TEST_UNSET-dflt} f=$$5",
        );
        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(
            result.text,
            "a=db.internal b=db.internal c=fallback d= e=dflt f=$5"
        );
    }

    #[test]
    fn interpolation_collects_every_missing_variable() {
        std::env::remove_var("DAYFEED_TEST_MISSING_A");
        std::env::remove_var("DAYFEED_TEST_MISSING_B");
        std::env::set_var("DAYFEED_TEST_MULTILINE", "x\ny");

        let result =
            interpolate("${DAYFEED_TEST_MISSING_A} $DAYFEED_TEST_MISSING_B ${DAYFEED_TEST_MULTILINE}");
        assert_eq!(result.errors.len(), 3);
        assert!(result.errors[0].contains("DAYFEED_TEST_MISSING_A"));
        assert!(result.errors[2].contains("newlines"));
    }

    #[test]
    fn parses_config_with_defaults() {
        let config = sample_config();
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.database.acquire_timeout_secs, 5);
        assert_eq!(config.http.max_attempts, 4);
        assert_eq!(config.http.timeout_secs, 60);
        assert_eq!(config.http.schedule().max_attempts, 4);
        assert!(config.archive().is_none());

        let (key, prices) = config.feed(None).unwrap();
        assert_eq!(key, "prices");
        assert_eq!(prices.collection, "prices");
        assert_eq!(prices.retention_days, Some(7));
        assert_eq!(prices.schema.timezone, "Europe/Warsaw");
        assert_eq!(prices.schema.delimiter, ';');
        assert_eq!(prices.schema.null_markers, vec!["-".to_string(), String::new()]);

        let (_, volumes) = config.feed(Some("volumes")).unwrap();
        assert_eq!(volumes.collection, "vol");
        assert_eq!(volumes.schema.delimiter, ',');

        assert!(matches!(config.feed(Some("nope")), Err(ConfigError::UnknownFeed(_))));
    }

    #[test]
    fn invalid_schema_fails_the_load() {
        let text = SAMPLE.replace("float_columns: [Cena]", "float_columns: [Cena, Godzina]");
        let err = AppConfig::from_yaml_str(&text, Path::new("inline.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFeed { ref feed, .. } if feed == "prices"));
    }

    #[test]
    fn missing_env_reference_fails_the_load() {
        std::env::remove_var("DAYFEED_TEST_NO_DB");
        let text = SAMPLE.replace("postgres://u:p@db:5432/feeds", "${DAYFEED_TEST_NO_DB}");
        let err = AppConfig::from_yaml_str(&text, Path::new("inline.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Interpolation { .. }));
    }

    #[test]
    fn feed_selection_without_default() {
        let text = SAMPLE.replace("default_feed: prices\n", "");
        let config = AppConfig::from_yaml_str(&text, Path::new("inline.yaml")).unwrap();
        assert!(matches!(config.feed(None), Err(ConfigError::NoFeedSelected)));
    }

    #[test]
    fn local_config_takes_precedence() {
        let dir = tempdir().unwrap();
        assert_eq!(
            resolve_config_path(None, dir.path()),
            dir.path().join(DEFAULT_CONFIG_FILE)
        );

        std::fs::write(dir.path().join(LOCAL_CONFIG_FILE), SAMPLE).unwrap();
        let resolved = resolve_config_path(None, dir.path());
        assert_eq!(resolved, dir.path().join(LOCAL_CONFIG_FILE));
        assert!(load_config_file(&resolved).is_ok());

        let explicit = dir.path().join("other.yaml");
        assert_eq!(resolve_config_path(Some(&explicit), dir.path()), explicit);
        assert!(matches!(load_config_file(&explicit), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn filters_match_equality_and_time_bounds() {
        let doc = serde_json::json!({"target_date": "2024-01-14T23:00:00Z", "n": 1});
        let bound = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        assert!(Filter::new().field_eq("n", serde_json::json!(1)).matches(&doc));
        assert!(!Filter::new().field_eq("n", serde_json::json!(2)).matches(&doc));
        assert!(Filter::new().field_before("target_date", bound).matches(&doc));
        assert!(!Filter::new()
            .field_before("target_date", bound - chrono::Duration::hours(2))
            .matches(&doc));
        assert!(!Filter::new().field_before("missing", bound).matches(&doc));
    }

    #[test]
    fn where_clause_numbers_parameters() {
        let filter = Filter::new()
            .field_eq("target_date", Value::Null)
            .field_before("target_date", Utc::now());
        assert_eq!(
            where_clause(&filter, 2),
            "collection = $2 AND doc -> $3::text = $4 AND (doc ->> $5::text)::timestamptz < $6"
        );
    }

    #[test]
    fn documents_table_keys_on_collection_and_target_date() {
        let unique: Vec<_> = SCHEMA_STATEMENTS
            .iter()
            .filter(|sql| sql.contains("UNIQUE"))
            .collect();
        assert_eq!(unique.len(), 1);
        assert!(unique[0].contains(&format!("(collection, (doc ->> '{TARGET_DATE_FIELD}'))")));
        assert!(SCHEMA_STATEMENTS[0].contains("CREATE TABLE IF NOT EXISTS documents"));
    }

    #[tokio::test]
    async fn second_upsert_updates_in_place() {
        let store = MemoryStore::new();
        let date = Utc.with_ymd_and_hms(2024, 1, 14, 23, 0, 0).unwrap();

        let first = upsert(&store, "prices", date, vec![row(1)]).await.unwrap();
        assert_eq!(first, UpsertOutcome::Inserted);
        let created = store.documents("prices")[0][dayfeed_core::CREATED_AT_FIELD].clone();
        assert!(store.documents("prices")[0].get(UPDATED_AT_FIELD).is_none());

        let second = upsert(&store, "prices", date, vec![row(7), row(8)]).await.unwrap();
        assert_eq!(second, UpsertOutcome::Updated);

        let docs = store.documents("prices");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0][ROWS_FIELD], serde_json::json!([{"Godzina": 7}, {"Godzina": 8}]));
        assert_eq!(docs[0][dayfeed_core::CREATED_AT_FIELD], created);
        assert!(docs[0][UPDATED_AT_FIELD].is_string());
        assert_eq!(docs[0][TARGET_DATE_FIELD], "2024-01-14T23:00:00Z");

        let other_day = date + chrono::Duration::days(1);
        upsert(&store, "prices", other_day, vec![row(1)]).await.unwrap();
        assert_eq!(store.documents("prices").len(), 2);
    }

    #[tokio::test]
    async fn offline_store_is_unavailable() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let err = upsert(&store, "prices", Utc::now(), vec![row(1)]).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.ensure_connection().await.is_err());
        store.set_offline(false);
        assert!(store.ensure_connection().await.is_ok());
    }

    /// Finds a document but never manages to update it.
    struct VanishingStore;

    #[async_trait]
    impl DocumentStore for VanishingStore {
        async fn connect(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn ensure_connection(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn find_one(&self, _: &str, _: &Filter) -> Result<Option<Value>, StoreError> {
            Ok(Some(serde_json::json!({})))
        }
        async fn insert_one(&self, _: &str, _: Value) -> Result<(), StoreError> {
            Ok(())
        }
        async fn update_one(&self, _: &str, _: &Filter, _: Map<String, Value>) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn delete_many(&self, _: &str, _: &Filter) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn update_matching_nothing_is_rejected() {
        let err = upsert(&VanishingStore, "prices", Utc::now(), vec![row(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::WriteRejected { .. }));
    }

    #[tokio::test]
    async fn prunes_documents_past_retention() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        for days_ago in [1, 5, 9, 30] {
            let date = now - chrono::Duration::days(days_ago);
            upsert(&store, "prices", date, vec![row(days_ago)]).await.unwrap();
        }
        let deleted = prune_older_than(&store, "prices", 7, now).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.documents("prices").len(), 2);
        assert_eq!(prune_older_than(&store, "missing", 7, now).await.unwrap(), 0);
    }

    #[test]
    fn default_window_is_tomorrow_in_feed_timezone() {
        let tz: Tz = "Europe/Warsaw".parse().unwrap();
        // 23:30 UTC is already the next day in Warsaw.
        let now = Utc.with_ymd_and_hms(2024, 1, 14, 23, 30, 0).unwrap();
        assert_eq!(tomorrow_in(&tz, now), NaiveDate::from_ymd_opt(2024, 1, 16).unwrap());

        let window = resolve_window(None, None, &tz, now).unwrap();
        assert_eq!(window.dashed(), "2024-01-16");
        let window = resolve_window(Some("2024-02-01"), Some("2024-02-02"), &tz, now).unwrap();
        assert_eq!(window.end_compact().as_deref(), Some("20240202"));
        assert!(resolve_window(Some("2024-02-30"), None, &tz, now).is_err());
    }

    #[test]
    fn preview_shows_header_and_first_rows() {
        let bytes = b"A;B\r\n1;2\r\n3;4\r\n5;6\r\n7;8\r\n";
        assert_eq!(preview_lines(bytes, 3), vec!["A;B", "1;2", "3;4", "5;6"]);
        let window = TargetWindow::parse("2024-01-15", None).unwrap();
        assert_eq!(fetched_file_name("pl_pwm_rdn", &window), "PL_PWM_RDN_20240115.csv");
    }

    #[test]
    fn dry_run_needs_no_database_url() {
        let config = sample_config();
        assert!(open_store(&config, true).is_ok());
        assert!(open_store(&config, false).is_ok());

        let mut no_url = config.clone();
        no_url.database.url = None;
        if std::env::var("DATABASE_URL").is_err() {
            assert!(matches!(
                open_store(&no_url, false),
                Err(ConfigError::MissingDatabaseUrl)
            ));
        }
    }
}
