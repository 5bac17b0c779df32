//! HTTP fetch utilities and sink adapters for roster reconciliation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use roster_core::{normalize_identity, ExistingRecord, ProfileRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roster-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Upper bound on in-flight requests across every caller sharing the fetcher.
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid json from {url}: {source}")]
    Json {
        url: String,
        source: serde_json::Error,
    },
    #[error("request limiter closed")]
    LimiterClosed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.execute(url, || self.client.get(url)).await
    }

    pub async fn fetch_json_authorized(
        &self,
        url: &str,
        bearer_token: &str,
    ) -> Result<JsonValue, FetchError> {
        let response = self
            .execute(url, || self.client.get(url).bearer_auth(bearer_token))
            .await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Json {
            url: response.final_url,
            source,
        })
    }

    pub async fn post_json(&self, url: &str, body: &JsonValue) -> Result<FetchedResponse, FetchError> {
        self.execute(url, || self.client.post(url).json(body)).await
    }

    async fn execute<F>(&self, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let span = tracing::info_span!("http_fetch", url);
        async move {
            let mut attempt = 0usize;
            loop {
                let can_retry = attempt < self.backoff.max_retries;
                match build().send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::NonRetryable || !can_retry {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            });
                        }
                        debug!(attempt, %status, "retrying after http status");
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::NonRetryable || !can_retry {
                            return Err(FetchError::Request(err));
                        }
                        debug!(attempt, error = %err, "retrying after request error");
                    }
                }
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("sink database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

/// Durable destination of the reconciled roster.
///
/// `create` and `update` must be idempotent writes keyed by identity so they can be retried.
#[async_trait]
pub trait SinkAdapter: Send + Sync {
    fn sink_id(&self) -> &'static str;

    async fn list_existing(&self) -> Result<Vec<ExistingRecord>, SinkError>;

    async fn create(&self, record: &ProfileRecord) -> Result<(), SinkError>;

    /// Overwrites the record stored under `identity` (the sink's own key) with `record`.
    async fn update(&self, identity: &str, record: &ProfileRecord) -> Result<(), SinkError>;

    async fn delete(&self, identity: &str) -> Result<(), SinkError>;
}

fn upsert_row(
    rows: &mut BTreeMap<String, ExistingRecord>,
    replaced_key: Option<&str>,
    record: &ProfileRecord,
) {
    if let Some(key) = replaced_key {
        rows.remove(key);
    }
    let row = ExistingRecord::from_profile(record, Utc::now());
    rows.insert(row.identity.clone(), row);
}

/// In-process sink used for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    rows: Arc<RwLock<BTreeMap<String, ExistingRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ExistingRecord>) -> Self {
        let rows = records
            .into_iter()
            .map(|r| (r.identity.clone(), r))
            .collect::<BTreeMap<_, _>>();
        Self {
            rows: Arc::new(RwLock::new(rows)),
        }
    }

    pub async fn snapshot(&self) -> Vec<ExistingRecord> {
        self.rows.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl SinkAdapter for MemorySink {
    fn sink_id(&self) -> &'static str {
        "memory"
    }

    async fn list_existing(&self) -> Result<Vec<ExistingRecord>, SinkError> {
        Ok(self.snapshot().await)
    }

    async fn create(&self, record: &ProfileRecord) -> Result<(), SinkError> {
        upsert_row(&mut *self.rows.write().await, None, record);
        Ok(())
    }

    async fn update(&self, identity: &str, record: &ProfileRecord) -> Result<(), SinkError> {
        upsert_row(&mut *self.rows.write().await, Some(identity), record);
        Ok(())
    }

    async fn delete(&self, identity: &str) -> Result<(), SinkError> {
        self.rows.write().await.remove(identity);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RosterFile {
    #[serde(default)]
    profiles: Vec<ExistingRecord>,
}

/// Whole-roster JSON document rewritten atomically on every write.
#[derive(Debug)]
pub struct JsonFileSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, ExistingRecord>, SinkError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(err.into()),
        };
        let file: RosterFile = serde_json::from_str(&text)?;
        Ok(file
            .profiles
            .into_iter()
            .map(|r| (r.identity.clone(), r))
            .collect())
    }

    /// Writes via a sibling temp file and rename so readers never observe a torn roster.
    async fn persist(&self, rows: BTreeMap<String, ExistingRecord>) -> Result<(), SinkError> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await?;

        let bytes = serde_json::to_vec_pretty(&RosterFile {
            profiles: rows.into_values().collect(),
        })?;
        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn modify<F>(&self, change: F) -> Result<(), SinkError>
    where
        F: FnOnce(&mut BTreeMap<String, ExistingRecord>),
    {
        let _guard = self.write_lock.lock().await;
        let mut rows = self.load().await?;
        change(&mut rows);
        self.persist(rows).await
    }
}

#[async_trait]
impl SinkAdapter for JsonFileSink {
    fn sink_id(&self) -> &'static str {
        "json-file"
    }

    async fn list_existing(&self) -> Result<Vec<ExistingRecord>, SinkError> {
        let _guard = self.write_lock.lock().await;
        Ok(self.load().await?.into_values().collect())
    }

    async fn create(&self, record: &ProfileRecord) -> Result<(), SinkError> {
        self.modify(|rows| upsert_row(rows, None, record)).await
    }

    async fn update(&self, identity: &str, record: &ProfileRecord) -> Result<(), SinkError> {
        self.modify(|rows| upsert_row(rows, Some(identity), record))
            .await
    }

    async fn delete(&self, identity: &str) -> Result<(), SinkError> {
        self.modify(|rows| {
            rows.remove(identity);
        })
        .await
    }
}

const UPSERT_PROFILE_SQL: &str = "INSERT INTO roster_profiles \
     (identity, display_name, position, department, avatar_url, updated_at) \
     VALUES ($1, $2, $3, $4, $5, now()) \
     ON CONFLICT (identity) DO UPDATE SET \
       display_name = excluded.display_name, \
       position = excluded.position, \
       department = excluded.department, \
       avatar_url = excluded.avatar_url, \
       updated_at = excluded.updated_at";

/// Postgres-backed sink writing into `roster_profiles`.
#[derive(Debug, Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to roster database")?;
        Ok(Self::new(pool))
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS roster_profiles (
                identity TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                position TEXT,
                department TEXT,
                avatar_url TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating roster_profiles")?;
        Ok(())
    }

    async fn upsert<'e, E>(executor: E, record: &ProfileRecord) -> Result<(), SinkError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let role = record.role.as_ref();
        sqlx::query(UPSERT_PROFILE_SQL)
            .bind(normalize_identity(&record.identity))
            .bind(record.display_name.clone())
            .bind(role.map(|r| r.position.clone()))
            .bind(role.map(|r| r.department.clone()))
            .bind(record.published_avatar().map(str::to_string))
            .execute(executor)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SinkAdapter for PgSink {
    fn sink_id(&self) -> &'static str {
        "postgres"
    }

    async fn list_existing(&self) -> Result<Vec<ExistingRecord>, SinkError> {
        let rows = sqlx::query(
            "SELECT identity, display_name, position, department, avatar_url, updated_at \
             FROM roster_profiles ORDER BY identity",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ExistingRecord, SinkError> {
                Ok(ExistingRecord {
                    identity: row.try_get("identity")?,
                    display_name: row.try_get("display_name")?,
                    position: row.try_get("position")?,
                    department: row.try_get("department")?,
                    avatar_url: row.try_get("avatar_url")?,
                    updated_at: row.try_get::<Option<DateTime<Utc>>, _>("updated_at")?,
                })
            })
            .collect()
    }

    async fn create(&self, record: &ProfileRecord) -> Result<(), SinkError> {
        Self::upsert(&self.pool, record).await
    }

    async fn update(&self, identity: &str, record: &ProfileRecord) -> Result<(), SinkError> {
        let mut tx = self.pool.begin().await?;
        if identity != record.identity {
            sqlx::query("DELETE FROM roster_profiles WHERE identity = $1")
                .bind(identity)
                .execute(&mut *tx)
                .await?;
        }
        Self::upsert(&mut *tx, record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, identity: &str) -> Result<(), SinkError> {
        sqlx::query("DELETE FROM roster_profiles WHERE identity = $1")
            .bind(identity)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
