//! Durable job storage + outbound HTTP utilities for CAJS.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cajs_core::{Job, JobDraft, JobStatus};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cajs-storage";

/// How an upstream HTTP failure should be reported by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Unauthorized,
    Unavailable,
    Rejected,
    Malformed,
}

pub fn classify_status(status: StatusCode) -> FailureKind {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        FailureKind::Unauthorized
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        FailureKind::Unavailable
    } else {
        FailureKind::Rejected
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http fetcher is shut down")]
    Closed,
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Request(_) | Self::Closed => FailureKind::Unavailable,
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(FailureKind::Rejected),
            Self::Decode { .. } => FailureKind::Malformed,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        self.kind() == FailureKind::Unauthorized
    }
}

/// Shared reqwest client for every provider call.
///
/// Requests are attempted exactly once; callers own their fallback.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send `request` and decode a 2xx JSON body into `T`.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        source_id: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let request = request.build()?;
        let url = request.url().clone();
        let span = info_span!(
            "http_fetch",
            request_id = %Uuid::new_v4(),
            source_id,
            method = %request.method(),
            path = url.path()
        );

        async move {
            let resp = self.client.execute(request).await.map_err(|err| {
                warn!(error = %err, "request failed");
                FetchError::Request(err)
            })?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.text().await?;
            debug!(status = status.as_u16(), bytes = body.len(), "response received");

            if !status.is_success() {
                warn!(status = status.as_u16(), "upstream returned error status");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                    body,
                });
            }

            serde_json::from_str(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(i64),
    #[error("job {id} is {status}; only pending jobs can be cancelled")]
    Conflict { id: i64, status: JobStatus },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serializing job document: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("corrupt job row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

const JOB_COLUMNS: &str = "id, task_name, status, duration_hours, resource_usage, scheduled_time, \
     start_time, completion_time, carbon_intensity, carbon_saved, parameters, results, \
     created_at, updated_at";

/// SQLite-backed job table.
///
/// Creation is one INSERT inside one transaction and cancellation is one
/// conditional UPDATE, so readers never see a partial job and two cancels of
/// the same job cannot both succeed.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = if in_memory {
            // each connection to an in-memory database sees its own database
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(8)
                .connect_with(options)
                .await?
        };
        Ok(Self { pool })
    }

    /// Connect and apply the embedded migrations.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let store = Self::connect(database_url).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::open("sqlite::memory:").await
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create(&self, draft: &JobDraft) -> Result<Job, StoreError> {
        self.create_at(draft, Utc::now()).await
    }

    pub async fn create_at(&self, draft: &JobDraft, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let parameters = serde_json::to_string(&draft.parameters)?;
        let results = serde_json::to_string(&draft.results)?;
        let stamp = encode_ts(now);

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (task_name, status, duration_hours, resource_usage, scheduled_time,
                              carbon_intensity, carbon_saved, parameters, results,
                              created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&draft.task_name)
        .bind(draft.status.as_str())
        .bind(draft.duration_hours)
        .bind(&draft.resource_usage)
        .bind(encode_ts(draft.scheduled_time))
        .bind(draft.carbon_intensity)
        .bind(draft.carbon_saved)
        .bind(&parameters)
        .bind(&results)
        .bind(&stamp)
        .bind(&stamp)
        .fetch_one(&mut *tx)
        .await?;
        let id: i64 = row.try_get("id")?;
        tx.commit().await?;

        debug!(job_id = id, task_name = %draft.task_name, "job persisted");
        Ok(Job {
            id,
            task_name: draft.task_name.clone(),
            status: draft.status,
            duration_hours: draft.duration_hours,
            resource_usage: draft.resource_usage.clone(),
            scheduled_time: draft.scheduled_time,
            start_time: None,
            completion_time: None,
            carbon_intensity: draft.carbon_intensity,
            carbon_saved: draft.carbon_saved,
            parameters: draft.parameters.clone(),
            results: draft.results.clone(),
            created_at: decode_ts(id, &stamp)?,
            updated_at: decode_ts(id, &stamp)?,
        })
    }

    /// All jobs, newest `created_at` first.
    pub async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn get(&self, id: i64) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::NotFound(id)),
        }
    }

    pub async fn cancel(&self, id: i64) -> Result<Job, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET status = ?,
                   updated_at = ?
             WHERE id = ?
               AND status = ?
            "#,
        )
        .bind(JobStatus::Cancelled.as_str())
        .bind(encode_ts(Utc::now()))
        .bind(id)
        .bind(JobStatus::Pending.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.get(id).await?;
            return Err(StoreError::Conflict {
                id,
                status: current.status,
            });
        }
        self.get(id).await
    }

    pub async fn clear(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM jobs").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

// Fixed-width UTC text keeps lexical order equal to chronological order.
fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_ts(id: i64, text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt {
            id,
            reason: format!("bad timestamp {text:?}: {err}"),
        })
}

fn decode_optional_ts(id: i64, text: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    text.map(|t| decode_ts(id, &t)).transpose()
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let id: i64 = row.try_get("id")?;
    let status_text: String = row.try_get("status")?;
    let status = status_text
        .parse::<JobStatus>()
        .map_err(|err| StoreError::Corrupt {
            id,
            reason: err.to_string(),
        })?;
    let parameters: String = row.try_get("parameters")?;
    let results: String = row.try_get("results")?;
    let corrupt_json = |err: serde_json::Error| StoreError::Corrupt {
        id,
        reason: err.to_string(),
    };

    Ok(Job {
        id,
        task_name: row.try_get("task_name")?,
        status,
        duration_hours: row.try_get("duration_hours")?,
        resource_usage: row.try_get("resource_usage")?,
        scheduled_time: decode_ts(id, &row.try_get::<String, _>("scheduled_time")?)?,
        start_time: decode_optional_ts(id, row.try_get("start_time")?)?,
        completion_time: decode_optional_ts(id, row.try_get("completion_time")?)?,
        carbon_intensity: row.try_get("carbon_intensity")?,
        carbon_saved: row.try_get("carbon_saved")?,
        parameters: serde_json::from_str(&parameters).map_err(corrupt_json)?,
        results: serde_json::from_str(&results).map_err(corrupt_json)?,
        created_at: decode_ts(id, &row.try_get::<String, _>("created_at")?)?,
        updated_at: decode_ts(id, &row.try_get::<String, _>("updated_at")?)?,
    })
}
