use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Row, params};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

const JOB_COLUMNS: &str = "id, type, payload_json, priority, state, attempts, max_attempts, not_before, idempotency_key, last_error, heartbeat_at, created_at, updated_at, finished_at, result_json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "canceled" => Some(JobState::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub payload: Value,
    pub priority: i64,
    pub state: JobState,
    pub attempts: i64,
    pub max_attempts: i64,
    pub not_before: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub last_error: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("payload json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("job is not running: {0}")]
    NotRunning(String),
    #[error("invalid job state value {0}")]
    InvalidState(String),
    #[error("duplicate idempotency key {key}, existing job {existing_job_id:?}")]
    DuplicateIdempotency {
        key: String,
        existing_job_id: Option<String>,
    },
}

#[derive(Clone)]
pub struct JobQueue {
    db: Database,
}

impl JobQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn enqueue(
        &self,
        job_type: impl Into<String>,
        payload: Value,
        idempotency_key: Option<String>,
        priority: i64,
    ) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let payload_json = serde_json::to_string(&payload)?;
        let idempotency = idempotency_key.clone();
        let mut conn = self.db.connection().await?;

        let result = conn
            .execute(
                "INSERT INTO jobs (id, type, payload_json, priority, state, attempts, max_attempts, not_before, idempotency_key, last_error, heartbeat_at, created_at, updated_at, finished_at, result_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, 5, NULL, ?6, NULL, NULL, ?7, ?7, NULL, NULL)",
                params![
                    id.clone(),
                    job_type.into(),
                    payload_json,
                    priority,
                    JobState::Queued.as_str(),
                    idempotency.clone(),
                    now.clone()
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(id),
            Err(err) if is_unique_violation(&err) && idempotency.is_some() => {
                let existing =
                    lookup_job_by_idempotency(&mut conn, idempotency.as_deref().unwrap())
                        .await
                        .ok()
                        .flatten();
                let key = idempotency.unwrap();
                Err(QueueError::DuplicateIdempotency {
                    key,
                    existing_job_id: existing,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn claim_next(&self) -> Result<Option<Job>, QueueError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE jobs
                     SET state = ?2, attempts = attempts + 1, heartbeat_at = ?3, updated_at = ?3
                     WHERE id = (
                         SELECT id FROM jobs
                         WHERE state = 'queued' AND (not_before IS NULL OR not_before <= ?1)
                         ORDER BY priority DESC, created_at
                         LIMIT 1
                     )
                     RETURNING {JOB_COLUMNS}"
                ),
                params![now.clone(), JobState::Running.as_str(), now.clone()],
            )
            .await?;

        let maybe_row = rows.next().await?;
        match maybe_row {
            Some(row) => Ok(Some(row_to_job(row)?)),
            None => Ok(None),
        }
    }

    pub async fn heartbeat(&self, job_id: &str) -> Result<(), QueueError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE jobs SET heartbeat_at = ?2, updated_at = ?2 WHERE id = ?1 AND state = 'running' RETURNING id",
                params![job_id, now],
            )
            .await?;

        if rows.next().await?.is_none() {
            return Err(QueueError::NotRunning(job_id.to_string()));
        }
        Ok(())
    }

    pub async fn complete(&self, job_id: &str, result: Option<Value>) -> Result<(), QueueError> {
        let now = now_rfc3339();
        let serialized = result.map(|val| serde_json::to_string(&val)).transpose()?;
        let finished_at = now.clone();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE jobs
                 SET state = 'completed',
                     last_error = NULL,
                     finished_at = ?3,
                     result_json = ?4,
                     updated_at = ?3
                 WHERE id = ?1 AND state = 'running'
                 RETURNING id",
                params![job_id, finished_at.clone(), finished_at, serialized],
            )
            .await?;
        if rows.next().await?.is_none() {
            return self.resolve_missing_state(job_id).await;
        }
        Ok(())
    }

    pub async fn fail(
        &self,
        job_id: &str,
        error: String,
        should_retry: bool,
        retry_after: Option<Duration>,
    ) -> Result<(), QueueError> {
        let job = self.fetch_job(job_id).await?;
        let now = now_rfc3339();
        let allow_retry = should_retry && job.attempts < job.max_attempts;
        let next_not_before = if allow_retry {
            let delay = retry_after.unwrap_or_else(|| backoff_with_jitter(job.attempts));
            let scheduled = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            Some(scheduled.to_rfc3339_opts(SecondsFormat::Millis, true))
        } else {
            None
        };

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE jobs
                 SET state = ?2, not_before = ?3, last_error = ?4, finished_at = ?5, updated_at = ?6
                 WHERE id = ?1 AND state = 'running'
                 RETURNING id",
                params![
                    job_id,
                    if allow_retry {
                        JobState::Queued.as_str()
                    } else {
                        JobState::Failed.as_str()
                    },
                    next_not_before,
                    error,
                    if allow_retry {
                        None::<String>
                    } else {
                        Some(now.clone())
                    },
                    now
                ],
            )
            .await?;

        if rows.next().await?.is_none() {
            return self.resolve_missing_state(job_id).await;
        }
        Ok(())
    }

    pub async fn cancel(&self, job_id: &str) -> Result<(), QueueError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE jobs
                 SET state = 'canceled', finished_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND state IN ('queued','running')
                 RETURNING id",
                params![job_id, now],
            )
            .await?;
        if rows.next().await?.is_none() {
            return self.resolve_missing_state(job_id).await;
        }
        Ok(())
    }

    pub async fn fetch_job(&self, job_id: &str) -> Result<Job, QueueError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_job(row),
            None => Err(QueueError::JobNotFound(job_id.to_string())),
        }
    }
}

#[derive(Clone)]
pub struct JobContext {
    queue: JobQueue,
    job: Job,
}

impl JobContext {
    pub fn new(queue: JobQueue, job: Job) -> Self {
        Self { queue, job }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub async fn heartbeat(&self) -> Result<(), QueueError> {
        self.queue.heartbeat(&self.job.id).await
    }
}

fn row_to_job(row: Row) -> Result<Job, QueueError> {
    let id: String = row.get(0)?;
    let job_type: String = row.get(1)?;
    let payload_json: String = row.get(2)?;
    let priority: i64 = row.get(3)?;
    let state_str: String = row.get(4)?;
    let attempts: i64 = row.get(5)?;
    let max_attempts: i64 = row.get(6)?;
    let not_before: Option<String> = row.get(7)?;
    let idempotency_key: Option<String> = row.get(8)?;
    let last_error: Option<String> = row.get(9)?;
    let heartbeat_at: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    let finished_at: Option<String> = row.get(13)?;
    let result_json: Option<String> = row.get(14)?;

    let state =
        JobState::from_str(&state_str).ok_or_else(|| QueueError::InvalidState(state_str))?;

    let payload: Value = serde_json::from_str(&payload_json)?;

    Ok(Job {
        id,
        job_type,
        payload,
        priority,
        state,
        attempts,
        max_attempts,
        not_before: parse_timestamp(not_before)?,
        idempotency_key,
        last_error,
        heartbeat_at: parse_timestamp(heartbeat_at)?,
        created_at: parse_required_timestamp(created_at)?,
        updated_at: parse_required_timestamp(updated_at)?,
        finished_at: parse_timestamp(finished_at)?,
        result: result_json
            .map(|val| serde_json::from_str(&val))
            .transpose()?,
    })
}

impl JobQueue {
    async fn resolve_missing_state(&self, job_id: &str) -> Result<(), QueueError> {
        match self.fetch_job(job_id).await {
            Ok(_) => Err(QueueError::NotRunning(job_id.to_string())),
            Err(QueueError::JobNotFound(_)) => Err(QueueError::JobNotFound(job_id.to_string())),
            Err(other) => Err(other),
        }
    }
}

fn parse_timestamp(ts: Option<String>) -> Result<Option<DateTime<Utc>>, QueueError> {
    match ts {
        Some(value) => Ok(Some(parse_required_timestamp(value)?)),
        None => Ok(None),
    }
}

fn parse_required_timestamp(value: String) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| QueueError::InvalidState(value))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn backoff_with_jitter(attempts: i64) -> Duration {
    let attempts = attempts.max(1);
    let exp = attempts.min(20); // clamp to avoid overflow; cap at ~1M seconds before jitter then min below.
    let base = 2_i64.saturating_pow(exp as u32);
    let delay_secs = base.min(300);
    let mut rng = rand::thread_rng();
    let factor: f64 = rng.gen_range(0.75..=1.25);
    Duration::from_secs_f64((delay_secs as f64) * factor)
}

fn is_unique_violation(err: &libsql::Error) -> bool {
    err.to_string()
        .to_ascii_lowercase()
        .contains("unique constraint failed")
}

async fn lookup_job_by_idempotency(
    conn: &mut Connection,
    key: &str,
) -> Result<Option<String>, libsql::Error> {
    let mut rows = conn
        .query(
            "SELECT id FROM jobs WHERE idempotency_key = ?1",
            params![key],
        )
        .await?;
    let Some(row) = rows.next().await? else {
        return Ok(None);
    };
    let id: String = row.get(0)?;
    Ok(Some(id))
}
