use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::queue::{Job, JobContext, JobQueue, JobState, QueueError};

#[derive(Clone, Copy)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("retryable: {message}")]
    Retryable {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("fatal: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        JobError::Retryable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn retryable_after(message: impl Into<String>, delay: Duration) -> Self {
        JobError::Retryable {
            message: message.into(),
            retry_after: Some(delay),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable { .. })
    }

    fn message(&self) -> &str {
        match self {
            JobError::Retryable { message, .. } => message,
            JobError::Fatal(msg) => msg,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            JobError::Retryable { retry_after, .. } => *retry_after,
            JobError::Fatal(_) => None,
        }
    }
}

/// Runs one claimed job. A returned value is stored as the job's result.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: Job, ctx: JobContext) -> Result<Option<Value>, JobError>;
}

pub async fn run_worker<E: JobExecutor>(
    queue: JobQueue,
    executor: E,
    config: WorkerConfig,
    shutdown: CancellationToken,
) {
    let executor = Arc::new(executor);
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match queue.claim_next().await {
            Ok(Some(job)) => {
                handle_job(
                    queue.clone(),
                    executor.clone(),
                    config,
                    shutdown.clone(),
                    job,
                )
                .await
            }
            Ok(None) => sleep(config.poll_interval).await,
            Err(err) => {
                error!(error = %err, "failed to claim next job");
                sleep(config.poll_interval).await;
            }
        }
    }
}

async fn handle_job<E: JobExecutor>(
    queue: JobQueue,
    executor: Arc<E>,
    config: WorkerConfig,
    shutdown: CancellationToken,
    job: Job,
) {
    info!(job_id = %job.id, job_type = %job.job_type, "processing job");
    let heartbeat_cancel = shutdown.child_token();
    let heartbeat_queue = queue.clone();
    let job_id = job.id.clone();
    let heartbeat_interval = config.heartbeat_interval;

    let heartbeat_task = tokio::spawn({
        let heartbeat_cancel = heartbeat_cancel.clone();
        async move {
            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = sleep(heartbeat_interval) => {
                        if let Err(err) = heartbeat_queue.heartbeat(&job_id).await {
                            warn!(job_id = %job_id, error = %err, "heartbeat failed");
                        }
                    }
                }
            }
        }
    });

    let ctx = JobContext::new(queue.clone(), job.clone());
    let result = AssertUnwindSafe(executor.execute(job.clone(), ctx))
        .catch_unwind()
        .await;

    let finalize = match result {
        Ok(Ok(job_result)) => FinalizeAction::Complete { result: job_result },
        Ok(Err(job_err)) => FinalizeAction::Fail {
            message: job_err.message().to_string(),
            retry: job_err.is_retryable(),
            retry_after: job_err.retry_after(),
        },
        Err(panic) => {
            let err_msg = if let Some(msg) = panic.downcast_ref::<&str>() {
                msg.to_string()
            } else if let Some(msg) = panic.downcast_ref::<String>() {
                msg.clone()
            } else {
                "worker panic".to_string()
            };
            warn!(job_id = %job.id, "job panicked: {err_msg}");
            FinalizeAction::Fail {
                message: err_msg,
                retry: true,
                retry_after: None,
            }
        }
    };

    if let Err(err) = finalize_job(
        queue.clone(),
        &job,
        finalize,
        &heartbeat_cancel,
        heartbeat_interval,
        shutdown,
    )
    .await
    {
        error!(job_id = %job.id, error = %err, "failed to persist job outcome");
    }

    heartbeat_cancel.cancel();
    let _ = heartbeat_task.await;
}

enum FinalizeAction {
    Complete {
        result: Option<Value>,
    },
    Fail {
        message: String,
        retry: bool,
        retry_after: Option<Duration>,
    },
}

async fn finalize_job(
    queue: JobQueue,
    job: &Job,
    action: FinalizeAction,
    heartbeat_cancel: &CancellationToken,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
) -> Result<(), QueueError> {
    let mut attempt: u32 = 0;

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        let current_state = match queue.fetch_job(&job.id).await {
            Ok(job) => job,
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let mut backoff = heartbeat_interval / 2;
                if backoff < Duration::from_millis(10) {
                    backoff = Duration::from_millis(10);
                }
                if backoff > Duration::from_secs(5) {
                    backoff = Duration::from_secs(5);
                }
                warn!(job_id = %job.id, attempt, error = %err, "failed to fetch job for finalize; retrying");

                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = sleep(backoff) => {},
                    _ = heartbeat_cancel.cancelled() => return Err(err),
                }

                continue;
            }
        };
        if matches!(current_state.state, JobState::Canceled) {
            info!(job_id = %job.id, "job canceled during execution; skipping finalize");
            return Ok(());
        }

        let result = match &action {
            FinalizeAction::Complete { result } => queue.complete(&job.id, result.clone()).await,
            FinalizeAction::Fail {
                message,
                retry,
                retry_after,
            } => queue.fail(&job.id, message.clone(), *retry, *retry_after).await,
        };

        match result {
            Ok(_) => {
                match action {
                    FinalizeAction::Complete { .. } => info!(job_id = %job.id, "job completed"),
                    FinalizeAction::Fail { retry: true, .. } => {
                        warn!(job_id = %job.id, "job failed and will retry")
                    }
                    FinalizeAction::Fail { retry: false, .. } => {
                        warn!(job_id = %job.id, "job failed permanently")
                    }
                }
                return Ok(());
            }
            Err(QueueError::NotRunning(_)) => {
                info!(job_id = %job.id, "job already moved out of running state");
                return Ok(());
            }
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let mut backoff = heartbeat_interval / 2;
                if backoff < Duration::from_millis(10) {
                    backoff = Duration::from_millis(10);
                }
                if backoff > Duration::from_secs(5) {
                    backoff = Duration::from_secs(5);
                }
                warn!(job_id = %job.id, attempt, error = %err, "failed to persist job outcome; retrying");

                // Keep heartbeat alive while retrying to avoid stale running jobs.
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = sleep(backoff) => {},
                    _ = heartbeat_cancel.cancelled() => return Err(err),
                }
            }
        }
    }
}
