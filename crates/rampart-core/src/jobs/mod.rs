use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use crate::config::{LearningConfig, ModelConfig};
use crate::db::Database;
use crate::embedding::{EmbeddingClient, EmbeddingError};
use crate::history::SessionError;
use crate::learning::LearnError;
use crate::llm::{LLMClient, LLMError};
use crate::queue::{Job, JobContext};
use crate::rules::RuleError;
use crate::worker::{JobError, JobExecutor};

mod embeddings_sync;
mod learn_session;

use embeddings_sync::handle_embeddings_sync;
use learn_session::handle_learn_session;

pub const JOB_TYPE_LEARN_SESSION: &str = learn_session::JOB_TYPE;
pub const JOB_TYPE_EMBEDDINGS_SYNC: &str = embeddings_sync::JOB_TYPE;

#[derive(Clone)]
pub struct JobDispatcher {
    pub db: Database,
    pub llm: Arc<dyn LLMClient>,
    pub embeddings: Arc<dyn EmbeddingClient>,
    pub extractor_model: ModelConfig,
    pub learning: LearningConfig,
}

impl JobDispatcher {
    pub fn new(
        db: Database,
        llm: Arc<dyn LLMClient>,
        embeddings: Arc<dyn EmbeddingClient>,
        extractor_model: ModelConfig,
        learning: LearningConfig,
    ) -> Self {
        Self {
            db,
            llm,
            embeddings,
            extractor_model,
            learning,
        }
    }
}

#[async_trait]
impl JobExecutor for JobDispatcher {
    async fn execute(&self, job: Job, _ctx: JobContext) -> Result<Option<Value>, JobError> {
        match job.job_type.as_str() {
            JOB_TYPE_LEARN_SESSION => handle_learn_session(self, job).await,
            JOB_TYPE_EMBEDDINGS_SYNC => handle_embeddings_sync(self, job).await,
            other => Err(JobError::Fatal(format!("unknown job type: {other}"))),
        }
    }
}

pub(crate) fn map_llm_error(context: &str, err: LLMError) -> JobError {
    match err {
        LLMError::RateLimited(info) => {
            let detail = info
                .retry_after_ms
                .map(|ms| format!(" (retry after {ms}ms)"))
                .unwrap_or_default();
            let message = format!("{context}: rate limited{detail}");
            if let Some(ms) = info.retry_after_ms {
                JobError::retryable_after(message, std::time::Duration::from_millis(ms))
            } else {
                JobError::retryable(message)
            }
        }
        LLMError::AuthenticationFailed => {
            JobError::Fatal(format!("{context}: authentication failed"))
        }
        LLMError::InvalidRequest(msg) => {
            JobError::Fatal(format!("{context}: invalid request {msg}"))
        }
        LLMError::ServerError(msg) => JobError::retryable(format!("{context}: server error {msg}")),
        LLMError::Timeout => JobError::retryable(format!("{context}: timeout")),
        LLMError::ParseError(msg) => JobError::Fatal(format!("{context}: parse error {msg}")),
        LLMError::ProviderError(msg) => {
            JobError::retryable(format!("{context}: provider error {msg}"))
        }
    }
}

pub(crate) fn map_embedding_error(context: &str, err: EmbeddingError) -> JobError {
    match err {
        EmbeddingError::Http(ref http_err) => {
            if let Some(status) = http_err.status() {
                match status {
                    StatusCode::TOO_MANY_REQUESTS => {
                        JobError::retryable(format!("{context}: rate limited ({status})"))
                    }
                    status if status.is_server_error() => {
                        JobError::retryable(format!("{context}: server error {status}"))
                    }
                    status => JobError::Fatal(format!("{context}: http status {status}")),
                }
            } else {
                JobError::retryable(format!("{context}: network error {http_err}"))
            }
        }
        EmbeddingError::Decode(err) => JobError::Fatal(format!("{context}: decode error {err}")),
        EmbeddingError::MissingVector => {
            JobError::retryable(format!("{context}: provider returned no vector"))
        }
        EmbeddingError::DimensionMismatch { got, expected } => JobError::Fatal(format!(
            "{context}: dimension mismatch, got {got} expected {expected}"
        )),
    }
}

pub(crate) fn map_learn_error(context: &str, err: LearnError) -> JobError {
    match err {
        LearnError::Session(SessionError::NotFound(id)) => {
            JobError::Fatal(format!("{context}: session not found {id}"))
        }
        LearnError::Llm(err) => map_llm_error(context, err),
        LearnError::Parse(err) => {
            // Completions are non-deterministic; a retry may produce valid JSON.
            JobError::retryable(format!("{context}: candidate parse failed {err}"))
        }
        LearnError::Rule(RuleError::Validation(err)) => {
            JobError::Fatal(format!("{context}: invalid rule {err}"))
        }
        other => JobError::retryable(format!("{context}: {other}")),
    }
}
