//! Learn job handler for completed sessions.
//!
//! Runs the learning extractor over one session's stored transcript and
//! records the outcome as the job result. All skip and dedup decisions
//! live in the extractor; this handler only wires it to the queue.

use serde::Deserialize;
use serde_json::Value;

use crate::learning::LearningExtractor;
use crate::queue::Job;
use crate::worker::JobError;

use super::{JobDispatcher, map_learn_error};

pub const JOB_TYPE: &str = "learn.session";

/// Payload for the learn job.
#[derive(Debug, Deserialize)]
pub struct LearnSessionPayload {
    /// The internal session UUID (not the assistant's external id).
    pub session_id: String,
}

pub async fn handle_learn_session(
    dispatcher: &JobDispatcher,
    job: Job,
) -> Result<Option<Value>, JobError> {
    let payload: LearnSessionPayload = serde_json::from_value(job.payload.clone())
        .map_err(|err| JobError::Fatal(format!("invalid learn.session payload: {err}")))?;

    let extractor = LearningExtractor::new(
        dispatcher.db.clone(),
        dispatcher.llm.clone(),
        dispatcher.embeddings.clone(),
        dispatcher.extractor_model.clone(),
        dispatcher.learning.clone(),
    );

    let outcome = extractor
        .learn_session(&payload.session_id)
        .await
        .map_err(|err| map_learn_error("learn session", err))?;

    let result = serde_json::to_value(&outcome)
        .map_err(|err| JobError::Fatal(format!("failed to serialize learn outcome: {err}")))?;

    Ok(Some(result))
}
