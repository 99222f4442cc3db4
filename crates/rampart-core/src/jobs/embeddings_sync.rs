use serde_json::{Value, json};
use tracing::info;

use crate::queue::Job;
use crate::rules::{NewRuleEmbedding, RuleRepository};
use crate::worker::JobError;

use super::{JobDispatcher, map_embedding_error};

pub const JOB_TYPE: &str = "embeddings.sync";

/// Backfill embeddings for active rules that are missing one.
/// Rules land without a vector when they were created while the embedding
/// service was down, or by an earlier build that did not embed at all.
pub async fn handle_embeddings_sync(
    dispatcher: &JobDispatcher,
    _job: Job,
) -> Result<Option<Value>, JobError> {
    let rules = RuleRepository::new(dispatcher.db.clone());
    let missing = rules
        .rules_missing_embedding()
        .await
        .map_err(|err| JobError::retryable(format!("failed to list unembedded rules: {err}")))?;

    let mut synced = 0usize;
    // Each upsert commits on its own, so a failed run resumes where it
    // stopped on retry.
    for rule in &missing {
        let vector = dispatcher
            .embeddings
            .embed(&rule.semantic_content())
            .await
            .map_err(|err| map_embedding_error("embed rule", err))?;

        rules
            .upsert_embedding(
                &rule.id,
                NewRuleEmbedding {
                    embedding: vector,
                    model: dispatcher.embeddings.model().to_string(),
                },
            )
            .await
            .map_err(|err| JobError::retryable(format!("failed to store embedding: {err}")))?;
        synced += 1;
    }

    info!(synced, "embedding sync finished");
    Ok(Some(json!({ "synced": synced })))
}
