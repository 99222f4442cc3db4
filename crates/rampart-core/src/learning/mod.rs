pub mod candidates;
pub mod prompt;

pub use candidates::{
    CandidateError, CandidateList, CandidateParseError, RuleCandidate, parse_candidates,
};
pub use prompt::{RenderedTranscript, build_extraction_messages, format_transcript};

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{LearningConfig, ModelConfig};
use crate::db::Database;
use crate::embedding::EmbeddingClient;
use crate::history::{
    MessageError, MessageRepository, SessionError, SessionRepository, SessionStatus,
    ToolCallError, ToolCallRepository,
};
use crate::llm::{CompletionRequest, LLMClient, LLMError};
use crate::rules::{NewRuleEmbedding, RuleError, RuleRepository};

#[derive(Debug, Error)]
pub enum LearnError {
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("tool call error: {0}")]
    ToolCall(#[from] ToolCallError),
    #[error("rule store error: {0}")]
    Rule(#[from] RuleError),
    #[error("llm error: {0}")]
    Llm(#[from] LLMError),
    #[error("candidate parse error: {0}")]
    Parse(#[from] CandidateParseError),
}

/// What one extraction run did, recorded as the job result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearnOutcome {
    pub session_id: String,
    pub skipped: Option<String>,
    pub candidates: usize,
    pub committed: usize,
    pub deduplicated: usize,
    pub dropped: usize,
}

impl LearnOutcome {
    fn skipped(session_id: &str, reason: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            skipped: Some(reason.to_string()),
            candidates: 0,
            committed: 0,
            deduplicated: 0,
            dropped: 0,
        }
    }
}

/// Mines completed sessions for user corrections and turns them into stored
/// rules. Runs out-of-band in the worker; nothing here sits on the hook's
/// critical path.
pub struct LearningExtractor {
    sessions: SessionRepository,
    messages: MessageRepository,
    tool_calls: ToolCallRepository,
    rules: RuleRepository,
    llm: Arc<dyn LLMClient>,
    embeddings: Arc<dyn EmbeddingClient>,
    model: ModelConfig,
    learning: LearningConfig,
}

impl LearningExtractor {
    pub fn new(
        db: Database,
        llm: Arc<dyn LLMClient>,
        embeddings: Arc<dyn EmbeddingClient>,
        model: ModelConfig,
        learning: LearningConfig,
    ) -> Self {
        Self {
            sessions: SessionRepository::new(db.clone()),
            messages: MessageRepository::new(db.clone()),
            tool_calls: ToolCallRepository::new(db.clone()),
            rules: RuleRepository::new(db),
            llm,
            embeddings,
            model,
            learning,
        }
    }

    pub async fn learn_session(&self, session_id: &str) -> Result<LearnOutcome, LearnError> {
        let session = self.sessions.get_by_id(session_id).await?;
        if session.status != SessionStatus::Completed {
            debug!(
                session_id,
                status = session.status.as_str(),
                "skipping unfinished session"
            );
            return Ok(LearnOutcome::skipped(session_id, "session is not completed"));
        }
        if session.learned_at.is_some() {
            debug!(session_id, "session already learned");
            return Ok(LearnOutcome::skipped(session_id, "session already learned"));
        }

        let messages = self.messages.list_for_session(&session.id).await?;
        if messages.is_empty() {
            self.sessions.mark_learned(&session.id).await?;
            return Ok(LearnOutcome::skipped(session_id, "session has no messages"));
        }
        let tool_calls = self.tool_calls.list_for_session(&session.id).await?;

        let transcript =
            format_transcript(&messages, &tool_calls, self.learning.max_message_chars);
        let request = CompletionRequest {
            messages: build_extraction_messages(&transcript),
            temperature: self.model.temperature,
            max_tokens: self.model.max_output_tokens,
            json_mode: true,
        };
        let response = self.llm.complete(request).await?;
        let candidates = parse_candidates(&response.content)?;

        let mut outcome = LearnOutcome {
            session_id: session.id.clone(),
            skipped: None,
            candidates: candidates.len(),
            committed: 0,
            deduplicated: 0,
            dropped: 0,
        };

        for candidate in candidates {
            let content = candidate.semantic_content();
            let new_rule = match candidate.into_new_rule(&transcript) {
                Ok(rule) => rule,
                Err(err) => {
                    warn!(session_id, error = %err, "dropping invalid rule candidate");
                    outcome.dropped += 1;
                    continue;
                }
            };

            let vector = match self.embeddings.embed(&content).await {
                Ok(vector) => vector,
                Err(err) => {
                    warn!(session_id, error = %err, "dropping candidate without embedding");
                    outcome.dropped += 1;
                    continue;
                }
            };

            if let Some((existing, similarity)) = self.rules.nearest_embedding(&vector).await? {
                if similarity >= self.learning.dedup_threshold {
                    debug!(
                        session_id,
                        existing_rule_id = %existing.rule_id,
                        similarity,
                        "discarding near-duplicate candidate"
                    );
                    outcome.deduplicated += 1;
                    continue;
                }
            }

            let embedding = NewRuleEmbedding {
                embedding: vector,
                model: self.embeddings.model().to_string(),
            };
            let rule = self.rules.create_with_embedding(new_rule, embedding).await?;
            info!(session_id, rule_id = %rule.id, "learned rule from session");
            outcome.committed += 1;
        }

        self.sessions.mark_learned(&session.id).await?;
        info!(
            session_id,
            candidates = outcome.candidates,
            committed = outcome.committed,
            deduplicated = outcome.deduplicated,
            dropped = outcome.dropped,
            "finished learning from session"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbeddingClient;
    use crate::history::{MessageRole, NewMessage, NewProject, NewSession, NewToolCall, ProjectRepository, Session};
    use crate::llm::MockLLMClient;
    use crate::migrations::run_migrations;
    use crate::rules::{NewRule, RuleAction, RuleKind};
    use chrono::{Duration, Utc};
    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn setup_db() -> (Database, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_name = format!("db_{}.sqlite", Uuid::new_v4());
        let db_path = dir.path().join(db_name);
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");
        (db, dir)
    }

    /// A session where the assistant force-pushed and the user objected in
    /// the third message. Returns the session and the correction message id.
    async fn seed_corrected_session(db: &Database) -> (Session, String) {
        let project = ProjectRepository::new(db.clone())
            .get_or_create(NewProject {
                path: "/home/dev/api".into(),
                name: "api".into(),
                rule_set_id: None,
            })
            .await
            .expect("project");
        let sessions = SessionRepository::new(db.clone());
        let session = sessions
            .get_or_create(NewSession {
                project_id: project.id,
                external_id: format!("ext-{}", Uuid::new_v4()),
                transcript_path: None,
                task: None,
            })
            .await
            .expect("session");

        let messages = MessageRepository::new(db.clone());
        let base = Utc::now();
        let insert = |role, content: &str, offset| {
            let messages = messages.clone();
            let session_id = session.id.clone();
            let content = content.to_string();
            async move {
                messages
                    .create(NewMessage {
                        session_id,
                        external_uuid: Uuid::new_v4().to_string(),
                        role,
                        content,
                        timestamp: base + Duration::seconds(offset),
                    })
                    .await
                    .expect("create message")
                    .expect("inserted")
            }
        };

        insert(MessageRole::User, "Set up the deploy script", 0).await;
        let assistant = insert(MessageRole::Assistant, "Pushing with force", 1).await;
        let correction = insert(
            MessageRole::User,
            "Never force push to main. Use --force-with-lease.",
            2,
        )
        .await;

        ToolCallRepository::new(db.clone())
            .create(NewToolCall {
                message_id: assistant.id,
                external_id: format!("toolu-{}", Uuid::new_v4()),
                tool: "Bash".into(),
                input: json!({"command": "git push --force origin main"}),
                output: Some("pushed".into()),
                success: Some(true),
                duration_ms: None,
                timestamp: base + Duration::seconds(1),
            })
            .await
            .expect("tool call")
            .expect("inserted");

        let session = sessions.complete(&session.id).await.expect("complete");
        (session, correction.id)
    }

    fn extractor_with(
        db: &Database,
        llm: &MockLLMClient,
        embeddings: &MockEmbeddingClient,
        dedup_threshold: f32,
        max_message_chars: usize,
    ) -> LearningExtractor {
        LearningExtractor::new(
            db.clone(),
            Arc::new(llm.clone()),
            Arc::new(embeddings.clone()),
            ModelConfig {
                provider: "anthropic".into(),
                model: "claude-sonnet-4-5".into(),
                temperature: 0.2,
                max_output_tokens: 2048,
            },
            LearningConfig {
                dedup_threshold,
                max_message_chars,
            },
        )
    }

    fn force_push_candidate() -> String {
        json!({
            "rules": [{
                "patterns": ["git push --force"],
                "description": "Do not force push to shared branches",
                "problem": "Force pushed over a teammate's commits",
                "solution": "Use --force-with-lease",
                "tool": "Bash",
                "action": "block",
                "message_number": 3
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn commits_rules_from_corrections() {
        let (db, _dir) = setup_db().await;
        let (session, correction_id) = seed_corrected_session(&db).await;

        let llm = MockLLMClient::new();
        llm.enqueue_text(&force_push_candidate());
        let embeddings = MockEmbeddingClient::new();
        embeddings.enqueue_vector(vec![1.0, 0.0, 0.0]);

        let extractor = extractor_with(&db, &llm, &embeddings, 0.85, 500);
        let outcome = extractor.learn_session(&session.id).await.expect("learn");

        assert_eq!(outcome.skipped, None);
        assert_eq!(outcome.candidates, 1);
        assert_eq!(outcome.committed, 1);

        let rules = RuleRepository::new(db.clone());
        let all = rules.list_all(false).await.expect("rules");
        assert_eq!(all.len(), 1);
        let learned = &all[0];
        assert_eq!(learned.kind, RuleKind::Regex);
        assert_eq!(learned.action, RuleAction::Block);
        assert_eq!(learned.patterns, vec!["git push --force"]);
        assert_eq!(learned.tool.as_deref(), Some("Bash"));
        assert_eq!(learned.source_message_id.as_deref(), Some(correction_id.as_str()));
        assert_eq!(learned.solution.as_deref(), Some("Use --force-with-lease"));

        let embedding = rules
            .get_embedding(&learned.id)
            .await
            .expect("embedding query")
            .expect("embedding row");
        assert_eq!(embedding.embedding, vec![1.0, 0.0, 0.0]);
        assert_eq!(embedding.model, "mock-embedding");

        let refreshed = SessionRepository::new(db).get_by_id(&session.id).await.expect("session");
        assert!(refreshed.learned_at.is_some());

        assert_eq!(embeddings.inputs().len(), 1);
        assert!(embeddings.inputs()[0].contains("Do not force push"));
    }

    #[tokio::test]
    async fn skips_sessions_that_are_not_completed() {
        let (db, _dir) = setup_db().await;
        let project = ProjectRepository::new(db.clone())
            .get_or_create(NewProject {
                path: "/home/dev/api".into(),
                name: "api".into(),
                rule_set_id: None,
            })
            .await
            .expect("project");
        let session = SessionRepository::new(db.clone())
            .get_or_create(NewSession {
                project_id: project.id,
                external_id: "ext-active".into(),
                transcript_path: None,
                task: None,
            })
            .await
            .expect("session");

        let llm = MockLLMClient::new();
        let embeddings = MockEmbeddingClient::new();
        let extractor = extractor_with(&db, &llm, &embeddings, 0.85, 500);
        let outcome = extractor.learn_session(&session.id).await.expect("learn");

        assert_eq!(outcome.skipped.as_deref(), Some("session is not completed"));
        assert_eq!(llm.call_count(), 0);

        let sessions = SessionRepository::new(db);
        let refreshed = sessions.get_by_id(&session.id).await.expect("session");
        assert!(refreshed.learned_at.is_none());

        // An abandoned session is just as unlearnable as an active one.
        sessions
            .set_status(&session.id, SessionStatus::Abandoned)
            .await
            .expect("abandon");
        let outcome = extractor.learn_session(&session.id).await.expect("learn");
        assert_eq!(outcome.skipped.as_deref(), Some("session is not completed"));
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn rerunning_a_learned_session_creates_nothing() {
        let (db, _dir) = setup_db().await;
        let (session, _) = seed_corrected_session(&db).await;

        let llm = MockLLMClient::new();
        llm.enqueue_text(&force_push_candidate());
        let embeddings = MockEmbeddingClient::new();
        embeddings.enqueue_vector(vec![1.0, 0.0, 0.0]);

        let extractor = extractor_with(&db, &llm, &embeddings, 0.85, 500);
        extractor.learn_session(&session.id).await.expect("first run");

        let second = extractor.learn_session(&session.id).await.expect("second run");
        assert_eq!(second.skipped.as_deref(), Some("session already learned"));
        assert_eq!(second.committed, 0);
        assert_eq!(llm.call_count(), 1, "oracle consulted once");

        let all = RuleRepository::new(db).list_all(false).await.expect("rules");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn near_duplicate_candidates_are_discarded() {
        let (db, _dir) = setup_db().await;
        let (session, _) = seed_corrected_session(&db).await;

        let rules = RuleRepository::new(db.clone());
        rules
            .create_with_embedding(
                NewRule {
                    rule_set_id: None,
                    kind: RuleKind::Regex,
                    patterns: vec!["git push -f".into()],
                    description: "Existing force push rule".into(),
                    tool: None,
                    action: RuleAction::Warn,
                    llm_review: false,
                    prompt: None,
                    active: true,
                    priority: 0,
                    problem: None,
                    solution: None,
                    source_message_id: None,
                },
                NewRuleEmbedding {
                    embedding: vec![1.0, 0.0, 0.0],
                    model: "mock-embedding".into(),
                },
            )
            .await
            .expect("existing rule");

        let llm = MockLLMClient::new();
        llm.enqueue_text(&force_push_candidate());
        let embeddings = MockEmbeddingClient::new();
        embeddings.enqueue_vector(vec![1.0, 0.0, 0.0]);

        let extractor = extractor_with(&db, &llm, &embeddings, 0.85, 500);
        let outcome = extractor.learn_session(&session.id).await.expect("learn");

        assert_eq!(outcome.deduplicated, 1);
        assert_eq!(outcome.committed, 0);
        assert_eq!(rules.list_all(false).await.expect("rules").len(), 1);

        let refreshed = SessionRepository::new(db).get_by_id(&session.id).await.expect("session");
        assert!(refreshed.learned_at.is_some(), "dedup still finishes the run");
    }

    #[tokio::test]
    async fn dissimilar_candidate_commits_alongside_existing_rules() {
        let (db, _dir) = setup_db().await;
        let (session, _) = seed_corrected_session(&db).await;

        let rules = RuleRepository::new(db.clone());
        rules
            .create_with_embedding(
                NewRule {
                    rule_set_id: None,
                    kind: RuleKind::Regex,
                    patterns: vec!["DROP TABLE".into()],
                    description: "No destructive SQL".into(),
                    tool: None,
                    action: RuleAction::Block,
                    llm_review: false,
                    prompt: None,
                    active: true,
                    priority: 0,
                    problem: None,
                    solution: None,
                    source_message_id: None,
                },
                NewRuleEmbedding {
                    embedding: vec![1.0, 0.0, 0.0],
                    model: "mock-embedding".into(),
                },
            )
            .await
            .expect("existing rule");

        let llm = MockLLMClient::new();
        llm.enqueue_text(&force_push_candidate());
        let embeddings = MockEmbeddingClient::new();
        embeddings.enqueue_vector(vec![0.0, 1.0, 0.0]);

        let extractor = extractor_with(&db, &llm, &embeddings, 0.85, 500);
        let outcome = extractor.learn_session(&session.id).await.expect("learn");

        assert_eq!(outcome.committed, 1);
        assert_eq!(outcome.deduplicated, 0);
        assert_eq!(rules.list_all(false).await.expect("rules").len(), 2);
    }

    #[tokio::test]
    async fn invalid_candidates_are_dropped_not_fatal() {
        let (db, _dir) = setup_db().await;
        let (session, _) = seed_corrected_session(&db).await;

        let llm = MockLLMClient::new();
        llm.enqueue_text(
            &json!({
                "rules": [
                    {"patterns": ["[unclosed"], "description": "broken regex"},
                    {"patterns": ["sudo rm"], "description": "valid", "action": "warn"}
                ]
            })
            .to_string(),
        );
        let embeddings = MockEmbeddingClient::new();
        embeddings.enqueue_vector(vec![0.2, 0.8, 0.0]);

        let extractor = extractor_with(&db, &llm, &embeddings, 0.85, 500);
        let outcome = extractor.learn_session(&session.id).await.expect("learn");

        assert_eq!(outcome.candidates, 2);
        assert_eq!(outcome.dropped, 1);
        assert_eq!(outcome.committed, 1);

        let all = RuleRepository::new(db).list_all(false).await.expect("rules");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].description, "valid");
    }

    #[tokio::test]
    async fn unparseable_oracle_reply_fails_without_stamping() {
        let (db, _dir) = setup_db().await;
        let (session, _) = seed_corrected_session(&db).await;

        let llm = MockLLMClient::new();
        llm.enqueue_text("I could not find any corrections worth mentioning.");
        let embeddings = MockEmbeddingClient::new();

        let extractor = extractor_with(&db, &llm, &embeddings, 0.85, 500);
        let result = extractor.learn_session(&session.id).await;
        assert!(matches!(result, Err(LearnError::Parse(_))));

        let refreshed = SessionRepository::new(db).get_by_id(&session.id).await.expect("session");
        assert!(refreshed.learned_at.is_none(), "failed run can be retried");
    }

    #[tokio::test]
    async fn session_without_corrections_is_still_stamped() {
        let (db, _dir) = setup_db().await;
        let (session, _) = seed_corrected_session(&db).await;

        let llm = MockLLMClient::new();
        llm.enqueue_text(r#"{"rules": []}"#);
        let embeddings = MockEmbeddingClient::new();

        let extractor = extractor_with(&db, &llm, &embeddings, 0.85, 500);
        let outcome = extractor.learn_session(&session.id).await.expect("learn");

        assert_eq!(outcome.candidates, 0);
        assert_eq!(outcome.committed, 0);
        let refreshed = SessionRepository::new(db).get_by_id(&session.id).await.expect("session");
        assert!(refreshed.learned_at.is_some());
    }

    #[tokio::test]
    async fn embedding_failure_drops_the_candidate() {
        let (db, _dir) = setup_db().await;
        let (session, _) = seed_corrected_session(&db).await;

        let llm = MockLLMClient::new();
        llm.enqueue_text(&force_push_candidate());
        let embeddings = MockEmbeddingClient::new();
        // Nothing enqueued, so embed() fails.

        let extractor = extractor_with(&db, &llm, &embeddings, 0.85, 500);
        let outcome = extractor.learn_session(&session.id).await.expect("learn");

        assert_eq!(outcome.dropped, 1);
        assert_eq!(outcome.committed, 0);
        assert!(RuleRepository::new(db.clone()).list_all(false).await.expect("rules").is_empty());

        let refreshed = SessionRepository::new(db).get_by_id(&session.id).await.expect("session");
        assert!(refreshed.learned_at.is_some());
    }

    #[tokio::test]
    async fn oracle_sees_numbered_transcript_with_tool_calls() {
        let (db, _dir) = setup_db().await;
        let (session, _) = seed_corrected_session(&db).await;

        let llm = MockLLMClient::new();
        llm.enqueue_text(r#"{"rules": []}"#);
        let embeddings = MockEmbeddingClient::new();

        let extractor = extractor_with(&db, &llm, &embeddings, 0.85, 500);
        extractor.learn_session(&session.id).await.expect("learn");

        let requests = llm.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].json_mode);
        let transcript = &requests[0].messages[1].content;
        assert!(transcript.contains("[1] USER: Set up the deploy script"));
        assert!(transcript.contains("[2] ASSISTANT: Pushing with force"));
        assert!(transcript.contains("[tool: Bash]"));
        assert!(transcript.contains("git push --force origin main"));
        assert!(transcript.contains("[3] USER: Never force push to main"));
    }

    #[tokio::test]
    async fn transcript_respects_configured_truncation() {
        let (db, _dir) = setup_db().await;
        let (session, _) = seed_corrected_session(&db).await;

        let llm = MockLLMClient::new();
        llm.enqueue_text(r#"{"rules": []}"#);
        let embeddings = MockEmbeddingClient::new();

        let extractor = extractor_with(&db, &llm, &embeddings, 0.85, 10);
        extractor.learn_session(&session.id).await.expect("learn");

        let transcript = &llm.requests()[0].messages[1].content;
        assert!(transcript.contains("[truncated]"));
        assert!(!transcript.contains("Use --force-with-lease."));
    }
}
