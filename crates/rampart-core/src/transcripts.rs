//! Transcript ingest. The host runtime writes one JSON object per line;
//! this module replays a transcript file into projects, sessions, messages,
//! and tool calls so the learning extractor can work from structured rows.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::Database;
use crate::history::{
    MessageError, MessageRepository, MessageRole, NewMessage, NewProject, NewSession, NewToolCall,
    ProjectError, ProjectRepository, Session, SessionError, SessionRepository, ToolCallError,
    ToolCallRepository,
};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read transcript: {0}")]
    Io(#[from] std::io::Error),
    #[error("transcript entries carry no session id")]
    MissingSessionId,
    #[error("transcript entries carry no working directory")]
    MissingCwd,
    #[error("project error: {0}")]
    Project(#[from] ProjectError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("tool call error: {0}")]
    ToolCall(#[from] ToolCallError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub messages: usize,
    pub tool_calls: usize,
    pub skipped: usize,
}

#[derive(Debug, Deserialize)]
struct TranscriptEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    cwd: Option<String>,
    uuid: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    message: Option<TranscriptMessage>,
}

#[derive(Debug, Deserialize)]
struct TranscriptMessage {
    role: Option<String>,
    content: TranscriptContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TranscriptContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

fn text_content(content: &TranscriptContent) -> String {
    match content {
        TranscriptContent::Text(text) => text.clone(),
        TranscriptContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// Tool results arrive as a plain string or as a block list, depending on
/// the tool. Flatten either into the stored output text.
fn result_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn project_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

pub struct TranscriptIngestor {
    projects: ProjectRepository,
    sessions: SessionRepository,
    messages: MessageRepository,
    tool_calls: ToolCallRepository,
}

impl TranscriptIngestor {
    pub fn new(db: Database) -> Self {
        Self {
            projects: ProjectRepository::new(db.clone()),
            sessions: SessionRepository::new(db.clone()),
            messages: MessageRepository::new(db.clone()),
            tool_calls: ToolCallRepository::new(db),
        }
    }

    /// Reads a transcript file and records its session, messages, and tool
    /// calls. Safe to run repeatedly; already-recorded messages are counted
    /// as skipped rather than duplicated.
    pub async fn ingest_file(&self, path: &Path) -> Result<(Session, IngestStats), IngestError> {
        let raw = tokio::fs::read_to_string(path).await?;
        self.ingest(&raw, &path.to_string_lossy()).await
    }

    pub async fn ingest(
        &self,
        raw: &str,
        transcript_path: &str,
    ) -> Result<(Session, IngestStats), IngestError> {
        let mut stats = IngestStats::default();

        let mut entries = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptEntry>(line) {
                // Summaries and other non-message entry types are not ours.
                Ok(entry) if entry.kind == "user" || entry.kind == "assistant" => {
                    entries.push(entry);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        line = index + 1,
                        error = %err,
                        "skipping unparseable transcript line"
                    );
                    stats.skipped += 1;
                }
            }
        }

        let external_id = entries
            .iter()
            .find_map(|entry| entry.session_id.clone())
            .ok_or(IngestError::MissingSessionId)?;
        let cwd = entries
            .iter()
            .find_map(|entry| entry.cwd.clone())
            .ok_or(IngestError::MissingCwd)?;

        let project = self
            .projects
            .get_or_create(NewProject {
                name: project_name(&cwd),
                path: cwd,
                rule_set_id: None,
            })
            .await?;
        let session = self
            .sessions
            .get_or_create(NewSession {
                project_id: project.id.clone(),
                external_id,
                transcript_path: Some(transcript_path.to_string()),
                task: None,
            })
            .await?;

        let mut task_pending = session.task.as_deref().is_none_or(str::is_empty);

        for entry in entries {
            let (Some(uuid), Some(timestamp), Some(message)) =
                (entry.uuid, entry.timestamp, entry.message)
            else {
                warn!("skipping transcript entry without uuid, timestamp, or message");
                stats.skipped += 1;
                continue;
            };

            let role = message
                .role
                .as_deref()
                .and_then(MessageRole::from_str)
                .or_else(|| MessageRole::from_str(&entry.kind));
            let Some(role) = role else {
                warn!(uuid = %uuid, "skipping transcript entry with unknown role");
                stats.skipped += 1;
                continue;
            };

            let text = text_content(&message.content);
            if task_pending && role == MessageRole::User && !text.trim().is_empty() {
                self.sessions.set_task_if_empty(&session.id, &text).await?;
                task_pending = false;
            }

            let inserted = self
                .messages
                .create(NewMessage {
                    session_id: session.id.clone(),
                    external_uuid: uuid,
                    role,
                    content: text,
                    timestamp,
                })
                .await?;
            let Some(stored) = inserted else {
                stats.skipped += 1;
                continue;
            };
            stats.messages += 1;

            let TranscriptContent::Blocks(blocks) = &message.content else {
                continue;
            };
            for block in blocks {
                match block {
                    ContentBlock::ToolUse { id, name, input } => {
                        let created = self
                            .tool_calls
                            .create(NewToolCall {
                                message_id: stored.id.clone(),
                                external_id: id.clone(),
                                tool: name.clone(),
                                input: input.clone(),
                                output: None,
                                success: None,
                                duration_ms: None,
                                timestamp,
                            })
                            .await?;
                        if created.is_some() {
                            stats.tool_calls += 1;
                        }
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let output = result_text(content);
                        let success = is_error.map(|flagged| !flagged);
                        let updated = self
                            .tool_calls
                            .set_result(tool_use_id, &output, success)
                            .await?;
                        if !updated {
                            debug!(tool_use_id = %tool_use_id, "tool result without a matching call");
                        }
                    }
                    _ => {}
                }
            }
        }

        debug!(
            session_id = %session.id,
            messages = stats.messages,
            tool_calls = stats.tool_calls,
            skipped = stats.skipped,
            "ingested transcript"
        );
        Ok((session, stats))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
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

    fn sample_transcript() -> String {
        let lines = vec![
            json!({"type": "summary", "summary": "Test session"}),
            json!({
                "type": "user",
                "sessionId": "ext-123",
                "cwd": "/test/project",
                "uuid": "msg-1",
                "timestamp": "2024-01-01T00:00:00Z",
                "message": {"role": "user", "content": "Hello"}
            }),
            json!({
                "type": "assistant",
                "sessionId": "ext-123",
                "uuid": "msg-2",
                "timestamp": "2024-01-01T00:00:01Z",
                "message": {"role": "assistant", "content": [
                    {"type": "text", "text": "Let me help"},
                    {"type": "tool_use", "id": "tool-1", "name": "Bash", "input": {"command": "ls"}}
                ]}
            }),
            json!({
                "type": "user",
                "sessionId": "ext-123",
                "uuid": "msg-3",
                "timestamp": "2024-01-01T00:00:02Z",
                "message": {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tool-1", "content": "file1.txt\nfile2.txt"}
                ]}
            }),
        ];
        lines
            .into_iter()
            .map(|line| line.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn ingests_messages_tool_calls_and_results() {
        let (db, _dir) = setup_db().await;
        let ingestor = TranscriptIngestor::new(db.clone());

        let (session, stats) = ingestor
            .ingest(&sample_transcript(), "/tmp/transcript.jsonl")
            .await
            .expect("ingest");

        assert_eq!(
            stats,
            IngestStats {
                messages: 3,
                tool_calls: 1,
                skipped: 0
            }
        );
        assert_eq!(session.external_id, "ext-123");
        assert_eq!(session.transcript_path.as_deref(), Some("/tmp/transcript.jsonl"));

        let project = ProjectRepository::new(db.clone())
            .find_by_path("/test/project")
            .await
            .expect("query")
            .expect("project");
        assert_eq!(project.name, "project");

        let refreshed = SessionRepository::new(db.clone())
            .get_by_id(&session.id)
            .await
            .expect("session");
        assert_eq!(refreshed.task.as_deref(), Some("Hello"));

        let messages = MessageRepository::new(db.clone())
            .list_for_session(&session.id)
            .await
            .expect("messages");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content, "Let me help");
        assert_eq!(messages[2].content, "");

        let calls = ToolCallRepository::new(db)
            .list_for_session(&session.id)
            .await
            .expect("tool calls");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool, "Bash");
        assert_eq!(calls[0].input, json!({"command": "ls"}));
        assert!(calls[0].output.as_deref().unwrap().contains("file1.txt"));
        assert_eq!(calls[0].success, None, "no is_error flag on the result");
    }

    #[tokio::test]
    async fn reingest_counts_recorded_messages_as_skipped() {
        let (db, _dir) = setup_db().await;
        let ingestor = TranscriptIngestor::new(db.clone());
        let raw = sample_transcript();

        ingestor.ingest(&raw, "/tmp/t.jsonl").await.expect("first");
        let (session, stats) = ingestor.ingest(&raw, "/tmp/t.jsonl").await.expect("second");

        assert_eq!(
            stats,
            IngestStats {
                messages: 0,
                tool_calls: 0,
                skipped: 3
            }
        );
        let messages = MessageRepository::new(db)
            .list_for_session(&session.id)
            .await
            .expect("messages");
        assert_eq!(messages.len(), 3);
    }

    #[tokio::test]
    async fn ingest_file_reads_from_disk() {
        let (db, dir) = setup_db().await;
        let path = dir.path().join("transcript.jsonl");
        std::fs::write(&path, sample_transcript()).expect("write transcript");

        let ingestor = TranscriptIngestor::new(db);
        let (session, stats) = ingestor.ingest_file(&path).await.expect("ingest");

        assert_eq!(stats.messages, 3);
        assert_eq!(
            session.transcript_path.as_deref(),
            Some(path.to_string_lossy().as_ref())
        );
    }

    #[tokio::test]
    async fn unparseable_lines_are_skipped_not_fatal() {
        let (db, _dir) = setup_db().await;
        let raw = format!("not json at all\n{}", sample_transcript());

        let (_, stats) = TranscriptIngestor::new(db)
            .ingest(&raw, "/tmp/t.jsonl")
            .await
            .expect("ingest");

        assert_eq!(stats.messages, 3);
        assert_eq!(stats.skipped, 1);
    }

    #[tokio::test]
    async fn task_comes_from_first_user_text_not_tool_results() {
        let (db, _dir) = setup_db().await;
        let lines = vec![
            json!({
                "type": "user",
                "sessionId": "ext-task",
                "cwd": "/test/project",
                "uuid": "t-1",
                "timestamp": "2024-01-01T00:00:00Z",
                "message": {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tool-x", "content": "stale result"}
                ]}
            }),
            json!({
                "type": "user",
                "sessionId": "ext-task",
                "uuid": "t-2",
                "timestamp": "2024-01-01T00:00:01Z",
                "message": {"role": "user", "content": "Fix the login bug"}
            }),
        ];
        let raw = lines
            .into_iter()
            .map(|line| line.to_string())
            .collect::<Vec<_>>()
            .join("\n");

        let (session, _) = TranscriptIngestor::new(db.clone())
            .ingest(&raw, "/tmp/t.jsonl")
            .await
            .expect("ingest");

        let refreshed = SessionRepository::new(db)
            .get_by_id(&session.id)
            .await
            .expect("session");
        assert_eq!(refreshed.task.as_deref(), Some("Fix the login bug"));
    }

    #[tokio::test]
    async fn block_list_results_and_error_flags_are_recorded() {
        let (db, _dir) = setup_db().await;
        let lines = vec![
            json!({
                "type": "assistant",
                "sessionId": "ext-blocks",
                "cwd": "/test/project",
                "uuid": "b-1",
                "timestamp": "2024-01-01T00:00:00Z",
                "message": {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "tool-9", "name": "Bash", "input": {"command": "cat missing"}}
                ]}
            }),
            json!({
                "type": "user",
                "sessionId": "ext-blocks",
                "uuid": "b-2",
                "timestamp": "2024-01-01T00:00:01Z",
                "message": {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "tool-9", "is_error": true, "content": [
                        {"type": "text", "text": "cat: missing:"},
                        {"type": "text", "text": "No such file"}
                    ]}
                ]}
            }),
        ];
        let raw = lines
            .into_iter()
            .map(|line| line.to_string())
            .collect::<Vec<_>>()
            .join("\n");

        let (session, stats) = TranscriptIngestor::new(db.clone())
            .ingest(&raw, "/tmp/t.jsonl")
            .await
            .expect("ingest");
        assert_eq!(stats.tool_calls, 1);

        let calls = ToolCallRepository::new(db)
            .list_for_session(&session.id)
            .await
            .expect("tool calls");
        assert_eq!(calls[0].output.as_deref(), Some("cat: missing:\nNo such file"));
        assert_eq!(calls[0].success, Some(false));
    }

    #[tokio::test]
    async fn transcript_without_session_id_is_an_error() {
        let (db, _dir) = setup_db().await;
        let raw = json!({
            "type": "user",
            "cwd": "/test/project",
            "uuid": "n-1",
            "timestamp": "2024-01-01T00:00:00Z",
            "message": {"role": "user", "content": "Hello"}
        })
        .to_string();

        let result = TranscriptIngestor::new(db).ingest(&raw, "/tmp/t.jsonl").await;
        assert!(matches!(result, Err(IngestError::MissingSessionId)));
    }
}
