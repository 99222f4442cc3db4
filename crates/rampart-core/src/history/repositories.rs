use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};
use crate::rules::RuleAction;

use super::types::{
    Message, MessageRole, NewMessage, NewProject, NewRuleTrigger, NewSession, NewToolCall,
    Project, RuleTrigger, Session, SessionStatus, ToolCall,
};

const PROJECT_COLUMNS: &str = "id, path, name, rule_set_id, created_at";
const SESSION_COLUMNS: &str =
    "id, project_id, external_id, transcript_path, task, status, started_at, ended_at, learned_at";
const MESSAGE_COLUMNS: &str = "id, session_id, external_uuid, role, content, timestamp";
const TOOL_CALL_COLUMNS: &str =
    "id, message_id, external_id, tool, input, output, success, duration_ms, timestamp";
const TRIGGER_COLUMNS: &str = "id, rule_id, tool_call_id, action_taken, llm_reasoning, timestamp";

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("project not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("invalid status value {0}")]
    InvalidStatus(String),
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("message not found: {0}")]
    NotFound(String),
    #[error("invalid role value {0}")]
    InvalidRole(String),
}

#[derive(Debug, Error)]
pub enum ToolCallError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("tool call not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid action value {0}")]
    InvalidAction(String),
    #[error("rule trigger not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct ProjectRepository {
    db: Database,
}

impl ProjectRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get_or_create(&self, new_project: NewProject) -> Result<Project, ProjectError> {
        if let Some(existing) = self.find_by_path(&new_project.path).await? {
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let result = conn
            .execute(
                "INSERT INTO projects (id, path, name, rule_set_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id.clone(),
                    new_project.path.clone(),
                    new_project.name,
                    new_project.rule_set_id,
                    now
                ],
            )
            .await;

        match result {
            Ok(_) => self.get_by_id(&id).await,
            // Lost a create race; the row now exists.
            Err(err) if is_unique_violation(&err) => self
                .find_by_path(&new_project.path)
                .await?
                .ok_or(ProjectError::NotFound(new_project.path)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Project, ProjectError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_project(row),
            None => Err(ProjectError::NotFound(id.to_string())),
        }
    }

    pub async fn find_by_path(&self, path: &str) -> Result<Option<Project>, ProjectError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE path = ?1"),
                params![path],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_project(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_all(&self) -> Result<Vec<Project>, ProjectError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY path"),
                (),
            )
            .await?;

        let mut projects = Vec::new();
        while let Some(row) = rows.next().await? {
            projects.push(row_to_project(row)?);
        }
        Ok(projects)
    }

    pub async fn bind_rule_set(
        &self,
        id: &str,
        rule_set_id: Option<&str>,
    ) -> Result<Project, ProjectError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE projects SET rule_set_id = ?2 WHERE id = ?1 RETURNING {PROJECT_COLUMNS}"
                ),
                params![id, rule_set_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_project(row),
            None => Err(ProjectError::NotFound(id.to_string())),
        }
    }
}

/// A session row plus the aggregate counts the dashboard session list shows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session: Session,
    pub message_count: i64,
    pub rules_created: i64,
}

#[derive(Clone)]
pub struct SessionRepository {
    db: Database,
}

impl SessionRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get_or_create(&self, new_session: NewSession) -> Result<Session, SessionError> {
        if let Some(existing) = self.find_by_external_id(&new_session.external_id).await? {
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let result = conn
            .execute(
                "INSERT INTO sessions (id, project_id, external_id, transcript_path, task, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.clone(),
                    new_session.project_id,
                    new_session.external_id.clone(),
                    new_session.transcript_path,
                    new_session.task,
                    SessionStatus::Active.as_str(),
                    now
                ],
            )
            .await;

        match result {
            Ok(_) => self.get_by_id(&id).await,
            Err(err) if is_unique_violation(&err) => self
                .find_by_external_id(&new_session.external_id)
                .await?
                .ok_or(SessionError::NotFound(new_session.external_id)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Session, SessionError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_session(row),
            None => Err(SessionError::NotFound(id.to_string())),
        }
    }

    pub async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Session>, SessionError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE external_id = ?1"),
                params![external_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_session(row)?)),
            None => Ok(None),
        }
    }

    /// Record the first user message of the session as its task description.
    /// Later calls are no-ops once a task is set.
    pub async fn set_task_if_empty(&self, id: &str, task: &str) -> Result<(), SessionError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "UPDATE sessions SET task = ?2 WHERE id = ?1 AND (task IS NULL OR task = '')",
            params![id, task],
        )
        .await?;
        Ok(())
    }

    /// Mark a session completed. The first recorded end time wins so a
    /// re-delivered session-end event cannot rewrite history.
    pub async fn complete(&self, id: &str) -> Result<Session, SessionError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE sessions
                     SET status = ?2, ended_at = COALESCE(ended_at, ?3)
                     WHERE id = ?1
                     RETURNING {SESSION_COLUMNS}"
                ),
                params![id, SessionStatus::Completed.as_str(), now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_session(row),
            None => Err(SessionError::NotFound(id.to_string())),
        }
    }

    pub async fn set_status(&self, id: &str, status: SessionStatus) -> Result<Session, SessionError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE sessions SET status = ?2 WHERE id = ?1 RETURNING {SESSION_COLUMNS}"
                ),
                params![id, status.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_session(row),
            None => Err(SessionError::NotFound(id.to_string())),
        }
    }

    pub async fn mark_learned(&self, id: &str) -> Result<Session, SessionError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE sessions SET learned_at = ?2 WHERE id = ?1 RETURNING {SESSION_COLUMNS}"
                ),
                params![id, now],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_session(row),
            None => Err(SessionError::NotFound(id.to_string())),
        }
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<SessionSummary>, SessionError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT s.id, s.project_id, s.external_id, s.transcript_path, s.task, s.status, s.started_at, s.ended_at, s.learned_at,
                        (SELECT COUNT(*) FROM messages m WHERE m.session_id = s.id),
                        (SELECT COUNT(*) FROM rules r WHERE r.source_message_id IN
                            (SELECT id FROM messages m2 WHERE m2.session_id = s.id))
                 FROM sessions s
                 ORDER BY s.started_at DESC
                 LIMIT ?1",
                params![limit],
            )
            .await?;

        let mut summaries = Vec::new();
        while let Some(row) = rows.next().await? {
            let message_count: i64 = row.get(9)?;
            let rules_created: i64 = row.get(10)?;
            summaries.push(SessionSummary {
                session: row_to_session(row)?,
                message_count,
                rules_created,
            });
        }
        Ok(summaries)
    }

    pub async fn count(&self) -> Result<i64, SessionError> {
        let conn = self.db.connection().await?;
        let mut rows = conn.query("SELECT COUNT(*) FROM sessions", ()).await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| SessionError::NotFound("count".into()))?;
        Ok(row.get(0)?)
    }
}

#[derive(Clone)]
pub struct MessageRepository {
    db: Database,
}

impl MessageRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a message. Returns `None` when a message with the same external
    /// uuid is already recorded, which keeps transcript ingestion idempotent.
    pub async fn create(&self, new_message: NewMessage) -> Result<Option<Message>, MessageError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.db.connection().await?;
        let result = conn
            .execute(
                "INSERT INTO messages (id, session_id, external_uuid, role, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.clone(),
                    new_message.session_id,
                    new_message.external_uuid,
                    new_message.role.as_str(),
                    new_message.content,
                    format_timestamp(new_message.timestamp)
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(Some(self.get_by_id(&id).await?)),
            Err(err) if is_unique_violation(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Message, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_message(row),
            None => Err(MessageError::NotFound(id.to_string())),
        }
    }

    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<Message>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE session_id = ?1
                     ORDER BY timestamp, id"
                ),
                params![session_id],
            )
            .await?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }

    pub async fn count(&self) -> Result<i64, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn.query("SELECT COUNT(*) FROM messages", ()).await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| MessageError::NotFound("count".into()))?;
        Ok(row.get(0)?)
    }
}

#[derive(Clone)]
pub struct ToolCallRepository {
    db: Database,
}

impl ToolCallRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a tool call. Returns `None` when the external id is already
    /// recorded.
    pub async fn create(&self, new_call: NewToolCall) -> Result<Option<ToolCall>, ToolCallError> {
        let id = Uuid::new_v4().to_string();
        let input_json = serde_json::to_string(&new_call.input)?;
        let conn = self.db.connection().await?;
        let result = conn
            .execute(
                "INSERT INTO tool_calls (id, message_id, external_id, tool, input, output, success, duration_ms, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.clone(),
                    new_call.message_id,
                    new_call.external_id,
                    new_call.tool,
                    input_json,
                    new_call.output,
                    new_call.success.map(|v| v as i64),
                    new_call.duration_ms,
                    format_timestamp(new_call.timestamp)
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(Some(self.get_by_id(&id).await?)),
            Err(err) if is_unique_violation(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<ToolCall, ToolCallError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {TOOL_CALL_COLUMNS} FROM tool_calls WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_tool_call(row),
            None => Err(ToolCallError::NotFound(id.to_string())),
        }
    }

    /// Backfill the result of a tool call once its tool_result block shows up
    /// later in the transcript. Returns false when the external id is unknown.
    pub async fn set_result(
        &self,
        external_id: &str,
        output: &str,
        success: Option<bool>,
    ) -> Result<bool, ToolCallError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE tool_calls SET output = ?2, success = COALESCE(?3, success)
                 WHERE external_id = ?1
                 RETURNING id",
                params![external_id, output, success.map(|v| v as i64)],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<ToolCall>, ToolCallError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {tool_call_columns} FROM tool_calls tc
                     JOIN messages m ON m.id = tc.message_id
                     WHERE m.session_id = ?1
                     ORDER BY tc.timestamp, tc.id",
                    tool_call_columns = TOOL_CALL_COLUMNS
                        .split(", ")
                        .map(|col| format!("tc.{col}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                params![session_id],
            )
            .await?;

        let mut calls = Vec::new();
        while let Some(row) = rows.next().await? {
            calls.push(row_to_tool_call(row)?);
        }
        Ok(calls)
    }

    pub async fn count(&self) -> Result<i64, ToolCallError> {
        let conn = self.db.connection().await?;
        let mut rows = conn.query("SELECT COUNT(*) FROM tool_calls", ()).await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| ToolCallError::NotFound("count".into()))?;
        Ok(row.get(0)?)
    }
}

#[derive(Clone)]
pub struct TriggerRepository {
    db: Database,
}

impl TriggerRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, new_trigger: NewRuleTrigger) -> Result<RuleTrigger, TriggerError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO rule_triggers (id, rule_id, tool_call_id, action_taken, llm_reasoning, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     RETURNING {TRIGGER_COLUMNS}"
                ),
                params![
                    id,
                    new_trigger.rule_id,
                    new_trigger.tool_call_id,
                    new_trigger.action_taken.as_str(),
                    new_trigger.llm_reasoning,
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_trigger(row),
            None => Err(TriggerError::NotFound("insert failed".into())),
        }
    }

    pub async fn list_for_rule(
        &self,
        rule_id: &str,
        limit: i64,
    ) -> Result<Vec<RuleTrigger>, TriggerError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TRIGGER_COLUMNS} FROM rule_triggers
                     WHERE rule_id = ?1
                     ORDER BY timestamp DESC
                     LIMIT ?2"
                ),
                params![rule_id, limit],
            )
            .await?;

        let mut triggers = Vec::new();
        while let Some(row) = rows.next().await? {
            triggers.push(row_to_trigger(row)?);
        }
        Ok(triggers)
    }

    pub async fn count(&self) -> Result<i64, TriggerError> {
        let conn = self.db.connection().await?;
        let mut rows = conn.query("SELECT COUNT(*) FROM rule_triggers", ()).await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| TriggerError::NotFound("count".into()))?;
        Ok(row.get(0)?)
    }
}

fn row_to_project(row: Row) -> Result<Project, ProjectError> {
    let created_at: String = row.get(4)?;
    Ok(Project {
        id: row.get(0)?,
        path: row.get(1)?,
        name: row.get(2)?,
        rule_set_id: row.get(3)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

fn row_to_session(row: Row) -> Result<Session, SessionError> {
    let status: String = row.get(5)?;
    let started_at: String = row.get(6)?;
    let ended_at: Option<String> = row.get(7)?;
    let learned_at: Option<String> = row.get(8)?;

    let status =
        SessionStatus::from_str(&status).ok_or_else(|| SessionError::InvalidStatus(status.clone()))?;

    Ok(Session {
        id: row.get(0)?,
        project_id: row.get(1)?,
        external_id: row.get(2)?,
        transcript_path: row.get(3)?,
        task: row.get(4)?,
        status,
        started_at: DateTime::parse_from_rfc3339(&started_at)?.with_timezone(&Utc),
        ended_at: parse_optional_timestamp::<SessionError>(ended_at)?,
        learned_at: parse_optional_timestamp::<SessionError>(learned_at)?,
    })
}

fn row_to_message(row: Row) -> Result<Message, MessageError> {
    let role: String = row.get(3)?;
    let timestamp: String = row.get(5)?;

    let role = MessageRole::from_str(&role).ok_or_else(|| MessageError::InvalidRole(role.clone()))?;

    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        external_uuid: row.get(2)?,
        role,
        content: row.get(4)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
    })
}

fn row_to_tool_call(row: Row) -> Result<ToolCall, ToolCallError> {
    let input_json: String = row.get(4)?;
    let success: Option<i64> = row.get(6)?;
    let timestamp: String = row.get(8)?;

    Ok(ToolCall {
        id: row.get(0)?,
        message_id: row.get(1)?,
        external_id: row.get(2)?,
        tool: row.get(3)?,
        input: serde_json::from_str(&input_json)?,
        output: row.get(5)?,
        success: success.map(|v| v != 0),
        duration_ms: row.get(7)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
    })
}

fn row_to_trigger(row: Row) -> Result<RuleTrigger, TriggerError> {
    let action: String = row.get(3)?;
    let timestamp: String = row.get(5)?;

    let action_taken =
        RuleAction::from_str(&action).ok_or_else(|| TriggerError::InvalidAction(action.clone()))?;

    Ok(RuleTrigger {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        tool_call_id: row.get(2)?,
        action_taken,
        llm_reasoning: row.get(4)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
    })
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_optional_timestamp<E>(ts: Option<String>) -> Result<Option<DateTime<Utc>>, E>
where
    E: From<chrono::ParseError>,
{
    match ts {
        Some(value) => Ok(Some(
            DateTime::parse_from_rfc3339(&value)?.with_timezone(&Utc),
        )),
        None => Ok(None),
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_unique_violation(err: &libsql::Error) -> bool {
    err.to_string()
        .to_ascii_lowercase()
        .contains("unique constraint failed")
}
