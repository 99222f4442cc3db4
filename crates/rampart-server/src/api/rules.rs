//! Rules API endpoints.
//!
//! Provides:
//! - GET /api/rules - List rules (active only unless `?include_inactive=true`)
//! - POST /api/rules - Create a rule
//! - GET /api/rules/{id} - Get a rule by ID
//! - PATCH /api/rules/{id} - Partially update a rule
//! - DELETE /api/rules/{id} - Deactivate a rule (rules are never hard-deleted)
//! - POST /api/rules/{id}/activate - Reactivate a rule
//! - POST /api/rules/{id}/deactivate - Deactivate a rule
//! - GET /api/rules/{id}/history - Rule provenance and recent triggers

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, patch, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use rampart_core::jobs::JOB_TYPE_EMBEDDINGS_SYNC;
use rampart_core::{
    JobQueue, Message, MessageRepository, NewRule, Project, ProjectRepository, Rule, RuleAction,
    RuleError, RuleKind, RuleRepository, RuleTrigger, Session, SessionRepository,
    TriggerRepository,
};

use crate::AppState;

/// Create the rules API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_rules))
        .route("/", post(create_rule))
        .route("/{id}", get(get_rule))
        .route("/{id}", patch(update_rule))
        .route("/{id}", delete(delete_rule))
        .route("/{id}/activate", post(activate_rule))
        .route("/{id}/deactivate", post(deactivate_rule))
        .route("/{id}/history", get(get_rule_history))
}

/// Error response for API errors.
#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
    message: String,
}

impl ApiError {
    fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new("bad_request", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}

/// Query parameters for listing rules.
#[derive(Debug, Default, Deserialize)]
pub struct ListRulesQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

/// GET /api/rules
///
/// List rules sorted by priority DESC. Deactivated rules are hidden unless
/// `include_inactive=true` is passed.
async fn list_rules(
    State(state): State<AppState>,
    Query(query): Query<ListRulesQuery>,
) -> impl IntoResponse {
    let repo = RuleRepository::new(state.db.clone());

    match repo.list_all(query.include_inactive).await {
        Ok(rules) => (StatusCode::OK, Json(rules)).into_response(),
        Err(e) => {
            tracing::error!("Failed to list rules: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("Failed to list rules")),
            )
                .into_response()
        }
    }
}

/// GET /api/rules/{id}
///
/// Get a single rule by ID.
async fn get_rule(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let repo = RuleRepository::new(state.db.clone());

    match repo.get_by_id(&id).await {
        Ok(rule) => (StatusCode::OK, Json(rule)).into_response(),
        Err(RuleError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(format!("Rule not found: {}", id))),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to get rule {}: {}", id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal(format!("Failed to get rule: {}", e))),
            )
                .into_response()
        }
    }
}

/// Request body for creating a rule.
#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub rule_set_id: Option<String>,
    /// Defaults to Regex if not specified.
    pub kind: Option<RuleKind>,
    pub patterns: Option<Vec<String>>,
    pub description: String,
    pub tool: Option<String>,
    /// Defaults to Block if not specified.
    pub action: Option<RuleAction>,
    pub llm_review: Option<bool>,
    pub prompt: Option<String>,
    pub active: Option<bool>,
    pub priority: Option<i64>,
    pub problem: Option<String>,
    pub solution: Option<String>,
}

/// POST /api/rules
///
/// Create a new rule. Pattern and prompt invariants are enforced by the
/// repository, so a semantic rule without a prompt comes back as 400.
async fn create_rule(
    State(state): State<AppState>,
    Json(body): Json<CreateRuleRequest>,
) -> impl IntoResponse {
    if body.description.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiError::bad_request("Description is required")),
        )
            .into_response();
    }

    let new_rule = NewRule {
        rule_set_id: body.rule_set_id,
        kind: body.kind.unwrap_or(RuleKind::Regex),
        patterns: body.patterns.unwrap_or_default(),
        description: body.description,
        tool: body.tool,
        action: body.action.unwrap_or(RuleAction::Block),
        llm_review: body.llm_review.unwrap_or(false),
        prompt: body.prompt,
        active: body.active.unwrap_or(true),
        priority: body.priority.unwrap_or(0),
        problem: body.problem,
        solution: body.solution,
        source_message_id: None,
    };

    let repo = RuleRepository::new(state.db.clone());

    match repo.create(new_rule).await {
        Ok(rule) => {
            enqueue_embedding_backfill(&state).await;
            (StatusCode::CREATED, Json(rule)).into_response()
        }
        Err(RuleError::Validation(e)) => (
            StatusCode::BAD_REQUEST,
            Json(ApiError::bad_request(e.to_string())),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to create rule: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal(format!("Failed to create rule: {}", e))),
            )
                .into_response()
        }
    }
}

/// Rules created through the API have no vector until the embeddings sync
/// job next runs, so nudge the queue rather than calling the embedding
/// service inline.
async fn enqueue_embedding_backfill(state: &AppState) {
    let queue = JobQueue::new(state.db.clone());
    if let Err(err) = queue
        .enqueue(JOB_TYPE_EMBEDDINGS_SYNC, json!({}), None, 0)
        .await
    {
        tracing::warn!("failed to enqueue embedding backfill: {err}");
    }
}

/// Helper module for deserializing fields that distinguish between null and absent.
/// `None` = field not present (keep existing value)
/// `Some(None)` = field explicitly set to null (clear the value)
/// `Some(Some(T))` = field explicitly set to a value
mod nullable {
    use serde::{Deserialize, Deserializer};

    /// Deserialize an optional nullable field.
    /// Returns `Some(None)` for explicit null, `Some(Some(value))` for a value,
    /// and uses serde's default (None) when the field is absent.
    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        // This will deserialize the outer Option - if field is present, we get Some
        // Then the inner Option handles null vs value
        Ok(Some(Option::deserialize(deserializer)?))
    }
}

/// Request body for updating a rule.
/// All fields are optional for partial updates.
///
/// For fields that can be cleared (set to null), we use `Option<Option<T>>`:
/// - Field absent: `None` - keep existing value
/// - Field set to null: `Some(None)` - clear the value
/// - Field set to a value: `Some(Some(value))` - update to new value
#[derive(Debug, Deserialize)]
pub struct UpdateRuleRequest {
    /// Can be cleared by sending null.
    #[serde(default, deserialize_with = "nullable::deserialize")]
    pub rule_set_id: Option<Option<String>>,
    pub kind: Option<RuleKind>,
    pub patterns: Option<Vec<String>>,
    pub description: Option<String>,
    /// Can be cleared by sending null.
    #[serde(default, deserialize_with = "nullable::deserialize")]
    pub tool: Option<Option<String>>,
    pub action: Option<RuleAction>,
    pub llm_review: Option<bool>,
    /// Can be cleared by sending null.
    #[serde(default, deserialize_with = "nullable::deserialize")]
    pub prompt: Option<Option<String>>,
    pub active: Option<bool>,
    pub priority: Option<i64>,
    /// Can be cleared by sending null.
    #[serde(default, deserialize_with = "nullable::deserialize")]
    pub problem: Option<Option<String>>,
    /// Can be cleared by sending null.
    #[serde(default, deserialize_with = "nullable::deserialize")]
    pub solution: Option<Option<String>>,
}

/// PATCH /api/rules/{id}
///
/// Update an existing rule with partial data. The source message link is
/// provenance and cannot be edited.
async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateRuleRequest>,
) -> impl IntoResponse {
    let repo = RuleRepository::new(state.db.clone());

    // First, fetch the existing rule
    let existing = match repo.get_by_id(&id).await {
        Ok(rule) => rule,
        Err(RuleError::NotFound(_)) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiError::not_found(format!("Rule not found: {}", id))),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("Failed to fetch rule {}: {}", id, e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal(format!("Failed to fetch rule: {}", e))),
            )
                .into_response();
        }
    };

    // Merge the update with existing values
    // For nullable fields (Option<Option<T>>):
    // - None = field absent, keep existing
    // - Some(None) = explicit null, clear the value
    // - Some(Some(v)) = new value provided
    let rule_set_id = match body.rule_set_id {
        None => existing.rule_set_id,
        Some(None) => None,
        Some(Some(v)) => Some(v),
    };

    let tool = match body.tool {
        None => existing.tool,
        Some(None) => None,
        Some(Some(v)) => Some(v),
    };

    let prompt = match body.prompt {
        None => existing.prompt,
        Some(None) => None,
        Some(Some(v)) => Some(v),
    };

    let problem = match body.problem {
        None => existing.problem,
        Some(None) => None,
        Some(Some(v)) => Some(v),
    };

    let solution = match body.solution {
        None => existing.solution,
        Some(None) => None,
        Some(Some(v)) => Some(v),
    };

    let updated_rule = NewRule {
        rule_set_id,
        kind: body.kind.unwrap_or(existing.kind),
        patterns: body.patterns.unwrap_or(existing.patterns),
        description: body.description.unwrap_or(existing.description),
        tool,
        action: body.action.unwrap_or(existing.action),
        llm_review: body.llm_review.unwrap_or(existing.llm_review),
        prompt,
        active: body.active.unwrap_or(existing.active),
        priority: body.priority.unwrap_or(existing.priority),
        problem,
        solution,
        source_message_id: existing.source_message_id,
    };

    match repo.update(&id, updated_rule).await {
        Ok(rule) => (StatusCode::OK, Json(rule)).into_response(),
        Err(RuleError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(format!("Rule not found: {}", id))),
        )
            .into_response(),
        Err(RuleError::Validation(e)) => (
            StatusCode::BAD_REQUEST,
            Json(ApiError::bad_request(e.to_string())),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to update rule {}: {}", id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal(format!("Failed to update rule: {}", e))),
            )
                .into_response()
        }
    }
}

/// POST /api/rules/{id}/activate
///
/// Reactivate a previously deactivated rule.
async fn activate_rule(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    set_rule_active(state, id, true).await
}

/// POST /api/rules/{id}/deactivate
///
/// Deactivate a rule so it no longer participates in evaluation.
async fn deactivate_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    set_rule_active(state, id, false).await
}

/// DELETE /api/rules/{id}
///
/// Deactivates the rule. The row is kept so historical triggers stay
/// resolvable, which makes this an alias for POST /{id}/deactivate.
async fn delete_rule(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    set_rule_active(state, id, false).await
}

async fn set_rule_active(state: AppState, id: String, active: bool) -> axum::response::Response {
    let repo = RuleRepository::new(state.db.clone());

    match repo.set_active(&id, active).await {
        Ok(rule) => (StatusCode::OK, Json(rule)).into_response(),
        Err(RuleError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(format!("Rule not found: {}", id))),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to set rule {} active={}: {}", id, active, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal(format!("Failed to update rule: {}", e))),
            )
                .into_response()
        }
    }
}

/// Provenance and usage trail for a rule.
#[derive(Debug, Serialize, Deserialize)]
struct RuleHistoryResponse {
    rule: Rule,
    /// Present for learned rules. Manual rules have no source message.
    source: Option<RuleSource>,
    triggers: Vec<RuleTrigger>,
    source_session_messages: Vec<Message>,
}

/// The conversation a learned rule was extracted from.
#[derive(Debug, Serialize, Deserialize)]
struct RuleSource {
    message: Message,
    session: Session,
    project: Project,
}

/// GET /api/rules/{id}/history
///
/// Where a rule came from and when it last fired: the source message and its
/// session for learned rules, plus the most recent triggers.
async fn get_rule_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let rules = RuleRepository::new(state.db.clone());

    let rule = match rules.get_by_id(&id).await {
        Ok(rule) => rule,
        Err(RuleError::NotFound(_)) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiError::not_found(format!("Rule not found: {}", id))),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("Failed to get rule {}: {}", id, e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal(format!("Failed to get rule: {}", e))),
            )
                .into_response();
        }
    };

    match load_history(&state, rule).await {
        Ok(history) => (StatusCode::OK, Json(history)).into_response(),
        Err(e) => {
            tracing::error!("Failed to load history for rule {}: {}", id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("Failed to load rule history")),
            )
                .into_response()
        }
    }
}

async fn load_history(
    state: &AppState,
    rule: Rule,
) -> Result<RuleHistoryResponse, Box<dyn std::error::Error + Send + Sync>> {
    let triggers = TriggerRepository::new(state.db.clone())
        .list_for_rule(&rule.id, 20)
        .await?;

    let mut source = None;
    let mut source_session_messages = Vec::new();
    if let Some(message_id) = rule.source_message_id.as_deref() {
        let messages = MessageRepository::new(state.db.clone());
        let message = messages.get_by_id(message_id).await?;
        let session = SessionRepository::new(state.db.clone())
            .get_by_id(&message.session_id)
            .await?;
        let project = ProjectRepository::new(state.db.clone())
            .get_by_id(&session.project_id)
            .await?;
        source_session_messages = messages.list_for_session(&session.id).await?;
        // The dashboard shows an excerpt, not the full transcript.
        source_session_messages.truncate(50);
        source = Some(RuleSource {
            message,
            session,
            project,
        });
    }

    Ok(RuleHistoryResponse {
        rule,
        source,
        triggers,
        source_session_messages,
    })
}
