//! Session API endpoints.
//!
//! Provides:
//! - GET /api/sessions - Recent sessions with message and rules-created counts
//! - GET /api/sessions/{id} - A session with its messages and tool calls

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};

use rampart_core::{
    Message, MessageRepository, Project, ProjectRepository, Session, SessionError,
    SessionRepository, ToolCall, ToolCallRepository,
};

use crate::AppState;

/// How many sessions the dashboard list shows.
const RECENT_SESSIONS_LIMIT: i64 = 50;

/// Create the sessions API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_sessions))
        .route("/{id}", get(get_session))
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

    fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}

/// GET /api/sessions
///
/// List the most recently started sessions with their aggregate counts.
async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let repo = SessionRepository::new(state.db.clone());

    match repo.list_recent(RECENT_SESSIONS_LIMIT).await {
        Ok(summaries) => (StatusCode::OK, Json(summaries)).into_response(),
        Err(e) => {
            tracing::error!("Failed to list sessions: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("Failed to list sessions")),
            )
                .into_response()
        }
    }
}

/// A session with everything the transcript viewer needs.
#[derive(Debug, Serialize, Deserialize)]
struct SessionDetailResponse {
    session: Session,
    project: Project,
    messages: Vec<Message>,
    tool_calls: Vec<ToolCall>,
}

/// GET /api/sessions/{id}
///
/// Get a single session with its project, messages, and tool calls.
async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let repo = SessionRepository::new(state.db.clone());

    let session = match repo.get_by_id(&id).await {
        Ok(session) => session,
        Err(SessionError::NotFound(_)) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiError::not_found(format!("Session not found: {}", id))),
            )
                .into_response();
        }
        Err(e) => {
            tracing::error!("Failed to get session {}: {}", id, e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal(format!("Failed to get session: {}", e))),
            )
                .into_response();
        }
    };

    match load_detail(&state, session).await {
        Ok(detail) => (StatusCode::OK, Json(detail)).into_response(),
        Err(e) => {
            tracing::error!("Failed to load session {}: {}", id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("Failed to load session")),
            )
                .into_response()
        }
    }
}

async fn load_detail(
    state: &AppState,
    session: Session,
) -> Result<SessionDetailResponse, Box<dyn std::error::Error + Send + Sync>> {
    let project = ProjectRepository::new(state.db.clone())
        .get_by_id(&session.project_id)
        .await?;
    let messages = MessageRepository::new(state.db.clone())
        .list_for_session(&session.id)
        .await?;
    let tool_calls = ToolCallRepository::new(state.db.clone())
        .list_for_session(&session.id)
        .await?;

    Ok(SessionDetailResponse {
        session,
        project,
        messages,
        tool_calls,
    })
}
