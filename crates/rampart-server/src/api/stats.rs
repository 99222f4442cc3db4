//! Statistics API endpoint.
//!
//! Provides:
//! - GET /api/stats - Aggregate totals for the dashboard header

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::{Deserialize, Serialize};

use rampart_core::{
    MessageRepository, RuleRepository, SessionRepository, ToolCallRepository, TriggerRepository,
};

use crate::AppState;

/// Create the stats API router.
pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_stats))
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

    fn internal(message: impl Into<String>) -> Self {
        Self::new("internal_error", message)
    }
}

/// Aggregate totals shown at the top of the dashboard.
#[derive(Debug, Serialize, Deserialize)]
struct StatsResponse {
    rules: i64,
    active_rules: i64,
    learned_rules: i64,
    sessions: i64,
    messages: i64,
    tool_calls: i64,
    triggers: i64,
}

/// GET /api/stats
///
/// Aggregate counts across rules, sessions, and triggers.
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    match collect_stats(&state).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => {
            tracing::error!("Failed to collect stats: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("Failed to collect stats")),
            )
                .into_response()
        }
    }
}

async fn collect_stats(
    state: &AppState,
) -> Result<StatsResponse, Box<dyn std::error::Error + Send + Sync>> {
    let rule_counts = RuleRepository::new(state.db.clone()).counts().await?;
    let sessions = SessionRepository::new(state.db.clone()).count().await?;
    let messages = MessageRepository::new(state.db.clone()).count().await?;
    let tool_calls = ToolCallRepository::new(state.db.clone()).count().await?;
    let triggers = TriggerRepository::new(state.db.clone()).count().await?;

    Ok(StatsResponse {
        rules: rule_counts.total,
        active_rules: rule_counts.active,
        learned_rules: rule_counts.learned,
        sessions,
        messages,
        tool_calls,
        triggers,
    })
}
