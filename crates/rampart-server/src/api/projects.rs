//! Project API endpoints.
//!
//! Provides:
//! - GET /api/projects - List projects
//! - POST /api/projects/{id}/rule-set - Bind or unbind a project's rule set
//!
//! Projects register themselves the first time the hook sees their working
//! directory, so there is no create endpoint.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use rampart_core::{ProjectError, ProjectRepository, RuleSetError, RuleSetRepository};

use crate::AppState;

/// Create the projects API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_projects))
        .route("/{id}/rule-set", post(bind_rule_set))
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

/// GET /api/projects
///
/// List all registered projects sorted by path.
async fn list_projects(State(state): State<AppState>) -> impl IntoResponse {
    let repo = ProjectRepository::new(state.db.clone());

    match repo.list_all().await {
        Ok(projects) => (StatusCode::OK, Json(projects)).into_response(),
        Err(e) => {
            tracing::error!("Failed to list projects: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("Failed to list projects")),
            )
                .into_response()
        }
    }
}

/// Request body for binding a rule set to a project.
#[derive(Debug, Deserialize)]
pub struct BindRuleSetRequest {
    /// Null or absent unbinds, leaving only global rules in effect.
    pub rule_set_id: Option<String>,
}

/// POST /api/projects/{id}/rule-set
///
/// Bind a rule set to a project, or unbind with a null `rule_set_id`.
async fn bind_rule_set(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<BindRuleSetRequest>,
) -> impl IntoResponse {
    if let Some(rule_set_id) = body.rule_set_id.as_deref() {
        let sets = RuleSetRepository::new(state.db.clone());
        match sets.get_by_id(rule_set_id).await {
            Ok(_) => {}
            Err(RuleSetError::NotFound(_)) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ApiError::bad_request(format!(
                        "Unknown rule set: {}",
                        rule_set_id
                    ))),
                )
                    .into_response();
            }
            Err(e) => {
                tracing::error!("Failed to look up rule set {}: {}", rule_set_id, e);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ApiError::internal(format!(
                        "Failed to look up rule set: {}",
                        e
                    ))),
                )
                    .into_response();
            }
        }
    }

    let repo = ProjectRepository::new(state.db.clone());

    match repo.bind_rule_set(&id, body.rule_set_id.as_deref()).await {
        Ok(project) => (StatusCode::OK, Json(project)).into_response(),
        Err(ProjectError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(format!("Project not found: {}", id))),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to bind rule set for project {}: {}", id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal(format!("Failed to bind rule set: {}", e))),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use rampart_core::history::NewProject;
    use rampart_core::{Database, NewRuleSet, Project, migrations::run_migrations};
    use tempfile::TempDir;

    async fn setup_db() -> (Database, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join("test.sqlite");
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");
        (db, dir)
    }

    async fn seed_project(db: &Database, path: &str, name: &str) -> Project {
        ProjectRepository::new(db.clone())
            .get_or_create(NewProject {
                path: path.to_string(),
                name: name.to_string(),
                rule_set_id: None,
            })
            .await
            .expect("project")
    }

    #[tokio::test]
    async fn list_projects_returns_empty_list() {
        let (db, _dir) = setup_db().await;
        let state = crate::test_state(db.clone());

        let response = list_projects(State(state)).await.into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let body_bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let body: Vec<Project> = serde_json::from_slice(&body_bytes).expect("json body");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn list_projects_sorted_by_path() {
        let (db, _dir) = setup_db().await;
        let state = crate::test_state(db.clone());

        seed_project(&db, "/home/dev/zeta", "zeta").await;
        seed_project(&db, "/home/dev/api", "api").await;

        let response = list_projects(State(state)).await.into_response();

        let body_bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let projects: Vec<Project> = serde_json::from_slice(&body_bytes).expect("json body");
        let paths: Vec<&str> = projects.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, vec!["/home/dev/api", "/home/dev/zeta"]);
    }

    #[tokio::test]
    async fn bind_and_unbind_rule_set() {
        let (db, _dir) = setup_db().await;
        let state = crate::test_state(db.clone());

        let project = seed_project(&db, "/home/dev/api", "api").await;
        let set = RuleSetRepository::new(db.clone())
            .create(NewRuleSet {
                name: "backend".to_string(),
                description: String::new(),
            })
            .await
            .expect("rule set");

        let response = bind_rule_set(
            State(state.clone()),
            Path(project.id.clone()),
            Json(BindRuleSetRequest {
                rule_set_id: Some(set.id.clone()),
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let body_bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let bound: Project = serde_json::from_slice(&body_bytes).expect("json body");
        assert_eq!(bound.rule_set_id.as_deref(), Some(set.id.as_str()));

        let response = bind_rule_set(
            State(state),
            Path(project.id.clone()),
            Json(BindRuleSetRequest { rule_set_id: None }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let body_bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let unbound: Project = serde_json::from_slice(&body_bytes).expect("json body");
        assert_eq!(unbound.rule_set_id, None);
    }

    #[tokio::test]
    async fn bind_unknown_rule_set_bad_request() {
        let (db, _dir) = setup_db().await;
        let state = crate::test_state(db.clone());

        let project = seed_project(&db, "/home/dev/api", "api").await;

        let response = bind_rule_set(
            State(state),
            Path(project.id.clone()),
            Json(BindRuleSetRequest {
                rule_set_id: Some("missing".to_string()),
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bind_rule_set_missing_project_not_found() {
        let (db, _dir) = setup_db().await;
        let state = crate::test_state(db.clone());

        let response = bind_rule_set(
            State(state),
            Path("missing".to_string()),
            Json(BindRuleSetRequest { rule_set_id: None }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
