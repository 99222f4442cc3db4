//! Rule set API endpoints.
//!
//! Provides:
//! - GET /api/rule-sets - List rule sets
//! - POST /api/rule-sets - Create a rule set
//! - POST /api/rule-sets/install/{pack} - Install a built-in starter pack

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use rampart_core::{
    NewRuleSet, PackError, PackInstaller, RuleSetError, RuleSetRepository, pack_names,
};

use crate::AppState;

/// Create the rule sets API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_rule_sets))
        .route("/", post(create_rule_set))
        .route("/install/{pack}", post(install_pack))
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

/// GET /api/rule-sets
///
/// List all rule sets sorted by name.
async fn list_rule_sets(State(state): State<AppState>) -> impl IntoResponse {
    let repo = RuleSetRepository::new(state.db.clone());

    match repo.list_all().await {
        Ok(sets) => (StatusCode::OK, Json(sets)).into_response(),
        Err(e) => {
            tracing::error!("Failed to list rule sets: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal("Failed to list rule sets")),
            )
                .into_response()
        }
    }
}

/// Request body for creating a rule set.
#[derive(Debug, Deserialize)]
pub struct CreateRuleSetRequest {
    pub name: String,
    pub description: Option<String>,
}

/// POST /api/rule-sets
///
/// Create a new, empty rule set. Names are unique.
async fn create_rule_set(
    State(state): State<AppState>,
    Json(body): Json<CreateRuleSetRequest>,
) -> impl IntoResponse {
    if body.name.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiError::bad_request("Name is required")),
        )
            .into_response();
    }

    let new_set = NewRuleSet {
        name: body.name,
        description: body.description.unwrap_or_default(),
    };

    let repo = RuleSetRepository::new(state.db.clone());

    match repo.create(new_set).await {
        Ok(set) => (StatusCode::CREATED, Json(set)).into_response(),
        Err(RuleSetError::NameTaken(name)) => (
            StatusCode::BAD_REQUEST,
            Json(ApiError::bad_request(format!(
                "Rule set name already exists: {}",
                name
            ))),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to create rule set: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal(format!(
                    "Failed to create rule set: {}",
                    e
                ))),
            )
                .into_response()
        }
    }
}

/// POST /api/rule-sets/install/{pack}
///
/// Install one of the built-in starter packs. Reinstalling an already
/// installed pack is a no-op so user edits to its rules survive.
async fn install_pack(State(state): State<AppState>, Path(pack): Path<String>) -> impl IntoResponse {
    let installer = PackInstaller::new(state.db.clone());

    match installer.install(&pack).await {
        Ok(installation) => {
            let status = if installation.already_installed {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, Json(installation)).into_response()
        }
        Err(PackError::UnknownPack(name)) => (
            StatusCode::NOT_FOUND,
            Json(ApiError::not_found(format!(
                "Unknown rule pack: {} (available: {})",
                name,
                pack_names().join(", ")
            ))),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to install pack {}: {}", pack, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal(format!("Failed to install pack: {}", e))),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use rampart_core::{Database, PackInstallation, RuleRepository, RuleSet, migrations::run_migrations};
    use tempfile::TempDir;

    async fn setup_db() -> (Database, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join("test.sqlite");
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");
        (db, dir)
    }

    #[tokio::test]
    async fn create_rule_set_success() {
        let (db, _dir) = setup_db().await;
        let state = crate::test_state(db.clone());

        let request = CreateRuleSetRequest {
            name: "backend".to_string(),
            description: Some("Rules for the backend repos".to_string()),
        };

        let response = create_rule_set(State(state), Json(request))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body_bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let set: RuleSet = serde_json::from_slice(&body_bytes).expect("json body");
        assert_eq!(set.name, "backend");
        assert_eq!(set.description, "Rules for the backend repos");
    }

    #[tokio::test]
    async fn create_rule_set_requires_name() {
        let (db, _dir) = setup_db().await;
        let state = crate::test_state(db.clone());

        let request = CreateRuleSetRequest {
            name: "   ".to_string(),
            description: None,
        };

        let response = create_rule_set(State(state), Json(request))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_rule_set_rejects_duplicate_name() {
        let (db, _dir) = setup_db().await;
        let state = crate::test_state(db.clone());

        let request = CreateRuleSetRequest {
            name: "backend".to_string(),
            description: None,
        };
        let response = create_rule_set(State(state.clone()), Json(request))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);

        let request = CreateRuleSetRequest {
            name: "backend".to_string(),
            description: Some("again".to_string()),
        };
        let response = create_rule_set(State(state), Json(request))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_rule_sets_sorted_by_name() {
        let (db, _dir) = setup_db().await;
        let state = crate::test_state(db.clone());

        for name in ["zeta", "alpha"] {
            let request = CreateRuleSetRequest {
                name: name.to_string(),
                description: None,
            };
            let response = create_rule_set(State(state.clone()), Json(request))
                .await
                .into_response();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = list_rule_sets(State(state)).await.into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let body_bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let sets: Vec<RuleSet> = serde_json::from_slice(&body_bytes).expect("json body");
        let names: Vec<&str> = sets.iter().map(|set| set.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn install_pack_creates_rule_set_and_rules() {
        let (db, _dir) = setup_db().await;
        let state = crate::test_state(db.clone());

        let response = install_pack(State(state), Path("git-safety".to_string()))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        let body_bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let installation: PackInstallation = serde_json::from_slice(&body_bytes).expect("json body");
        assert_eq!(installation.rule_set.name, "git-safety");
        assert_eq!(installation.rules_created, 2);
        assert!(!installation.already_installed);

        let rules = RuleRepository::new(db)
            .list_all(false)
            .await
            .expect("list rules");
        assert_eq!(rules.len(), 2);
        assert!(
            rules
                .iter()
                .all(|rule| rule.rule_set_id.as_deref() == Some(installation.rule_set.id.as_str()))
        );
    }

    #[tokio::test]
    async fn install_pack_twice_keeps_existing_rules() {
        let (db, _dir) = setup_db().await;
        let state = crate::test_state(db.clone());

        let response = install_pack(State(state.clone()), Path("secrets".to_string()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = install_pack(State(state), Path("secrets".to_string()))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let body_bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body bytes");
        let installation: PackInstallation = serde_json::from_slice(&body_bytes).expect("json body");
        assert!(installation.already_installed);
        assert_eq!(installation.rules_created, 0);
    }

    #[tokio::test]
    async fn install_unknown_pack_not_found() {
        let (db, _dir) = setup_db().await;
        let state = crate::test_state(db.clone());

        let response = install_pack(State(state), Path("node-safety".to_string()))
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
