//! HTTP API handlers for the Rampart dashboard.
//!
//! This module provides REST API endpoints for:
//! - Rules CRUD, activation, and provenance history
//! - Rule sets and starter pack installation
//! - Projects and their rule set bindings
//! - Ingested sessions with their transcripts
//! - Aggregate statistics

pub mod projects;
pub mod rule_sets;
pub mod rules;
pub mod sessions;
pub mod stats;

use axum::Router;

use crate::AppState;

/// Create the main API router with all endpoints mounted.
pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/rules", rules::router())
        .nest("/rule-sets", rule_sets::router())
        .nest("/projects", projects::router())
        .nest("/sessions", sessions::router())
        .nest("/stats", stats::router())
}
