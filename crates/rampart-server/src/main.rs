use std::{env, net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use rampart_core::jobs::{JOB_TYPE_EMBEDDINGS_SYNC, JobDispatcher};
use rampart_core::{
    Config, Database, EmbeddingClient, GenaiLLMClient, HttpEmbeddingClient, JobQueue, LLMClient,
    WorkerConfig, init_telemetry, migrations,
};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod api;

#[derive(Clone)]
struct AppState {
    db: Database,
    config: Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;

    let _guard = init_telemetry(&config.app, &config.telemetry)?;

    let db = Database::new(&config.paths.database).await?;
    migrations::run_migrations(&db).await?;

    let queue = JobQueue::new(db.clone());
    let shutdown = CancellationToken::new();
    let worker_shutdown = shutdown.child_token();
    let llm: Arc<dyn LLMClient> = Arc::new(GenaiLLMClient::new(&config.models.extractor));
    let embeddings: Arc<dyn EmbeddingClient> =
        Arc::new(HttpEmbeddingClient::from_config(&config.embedding));
    let dispatcher = JobDispatcher::new(
        db.clone(),
        llm,
        embeddings,
        config.models.extractor.clone(),
        config.learning.clone(),
    );
    let worker_handle = tokio::spawn(rampart_core::run_worker(
        queue.clone(),
        dispatcher,
        WorkerConfig::default(),
        worker_shutdown,
    ));

    // Rules created while the embedding service was unreachable carry no
    // vector, so sweep for stragglers on every boot.
    if let Err(err) = queue
        .enqueue(JOB_TYPE_EMBEDDINGS_SYNC, json!({}), None, 0)
        .await
    {
        warn!("failed to enqueue embedding backfill: {err}");
    }

    let port = config.app.port;
    let state = AppState {
        db: db.clone(),
        config,
    };
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Rampart listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    let _ = worker_handle.await;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api::router())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
    database: String,
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let db_status = match state.db.health_check().await {
        Ok(_) => "ok",
        Err(_) => "unhealthy",
    };

    let status = if db_status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if db_status == "ok" {
                "healthy".to_string()
            } else {
                "unhealthy".to_string()
            },
            service: state.config.app.service_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: db_status.to_string(),
        }),
    )
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("received ctrl+c, shutting down");
        }
        _ = terminate => {
            warn!("received terminate signal, shutting down");
        }
    }

    shutdown.cancel();
}

#[cfg(test)]
fn test_state(db: Database) -> AppState {
    AppState {
        db,
        config: test_config(),
    }
}

#[cfg(test)]
fn test_config() -> Config {
    use rampart_core::config::{
        AppConfig, EmbeddingConfig, EvaluationConfig, LearningConfig, ModelConfig, ModelsConfig,
        PathsConfig, TelemetryConfig,
    };

    let model = ModelConfig {
        provider: "test".to_string(),
        model: "test-model".to_string(),
        temperature: 0.0,
        max_output_tokens: 256,
    };
    Config {
        app: AppConfig {
            service_name: "rampart".to_string(),
            port: 0,
            env: "test".to_string(),
        },
        paths: PathsConfig {
            database: ":memory:".into(),
        },
        telemetry: TelemetryConfig {
            otlp_endpoint: None,
            export_traces: false,
        },
        models: ModelsConfig {
            reviewer: model.clone(),
            extractor: model,
        },
        embedding: EmbeddingConfig {
            endpoint: "http://127.0.0.1:9".to_string(),
            api_key: "test".to_string(),
            model: "test-embed".to_string(),
            dimensions: 8,
        },
        evaluation: EvaluationConfig {
            review_timeout_ms: 1_000,
            log_semantic_approvals: false,
        },
        learning: LearningConfig {
            dedup_threshold: 0.9,
            max_message_chars: 2_000,
        },
    }
}
