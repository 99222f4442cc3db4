use std::env;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use rampart_core::config::Config;
use rampart_core::db::Database;
use rampart_core::history::{NewProject, ProjectRepository, Session, SessionRepository};
use rampart_core::jobs::JOB_TYPE_LEARN_SESSION;
use rampart_core::llm::GenaiLLMClient;
use rampart_core::migrations::run_migrations;
use rampart_core::queue::{JobQueue, QueueError};
use rampart_core::review::SemanticReviewer;
use rampart_core::rules::{Decision, Evaluation, RuleAction, RuleEngine, ToolEvent, TriggeredRule};
use rampart_core::transcripts::{IngestStats, TranscriptIngestor};

type AnyError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_CONFIG_PATH: &str = "~/.config/rampart/config.toml";

#[derive(Debug, Default, Deserialize)]
struct PreToolUsePayload {
    cwd: Option<String>,
    tool_name: Option<String>,
    tool_input: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionEndPayload {
    transcript_path: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("pre-tool-use") => pre_tool_use().await,
        Some("session-end") => session_end().await,
        _ => {
            eprintln!("usage: rampart-hook <pre-tool-use|session-end>");
            ExitCode::from(2)
        }
    }
}

async fn pre_tool_use() -> ExitCode {
    let payload: PreToolUsePayload = read_payload();

    match evaluate(&payload).await {
        Ok(evaluation) => {
            for line in stderr_lines(&evaluation) {
                eprintln!("{line}");
            }
            ExitCode::from(decision_exit(evaluation.decision))
        }
        Err(err) => {
            // Fail closed: without a verdict the tool call must not proceed.
            eprintln!("BLOCKED: rule check failed: {err}");
            ExitCode::from(2)
        }
    }
}

async fn session_end() -> ExitCode {
    let payload: SessionEndPayload = read_payload();

    let Some(raw_path) = payload.transcript_path.as_deref() else {
        return ExitCode::SUCCESS;
    };
    let transcript_path = PathBuf::from(shellexpand::tilde(raw_path).into_owned());
    if !transcript_path.exists() {
        return ExitCode::SUCCESS;
    }

    match open_database().await {
        Ok(db) => {
            if let Err(err) = finish_session(&db, &transcript_path).await {
                // Learning is best-effort; never disturb the session over it.
                eprintln!("session-end: {err}");
            }
        }
        Err(err) => {
            eprintln!("session-end: {err}");
        }
    }
    ExitCode::SUCCESS
}

async fn evaluate(payload: &PreToolUsePayload) -> Result<Evaluation, AnyError> {
    let config = Config::load(config_path())?;
    let db = Database::new(&config.paths.database).await?;
    run_migrations(&db).await?;

    let rule_set_id = match payload.cwd.as_deref() {
        Some(cwd) => resolve_rule_set(&db, cwd).await?,
        None => None,
    };

    let llm = Arc::new(GenaiLLMClient::new(&config.models.reviewer));
    let reviewer = SemanticReviewer::new(llm, &config.models.reviewer, &config.evaluation);
    let engine = RuleEngine::new(db, reviewer, &config.evaluation);

    let event = ToolEvent {
        tool: payload
            .tool_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        input: payload
            .tool_input
            .clone()
            .unwrap_or_else(|| serde_json::json!({})),
        tool_call_id: None,
    };

    Ok(engine.evaluate(&event, rule_set_id.as_deref()).await?)
}

/// First sight of a working directory registers it as a project with no
/// rule set bound; only global rules apply until the user binds one.
async fn resolve_rule_set(db: &Database, cwd: &str) -> Result<Option<String>, AnyError> {
    let projects = ProjectRepository::new(db.clone());
    let project = projects
        .get_or_create(NewProject {
            path: cwd.to_string(),
            name: project_name(cwd),
            rule_set_id: None,
        })
        .await?;
    Ok(project.rule_set_id)
}

async fn finish_session(
    db: &Database,
    transcript_path: &Path,
) -> Result<(Session, IngestStats), AnyError> {
    let ingestor = TranscriptIngestor::new(db.clone());
    let (session, stats) = ingestor.ingest_file(transcript_path).await?;

    let sessions = SessionRepository::new(db.clone());
    sessions.complete(&session.id).await?;

    let queue = JobQueue::new(db.clone());
    let enqueued = queue
        .enqueue(
            JOB_TYPE_LEARN_SESSION,
            serde_json::json!({ "session_id": session.id.clone() }),
            Some(session.id.clone()),
            0,
        )
        .await;
    match enqueued {
        // A rerun of the hook for the same session already queued the job.
        Ok(_) | Err(QueueError::DuplicateIdempotency { .. }) => {}
        Err(err) => return Err(err.into()),
    }

    Ok((session, stats))
}

async fn open_database() -> Result<Database, AnyError> {
    let config = Config::load(config_path())?;
    let db = Database::new(&config.paths.database).await?;
    run_migrations(&db).await?;
    Ok(db)
}

fn config_path() -> PathBuf {
    let raw = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    PathBuf::from(shellexpand::tilde(&raw).into_owned())
}

/// The host sends hook payloads on stdin. Malformed or empty input falls
/// back to an empty payload rather than failing the session.
fn read_payload<T: Default + DeserializeOwned>() -> T {
    let mut raw = String::new();
    if io::stdin().read_to_string(&mut raw).is_err() {
        return T::default();
    }
    parse_payload(&raw)
}

fn parse_payload<T: Default + DeserializeOwned>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_default()
}

fn project_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn decision_exit(decision: Decision) -> u8 {
    match decision {
        Decision::Block => 2,
        Decision::Warn | Decision::Allow => 0,
    }
}

/// Stderr is the channel the host relays back to the assistant, so blocks
/// come first and log-only rules stay silent.
fn stderr_lines(evaluation: &Evaluation) -> Vec<String> {
    let mut lines = Vec::new();
    for triggered in &evaluation.triggered {
        if triggered.action == RuleAction::Block {
            lines.push(format!("BLOCKED: {}", describe(triggered)));
        }
    }
    for triggered in &evaluation.triggered {
        if triggered.action == RuleAction::Warn {
            lines.push(format!("SUGGESTION: {}", describe(triggered)));
        }
    }
    lines
}

fn describe(triggered: &TriggeredRule) -> String {
    let mut text = triggered.rule.description.clone();
    if let Some(solution) = triggered.rule.solution.as_deref() {
        text.push_str(" -> ");
        text.push_str(solution);
    }
    if let Some(reasoning) = triggered.reasoning.as_deref() {
        text.push_str(" (");
        text.push_str(reasoning);
        text.push(')');
    }
    text
}
