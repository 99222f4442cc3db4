pub mod config;
pub mod db;
pub mod embedding;
pub mod history;
pub mod jobs;
pub mod learning;
pub mod llm;
pub mod migrations;
pub mod packs;
pub mod queue;
pub mod review;
pub mod rules;
pub mod telemetry;
pub mod transcripts;
pub mod worker;

pub use config::Config;
pub use db::Database;
pub use embedding::{EmbeddingClient, HttpEmbeddingClient};
pub use history::{
    Message, MessageRepository, Project, ProjectError, ProjectRepository, RuleTrigger, Session,
    SessionError, SessionRepository, SessionStatus, SessionSummary, ToolCall, ToolCallRepository,
    TriggerRepository,
};
pub use jobs::JobDispatcher;
pub use llm::{GenaiLLMClient, LLMClient};
pub use packs::{PackError, PackInstallation, PackInstaller, pack_names};
pub use queue::{Job, JobContext, JobQueue, JobState};
pub use review::SemanticReviewer;
pub use rules::{
    Decision, Evaluation, NewRule, NewRuleSet, Rule, RuleAction, RuleEngine, RuleError, RuleKind,
    RuleRepository, RuleSet, RuleSetError, RuleSetRepository, ToolEvent,
};
pub use telemetry::{TelemetryError, TelemetryGuard, init_logging, init_telemetry};
pub use transcripts::TranscriptIngestor;
pub use worker::{JobError, JobExecutor, WorkerConfig, run_worker};
