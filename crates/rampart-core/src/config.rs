use serde::Deserialize;
use std::{env, path::Path, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub telemetry: TelemetryConfig,
    pub models: ModelsConfig,
    pub embedding: EmbeddingConfig,
    pub evaluation: EvaluationConfig,
    pub learning: LearningConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub port: u16,
    pub env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    pub database: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub export_traces: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModelsConfig {
    pub reviewer: ModelConfig,
    pub extractor: ModelConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EmbeddingConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub dimensions: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EvaluationConfig {
    pub review_timeout_ms: u64,
    #[serde(default)]
    pub log_semantic_approvals: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LearningConfig {
    pub dedup_threshold: f32,
    pub max_message_chars: usize,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid RAMPART_PORT override: {0}")]
    InvalidPort(std::num::ParseIntError),
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides()?;
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = env::var("RAMPART_PORT") {
            let port: u16 = port.parse().map_err(ConfigError::InvalidPort)?;
            self.app.port = port;
        }

        if let Ok(db) = env::var("RAMPART_DB") {
            self.paths.database = PathBuf::from(db);
        }

        if let Ok(otlp) = env::var("OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(otlp);
        }

        if let Ok(model) = env::var("REVIEWER_MODEL") {
            self.models.reviewer.model = model;
        }

        if let Ok(model) = env::var("EXTRACTOR_MODEL") {
            self.models.extractor.model = model;
        }

        Ok(())
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker(&mut self.models.reviewer.provider)?;
        apply_env_marker(&mut self.models.reviewer.model)?;
        apply_env_marker(&mut self.models.extractor.provider)?;
        apply_env_marker(&mut self.models.extractor.model)?;
        apply_env_marker(&mut self.embedding.endpoint)?;
        apply_env_marker(&mut self.embedding.api_key)?;
        apply_env_marker(&mut self.embedding.model)?;
        apply_env_marker_path(&mut self.paths.database)?;
        if let Some(endpoint) = &mut self.telemetry.otlp_endpoint {
            apply_env_marker(endpoint)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        let database_string = self.paths.database.to_string_lossy().to_string();
        let database = shellexpand::tilde(&database_string);
        self.paths.database = PathBuf::from(database.as_ref());
    }
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::{fs, sync::Mutex};
    use tempfile::TempDir;

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    fn write_config(contents: &str) -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("write config");
        (dir, path)
    }

    fn with_env(vars: &[(&str, Option<&str>)], f: impl FnOnce()) {
        let _guard = ENV_LOCK.lock().expect("lock env");
        let saved: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(k, _)| (k.to_string(), env::var(k).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        f();

        for (key, value) in saved {
            match value {
                Some(v) => unsafe { env::set_var(&key, v) },
                None => unsafe { env::remove_var(&key) },
            }
        }
    }

    fn full_config_body(database_path: &str, api_key: &str) -> String {
        format!(
            r#"
[app]
service_name = "rampart"
port = 17600
env = "dev"

[paths]
database = "{database_path}"

[telemetry]
otlp_endpoint = "http://localhost:4318"
export_traces = true

[models.reviewer]
provider = "anthropic"
model = "claude-sonnet-4-5"
temperature = 0.0
max_output_tokens = 1024

[models.extractor]
provider = "anthropic"
model = "claude-sonnet-4-5"
temperature = 0.2
max_output_tokens = 4096

[embedding]
endpoint = "https://api.openai.com/v1/embeddings"
api_key = "{api_key}"
model = "text-embedding-3-small"
dimensions = 384

[evaluation]
review_timeout_ms = 4000
log_semantic_approvals = false

[learning]
dedup_threshold = 0.85
max_message_chars = 1000
"#
        )
    }

    #[test]
    fn load_config_expands_tilde_and_resolves_env_markers() {
        let (dir, path) =
            write_config(&full_config_body("env:DB_PATH", "env:EMBEDDING_API_KEY"));
        let home_dir = dir.path().join("home");
        fs::create_dir_all(&home_dir).expect("create home dir");

        let expected_db = home_dir.join("db/rampart.db");
        with_env(
            &[
                ("RAMPART_PORT", None),
                ("RAMPART_DB", None),
                ("OTLP_ENDPOINT", None),
                ("REVIEWER_MODEL", None),
                ("EXTRACTOR_MODEL", None),
                ("HOME", Some(home_dir.to_str().unwrap())),
                ("DB_PATH", Some("~/db/rampart.db")),
                ("EMBEDDING_API_KEY", Some("secret-key")),
            ],
            || {
                let cfg = Config::load(&path).expect("config loads");
                assert_eq!(cfg.app.service_name, "rampart");
                assert_eq!(cfg.app.port, 17600);
                assert_eq!(cfg.paths.database, expected_db);
                assert_eq!(
                    cfg.telemetry.otlp_endpoint.as_deref(),
                    Some("http://localhost:4318")
                );
                assert_eq!(cfg.embedding.api_key, "secret-key");
                assert_eq!(cfg.embedding.dimensions, 384);
                assert_eq!(cfg.evaluation.review_timeout_ms, 4000);
                assert!((cfg.learning.dedup_threshold - 0.85).abs() < f32::EPSILON);
            },
        );
    }

    #[test]
    fn env_overrides_take_precedence() {
        let (_dir, path) = write_config(&full_config_body("/tmp/db.sqlite", "file-key"));

        with_env(
            &[
                ("RAMPART_PORT", Some("19000")),
                ("RAMPART_DB", Some("/tmp/override.sqlite")),
                ("OTLP_ENDPOINT", Some("http://override.local:4318")),
                ("REVIEWER_MODEL", Some("env-reviewer")),
                ("EXTRACTOR_MODEL", Some("env-extractor")),
            ],
            || {
                let cfg = Config::load(&path).expect("config loads");
                assert_eq!(cfg.app.port, 19000);
                assert_eq!(cfg.paths.database, PathBuf::from("/tmp/override.sqlite"));
                assert_eq!(
                    cfg.telemetry.otlp_endpoint.as_deref(),
                    Some("http://override.local:4318")
                );
                assert_eq!(cfg.models.reviewer.model, "env-reviewer");
                assert_eq!(cfg.models.extractor.model, "env-extractor");
            },
        );
    }

    #[test]
    fn env_marker_without_variable_errors() {
        let (_dir, path) = write_config(&full_config_body("/tmp/db.sqlite", "env:NEEDS_KEY"));

        with_env(
            &[
                ("RAMPART_PORT", None),
                ("RAMPART_DB", None),
                ("OTLP_ENDPOINT", None),
                ("REVIEWER_MODEL", None),
                ("EXTRACTOR_MODEL", None),
                ("NEEDS_KEY", None),
            ],
            || {
                let err = Config::load(&path).expect_err("missing env var should error");
                match err {
                    ConfigError::MissingEnvVar(name) => assert_eq!(name, "NEEDS_KEY"),
                    other => panic!("unexpected error: {other}"),
                }
            },
        );
    }

    #[test]
    fn invalid_port_override_is_reported() {
        let (_dir, path) = write_config(&full_config_body("/tmp/db.sqlite", "file-key"));

        with_env(&[("RAMPART_PORT", Some("not-a-number"))], || {
            let err = Config::load(&path).expect_err("invalid port should error");
            assert!(matches!(err, ConfigError::InvalidPort(_)));
        });
    }

    #[test]
    fn log_semantic_approvals_defaults_to_false() {
        let body = full_config_body("/tmp/db.sqlite", "file-key")
            .replace("log_semantic_approvals = false\n", "");
        let (_dir, path) = write_config(&body);

        with_env(
            &[
                ("RAMPART_PORT", None),
                ("RAMPART_DB", None),
                ("OTLP_ENDPOINT", None),
                ("REVIEWER_MODEL", None),
                ("EXTRACTOR_MODEL", None),
            ],
            || {
                let cfg = Config::load(&path).expect("config loads");
                assert!(!cfg.evaluation.log_semantic_approvals);
            },
        );
    }
}
