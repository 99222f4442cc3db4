use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Regex,
    Semantic,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Regex => "regex",
            RuleKind::Semantic => "semantic",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "regex" => Some(Self::Regex),
            "semantic" => Some(Self::Semantic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Block,
    Warn,
    Log,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Block => "block",
            RuleAction::Warn => "warn",
            RuleAction::Log => "log",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "block" => Some(Self::Block),
            "warn" => Some(Self::Warn),
            "log" => Some(Self::Log),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRuleSet {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub rule_set_id: Option<String>,
    pub kind: RuleKind,
    pub patterns: Vec<String>,
    pub description: String,
    pub tool: Option<String>,
    pub action: RuleAction,
    pub llm_review: bool,
    pub prompt: Option<String>,
    pub active: bool,
    pub priority: i64,
    pub problem: Option<String>,
    pub solution: Option<String>,
    pub source_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    /// Whether a match on this rule is escalated to the semantic reviewer
    /// instead of applying its action directly.
    pub fn needs_review(&self) -> bool {
        self.llm_review || self.kind == RuleKind::Semantic
    }

    /// Text that stands in for the rule when embedding it, built from the
    /// human-facing fields rather than the regex patterns.
    pub fn semantic_content(&self) -> String {
        let mut parts = vec![self.description.as_str()];
        if let Some(problem) = self.problem.as_deref() {
            parts.push(problem);
        }
        if let Some(solution) = self.solution.as_deref() {
            parts.push(solution);
        }
        parts.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub rule_set_id: Option<String>,
    pub kind: RuleKind,
    pub patterns: Vec<String>,
    pub description: String,
    pub tool: Option<String>,
    pub action: RuleAction,
    pub llm_review: bool,
    pub prompt: Option<String>,
    pub active: bool,
    pub priority: i64,
    pub problem: Option<String>,
    pub solution: Option<String>,
    pub source_message_id: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleValidationError {
    #[error("a rule under llm review requires a non-empty prompt")]
    MissingPrompt,
    #[error("a rule requires at least one pattern")]
    EmptyPatterns,
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

impl NewRule {
    /// Creation-time invariants. A rule that escalates to semantic review is
    /// unusable without its reviewer prompt, so it is rejected here rather
    /// than surfacing as a broken rule during evaluation.
    pub fn validate(&self) -> Result<(), RuleValidationError> {
        if self.patterns.is_empty() {
            return Err(RuleValidationError::EmptyPatterns);
        }
        for pattern in &self.patterns {
            if let Err(err) = Regex::new(pattern) {
                return Err(RuleValidationError::InvalidPattern {
                    pattern: pattern.clone(),
                    reason: err.to_string(),
                });
            }
        }
        let needs_prompt = self.llm_review || self.kind == RuleKind::Semantic;
        let has_prompt = self
            .prompt
            .as_deref()
            .is_some_and(|prompt| !prompt.trim().is_empty());
        if needs_prompt && !has_prompt {
            return Err(RuleValidationError::MissingPrompt);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEmbedding {
    pub rule_id: String,
    pub embedding: Vec<f32>,
    pub model: String,
    pub dimensions: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRuleEmbedding {
    pub embedding: Vec<f32>,
    pub model: String,
}
