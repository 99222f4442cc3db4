use schemars::JsonSchema;
use serde::Deserialize;
use thiserror::Error;

use crate::review::{JsonExtractError, extract_json_from_response};
use crate::rules::{NewRule, RuleAction, RuleKind, RuleValidationError};

use super::prompt::RenderedTranscript;

/// Envelope the oracle fills in. An empty `rules` array is a valid answer.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CandidateList {
    pub rules: Vec<RuleCandidate>,
}

/// One proposed guard rule extracted from a user correction.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RuleCandidate {
    /// Regular expressions searched against the serialized tool input.
    pub patterns: Vec<String>,
    /// One sentence stating what the rule guards against.
    pub description: String,
    /// What went wrong in the session, quoted or paraphrased.
    #[serde(default)]
    pub problem: Option<String>,
    /// What the user wanted instead.
    #[serde(default)]
    pub solution: Option<String>,
    /// Restrict the rule to one tool name, e.g. "Bash".
    #[serde(default)]
    pub tool: Option<String>,
    /// "block" or "warn".
    #[serde(default = "default_action")]
    pub action: String,
    /// Transcript entry number of the user's correction.
    #[serde(default)]
    pub message_number: Option<usize>,
}

fn default_action() -> String {
    "warn".to_string()
}

#[derive(Debug, Error)]
pub enum CandidateParseError {
    #[error(transparent)]
    Extract(#[from] JsonExtractError),
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn parse_candidates(response: &str) -> Result<Vec<RuleCandidate>, CandidateParseError> {
    let json_str = extract_json_from_response(response)?;
    let parsed: CandidateList = serde_json::from_str(json_str)?;
    Ok(parsed.rules)
}

#[derive(Debug, Error)]
pub enum CandidateError {
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error(transparent)]
    Validation(#[from] RuleValidationError),
}

impl RuleCandidate {
    /// Text the dedup embedding is computed over.
    pub fn semantic_content(&self) -> String {
        let mut parts = vec![self.description.clone()];
        if let Some(problem) = &self.problem {
            parts.push(problem.clone());
        }
        if let Some(solution) = &self.solution {
            parts.push(solution.clone());
        }
        parts.join("\n")
    }

    pub fn into_new_rule(
        self,
        transcript: &RenderedTranscript,
    ) -> Result<NewRule, CandidateError> {
        let action = RuleAction::from_str(&self.action)
            .ok_or_else(|| CandidateError::UnknownAction(self.action.clone()))?;
        let source_message_id = self
            .message_number
            .and_then(|number| transcript.message_id(number))
            .map(|id| id.to_string());

        let new_rule = NewRule {
            rule_set_id: None,
            kind: RuleKind::Regex,
            patterns: self.patterns,
            description: self.description,
            tool: self.tool,
            action,
            llm_review: false,
            prompt: None,
            active: true,
            priority: 0,
            problem: self.problem,
            solution: self.solution,
            source_message_id,
        };
        new_rule.validate()?;
        Ok(new_rule)
    }
}
