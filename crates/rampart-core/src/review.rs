use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::config::{EvaluationConfig, ModelConfig};
use crate::llm::{ChatMessage, ChatRole, CompletionRequest, LLMClient, LLMError};
use crate::rules::Rule;

const REVIEWER_SYSTEM_PROMPT: &str = "You are a safety reviewer for an AI coding assistant. \
A guard rule flagged a pending tool invocation and escalated it to you for judgment. \
Decide whether the invocation violates the intent of the rule. \
Respond with a single JSON object: \
{\"verdict\": \"approve\" | \"reject\", \"reasoning\": \"one or two sentences\"}. \
\"approve\" means the invocation is acceptable, \"reject\" means it violates the rule.";

/// Outcome of one semantic review.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub approved: bool,
    pub reasoning: String,
}

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("review timed out after {0}ms")]
    Timeout(u64),
    #[error("llm error: {0}")]
    Llm(#[from] LLMError),
    #[error("verdict parse error: {0}")]
    Parse(#[from] VerdictParseError),
}

#[derive(Debug, Error)]
pub enum VerdictParseError {
    #[error(transparent)]
    Extract(#[from] JsonExtractError),
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("verdict must be \"approve\" or \"reject\", got {0:?}")]
    InvalidVerdict(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JsonExtractError {
    #[error("no JSON object found in response")]
    NoJsonFound,
    #[error("malformed JSON block in response")]
    MalformedJson,
}

#[derive(Debug, Deserialize)]
struct VerdictOutput {
    verdict: String,
    #[serde(default)]
    reasoning: Option<String>,
}

impl Verdict {
    pub fn parse(response: &str) -> Result<Self, VerdictParseError> {
        let json_str = extract_json_from_response(response)?;
        let parsed: VerdictOutput = serde_json::from_str(json_str)?;

        let approved = match parsed.verdict.as_str() {
            "approve" => true,
            "reject" => false,
            other => return Err(VerdictParseError::InvalidVerdict(other.to_string())),
        };

        Ok(Verdict {
            approved,
            reasoning: parsed.reasoning.unwrap_or_default(),
        })
    }
}

/// Asks the configured model whether a flagged tool invocation actually
/// violates the rule that matched it. The caller owns the deadline policy:
/// a timeout or error here is reported as-is and the evaluation pipeline
/// decides what that means for the rule's action.
pub struct SemanticReviewer {
    llm: Arc<dyn LLMClient>,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl SemanticReviewer {
    pub fn new(
        llm: Arc<dyn LLMClient>,
        model: &ModelConfig,
        evaluation: &EvaluationConfig,
    ) -> Self {
        Self {
            llm,
            temperature: model.temperature,
            max_tokens: model.max_output_tokens,
            timeout: Duration::from_millis(evaluation.review_timeout_ms),
        }
    }

    pub async fn review(
        &self,
        rule: &Rule,
        tool: &str,
        input: &str,
    ) -> Result<Verdict, ReviewError> {
        let request = CompletionRequest {
            messages: build_review_messages(rule, tool, input),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            json_mode: true,
        };

        let response = tokio::time::timeout(self.timeout, self.llm.complete(request))
            .await
            .map_err(|_| ReviewError::Timeout(self.timeout.as_millis() as u64))??;

        Ok(Verdict::parse(&response.content)?)
    }
}

fn build_review_messages(rule: &Rule, tool: &str, input: &str) -> Vec<ChatMessage> {
    let instructions = rule.prompt.as_deref().unwrap_or(&rule.description);
    let user = format!(
        "## Rule\n{description}\n\n## Review instructions\n{instructions}\n\n\
         ## Pending tool invocation\nTool: {tool}\nInput:\n{input}",
        description = rule.description,
    );

    vec![
        ChatMessage {
            role: ChatRole::System,
            content: REVIEWER_SYSTEM_PROMPT.to_string(),
        },
        ChatMessage {
            role: ChatRole::User,
            content: user,
        },
    ]
}

/// Extracts the JSON slice from an LLM response that may contain extra text
/// or code fences.
pub fn extract_json_from_response(response: &str) -> Result<&str, JsonExtractError> {
    if let Some(slice) = json_in_code_fence(response) {
        return Ok(slice);
    }

    let Some(start_idx) = response.find('{') else {
        return Err(JsonExtractError::NoJsonFound);
    };

    match balanced_brace_slice(response, start_idx) {
        Some((start, end)) => Ok(&response[start..end]),
        None => Err(JsonExtractError::MalformedJson),
    }
}

fn json_in_code_fence(response: &str) -> Option<&str> {
    let fence_start = response.find("```")?;
    let content_start = fence_start + 3;
    let rest = &response[content_start..];
    let fence_end_rel = rest.find("```")?;
    let mut content = &response[content_start..content_start + fence_end_rel];
    if let Some(stripped) = content.strip_prefix("json") {
        content = stripped.trim_start();
    }
    Some(content)
}

fn balanced_brace_slice(text: &str, start_idx: usize) -> Option<(usize, usize)> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    let mut end_idx = None;

    for (idx, ch) in text.char_indices().skip_while(|(i, _)| *i < start_idx) {
        if in_string {
            if escape {
                escape = false;
                continue;
            }
            match ch {
                '\\' => escape = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                if depth == 0 {
                    end_idx = Some(idx + ch.len_utf8());
                    break;
                }
            }
            _ => {}
        }
    }

    end_idx.map(|end| (start_idx, end))
}
