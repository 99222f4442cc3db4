use thiserror::Error;
use tracing::{debug, warn};

use crate::config::EvaluationConfig;
use crate::db::Database;
use crate::history::{NewRuleTrigger, TriggerError, TriggerRepository};
use crate::review::SemanticReviewer;

use super::matching::{canonical_input, compile_rules};
use super::repositories::{RuleError, RuleRepository};
use super::types::{Rule, RuleAction};

/// What the hook should do with a pending tool invocation. Variant order is
/// severity order, so `max` picks the worst outcome across matched rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Decision {
    Allow,
    Warn,
    Block,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Warn => "warn",
            Decision::Block => "block",
        }
    }

    fn from_action(action: RuleAction) -> Self {
        match action {
            RuleAction::Block => Decision::Block,
            RuleAction::Warn => Decision::Warn,
            RuleAction::Log => Decision::Allow,
        }
    }
}

/// A pending tool invocation as reported by the assistant hook.
#[derive(Debug, Clone)]
pub struct ToolEvent {
    pub tool: String,
    pub input: serde_json::Value,
    pub tool_call_id: Option<String>,
}

/// One rule that fired during an evaluation, with the action that was
/// actually applied for it.
#[derive(Debug, Clone)]
pub struct TriggeredRule {
    pub rule: Rule,
    pub action: RuleAction,
    pub reasoning: Option<String>,
}

#[derive(Debug)]
pub struct Evaluation {
    pub decision: Decision,
    pub triggered: Vec<TriggeredRule>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load rules: {0}")]
    Rules(#[from] RuleError),
    #[error("failed to record trigger: {0}")]
    Triggers(#[from] TriggerError),
    #[error("failed to canonicalize tool input: {0}")]
    Canonicalize(#[from] serde_json::Error),
}

/// Evaluates tool events against the stored rules. Errors out of `evaluate`
/// mean the caller cannot know what the rules would have said, and the hook
/// treats that the same as a block.
pub struct RuleEngine {
    rules: RuleRepository,
    triggers: TriggerRepository,
    reviewer: SemanticReviewer,
    log_semantic_approvals: bool,
}

impl RuleEngine {
    pub fn new(db: Database, reviewer: SemanticReviewer, evaluation: &EvaluationConfig) -> Self {
        Self {
            rules: RuleRepository::new(db.clone()),
            triggers: TriggerRepository::new(db),
            reviewer,
            log_semantic_approvals: evaluation.log_semantic_approvals,
        }
    }

    pub async fn evaluate(
        &self,
        event: &ToolEvent,
        rule_set_id: Option<&str>,
    ) -> Result<Evaluation, EngineError> {
        let rules = self.rules.effective_rules(rule_set_id).await?;
        let (compiled, pattern_errors) = compile_rules(rules);
        for err in &pattern_errors {
            warn!(
                rule_id = %err.rule_id,
                pattern = %err.pattern,
                "skipping rule with unparseable pattern"
            );
        }

        let input = canonical_input(&event.input)?;

        let mut direct = Vec::new();
        let mut escalated = Vec::new();
        for compiled_rule in &compiled {
            if !compiled_rule.matches(&event.tool, &input) {
                continue;
            }
            if compiled_rule.rule.needs_review() {
                escalated.push(&compiled_rule.rule);
            } else {
                direct.push(&compiled_rule.rule);
            }
        }

        let mut decision = Decision::Allow;
        let mut triggered = Vec::new();

        for rule in direct {
            decision = decision.max(Decision::from_action(rule.action));
            triggered.push(TriggeredRule {
                rule: rule.clone(),
                action: rule.action,
                reasoning: None,
            });
        }

        for rule in escalated {
            // Block is the ceiling; no review result can change the outcome.
            if decision == Decision::Block {
                break;
            }
            match self.reviewer.review(rule, &event.tool, &input).await {
                Ok(verdict) if verdict.approved => {
                    if self.log_semantic_approvals {
                        triggered.push(TriggeredRule {
                            rule: rule.clone(),
                            action: RuleAction::Log,
                            reasoning: Some(verdict.reasoning),
                        });
                    }
                }
                Ok(verdict) => {
                    decision = decision.max(Decision::from_action(rule.action));
                    triggered.push(TriggeredRule {
                        rule: rule.clone(),
                        action: rule.action,
                        reasoning: Some(verdict.reasoning),
                    });
                }
                Err(err) => match rule.action {
                    // The reviewer being down must not open a hole a block
                    // rule was meant to close.
                    RuleAction::Block => {
                        decision = Decision::Block;
                        triggered.push(TriggeredRule {
                            rule: rule.clone(),
                            action: RuleAction::Block,
                            reasoning: Some(format!("review unavailable: {err}")),
                        });
                    }
                    RuleAction::Warn | RuleAction::Log => {
                        warn!(
                            rule_id = %rule.id,
                            error = %err,
                            "semantic review failed; letting non-blocking rule pass"
                        );
                    }
                },
            }
        }

        // The audit trail is part of the contract. Every row lands before the
        // decision is returned, and a write failure fails the evaluation.
        for fired in &triggered {
            self.triggers
                .create(NewRuleTrigger {
                    rule_id: fired.rule.id.clone(),
                    tool_call_id: event.tool_call_id.clone(),
                    action_taken: fired.action,
                    llm_reasoning: fired.reasoning.clone(),
                })
                .await?;
        }

        debug!(
            tool = %event.tool,
            decision = decision.as_str(),
            fired = triggered.len(),
            "evaluated tool event"
        );

        Ok(Evaluation { decision, triggered })
    }
}
