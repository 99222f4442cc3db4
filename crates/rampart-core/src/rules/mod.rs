pub mod engine;
pub mod matching;
pub mod repositories;
pub mod types;

pub use engine::{Decision, EngineError, Evaluation, RuleEngine, ToolEvent, TriggeredRule};
pub use matching::{canonical_input, compile_rules, CompiledRule, PatternError};
pub use repositories::{
    cosine_similarity, RuleCounts, RuleError, RuleRepository, RuleSetError, RuleSetRepository,
};
pub use types::{
    NewRule, NewRuleEmbedding, NewRuleSet, Rule, RuleAction, RuleEmbedding, RuleKind, RuleSet,
    RuleValidationError,
};
