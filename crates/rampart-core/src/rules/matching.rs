use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use super::types::Rule;

/// A rule whose patterns all compiled, ready for evaluation. Matching is a
/// pure function of the rule and the serialized input.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: Rule,
    patterns: Vec<Regex>,
}

#[derive(Debug, Error)]
#[error("rule {rule_id} has invalid pattern '{pattern}': {source}")]
pub struct PatternError {
    pub rule_id: String,
    pub pattern: String,
    #[source]
    pub source: regex::Error,
}

/// Compile every pattern of every rule. A rule with any uncompilable pattern
/// is a configuration error: it is excluded from the compiled set and
/// reported, never silently treated as a non-match.
pub fn compile_rules(rules: Vec<Rule>) -> (Vec<CompiledRule>, Vec<PatternError>) {
    let mut compiled = Vec::with_capacity(rules.len());
    let mut errors = Vec::new();

    'rules: for rule in rules {
        let mut patterns = Vec::with_capacity(rule.patterns.len());
        for pattern in &rule.patterns {
            match Regex::new(pattern) {
                Ok(regex) => patterns.push(regex),
                Err(source) => {
                    errors.push(PatternError {
                        rule_id: rule.id.clone(),
                        pattern: pattern.clone(),
                        source,
                    });
                    continue 'rules;
                }
            }
        }
        compiled.push(CompiledRule { rule, patterns });
    }

    (compiled, errors)
}

impl CompiledRule {
    /// True when any pattern finds a match in the serialized input (substring
    /// search, case-sensitive). A rule scoped to a tool never matches calls
    /// from other tools.
    pub fn matches(&self, tool: &str, input: &str) -> bool {
        if let Some(filter) = self.rule.tool.as_deref() {
            if filter != tool {
                return false;
            }
        }
        self.patterns.iter().any(|regex| regex.is_match(input))
    }
}

/// Canonical text form of a tool input: object keys sorted at every level so
/// the matched text is reproducible no matter how the caller assembled the
/// payload. Bare string inputs pass through unquoted.
pub fn canonical_input(input: &Value) -> Result<String, serde_json::Error> {
    match input {
        Value::String(text) => Ok(text.clone()),
        other => serde_json::to_string_pretty(&sort_keys(other)),
    }
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
