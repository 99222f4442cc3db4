//! Built-in rule packs. Each pack installs as a named rule set plus its
//! direct regex rules, so a fresh deployment gets useful guardrails before
//! any learning has happened.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::db::Database;
use crate::rules::{
    NewRule, NewRuleSet, RuleAction, RuleError, RuleKind, RuleRepository, RuleSet, RuleSetError,
    RuleSetRepository, RuleValidationError,
};

#[derive(Debug, Error)]
pub enum PackError {
    #[error("unknown rule pack: {0}")]
    UnknownPack(String),
    #[error("rule set error: {0}")]
    RuleSet(#[from] RuleSetError),
    #[error("rule error: {0}")]
    Rule(#[from] RuleError),
    #[error("pack rule failed validation: {0}")]
    Validation(#[from] RuleValidationError),
}

struct PackRule {
    pattern: &'static str,
    description: &'static str,
    tool: Option<&'static str>,
    action: RuleAction,
    solution: Option<&'static str>,
}

struct Pack {
    name: &'static str,
    description: &'static str,
    rules: &'static [PackRule],
}

const PACKS: &[Pack] = &[
    Pack {
        name: "python-safety",
        description: "Python best practices and safety",
        rules: &[
            PackRule {
                pattern: r"^pip3? install",
                description: "Use uv instead of pip",
                tool: Some("Bash"),
                action: RuleAction::Warn,
                solution: Some("uv add"),
            },
            PackRule {
                pattern: r"^python [^3]",
                description: "Use python3 explicitly",
                tool: Some("Bash"),
                action: RuleAction::Warn,
                solution: Some("python3"),
            },
            PackRule {
                pattern: r"rm -rf /",
                description: "Dangerous rm command",
                tool: Some("Bash"),
                action: RuleAction::Block,
                solution: None,
            },
        ],
    },
    Pack {
        name: "git-safety",
        description: "Prevent dangerous git operations",
        rules: &[
            PackRule {
                pattern: r"git push.*(--force|-f)",
                description: "No force push",
                tool: Some("Bash"),
                action: RuleAction::Block,
                solution: None,
            },
            PackRule {
                pattern: r"git reset --hard",
                description: "Dangerous reset",
                tool: Some("Bash"),
                action: RuleAction::Warn,
                solution: None,
            },
        ],
    },
    Pack {
        name: "secrets",
        description: "Block hardcoded secrets",
        rules: &[PackRule {
            pattern: r#"(api[_-]?key|secret|password|token)\s*[=:]\s*['"][^'"]+['"]"#,
            description: "Hardcoded secret detected",
            tool: None,
            action: RuleAction::Block,
            solution: None,
        }],
    },
];

pub fn pack_names() -> Vec<&'static str> {
    PACKS.iter().map(|pack| pack.name).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackInstallation {
    pub rule_set: RuleSet,
    pub rules_created: usize,
    pub already_installed: bool,
}

pub struct PackInstaller {
    rule_sets: RuleSetRepository,
    rules: RuleRepository,
}

impl PackInstaller {
    pub fn new(db: Database) -> Self {
        Self {
            rule_sets: RuleSetRepository::new(db.clone()),
            rules: RuleRepository::new(db),
        }
    }

    /// Installs a pack by name. A rule set with the pack's name already in
    /// the store means the pack (possibly user-edited since) stays as is.
    pub async fn install(&self, name: &str) -> Result<PackInstallation, PackError> {
        let pack = PACKS
            .iter()
            .find(|pack| pack.name == name)
            .ok_or_else(|| PackError::UnknownPack(name.to_string()))?;

        if let Some(existing) = self.rule_sets.find_by_name(pack.name).await? {
            info!(pack = pack.name, "rule pack already installed");
            return Ok(PackInstallation {
                rule_set: existing,
                rules_created: 0,
                already_installed: true,
            });
        }

        let rule_set = self
            .rule_sets
            .create(NewRuleSet {
                name: pack.name.to_string(),
                description: pack.description.to_string(),
            })
            .await?;

        let mut rules_created = 0;
        for rule in pack.rules {
            let new_rule = NewRule {
                rule_set_id: Some(rule_set.id.clone()),
                kind: RuleKind::Regex,
                patterns: vec![rule.pattern.to_string()],
                description: rule.description.to_string(),
                tool: rule.tool.map(str::to_string),
                action: rule.action,
                llm_review: false,
                prompt: None,
                active: true,
                priority: if rule.action == RuleAction::Block { 10 } else { 0 },
                problem: None,
                solution: rule.solution.map(str::to_string),
                source_message_id: None,
            };
            new_rule.validate()?;
            self.rules.create(new_rule).await?;
            rules_created += 1;
        }

        info!(pack = pack.name, rules = rules_created, "installed rule pack");
        Ok(PackInstallation {
            rule_set,
            rules_created,
            already_installed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn setup_db() -> (Database, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_name = format!("db_{}.sqlite", Uuid::new_v4());
        let db_path = dir.path().join(db_name);
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");
        (db, dir)
    }

    #[test]
    fn all_pack_patterns_compile() {
        for pack in PACKS {
            for rule in pack.rules {
                assert!(
                    regex::Regex::new(rule.pattern).is_ok(),
                    "pack {} pattern {:?} must compile",
                    pack.name,
                    rule.pattern
                );
            }
        }
    }

    #[tokio::test]
    async fn installs_git_safety_pack() {
        let (db, _dir) = setup_db().await;
        let installer = PackInstaller::new(db.clone());

        let installation = installer.install("git-safety").await.expect("install");
        assert!(!installation.already_installed);
        assert_eq!(installation.rules_created, 2);
        assert_eq!(installation.rule_set.name, "git-safety");

        let rules = RuleRepository::new(db)
            .effective_rules(Some(installation.rule_set.id.as_str()))
            .await
            .expect("rules");
        assert_eq!(rules.len(), 2);
        let force_push = rules
            .iter()
            .find(|rule| rule.description == "No force push")
            .expect("force push rule");
        assert_eq!(force_push.action, RuleAction::Block);
        assert_eq!(force_push.priority, 10);
        assert_eq!(force_push.tool.as_deref(), Some("Bash"));
    }

    #[tokio::test]
    async fn reinstall_leaves_existing_set_untouched() {
        let (db, _dir) = setup_db().await;
        let installer = PackInstaller::new(db.clone());

        let first = installer.install("secrets").await.expect("first install");
        let second = installer.install("secrets").await.expect("second install");

        assert!(second.already_installed);
        assert_eq!(second.rules_created, 0);
        assert_eq!(second.rule_set.id, first.rule_set.id);

        let rules = RuleRepository::new(db).list_all(true).await.expect("rules");
        assert_eq!(rules.len(), 1, "no duplicate rules on reinstall");
    }

    #[tokio::test]
    async fn unknown_pack_is_rejected() {
        let (db, _dir) = setup_db().await;
        let result = PackInstaller::new(db).install("rust-safety").await;
        assert!(matches!(result, Err(PackError::UnknownPack(name)) if name == "rust-safety"));
    }

    #[test]
    fn pack_names_lists_all_packs() {
        assert_eq!(pack_names(), vec!["python-safety", "git-safety", "secrets"]);
    }
}
