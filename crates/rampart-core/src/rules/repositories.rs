use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

use super::types::{
    NewRule, NewRuleEmbedding, NewRuleSet, Rule, RuleAction, RuleEmbedding, RuleKind, RuleSet,
    RuleValidationError,
};

const RULE_SET_COLUMNS: &str = "id, name, description, created_at";
const RULE_COLUMNS: &str = "id, rule_set_id, kind, patterns, description, tool, action, llm_review, prompt, active, priority, problem, solution, source_message_id, created_at";
const RULE_EMBEDDING_COLUMNS: &str = "rule_id, embedding, model, dimensions, created_at";

#[derive(Debug, Error)]
pub enum RuleSetError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("rule set not found: {0}")]
    NotFound(String),
    #[error("rule set name already exists: {0}")]
    NameTaken(String),
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("rule not found: {0}")]
    NotFound(String),
    #[error("invalid kind value {0}")]
    InvalidKind(String),
    #[error("invalid action value {0}")]
    InvalidAction(String),
    #[error(transparent)]
    Validation(#[from] RuleValidationError),
}

#[derive(Clone)]
pub struct RuleSetRepository {
    db: Database,
}

impl RuleSetRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, new_set: NewRuleSet) -> Result<RuleSet, RuleSetError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let conn = self.db.connection().await?;

        let result = conn
            .execute(
                "INSERT INTO rule_sets (id, name, description, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.clone(), new_set.name.clone(), new_set.description, now],
            )
            .await;

        match result {
            Ok(_) => self.get_by_id(&id).await,
            Err(err) if is_unique_violation(&err) => Err(RuleSetError::NameTaken(new_set.name)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<RuleSet, RuleSetError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_SET_COLUMNS} FROM rule_sets WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_rule_set(row),
            None => Err(RuleSetError::NotFound(id.to_string())),
        }
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<RuleSet>, RuleSetError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_SET_COLUMNS} FROM rule_sets WHERE name = ?1"),
                params![name],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_rule_set(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_all(&self) -> Result<Vec<RuleSet>, RuleSetError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_SET_COLUMNS} FROM rule_sets ORDER BY name"),
                (),
            )
            .await?;

        let mut sets = Vec::new();
        while let Some(row) = rows.next().await? {
            sets.push(row_to_rule_set(row)?);
        }
        Ok(sets)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleCounts {
    pub total: i64,
    pub active: i64,
    pub learned: i64,
}

#[derive(Clone)]
pub struct RuleRepository {
    db: Database,
}

impl RuleRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, new_rule: NewRule) -> Result<Rule, RuleError> {
        new_rule.validate()?;
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let patterns_json = serde_json::to_string(&new_rule.patterns)?;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO rules (
                        id, rule_set_id, kind, patterns, description, tool, action, llm_review, prompt, active, priority, problem, solution, source_message_id, created_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                    RETURNING {RULE_COLUMNS}"
                ),
                params![
                    id,
                    new_rule.rule_set_id,
                    new_rule.kind.as_str(),
                    patterns_json,
                    new_rule.description,
                    new_rule.tool,
                    new_rule.action.as_str(),
                    new_rule.llm_review as i64,
                    new_rule.prompt,
                    new_rule.active as i64,
                    new_rule.priority,
                    new_rule.problem,
                    new_rule.solution,
                    new_rule.source_message_id,
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_rule(row),
            None => Err(RuleError::NotFound("insert failed".into())),
        }
    }

    /// Commit a rule together with its dedup embedding as one transaction.
    /// An embedding row must never exist without its rule, and a learned rule
    /// missing its embedding would be invisible to later dedup scans.
    pub async fn create_with_embedding(
        &self,
        new_rule: NewRule,
        new_embedding: NewRuleEmbedding,
    ) -> Result<Rule, RuleError> {
        new_rule.validate()?;
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let patterns_json = serde_json::to_string(&new_rule.patterns)?;
        let dimensions = new_embedding.embedding.len() as i64;
        let blob = embedding_to_blob(&new_embedding.embedding);

        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;
        tx.execute(
            "INSERT INTO rules (
                id, rule_set_id, kind, patterns, description, tool, action, llm_review, prompt, active, priority, problem, solution, source_message_id, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                id.clone(),
                new_rule.rule_set_id,
                new_rule.kind.as_str(),
                patterns_json,
                new_rule.description,
                new_rule.tool,
                new_rule.action.as_str(),
                new_rule.llm_review as i64,
                new_rule.prompt,
                new_rule.active as i64,
                new_rule.priority,
                new_rule.problem,
                new_rule.solution,
                new_rule.source_message_id,
                now.clone()
            ],
        )
        .await?;
        tx.execute(
            "INSERT INTO rule_embeddings (rule_id, embedding, model, dimensions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.clone(), blob, new_embedding.model, dimensions, now],
        )
        .await?;
        tx.commit().await?;

        self.get_by_id(&id).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Rule, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_rule(row),
            None => Err(RuleError::NotFound(id.to_string())),
        }
    }

    pub async fn list_all(&self, include_inactive: bool) -> Result<Vec<Rule>, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = if include_inactive {
            conn.query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules ORDER BY priority DESC, created_at DESC"
                ),
                (),
            )
            .await?
        } else {
            conn.query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules WHERE active = 1 ORDER BY priority DESC, created_at DESC"
                ),
                (),
            )
            .await?
        };

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await? {
            rules.push(row_to_rule(row)?);
        }
        Ok(rules)
    }

    /// The effective rule set for evaluation: global rules plus the rules of
    /// the bound set, active only, highest priority first with id as the
    /// deterministic tie-break.
    pub async fn effective_rules(
        &self,
        rule_set_id: Option<&str>,
    ) -> Result<Vec<Rule>, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = if let Some(set_id) = rule_set_id {
            conn.query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules
                     WHERE active = 1 AND (rule_set_id IS NULL OR rule_set_id = ?1)
                     ORDER BY priority DESC, id ASC"
                ),
                params![set_id],
            )
            .await?
        } else {
            conn.query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules
                     WHERE active = 1 AND rule_set_id IS NULL
                     ORDER BY priority DESC, id ASC"
                ),
                (),
            )
            .await?
        };

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await? {
            rules.push(row_to_rule(row)?);
        }
        Ok(rules)
    }

    pub async fn update(&self, id: &str, updated: NewRule) -> Result<Rule, RuleError> {
        updated.validate()?;
        let patterns_json = serde_json::to_string(&updated.patterns)?;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE rules
                     SET rule_set_id = ?1,
                         kind = ?2,
                         patterns = ?3,
                         description = ?4,
                         tool = ?5,
                         action = ?6,
                         llm_review = ?7,
                         prompt = ?8,
                         active = ?9,
                         priority = ?10,
                         problem = ?11,
                         solution = ?12,
                         source_message_id = ?13
                     WHERE id = ?14
                     RETURNING {RULE_COLUMNS}"
                ),
                params![
                    updated.rule_set_id,
                    updated.kind.as_str(),
                    patterns_json,
                    updated.description,
                    updated.tool,
                    updated.action.as_str(),
                    updated.llm_review as i64,
                    updated.prompt,
                    updated.active as i64,
                    updated.priority,
                    updated.problem,
                    updated.solution,
                    updated.source_message_id,
                    id
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_rule(row),
            None => Err(RuleError::NotFound(id.to_string())),
        }
    }

    /// Rules are soft-deactivated, never deleted, so historical triggers keep
    /// a valid foreign key.
    pub async fn set_active(&self, id: &str, active: bool) -> Result<Rule, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE rules SET active = ?2 WHERE id = ?1 RETURNING {RULE_COLUMNS}"
                ),
                params![id, active as i64],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_rule(row),
            None => Err(RuleError::NotFound(id.to_string())),
        }
    }

    pub async fn counts(&self) -> Result<RuleCounts, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN active = 1 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN source_message_id IS NOT NULL THEN 1 ELSE 0 END), 0)
                 FROM rules",
                (),
            )
            .await?;

        let row = rows
            .next()
            .await?
            .ok_or_else(|| RuleError::NotFound("counts".into()))?;
        Ok(RuleCounts {
            total: row.get(0)?,
            active: row.get(1)?,
            learned: row.get(2)?,
        })
    }

    pub async fn upsert_embedding(
        &self,
        rule_id: &str,
        new_embedding: NewRuleEmbedding,
    ) -> Result<(), RuleError> {
        let now = now_rfc3339();
        let dimensions = new_embedding.embedding.len() as i64;
        let blob = embedding_to_blob(&new_embedding.embedding);
        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT OR REPLACE INTO rule_embeddings (rule_id, embedding, model, dimensions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![rule_id, blob, new_embedding.model, dimensions, now],
        )
        .await?;
        Ok(())
    }

    pub async fn get_embedding(&self, rule_id: &str) -> Result<Option<RuleEmbedding>, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RULE_EMBEDDING_COLUMNS} FROM rule_embeddings WHERE rule_id = ?1"
                ),
                params![rule_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_rule_embedding(row)?)),
            None => Ok(None),
        }
    }

    /// Active rules that have no stored embedding yet. Used by the embedding
    /// backfill job for rules created before embeddings were recorded.
    pub async fn rules_missing_embedding(&self) -> Result<Vec<Rule>, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules
                     WHERE active = 1
                       AND id NOT IN (SELECT rule_id FROM rule_embeddings)
                     ORDER BY created_at"
                ),
                (),
            )
            .await?;

        let mut rules = Vec::new();
        while let Some(row) = rows.next().await? {
            rules.push(row_to_rule(row)?);
        }
        Ok(rules)
    }

    /// Scan the stored vectors for the nearest neighbor of `query` by cosine
    /// similarity. Rows whose dimensions differ from the query are skipped.
    pub async fn nearest_embedding(
        &self,
        query: &[f32],
    ) -> Result<Option<(RuleEmbedding, f32)>, RuleError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {RULE_EMBEDDING_COLUMNS} FROM rule_embeddings"),
                (),
            )
            .await?;

        let mut best: Option<(RuleEmbedding, f32)> = None;
        while let Some(row) = rows.next().await? {
            let stored = row_to_rule_embedding(row)?;
            if stored.embedding.len() != query.len() {
                tracing::warn!(
                    rule_id = %stored.rule_id,
                    stored_dimensions = stored.embedding.len(),
                    query_dimensions = query.len(),
                    "skipping embedding with mismatched dimensions"
                );
                continue;
            }
            let similarity = cosine_similarity(query, &stored.embedding);
            let replace = match &best {
                Some((_, best_similarity)) => similarity > *best_similarity,
                None => true,
            };
            if replace {
                best = Some((stored, similarity));
            }
        }
        Ok(best)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn row_to_rule_set(row: Row) -> Result<RuleSet, RuleSetError> {
    let created_at: String = row.get(3)?;
    Ok(RuleSet {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

fn row_to_rule(row: Row) -> Result<Rule, RuleError> {
    let kind: String = row.get(2)?;
    let patterns_json: String = row.get(3)?;
    let action: String = row.get(6)?;
    let llm_review: i64 = row.get(7)?;
    let active: i64 = row.get(9)?;
    let created_at: String = row.get(14)?;

    let kind = RuleKind::from_str(&kind).ok_or_else(|| RuleError::InvalidKind(kind.clone()))?;
    let action =
        RuleAction::from_str(&action).ok_or_else(|| RuleError::InvalidAction(action.clone()))?;

    Ok(Rule {
        id: row.get(0)?,
        rule_set_id: row.get(1)?,
        kind,
        patterns: serde_json::from_str(&patterns_json)?,
        description: row.get(4)?,
        tool: row.get(5)?,
        action,
        llm_review: llm_review != 0,
        prompt: row.get(8)?,
        active: active != 0,
        priority: row.get(10)?,
        problem: row.get(11)?,
        solution: row.get(12)?,
        source_message_id: row.get(13)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

fn row_to_rule_embedding(row: Row) -> Result<RuleEmbedding, RuleError> {
    let blob: Vec<u8> = row.get(1)?;
    let created_at: String = row.get(4)?;
    Ok(RuleEmbedding {
        rule_id: row.get(0)?,
        embedding: blob_to_embedding(&blob),
        model: row.get(2)?,
        dimensions: row.get(3)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
    })
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_unique_violation(err: &libsql::Error) -> bool {
    err.to_string()
        .to_ascii_lowercase()
        .contains("unique constraint failed")
}
