//! Rule Engine
//!
//! Ordered, first-match-wins list of interception rules. The list is read on
//! every request and written only from the control surface, so matching takes
//! a shared read lock while mutations are serialized behind a write gate and
//! persisted before the in-memory list changes.

use crate::model::{Rule, RuleType};
use crate::storage::{RuleRepository, StorageError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Rule not found: {0}")]
    NotFound(String),

    #[error("Invalid rule: {0}")]
    Invalid(String),

    #[error("Rule storage failed: {0}")]
    Storage(#[from] StorageError),
}

pub struct RuleEngine {
    rules: RwLock<Vec<Arc<Rule>>>,

    /// Serializes mutations so the persisted order matches the in-memory order
    write_gate: Mutex<()>,

    repo: Arc<dyn RuleRepository>,
}

impl RuleEngine {
    /// Create an engine seeded from the repository.
    ///
    /// A load failure is logged and the engine starts empty.
    pub async fn new(repo: Arc<dyn RuleRepository>) -> Self {
        let engine = Self {
            rules: RwLock::new(Vec::new()),
            write_gate: Mutex::new(()),
            repo,
        };

        if let Err(e) = engine.reload().await {
            warn!(error = %e, "Failed to load rules, starting with an empty rule set");
        }

        engine
    }

    /// Replace the in-memory list with the persisted one
    pub async fn reload(&self) -> Result<usize, RuleError> {
        let _gate = self.write_gate.lock().await;
        let loaded = self.repo.get_rules().await?;
        let count = loaded.len();

        *self.rules.write().await = loaded.into_iter().map(Arc::new).collect();
        info!(count, "Loaded interception rules");
        Ok(count)
    }

    /// Append a rule, assigning an ID when none is set
    pub async fn add_rule(&self, mut rule: Rule) -> Result<Rule, RuleError> {
        validate(&rule)?;
        if rule.id.is_empty() {
            rule.id = uuid::Uuid::new_v4().to_string();
        }

        let _gate = self.write_gate.lock().await;
        if self.rules.read().await.iter().any(|r| r.id == rule.id) {
            return Err(RuleError::Invalid(format!("duplicate rule id {}", rule.id)));
        }

        self.persist("add", self.repo.add_rule(&rule).await)?;
        self.rules.write().await.push(Arc::new(rule.clone()));

        info!(
            id = %rule.id,
            rule_type = rule.rule_type.as_str(),
            url_pattern = %rule.url_pattern,
            "Rule added"
        );
        Ok(rule)
    }

    /// Snapshot of all rules in evaluation order
    pub async fn get_rules(&self) -> Vec<Rule> {
        self.rules
            .read()
            .await
            .iter()
            .map(|r| r.as_ref().clone())
            .collect()
    }

    pub async fn get_rule(&self, id: &str) -> Option<Rule> {
        self.rules
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.as_ref().clone())
    }

    /// Replace a rule in place, keeping its position in the order
    pub async fn update_rule(&self, rule: Rule) -> Result<(), RuleError> {
        validate(&rule)?;

        let _gate = self.write_gate.lock().await;
        let position = self.position(&rule.id).await?;

        self.persist("update", self.repo.update_rule(&rule).await)?;

        let id = rule.id.clone();
        if let Some(slot) = self.rules.write().await.get_mut(position) {
            *slot = Arc::new(rule);
        }
        info!(id = %id, "Rule updated");
        Ok(())
    }

    pub async fn delete_rule(&self, id: &str) -> Result<(), RuleError> {
        let _gate = self.write_gate.lock().await;
        self.position(id).await?;

        self.persist("delete", self.repo.delete_rule(id).await)?;

        self.rules.write().await.retain(|r| r.id != id);
        info!(id = %id, "Rule deleted");
        Ok(())
    }

    /// Delete every rule.
    ///
    /// Rules are removed from storage one by one; if storage fails part way,
    /// the rules already deleted are dropped from memory too and the error is
    /// returned, so memory never holds rules storage no longer has.
    pub async fn clear_rules(&self) -> Result<(), RuleError> {
        let _gate = self.write_gate.lock().await;
        let ids: Vec<String> = self
            .rules
            .read()
            .await
            .iter()
            .map(|r| r.id.clone())
            .collect();

        let mut deleted = Vec::with_capacity(ids.len());
        let mut failure = None;
        for id in ids {
            match self.repo.delete_rule(&id).await {
                Ok(()) => deleted.push(id),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.rules
            .write()
            .await
            .retain(|r| !deleted.contains(&r.id));

        match failure {
            Some(e) => {
                warn!(error = %e, removed = deleted.len(), "Clearing rules stopped early");
                crate::metrics::Metrics::record_persistence_error("rule_clear");
                Err(e.into())
            }
            None => {
                info!(removed = deleted.len(), "Rules cleared");
                Ok(())
            }
        }
    }

    /// First enabled rule whose method filter and URL pattern both match
    pub async fn match_request(&self, method: &str, url: &str) -> Option<Arc<Rule>> {
        let rules = self.rules.read().await;
        let matched = rules.iter().find(|r| r.matches(method, url)).cloned();

        if let Some(rule) = &matched {
            debug!(
                id = %rule.id,
                rule_type = rule.rule_type.as_str(),
                method = %method,
                url = %url,
                "Rule matched"
            );
        }
        matched
    }

    pub async fn len(&self) -> usize {
        self.rules.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rules.read().await.is_empty()
    }

    async fn position(&self, id: &str) -> Result<usize, RuleError> {
        self.rules
            .read()
            .await
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))
    }

    fn persist(&self, operation: &str, result: Result<(), StorageError>) -> Result<(), RuleError> {
        result.map_err(|e| {
            warn!(operation, error = %e, "Rule storage failed, in-memory rules unchanged");
            crate::metrics::Metrics::record_persistence_error("rule");
            RuleError::Storage(e)
        })
    }
}

fn validate(rule: &Rule) -> Result<(), RuleError> {
    if rule.rule_type == RuleType::Mock && rule.response.is_none() {
        return Err(RuleError::Invalid(
            "mock rule requires a response".to_string(),
        ));
    }
    Ok(())
}
