//! Process-local repository
//!
//! Holds everything in memory. Useful for tests and for running without a
//! database file; `set_available(false)` simulates an unreachable backend.

use super::{ConfigRepository, RuleRepository, StorageError, TrafficRepository};
use crate::config::Settings;
use crate::model::{Rule, TrafficEntry};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryRepository {
    traffic: RwLock<Vec<TrafficEntry>>,
    rules: RwLock<Vec<Rule>>,
    config: RwLock<Option<Settings>>,
    unavailable: AtomicBool,
    inserts: AtomicUsize,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated outage; every call fails while unavailable
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Successful traffic inserts since creation
    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "memory repository marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TrafficRepository for MemoryRepository {
    async fn add_traffic_entry(&self, entry: &TrafficEntry) -> Result<(), StorageError> {
        self.check()?;
        self.traffic.write().await.push(entry.clone());
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_traffic_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<TrafficEntry>, usize), StorageError> {
        self.check()?;
        let traffic = self.traffic.read().await;
        let mut sorted: Vec<&TrafficEntry> = traffic.iter().collect();
        // Stable sort keeps later inserts first among equal timestamps once reversed
        sorted.sort_by_key(|e| e.start_time);
        let page = sorted
            .into_iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        Ok((page, traffic.len()))
    }

    async fn clear_traffic(&self) -> Result<(), StorageError> {
        self.check()?;
        self.traffic.write().await.clear();
        Ok(())
    }

    async fn prune_traffic(&self, keep_count: usize) -> Result<u64, StorageError> {
        self.check()?;
        let mut traffic = self.traffic.write().await;
        if traffic.len() <= keep_count {
            return Ok(0);
        }
        traffic.sort_by_key(|e| e.start_time);
        let excess = traffic.len() - keep_count;
        traffic.drain(..excess);
        Ok(excess as u64)
    }
}

#[async_trait]
impl RuleRepository for MemoryRepository {
    async fn get_rules(&self) -> Result<Vec<Rule>, StorageError> {
        self.check()?;
        Ok(self.rules.read().await.clone())
    }

    async fn add_rule(&self, rule: &Rule) -> Result<(), StorageError> {
        self.check()?;
        self.rules.write().await.push(rule.clone());
        Ok(())
    }

    async fn update_rule(&self, rule: &Rule) -> Result<(), StorageError> {
        self.check()?;
        let mut rules = self.rules.write().await;
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => {
                *existing = rule.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(rule.id.clone())),
        }
    }

    async fn delete_rule(&self, id: &str) -> Result<(), StorageError> {
        self.check()?;
        self.rules.write().await.retain(|r| r.id != id);
        Ok(())
    }
}

#[async_trait]
impl ConfigRepository for MemoryRepository {
    async fn get_config(&self) -> Result<Option<Settings>, StorageError> {
        self.check()?;
        Ok(self.config.read().await.clone())
    }

    async fn save_config(&self, settings: &Settings) -> Result<(), StorageError> {
        self.check()?;
        *self.config.write().await = Some(settings.clone());
        Ok(())
    }
}
