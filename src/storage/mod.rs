//! Durable storage boundary
//!
//! The core only talks to persistence through the narrow repository traits
//! defined here. Two implementations ship with the crate:
//! - [`SqliteRepository`] - sqlx/SQLite backend with WAL enabled
//! - [`MemoryRepository`] - process-local backend for tests and ephemeral runs

mod memory;
mod sqlite;

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

use crate::config::Settings;
use crate::model::{Rule, TrafficEntry};
use async_trait::async_trait;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("No stored row with id {0}")]
    NotFound(String),
}

/// Captured traffic persistence
#[async_trait]
pub trait TrafficRepository: Send + Sync {
    async fn add_traffic_entry(&self, entry: &TrafficEntry) -> Result<(), StorageError>;

    /// Newest-first page plus the total row count
    async fn get_traffic_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<TrafficEntry>, usize), StorageError>;

    async fn clear_traffic(&self) -> Result<(), StorageError>;

    /// Keep only the newest `keep_count` rows; returns rows deleted
    async fn prune_traffic(&self, keep_count: usize) -> Result<u64, StorageError>;
}

/// Interception rule persistence (insertion order is significant)
#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn get_rules(&self) -> Result<Vec<Rule>, StorageError>;

    async fn add_rule(&self, rule: &Rule) -> Result<(), StorageError>;

    async fn update_rule(&self, rule: &Rule) -> Result<(), StorageError>;

    async fn delete_rule(&self, id: &str) -> Result<(), StorageError>;
}

/// Settings persistence
#[async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn get_config(&self) -> Result<Option<Settings>, StorageError>;

    async fn save_config(&self, settings: &Settings) -> Result<(), StorageError>;
}
