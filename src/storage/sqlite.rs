//! SQLite storage backend
//!
//! Async SQLite persistence for traffic, rules and settings with:
//! - WAL journal for concurrent readers alongside the single writer
//! - Automatic schema creation
//! - Newest-first pagination and keep-N pruning

use super::{ConfigRepository, RuleRepository, StorageError, TrafficRepository};
use crate::config::Settings;
use crate::model::{header_serde, BreakpointStrategy, ModifiedBy, Rule, RuleType, TrafficEntry};
use async_trait::async_trait;
use chrono::DateTime;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Repository backed by a SQLite database
#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Create or open the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self, StorageError> {
        // Ensure parent directory exists
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::DatabaseError(sqlx::Error::Io(e)))?;
        }

        // mode=rwc creates the database if it doesn't exist
        let pool = SqlitePool::connect(&format!("sqlite://{}?mode=rwc", db_path)).await?;

        info!(db_path = %db_path, "Connected to SQLite database");

        Self::enable_wal(&pool).await?;
        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    /// Private in-memory database (single connection so every query sees the same data)
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    async fn enable_wal(pool: &SqlitePool) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(pool)
            .await?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(pool)
            .await?;

        debug!("WAL mode enabled");

        Ok(())
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS traffic (
                id TEXT PRIMARY KEY,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                request_headers TEXT NOT NULL,
                request_body TEXT NOT NULL,
                status INTEGER NOT NULL,
                response_headers TEXT NOT NULL,
                response_body TEXT NOT NULL,
                start_time INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                modified_by TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_traffic_start_time
            ON traffic(start_time)
            "#,
        )
        .execute(pool)
        .await?;

        // seq preserves insertion order for first-match evaluation
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rules (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                type TEXT NOT NULL,
                url_pattern TEXT NOT NULL,
                method TEXT NOT NULL,
                enabled BOOLEAN NOT NULL,
                strategy TEXT NOT NULL,
                response_json TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        debug!("Database migrations completed");

        Ok(())
    }

    /// Close database connection
    pub async fn close(self) {
        self.pool.close().await;
        info!("Database connection closed");
    }
}

#[async_trait]
impl TrafficRepository for SqliteRepository {
    async fn add_traffic_entry(&self, entry: &TrafficEntry) -> Result<(), StorageError> {
        let request_headers = serde_json::to_string(&header_serde::to_map(&entry.request_headers))?;
        let response_headers =
            serde_json::to_string(&header_serde::to_map(&entry.response_headers))?;

        sqlx::query(
            r#"
            INSERT INTO traffic (
                id, method, url, request_headers, request_body,
                status, response_headers, response_body, start_time, duration_ms, modified_by
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.method)
        .bind(&entry.url)
        .bind(request_headers)
        .bind(&entry.request_body)
        .bind(entry.status as i64)
        .bind(response_headers)
        .bind(&entry.response_body)
        .bind(entry.start_time.timestamp_micros())
        .bind(entry.duration.as_millis() as i64)
        .bind(entry.modified_by.map(|m| m.as_str()))
        .execute(&self.pool)
        .await?;

        debug!(id = %entry.id, "Traffic entry persisted");

        Ok(())
    }

    async fn get_traffic_page(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<TrafficEntry>, usize), StorageError> {
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM traffic")
            .fetch_one(&self.pool)
            .await?;

        let entries = sqlx::query_as::<Sqlite, TrafficEntry>(
            r#"
            SELECT
                id, method, url, request_headers, request_body,
                status, response_headers, response_body, start_time, duration_ms, modified_by
            FROM traffic
            ORDER BY start_time DESC, rowid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok((entries, total as usize))
    }

    async fn clear_traffic(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM traffic").execute(&self.pool).await?;
        info!("Traffic history cleared");
        Ok(())
    }

    async fn prune_traffic(&self, keep_count: usize) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"
            DELETE FROM traffic WHERE id NOT IN (
                SELECT id FROM traffic ORDER BY start_time DESC, rowid DESC LIMIT ?
            )
            "#,
        )
        .bind(keep_count as i64)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!(deleted = deleted, keep = keep_count, "Pruned traffic history");
        }

        Ok(deleted)
    }
}

#[async_trait]
impl RuleRepository for SqliteRepository {
    async fn get_rules(&self) -> Result<Vec<Rule>, StorageError> {
        let rules = sqlx::query_as::<Sqlite, Rule>(
            r#"
            SELECT id, type, url_pattern, method, enabled, strategy, response_json
            FROM rules
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rules)
    }

    async fn add_rule(&self, rule: &Rule) -> Result<(), StorageError> {
        let response_json = rule
            .response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO rules (id, type, url_pattern, method, enabled, strategy, response_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.id)
        .bind(rule.rule_type.as_str())
        .bind(&rule.url_pattern)
        .bind(&rule.method)
        .bind(rule.enabled)
        .bind(rule.strategy.as_str())
        .bind(response_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_rule(&self, rule: &Rule) -> Result<(), StorageError> {
        let response_json = rule
            .response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE rules
            SET type = ?, url_pattern = ?, method = ?, enabled = ?, strategy = ?, response_json = ?
            WHERE id = ?
            "#,
        )
        .bind(rule.rule_type.as_str())
        .bind(&rule.url_pattern)
        .bind(&rule.method)
        .bind(rule.enabled)
        .bind(rule.strategy.as_str())
        .bind(response_json)
        .bind(&rule.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(rule.id.clone()));
        }

        Ok(())
    }

    async fn delete_rule(&self, id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigRepository for SqliteRepository {
    async fn get_config(&self) -> Result<Option<Settings>, StorageError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM config WHERE key = 'app_config'")
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((value,)) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    async fn save_config(&self, settings: &Settings) -> Result<(), StorageError> {
        let value = serde_json::to_string(settings)?;

        sqlx::query("INSERT OR REPLACE INTO config (key, value) VALUES ('app_config', ?)")
            .bind(value)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

fn decode_error(column: &str, message: impl Into<String>) -> sqlx::Error {
    let message: String = message.into();
    sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: message.into(),
    }
}

fn headers_column(row: &SqliteRow, column: &str) -> Result<http::HeaderMap, sqlx::Error> {
    let raw: String = row.try_get(column)?;
    let map = serde_json::from_str(&raw).map_err(|e| decode_error(column, e.to_string()))?;
    header_serde::from_map(map).map_err(|e| decode_error(column, e))
}

impl sqlx::FromRow<'_, SqliteRow> for TrafficEntry {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let start_micros: i64 = row.try_get("start_time")?;
        let start_time = DateTime::from_timestamp_micros(start_micros)
            .ok_or_else(|| decode_error("start_time", "timestamp out of range"))?;

        let modified_by: Option<String> = row.try_get("modified_by")?;

        Ok(Self {
            id: row.try_get("id")?,
            method: row.try_get("method")?,
            url: row.try_get("url")?,
            request_headers: headers_column(row, "request_headers")?,
            request_body: row.try_get("request_body")?,
            status: row.try_get::<i64, _>("status")? as u16,
            response_headers: headers_column(row, "response_headers")?,
            response_body: row.try_get("response_body")?,
            start_time,
            duration: Duration::from_millis(row.try_get::<i64, _>("duration_ms")?.max(0) as u64),
            modified_by: modified_by.as_deref().and_then(ModifiedBy::parse),
        })
    }
}

impl sqlx::FromRow<'_, SqliteRow> for Rule {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let rule_type: String = row.try_get("type")?;
        let strategy: String = row.try_get("strategy")?;
        let response_json: Option<String> = row.try_get("response_json")?;

        let response = match response_json.as_deref() {
            Some(json) if !json.is_empty() && json != "null" => Some(
                serde_json::from_str(json)
                    .map_err(|e| decode_error("response_json", e.to_string()))?,
            ),
            _ => None,
        };

        Ok(Self {
            id: row.try_get("id")?,
            rule_type: RuleType::parse(&rule_type)
                .ok_or_else(|| decode_error("type", format!("unknown rule type {rule_type:?}")))?,
            url_pattern: row.try_get("url_pattern")?,
            method: row.try_get("method")?,
            enabled: row.try_get("enabled")?,
            strategy: BreakpointStrategy::parse(&strategy).ok_or_else(|| {
                decode_error("strategy", format!("unknown strategy {strategy:?}"))
            })?,
            response,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MockResponse;
    use chrono::Utc;
    use http::HeaderValue;
    use tempfile::TempDir;

    async fn create_test_storage() -> (SqliteRepository, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let storage = SqliteRepository::new(db_path.to_str().unwrap()).await.unwrap();
        (storage, temp_dir)
    }

    fn create_test_entry(url: &str, age_secs: i64) -> TrafficEntry {
        let mut entry = TrafficEntry::new("GET", url);
        entry.start_time = Utc::now() - chrono::Duration::seconds(age_secs);
        entry.status = 200;
        entry
            .response_headers
            .insert("content-type", HeaderValue::from_static("text/plain"));
        entry.response_body = "ok".to_string();
        entry.duration = Duration::from_millis(15);
        entry
    }

    #[tokio::test]
    async fn test_storage_creation() {
        let (_storage, _temp_dir) = create_test_storage().await;
    }

    #[tokio::test]
    async fn test_add_and_page_newest_first() {
        let (storage, _temp_dir) = create_test_storage().await;

        storage
            .add_traffic_entry(&create_test_entry("http://a.test/", 30))
            .await
            .unwrap();
        storage
            .add_traffic_entry(&create_test_entry("http://b.test/", 20))
            .await
            .unwrap();
        storage
            .add_traffic_entry(&create_test_entry("http://c.test/", 10))
            .await
            .unwrap();

        let (page, total) = storage.get_traffic_page(0, 2).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].url, "http://c.test/");
        assert_eq!(page[1].url, "http://b.test/");

        let (page, _) = storage.get_traffic_page(2, 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].url, "http://a.test/");
    }

    #[tokio::test]
    async fn test_entry_fields_survive_storage() {
        let (storage, _temp_dir) = create_test_storage().await;
        let mut entry = create_test_entry("http://example.com/x", 0);
        entry.modified_by = Some(ModifiedBy::Breakpoint);
        entry
            .request_headers
            .append("x-multi", HeaderValue::from_static("1"));
        entry
            .request_headers
            .append("x-multi", HeaderValue::from_static("2"));

        storage.add_traffic_entry(&entry).await.unwrap();

        let (page, _) = storage.get_traffic_page(0, 10).await.unwrap();
        let stored = &page[0];
        assert_eq!(stored.id, entry.id);
        assert_eq!(stored.status, 200);
        assert_eq!(stored.modified_by, Some(ModifiedBy::Breakpoint));
        assert_eq!(stored.duration, Duration::from_millis(15));
        assert_eq!(stored.request_headers.get_all("x-multi").iter().count(), 2);
        assert_eq!(
            stored.start_time.timestamp_micros(),
            entry.start_time.timestamp_micros()
        );
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let (storage, _temp_dir) = create_test_storage().await;

        for age in [50, 40, 30, 20, 10] {
            storage
                .add_traffic_entry(&create_test_entry(&format!("http://x/{age}"), age))
                .await
                .unwrap();
        }

        let deleted = storage.prune_traffic(2).await.unwrap();
        assert_eq!(deleted, 3);

        let (page, total) = storage.get_traffic_page(0, 10).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(page[0].url, "http://x/10");
        assert_eq!(page[1].url, "http://x/20");
    }

    #[tokio::test]
    async fn test_clear_traffic() {
        let (storage, _temp_dir) = create_test_storage().await;
        storage
            .add_traffic_entry(&create_test_entry("http://x/", 0))
            .await
            .unwrap();

        storage.clear_traffic().await.unwrap();

        let (page, total) = storage.get_traffic_page(0, 10).await.unwrap();
        assert_eq!(total, 0);
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn test_rules_keep_insertion_order() {
        let (storage, _temp_dir) = create_test_storage().await;

        let first = Rule::breakpoint("api", BreakpointStrategy::Both).with_id("r1");
        let second = Rule::mock("mock.me", MockResponse::new(201, "mocked").with_header("x-mock", "1"))
            .with_id("r2")
            .with_method("GET");

        storage.add_rule(&first).await.unwrap();
        storage.add_rule(&second).await.unwrap();

        let rules = storage.get_rules().await.unwrap();
        assert_eq!(rules, vec![first, second]);
    }

    #[tokio::test]
    async fn test_update_and_delete_rule() {
        let (storage, _temp_dir) = create_test_storage().await;
        let rule = Rule::breakpoint("api", BreakpointStrategy::Request).with_id("r1");
        storage.add_rule(&rule).await.unwrap();

        let updated = rule.clone().disabled();
        storage.update_rule(&updated).await.unwrap();
        assert!(!storage.get_rules().await.unwrap()[0].enabled);

        let missing = Rule::breakpoint("", BreakpointStrategy::Request).with_id("nope");
        assert!(matches!(
            storage.update_rule(&missing).await,
            Err(StorageError::NotFound(_))
        ));

        storage.delete_rule("r1").await.unwrap();
        assert!(storage.get_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let storage = SqliteRepository::in_memory().await.unwrap();
        assert!(storage.get_config().await.unwrap().is_none());

        let settings = Settings {
            max_response_size: 4096,
            ..Settings::default()
        };
        storage.save_config(&settings).await.unwrap();

        assert_eq!(storage.get_config().await.unwrap(), Some(settings));
    }
}
