//! Traffic Store
//!
//! Two tiers:
//! - a bounded in-memory ring for immediate read-after-write on the dashboard
//! - durable storage fed through a bounded queue drained by one writer task
//!
//! Producers never wait on persistence. When the queue is full the entry is
//! dropped from the durability path with a warning; it stays in the ring.

use crate::capture::truncate_body;
use crate::config::Settings;
use crate::metrics::Metrics;
use crate::model::TrafficEntry;
use crate::storage::{StorageError, TrafficRepository};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

enum WriteOp {
    Insert(TrafficEntry),
    Clear(oneshot::Sender<Result<(), StorageError>>),
    Flush(oneshot::Sender<()>),
}

pub struct TrafficStore {
    ring: RwLock<VecDeque<TrafficEntry>>,
    memory_capacity: usize,
    max_body_size: usize,
    default_page_size: usize,
    queue: mpsc::Sender<WriteOp>,
    repo: Arc<dyn TrafficRepository>,
}

impl TrafficStore {
    /// Create the store and start its writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(repo: Arc<dyn TrafficRepository>, settings: &Settings) -> Self {
        let (queue, rx) = mpsc::channel(settings.write_queue_capacity.max(1));

        tokio::spawn(run_writer(Arc::clone(&repo), rx, settings.history_limit));

        info!(
            memory_capacity = settings.memory_capacity,
            write_queue_capacity = settings.write_queue_capacity,
            history_limit = settings.history_limit,
            "Traffic store started"
        );

        Self {
            ring: RwLock::new(VecDeque::with_capacity(settings.memory_capacity)),
            memory_capacity: settings.memory_capacity,
            max_body_size: settings.max_response_size,
            default_page_size: settings.default_page_size.max(1),
            queue,
            repo,
        }
    }

    /// Record a finalized entry and return it as stored.
    ///
    /// Bodies over the configured maximum are truncated first. The entry is
    /// visible in the ring on return; persistence happens in the background.
    pub async fn add_entry(&self, mut entry: TrafficEntry) -> TrafficEntry {
        self.prepare(&mut entry);

        // Ring push and queueing happen under one guard so a concurrent clear
        // sees both or neither
        let queued = {
            let mut ring = self.ring.write().await;
            if self.memory_capacity > 0 {
                while ring.len() >= self.memory_capacity {
                    ring.pop_front();
                }
                ring.push_back(entry.clone());
            }
            self.queue.try_send(WriteOp::Insert(entry.clone()))
        };

        match queued {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                Metrics::record_durability_drop();
                warn!(id = %entry.id, "Write queue full, entry kept in memory only");
            }
            Err(TrySendError::Closed(_)) => {
                Metrics::record_durability_drop();
                warn!(id = %entry.id, "Writer stopped, entry kept in memory only");
            }
        }
        entry
    }

    /// Bound entry bodies to the configured maximum size
    fn prepare(&self, entry: &mut TrafficEntry) {
        if truncate_body(&mut entry.request_body, self.max_body_size) {
            Metrics::record_truncation("request");
        }
        if truncate_body(&mut entry.response_body, self.max_body_size) {
            Metrics::record_truncation("response");
        }
    }

    /// Newest-first page and total count from durable storage.
    ///
    /// A `limit` of zero uses the default page size. When storage is
    /// unavailable the page is served from the in-memory ring instead.
    pub async fn get_page(&self, offset: usize, limit: usize) -> (Vec<TrafficEntry>, usize) {
        let limit = if limit == 0 {
            self.default_page_size
        } else {
            limit
        };

        match self.repo.get_traffic_page(offset, limit).await {
            Ok(page) => page,
            Err(e) => {
                Metrics::record_persistence_error("page");
                warn!(error = %e, "Failed to read traffic page, serving from memory");
                let ring = self.ring.read().await;
                let entries = ring.iter().rev().skip(offset).take(limit).cloned().collect();
                (entries, ring.len())
            }
        }
    }

    /// Most recent entries held in memory, newest first
    pub async fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        self.ring.read().await.iter().rev().take(limit).cloned().collect()
    }

    /// Delete all in-memory and persisted entries.
    ///
    /// The clear is queued behind any pending inserts, so entries added
    /// before this call do not reappear afterwards.
    pub async fn clear_entries(&self) -> Result<(), StorageError> {
        let (ack, done) = oneshot::channel();
        {
            let mut ring = self.ring.write().await;
            ring.clear();
            self.queue
                .send(WriteOp::Clear(ack))
                .await
                .map_err(|_| writer_stopped())?;
        }
        let result = done.await.map_err(|_| writer_stopped())?;

        match &result {
            Ok(()) => info!("Traffic cleared"),
            Err(e) => {
                Metrics::record_persistence_error("clear");
                warn!(error = %e, "Failed to clear persisted traffic");
            }
        }
        result
    }

    /// Wait until every entry queued before this call has been written
    pub async fn flush(&self) -> Result<(), StorageError> {
        let (ack, done) = oneshot::channel();
        self.queue
            .send(WriteOp::Flush(ack))
            .await
            .map_err(|_| writer_stopped())?;
        done.await.map_err(|_| writer_stopped())
    }
}

fn writer_stopped() -> StorageError {
    StorageError::Unavailable("traffic writer stopped".to_string())
}

/// Single writer: serialized inserts, pruning and clears
async fn run_writer(
    repo: Arc<dyn TrafficRepository>,
    mut rx: mpsc::Receiver<WriteOp>,
    history_limit: usize,
) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Insert(entry) => {
                if let Err(e) = repo.add_traffic_entry(&entry).await {
                    Metrics::record_persistence_error("insert");
                    warn!(id = %entry.id, error = %e, "Failed to persist traffic entry");
                    continue;
                }
                Metrics::record_persisted();

                if history_limit > 0 {
                    match repo.prune_traffic(history_limit).await {
                        Ok(0) => {}
                        Ok(pruned) => debug!(pruned, "Pruned traffic history"),
                        Err(e) => {
                            Metrics::record_persistence_error("prune");
                            warn!(error = %e, "Failed to prune traffic history");
                        }
                    }
                }
            }
            WriteOp::Clear(ack) => {
                let _ = ack.send(repo.clear_traffic().await);
            }
            WriteOp::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    debug!("Traffic writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TRUNCATION_MARKER;
    use crate::storage::MemoryRepository;

    fn settings() -> Settings {
        Settings {
            memory_capacity: 3,
            max_response_size: 16,
            ..Settings::default()
        }
    }

    fn store(repo: &Arc<MemoryRepository>, settings: &Settings) -> TrafficStore {
        TrafficStore::new(repo.clone(), settings)
    }

    #[tokio::test]
    async fn test_add_then_page() {
        let repo = Arc::new(MemoryRepository::new());
        let store = store(&repo, &settings());

        let entry = TrafficEntry::new("GET", "http://example.com/");
        let id = entry.id.clone();
        store.add_entry(entry).await;
        store.flush().await.unwrap();

        let (page, total) = store.get_page(0, 10).await;
        assert_eq!(total, 1);
        assert_eq!(page[0].id, id);
    }

    #[tokio::test]
    async fn test_ring_evicts_oldest() {
        let repo = Arc::new(MemoryRepository::new());
        let store = store(&repo, &settings());

        for i in 0..5 {
            store
                .add_entry(TrafficEntry::new("GET", format!("http://x/{i}")))
                .await;
        }

        let recent = store.recent(10).await;
        let urls: Vec<_> = recent.iter().map(|e| e.url.as_str()).collect();
        assert_eq!(urls, ["http://x/4", "http://x/3", "http://x/2"]);
    }

    #[tokio::test]
    async fn test_bodies_truncated_before_storing() {
        let repo = Arc::new(MemoryRepository::new());
        let store = store(&repo, &settings());

        let mut entry = TrafficEntry::new("GET", "http://x/");
        entry.response_body = "y".repeat(100);
        entry.request_body = "short".to_string();
        store.add_entry(entry).await;
        store.flush().await.unwrap();

        let (page, _) = store.get_page(0, 1).await;
        assert!(page[0].response_body.contains(TRUNCATION_MARKER));
        assert!(page[0].response_body.len() <= 16 + TRUNCATION_MARKER.len());
        assert_eq!(page[0].request_body, "short");
    }

    #[tokio::test]
    async fn test_clear_entries() {
        let repo = Arc::new(MemoryRepository::new());
        let store = store(&repo, &settings());

        store.add_entry(TrafficEntry::new("GET", "http://x/")).await;
        store.clear_entries().await.unwrap();

        let (page, total) = store.get_page(0, 10).await;
        assert!(page.is_empty());
        assert_eq!(total, 0);
        assert!(store.recent(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_history_limit_prunes_storage() {
        let repo = Arc::new(MemoryRepository::new());
        let settings = Settings {
            history_limit: 2,
            ..Settings::default()
        };
        let store = store(&repo, &settings);

        for i in 0..4 {
            store
                .add_entry(TrafficEntry::new("GET", format!("http://x/{i}")))
                .await;
        }
        store.flush().await.unwrap();

        let (_, total) = store.get_page(0, 10).await;
        assert_eq!(total, 2);
        assert_eq!(repo.insert_count(), 4);
    }

    #[tokio::test]
    async fn test_page_falls_back_to_memory() {
        let repo = Arc::new(MemoryRepository::new());
        let store = store(&repo, &settings());

        store.add_entry(TrafficEntry::new("GET", "http://x/")).await;
        store.flush().await.unwrap();
        repo.set_available(false);

        let (page, total) = store.get_page(0, 0).await;
        assert_eq!(total, 1);
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_from_durability_only() {
        let repo = Arc::new(MemoryRepository::new());
        let settings = Settings {
            write_queue_capacity: 1,
            memory_capacity: 100,
            ..Settings::default()
        };
        let store = store(&repo, &settings);

        // current_thread runtime: the writer cannot run until we yield
        for i in 0..10 {
            store
                .add_entry(TrafficEntry::new("GET", format!("http://x/{i}")))
                .await;
        }
        store.flush().await.unwrap();

        assert_eq!(store.recent(100).await.len(), 10);
        assert!(repo.insert_count() < 10);
    }

    #[tokio::test]
    async fn test_add_entry_returns_truncated_entry() {
        let repo = Arc::new(MemoryRepository::new());
        let store = store(&repo, &settings());

        let mut entry = TrafficEntry::new("GET", "http://x/");
        entry.response_body = "z".repeat(40);
        let stored = store.add_entry(entry).await;

        assert_eq!(stored.response_body, format!("{}{}", "z".repeat(16), TRUNCATION_MARKER));
        assert_eq!(store.recent(1).await[0], stored);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_clear_keeps_tiers_consistent_with_concurrent_adds() {
        let repo = Arc::new(MemoryRepository::new());
        let settings = Settings {
            memory_capacity: 1000,
            history_limit: 0,
            ..Settings::default()
        };
        let store = Arc::new(store(&repo, &settings));

        let mut producers = Vec::new();
        for worker in 0..4 {
            let store = store.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..50 {
                    store
                        .add_entry(TrafficEntry::new("GET", format!("http://x/{worker}/{i}")))
                        .await;
                    tokio::task::yield_now().await;
                }
            }));
        }

        for _ in 0..5 {
            store.clear_entries().await.unwrap();
            tokio::task::yield_now().await;
        }
        for producer in producers {
            producer.await.unwrap();
        }
        store.flush().await.unwrap();

        let mut in_memory: Vec<String> =
            store.recent(1000).await.into_iter().map(|e| e.id).collect();
        let (persisted, _) = store.get_page(0, 1000).await;
        let mut persisted: Vec<String> = persisted.into_iter().map(|e| e.id).collect();
        in_memory.sort();
        persisted.sort();
        assert_eq!(in_memory, persisted);
    }
}
