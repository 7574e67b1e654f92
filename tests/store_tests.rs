//! Storage Integration Tests
//!
//! Traffic history, rules and settings against the SQLite backend

use glance::capture::TRUNCATION_MARKER;
use glance::{
    BreakpointStrategy, MockResponse, Rule, RuleEngine, Settings, SqliteRepository,
    TrafficEntry, TrafficStore,
};
use std::sync::Arc;
use tempfile::TempDir;

async fn open(dir: &TempDir) -> Arc<SqliteRepository> {
    let path = dir.path().join("glance.db");
    Arc::new(
        SqliteRepository::new(path.to_str().unwrap())
            .await
            .unwrap(),
    )
}

fn entry(url: &str, status: u16) -> TrafficEntry {
    let mut entry = TrafficEntry::new("GET", url);
    entry.status = status;
    entry.response_body = format!("body of {url}");
    entry
}

/// Test 1: Entries are visible in memory at once and durable after a flush
#[tokio::test]
async fn test_add_entry_then_page() {
    let dir = TempDir::new().unwrap();
    let store = TrafficStore::new(open(&dir).await, &Settings::default());

    store.add_entry(entry("http://x.test/1", 200)).await;
    store.add_entry(entry("http://x.test/2", 404)).await;

    let recent = store.recent(10).await;
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].url, "http://x.test/2");

    store.flush().await.unwrap();
    let (page, total) = store.get_page(0, 10).await;
    assert_eq!(total, 2);
    assert_eq!(page[0].url, "http://x.test/2");
    assert_eq!(page[0].status, 404);
    assert_eq!(page[1].response_body, "body of http://x.test/1");

    let (second_page, total) = store.get_page(1, 10).await;
    assert_eq!(total, 2);
    assert_eq!(second_page.len(), 1);
    assert_eq!(second_page[0].url, "http://x.test/1");
}

/// Test 2: Concurrent producers lose nothing while the queue has room
#[tokio::test]
async fn test_concurrent_adds_all_persisted() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TrafficStore::new(open(&dir).await, &Settings::default()));

    let mut tasks = Vec::new();
    for i in 0..50 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.add_entry(entry(&format!("http://x.test/{i}"), 200)).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    store.flush().await.unwrap();
    let (page, total) = store.get_page(0, 100).await;
    assert_eq!(total, 50);
    assert_eq!(page.len(), 50);
}

/// Test 3: Clearing removes both tiers
#[tokio::test]
async fn test_clear_entries() {
    let dir = TempDir::new().unwrap();
    let store = TrafficStore::new(open(&dir).await, &Settings::default());

    for i in 0..5 {
        store.add_entry(entry(&format!("http://x.test/{i}"), 200)).await;
    }
    store.clear_entries().await.unwrap();

    assert!(store.recent(10).await.is_empty());
    let (page, total) = store.get_page(0, 10).await;
    assert!(page.is_empty());
    assert_eq!(total, 0);
}

/// Test 4: Oversized bodies are truncated before they are stored
#[tokio::test]
async fn test_large_bodies_truncated() {
    let dir = TempDir::new().unwrap();
    let settings = Settings {
        max_response_size: 64,
        ..Settings::default()
    };
    let store = TrafficStore::new(open(&dir).await, &settings);

    let mut large = entry("http://x.test/large", 200);
    large.response_body = "x".repeat(10_000);
    large.request_body = "small".to_string();
    store.add_entry(large).await;

    store.flush().await.unwrap();
    let (page, _) = store.get_page(0, 1).await;
    assert!(page[0].response_body.ends_with(TRUNCATION_MARKER));
    assert_eq!(page[0].response_body.len(), 64 + TRUNCATION_MARKER.len());
    assert_eq!(page[0].request_body, "small");
}

/// Test 5: Durable history is bounded by the history limit
#[tokio::test]
async fn test_history_limit_prunes_oldest() {
    let dir = TempDir::new().unwrap();
    let settings = Settings {
        history_limit: 3,
        ..Settings::default()
    };
    let store = TrafficStore::new(open(&dir).await, &settings);

    for i in 0..6 {
        store.add_entry(entry(&format!("http://x.test/{i}"), 200)).await;
    }

    store.flush().await.unwrap();
    let (page, total) = store.get_page(0, 10).await;
    assert_eq!(total, 3);
    assert_eq!(page[0].url, "http://x.test/5");
    assert_eq!(page[2].url, "http://x.test/3");
}

/// Test 6: History survives reopening the database
#[tokio::test]
async fn test_history_survives_restart() {
    let dir = TempDir::new().unwrap();

    {
        let store = TrafficStore::new(open(&dir).await, &Settings::default());
        store.add_entry(entry("http://x.test/kept", 201)).await;
        store.flush().await.unwrap();
    }

    let store = TrafficStore::new(open(&dir).await, &Settings::default());
    assert!(store.recent(10).await.is_empty());

    let (page, total) = store.get_page(0, 10).await;
    assert_eq!(total, 1);
    assert_eq!(page[0].url, "http://x.test/kept");
    assert_eq!(page[0].status, 201);
}

/// Test 7: Rules keep their order across restarts
#[tokio::test]
async fn test_rules_persist_in_order() {
    let dir = TempDir::new().unwrap();

    {
        let engine = RuleEngine::new(open(&dir).await).await;
        engine
            .add_rule(Rule::mock("api", MockResponse::new(200, "{}")).with_id("first"))
            .await
            .unwrap();
        engine
            .add_rule(Rule::breakpoint("api", BreakpointStrategy::Both).with_id("second"))
            .await
            .unwrap();
        engine
            .add_rule(Rule::mock("", MockResponse::new(404, "")).with_id("third"))
            .await
            .unwrap();
        engine.delete_rule("second").await.unwrap();
    }

    let engine = RuleEngine::new(open(&dir).await).await;
    let ids: Vec<String> = engine.get_rules().await.into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["first", "third"]);

    let matched = engine.match_request("GET", "http://x.test/api").await.unwrap();
    assert_eq!(matched.id, "first");
    assert_eq!(matched.response.as_ref().unwrap().body, "{}");
}

/// Test 8: Saved settings are loaded back, defaults otherwise
#[tokio::test]
async fn test_settings_round_trip_through_storage() {
    let dir = TempDir::new().unwrap();
    let repo = open(&dir).await;

    assert_eq!(Settings::load(repo.as_ref()).await, Settings::default());

    let settings = Settings {
        memory_capacity: 42,
        breakpoint_timeout_secs: Some(30),
        mock_cors_headers: true,
        ..Settings::default()
    };
    settings.save(repo.as_ref()).await.unwrap();

    let loaded = Settings::load(open(&dir).await.as_ref()).await;
    assert_eq!(loaded, settings);
}
