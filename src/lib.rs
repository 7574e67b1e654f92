//! Glance - Intercepting HTTP(S) Proxy Core
//!
//! Glance is the engine behind an interactive debugging proxy: it captures
//! every exchange that passes through a MITM transport, lets operators mock
//! or pause traffic with rules, and streams what it sees to live observers.
//!
//! ## Features
//!
//! - **Traffic capture**: request/response bodies cloned without draining, binary bodies tagged as base64
//! - **Mock rules**: canned responses that never reach the upstream server
//! - **Breakpoints**: suspend a request or response until an operator continues (with edits) or aborts it
//! - **Tiered traffic store**: bounded in-memory ring plus a single-writer durable log in SQLite
//! - **Event hub**: fan-out of traffic and interception events to any number of subscribers
//! - **Replay**: resend edited requests through a plain/TLS HTTP/1.1 client
//! - **Metrics**: Prometheus-compatible counters
//!
//! ## Usage
//!
//! ```rust,no_run
//! use glance::{
//!     BreakpointRegistry, EventHub, ExchangeContext, ExchangeHandler, Pipeline, RuleEngine,
//!     Settings, SqliteRepository, TrafficStore,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::from_env()?;
//!     let repo = Arc::new(SqliteRepository::new("glance.db").await?);
//!
//!     let rules = Arc::new(RuleEngine::new(repo.clone()).await);
//!     let store = Arc::new(TrafficStore::new(repo.clone(), &settings));
//!     let hub = EventHub::new(settings.hub_queue_capacity);
//!
//!     let pipeline = Pipeline::new(rules, Arc::new(BreakpointRegistry::new()), store, &settings)
//!         .with_entry_callback(hub.entry_callback())
//!         .with_intercept_callback(hub.intercept_callback());
//!
//!     // Hand `pipeline` to the MITM transport; per connection:
//!     let mut ctx = ExchangeContext::new();
//!     let request = http::Request::builder()
//!         .uri("http://example.com/")
//!         .body(bytes::Bytes::new())?;
//!     let _outcome = pipeline.handle_request(request, &mut ctx).await;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Glance is a library; the MITM transport, REST/WebSocket control surface and
//! dashboard embed it:
//!
//! - `pipeline` - request/response hooks for the transport
//! - `rules` - ordered first-match rule engine
//! - `breakpoint` - registry of suspended exchanges
//! - `store` - traffic store and durability worker
//! - `hub` - event fan-out
//! - `storage` - repository traits, SQLite and in-memory backends
//! - `replay` / `http_client` - manual request replay

// Core interception
pub mod breakpoint;
pub mod capture;
pub mod pipeline;
pub mod rules;

// Data model and configuration
pub mod config;
pub mod model;

// Traffic history and persistence
pub mod storage;
pub mod store;

// Live events
pub mod hub;

// Replay
pub mod http_client;
pub mod replay;

// Observability
pub mod metrics;
pub mod telemetry;

// Re-export commonly used types

/// Configuration types
pub use config::Settings;

/// Data model
pub use model::{BreakpointStrategy, MockResponse, ModifiedBy, Rule, RuleType, TrafficEntry};

/// Rule engine
pub use rules::{RuleEngine, RuleError};

/// Breakpoints
pub use breakpoint::{
    BreakpointError, BreakpointKind, BreakpointRegistry, BreakpointView, RequestEdit, Resolution,
    ResponseEdit, Suspension,
};

/// Pipeline and transport seam
pub use pipeline::{
    EntryCallback, ExchangeContext, ExchangeHandler, InterceptCallback, Pipeline, RequestOutcome,
};

/// Body capture
pub use capture::{buffer_request, buffer_response, CaptureError, TRUNCATION_MARKER};

/// Traffic store and storage backends
pub use storage::{
    ConfigRepository, MemoryRepository, RuleRepository, SqliteRepository, StorageError,
    TrafficRepository,
};
pub use store::TrafficStore;

/// Event hub
pub use hub::{DeliveryError, EventHub, HubError, HubMessage, Subscriber, SubscriberId};

/// Replay
pub use http_client::{ClientSettings, HttpClientError, HttpUpstream};
pub use replay::{ReplayError, ReplayRequest, ReplayService, Upstream};

/// Metrics
pub use metrics::Metrics;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "glance");
    }
}
