//! Manual request replay
//!
//! Sends a request composed (or edited) by an operator straight to the
//! upstream server, bypassing rules and breakpoints, and records the
//! exchange tagged as coming from the editor.

use crate::capture::{entry_for_request, record_response};
use crate::http_client::HttpClientError;
use crate::model::{header_serde, ModifiedBy, TrafficEntry};
use crate::pipeline::EntryCallback;
use crate::store::TrafficStore;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, Uri};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Sends a single request to its upstream server
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpClientError>;
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upstream request failed: {0}")]
    Upstream(#[from] HttpClientError),
}

/// Request as composed in the editor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub method: String,
    pub url: String,

    #[serde(default, with = "header_serde")]
    pub headers: HeaderMap,

    #[serde(default)]
    pub body: String,
}

impl ReplayRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: HeaderMap::new(),
            body: String::new(),
        }
    }

    fn into_http(self) -> Result<Request<Bytes>, ReplayError> {
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|e| ReplayError::InvalidRequest(format!("method {:?}: {}", self.method, e)))?;

        let uri: Uri = self
            .url
            .parse()
            .map_err(|e| ReplayError::InvalidRequest(format!("url {:?}: {}", self.url, e)))?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(ReplayError::InvalidRequest(format!(
                "url {:?} must be absolute",
                self.url
            )));
        }

        let mut request = Request::new(Bytes::from(self.body));
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        *request.headers_mut() = self.headers;
        Ok(request)
    }
}

pub struct ReplayService {
    upstream: Arc<dyn Upstream>,
    store: Arc<TrafficStore>,
    on_entry: Option<EntryCallback>,
}

impl ReplayService {
    pub fn new(upstream: Arc<dyn Upstream>, store: Arc<TrafficStore>) -> Self {
        Self {
            upstream,
            store,
            on_entry: None,
        }
    }

    pub fn with_entry_callback(mut self, callback: EntryCallback) -> Self {
        self.on_entry = Some(callback);
        self
    }

    /// Send the request and record the exchange.
    ///
    /// Nothing is recorded when the upstream request fails.
    pub async fn execute(&self, replay: ReplayRequest) -> Result<TrafficEntry, ReplayError> {
        let request = replay.into_http()?;

        let mut entry = entry_for_request(&request);
        entry.modified_by = Some(ModifiedBy::Editor);

        let response = match self.upstream.send(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(method = %entry.method, url = %entry.url, error = %e, "Replay failed");
                return Err(e.into());
            }
        };

        record_response(&mut entry, &response);
        let entry = self.store.add_entry(entry).await;

        info!(
            id = %entry.id,
            method = %entry.method,
            url = %entry.url,
            status = entry.status,
            "Replayed request"
        );

        if let Some(on_entry) = &self.on_entry {
            on_entry(&entry);
        }

        Ok(entry)
    }
}
