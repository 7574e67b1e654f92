//! Breakpoint Registry
//!
//! Tracks exchanges suspended for operator review. Each suspended exchange
//! owns a [`Suspension`] holding the receiving half of a oneshot channel; the
//! registry holds the sending half. Continue and abort remove the entry under
//! the lock and signal after releasing it, so every breakpoint is resolved at
//! most once and the waiting task never contends with the registry lock.
//!
//! The suspended task owns the live request or response. Operators send the
//! replacement values as a [`RequestEdit`] or [`ResponseEdit`] and the task
//! applies them to the message it holds.

use crate::metrics::Metrics;
use crate::model::TrafficEntry;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Which leg of the exchange is suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointKind {
    Request,
    Response,
}

impl BreakpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

impl fmt::Display for BreakpointKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BreakpointError {
    #[error("Exchange {id} is already suspended on the {kind} leg")]
    AlreadySuspended { id: String, kind: BreakpointKind },

    #[error("Invalid edit: {0}")]
    InvalidEdit(String),
}

/// Replacement values for a suspended request; `None` keeps the original
#[derive(Debug, Clone, Default)]
pub struct RequestEdit {
    pub method: Option<Method>,
    pub url: Option<String>,
    pub headers: Option<HeaderMap>,
    pub body: Option<Bytes>,
}

impl RequestEdit {
    /// Build an edit from control-surface values; empty strings keep the original
    pub fn from_parts(
        method: &str,
        url: &str,
        headers: Option<HeaderMap>,
        body: Option<impl Into<Bytes>>,
    ) -> Result<Self, BreakpointError> {
        let method = if method.is_empty() {
            None
        } else {
            Some(
                Method::from_bytes(method.as_bytes())
                    .map_err(|e| BreakpointError::InvalidEdit(format!("method {method:?}: {e}")))?,
            )
        };

        let url = if url.is_empty() {
            None
        } else {
            url.parse::<Uri>()
                .map_err(|e| BreakpointError::InvalidEdit(format!("url {url:?}: {e}")))?;
            Some(url.to_string())
        };

        Ok(Self {
            method,
            url,
            headers,
            body: body.map(Into::into),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.method.is_none() && self.url.is_none() && self.headers.is_none() && self.body.is_none()
    }

    /// Apply the edit to the held request
    pub fn apply(self, request: &mut Request<Bytes>) {
        if let Some(method) = self.method {
            *request.method_mut() = method;
        }

        if let Some(url) = self.url {
            match url.parse::<Uri>() {
                Ok(uri) => *request.uri_mut() = uri,
                Err(e) => warn!(url = %url, error = %e, "Ignoring invalid URL in request edit"),
            }
        }

        if let Some(headers) = self.headers {
            *request.headers_mut() = headers;
        }

        if let Some(body) = self.body {
            fix_content_length(request.headers_mut(), body.len());
            *request.body_mut() = body;
        }
    }
}

/// Replacement values for a suspended response; `None` keeps the original
#[derive(Debug, Clone, Default)]
pub struct ResponseEdit {
    pub status: Option<StatusCode>,
    pub headers: Option<HeaderMap>,
    pub body: Option<Bytes>,
}

impl ResponseEdit {
    /// Build an edit from control-surface values; a zero status keeps the original
    pub fn from_parts(
        status: u16,
        headers: Option<HeaderMap>,
        body: Option<impl Into<Bytes>>,
    ) -> Result<Self, BreakpointError> {
        let status = if status == 0 {
            None
        } else {
            Some(
                StatusCode::from_u16(status)
                    .map_err(|e| BreakpointError::InvalidEdit(format!("status {status}: {e}")))?,
            )
        };

        Ok(Self {
            status,
            headers,
            body: body.map(Into::into),
        })
    }

    /// Apply the edit to the held response
    pub fn apply(self, response: &mut Response<Bytes>) {
        if let Some(status) = self.status {
            *response.status_mut() = status;
        }

        if let Some(headers) = self.headers {
            *response.headers_mut() = headers;
        }

        if let Some(body) = self.body {
            fix_content_length(response.headers_mut(), body.len());
            *response.body_mut() = body;
        }
    }
}

fn fix_content_length(headers: &mut HeaderMap, len: usize) {
    headers.remove(TRANSFER_ENCODING);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
}

/// How a suspended exchange was resumed
#[derive(Debug)]
pub enum Resolution {
    /// Operator continued the request leg with replacement values
    ContinueRequest(RequestEdit),

    /// Operator continued the response leg with replacement values
    ContinueResponse(ResponseEdit),

    /// Operator aborted the exchange
    Abort,

    /// Released unmodified (shutdown or registry cleanup)
    Release,

    /// Not resolved before the configured timeout; resumes unmodified
    Expired,
}

impl Resolution {
    /// Whether an operator acted on the exchange
    pub fn is_operator_action(&self) -> bool {
        matches!(
            self,
            Self::ContinueRequest(_) | Self::ContinueResponse(_) | Self::Abort
        )
    }
}

/// Observer snapshot of a suspended exchange
#[derive(Debug, Clone, Serialize)]
pub struct BreakpointView {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BreakpointKind,
    pub entry: TrafficEntry,
    pub registered_at: DateTime<Utc>,
}

struct Suspended {
    kind: BreakpointKind,
    entry: TrafficEntry,
    registered_at: DateTime<Utc>,
    resume: oneshot::Sender<Resolution>,
}

impl Suspended {
    fn view(&self, id: &str) -> BreakpointView {
        BreakpointView {
            id: id.to_string(),
            kind: self.kind,
            entry: self.entry.clone(),
            registered_at: self.registered_at,
        }
    }
}

#[derive(Default)]
pub struct BreakpointRegistry {
    pending: RwLock<HashMap<String, Suspended>>,
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend an exchange.
    ///
    /// Returns the handle the suspended task waits on. Dropping the handle
    /// before resolution removes the breakpoint.
    pub fn register(
        self: &Arc<Self>,
        kind: BreakpointKind,
        entry: TrafficEntry,
    ) -> Result<Suspension, BreakpointError> {
        let id = entry.id.clone();
        let (resume, rx) = oneshot::channel();

        {
            let mut pending = self.write();
            if let Some(existing) = pending.get(&id) {
                return Err(BreakpointError::AlreadySuspended {
                    id,
                    kind: existing.kind,
                });
            }
            pending.insert(
                id.clone(),
                Suspended {
                    kind,
                    entry,
                    registered_at: Utc::now(),
                    resume,
                },
            );
        }

        Metrics::record_breakpoint_registered(kind.as_str());
        info!(id = %id, kind = %kind, "Exchange suspended on breakpoint");

        Ok(Suspension {
            id,
            kind,
            rx,
            registry: Arc::clone(self),
        })
    }

    pub fn get(&self, id: &str) -> Option<BreakpointView> {
        self.read().get(id).map(|s| s.view(id))
    }

    /// All suspended exchanges, oldest first
    pub fn list(&self) -> Vec<BreakpointView> {
        let mut views: Vec<_> = self.read().iter().map(|(id, s)| s.view(id)).collect();
        views.sort_by_key(|v| v.registered_at);
        views
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Resume a request-leg breakpoint with replacement values.
    ///
    /// Returns false when no request-leg breakpoint with this id is suspended.
    pub fn continue_request(&self, id: &str, edit: RequestEdit) -> bool {
        self.resolve(
            id,
            Some(BreakpointKind::Request),
            Resolution::ContinueRequest(edit),
            "continued",
        )
    }

    /// Resume a response-leg breakpoint with replacement values.
    ///
    /// Returns false when no response-leg breakpoint with this id is suspended.
    pub fn continue_response(&self, id: &str, edit: ResponseEdit) -> bool {
        self.resolve(
            id,
            Some(BreakpointKind::Response),
            Resolution::ContinueResponse(edit),
            "continued",
        )
    }

    /// Abort a suspended exchange on either leg
    pub fn abort(&self, id: &str) -> bool {
        self.resolve(id, None, Resolution::Abort, "aborted")
    }

    /// Resume every suspended exchange unmodified; returns how many were released
    pub fn release_all(&self) -> usize {
        let drained: Vec<(String, Suspended)> = self.write().drain().collect();

        let mut released = 0;
        for (id, suspended) in drained {
            Metrics::record_breakpoint_resolved("released");
            if suspended.resume.send(Resolution::Release).is_ok() {
                released += 1;
            }
            debug!(id = %id, "Breakpoint released");
        }

        if released > 0 {
            info!(released, "Released suspended exchanges");
        }
        released
    }

    /// Remove a breakpoint that timed out; false if it was resolved first
    fn expire(&self, id: &str, kind: BreakpointKind) -> bool {
        if self.take(id, Some(kind)).is_some() {
            Metrics::record_breakpoint_resolved("expired");
            warn!(id = %id, kind = %kind, "Breakpoint expired, resuming unmodified");
            true
        } else {
            false
        }
    }

    fn resolve(
        &self,
        id: &str,
        expected: Option<BreakpointKind>,
        resolution: Resolution,
        outcome: &str,
    ) -> bool {
        // Removed under the lock, signalled outside it
        let Some(suspended) = self.take(id, expected) else {
            debug!(id = %id, outcome, "No matching suspended breakpoint");
            return false;
        };

        Metrics::record_breakpoint_resolved(outcome);
        let delivered = suspended.resume.send(resolution).is_ok();
        if delivered {
            info!(id = %id, kind = %suspended.kind, outcome, "Breakpoint resolved");
        } else {
            warn!(id = %id, "Suspended exchange went away before it could be resumed");
        }
        delivered
    }

    fn take(&self, id: &str, expected: Option<BreakpointKind>) -> Option<Suspended> {
        let mut pending = self.write();
        match pending.get(id) {
            Some(s) if expected.map_or(true, |kind| kind == s.kind) => pending.remove(id),
            Some(s) => {
                warn!(
                    id = %id,
                    suspended = %s.kind,
                    "Continue targeted the wrong leg, breakpoint left suspended"
                );
                None
            }
            None => None,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Suspended>> {
        self.pending.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Suspended>> {
        self.pending.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle held by the suspended task
pub struct Suspension {
    id: String,
    kind: BreakpointKind,
    rx: oneshot::Receiver<Resolution>,
    registry: Arc<BreakpointRegistry>,
}

impl Suspension {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> BreakpointKind {
        self.kind
    }

    /// Wait for an operator decision, or for `timeout` when one is set
    pub async fn wait(mut self, timeout: Option<Duration>) -> Resolution {
        let received = match timeout {
            None => (&mut self.rx).await,
            Some(limit) => match tokio::time::timeout(limit, &mut self.rx).await {
                Ok(received) => received,
                Err(_) => {
                    if self.registry.expire(&self.id, self.kind) {
                        return Resolution::Expired;
                    }
                    // Resolved concurrently with the timeout; the decision is in flight
                    (&mut self.rx).await
                }
            },
        };

        received.unwrap_or(Resolution::Release)
    }
}

impl Drop for Suspension {
    fn drop(&mut self) {
        // Waiting task cancelled before resolution
        if self.registry.take(&self.id, Some(self.kind)).is_some() {
            Metrics::record_breakpoint_resolved("cancelled");
            debug!(id = %self.id, "Suspended exchange dropped, breakpoint removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<BreakpointRegistry> {
        Arc::new(BreakpointRegistry::new())
    }

    fn entry(id: &str) -> TrafficEntry {
        let mut entry = TrafficEntry::new("GET", "http://example.com/");
        entry.id = id.to_string();
        entry
    }

    fn request() -> Request<Bytes> {
        Request::builder()
            .method("GET")
            .uri("http://example.com/")
            .header("x-original", "1")
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_continue_request_delivers_edit() {
        let registry = registry();
        let suspension = registry.register(BreakpointKind::Request, entry("a")).unwrap();
        assert!(registry.get("a").is_some());

        let edit = RequestEdit::from_parts("POST", "http://x", None, Some("body")).unwrap();
        assert!(registry.continue_request("a", edit));
        assert!(registry.get("a").is_none());

        let mut req = request();
        match suspension.wait(None).await {
            Resolution::ContinueRequest(edit) => edit.apply(&mut req),
            other => panic!("unexpected resolution {other:?}"),
        }

        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.uri(), "http://x/");
        assert_eq!(req.body(), &Bytes::from("body"));
        assert_eq!(req.headers()["x-original"], "1");
        assert_eq!(req.headers()[CONTENT_LENGTH], "4");
    }

    #[tokio::test]
    async fn test_resolution_happens_once() {
        let registry = registry();
        let suspension = registry.register(BreakpointKind::Request, entry("a")).unwrap();

        assert!(registry.abort("a"));
        assert!(!registry.abort("a"));
        assert!(!registry.continue_request("a", RequestEdit::default()));

        assert!(matches!(suspension.wait(None).await, Resolution::Abort));
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let registry = registry();
        assert!(registry.get("missing").is_none());
        assert!(!registry.abort("missing"));
        assert!(!registry.continue_response("missing", ResponseEdit::default()));
    }

    #[tokio::test]
    async fn test_wrong_leg_leaves_breakpoint_suspended() {
        let registry = registry();
        let _suspension = registry.register(BreakpointKind::Response, entry("a")).unwrap();

        assert!(!registry.continue_request("a", RequestEdit::default()));
        assert_eq!(registry.get("a").unwrap().kind, BreakpointKind::Response);
        assert!(registry.continue_response("a", ResponseEdit::default()));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = registry();
        let _first = registry.register(BreakpointKind::Request, entry("a")).unwrap();

        assert!(matches!(
            registry.register(BreakpointKind::Request, entry("a")),
            Err(BreakpointError::AlreadySuspended { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropped_suspension_is_removed() {
        let registry = registry();
        let suspension = registry.register(BreakpointKind::Request, entry("a")).unwrap();
        drop(suspension);

        assert!(registry.is_empty());
        assert!(!registry.abort("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_expires_unmodified() {
        let registry = registry();
        let suspension = registry.register(BreakpointKind::Request, entry("a")).unwrap();

        let resolution = suspension.wait(Some(Duration::from_secs(5))).await;
        assert!(matches!(resolution, Resolution::Expired));
        assert!(!resolution.is_operator_action());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_release_all() {
        let registry = registry();
        let a = registry.register(BreakpointKind::Request, entry("a")).unwrap();
        let b = registry.register(BreakpointKind::Response, entry("b")).unwrap();
        assert_eq!(registry.list().len(), 2);

        assert_eq!(registry.release_all(), 2);
        assert!(matches!(a.wait(None).await, Resolution::Release));
        assert!(matches!(b.wait(None).await, Resolution::Release));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_continue_from_another_task() {
        let registry = registry();
        let suspension = registry.register(BreakpointKind::Response, entry("a")).unwrap();

        let operator = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let edit = ResponseEdit::from_parts(418, None, Some("teapot")).unwrap();
                registry.continue_response("a", edit)
            })
        };

        let mut resp = Response::new(Bytes::from("original"));
        match suspension.wait(None).await {
            Resolution::ContinueResponse(edit) => edit.apply(&mut resp),
            other => panic!("unexpected resolution {other:?}"),
        }
        assert!(operator.await.unwrap());
        assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(resp.body(), &Bytes::from("teapot"));
    }

    #[test]
    fn test_edit_parsing() {
        assert!(RequestEdit::from_parts("", "", None, None::<Bytes>)
            .unwrap()
            .is_empty());
        assert!(RequestEdit::from_parts("BAD METHOD", "", None, None::<Bytes>).is_err());
        assert!(RequestEdit::from_parts("", "http://exa mple.com", None, None::<Bytes>).is_err());
        assert!(ResponseEdit::from_parts(1000, None, None::<Bytes>).is_err());
        assert!(ResponseEdit::from_parts(0, None, None::<Bytes>)
            .unwrap()
            .status
            .is_none());
    }
}
