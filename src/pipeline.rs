//! Proxy Pipeline
//!
//! Request and response hooks wired into the MITM transport:
//! 1. Capture the request into a [`TrafficEntry`] without consuming it
//! 2. Answer CORS preflights for intercepted URLs locally
//! 3. Apply the first matching rule: mock, breakpoint or pass-through
//! 4. On the response leg, honour response breakpoints, finalize the entry,
//!    store it and publish it
//!
//! Each hook runs its work on a separate task so that a fault while handling
//! one exchange fails only that exchange.

use crate::breakpoint::{BreakpointKind, BreakpointRegistry, BreakpointView, Resolution};
use crate::capture::{entry_for_request, record_response, update_request};
use crate::config::Settings;
use crate::metrics::Metrics;
use crate::model::{MockResponse, ModifiedBy, RuleType, TrafficEntry};
use crate::rules::RuleEngine;
use crate::store::TrafficStore;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_METHOD,
    CONTENT_TYPE,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

/// Invoked once an exchange is finalized
pub type EntryCallback = Arc<dyn Fn(&TrafficEntry) + Send + Sync>;

/// Invoked the moment an exchange is suspended on a breakpoint
pub type InterceptCallback = Arc<dyn Fn(&BreakpointView) + Send + Sync>;

/// Body of the response returned when an operator aborts a request
pub const ABORTED_BODY: &str = "Request aborted by user";

const FAULT_BODY: &str = "Proxy failed to process the exchange";
const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS, PATCH";
const CORS_MAX_AGE: &str = "86400";

/// Result of the request hook
#[derive(Debug)]
pub enum RequestOutcome {
    /// Send this (possibly edited) request upstream
    Forward(Request<Bytes>),

    /// Answer the caller directly; nothing is sent upstream
    Respond(Response<Bytes>),
}

impl RequestOutcome {
    pub fn into_request(self) -> Option<Request<Bytes>> {
        match self {
            Self::Forward(request) => Some(request),
            Self::Respond(_) => None,
        }
    }

    pub fn into_response(self) -> Option<Response<Bytes>> {
        match self {
            Self::Forward(_) => None,
            Self::Respond(response) => Some(response),
        }
    }
}

/// Per-exchange state carried from the request hook to the response hook
#[derive(Debug, Default)]
pub struct ExchangeContext {
    entry: Option<TrafficEntry>,
}

impl ExchangeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry awaiting its response, if the request was forwarded
    pub fn entry(&self) -> Option<&TrafficEntry> {
        self.entry.as_ref()
    }
}

/// Extension points consumed by the MITM transport
#[async_trait]
pub trait ExchangeHandler: Send + Sync {
    /// Called with every decrypted outbound request
    async fn handle_request(
        &self,
        request: Request<Bytes>,
        ctx: &mut ExchangeContext,
    ) -> RequestOutcome;

    /// Called with every upstream response before it reaches the caller;
    /// `None` when the upstream exchange failed
    async fn handle_response(
        &self,
        response: Option<Response<Bytes>>,
        ctx: &mut ExchangeContext,
    ) -> Option<Response<Bytes>>;
}

#[derive(Clone)]
pub struct Pipeline {
    rules: Arc<RuleEngine>,
    breakpoints: Arc<BreakpointRegistry>,
    store: Arc<TrafficStore>,
    on_entry: Option<EntryCallback>,
    on_intercept: Option<InterceptCallback>,
    breakpoint_timeout: Option<Duration>,
    mock_cors_headers: bool,
}

impl Pipeline {
    pub fn new(
        rules: Arc<RuleEngine>,
        breakpoints: Arc<BreakpointRegistry>,
        store: Arc<TrafficStore>,
        settings: &Settings,
    ) -> Self {
        Self {
            rules,
            breakpoints,
            store,
            on_entry: None,
            on_intercept: None,
            breakpoint_timeout: settings.breakpoint_timeout(),
            mock_cors_headers: settings.mock_cors_headers,
        }
    }

    pub fn with_entry_callback(mut self, callback: EntryCallback) -> Self {
        self.on_entry = Some(callback);
        self
    }

    pub fn with_intercept_callback(mut self, callback: InterceptCallback) -> Self {
        self.on_intercept = Some(callback);
        self
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.rules
    }

    pub fn breakpoints(&self) -> &Arc<BreakpointRegistry> {
        &self.breakpoints
    }

    pub fn store(&self) -> &Arc<TrafficStore> {
        &self.store
    }

    async fn process_request(
        self,
        mut request: Request<Bytes>,
    ) -> (RequestOutcome, Option<TrafficEntry>) {
        let mut entry = entry_for_request(&request);

        if request.method() == Method::OPTIONS {
            if let Some(response) = self.preflight(&request).await {
                self.finish(entry, &response).await;
                return (RequestOutcome::Respond(response), None);
            }
        }

        let Some(rule) = self.rules.match_request(&entry.method, &entry.url).await else {
            return (RequestOutcome::Forward(request), Some(entry));
        };

        match rule.rule_type {
            RuleType::Mock => {
                let Some(mock) = rule.response.as_ref() else {
                    warn!(rule = %rule.id, "Mock rule has no response, passing through");
                    return (RequestOutcome::Forward(request), Some(entry));
                };

                let response = mock_response(mock, self.mock_cors_headers);
                entry.modified_by = Some(ModifiedBy::Mock);
                Metrics::record_mock();
                info!(
                    id = %entry.id,
                    method = %entry.method,
                    url = %entry.url,
                    status = response.status().as_u16(),
                    "Mocked response"
                );

                self.finish(entry, &response).await;
                (RequestOutcome::Respond(response), None)
            }
            RuleType::Breakpoint if rule.strategy.pauses_request() => {
                match self.suspend(BreakpointKind::Request, &entry).await {
                    Some(Resolution::ContinueRequest(edit)) => {
                        edit.apply(&mut request);
                        update_request(&mut entry, &request);
                        entry.modified_by = Some(ModifiedBy::Breakpoint);
                        (RequestOutcome::Forward(request), Some(entry))
                    }
                    Some(Resolution::Abort) => {
                        entry.modified_by = Some(ModifiedBy::Breakpoint);
                        let response = text_response(StatusCode::BAD_GATEWAY, ABORTED_BODY);
                        self.finish(entry, &response).await;
                        (RequestOutcome::Respond(response), None)
                    }
                    _ => (RequestOutcome::Forward(request), Some(entry)),
                }
            }
            RuleType::Breakpoint => (RequestOutcome::Forward(request), Some(entry)),
        }
    }

    async fn process_response(
        self,
        mut response: Response<Bytes>,
        mut entry: TrafficEntry,
    ) -> Response<Bytes> {
        let rule = self.rules.match_request(&entry.method, &entry.url).await;

        if let Some(rule) = rule {
            if rule.rule_type == RuleType::Breakpoint && rule.strategy.pauses_response() {
                // Observers see the response as it arrived from upstream
                record_response(&mut entry, &response);

                match self.suspend(BreakpointKind::Response, &entry).await {
                    Some(Resolution::ContinueResponse(edit)) => {
                        edit.apply(&mut response);
                        entry.modified_by = Some(ModifiedBy::Breakpoint);
                    }
                    // The held response is released as-is
                    Some(Resolution::Abort) => {
                        entry.modified_by = Some(ModifiedBy::Breakpoint);
                    }
                    _ => {}
                }
            }
        }

        self.finish(entry, &response).await;
        response
    }

    /// Register a breakpoint, notify observers and wait for its resolution.
    ///
    /// `None` when the breakpoint could not be registered; the exchange then
    /// passes through untouched.
    async fn suspend(&self, kind: BreakpointKind, entry: &TrafficEntry) -> Option<Resolution> {
        let suspension = match self.breakpoints.register(kind, entry.clone()) {
            Ok(suspension) => suspension,
            Err(e) => {
                warn!(id = %entry.id, error = %e, "Breakpoint not registered, passing through");
                return None;
            }
        };

        if let Some(on_intercept) = &self.on_intercept {
            if let Some(view) = self.breakpoints.get(&entry.id) {
                on_intercept(&view);
            }
        }

        let resolution = suspension.wait(self.breakpoint_timeout).await;
        debug!(id = %entry.id, kind = %kind, ?resolution, "Exchange resumed");
        Some(resolution)
    }

    /// Answer a CORS preflight locally when a rule covers the requested method
    async fn preflight(&self, request: &Request<Bytes>) -> Option<Response<Bytes>> {
        let url = request.uri().to_string();
        let requested = request
            .headers()
            .get(ACCESS_CONTROL_REQUEST_METHOD)
            .and_then(|v| v.to_str().ok())
            .filter(|method| !method.is_empty());

        let mut matched = None;
        if let Some(method) = requested {
            matched = self.rules.match_request(method, &url).await;
        }
        if matched.is_none() {
            matched = self.rules.match_request(Method::OPTIONS.as_str(), &url).await;
        }
        let rule = matched?;

        Metrics::record_preflight();
        debug!(url = %url, rule = %rule.id, "Answered CORS preflight");
        Some(preflight_response())
    }

    /// Finalize, store and publish an entry
    async fn finish(&self, mut entry: TrafficEntry, response: &Response<Bytes>) {
        record_response(&mut entry, response);
        self.publish(entry).await;
    }

    /// Store the entry, then notify observers with the stored form
    async fn publish(&self, entry: TrafficEntry) {
        let entry = self.store.add_entry(entry).await;

        Metrics::record_exchange(&entry.method, entry.status, entry.duration.as_secs_f64());
        debug!(
            id = %entry.id,
            method = %entry.method,
            url = %entry.url,
            status = entry.status,
            duration_ms = entry.duration.as_millis() as u64,
            "Exchange captured"
        );

        if let Some(on_entry) = &self.on_entry {
            on_entry(&entry);
        }
    }
}

#[async_trait]
impl ExchangeHandler for Pipeline {
    async fn handle_request(
        &self,
        request: Request<Bytes>,
        ctx: &mut ExchangeContext,
    ) -> RequestOutcome {
        let task = AbortOnDrop(tokio::spawn(self.clone().process_request(request)));

        match task.await {
            Ok((outcome, entry)) => {
                ctx.entry = entry;
                outcome
            }
            Err(e) => {
                ctx.entry = None;
                report_fault(&e, "request");
                RequestOutcome::Respond(text_response(StatusCode::BAD_GATEWAY, FAULT_BODY))
            }
        }
    }

    async fn handle_response(
        &self,
        response: Option<Response<Bytes>>,
        ctx: &mut ExchangeContext,
    ) -> Option<Response<Bytes>> {
        let entry = ctx.entry.take();

        let Some(response) = response else {
            // Upstream failed; keep what was captured of the request
            if let Some(mut entry) = entry {
                debug!(id = %entry.id, url = %entry.url, "No upstream response");
                entry.duration = entry.elapsed();
                self.publish(entry).await;
            }
            return None;
        };

        let Some(entry) = entry else {
            return Some(response);
        };

        let task = AbortOnDrop(tokio::spawn(self.clone().process_response(response, entry)));
        match task.await {
            Ok(response) => Some(response),
            Err(e) => {
                report_fault(&e, "response");
                Some(text_response(StatusCode::BAD_GATEWAY, FAULT_BODY))
            }
        }
    }
}

/// Cancels the pipeline task when the transport stops waiting for it
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn report_fault(err: &JoinError, phase: &str) {
    if err.is_panic() {
        Metrics::record_panic();
        error!(phase, "Pipeline panicked, failing this exchange");
    } else {
        warn!(phase, "Pipeline task cancelled, failing this exchange");
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from_static(body.as_bytes()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn preflight_response() -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = StatusCode::NO_CONTENT;

    let headers = response.headers_mut();
    insert_cors_headers(headers);
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(CORS_MAX_AGE));
    response
}

/// Build the configured mock response; headers are taken exactly as configured
fn mock_response(mock: &MockResponse, cors: bool) -> Response<Bytes> {
    let mut response = Response::new(Bytes::from(mock.body.clone()));
    *response.status_mut() = mock.status_code();

    let headers = response.headers_mut();
    for (name, value) in &mock.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid mock response header"),
        }
    }

    if cors {
        insert_cors_headers(headers);
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
    response
}

fn insert_cors_headers(headers: &mut HeaderMap) {
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
}
