//! Core data model: captured traffic and interception rules

use chrono::{DateTime, Utc};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Which operator action altered a captured exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifiedBy {
    /// Response synthesized from a mock rule
    Mock,

    /// Edited (or aborted) while suspended on a breakpoint
    Breakpoint,

    /// Sent manually through the request editor
    Editor,
}

impl ModifiedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::Breakpoint => "breakpoint",
            Self::Editor => "editor",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mock" => Some(Self::Mock),
            "breakpoint" => Some(Self::Breakpoint),
            "editor" => Some(Self::Editor),
            _ => None,
        }
    }
}

impl fmt::Display for ModifiedBy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single captured request/response exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficEntry {
    /// Unique ID (UUID v4)
    pub id: String,

    /// HTTP method
    pub method: String,

    /// Full request URL
    pub url: String,

    /// Request headers
    #[serde(with = "header_serde")]
    pub request_headers: HeaderMap,

    /// Request body (text, or `data:<type>;base64,...` for binary content)
    pub request_body: String,

    /// Response status (0 until the response arrives)
    pub status: u16,

    /// Response headers
    #[serde(with = "header_serde")]
    pub response_headers: HeaderMap,

    /// Response body, same encoding rule as the request body
    pub response_body: String,

    /// When the request was first observed
    pub start_time: DateTime<Utc>,

    /// Elapsed time from `start_time` to finalization
    #[serde(with = "duration_ms")]
    pub duration: Duration,

    /// Set when an operator action altered the exchange
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<ModifiedBy>,
}

impl TrafficEntry {
    /// Create an entry for a freshly observed request
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            url: url.into(),
            request_headers: HeaderMap::new(),
            request_body: String::new(),
            status: 0,
            response_headers: HeaderMap::new(),
            response_body: String::new(),
            start_time: Utc::now(),
            duration: Duration::ZERO,
            modified_by: None,
        }
    }

    /// Time elapsed since the request was observed
    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.start_time).to_std().unwrap_or_default()
    }

    /// Whether a response has been recorded
    pub fn is_complete(&self) -> bool {
        self.status != 0
    }
}

/// Kind of interception rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    /// Return a canned response without contacting upstream
    Mock,

    /// Suspend the exchange for operator review
    Breakpoint,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::Breakpoint => "breakpoint",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mock" => Some(Self::Mock),
            "breakpoint" => Some(Self::Breakpoint),
            _ => None,
        }
    }
}

/// Which leg of an exchange a breakpoint pauses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointStrategy {
    /// Pause before the request is sent upstream
    #[default]
    Request,

    /// Pause after the upstream response arrives
    Response,

    /// Pause on both legs
    Both,
}

impl BreakpointStrategy {
    pub fn pauses_request(&self) -> bool {
        matches!(self, Self::Request | Self::Both)
    }

    pub fn pauses_response(&self) -> bool {
        matches!(self, Self::Response | Self::Both)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Both => "both",
        }
    }

    /// Parse a stored strategy; an empty value means the request leg
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "request" => Some(Self::Request),
            "response" => Some(Self::Response),
            "both" => Some(Self::Both),
            _ => None,
        }
    }
}

/// Static response returned by a mock rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockResponse {
    pub status: u16,

    #[serde(default)]
    pub headers: Vec<(String, String)>,

    #[serde(default)]
    pub body: String,
}

impl MockResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Status as an HTTP status code, falling back to 200 for out-of-range values
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }
}

/// Interception rule: a predicate plus an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule ID (assigned on creation when empty)
    #[serde(default)]
    pub id: String,

    #[serde(rename = "type")]
    pub rule_type: RuleType,

    /// Substring matched against the request URL ("" matches everything)
    #[serde(default)]
    pub url_pattern: String,

    /// Exact method filter ("" matches any method)
    #[serde(default)]
    pub method: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Breakpoint leg selection (breakpoint rules only)
    #[serde(default)]
    pub strategy: BreakpointStrategy,

    /// Canned response (mock rules only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<MockResponse>,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Create a mock rule
    pub fn mock(url_pattern: impl Into<String>, response: MockResponse) -> Self {
        Self {
            id: String::new(),
            rule_type: RuleType::Mock,
            url_pattern: url_pattern.into(),
            method: String::new(),
            enabled: true,
            strategy: BreakpointStrategy::default(),
            response: Some(response),
        }
    }

    /// Create a breakpoint rule
    pub fn breakpoint(url_pattern: impl Into<String>, strategy: BreakpointStrategy) -> Self {
        Self {
            id: String::new(),
            rule_type: RuleType::Breakpoint,
            url_pattern: url_pattern.into(),
            method: String::new(),
            enabled: true,
            strategy,
            response: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// First-match predicate: enabled, method filter, URL substring
    pub fn matches(&self, method: &str, url: &str) -> bool {
        self.enabled
            && (self.method.is_empty() || self.method == method)
            && (self.url_pattern.is_empty() || url.contains(&self.url_pattern))
    }
}

/// Serialize a `HeaderMap` as `{"name": ["v1", "v2"]}`, preserving value order
pub mod header_serde {
    use http::{HeaderMap, HeaderName, HeaderValue};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(headers: &HeaderMap, serializer: S) -> Result<S::Ok, S::Error> {
        to_map(headers).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HeaderMap, D::Error> {
        let map = BTreeMap::<String, Vec<String>>::deserialize(deserializer)?;
        from_map(map).map_err(D::Error::custom)
    }

    pub fn to_map(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        map
    }

    pub fn from_map(map: BTreeMap<String, Vec<String>>) -> Result<HeaderMap, String> {
        let mut headers = HeaderMap::new();
        for (name, values) in map {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| format!("invalid header name {name:?}: {e}"))?;
            for value in values {
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| format!("invalid value for header {name}: {e}"))?;
                headers.append(name.clone(), value);
            }
        }
        Ok(headers)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
