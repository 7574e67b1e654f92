// Body capture - clone, encode and bound exchange bodies for the traffic log
// Capture is best-effort: nothing here may break the exchange being observed.

use crate::model::TrafficEntry;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Buf, Bytes, BytesMut};
use http::{header::CONTENT_TYPE, HeaderMap, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Body;
use std::fmt::Display;
use thiserror::Error;
use tracing::warn;

/// Appended to bodies cut down to the configured maximum size
pub const TRUNCATION_MARKER: &str = "...truncated";

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Body too large: {current} bytes exceeds limit of {limit} bytes")]
    TooLarge { current: usize, limit: usize },

    #[error("Failed to read body: {0}")]
    ReadError(String),
}

impl CaptureError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            CaptureError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            CaptureError::ReadError(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Stream a body into memory, failing as soon as `max_size` is exceeded
pub async fn read_body_with_limit<B>(mut body: B, max_size: usize) -> Result<Bytes, CaptureError>
where
    B: Body + Unpin,
    B::Error: Display,
{
    let mut collected = BytesMut::new();
    let mut total_size = 0;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| CaptureError::ReadError(e.to_string()))?;

        // Trailers carry no payload
        if let Ok(mut data) = frame.into_data() {
            let chunk = data.copy_to_bytes(data.remaining());
            total_size += chunk.len();

            if total_size > max_size {
                return Err(CaptureError::TooLarge {
                    current: total_size,
                    limit: max_size,
                });
            }

            collected.extend_from_slice(&chunk);
        }
    }

    Ok(collected.freeze())
}

/// Drain a streaming request body into a replayable `Bytes` body.
///
/// A read failure is logged and leaves the request with an empty body.
pub async fn buffer_request<B>(request: Request<B>) -> Request<Bytes>
where
    B: Body + Unpin,
    B::Error: Display,
{
    let (parts, body) = request.into_parts();
    let bytes = match read_body_with_limit(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(uri = %parts.uri, error = %e, "Failed to capture request body");
            Bytes::new()
        }
    };
    Request::from_parts(parts, bytes)
}

/// Drain a streaming response body into a replayable `Bytes` body.
///
/// A read failure is logged and leaves the response with an empty body.
pub async fn buffer_response<B>(response: Response<B>) -> Response<Bytes>
where
    B: Body + Unpin,
    B::Error: Display,
{
    let (parts, body) = response.into_parts();
    let bytes = match read_body_with_limit(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(status = %parts.status, error = %e, "Failed to capture response body");
            Bytes::new()
        }
    };
    Response::from_parts(parts, bytes)
}

/// Content types stored as tagged base64 instead of text
pub fn is_binary_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    ["image/", "audio/", "video/", "font/"]
        .iter()
        .any(|prefix| mime.starts_with(prefix))
        || matches!(
            mime.as_str(),
            "application/octet-stream"
                | "application/pdf"
                | "application/zip"
                | "application/gzip"
                | "application/wasm"
                | "application/x-protobuf"
                | "application/protobuf"
        )
}

pub fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
}

/// Render a body for the traffic log.
///
/// Text stays text. Binary content types (and bodies that are not valid
/// UTF-8) become `data:<type>;base64,<payload>`.
pub fn encode_body(headers: &HeaderMap, body: &[u8]) -> String {
    if body.is_empty() {
        return String::new();
    }

    let declared = content_type(headers);
    if let Some(ct) = declared {
        if is_binary_content_type(ct) {
            return data_uri(ct, body);
        }
    }

    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(_) => data_uri(declared.unwrap_or("application/octet-stream"), body),
    }
}

fn data_uri(content_type: &str, body: &[u8]) -> String {
    format!("data:{};base64,{}", content_type, STANDARD.encode(body))
}

/// Start an entry for a request about to be forwarded
pub fn entry_for_request(request: &Request<Bytes>) -> TrafficEntry {
    let mut entry = TrafficEntry::new(request.method().as_str(), request.uri().to_string());
    entry.request_headers = request.headers().clone();
    entry.request_body = encode_body(request.headers(), request.body());
    entry
}

/// Refresh the request side of an entry after the request was edited
pub fn update_request(entry: &mut TrafficEntry, request: &Request<Bytes>) {
    entry.method = request.method().to_string();
    entry.url = request.uri().to_string();
    entry.request_headers = request.headers().clone();
    entry.request_body = encode_body(request.headers(), request.body());
}

/// Record the response side of an entry and stamp its duration
pub fn record_response(entry: &mut TrafficEntry, response: &Response<Bytes>) {
    entry.status = response.status().as_u16();
    entry.response_headers = response.headers().clone();
    entry.response_body = encode_body(response.headers(), response.body());
    entry.duration = entry.elapsed();
}

/// Cut `body` to at most `max_size` bytes (on a char boundary) and append
/// [`TRUNCATION_MARKER`]. A `max_size` of zero disables truncation.
/// Returns whether the body was truncated.
pub fn truncate_body(body: &mut String, max_size: usize) -> bool {
    if max_size == 0 || body.len() <= max_size {
        return false;
    }

    let mut cut = max_size;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body.truncate(cut);
    body.push_str(TRUNCATION_MARKER);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use http_body_util::Full;

    fn headers_with_type(ct: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(ct));
        headers
    }

    #[tokio::test]
    async fn test_body_under_limit() {
        let body = Full::new(Bytes::from("Hello, World!"));
        let bytes = read_body_with_limit(body, 64).await.unwrap();
        assert_eq!(bytes, Bytes::from("Hello, World!"));
    }

    #[tokio::test]
    async fn test_body_over_limit() {
        let body = Full::new(Bytes::from(vec![b'x'; 100]));
        let err = read_body_with_limit(body, 10).await.unwrap_err();
        assert!(matches!(err, CaptureError::TooLarge { current: 100, limit: 10 }));
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_buffered_request_is_still_readable() {
        let request = Request::builder()
            .method("POST")
            .uri("http://example.com/upload")
            .body(Full::new(Bytes::from("payload")))
            .unwrap();

        let buffered = buffer_request(request).await;

        // Capturing a copy must not consume what the next reader sees
        let captured = encode_body(buffered.headers(), buffered.body());
        assert_eq!(captured, "payload");
        assert_eq!(buffered.body(), &Bytes::from("payload"));
        assert_eq!(buffered.method(), "POST");
    }

    #[tokio::test]
    async fn test_buffered_response_keeps_parts() {
        let response = Response::builder()
            .status(404)
            .header("x-test", "1")
            .body(Full::new(Bytes::from("missing")))
            .unwrap();

        let buffered = buffer_response(response).await;
        assert_eq!(buffered.status(), StatusCode::NOT_FOUND);
        assert_eq!(buffered.headers()["x-test"], "1");
        assert_eq!(buffered.body(), &Bytes::from("missing"));
    }

    #[test]
    fn test_text_body_stays_text() {
        let headers = headers_with_type("application/json; charset=utf-8");
        assert_eq!(encode_body(&headers, br#"{"a":1}"#), r#"{"a":1}"#);
    }

    #[test]
    fn test_image_body_is_tagged_base64() {
        let headers = headers_with_type("image/png");
        let encoded = encode_body(&headers, &[0x89, 0x50, 0x4e, 0x47]);
        assert_eq!(encoded, "data:image/png;base64,iVBORw==");
    }

    #[test]
    fn test_invalid_utf8_without_type_is_tagged() {
        let encoded = encode_body(&HeaderMap::new(), &[0xff, 0xfe]);
        assert!(encoded.starts_with("data:application/octet-stream;base64,"));
    }

    #[test]
    fn test_binary_content_types() {
        assert!(is_binary_content_type("IMAGE/JPEG"));
        assert!(is_binary_content_type("application/pdf"));
        assert!(is_binary_content_type("font/woff2"));
        assert!(!is_binary_content_type("text/html"));
        assert!(!is_binary_content_type("application/json"));
    }

    #[test]
    fn test_truncate_body() {
        let mut body = "x".repeat(100);
        assert!(truncate_body(&mut body, 10));
        assert!(body.ends_with(TRUNCATION_MARKER));
        assert!(body.len() <= 10 + TRUNCATION_MARKER.len());

        let mut short = "short".to_string();
        assert!(!truncate_body(&mut short, 10));
        assert_eq!(short, "short");

        let mut unlimited = "x".repeat(100);
        assert!(!truncate_body(&mut unlimited, 0));
    }

    #[test]
    fn test_truncate_body_ending_with_marker() {
        // A real body that merely ends like a truncated one is still cut
        let mut body = format!("ab{}", TRUNCATION_MARKER);
        assert!(truncate_body(&mut body, 10));
        assert_eq!(body, format!("ab...trunc{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_entry_capture() {
        let request = Request::builder()
            .method("PUT")
            .uri("https://example.com/items/1?x=y")
            .header(CONTENT_TYPE, "text/plain")
            .body(Bytes::from("new value"))
            .unwrap();

        let mut entry = entry_for_request(&request);
        assert_eq!(entry.method, "PUT");
        assert_eq!(entry.url, "https://example.com/items/1?x=y");
        assert_eq!(entry.request_body, "new value");
        assert!(!entry.is_complete());

        let response = Response::builder()
            .status(204)
            .body(Bytes::new())
            .unwrap();
        record_response(&mut entry, &response);
        assert_eq!(entry.status, 204);
        assert!(entry.is_complete());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        // "é" is two bytes; cutting at 3 would split the second one
        let mut body = "éééé".to_string();
        assert!(truncate_body(&mut body, 3));
        assert_eq!(body, format!("é{}", TRUNCATION_MARKER));
    }
}
