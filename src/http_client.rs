// Upstream HTTP/1.1 client used to replay edited requests
// Plain TCP or rustls, one request per connection, retry across resolved addresses

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{rustls, TlsConnector};
use tracing::{debug, warn};

use crate::replay::Upstream;

const MAX_HEADER_SIZE: usize = 16384; // 16KB max headers
const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Could not resolve {0}")]
    ResolveFailed(String),

    #[error("All upstream addresses failed")]
    AllAddressesFailed,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Read timeout")]
    ReadTimeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Response body too large: {size} bytes (limit: {limit})")]
    ResponseTooLarge { size: usize, limit: usize },

    #[error("Headers too large (> 16KB)")]
    HeadersTooLarge,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl From<httparse::Error> for HttpClientError {
    fn from(e: httparse::Error) -> Self {
        HttpClientError::InvalidResponse(e.to_string())
    }
}

/// Client limits and TLS behaviour
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_response_size: usize,

    /// Skip certificate verification (local development servers only)
    pub accept_invalid_certs: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            max_response_size: 10 * 1024 * 1024, // 10MB
            accept_invalid_certs: false,
        }
    }
}

/// Where a request goes, derived from its absolute URI
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    tls: bool,
    host: String,
    port: u16,
    authority: String,
    path: String,
}

impl Target {
    fn from_request(request: &Request<Bytes>) -> Result<Self, HttpClientError> {
        let uri = request.uri();
        let tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            Some(other) => {
                return Err(HttpClientError::InvalidRequest(format!(
                    "unsupported scheme {other}"
                )))
            }
            None => {
                return Err(HttpClientError::InvalidRequest(
                    "request URI must be absolute".to_string(),
                ))
            }
        };

        let authority = uri
            .authority()
            .ok_or_else(|| HttpClientError::InvalidRequest("request URI has no host".to_string()))?;

        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = authority.port_u16().unwrap_or(if tls { 443 } else { 80 });
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            tls,
            host,
            port,
            authority: authority.as_str().to_string(),
            path,
        })
    }
}

/// HTTP/1.1 upstream over plain TCP or TLS
pub struct HttpUpstream {
    settings: ClientSettings,
    tls: TlsConnector,
}

impl HttpUpstream {
    pub fn new(settings: ClientSettings) -> Self {
        let tls = TlsConnector::from(Arc::new(build_tls_config(settings.accept_invalid_certs)));
        Self { settings, tls }
    }

    /// Send one request; every resolved address is tried in random order
    pub async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpClientError> {
        let target = Target::from_request(&request)?;

        let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(|e| HttpClientError::ResolveFailed(format!("{}: {}", target.host, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(HttpClientError::ResolveFailed(target.host));
        }

        // Shuffle for load distribution
        addrs.shuffle(&mut thread_rng());

        let wire = format_request(&request, &target);
        let head = request.method() == Method::HEAD;
        let mut last_error = None;

        for (idx, addr) in addrs.iter().enumerate() {
            debug!(attempt = idx + 1, total = addrs.len(), addr = %addr, "Trying upstream address");

            match self.exchange(*addr, &target, &wire, head).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(addr = %addr, error = %e, "Upstream address failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(HttpClientError::AllAddressesFailed))
    }

    async fn exchange(
        &self,
        addr: SocketAddr,
        target: &Target,
        wire: &[u8],
        head: bool,
    ) -> Result<Response<Bytes>, HttpClientError> {
        let stream = timeout(self.settings.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| HttpClientError::ConnectionTimeout)??;

        if target.tls {
            let server_name = rustls::pki_types::ServerName::try_from(target.host.as_str())
                .map_err(|e| HttpClientError::TlsError(format!("Invalid server name: {}", e)))?;

            let mut stream = self
                .tls
                .connect(server_name.to_owned(), stream)
                .await
                .map_err(|e| HttpClientError::TlsError(e.to_string()))?;

            round_trip(&mut stream, wire, head, &self.settings).await
        } else {
            let mut stream = stream;
            round_trip(&mut stream, wire, head, &self.settings).await
        }
    }
}

#[async_trait::async_trait]
impl Upstream for HttpUpstream {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpClientError> {
        HttpUpstream::send(self, request).await
    }
}

/// Write the request and read one response (generic over TLS and plain TCP)
async fn round_trip<S>(
    stream: &mut S,
    wire: &[u8],
    head: bool,
    settings: &ClientSettings,
) -> Result<Response<Bytes>, HttpClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(settings.write_timeout, stream.write_all(wire))
        .await
        .map_err(|_| HttpClientError::WriteTimeout)??;

    let mut reader = ResponseReader {
        stream,
        buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
        read_timeout: settings.read_timeout,
    };
    reader.read_response(settings.max_response_size, head).await
}

/// Serialize an HTTP/1.1 request in origin-form
fn format_request(request: &Request<Bytes>, target: &Target) -> Bytes {
    let mut buf = BytesMut::new();
    let body = request.body();

    buf.extend_from_slice(format!("{} {} HTTP/1.1\r\n", request.method(), target.path).as_bytes());
    buf.extend_from_slice(format!("Host: {}\r\n", target.authority).as_bytes());

    for (name, value) in request.headers() {
        if is_hop_by_hop(name) || name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if !body.is_empty() || request.headers().contains_key(CONTENT_LENGTH) {
        buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }

    // One request per connection
    buf.extend_from_slice(b"Connection: close\r\n\r\n");
    buf.extend_from_slice(body);

    buf.freeze()
}

/// Hop-by-hop headers (RFC 7230 § 6.1)
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-connection"
    )
}

struct ResponseReader<'a, S> {
    stream: &'a mut S,
    buf: BytesMut,
    read_timeout: Duration,
}

impl<S: AsyncRead + Unpin> ResponseReader<'_, S> {
    /// Read one response; `head` marks the answer to a HEAD request, which never has a body
    async fn read_response(
        &mut self,
        max_size: usize,
        head: bool,
    ) -> Result<Response<Bytes>, HttpClientError> {
        let (status, headers) = self.read_head().await?;

        let chunked = headers
            .get(TRANSFER_ENCODING)
            .and_then(|te| te.to_str().ok())
            .map(|te| te.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|cl| cl.to_str().ok())
            .and_then(|cl| cl.trim().parse::<usize>().ok());

        let dechunked = chunked && !head && !status_has_no_body(status);
        let body = if head || status_has_no_body(status) {
            Bytes::new()
        } else if dechunked {
            self.read_chunked(max_size).await?
        } else if let Some(length) = content_length {
            self.read_exact_body(length, max_size).await?
        } else {
            self.read_to_eof(max_size).await?
        };

        let body_len = body.len();
        let mut response = Response::new(body);
        *response.status_mut() = status;

        let out = response.headers_mut();
        for (name, value) in &headers {
            if !is_hop_by_hop(name) {
                out.append(name.clone(), value.clone());
            }
        }
        if dechunked {
            out.insert(CONTENT_LENGTH, HeaderValue::from(body_len));
        }

        Ok(response)
    }

    /// Read more bytes into the buffer; returns 0 at EOF
    async fn fill(&mut self) -> Result<usize, HttpClientError> {
        let mut chunk = [0u8; READ_BUFFER_SIZE];
        let n = timeout(self.read_timeout, self.stream.read(&mut chunk))
            .await
            .map_err(|_| HttpClientError::ReadTimeout)??;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn read_head(&mut self) -> Result<(StatusCode, HeaderMap), HttpClientError> {
        loop {
            let mut slots = [httparse::EMPTY_HEADER; 64];
            let mut parsed = httparse::Response::new(&mut slots);

            if let httparse::Status::Complete(len) = parsed.parse(&self.buf)? {
                let status = StatusCode::from_u16(parsed.code.unwrap_or(0)).map_err(|e| {
                    HttpClientError::InvalidResponse(format!("Invalid status code: {}", e))
                })?;

                let mut headers = HeaderMap::new();
                for h in parsed.headers.iter() {
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(h.name.as_bytes()),
                        HeaderValue::from_bytes(h.value),
                    ) {
                        headers.append(name, value);
                    }
                }

                self.buf.advance(len);

                // Interim 1xx responses precede the real one
                if status.is_informational() {
                    continue;
                }
                return Ok((status, headers));
            }

            if self.buf.len() >= MAX_HEADER_SIZE {
                return Err(HttpClientError::HeadersTooLarge);
            }
            if self.fill().await? == 0 {
                return Err(HttpClientError::InvalidResponse(
                    "Connection closed before headers completed".to_string(),
                ));
            }
        }
    }

    async fn read_exact_body(
        &mut self,
        length: usize,
        max_size: usize,
    ) -> Result<Bytes, HttpClientError> {
        if length > max_size {
            return Err(HttpClientError::ResponseTooLarge {
                size: length,
                limit: max_size,
            });
        }

        while self.buf.len() < length {
            if self.fill().await? == 0 {
                return Err(HttpClientError::InvalidResponse(format!(
                    "Premature EOF: expected {} bytes, got {} bytes",
                    length,
                    self.buf.len()
                )));
            }
        }

        Ok(self.buf.split_to(length).freeze())
    }

    async fn read_to_eof(&mut self, max_size: usize) -> Result<Bytes, HttpClientError> {
        loop {
            if self.buf.len() > max_size {
                return Err(HttpClientError::ResponseTooLarge {
                    size: self.buf.len(),
                    limit: max_size,
                });
            }
            if self.fill().await? == 0 {
                break;
            }
        }
        Ok(self.buf.split().freeze())
    }

    /// Read a CRLF-terminated line, without the CRLF
    async fn read_line(&mut self) -> Result<BytesMut, HttpClientError> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos);
                self.buf.advance(2);
                return Ok(line);
            }
            if self.buf.len() > MAX_HEADER_SIZE {
                return Err(HttpClientError::InvalidResponse(
                    "Chunk line too long".to_string(),
                ));
            }
            if self.fill().await? == 0 {
                return Err(HttpClientError::InvalidResponse(
                    "Incomplete chunk line".to_string(),
                ));
            }
        }
    }

    /// Dechunk a chunked body (RFC 7230 § 4.1), discarding trailers
    async fn read_chunked(&mut self, max_size: usize) -> Result<Bytes, HttpClientError> {
        let mut body = BytesMut::new();

        loop {
            let line = self.read_line().await?;
            let size_line = std::str::from_utf8(&line).map_err(|_| {
                HttpClientError::InvalidResponse("Invalid chunk size encoding".to_string())
            })?;

            // Strip chunk extensions ("a5;name=value")
            let size_hex = size_line.split(';').next().unwrap_or_default().trim();
            let size = usize::from_str_radix(size_hex, 16).map_err(|_| {
                HttpClientError::InvalidResponse(format!("Invalid chunk size hex: {}", size_hex))
            })?;

            if size == 0 {
                // Trailers end with an empty line
                while !self.read_line().await?.is_empty() {}
                break;
            }

            // Chunk sizes come from the upstream; never let them overflow
            if size > max_size.saturating_sub(body.len()) {
                return Err(HttpClientError::ResponseTooLarge {
                    size: body.len().saturating_add(size),
                    limit: max_size,
                });
            }
            let framed = size.checked_add(2).ok_or_else(|| {
                HttpClientError::InvalidResponse(format!("Chunk size out of range: {}", size))
            })?;

            while self.buf.len() < framed {
                if self.fill().await? == 0 {
                    return Err(HttpClientError::InvalidResponse(format!(
                        "Incomplete chunk data: expected {} bytes",
                        size
                    )));
                }
            }

            body.extend_from_slice(&self.buf[..size]);
            if &self.buf[size..framed] != b"\r\n" {
                return Err(HttpClientError::InvalidResponse(
                    "Missing CRLF after chunk data".to_string(),
                ));
            }
            self.buf.advance(framed);
        }

        Ok(body.freeze())
    }
}

fn status_has_no_body(status: StatusCode) -> bool {
    status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}

fn build_tls_config(accept_invalid_certs: bool) -> rustls::ClientConfig {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    // HTTP/1.1 only
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    if accept_invalid_certs {
        warn!("Upstream TLS certificate verification disabled for replayed requests");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyCert));
    }

    config
}

/// Certificate verifier that trusts everything (local development servers only)
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
