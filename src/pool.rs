//! Pooled HTTP client for one process-backed microservice
//!
//! Plain requests go through a hyper connection pool. Upgrade requests
//! (WebSockets and friends) are tunnelled over a raw TCP connection.

use crate::config::ServiceDefaults;
use crate::error::{Error, Result};
use crate::ProxyBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Largest upgrade response head accepted from a backend
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Max time to wait for a backend response
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn from_defaults(defaults: &ServiceDefaults) -> Self {
        Self {
            max_idle_per_host: defaults.pool_max_idle_per_host,
            idle_timeout: defaults.pool_idle_timeout(),
            request_timeout: defaults.request_timeout(),
        }
    }
}

/// Proxy to a backend listening on a local port
pub struct BackendClient {
    port: u16,
    client: Client<HttpConnector, ProxyBody>,
    config: PoolConfig,
    label: String,
}

impl BackendClient {
    /// Create a client for `port`. A backend without a port cannot be proxied.
    pub fn new(port: Option<u16>, config: PoolConfig, label: &str) -> Result<Self> {
        let port = match port {
            Some(port) if port != 0 => port,
            _ => {
                return Err(Error::config(format!(
                    "Cannot proxy to '{}' without a port",
                    label
                )))
            }
        };

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            service = label,
            port,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Backend client initialized"
        );

        Ok(Self {
            port,
            client,
            config,
            label: label.to_string(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Forward a request and return the backend's response
    pub async fn forward(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        let uri = format!(
            "http://127.0.0.1:{}{}",
            self.port,
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }
        let backend_req = builder
            .body(body)
            .map_err(|e| Error::Proxy(format!("failed to build backend request: {}", e)))?;

        let timeout = self.config.request_timeout;
        let response = match tokio::time::timeout(timeout, self.client.request(backend_req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(Error::Proxy(format!(
                    "failed to forward to port {}: {}",
                    self.port, e
                )))
            }
            Err(_) => {
                warn!(service = %self.label, port = self.port, timeout_secs = timeout.as_secs(), "Request timed out");
                return Err(Error::Timeout(timeout));
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Tunnel an upgrade request to the backend.
    ///
    /// `hold` is kept alive until the tunnel closes.
    pub async fn upgrade<H>(&self, req: Request<ProxyBody>, hold: H) -> Result<Response<ProxyBody>>
    where
        H: Send + 'static,
    {
        let upgrade_type = req
            .headers()
            .get(hyper::header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        debug!(service = %self.label, upgrade_type, "Handling upgrade request");

        let raw_request = build_upgrade_request(&req, self.port);

        let mut backend_stream = TcpStream::connect(("127.0.0.1", self.port))
            .await
            .map_err(|e| Error::Proxy(format!("failed to connect to port {}: {}", self.port, e)))?;

        backend_stream
            .write_all(&raw_request)
            .await
            .map_err(|e| Error::Proxy(format!("failed to send upgrade request: {}", e)))?;

        let (head, buffered) = read_response_head(&mut backend_stream).await?;
        let (status, response_headers) = parse_upgrade_response(&head)
            .ok_or_else(|| Error::Proxy("invalid upgrade response from backend".to_string()))?;

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(service = %self.label, status = %status, "Backend rejected upgrade request");
            // Return the backend's non-101 response as-is
            let mut response = Response::builder().status(status);
            for (name, value) in &response_headers {
                if let Ok(hv) = HeaderValue::from_str(value) {
                    response = response.header(name.as_str(), hv);
                }
            }
            return response
                .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
                .map_err(|e| Error::Internal(e.to_string()));
        }

        info!(service = %self.label, upgrade_type, "Upgrade successful");

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &response_headers {
            // Skip hop-by-hop headers that hyper handles
            let name_lower = name.to_lowercase();
            if name_lower == "content-length" || name_lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        let response = response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .map_err(|e| Error::Internal(e.to_string()))?;

        let label = self.label.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    debug!(service = %label, "Client upgrade complete, starting forwarding");
                    forward_bidirectional(upgraded, backend_stream, buffered, &label).await;
                }
                Err(e) => {
                    error!(service = %label, error = %e, "Failed to upgrade client connection");
                }
            }
            drop(hold);
            debug!(service = %label, "Upgraded connection closed");
        });

        Ok(response)
    }
}

/// Forward bytes bidirectionally between client and backend connections
async fn forward_bidirectional(client: Upgraded, backend: TcpStream, buffered: Vec<u8>, label: &str) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;

    // Bytes the backend sent right after its response head belong to the client
    if !buffered.is_empty() {
        if let Err(e) = client_io.write_all(&buffered).await {
            debug!(service = %label, error = %e, "Failed to flush buffered backend bytes");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                service = %label,
                client_to_backend,
                backend_to_client,
                "Tunnel closed normally"
            );
        }
        Err(e) => {
            debug!(service = %label, error = %e, "Tunnel closed with error");
        }
    }
}

/// Build the raw HTTP upgrade request to send to the backend
fn build_upgrade_request(req: &Request<ProxyBody>, port: u16) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: 127.0.0.1:{}\r\n", port));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Read until the end of the response head. Returns the head and whatever
/// arrived after it.
async fn read_response_head(stream: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| Error::Proxy(format!("failed to read backend response: {}", e)))?;
        if n == 0 {
            return Err(Error::Proxy("backend closed connection before responding".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(pos + 4);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(Error::Proxy("backend response head too large".to_string()));
        }
    }
}

/// Parse the status and headers of a raw HTTP response head
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}
