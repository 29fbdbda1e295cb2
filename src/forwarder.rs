//! Transparent HTTP forwarding to an upstream.
//!
//! Only the path (and the query, minus the gateway's own parameters) is
//! rewritten. Request and response bodies are streamed in both directions.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, HttpBody};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::Method;
use axum::response::Response;
use reqwest::redirect::Policy;
use reqwest::{Client, Url};

use crate::error::{ConfigError, GatewayError};

/// Headers scoped to a single connection; never copied across the hop.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Everything the forwarder needs from the inbound request.
#[derive(Debug)]
pub struct ForwardRequest {
    pub method: Method,
    /// Forward path as supplied by the caller; normalized on use.
    pub path: String,
    /// Raw query to pass through, already stripped of gateway parameters.
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Body,
    pub client_addr: Option<SocketAddr>,
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Send `request` to `upstream_base_url` and relay the upstream response.
    async fn forward(
        &self,
        upstream_base_url: &str,
        request: ForwardRequest,
    ) -> Result<Response, GatewayError>;
}

/// [`Forwarder`] backed by a pooled `reqwest` client.
///
/// Dropping the returned response (or the in-flight future) drops the
/// upstream connection with it, so a caller hanging up cancels the forward.
#[derive(Clone)]
pub struct HttpForwarder {
    client: Client,
}

impl HttpForwarder {
    pub fn new(connect_timeout: Duration) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            // Redirects are the caller's business, not the gateway's.
            .redirect(Policy::none())
            .build()
            .map_err(|e| ConfigError::Invalid(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        upstream_base_url: &str,
        request: ForwardRequest,
    ) -> Result<Response, GatewayError> {
        let url = build_target_url(upstream_base_url, &request.path, request.query.as_deref())?;

        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        if let Some(addr) = request.client_addr {
            append_forwarded_for(&mut headers, addr.ip());
        }

        tracing::debug!(method = %request.method, url = %url, "Forwarding request");

        let mut outbound = self.client.request(request.method, url).headers(headers);
        if request.body.size_hint().exact() != Some(0) {
            outbound = outbound.body(reqwest::Body::wrap_stream(request.body.into_data_stream()));
        }

        let upstream = outbound.send().await.map_err(classify_error)?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

/// Prefix a non-empty path with `/` if it lacks one.
pub fn normalize_forward_path(path: &str) -> String {
    if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

/// Join the forward path onto the upstream base URL.
///
/// The path is set as a path component, so `?` or `#` inside it are
/// percent-encoded rather than starting a query or fragment. An empty path
/// targets the upstream root.
pub fn build_target_url(
    upstream_base_url: &str,
    forward_path: &str,
    query: Option<&str>,
) -> Result<Url, GatewayError> {
    let mut url = Url::parse(upstream_base_url).map_err(|e| {
        GatewayError::Internal(format!(
            "invalid upstream URL '{}': {}",
            upstream_base_url, e
        ))
    })?;

    let path = format!(
        "{}{}",
        url.path().trim_end_matches('/'),
        normalize_forward_path(forward_path)
    );
    url.set_path(&path);
    url.set_query(query.filter(|q| !q.is_empty()));
    Ok(url)
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let value = match headers
        .get(&X_FORWARDED_FOR)
        .and_then(|existing| existing.to_str().ok())
    {
        Some(existing) => format!("{}, {}", existing, ip),
        None => ip.to_string(),
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

fn classify_error(err: reqwest::Error) -> GatewayError {
    if err.is_builder() {
        GatewayError::Internal(format!("failed to build upstream request: {}", err))
    } else if err.is_body() {
        GatewayError::Internal(format!("failed to stream request body: {}", err))
    } else {
        GatewayError::UpstreamUnreachable(err.to_string())
    }
}
