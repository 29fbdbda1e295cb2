use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::{GatewayError, Result};
use crate::forwarder::{Forwarder, HttpForwarder};
use crate::gateway::{strip_control_params, Gateway, InboundRequest};
use crate::metrics::PrometheusMetrics;
use crate::rate_limiter::RateLimiter;
use crate::response::HealthResponse;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub metrics: Arc<PrometheusMetrics>,
}

impl AppState {
    pub fn new(gateway: Arc<Gateway>, metrics: Arc<PrometheusMetrics>) -> Self {
        Self { gateway, metrics }
    }

    /// Wire the production collaborators around `credentials`.
    pub fn from_config(config: &Config, credentials: Arc<dyn CredentialStore>) -> Result<Self> {
        let metrics = Arc::new(PrometheusMetrics::new()?);
        let forwarder: Arc<dyn Forwarder> =
            Arc::new(HttpForwarder::new(config.upstream_connect_timeout())?);

        let gateway = Gateway::new(
            Arc::new(RateLimiter::from_config(config)),
            credentials,
            Arc::new(config.backend_resolver()?),
            forwarder,
            metrics.clone(),
        );

        Ok(Self::new(Arc::new(gateway), metrics))
    }
}

/// Control parameters of the proxy route.
#[derive(Debug, Default, Deserialize)]
pub struct ProxyParams {
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub path: String,
}

/// `ANY /auth/:apikey?backend=<id>&path=<forward path>`
pub async fn proxy_request(
    State(state): State<AppState>,
    api_key: Option<Path<String>>,
    params: Option<Query<ProxyParams>>,
    request: Request,
) -> std::result::Result<Response, GatewayError> {
    let api_key = api_key.map(|Path(key)| key).unwrap_or_default();
    // An unparseable query leaves the backend empty, which resolves to 400
    // once the key has been checked.
    let ProxyParams { backend, path } = params.map(|Query(p)| p).unwrap_or_default();

    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let query = strip_control_params(request.uri().query());
    let (parts, body) = request.into_parts();

    let inbound = InboundRequest {
        api_key,
        backend_id: backend,
        forward_path: path,
        query,
        method: parts.method,
        headers: parts.headers,
        body,
        client_addr,
    };

    state.gateway.handle(inbound).await
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse::healthy())
}

/// Prometheus text exposition
pub async fn metrics_handler(
    State(state): State<AppState>,
) -> std::result::Result<Response, GatewayError> {
    let body = state
        .metrics
        .encode()
        .map_err(|e| GatewayError::Internal(format!("failed to encode metrics: {}", e)))?;

    Ok(([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response())
}
