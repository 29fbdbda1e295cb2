//! The request pipeline: rate limit, authenticate, resolve, forward.
//!
//! Gates run in the fixed order of [`PIPELINE`]. Each either lets the request
//! continue or ends it with a [`GatewayError`]; nothing is forwarded after a
//! rejection.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Method};
use axum::response::Response;

use crate::backend::BackendResolver;
use crate::credentials::{ApiKeyRecord, CredentialStore};
use crate::error::{CredentialError, GatewayError};
use crate::forwarder::{ForwardRequest, Forwarder};
use crate::key_generator::redact;
use crate::metrics::MetricsSink;
use crate::rate_limiter::RateLimiter;

/// Query parameters consumed by the gateway and not forwarded.
pub const CONTROL_PARAMS: [&str; 2] = ["backend", "path"];

/// One inbound call, owned by its handler until the response is produced.
#[derive(Debug)]
pub struct InboundRequest {
    pub api_key: String,
    pub backend_id: String,
    pub forward_path: String,
    /// Caller's query without the control parameters.
    pub query: Option<String>,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Body,
    pub client_addr: Option<SocketAddr>,
}

/// Admission gates, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    RateCheck,
    Authenticate,
    Resolve,
}

/// Rate limiting precedes any credential I/O; authentication precedes
/// backend resolution.
pub const PIPELINE: [Stage; 3] = [Stage::RateCheck, Stage::Authenticate, Stage::Resolve];

struct RequestContext {
    request: InboundRequest,
    record: Option<ApiKeyRecord>,
    upstream: Option<String>,
}

pub struct Gateway {
    limiter: Arc<RateLimiter>,
    credentials: Arc<dyn CredentialStore>,
    resolver: Arc<BackendResolver>,
    forwarder: Arc<dyn Forwarder>,
    metrics: Arc<dyn MetricsSink>,
}

impl Gateway {
    pub fn new(
        limiter: Arc<RateLimiter>,
        credentials: Arc<dyn CredentialStore>,
        resolver: Arc<BackendResolver>,
        forwarder: Arc<dyn Forwarder>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            limiter,
            credentials,
            resolver,
            forwarder,
            metrics,
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn resolver(&self) -> &BackendResolver {
        &self.resolver
    }

    /// Run every gate, then forward.
    pub async fn handle(&self, request: InboundRequest) -> Result<Response, GatewayError> {
        let mut ctx = RequestContext {
            request,
            record: None,
            upstream: None,
        };

        for stage in PIPELINE {
            self.run_stage(stage, &mut ctx).await?;
        }

        self.dispatch(ctx).await
    }

    async fn run_stage(&self, stage: Stage, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        match stage {
            Stage::RateCheck => self.check_rate(),
            Stage::Authenticate => self.authenticate(ctx).await,
            Stage::Resolve => self.resolve(ctx),
        }
    }

    fn check_rate(&self) -> Result<(), GatewayError> {
        if self.limiter.try_acquire() {
            return Ok(());
        }

        self.metrics.record_rate_limited();
        let retry_after = self
            .limiter
            .retry_after()
            .map(|wait| wait.as_secs_f64().ceil().max(1.0) as u64);
        tracing::debug!(retry_after = ?retry_after, "Rate limit exceeded");
        Err(GatewayError::RateLimited { retry_after })
    }

    async fn authenticate(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let api_key = ctx.request.api_key.as_str();

        if !self.credentials.is_valid(api_key).await {
            tracing::warn!(key = %redact(api_key), "Invalid API key attempt");
            return Err(GatewayError::Unauthorized);
        }

        // A key that vanishes between the two calls is a store inconsistency,
        // not a client error.
        let record = self.credentials.lookup(api_key).await.map_err(|e| match e {
            CredentialError::NotFound => GatewayError::Internal(format!(
                "API key {} disappeared between validation and lookup",
                redact(api_key)
            )),
            other => GatewayError::Internal(format!("API key lookup failed: {}", other)),
        })?;

        tracing::info!(owner = %record.owner, protocol = %record.protocol, "API key accepted");
        ctx.record = Some(record);
        Ok(())
    }

    fn resolve(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let backend_id = ctx.request.backend_id.as_str();

        match self.resolver.resolve(backend_id) {
            Some(upstream) => {
                ctx.upstream = Some(upstream.to_string());
                Ok(())
            }
            None => {
                tracing::warn!(backend = %backend_id, "Invalid backend request");
                Err(GatewayError::BadRequest(format!(
                    "unknown backend '{}'",
                    backend_id
                )))
            }
        }
    }

    async fn dispatch(&self, ctx: RequestContext) -> Result<Response, GatewayError> {
        let upstream = ctx
            .upstream
            .ok_or_else(|| GatewayError::Internal("dispatch reached without a backend".into()))?;
        let request = ctx.request;
        let backend_id = request.backend_id;

        tracing::info!(
            backend = %backend_id,
            method = %request.method,
            path = %request.forward_path,
            "Proxying request"
        );

        let forward = ForwardRequest {
            method: request.method,
            path: request.forward_path,
            query: request.query,
            headers: request.headers,
            body: request.body,
            client_addr: request.client_addr,
        };

        match self.forwarder.forward(&upstream, forward).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.metrics.record_upstream_error(&backend_id);
                tracing::error!(backend = %backend_id, upstream = %upstream, error = %e, "Forwarding failed");
                Err(e)
            }
        }
    }
}

/// Drop the gateway's own parameters from a raw query string.
///
/// Remaining pairs keep their original encoding and order. Returns `None`
/// when nothing is left.
pub fn strip_control_params(raw_query: Option<&str>) -> Option<String> {
    let kept: Vec<&str> = raw_query?
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let name = pair.split_once('=').map_or(*pair, |(name, _)| name);
            !CONTROL_PARAMS.contains(&name)
        })
        .collect();

    if kept.is_empty() {
        None
    } else {
        Some(kept.join("&"))
    }
}
