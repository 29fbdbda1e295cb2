use axum::{
    body::Body,
    extract::{ConnectInfo, MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::handlers::AppState;
use crate::metrics::{MetricsSink, UNMATCHED_ROUTE};

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    // The path embeds the API key; log the route pattern instead.
    let route = route_label(&request);
    let client_ip = get_client_ip(&request);

    info!(
        target: "keygate::middleware",
        method = %method,
        uri = %route,
        client_ip = %client_ip,
        "Incoming request"
    );

    let response = next.run(request).await;

    let status = response.status();
    info!(
        target: "keygate::middleware",
        method = %method,
        uri = %route,
        status = %status,
        "Request completed"
    );

    response
}

/// Record count and latency for every request, labelled by route pattern.
///
/// The sample is taken when the response body is dropped, after the last
/// byte is written or the caller goes away, so proxied transfers are timed
/// in full.
pub async fn track_metrics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let route = route_label(&request);

    let response = next.run(request).await;

    let timer = RequestTimer {
        metrics: state.metrics.clone(),
        method,
        route,
        status: response.status().as_u16(),
        start,
    };
    time_body(response, timer)
}

struct RequestTimer {
    metrics: Arc<dyn MetricsSink>,
    method: String,
    route: String,
    status: u16,
    start: Instant,
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        self.metrics.record_request(
            &self.method,
            &self.route,
            self.status,
            self.start.elapsed().as_secs_f64(),
        );
    }
}

fn time_body(response: Response, timer: RequestTimer) -> Response {
    let (parts, body) = response.into_parts();
    // The closure owns the timer, so it drops with the body.
    let body = body.map_frame(move |frame| {
        let _timer = &timer;
        frame
    });
    Response::from_parts(parts, Body::new(body))
}

fn route_label(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string())
}

fn get_client_ip(request: &Request) -> String {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                return first_ip.trim().to_string();
            }
        }
    }

    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return ip_str.to_string();
        }
    }

    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}
