use crate::config::Config;
use crate::credentials::CredentialBackend;
use crate::error::Result;
use crate::handlers::{health_check, metrics_handler, proxy_request, AppState};
use crate::middleware::{logging_middleware, track_metrics};
use axum::routing::{any, get};
use axum::{middleware, Router};
use std::net::SocketAddr;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Build the router around prepared state.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        // Proxy endpoints; the bare prefix answers 401 like any unknown key
        .route("/auth/:apikey", any(proxy_request))
        .route("/auth/", any(proxy_request))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(logging_middleware))
                .layer(middleware::from_fn_with_state(state.clone(), track_metrics)),
        )
        .with_state(state)
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self> {
        let credentials = CredentialBackend::from_config(&config).await?;
        let state = AppState::from_config(&config, credentials.store())?;

        let limiter = state.gateway.rate_limiter();
        tracing::info!(
            capacity = limiter.capacity(),
            refill_per_sec = limiter.refill_rate(),
            "Rate limiter configured"
        );

        for route in state.gateway.resolver().routes() {
            tracing::info!(
                backend = %route.logical_id,
                upstream = %route.upstream_base_url,
                "Registered backend"
            );
        }

        Ok(Self {
            app: create_app(state),
            bind_addr: config.bind_addr,
        })
    }

    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        tracing::info!("keygate listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Metrics available at /metrics");

        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        tracing::info!("keygate stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
