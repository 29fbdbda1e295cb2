pub mod backend;
pub mod config;
pub mod config_validator;
pub mod credentials;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod handlers;
pub mod key_generator;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;
pub mod redis;
pub mod response;
pub mod server;
pub mod token_bucket;

pub use config::Config;
pub use error::{Error, GatewayError, Result};
pub use gateway::Gateway;
pub use handlers::AppState;
pub use server::{create_app, Server};
