use envconfig::Envconfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

use crate::backend::BackendResolver;
use crate::config_validator::ConfigValidator;
use crate::error::ConfigError;

pub const DEFAULT_BACKENDS: &str = "8545=http://localhost:8545,5052=http://localhost:5052";

#[derive(Debug, Envconfig, Validate, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "0.0.0.0:3000")]
    pub bind_addr: SocketAddr,

    /// Redis credential store; the JSON key file is used when unset
    #[envconfig(from = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// Key file backing the in-memory credential store
    #[envconfig(from = "KEYS_FILE", default = "apikeys.json")]
    pub keys_file: PathBuf,

    /// Token bucket capacity shared by all inbound traffic
    #[envconfig(from = "RATE_LIMIT_CAPACITY", default = "10000")]
    #[validate(range(min = 1))]
    pub rate_limit_capacity: u32,

    /// Tokens added per second
    #[envconfig(from = "RATE_LIMIT_REFILL_PER_SEC", default = "1.0")]
    #[validate(range(min = 0.0))]
    pub rate_limit_refill_per_sec: f64,

    /// Comma-separated `id=url` route table
    #[envconfig(from = "BACKENDS", default = "8545=http://localhost:8545,5052=http://localhost:5052")]
    pub backends: String,

    /// Connect timeout for upstream dials, in seconds
    #[envconfig(from = "UPSTREAM_CONNECT_TIMEOUT_SECS", default = "10")]
    #[validate(range(min = 1))]
    pub upstream_connect_timeout_secs: u64,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::init_from_env()?;
        config.check()?;
        Ok(config)
    }

    /// Field ranges plus the cross-field checks `validator` cannot express
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;
        ConfigValidator::validate_rate_limit(
            self.rate_limit_capacity,
            self.rate_limit_refill_per_sec,
        )?;
        if let Some(url) = &self.redis_url {
            ConfigValidator::validate_redis_url(url)?;
        }
        self.backend_resolver()?;
        Ok(())
    }

    pub fn backend_resolver(&self) -> Result<BackendResolver, ConfigError> {
        BackendResolver::parse(&self.backends)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            redis_url: None,
            keys_file: PathBuf::from("apikeys.json"),
            rate_limit_capacity: 10_000,
            rate_limit_refill_per_sec: 1.0,
            backends: DEFAULT_BACKENDS.to_string(),
            upstream_connect_timeout_secs: 10,
            log_level: "info".to_string(),
        }
    }
}
