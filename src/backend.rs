//! Static mapping from logical backend identifiers to upstream base URLs.

use std::collections::HashMap;

use crate::config_validator::ConfigValidator;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRoute {
    pub logical_id: String,
    pub upstream_base_url: String,
}

impl BackendRoute {
    pub fn new(logical_id: impl Into<String>, upstream_base_url: impl Into<String>) -> Self {
        Self {
            logical_id: logical_id.into(),
            upstream_base_url: upstream_base_url.into(),
        }
    }
}

/// Immutable route table built once at startup.
#[derive(Debug, Clone, Default)]
pub struct BackendResolver {
    routes: HashMap<String, String>,
}

impl BackendResolver {
    /// Build a table, rejecting malformed entries and duplicate identifiers.
    pub fn new(routes: impl IntoIterator<Item = BackendRoute>) -> Result<Self, ConfigError> {
        let mut table = HashMap::new();

        for route in routes {
            ConfigValidator::validate_backend_id(&route.logical_id)?;
            ConfigValidator::validate_upstream_url(&route.upstream_base_url)?;

            if table.contains_key(&route.logical_id) {
                return Err(ConfigError::Invalid(format!(
                    "Backend id '{}' is defined more than once",
                    route.logical_id
                )));
            }

            // Trailing slashes are dropped so joins never produce `//`.
            let base = route.upstream_base_url.trim_end_matches('/').to_string();
            table.insert(route.logical_id, base);
        }

        Ok(Self { routes: table })
    }

    /// Parse `id=url,id=url`. Whitespace around entries is ignored.
    pub fn parse(table: &str) -> Result<Self, ConfigError> {
        let routes = table
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (id, url) = entry.split_once('=').ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "Backend entry '{}' must have the form id=url",
                        entry
                    ))
                })?;
                Ok(BackendRoute::new(id.trim(), url.trim()))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        if routes.is_empty() {
            return Err(ConfigError::Invalid(
                "At least one backend route is required".to_string(),
            ));
        }

        Self::new(routes)
    }

    pub fn resolve(&self, logical_id: &str) -> Option<&str> {
        self.routes.get(logical_id).map(String::as_str)
    }

    /// Routes sorted by identifier.
    pub fn routes(&self) -> Vec<BackendRoute> {
        let mut routes: Vec<_> = self
            .routes
            .iter()
            .map(|(id, url)| BackendRoute::new(id.as_str(), url.as_str()))
            .collect();
        routes.sort_by(|a, b| a.logical_id.cmp(&b.logical_id));
        routes
    }
}
