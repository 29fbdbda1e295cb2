//! API key issuance helpers.

use uuid::Uuid;

use crate::credentials::{ApiKeyRecord, KeyRegistry};
use crate::error::CredentialError;

const VISIBLE_PREFIX: usize = 8;

/// A fresh opaque key (UUID v4, hyphenated).
pub fn generate_api_key() -> String {
    Uuid::new_v4().to_string()
}

/// Generate and store a key for `owner`.
pub async fn issue_key(
    registry: &dyn KeyRegistry,
    owner: &str,
    protocol: &str,
) -> Result<ApiKeyRecord, CredentialError> {
    let record = ApiKeyRecord::new(generate_api_key(), owner, protocol);
    registry.insert(record.clone()).await?;
    Ok(record)
}

/// Key form safe for logs: a short prefix only.
pub fn redact(key: &str) -> String {
    let visible: String = key.chars().take(VISIBLE_PREFIX).collect();
    if visible.len() < key.len() {
        format!("{}...", visible)
    } else {
        visible
    }
}
