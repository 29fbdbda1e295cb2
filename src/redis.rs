use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};

use crate::credentials::{ApiKeyRecord, CredentialStore, KeyRegistry};
use crate::error::CredentialError;
use crate::key_generator::redact;

const RECORD_PREFIX: &str = "keygate:apikey:";
const INDEX_KEY: &str = "keygate:apikeys";

// KEYS[1] record hash, KEYS[2] index set; ARGV key, owner, protocol
const INSERT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'owner', ARGV[2], 'protocol', ARGV[3])
redis.call('SADD', KEYS[2], ARGV[1])
return 1
"#;

/// Credential store kept in Redis.
///
/// Each key is a hash `keygate:apikey:<key>` with `owner` and `protocol`
/// fields; `keygate:apikeys` indexes all keys for listing.
pub struct RedisCredentialStore {
    connection: MultiplexedConnection,
}

impl RedisCredentialStore {
    pub async fn connect(redis_url: &str) -> Result<Self, CredentialError> {
        let client = Client::open(redis_url).map_err(|e| {
            CredentialError::Storage(format!("Failed to create Redis client: {}", e))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CredentialError::Storage(format!("Failed to connect to Redis: {}", e)))?;

        Ok(Self { connection })
    }

    pub async fn ping(&self) -> Result<(), CredentialError> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| CredentialError::Storage(format!("Ping failed: {}", e)))
    }

    fn record_key(api_key: &str) -> String {
        format!("{}{}", RECORD_PREFIX, api_key)
    }

    async fn fetch(&self, api_key: &str) -> Result<Option<ApiKeyRecord>, CredentialError> {
        let mut conn = self.connection.clone();
        let fields: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(Self::record_key(api_key))
            .arg("owner")
            .arg("protocol")
            .query_async(&mut conn)
            .await?;

        match fields.as_slice() {
            [Some(owner), Some(protocol)] => {
                Ok(Some(ApiKeyRecord::new(api_key, owner.as_str(), protocol.as_str())))
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl CredentialStore for RedisCredentialStore {
    async fn is_valid(&self, api_key: &str) -> bool {
        if api_key.is_empty() {
            return false;
        }

        let mut conn = self.connection.clone();
        let result = redis::cmd("EXISTS")
            .arg(Self::record_key(api_key))
            .query_async::<_, bool>(&mut conn)
            .await;

        match result {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(key = %redact(api_key), error = %e, "Error checking API key");
                false
            }
        }
    }

    async fn lookup(&self, api_key: &str) -> Result<ApiKeyRecord, CredentialError> {
        self.fetch(api_key).await?.ok_or(CredentialError::NotFound)
    }
}

#[async_trait]
impl KeyRegistry for RedisCredentialStore {
    async fn insert(&self, record: ApiKeyRecord) -> Result<(), CredentialError> {
        let mut conn = self.connection.clone();
        let script = Script::new(INSERT_SCRIPT);
        let mut invocation = script.key(Self::record_key(&record.key));
        invocation
            .key(INDEX_KEY)
            .arg(&record.key)
            .arg(&record.owner)
            .arg(&record.protocol);

        let inserted: i32 = invocation.invoke_async(&mut conn).await?;
        if inserted == 0 {
            return Err(CredentialError::AlreadyExists);
        }

        tracing::info!(key = %redact(&record.key), owner = %record.owner, "Stored API key");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ApiKeyRecord>, CredentialError> {
        let mut conn = self.connection.clone();
        let mut keys: Vec<String> = redis::cmd("SMEMBERS")
            .arg(INDEX_KEY)
            .query_async(&mut conn)
            .await?;
        keys.sort();

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            // A key revoked between SMEMBERS and HMGET is skipped.
            if let Some(record) = self.fetch(&key).await? {
                records.push(record);
            }
        }

        tracing::debug!(count = records.len(), "Retrieved API keys");
        Ok(records)
    }

    async fn revoke(&self, api_key: &str) -> Result<bool, CredentialError> {
        let mut conn = self.connection.clone();
        let (deleted, _): (i32, i32) = redis::pipe()
            .atomic()
            .del(Self::record_key(api_key))
            .srem(INDEX_KEY, api_key)
            .query_async(&mut conn)
            .await?;

        if deleted > 0 {
            tracing::info!(key = %redact(api_key), "Revoked API key");
        }
        Ok(deleted > 0)
    }
}
