//! API key records and the stores that hold them.
//!
//! The gateway only needs the read side ([`CredentialStore`]); the key
//! lifecycle commands use [`KeyRegistry`] on top of it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::CredentialError;
use crate::key_generator::redact;
use crate::redis::RedisCredentialStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    pub owner: String,
    pub protocol: String,
}

impl ApiKeyRecord {
    pub fn new(
        key: impl Into<String>,
        owner: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            owner: owner.into(),
            protocol: protocol.into(),
        }
    }
}

/// Read contract used by the request pipeline.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// True iff a record exists. Never fails: storage faults read as `false`.
    async fn is_valid(&self, api_key: &str) -> bool;

    async fn lookup(&self, api_key: &str) -> Result<ApiKeyRecord, CredentialError>;
}

/// Write contract used by the key lifecycle commands.
#[async_trait]
pub trait KeyRegistry: CredentialStore {
    async fn insert(&self, record: ApiKeyRecord) -> Result<(), CredentialError>;

    async fn list(&self) -> Result<Vec<ApiKeyRecord>, CredentialError>;

    /// Returns `false` if the key did not exist.
    async fn revoke(&self, api_key: &str) -> Result<bool, CredentialError>;
}

/// In-memory store, optionally backed by a JSON key file.
///
/// With a file, every read first checks the file's stamp (inode, size,
/// mtime) and reloads when another process has rewritten it, so keys issued
/// or revoked by `keygate key ...` take effect on a running server. Writes
/// reload before applying and replace the file atomically.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    snapshot: RwLock<Snapshot>,
    path: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct Snapshot {
    records: HashMap<String, ApiKeyRecord>,
    stamp: Option<FileStamp>,
}

/// Identity of one version of the key file; `None` when the file is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    #[cfg(unix)]
    inode: u64,
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(metadata: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        use std::os::unix::fs::MetadataExt;

        Self {
            #[cfg(unix)]
            inode: metadata.ino(),
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ApiKeyRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect();

        Self {
            snapshot: RwLock::new(Snapshot {
                records,
                stamp: None,
            }),
            path: None,
        }
    }

    /// Load the key file at `path`; a missing file starts an empty store.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = load(&path).await?;

        tracing::debug!(path = %path.display(), count = snapshot.records.len(), "Loaded API keys");

        Ok(Self {
            snapshot: RwLock::new(snapshot),
            path: Some(path),
        })
    }

    /// Reload if the key file changed since the last load.
    async fn refresh(&self) -> Result<(), CredentialError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let current = file_stamp(path).await?;
        if self.snapshot.read().await.stamp == current {
            return Ok(());
        }

        let mut snapshot = self.snapshot.write().await;
        self.sync(&mut snapshot).await
    }

    async fn sync(&self, snapshot: &mut Snapshot) -> Result<(), CredentialError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if file_stamp(path).await? != snapshot.stamp {
            *snapshot = load(path).await?;
            tracing::debug!(
                path = %path.display(),
                count = snapshot.records.len(),
                "Reloaded API keys"
            );
        }
        Ok(())
    }

    /// Apply `records` as the new state, writing the file first if there is one.
    async fn commit(
        &self,
        snapshot: &mut Snapshot,
        records: HashMap<String, ApiKeyRecord>,
    ) -> Result<(), CredentialError> {
        if let Some(path) = &self.path {
            persist(path, &records).await?;
            snapshot.stamp = file_stamp(path).await?;
        }
        snapshot.records = records;
        Ok(())
    }
}

async fn file_stamp(path: &Path) -> Result<Option<FileStamp>, CredentialError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(Some(FileStamp::of(&metadata))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// The stamp is taken before reading, so a rewrite racing the read is caught
// by the next refresh.
async fn load(path: &Path) -> Result<Snapshot, CredentialError> {
    let stamp = file_stamp(path).await?;

    let records: Vec<ApiKeyRecord> = match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Vec::new(),
        Ok(bytes) => serde_json::from_slice(&bytes)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    Ok(Snapshot {
        records: records
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect(),
        stamp,
    })
}

async fn persist(path: &Path, records: &HashMap<String, ApiKeyRecord>) -> Result<(), CredentialError> {
    let mut sorted: Vec<&ApiKeyRecord> = records.values().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));
    let json = serde_json::to_vec_pretty(&sorted)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Write then rename so a crash never leaves a truncated key file.
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn is_valid(&self, api_key: &str) -> bool {
        if api_key.is_empty() {
            return false;
        }

        if let Err(e) = self.refresh().await {
            tracing::warn!(key = %redact(api_key), error = %e, "Error reloading API keys");
            return false;
        }

        self.snapshot.read().await.records.contains_key(api_key)
    }

    async fn lookup(&self, api_key: &str) -> Result<ApiKeyRecord, CredentialError> {
        self.refresh().await?;

        self.snapshot
            .read()
            .await
            .records
            .get(api_key)
            .cloned()
            .ok_or(CredentialError::NotFound)
    }
}

#[async_trait]
impl KeyRegistry for MemoryCredentialStore {
    async fn insert(&self, record: ApiKeyRecord) -> Result<(), CredentialError> {
        let mut snapshot = self.snapshot.write().await;
        self.sync(&mut snapshot).await?;

        if snapshot.records.contains_key(&record.key) {
            return Err(CredentialError::AlreadyExists);
        }

        let key = record.key.clone();
        let mut records = snapshot.records.clone();
        records.insert(key.clone(), record);
        self.commit(&mut snapshot, records).await?;

        tracing::info!(key = %redact(&key), "Stored API key");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ApiKeyRecord>, CredentialError> {
        self.refresh().await?;

        let mut records: Vec<_> = self
            .snapshot
            .read()
            .await
            .records
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    async fn revoke(&self, api_key: &str) -> Result<bool, CredentialError> {
        let mut snapshot = self.snapshot.write().await;
        self.sync(&mut snapshot).await?;

        if !snapshot.records.contains_key(api_key) {
            return Ok(false);
        }

        let mut records = snapshot.records.clone();
        records.remove(api_key);
        self.commit(&mut snapshot, records).await?;

        tracing::info!(key = %redact(api_key), "Revoked API key");
        Ok(true)
    }
}

/// The credential backend selected by configuration.
#[derive(Clone)]
pub enum CredentialBackend {
    Memory(Arc<MemoryCredentialStore>),
    Redis(Arc<RedisCredentialStore>),
}

impl CredentialBackend {
    /// Redis when `REDIS_URL` is set, otherwise the JSON key file.
    pub async fn from_config(config: &Config) -> Result<Self, CredentialError> {
        match &config.redis_url {
            Some(url) => {
                tracing::info!("Using Redis credential store");
                Ok(Self::Redis(Arc::new(RedisCredentialStore::connect(url).await?)))
            }
            None => {
                tracing::info!(path = %config.keys_file.display(), "Using file credential store");
                Ok(Self::Memory(Arc::new(
                    MemoryCredentialStore::open(&config.keys_file).await?,
                )))
            }
        }
    }

    pub fn store(&self) -> Arc<dyn CredentialStore> {
        match self {
            Self::Memory(store) => store.clone() as Arc<dyn CredentialStore>,
            Self::Redis(store) => store.clone() as Arc<dyn CredentialStore>,
        }
    }

    pub fn registry(&self) -> Arc<dyn KeyRegistry> {
        match self {
            Self::Memory(store) => store.clone() as Arc<dyn KeyRegistry>,
            Self::Redis(store) => store.clone() as Arc<dyn KeyRegistry>,
        }
    }
}
