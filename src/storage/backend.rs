use std::collections::BTreeMap;
use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::io::AsyncReadExt;

use crate::BoxReader;
use crate::errors::{BackupError, Result};

/// Metadata of one stored object as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Object storage the catalog writes artifacts to.
///
/// Backends do not retry. A missing key is reported as
/// [`BackupError::NotFound`], every other backend failure as
/// [`BackupError::Storage`].
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    async fn get(&self, key: &str) -> Result<BoxReader>;

    /// Consumes `body` to its end and stores it under `key`. Nothing becomes
    /// visible if reading the body fails.
    async fn put(&self, key: &str, body: BoxReader) -> Result<ObjectMeta>;

    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

/// Backend keeping objects in process memory. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores raw bytes with an explicit modification time.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>, last_modified: DateTime<Utc>) {
        self.objects.write().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                last_modified,
            },
        );
    }

    /// Raw stored bytes, exactly as the catalog wrote them.
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).map(|o| o.data.clone())
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| ObjectMeta {
                key: k.clone(),
                size: o.data.len() as u64,
                last_modified: o.last_modified,
            })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<BoxReader> {
        let data = self
            .raw(key)
            .ok_or_else(|| BackupError::NotFound(format!("object {key} does not exist")))?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn put(&self, key: &str, mut body: BoxReader) -> Result<ObjectMeta> {
        let mut data = Vec::new();
        body.read_to_end(&mut data)
            .await
            .map_err(BackupError::stream)?;

        let meta = ObjectMeta {
            key: key.to_string(),
            size: data.len() as u64,
            last_modified: Utc::now(),
        };
        self.insert(key, data, meta.last_modified);
        Ok(meta)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| BackupError::NotFound(format!("object {key} does not exist")))
    }
}
