//! Catalog of backup artifacts kept in object storage.
//!
//! Artifacts of a service live under `{type}/{name}/` and are named
//! `{name}_{timestamp}.{ext}`.

mod backend;
pub(crate) mod encryption;
mod s3;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::BoxReader;
use crate::errors::Result;
use crate::service::ServiceKey;

pub use backend::{MemoryBackend, ObjectBackend, ObjectMeta};
pub use encryption::EncryptionKey;
pub use s3::S3Backend;

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S%3f";

/// One stored backup file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackupArtifact {
    pub key: String,
    /// Directory part of the key, `{type}/{name}`.
    pub filepath: String,
    pub filename: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

impl From<ObjectMeta> for BackupArtifact {
    fn from(meta: ObjectMeta) -> Self {
        let (filepath, filename) = match meta.key.rsplit_once('/') {
            Some((path, name)) => (path.to_string(), name.to_string()),
            None => (String::new(), meta.key.clone()),
        };
        Self {
            key: meta.key,
            filepath,
            filename,
            size: meta.size,
            last_modified: meta.last_modified,
        }
    }
}

/// Key prefix holding every artifact of `service`, with a trailing slash.
pub fn service_prefix(service: &ServiceKey) -> String {
    format!("{}/{}/", service.service_type, service.name)
}

pub fn artifact_key(service: &ServiceKey, filename: &str) -> String {
    format!("{}{filename}", service_prefix(service))
}

/// File name for a backup of `name` taken at `at`.
pub fn artifact_filename(name: &str, at: DateTime<Utc>, extension: &str) -> String {
    format!("{name}_{}.{extension}", at.format(TIMESTAMP_FORMAT))
}

/// Facade over an [`ObjectBackend`] adding ordering and optional encryption.
pub struct Catalog {
    backend: Arc<dyn ObjectBackend>,
    encryption: Option<EncryptionKey>,
}

impl Catalog {
    pub fn new(backend: Arc<dyn ObjectBackend>, encryption: Option<EncryptionKey>) -> Self {
        Self {
            backend,
            encryption,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// Artifacts under `prefix`, most recent first.
    pub async fn list(&self, prefix: &str) -> Result<Vec<BackupArtifact>> {
        let mut artifacts: Vec<BackupArtifact> = self
            .backend
            .list(prefix)
            .await?
            .into_iter()
            .filter(|meta| !meta.key.ends_with('/'))
            .map(BackupArtifact::from)
            .collect();
        artifacts.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| b.key.cmp(&a.key))
        });
        debug!(%prefix, backend = self.backend.name(), count = artifacts.len(), "listed artifacts");
        Ok(artifacts)
    }

    pub async fn get(&self, key: &str) -> Result<BoxReader> {
        let reader = self.backend.get(key).await?;
        Ok(match &self.encryption {
            Some(encryption) => encryption.decrypt(reader),
            None => reader,
        })
    }

    pub async fn put(&self, key: &str, body: BoxReader) -> Result<BackupArtifact> {
        let body = match &self.encryption {
            Some(encryption) => encryption.encrypt(body),
            None => body,
        };
        let meta = self.backend.put(key, body).await?;
        info!(%key, size = meta.size, encrypted = self.is_encrypted(), "stored artifact");
        Ok(meta.into())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key).await?;
        info!(%key, "deleted artifact");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::service::ServiceType;
    use chrono::{Duration, TimeZone};
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    fn orders() -> ServiceKey {
        ServiceKey::new(ServiceType::Postgres, "orders")
    }

    fn reader(data: &[u8]) -> BoxReader {
        Box::pin(Cursor::new(data.to_vec()))
    }

    async fn read_all(mut reader: BoxReader) -> anyhow::Result<Vec<u8>> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        Ok(out)
    }

    #[test]
    fn keys_follow_the_service_layout() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        let filename = artifact_filename("orders", at, "dump");
        assert_eq!(filename, "orders_20240301123005000.dump");
        assert_eq!(
            artifact_key(&orders(), &filename),
            "postgres/orders/orders_20240301123005000.dump"
        );
    }

    #[test]
    fn artifact_splits_key_into_path_and_name() {
        let artifact = BackupArtifact::from(ObjectMeta {
            key: "redis/cache/cache_1.rdb".into(),
            size: 3,
            last_modified: Utc::now(),
        });
        assert_eq!(artifact.filepath, "redis/cache");
        assert_eq!(artifact.filename, "cache_1.rdb");
    }

    #[tokio::test]
    async fn put_then_get_round_trips() -> anyhow::Result<()> {
        let catalog = Catalog::new(Arc::new(MemoryBackend::new()), None);
        let key = artifact_key(&orders(), "orders_1.dump");
        let artifact = catalog.put(&key, reader(b"plain dump")).await?;
        assert_eq!(artifact.size, 10);
        assert_eq!(read_all(catalog.get(&key).await?).await?, b"plain dump");
        Ok(())
    }

    #[tokio::test]
    async fn encrypted_round_trip_stores_ciphertext() -> anyhow::Result<()> {
        let backend = Arc::new(MemoryBackend::new());
        let catalog = Catalog::new(
            backend.clone(),
            Some(EncryptionKey::from_passphrase("s3cr3t")),
        );
        let key = artifact_key(&orders(), "orders_1.dump");
        let payload = b"CREATE TABLE orders (id int);".to_vec();

        catalog.put(&key, reader(&payload)).await?;
        let raw = backend.raw(&key).expect("object stored");
        assert_eq!(raw.len(), payload.len() + encryption::IV_LEN);
        assert_ne!(&raw[encryption::IV_LEN..], &payload[..]);

        assert_eq!(read_all(catalog.get(&key).await?).await?, payload);
        Ok(())
    }

    #[tokio::test]
    async fn list_is_newest_first_and_scoped_to_prefix() -> anyhow::Result<()> {
        let backend = Arc::new(MemoryBackend::new());
        let now = Utc::now();
        backend.insert("postgres/orders/orders_a.dump", "a", now - Duration::days(2));
        backend.insert("postgres/orders/orders_c.dump", "c", now);
        backend.insert("postgres/orders/orders_b.dump", "b", now - Duration::days(1));
        backend.insert("postgres/orders-eu/orders-eu_z.dump", "z", now);
        let catalog = Catalog::new(backend, None);

        let names: Vec<_> = catalog
            .list(&service_prefix(&orders()))
            .await?
            .into_iter()
            .map(|a| a.filename)
            .collect();
        assert_eq!(names, ["orders_c.dump", "orders_b.dump", "orders_a.dump"]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_keys_are_not_found() {
        let catalog = Catalog::new(Arc::new(MemoryBackend::new()), None);
        let key = artifact_key(&orders(), "nope.dump");
        assert_eq!(catalog.get(&key).await.err().map(|e| e.kind()), Some(ErrorKind::NotFound));
        assert_eq!(
            catalog.delete(&key).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn empty_prefix_lists_nothing() -> anyhow::Result<()> {
        let catalog = Catalog::new(Arc::new(MemoryBackend::new()), None);
        assert!(catalog.list(&service_prefix(&orders())).await?.is_empty());
        Ok(())
    }
}
