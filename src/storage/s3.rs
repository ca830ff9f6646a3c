// service-backup/src/storage/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::{DateTime, Utc};
use s3::config::Region;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::backend::{ObjectBackend, ObjectMeta};
use crate::BoxReader;
use crate::config::S3Settings;
use crate::errors::{BackupError, Result};

/// Size of one multipart upload part. Payloads that fit in one part are
/// uploaded with a single `PutObject`.
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Backend for S3-compatible object storage.
#[derive(Debug, Clone)]
pub struct S3Backend {
    client: s3::Client,
    bucket: String,
}

impl S3Backend {
    pub async fn connect(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(settings.region.clone()));
        if let Some(endpoint) = &settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) = (&settings.access_key, &settings.secret_key) {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                access_key, secret_key, None, // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        }
        let sdk_config = loader.load().await;

        let config = s3::config::Builder::from(&sdk_config)
            .force_path_style(settings.force_path_style)
            .build();

        info!(bucket = %settings.bucket_name, endpoint = ?settings.endpoint_url, "using S3 storage backend");
        Self {
            client: s3::Client::from_conf(config),
            bucket: settings.bucket_name.clone(),
        }
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let e = e.into_service_error();
                if e.is_not_found() {
                    BackupError::NotFound(format!("object {key} does not exist"))
                } else {
                    BackupError::storage_with(format!("failed to stat object {key}"), e)
                }
            })?;

        Ok(ObjectMeta {
            key: key.to_string(),
            size: head.content_length().unwrap_or_default().max(0) as u64,
            last_modified: head
                .last_modified()
                .and_then(to_chrono)
                .unwrap_or_else(Utc::now),
        })
    }

    async fn put_single(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| BackupError::storage_with(format!("failed to upload object {key}"), e))?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, first: Vec<u8>, body: BoxReader) -> Result<()> {
        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                BackupError::storage_with(format!("failed to start multipart upload of {key}"), e)
            })?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| BackupError::storage(format!("no upload id returned for {key}")))?
            .to_string();

        match self.upload_parts(key, &upload_id, first, body).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| {
                        BackupError::storage_with(
                            format!("failed to complete multipart upload of {key}"),
                            e,
                        )
                    })?;
                Ok(())
            }
            Err(err) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(%key, error = %abort_err, "could not abort multipart upload");
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        mut body: BoxReader,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut chunk = first;
        let mut part_number = 1;

        while !chunk.is_empty() {
            let part = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| {
                    BackupError::storage_with(
                        format!("failed to upload part {part_number} of {key}"),
                        e,
                    )
                })?;
            debug!(%key, part_number, "uploaded part");

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(part.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;
            chunk = read_chunk(&mut body).await?;
        }
        Ok(parts)
    }
}

/// Reads up to [`PART_SIZE`] bytes; an empty chunk means the body is done.
async fn read_chunk(body: &mut BoxReader) -> Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(PART_SIZE);
    body.take(PART_SIZE as u64)
        .read_to_end(&mut chunk)
        .await
        .map_err(BackupError::stream)?;
    Ok(chunk)
}

fn to_chrono(dt: &s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl ObjectBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    BackupError::storage_with(format!("failed to list objects under {prefix}"), e)
                })?;

            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(ObjectMeta {
                    key: key.to_string(),
                    size: object.size().unwrap_or_default().max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(to_chrono)
                        .unwrap_or_else(Utc::now),
                });
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string())
                }
                _ => break,
            }
        }
        Ok(objects)
    }

    async fn get(&self, key: &str) -> Result<BoxReader> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let e = e.into_service_error();
                if e.is_no_such_key() {
                    BackupError::NotFound(format!("object {key} does not exist"))
                } else {
                    BackupError::storage_with(format!("failed to get object {key}"), e)
                }
            })?;
        Ok(Box::pin(object.body.into_async_read()))
    }

    async fn put(&self, key: &str, mut body: BoxReader) -> Result<ObjectMeta> {
        let first = read_chunk(&mut body).await?;
        if first.len() < PART_SIZE {
            self.put_single(key, first).await?;
        } else {
            self.put_multipart(key, first, body).await?;
        }
        info!(%key, bucket = %self.bucket, "uploaded object");
        self.head(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        // DeleteObject succeeds for missing keys
        self.head(key).await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BackupError::storage_with(format!("failed to delete object {key}"), e))?;
        Ok(())
    }
}
