use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{error, info, warn};
use uuid::Uuid;

pub type ObjectReader = Box<dyn AsyncRead + Unpin + Send>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Transient: timeouts, connection failures, 5xx, throttling.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Permanent: the backend refused the request.
    #[error("Storage rejected request: {0}")]
    Rejected(String),

    #[error("Object not found: {0}")]
    NotFound(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(e.to_string()),
            io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidInput => {
                StorageError::Rejected(e.to_string())
            }
            _ => StorageError::Unavailable(e.to_string()),
        }
    }
}

/// Durable object store the relay hands finished artifacts to.
///
/// `put` returns an opaque locator; the same locator is the only handle
/// accepted by `get` and `delete`.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn put(&self, name: &str, reader: ObjectReader, size: u64)
    -> Result<String, StorageError>;
    async fn get(&self, locator: &str) -> Result<ObjectReader, StorageError>;
    /// Deleting a missing object succeeds.
    async fn delete(&self, locator: &str) -> Result<(), StorageError>;
}

fn object_key(name: &str) -> String {
    let suffix: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if suffix.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        format!("{}-{}", Uuid::new_v4(), suffix)
    }
}

pub struct S3StorageAdapter {
    client: Client,
    bucket: String,
    part_size: usize,
}

impl S3StorageAdapter {
    pub fn new(client: Client, bucket: String, part_size: usize) -> Self {
        Self {
            client,
            bucket,
            part_size,
        }
    }

    fn locator(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    fn key_from_locator<'a>(&self, locator: &'a str) -> Result<&'a str, StorageError> {
        let rest = locator
            .strip_prefix("s3://")
            .ok_or_else(|| StorageError::Rejected(format!("not an s3 locator: {}", locator)))?;
        match rest.split_once('/') {
            Some((bucket, key)) if bucket == self.bucket && !key.is_empty() => Ok(key),
            _ => Err(StorageError::Rejected(format!(
                "locator {} does not belong to bucket {}",
                locator, self.bucket
            ))),
        }
    }

    async fn fill_part(
        reader: &mut ObjectReader,
        buffer: &mut [u8],
    ) -> Result<usize, StorageError> {
        let mut n = 0;
        while n < buffer.len() {
            let read = reader.read(&mut buffer[n..]).await?;
            if read == 0 {
                break;
            }
            n += read;
        }
        Ok(n)
    }

    async fn put_multipart(
        &self,
        key: &str,
        upload_id: &str,
        mut reader: ObjectReader,
    ) -> Result<(), StorageError> {
        let mut part_number = 1;
        let mut completed_parts = Vec::new();
        let mut buffer = vec![0u8; self.part_size];

        loop {
            let n = Self::fill_part(&mut reader, &mut buffer).await?;
            if n == 0 {
                break;
            }

            let part = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .body(ByteStream::from(Bytes::copy_from_slice(&buffer[..n])))
                .part_number(part_number)
                .send()
                .await
                .map_err(|e| classify_sdk_error("upload_part", e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .e_tag(part.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;
        }

        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| classify_sdk_error("complete_multipart_upload", e))?;

        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for S3StorageAdapter {
    async fn put(
        &self,
        name: &str,
        mut reader: ObjectReader,
        size: u64,
    ) -> Result<String, StorageError> {
        let key = object_key(name);

        if size < self.part_size as u64 {
            let mut data = Vec::with_capacity(size as usize);
            reader.read_to_end(&mut data).await?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| classify_sdk_error("put_object", e))?;
            return Ok(self.locator(&key));
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("create_multipart_upload", e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StorageError::Unavailable("no multipart upload id".to_string()))?
            .to_string();

        let mut pending = PendingMultipart {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.clone(),
            upload_id: Some(upload_id.clone()),
        };

        if let Err(e) = self.put_multipart(&key, &upload_id, reader).await {
            pending.abort().await;
            return Err(e);
        }
        pending.upload_id = None;

        info!("☁️ Stored {} ({} bytes) in bucket {}", key, size, self.bucket);
        Ok(self.locator(&key))
    }

    async fn get(&self, locator: &str) -> Result<ObjectReader, StorageError> {
        let key = self.key_from_locator(locator)?;
        let res = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match res {
            Ok(output) => Ok(Box::new(output.body.into_async_read())),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => {
                Err(StorageError::NotFound(locator.to_string()))
            }
            Err(e) => Err(classify_sdk_error("get_object", e)),
        }
    }

    async fn delete(&self, locator: &str) -> Result<(), StorageError> {
        let key = self.key_from_locator(locator)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("delete_object", e))?;
        Ok(())
    }
}

/// An open multipart upload that is aborted unless it completes.
///
/// Dropping it mid-upload (the caller's future was cancelled) schedules the
/// abort on the runtime so the bucket does not keep orphaned parts.
struct PendingMultipart {
    client: Client,
    bucket: String,
    key: String,
    upload_id: Option<String>,
}

impl PendingMultipart {
    async fn abort(&mut self) {
        if let Some(upload_id) = self.upload_id.take() {
            abort_multipart(&self.client, &self.bucket, &self.key, &upload_id).await;
        }
    }
}

impl Drop for PendingMultipart {
    fn drop(&mut self) {
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                let bucket = std::mem::take(&mut self.bucket);
                let key = std::mem::take(&mut self.key);
                handle.spawn(async move {
                    abort_multipart(&client, &bucket, &key, &upload_id).await;
                });
            }
            Err(_) => warn!(
                "Multipart upload {} for {} left open: no runtime to abort it",
                upload_id, self.key
            ),
        }
    }
}

async fn abort_multipart(client: &Client, bucket: &str, key: &str, upload_id: &str) {
    match client
        .abort_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .send()
        .await
    {
        Ok(_) => info!("🧹 Aborted multipart upload {} for {}", upload_id, key),
        Err(e) => warn!(
            "Failed to abort multipart upload {} for {}: {}",
            upload_id,
            key,
            DisplayErrorContext(&e)
        ),
    }
}

/// Splits SDK failures into retryable and permanent ones.
pub fn classify_sdk_error<E>(operation: &str, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = format!("{}: {}", operation, DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::Unavailable(message)
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            if status >= 500 || status == 429 || status == 408 {
                StorageError::Unavailable(message)
            } else {
                error!("S3 {} rejected with status {}", operation, status);
                StorageError::Rejected(message)
            }
        }
        SdkError::ConstructionFailure(_) => StorageError::Rejected(message),
        _ => StorageError::Unavailable(message),
    }
}

/// Filesystem-backed store, used for development and tests.
pub struct LocalStorageAdapter {
    root: PathBuf,
}

const LOCAL_SCHEME: &str = "local://";

impl LocalStorageAdapter {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, locator: &str) -> Result<PathBuf, StorageError> {
        let name = locator
            .strip_prefix(LOCAL_SCHEME)
            .ok_or_else(|| StorageError::Rejected(format!("not a local locator: {}", locator)))?;
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(StorageError::Rejected(format!("bad locator: {}", locator)));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl StorageAdapter for LocalStorageAdapter {
    async fn put(
        &self,
        name: &str,
        mut reader: ObjectReader,
        _size: u64,
    ) -> Result<String, StorageError> {
        let key = object_key(name);
        let final_path = self.root.join(&key);

        // Unlinked on drop, including when this future is dropped mid-copy
        let (file, partial) = tempfile::Builder::new()
            .prefix(".")
            .suffix(".part")
            .tempfile_in(&self.root)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);
        tokio::io::copy(&mut reader, &mut file).await?;
        file.sync_all().await?;
        drop(file);
        partial
            .persist(&final_path)
            .map_err(|e| StorageError::from(e.error))?;

        Ok(format!("{}{}", LOCAL_SCHEME, key))
    }

    async fn get(&self, locator: &str) -> Result<ObjectReader, StorageError> {
        let path = self.path_for(locator)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(locator.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, locator: &str) -> Result<(), StorageError> {
        let path = self.path_for(locator)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Drains an object into memory. Test and small-object helper.
pub async fn read_all(mut reader: ObjectReader) -> Result<Vec<u8>, StorageError> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::put_object::PutObjectError;
    use std::io::Cursor;

    fn reader(data: &[u8]) -> ObjectReader {
        Box::new(Cursor::new(data.to_vec()))
    }

    #[tokio::test]
    async fn test_local_put_get_delete() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = LocalStorageAdapter::new(dir.path()).await.unwrap();

        let locator = storage
            .put("report.csv.gz", reader(b"hello"), 5)
            .await
            .unwrap();
        assert!(locator.starts_with("local://"));
        assert!(locator.ends_with("report.csv.gz"));

        let data = read_all(storage.get(&locator).await.unwrap()).await.unwrap();
        assert_eq!(data, b"hello");

        storage.delete(&locator).await.unwrap();
        assert!(matches!(
            storage.get(&locator).await,
            Err(StorageError::NotFound(_))
        ));
        // Idempotent
        storage.delete(&locator).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_locators_are_unique() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = LocalStorageAdapter::new(dir.path()).await.unwrap();
        let a = storage.put("same", reader(b"a"), 1).await.unwrap();
        let b = storage.put("same", reader(b"b"), 1).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_local_put_dropped_mid_copy_leaves_nothing() {
        use tokio::io::AsyncWriteExt;

        let dir = tempfile::TempDir::new().unwrap();
        let storage = LocalStorageAdapter::new(dir.path()).await.unwrap();

        // The writer half stays open, so the copy never sees EOF
        let (mut writer, stalled) = tokio::io::duplex(64);
        writer.write_all(b"first chunk").await.unwrap();

        let put = storage.put("f.bin", Box::new(stalled), 1024);
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(200), put).await;
        assert!(timed_out.is_err());

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
        drop(writer);
    }

    #[tokio::test]
    async fn test_local_rejects_foreign_locators() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = LocalStorageAdapter::new(dir.path()).await.unwrap();
        for locator in ["s3://bucket/key", "local://../etc/passwd", "local://", "local://a/b"] {
            assert!(matches!(
                storage.get(locator).await,
                Err(StorageError::Rejected(_))
            ));
        }
    }

    #[test]
    fn test_object_key_is_sanitized() {
        let key = object_key("../my file?.txt");
        assert!(!key.contains('/'));
        assert!(!key.contains(' '));
        assert!(key.ends_with(".._my_file_.txt"));
    }

    #[test]
    fn test_sdk_error_classification() {
        let timeout = SdkError::<PutObjectError, HttpResponse>::timeout_error("slow");
        assert!(classify_sdk_error("put_object", timeout).is_retryable());

        let construction =
            SdkError::<PutObjectError, HttpResponse>::construction_failure("bad input");
        assert!(matches!(
            classify_sdk_error("put_object", construction),
            StorageError::Rejected(_)
        ));
    }

    #[test]
    fn test_io_error_mapping() {
        let e: StorageError = io::Error::new(io::ErrorKind::TimedOut, "slow disk").into();
        assert!(e.is_retryable());
        let e: StorageError = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
        assert!(!e.is_retryable());
    }
}
