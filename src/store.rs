//! The storage collaborator: turns URLs into `object_store` handles.
//!
//! Everything the core needs from a storage backend goes through this
//! module: listing a prefix, sequential reads/writes, range reads and
//! per-key deletes.  Compression and transport concerns stay on the other
//! side of the `object_store` boundary.
//!
//! Supported URL forms:
//!
//! ```text
//! s3://bucket/prefix[?region=...]   S3 and S3-compatible stores
//! file:///path  or a bare path      local filesystem
//! memory://prefix                   in-memory (tests)
//! ```

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream, stream::BoxStream, StreamExt};
use object_store::{
    buffered::BufWriter, local::LocalFileSystem, memory::InMemory, path::Path, ObjectMeta,
    ObjectStore, ObjectStoreExt,
};

use crate::error::{Error, Result};

/// A resolved storage location: a backend plus a path within it.
///
/// The path is a prefix for listing operations and a complete object path
/// for read/write/range operations.  Cheap to clone; the backend is shared.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    store: Arc<dyn ObjectStore>,
    path: Path,
    bucket: String,
    url: String,
}

impl StoreHandle {
    /// Wrap an existing backend.  This is the constructor used by tests,
    /// which share one `InMemory` store across several handles.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        path: impl Into<Path>,
        bucket: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let bucket = bucket.into();
        let url = format!("{}/{}", bucket, path);
        StoreHandle {
            store,
            path,
            bucket,
            url,
        }
    }

    /// Parse a storage URL into a handle.
    ///
    /// `s3://` buckets are configured from the environment (credentials,
    /// endpoint) the usual way; an optional `?region=` query parameter
    /// overrides the region.  Anything without a scheme is treated as a
    /// local filesystem path.
    pub fn parse(url: &str) -> Result<Self> {
        if !url.contains("://") {
            return Self::local(url);
        }

        let parsed = url::Url::parse(url).map_err(|e| Error::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let prefix = parsed.path().trim_matches('/').to_string();

        match parsed.scheme() {
            "file" => Self::local(parsed.path()),
            "memory" => {
                // memory://a/b puts "a" in the authority position
                let full = match parsed.host_str() {
                    Some(host) if prefix.is_empty() => host.to_string(),
                    Some(host) => format!("{host}/{prefix}"),
                    None => prefix,
                };
                Ok(StoreHandle {
                    store: Arc::new(InMemory::new()),
                    path: Path::from(full),
                    bucket: String::new(),
                    url: url.to_string(),
                })
            }
            "s3" => {
                let bucket = parsed.host_str().ok_or_else(|| Error::InvalidUrl {
                    url: url.to_string(),
                    reason: "s3 url must include a bucket name".to_string(),
                })?;

                let mut builder =
                    object_store::aws::AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some((_, region)) = parsed.query_pairs().find(|(k, _)| k == "region") {
                    builder = builder.with_region(region.to_string());
                }
                let store = builder.build().map_err(|e| Error::InvalidUrl {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

                Ok(StoreHandle {
                    store: Arc::new(store),
                    path: Path::from(prefix),
                    bucket: bucket.to_string(),
                    url: url.to_string(),
                })
            }
            scheme => Err(Error::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme: {scheme}"),
            }),
        }
    }

    fn local(path: &str) -> Result<Self> {
        let absolute = std::path::absolute(path).map_err(|e| Error::InvalidUrl {
            url: path.to_string(),
            reason: e.to_string(),
        })?;
        let object_path =
            Path::from_absolute_path(&absolute).map_err(|e| Error::InvalidUrl {
                url: path.to_string(),
                reason: e.to_string(),
            })?;
        Ok(StoreHandle {
            store: Arc::new(LocalFileSystem::new()),
            path: object_path,
            bucket: String::new(),
            url: path.to_string(),
        })
    }

    /// The shared backend.
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    /// The path (prefix or object path) within the backend.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bucket name, or `""` for local and in-memory stores.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// The original URL, for log and error messages.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether an object exists at this handle's path.
    pub async fn exists(&self) -> Result<bool> {
        match self.store.head(&self.path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Total length in bytes of the object at this handle's path.
    pub async fn len(&self) -> Result<u64> {
        Ok(self.store.head(&self.path).await?.size)
    }

    /// Open this handle's path for sequential (multipart) writing.  The
    /// returned writer must be shut down to complete the upload, or
    /// aborted to drop any parts already sent.
    pub fn writer(&self) -> BufWriter {
        BufWriter::new(self.store(), self.path.clone())
    }

    /// Read the whole object at this handle's path.
    pub async fn read_all(&self) -> Result<Bytes> {
        Ok(self.store.get(&self.path).await?.bytes().await?)
    }

    /// Read `length` bytes at `offset` from the object at this handle's
    /// path.  Exactly one request is issued.
    pub async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes> {
        if length == 0 {
            return Ok(Bytes::new());
        }
        Ok(self
            .store
            .get_range(&self.path, offset..offset + length)
            .await?)
    }

    /// Best-effort removal of the object at this handle's path, used to
    /// clean up a half-written output after a fatal archive error.
    pub async fn discard(&self) {
        match self.store.delete(&self.path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => log::warn!("could not remove partial output {}: {e}", self.url),
        }
    }

    /// Delete one batch of keys through the backend's streaming delete,
    /// which S3 maps onto `DeleteObjects` requests instead of one round
    /// trip per key.  A key that is already absent counts as a success.
    /// Returns one outcome per requested key, in no particular order.
    pub async fn delete_batch(&self, keys: &[String]) -> Vec<(String, DeleteOutcome)> {
        let mut pending: HashMap<Path, String> = keys
            .iter()
            .map(|key| (Path::from(key.as_str()), key.clone()))
            .collect();
        let locations: Vec<object_store::Result<Path>> =
            pending.keys().cloned().map(Ok).collect();

        let mut outcomes = Vec::with_capacity(keys.len());
        let mut errors = Vec::new();
        let mut deletions = self.store.delete_stream(stream::iter(locations).boxed());
        while let Some(deleted) = deletions.next().await {
            match deleted {
                Ok(location) => {
                    if let Some(key) = pending.remove(&location) {
                        outcomes.push((key, DeleteOutcome::Deleted));
                    }
                }
                Err(object_store::Error::NotFound { path, .. }) => {
                    if let Some(key) = pending.remove(&Path::from(path.as_str())) {
                        outcomes.push((key, DeleteOutcome::AlreadyAbsent));
                    }
                }
                Err(e) => errors.push(e.to_string()),
            }
        }

        // batch errors do not name a key, so whatever the backend never
        // acknowledged carries the collected errors
        let error = if errors.is_empty() {
            "no result from backend".to_string()
        } else {
            errors.join("; ")
        };
        for (_, key) in pending {
            outcomes.push((key, DeleteOutcome::Failed(error.clone())));
        }
        outcomes
    }
}

/// Per-key result of a [`StoreHandle::delete_batch`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The key was already gone.  Deletion is idempotent, so this counts
    /// as a success.
    AlreadyAbsent,
    /// The final error text for a key the backend could not delete.
    Failed(String),
}

/// One listed source object, as produced by the lister and recorded (with
/// tar offsets added) in the manifest.
#[derive(Debug, Clone)]
pub struct ObjectDescriptor {
    pub bucket: String,
    pub key: String,
    pub location: Path,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub etag: String,
    pub storage_class: String,
    pub version_id: String,
}

impl ObjectDescriptor {
    fn from_meta(meta: ObjectMeta, bucket: &str) -> Self {
        ObjectDescriptor {
            bucket: bucket.to_string(),
            key: meta.location.to_string(),
            size: meta.size,
            last_modified: meta.last_modified,
            etag: meta
                .e_tag
                .as_deref()
                .map(|t| t.trim_matches('"').to_string())
                .unwrap_or_default(),
            // the listing API does not report a storage class
            storage_class: "STANDARD".to_string(),
            version_id: meta.version.unwrap_or_default(),
            location: meta.location,
        }
    }
}

/// Lazily enumerate the objects under `src`'s prefix, in listing order.
///
/// Pagination (continuation tokens, ~1000 objects per call) happens inside
/// the backend.  Errors surface as [`Error::Listing`] and are not retried.
pub fn list_descriptors(src: &StoreHandle) -> BoxStream<'static, Result<ObjectDescriptor>> {
    let prefix = src.url().to_string();
    let bucket = src.bucket().to_string();
    src.store()
        .list(Some(src.path()))
        .map(move |entry| match entry {
            Ok(meta) => Ok(ObjectDescriptor::from_meta(meta, &bucket)),
            Err(source) => Err(Error::Listing {
                prefix: prefix.clone(),
                source,
            }),
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_parse_s3() {
        let handle = StoreHandle::parse("s3://some-bucket/a/prefix?region=eu-west-1").unwrap();
        assert_eq!(handle.bucket(), "some-bucket");
        assert_eq!(handle.path().as_ref(), "a/prefix");
    }

    #[test]
    fn test_parse_s3_needs_bucket() {
        assert!(matches!(
            StoreHandle::parse("s3:///no-bucket"),
            Err(Error::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_parse_memory() {
        let handle = StoreHandle::parse("memory://data/sub").unwrap();
        assert_eq!(handle.bucket(), "");
        assert_eq!(handle.path().as_ref(), "data/sub");
    }

    #[test]
    fn test_parse_bare_path_is_local() {
        let handle = StoreHandle::parse("/tmp/archive.tar").unwrap();
        assert_eq!(handle.path().as_ref(), "tmp/archive.tar");
        assert_eq!(handle.bucket(), "");
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(matches!(
            StoreHandle::parse("ftp://host/x"),
            Err(Error::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_batch_reports_each_key() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        store
            .put(&Path::from("data/a"), object_store::PutPayload::from_static(b"a"))
            .await
            .unwrap();
        let handle = StoreHandle::new(Arc::clone(&store), "data", "");

        let keys = vec!["data/a".to_string(), "data/missing".to_string()];
        let mut outcomes = handle.delete_batch(&keys).await;
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            outcomes,
            vec![
                ("data/a".to_string(), DeleteOutcome::Deleted),
                ("data/missing".to_string(), DeleteOutcome::AlreadyAbsent),
            ]
        );
        assert!(store.head(&Path::from("data/a")).await.is_err());
    }
}
