//! Blob storage for cell images
//!
//! Assets are written under relative paths such as
//! `cells/{cell_id}/{millis}-{hash}.png` and addressed publicly through
//! [`BlobStore::public_url_for`].

use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::BlobError;

/// A stored asset and its content type
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub data: Bytes,
    pub content_type: String,
}

/// Capability for storing uploaded assets
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes at `path`, replacing anything already there
    async fn upload(&self, path: &str, data: &[u8], content_type: &str) -> Result<(), BlobError>;

    /// Public URL an uploaded asset is served from
    fn public_url_for(&self, path: &str) -> String;

    /// Read an asset back
    async fn read(&self, path: &str) -> Result<StoredBlob, BlobError>;
}

/// Reject absolute paths and parent traversal
pub fn validate_path(path: &str) -> Result<(), BlobError> {
    if path.is_empty() {
        return Err(BlobError::InvalidPath("empty path".into()));
    }
    let ok = Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(BlobError::InvalidPath(path.to_string()))
    }
}

/// File extension for an image mime type
pub fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "image/avif" => "avif",
        _ => "bin",
    }
}

/// Mime type for a stored file extension
pub fn content_type_for(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("avif") => "image/avif",
        _ => "application/octet-stream",
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

// ============================================================================
// Filesystem Blob Store
// ============================================================================

/// Assets stored as plain files below a root directory
pub struct FsBlobStore {
    root_dir: PathBuf,
    public_base_url: String,
}

impl FsBlobStore {
    /// Create the store, ensuring the root directory exists
    pub async fn new<P: AsRef<Path>>(root_dir: P, public_base_url: &str) -> Result<Self, BlobError> {
        let root_dir = root_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root_dir).await?;

        info!(path = %root_dir.display(), base_url = %public_base_url, "Initialized asset store");

        Ok(Self {
            root_dir,
            public_base_url: public_base_url.to_string(),
        })
    }

    fn file_path(&self, path: &str) -> PathBuf {
        self.root_dir.join(path)
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn upload(&self, path: &str, data: &[u8], _content_type: &str) -> Result<(), BlobError> {
        validate_path(path)?;
        let file_path = self.file_path(path);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to a temp name and rename so readers never see a partial file
        let tmp_path = file_path.with_extension("partial");
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &file_path).await?;

        debug!(path = %path, size = data.len(), "Stored asset");
        Ok(())
    }

    fn public_url_for(&self, path: &str) -> String {
        join_url(&self.public_base_url, path)
    }

    async fn read(&self, path: &str) -> Result<StoredBlob, BlobError> {
        validate_path(path)?;
        match fs::read(self.file_path(path)).await {
            Ok(data) => Ok(StoredBlob {
                data: Bytes::from(data),
                content_type: content_type_for(path).to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// In-Memory Blob Store (for testing/local development)
// ============================================================================

/// Simple in-memory blob store
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, StoredBlob>>,
    public_base_url: String,
}

impl InMemoryBlobStore {
    pub fn new(public_base_url: &str) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            public_base_url: public_base_url.to_string(),
        }
    }

    /// Number of stored assets
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new("memory://assets")
    }
}

#[async_trait::async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn upload(&self, path: &str, data: &[u8], content_type: &str) -> Result<(), BlobError> {
        validate_path(path)?;
        self.blobs.write().await.insert(
            path.to_string(),
            StoredBlob {
                data: Bytes::copy_from_slice(data),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    fn public_url_for(&self, path: &str) -> String {
        join_url(&self.public_base_url, path)
    }

    async fn read(&self, path: &str) -> Result<StoredBlob, BlobError> {
        self.blobs
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_path() {
        assert!(validate_path("cells/abc/1-ff.png").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("../etc/passwd").is_err());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("cells/../../x").is_err());
    }

    #[test]
    fn test_extension_mapping() {
        assert_eq!(extension_for("image/png"), "png");
        assert_eq!(extension_for("image/jpeg"), "jpg");
        assert_eq!(extension_for("image/x-unknown"), "bin");
        assert_eq!(content_type_for("cells/a/b.webp"), "image/webp");
        assert_eq!(content_type_for("cells/a/b"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(temp_dir.path(), "http://localhost:8080/assets/")
            .await
            .unwrap();

        store
            .upload("cells/one/1-aa.png", b"\x89PNG", "image/png")
            .await
            .unwrap();

        let blob = store.read("cells/one/1-aa.png").await.unwrap();
        assert_eq!(&blob.data[..], b"\x89PNG");
        assert_eq!(blob.content_type, "image/png");
        assert_eq!(
            store.public_url_for("cells/one/1-aa.png"),
            "http://localhost:8080/assets/cells/one/1-aa.png"
        );

        assert!(matches!(
            store.read("cells/one/missing.png").await,
            Err(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_rejects_traversal() {
        let store = InMemoryBlobStore::default();
        let result = store.upload("../escape.png", b"x", "image/png").await;
        assert!(matches!(result, Err(BlobError::InvalidPath(_))));
        assert!(store.is_empty().await);
    }
}
