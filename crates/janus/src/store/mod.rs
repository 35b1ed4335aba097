//! Artifact store seam
//!
//! Published images go to an object store and are then made publicly
//! readable. Clients read them back with [`ArtifactStore::fetch`]. Backends:
//! - [`S3Store`]: S3-compatible object storage (AWS S3, Cloudflare R2, MinIO)
//! - [`LocalStore`]: a directory tree, for development and tests

pub mod local;
pub mod s3;

use anyhow::Result;
use std::path::Path;

pub use local::LocalStore;
pub use s3::{S3Store, S3StoreConfig};

/// HTTP caching metadata attached to every uploaded object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub cache_control: String,
    pub pragma: String,
    pub expires: String,
    pub content_type: String,
}

impl ObjectMetadata {
    /// Never cache: viewers must always fetch the newest picture
    pub fn no_cache() -> Self {
        Self {
            cache_control: "no-cache, no-store, must-revalidate".to_string(),
            pragma: "no-cache".to_string(),
            expires: "0".to_string(),
            content_type: "image/jpeg".to_string(),
        }
    }
}

impl Default for ObjectMetadata {
    fn default() -> Self {
        Self::no_cache()
    }
}

/// Handle to an object that was uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
}

/// Remote artifact store
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload `local` under `key`, replacing any existing object with that key
    async fn upload(&self, local: &Path, key: &str, metadata: &ObjectMetadata) -> Result<StoredObject>;

    /// Grant anonymous read access to an uploaded object
    async fn make_public(&self, object: &StoredObject) -> Result<()>;

    /// Download the object stored under `key` to `dest`, overwriting it
    async fn fetch(&self, key: &str, dest: &Path) -> Result<()>;
}
