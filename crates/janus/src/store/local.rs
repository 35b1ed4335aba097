//! Directory-backed artifact store
//!
//! Objects are copied to `root/<key>`; metadata is kept next to each object
//! as `<key>.meta.json`. Making an object public sets world-readable
//! permissions, which is what a static file server in front of `root` needs.
//! Fetching copies the object back out.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{ArtifactStore, ObjectMetadata, StoredObject};

#[derive(Serialize)]
struct MetadataFile<'a> {
    cache_control: &'a str,
    pragma: &'a str,
    expires: &'a str,
    content_type: &'a str,
}

/// Artifact store writing into a local directory
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Filesystem path of an object
    pub fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative.is_absolute()
            || relative
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            anyhow::bail!("invalid object key: {:?}", key);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait::async_trait]
impl ArtifactStore for LocalStore {
    async fn upload(&self, local: &Path, key: &str, metadata: &ObjectMetadata) -> Result<StoredObject> {
        let dest = self.object_path(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        tokio::fs::copy(local, &dest)
            .await
            .with_context(|| format!("Failed to copy {:?} to {:?}", local, dest))?;

        let meta = serde_json::to_vec_pretty(&MetadataFile {
            cache_control: &metadata.cache_control,
            pragma: &metadata.pragma,
            expires: &metadata.expires,
            content_type: &metadata.content_type,
        })?;
        tokio::fs::write(dest.with_file_name(meta_file_name(&dest)), meta).await?;

        debug!("stored {:?} as {}", local, key);
        Ok(StoredObject {
            key: key.to_string(),
        })
    }

    async fn make_public(&self, object: &StoredObject) -> Result<()> {
        let path = self.object_path(&object.key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("Object {} does not exist", object.key))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = meta.permissions();
            perms.set_mode(perms.mode() | 0o444);
            tokio::fs::set_permissions(&path, perms).await?;
        }
        #[cfg(not(unix))]
        let _ = meta;

        Ok(())
    }

    async fn fetch(&self, key: &str, dest: &Path) -> Result<()> {
        let source = self.object_path(key)?;
        tokio::fs::copy(&source, dest)
            .await
            .with_context(|| format!("Failed to copy object {} to {:?}", key, dest))?;
        debug!("fetched {} to {:?}", key, dest);
        Ok(())
    }
}

fn meta_file_name(object: &Path) -> String {
    let name = object
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}.meta.json", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn upload_copies_and_writes_metadata() {
        let src = tempdir().unwrap();
        let root = tempdir().unwrap();
        let file = src.path().join("img.jpg");
        std::fs::write(&file, b"jpeg").unwrap();

        let store = LocalStore::new(root.path());
        let object = store
            .upload(&file, "garage-image-archive/a.jpg", &ObjectMetadata::no_cache())
            .await
            .unwrap();

        assert_eq!(object.key, "garage-image-archive/a.jpg");
        let stored = root.path().join("garage-image-archive/a.jpg");
        assert_eq!(std::fs::read(&stored).unwrap(), b"jpeg");

        let meta: serde_json::Value = serde_json::from_slice(
            &std::fs::read(root.path().join("garage-image-archive/a.jpg.meta.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["cache_control"], "no-cache, no-store, must-revalidate");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn make_public_sets_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let src = tempdir().unwrap();
        let root = tempdir().unwrap();
        let file = src.path().join("img.jpg");
        std::fs::write(&file, b"jpeg").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o600)).unwrap();

        let store = LocalStore::new(root.path());
        let object = store
            .upload(&file, "garage-image.jpg", &ObjectMetadata::no_cache())
            .await
            .unwrap();
        store.make_public(&object).await.unwrap();

        let mode = std::fs::metadata(root.path().join("garage-image.jpg"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o444, 0o444);
    }

    #[tokio::test]
    async fn fetch_copies_object_out() {
        let src = tempdir().unwrap();
        let root = tempdir().unwrap();
        let file = src.path().join("img.jpg");
        std::fs::write(&file, b"jpeg").unwrap();
        let store = LocalStore::new(root.path());
        store
            .upload(&file, "garage-image.jpg", &ObjectMetadata::no_cache())
            .await
            .unwrap();

        let dest = src.path().join("downloaded.jpg");
        store.fetch("garage-image.jpg", &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"jpeg");

        let missing = store.fetch("garage-image-archive/none.jpg", &dest).await;
        assert!(missing.is_err());
    }

    #[test]
    fn keys_cannot_escape_root() {
        let store = LocalStore::new("/srv/janus");
        assert!(store.object_path("../etc/passwd").is_err());
        assert!(store.object_path("/etc/passwd").is_err());
        assert!(store.object_path("").is_err());
        assert_eq!(
            store.object_path("a/b.jpg").unwrap(),
            PathBuf::from("/srv/janus/a/b.jpg")
        );
    }
}
