//! S3-compatible artifact store
//!
//! Transfers go through the AWS CLI (`aws s3 cp`, `aws s3api put-object-acl`),
//! which is present on most device images and picks up credentials from the
//! usual environment/profile chain. Setting `endpoint_url` targets R2, MinIO
//! or any other S3-compatible service.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

use super::{ArtifactStore, ObjectMetadata, StoredObject};

/// Configuration for the S3 store
#[derive(Debug, Clone)]
pub struct S3StoreConfig {
    /// S3-compatible endpoint URL (None for AWS S3)
    pub endpoint_url: Option<String>,
    pub bucket: String,
    pub region: String,
    /// Key prefix for all objects
    pub prefix: String,
    /// AWS CLI executable
    pub aws_cli: String,
}

impl Default for S3StoreConfig {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            bucket: String::from("janus-images"),
            region: String::from("us-east-1"),
            prefix: String::new(),
            aws_cli: String::from("aws"),
        }
    }
}

impl S3StoreConfig {
    /// Config for Cloudflare R2
    pub fn r2(account_id: &str, bucket: &str) -> Self {
        Self {
            endpoint_url: Some(format!("https://{}.r2.cloudflarestorage.com", account_id)),
            bucket: bucket.to_string(),
            region: String::from("auto"),
            ..Default::default()
        }
    }

    /// Config for AWS S3
    pub fn s3(bucket: &str, region: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            region: region.to_string(),
            ..Default::default()
        }
    }
}

/// Artifact store backed by S3 object storage
pub struct S3Store {
    config: S3StoreConfig,
}

impl S3Store {
    pub fn new(config: S3StoreConfig) -> Self {
        Self { config }
    }

    fn object_key(&self, key: &str) -> String {
        if self.config.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.config.prefix.trim_end_matches('/'), key)
        }
    }

    /// Arguments for `aws s3 cp` of `local` to `key`
    fn upload_args(&self, local: &Path, key: &str, metadata: &ObjectMetadata) -> Vec<String> {
        let mut args = vec![
            "s3".to_string(),
            "cp".to_string(),
            local.to_string_lossy().into_owned(),
            format!("s3://{}/{}", self.config.bucket, key),
            "--cache-control".to_string(),
            metadata.cache_control.clone(),
            "--expires".to_string(),
            // S3 wants a timestamp; the epoch marks the object as already expired
            "1970-01-01T00:00:00Z".to_string(),
            "--content-type".to_string(),
            metadata.content_type.clone(),
            "--metadata".to_string(),
            format!("pragma={}", metadata.pragma),
        ];
        self.push_common_args(&mut args);
        args
    }

    /// Arguments for `aws s3api put-object-acl` granting public read
    fn public_args(&self, key: &str) -> Vec<String> {
        let mut args = vec![
            "s3api".to_string(),
            "put-object-acl".to_string(),
            "--bucket".to_string(),
            self.config.bucket.clone(),
            "--key".to_string(),
            key.to_string(),
            "--acl".to_string(),
            "public-read".to_string(),
        ];
        self.push_common_args(&mut args);
        args
    }

    /// Arguments for `aws s3 cp` of `key` down to `dest`
    fn fetch_args(&self, key: &str, dest: &Path) -> Vec<String> {
        let mut args = vec![
            "s3".to_string(),
            "cp".to_string(),
            format!("s3://{}/{}", self.config.bucket, key),
            dest.to_string_lossy().into_owned(),
        ];
        self.push_common_args(&mut args);
        args
    }

    fn push_common_args(&self, args: &mut Vec<String>) {
        if let Some(ref endpoint) = self.config.endpoint_url {
            args.push("--endpoint-url".to_string());
            args.push(endpoint.clone());
        }
        args.push("--region".to_string());
        args.push(self.config.region.clone());
        args.push("--only-show-errors".to_string());
    }

    async fn run_cli(&self, args: &[String], what: &str) -> Result<()> {
        debug!("{} {:?}", self.config.aws_cli, args);
        let output = Command::new(&self.config.aws_cli)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {} for {}", self.config.aws_cli, what))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} failed: {}", what, stderr.trim());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ArtifactStore for S3Store {
    async fn upload(&self, local: &Path, key: &str, metadata: &ObjectMetadata) -> Result<StoredObject> {
        let key = self.object_key(key);
        info!("Uploading {:?} to s3://{}/{}", local, self.config.bucket, key);
        self.run_cli(&self.upload_args(local, &key, metadata), "S3 upload")
            .await?;
        Ok(StoredObject { key })
    }

    async fn make_public(&self, object: &StoredObject) -> Result<()> {
        self.run_cli(&self.public_args(&object.key), "S3 put-object-acl")
            .await
    }

    async fn fetch(&self, key: &str, dest: &Path) -> Result<()> {
        let key = self.object_key(key);
        info!("Downloading s3://{}/{} to {:?}", self.config.bucket, key, dest);
        self.run_cli(&self.fetch_args(&key, dest), "S3 download").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_r2() {
        let config = S3StoreConfig::r2("my-account", "my-bucket");
        assert_eq!(config.bucket, "my-bucket");
        assert!(config.endpoint_url.unwrap().contains("my-account"));
    }

    #[test]
    fn test_config_s3() {
        let config = S3StoreConfig::s3("my-bucket", "eu-west-1");
        assert_eq!(config.region, "eu-west-1");
        assert!(config.endpoint_url.is_none());
    }

    #[test]
    fn upload_args_carry_cache_metadata() {
        let store = S3Store::new(S3StoreConfig {
            endpoint_url: Some("http://minio:9000".into()),
            prefix: "garage/".into(),
            ..Default::default()
        });
        let key = store.object_key("garage-image.jpg");
        assert_eq!(key, "garage/garage-image.jpg");

        let args = store.upload_args(Path::new("/tmp/x.jpg"), &key, &ObjectMetadata::no_cache());
        let joined = args.join(" ");
        assert!(joined.starts_with("s3 cp /tmp/x.jpg s3://janus-images/garage/garage-image.jpg"));
        assert!(joined.contains("--cache-control no-cache, no-store, must-revalidate"));
        assert!(joined.contains("--metadata pragma=no-cache"));
        assert!(joined.contains("--endpoint-url http://minio:9000"));
    }

    #[test]
    fn public_args_use_public_read_acl() {
        let store = S3Store::new(S3StoreConfig::default());
        let args = store.public_args("garage-image.jpg");
        assert_eq!(
            &args[..8],
            &[
                "s3api",
                "put-object-acl",
                "--bucket",
                "janus-images",
                "--key",
                "garage-image.jpg",
                "--acl",
                "public-read"
            ]
        );
    }

    #[test]
    fn fetch_args_copy_object_to_destination() {
        let store = S3Store::new(S3StoreConfig {
            prefix: "garage".into(),
            ..S3StoreConfig::s3("my-garage", "eu-west-1")
        });
        let key = store.object_key("garage-image.jpg");
        let args = store.fetch_args(&key, Path::new("/home/me/Downloads/garage-image.jpg"));
        assert_eq!(
            args.join(" "),
            "s3 cp s3://my-garage/garage/garage-image.jpg /home/me/Downloads/garage-image.jpg \
             --region eu-west-1 --only-show-errors"
        );
    }

    #[tokio::test]
    async fn failed_download_names_the_operation() {
        let dir = tempdir().unwrap();
        let store = S3Store::new(S3StoreConfig {
            aws_cli: "false".into(),
            ..Default::default()
        });

        let err = store
            .fetch("garage-image.jpg", &dir.path().join("out.jpg"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("S3 download failed"));
    }

    #[tokio::test]
    async fn cli_failure_is_an_error() {
        let dir = tempdir().unwrap();
        let store = S3Store::new(S3StoreConfig {
            aws_cli: "false".into(),
            ..Default::default()
        });
        let file = dir.path().join("x.jpg");
        std::fs::write(&file, b"jpeg").unwrap();

        let err = store
            .upload(&file, "x.jpg", &ObjectMetadata::no_cache())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("S3 upload failed"));
    }
}
