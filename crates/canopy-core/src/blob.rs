// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Blob storage for route artifacts.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::routing::{GpxStream, ReadSeek};

/// Blob key for a plan's GPX route.
pub fn gpx_key(plan_id: i32) -> String {
    format!("plan-{}.gpx", plan_id)
}

/// Reject keys that could escape the store root.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::bad_request(format!("invalid blob name '{}'", key)))
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the stream under `key`, replacing any previous blob.
    async fn put(&self, key: &str, data: GpxStream) -> Result<()>;

    /// Open a blob for reading, `None` if it does not exist.
    async fn open(&self, key: &str) -> Result<Option<GpxStream>>;

    /// Remove a blob. Missing blobs are not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Blobs as files below a root directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, mut data: GpxStream) -> Result<()> {
        let path = self.path(key)?;
        fs::create_dir_all(&self.root).await?;

        // Write beside the target and rename so readers never see a
        // partial file.
        let staging = self.root.join(format!(".{}.partial", key));
        let mut file = fs::File::create(&staging).await?;
        let written = tokio::io::copy(&mut data, &mut file).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&staging, &path).await?;

        debug!(key, bytes = written, "Stored blob");
        Ok(())
    }

    async fn open(&self, key: &str) -> Result<Option<GpxStream>> {
        let path = self.path(key)?;
        match fs::File::open(&path).await {
            Ok(file) => {
                let stream: Box<dyn ReadSeek> = Box::new(file);
                Ok(Some(Box::into_pin(stream)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::gpx_from_bytes;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_key_validation() {
        assert!(validate_key("plan-1.gpx").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("a/b.gpx").is_err());
        assert!(validate_key(".hidden").is_err());
        assert!(validate_key("").is_err());
        assert_eq!(gpx_key(42), "plan-42.gpx");
    }

    #[tokio::test]
    async fn test_put_open_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("gpx"));

        assert!(store.open("plan-1.gpx").await.unwrap().is_none());

        store
            .put("plan-1.gpx", gpx_from_bytes(b"<gpx/>".to_vec()))
            .await
            .unwrap();
        let mut reader = store.open("plan-1.gpx").await.unwrap().unwrap();
        let mut body = String::new();
        reader.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "<gpx/>");

        // Replacing keeps only the latest content.
        store
            .put("plan-1.gpx", gpx_from_bytes(b"<gpx>2</gpx>".to_vec()))
            .await
            .unwrap();
        let mut reader = store.open("plan-1.gpx").await.unwrap().unwrap();
        let mut body = String::new();
        reader.read_to_string(&mut body).await.unwrap();
        assert_eq!(body, "<gpx>2</gpx>");

        store.delete("plan-1.gpx").await.unwrap();
        store.delete("plan-1.gpx").await.unwrap();
        assert!(store.open("plan-1.gpx").await.unwrap().is_none());
    }
}
