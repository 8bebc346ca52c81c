//! Object storage for artifacts and batch files.
//!
//! Objects are addressed by `(bucket, path)`. The filesystem backend maps
//! each address to `root/bucket/path`; overwrites go through a temporary
//! file and a rename so a reader never sees a half-written batch.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;

use super::ObjectStore;

/// Rejects addresses that would escape the bucket directory.
fn validate_address(bucket: &str, path: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid object address '{}/{}': {}", bucket, path, reason),
        ))
    };

    if bucket.is_empty() || bucket.contains('/') || bucket == "." || bucket == ".." {
        return Err(invalid("bad bucket name"));
    }
    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    for component in Path::new(path).components() {
        if !matches!(component, Component::Normal(_)) {
            return Err(invalid("path must be relative without '..'"));
        }
    }
    Ok(())
}

/// Filesystem-backed object store.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Creates a store rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, path: &str) -> PathBuf {
        self.root.join(bucket).join(path)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, bucket: &str, path: &str, data: &[u8]) -> Result<(), StoreError> {
        validate_address(bucket, path)?;
        let target = self.object_path(bucket, path);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut tmp_name = target.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &target).await?;
        Ok(())
    }

    async fn get(&self, bucket: &str, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_address(bucket, path)?;
        match fs::read(self.object_path(bucket, path)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

/// In-memory object store.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().expect("object store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Paths stored under `bucket`, sorted.
    pub fn paths(&self, bucket: &str) -> Vec<String> {
        let objects = self.objects.read().expect("object store lock poisoned");
        let mut paths: Vec<String> = objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, p)| p.clone())
            .collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, bucket: &str, path: &str, data: &[u8]) -> Result<(), StoreError> {
        validate_address(bucket, path)?;
        self.objects
            .write()
            .expect("object store lock poisoned")
            .insert((bucket.to_string(), path.to_string()), data.to_vec());
        Ok(())
    }

    async fn get(&self, bucket: &str, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        validate_address(bucket, path)?;
        let objects = self.objects.read().expect("object store lock poisoned");
        Ok(objects
            .get(&(bucket.to_string(), path.to_string()))
            .cloned())
    }
}
