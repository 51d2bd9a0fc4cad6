use crate::errors::{MeridianError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Bucket/key object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;
    /// Size in bytes, if the object exists
    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<u64>>;
    async fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<()>;
    /// Returns whether an object was removed
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<bool>;
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;
}

/// Content-addressed storage with pinning.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data` and return its content id
    async fn add(&self, data: &[u8]) -> Result<String>;
    async fn cat(&self, cid: &str) -> Result<Option<Vec<u8>>>;
    async fn stat(&self, cid: &str) -> Result<Option<u64>>;
    async fn pin(&self, cid: &str) -> Result<()>;
    async fn unpin(&self, cid: &str) -> Result<()>;
    async fn pins(&self) -> Result<Vec<String>>;
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn size_optional(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, data).await?;
    Ok(())
}

async fn remove_optional(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Object store laid out as `<root>/<bucket>/<key>`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let mut path = self.root.join(checked_segment(bucket)?);
        if key.is_empty() {
            return Err(MeridianError::MalformedRequest("empty object key".to_string()));
        }
        for segment in key.split('/') {
            path.push(checked_segment(segment)?);
        }
        Ok(path)
    }
}

fn checked_segment(segment: &str) -> Result<&str> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
        return Err(MeridianError::MalformedRequest(format!(
            "invalid path segment `{segment}`"
        )));
    }
    Ok(segment)
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        read_optional(&self.object_path(bucket, key)?).await
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<u64>> {
        size_optional(&self.object_path(bucket, key)?).await
    }

    async fn put_object(&self, bucket: &str, key: &str, body: &[u8]) -> Result<()> {
        write_file(&self.object_path(bucket, key)?, body).await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<bool> {
        remove_optional(&self.object_path(bucket, key)?).await
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let base = self.root.join(checked_segment(bucket)?);
        let mut keys = Vec::new();
        let mut pending = vec![(base, String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if rel.is_empty() { name } else { format!("{rel}/{name}") };
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), key));
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// Content store laid out as `<root>/blobs/<cid>` and `<root>/pins/<cid>`.
/// Content ids are the hex SHA-256 of the bytes.
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn content_id(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    fn blob_path(&self, cid: &str) -> Result<PathBuf> {
        Ok(self.root.join("blobs").join(checked_cid(cid)?))
    }

    fn pin_path(&self, cid: &str) -> Result<PathBuf> {
        Ok(self.root.join("pins").join(checked_cid(cid)?))
    }
}

fn checked_cid(cid: &str) -> Result<&str> {
    if cid.len() == 64 && cid.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(cid)
    } else {
        Err(MeridianError::MalformedRequest(format!("invalid content id `{cid}`")))
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn add(&self, data: &[u8]) -> Result<String> {
        let cid = Self::content_id(data);
        let path = self.blob_path(&cid)?;
        if size_optional(&path).await?.is_none() {
            write_file(&path, data).await?;
        }
        Ok(cid)
    }

    async fn cat(&self, cid: &str) -> Result<Option<Vec<u8>>> {
        read_optional(&self.blob_path(cid)?).await
    }

    async fn stat(&self, cid: &str) -> Result<Option<u64>> {
        size_optional(&self.blob_path(cid)?).await
    }

    async fn pin(&self, cid: &str) -> Result<()> {
        if self.stat(cid).await?.is_none() {
            return Err(MeridianError::NotFound(format!("content {cid}")));
        }
        write_file(&self.pin_path(cid)?, b"").await
    }

    async fn unpin(&self, cid: &str) -> Result<()> {
        remove_optional(&self.pin_path(cid)?).await?;
        Ok(())
    }

    async fn pins(&self) -> Result<Vec<String>> {
        let mut pins = Vec::new();
        let mut entries = match fs::read_dir(self.root.join("pins")).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(pins),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            pins.push(entry.file_name().to_string_lossy().into_owned());
        }
        pins.sort();
        Ok(pins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_object_store_roundtrip_and_list() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = FsObjectStore::new(dir.path());

        store.put_object("b", "docs/a.txt", b"alpha").await.unwrap();
        store.put_object("b", "docs/b.txt", b"beta").await.unwrap();
        store.put_object("b", "other.txt", b"x").await.unwrap();

        assert_eq!(store.get_object("b", "docs/a.txt").await.unwrap(), Some(b"alpha".to_vec()));
        assert_eq!(store.head_object("b", "docs/b.txt").await.unwrap(), Some(4));
        assert_eq!(
            store.list_objects("b", "docs/").await.unwrap(),
            vec!["docs/a.txt".to_string(), "docs/b.txt".to_string()]
        );

        assert!(store.delete_object("b", "docs/a.txt").await.unwrap());
        assert!(!store.delete_object("b", "docs/a.txt").await.unwrap());
        assert!(store.get_object("b", "docs/a.txt").await.unwrap().is_none());
        assert!(store.list_objects("missing", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_object_store_rejects_traversal() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = FsObjectStore::new(dir.path());

        assert!(matches!(
            store.get_object("b", "../escape").await,
            Err(MeridianError::MalformedRequest(_))
        ));
        assert!(matches!(
            store.put_object("..", "k", b"x").await,
            Err(MeridianError::MalformedRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_content_store_addresses_by_hash() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = FsContentStore::new(dir.path());

        let cid = store.add(b"hello").await.unwrap();
        assert_eq!(
            cid,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(store.add(b"hello").await.unwrap(), cid);
        assert_eq!(store.cat(&cid).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.stat(&cid).await.unwrap(), Some(5));

        store.pin(&cid).await.unwrap();
        assert_eq!(store.pins().await.unwrap(), vec![cid.clone()]);
        store.unpin(&cid).await.unwrap();
        assert!(store.pins().await.unwrap().is_empty());

        assert!(matches!(store.cat("not-a-cid").await, Err(MeridianError::MalformedRequest(_))));
    }

    #[tokio::test]
    async fn test_pin_requires_content() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = FsContentStore::new(dir.path());
        let cid = FsContentStore::content_id(b"never stored");

        assert!(matches!(store.pin(&cid).await, Err(MeridianError::NotFound(_))));
    }
}
