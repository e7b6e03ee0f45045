//! Object store gateway
//!
//! A thin put/get/delete seam in front of S3. Put is idempotent under
//! the same (key, bytes) and reads after a successful put of a new
//! key return the written bytes. "Not found" is a distinct error so
//! callers can tell a missing blob from an outage. The in-memory
//! implementation backs tests.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("object store error: {0}")]
    Other(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

impl From<ObjectStoreError> for crate::core::error::RepoError {
    fn from(e: ObjectStoreError) -> Self {
        crate::core::error::RepoError::Transient(Box::new(e))
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> ObjectStoreResult<()>;

    async fn get(&self, key: &str) -> ObjectStoreResult<Vec<u8>>;

    async fn delete(&self, key: &str) -> ObjectStoreResult<()>;
}

/// S3-backed object store.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> ObjectStoreResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Other(Box::new(e.into_service_error())))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> ObjectStoreResult<Vec<u8>> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                let service = err.into_service_error();
                if service.is_no_such_key() {
                    return Err(ObjectStoreError::NotFound(key.to_string()));
                }
                return Err(ObjectStoreError::Other(Box::new(service)));
            }
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Other(Box::new(e)))?;

        Ok(data.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> ObjectStoreResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Other(Box::new(e.into_service_error())))?;

        Ok(())
    }
}

/// In-memory object store for tests.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.lock().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> ObjectStoreResult<()> {
        self.objects.lock().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> ObjectStoreResult<Vec<u8>> {
        self.objects
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> ObjectStoreResult<()> {
        self.objects.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_read_after_write() {
        let store = MemoryStore::new();

        store
            .put("archive/v/u1/1", b"blob".to_vec(), "application/json")
            .await
            .unwrap();

        assert_eq!(store.get("archive/v/u1/1").await.unwrap(), b"blob");

        // Re-putting the same bytes is a no-op, not an error.
        store
            .put("archive/v/u1/1", b"blob".to_vec(), "application/json")
            .await
            .unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn missing_object_is_distinguishable() {
        let store = MemoryStore::new();

        match store.get("archive/v/u1/9").await {
            Err(ObjectStoreError::NotFound(key)) => assert_eq!(key, "archive/v/u1/9"),
            other => panic!("expected NotFound, got {other:?}"),
        }

        // Deleting a missing key succeeds.
        store.delete("archive/v/u1/9").await.unwrap();
    }
}
