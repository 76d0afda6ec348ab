// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory object store for tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::Mutex;

use super::{Bucket, ByteStream, KeyStream, ObjectInfo, ObjectStore, ObjectStoreError};

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    content_type: String,
}

/// Object store backed by a sorted map.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<(Bucket, String), StoredObject>>>,
    /// Number of `stat` calls that report NotFound before the object appears.
    /// Simulates change notifications that arrive before the object is readable.
    delayed_stats: Arc<AtomicUsize>,
}

impl MemoryObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` stat calls fail with NotFound.
    pub fn delay_visibility(&self, n: usize) {
        self.delayed_stats.store(n, Ordering::SeqCst);
    }

    /// Whether an object exists.
    pub async fn contains(&self, bucket: Bucket, key: &str) -> bool {
        self.objects
            .lock()
            .await
            .contains_key(&(bucket, key.to_string()))
    }

    /// Raw body of an object.
    pub async fn body(&self, bucket: Bucket, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .await
            .get(&(bucket, key.to_string()))
            .map(|o| o.body.clone())
    }

    /// Insert a text object.
    pub async fn put_text(&self, bucket: Bucket, key: &str, text: &str) {
        self.objects.lock().await.insert(
            (bucket, key.to_string()),
            StoredObject {
                body: Bytes::copy_from_slice(text.as_bytes()),
                content_type: "text/plain".to_string(),
            },
        );
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: Bucket, key: &str) -> Result<ByteStream, ObjectStoreError> {
        let body = self
            .body(bucket, key)
            .await
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))?;

        // Emit in small chunks so consumers exercise their streaming paths
        let chunks: Vec<Result<Bytes, ObjectStoreError>> = body
            .chunks(8 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn stat(&self, bucket: Bucket, key: &str) -> Result<ObjectInfo, ObjectStoreError> {
        let pending = self.delayed_stats.load(Ordering::SeqCst);
        if pending > 0 {
            self.delayed_stats.store(pending - 1, Ordering::SeqCst);
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }

        let objects = self.objects.lock().await;
        let obj = objects
            .get(&(bucket, key.to_string()))
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: obj.body.len() as u64,
            content_type: obj.content_type.clone(),
        })
    }

    async fn put(
        &self,
        bucket: Bucket,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.objects.lock().await.insert(
            (bucket, key.to_string()),
            StoredObject {
                body,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn delete(&self, bucket: Bucket, key: &str) -> Result<(), ObjectStoreError> {
        self.objects
            .lock()
            .await
            .remove(&(bucket, key.to_string()))
            .map(|_| ())
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    fn list(&self, bucket: Bucket, prefix: &str, recursive: bool) -> KeyStream {
        let objects = self.objects.clone();
        let prefix = prefix.to_string();

        async_stream::stream! {
            let keys: Vec<String> = {
                let objects = objects.lock().await;
                let mut seen = Vec::new();
                for (b, key) in objects.keys() {
                    if *b != bucket || !key.starts_with(&prefix) {
                        continue;
                    }
                    let entry = if recursive {
                        key.clone()
                    } else {
                        // Collapse deeper keys into their common prefix
                        match key[prefix.len()..].find('/') {
                            Some(idx) => key[..prefix.len() + idx + 1].to_string(),
                            None => key.clone(),
                        }
                    };
                    if seen.last() != Some(&entry) {
                        seen.push(entry);
                    }
                }
                seen
            };
            for key in keys {
                yield Ok::<_, ObjectStoreError>(key);
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::list_all;

    #[tokio::test]
    async fn test_list_recursive_and_flat() {
        let store = MemoryObjectStore::new();
        store.put_text(Bucket::Challenges, "a/chall.yml", "name: a").await;
        store.put_text(Bucket::Challenges, "a/files/x", "x").await;
        store.put_text(Bucket::Challenges, "b/chall.yml", "name: b").await;
        store.put_text(Bucket::Pages, "p/page.yml", "p").await;

        let all = list_all(&store, Bucket::Challenges, "", true).await.unwrap();
        assert_eq!(all, vec!["a/chall.yml", "a/files/x", "b/chall.yml"]);

        let flat = list_all(&store, Bucket::Challenges, "a/", false).await.unwrap();
        assert_eq!(flat, vec!["a/chall.yml", "a/files/"]);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = MemoryObjectStore::new();
        let err = store.delete(Bucket::Challenges, "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delayed_visibility() {
        let store = MemoryObjectStore::new();
        store.put_text(Bucket::Challenges, "a/chall.yml", "name: a").await;
        store.delay_visibility(1);
        assert!(store.stat(Bucket::Challenges, "a/chall.yml").await.is_err());
        assert!(store.stat(Bucket::Challenges, "a/chall.yml").await.is_ok());
    }
}
