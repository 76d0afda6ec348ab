// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Object store gateway.
//!
//! The only path by which the rest of the crate touches blob storage. Bodies
//! are exposed as [`ByteStream`]s so large objects are never buffered unless a
//! caller asks for it with [`read_to_bytes`].
//!
//! # Implementations
//!
//! | Store | Description |
//! |-------|-------------|
//! | [`s3::S3ObjectStore`] | S3-compatible HTTP API (MinIO), SigV4 signed |
//! | [`memory::MemoryObjectStore`] | In-process map for tests |

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::io::AsyncWriteExt;

pub mod memory;
pub mod s3;

pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// Streamed object body.
pub type ByteStream = BoxStream<'static, Result<Bytes, ObjectStoreError>>;

/// Lazy listing of object keys.
pub type KeyStream = BoxStream<'static, Result<String, ObjectStoreError>>;

/// Fixed buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    /// Challenge descriptors, assets and export archives.
    Challenges,
    /// CMS pages.
    Pages,
}

impl Bucket {
    /// Bucket name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Bucket::Challenges => "challenges",
            Bucket::Pages => "pages",
        }
    }

    /// Resolve a bucket name, accepting the legacy `challenge-files` alias.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "challenges" | "challenge-files" => Some(Bucket::Challenges),
            "pages" => Some(Bucket::Pages),
            _ => None,
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Object metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// Stored MIME type.
    pub content_type: String,
}

/// Object store errors.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    /// Object does not exist.
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Object exceeds the caller's size limit.
    #[error("Object {key} exceeds {limit} bytes")]
    TooLarge {
        /// Object key.
        key: String,
        /// Limit in bytes.
        limit: u64,
    },

    /// Transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Store answered with an unexpected status.
    #[error("Unexpected status {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error body or reason.
        message: String,
    },

    /// Listing response could not be parsed.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Local I/O failed while materializing objects.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ObjectStoreError {
    /// Whether the object or bucket is missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ObjectStoreError::NotFound(_))
    }
}

/// Typed facade over an S3-like blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stream an object's body.
    async fn get(&self, bucket: Bucket, key: &str) -> Result<ByteStream, ObjectStoreError>;

    /// Object size and content type.
    async fn stat(&self, bucket: Bucket, key: &str) -> Result<ObjectInfo, ObjectStoreError>;

    /// Store an object, replacing any previous version.
    async fn put(
        &self,
        bucket: Bucket,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError>;

    /// Remove an object.
    async fn delete(&self, bucket: Bucket, key: &str) -> Result<(), ObjectStoreError>;

    /// Keys under `prefix`. Non-recursive listings stop at the next `/`.
    fn list(&self, bucket: Bucket, prefix: &str, recursive: bool) -> KeyStream;
}

/// Drain a body into memory, failing once more than `limit` bytes arrive.
pub async fn read_to_bytes(
    mut stream: ByteStream,
    key: &str,
    limit: u64,
) -> Result<Bytes, ObjectStoreError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if (buf.len() + chunk.len()) as u64 > limit {
            return Err(ObjectStoreError::TooLarge {
                key: key.to_string(),
                limit,
            });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Fetch a whole object, bounded by `limit`.
pub async fn get_bytes(
    store: &dyn ObjectStore,
    bucket: Bucket,
    key: &str,
    limit: u64,
) -> Result<Bytes, ObjectStoreError> {
    let stream = store.get(bucket, key).await?;
    read_to_bytes(stream, key, limit).await
}

/// Collect every key of a listing.
pub async fn list_all(
    store: &dyn ObjectStore,
    bucket: Bucket,
    prefix: &str,
    recursive: bool,
) -> Result<Vec<String>, ObjectStoreError> {
    let mut keys = Vec::new();
    let mut stream = store.list(bucket, prefix, recursive);
    while let Some(key) = stream.next().await {
        keys.push(key?);
    }
    Ok(keys)
}

/// Write every object under `<slug>/` into `dir`, streaming each body to disk.
///
/// Keys are flattened relative to the slug prefix; keys that would escape
/// `dir` are skipped. Returns the number of files written.
pub async fn download_prefix(
    store: &dyn ObjectStore,
    bucket: Bucket,
    slug: &str,
    dir: &Path,
) -> Result<usize, ObjectStoreError> {
    let prefix = format!("{}/", slug);
    let keys = list_all(store, bucket, &prefix, true).await?;
    let mut written = 0;

    for key in keys {
        let Some(relative) = key.strip_prefix(&prefix) else {
            continue;
        };
        if relative.is_empty() || relative.ends_with('/') {
            continue;
        }
        if relative
            .split('/')
            .any(|seg| seg.is_empty() || seg == ".." || seg == ".")
        {
            tracing::warn!(key = %key, "Skipping object with unsafe path");
            continue;
        }

        let target = dir.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(&target).await?;
        let mut body = store.get(bucket, &key).await?;
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        written += 1;
    }

    Ok(written)
}
