// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! S3-compatible object store over HTTP.
//!
//! Path-style addressing (`{endpoint}/{bucket}/{key}`) with AWS Signature
//! Version 4 request signing, which is what MinIO expects.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use super::{Bucket, ByteStream, KeyStream, ObjectInfo, ObjectStore, ObjectStoreError};
use crate::config::S3Config;

type HmacSha256 = Hmac<Sha256>;

const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

struct Inner {
    client: reqwest::Client,
    endpoint: Url,
    region: String,
    access_key: String,
    secret_key: String,
}

/// Object store speaking the S3 REST API.
#[derive(Clone)]
pub struct S3ObjectStore {
    inner: Arc<Inner>,
}

impl S3ObjectStore {
    /// Create a client for the configured endpoint.
    pub fn new(config: &S3Config) -> Result<Self, ObjectStoreError> {
        let endpoint = Url::parse(config.endpoint.trim_end_matches('/'))
            .map_err(|e| ObjectStoreError::Malformed(format!("invalid endpoint: {}", e)))?;
        Ok(Self {
            inner: Arc::new(Inner {
                client: reqwest::Client::new(),
                endpoint,
                region: config.region.clone(),
                access_key: config.access_key.clone(),
                secret_key: config.secret_key.clone(),
            }),
        })
    }
}

impl Inner {
    fn object_path(&self, bucket: Bucket, key: &str) -> String {
        let mut path = format!("/{}", bucket.name());
        if !key.is_empty() {
            for segment in key.split('/') {
                path.push('/');
                path.push_str(&urlencoding::encode(segment));
            }
        }
        path
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<(Bytes, &str)>,
    ) -> Result<reqwest::Response, ObjectStoreError> {
        let now = Utc::now();
        let payload_hash = match &body {
            Some((bytes, _)) => hex::encode(Sha256::digest(bytes)),
            None => EMPTY_PAYLOAD_SHA256.to_string(),
        };

        let mut url = self.endpoint.clone();
        url.set_path(path);
        let canonical_query = canonical_query(query);
        url.set_query(if canonical_query.is_empty() {
            None
        } else {
            Some(&canonical_query)
        });

        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{}:{}", h, p),
            (Some(h), None) => h.to_string(),
            (None, _) => return Err(ObjectStoreError::Malformed("endpoint has no host".into())),
        };

        let authorization = sign(&SigningRequest {
            method: method.as_str(),
            path,
            canonical_query: &canonical_query,
            host: &host,
            payload_hash: &payload_hash,
            now,
            region: &self.region,
            access_key: &self.access_key,
            secret_key: &self.secret_key,
        });

        let mut request = self
            .client
            .request(method, url)
            .header("x-amz-date", now.format("%Y%m%dT%H%M%SZ").to_string())
            .header("x-amz-content-sha256", &payload_hash)
            .header("authorization", authorization);
        if let Some((bytes, content_type)) = body {
            request = request.header("content-type", content_type).body(bytes);
        }

        Ok(request.send().await?)
    }
}

/// Map a non-success response into an error, consuming it.
async fn check(response: reqwest::Response, key: &str) -> Result<reqwest::Response, ObjectStoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ObjectStoreError::NotFound(key.to_string()));
    }
    let message = response.text().await.unwrap_or_default();
    Err(ObjectStoreError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, bucket: Bucket, key: &str) -> Result<ByteStream, ObjectStoreError> {
        let path = self.inner.object_path(bucket, key);
        let response = self.inner.send(Method::GET, &path, &[], None).await?;
        let response = check(response, key).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ObjectStoreError::from))
            .boxed())
    }

    async fn stat(&self, bucket: Bucket, key: &str) -> Result<ObjectInfo, ObjectStoreError> {
        let path = self.inner.object_path(bucket, key);
        let response = self.inner.send(Method::HEAD, &path, &[], None).await?;
        let response = check(response, key).await?;

        let headers = response.headers();
        let size = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        Ok(ObjectInfo {
            key: key.to_string(),
            size,
            content_type,
        })
    }

    async fn put(
        &self,
        bucket: Bucket,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let path = self.inner.object_path(bucket, key);
        debug!(bucket = %bucket, key = %key, size = body.len(), "Uploading object");
        let response = self
            .inner
            .send(Method::PUT, &path, &[], Some((body, content_type)))
            .await?;
        check(response, key).await?;
        Ok(())
    }

    async fn delete(&self, bucket: Bucket, key: &str) -> Result<(), ObjectStoreError> {
        // S3 reports 204 for missing keys too
        self.stat(bucket, key).await?;
        let path = self.inner.object_path(bucket, key);
        let response = self.inner.send(Method::DELETE, &path, &[], None).await?;
        check(response, key).await?;
        Ok(())
    }

    fn list(&self, bucket: Bucket, prefix: &str, recursive: bool) -> KeyStream {
        let inner = self.inner.clone();
        let prefix = prefix.to_string();

        async_stream::try_stream! {
            let path = inner.object_path(bucket, "");
            let mut token: Option<String> = None;

            loop {
                let mut query: Vec<(&str, &str)> = vec![("list-type", "2"), ("prefix", &prefix)];
                if !recursive {
                    query.push(("delimiter", "/"));
                }
                if let Some(t) = token.as_deref() {
                    query.push(("continuation-token", t));
                }

                let response = inner.send(Method::GET, &path, &query, None).await?;
                let response = check(response, bucket.name()).await?;
                let body = response.text().await?;
                let page = parse_list_page(&body)?;

                for key in page.keys {
                    yield key;
                }

                match page.next_token {
                    Some(next) if page.truncated => token = Some(next),
                    _ => break,
                }
            }
        }
        .boxed()
    }
}

// ============================================================================
// ListObjectsV2 parsing
// ============================================================================

#[derive(Debug, Default, PartialEq)]
struct ListPage {
    keys: Vec<String>,
    truncated: bool,
    next_token: Option<String>,
}

fn parse_list_page(xml: &str) -> Result<ListPage, ObjectStoreError> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| ObjectStoreError::Malformed(format!("list response: {}", e)))?;
    let root = doc.root_element();

    let child_text = |node: roxmltree::Node, name: &str| -> Option<String> {
        node.children()
            .find(|c| c.is_element() && c.tag_name().name() == name)
            .and_then(|c| c.text())
            .map(str::to_string)
    };

    let mut page = ListPage {
        truncated: child_text(root, "IsTruncated").as_deref() == Some("true"),
        next_token: child_text(root, "NextContinuationToken"),
        ..Default::default()
    };

    for node in root.children().filter(|c| c.is_element()) {
        match node.tag_name().name() {
            "Contents" => {
                if let Some(key) = child_text(node, "Key") {
                    page.keys.push(key);
                }
            }
            "CommonPrefixes" => {
                if let Some(prefix) = child_text(node, "Prefix") {
                    page.keys.push(prefix);
                }
            }
            _ => {}
        }
    }

    Ok(page)
}

// ============================================================================
// SigV4
// ============================================================================

struct SigningRequest<'a> {
    method: &'a str,
    path: &'a str,
    canonical_query: &'a str,
    host: &'a str,
    payload_hash: &'a str,
    now: DateTime<Utc>,
    region: &'a str,
    access_key: &'a str,
    secret_key: &'a str,
}

fn canonical_query(query: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

fn hmac(key: &[u8], data: &str) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts any key length"),
    };
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn sign(req: &SigningRequest<'_>) -> String {
    let amz_date = req.now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = req.now.format("%Y%m%d").to_string();
    let signed_headers = "host;x-amz-content-sha256;x-amz-date";

    let canonical_request = format!(
        "{}\n{}\n{}\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
        req.method,
        req.path,
        req.canonical_query,
        req.host,
        req.payload_hash,
        amz_date,
        signed_headers,
        req.payload_hash
    );

    let scope = format!("{}/{}/s3/aws4_request", date, req.region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let k_date = hmac(format!("AWS4{}", req.secret_key).as_bytes(), &date);
    let k_region = hmac(&k_date, req.region);
    let k_service = hmac(&k_region, "s3");
    let k_signing = hmac(&k_service, "aws4_request");
    let signature = hex::encode(hmac(&k_signing, &string_to_sign));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        req.access_key, scope, signed_headers, signature
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(uri: &str) -> S3ObjectStore {
        S3ObjectStore::new(&S3Config {
            endpoint: uri.to_string(),
            region: "us-east-1".into(),
            access_key: "AKIDEXAMPLE".into(),
            secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".into(),
        })
        .unwrap()
    }

    #[test]
    fn test_canonical_query_sorted_and_encoded() {
        let q = canonical_query(&[("prefix", "a b/"), ("list-type", "2")]);
        assert_eq!(q, "list-type=2&prefix=a%20b%2F");
    }

    #[test]
    fn test_signature_is_deterministic() {
        let req = SigningRequest {
            method: "GET",
            path: "/challenges/web/chall.yml",
            canonical_query: "",
            host: "localhost:9000",
            payload_hash: EMPTY_PAYLOAD_SHA256,
            now: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
            region: "us-east-1",
            access_key: "AKID",
            secret_key: "secret",
        };
        let a = sign(&req);
        let b = sign(&req);
        assert_eq!(a, b);
        assert!(a.starts_with("AWS4-HMAC-SHA256 Credential=AKID/20250102/us-east-1/s3/aws4_request"));
        assert!(a.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
    }

    #[test]
    fn test_parse_list_page() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>challenges</Name>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>abc</NextContinuationToken>
  <Contents><Key>web/chall.yml</Key><Size>10</Size></Contents>
  <Contents><Key>web/app.py</Key><Size>20</Size></Contents>
  <CommonPrefixes><Prefix>web/src/</Prefix></CommonPrefixes>
</ListBucketResult>"#;
        let page = parse_list_page(xml).unwrap();
        assert_eq!(page.keys, vec!["web/chall.yml", "web/app.py", "web/src/"]);
        assert!(page.truncated);
        assert_eq!(page.next_token.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_get_and_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/challenges/web/chall.yml"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_string("name: Web"))
            .mount(&server)
            .await;

        let s3 = store(&server.uri());
        let body = crate::object_store::get_bytes(&s3, Bucket::Challenges, "web/chall.yml", 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"name: Web");

        let err = s3.stat(Bucket::Challenges, "web/missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_follows_continuation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/challenges"))
            .and(query_param("continuation-token", "next"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<ListBucketResult><IsTruncated>false</IsTruncated><Contents><Key>b/chall.yml</Key></Contents></ListBucketResult>",
            ))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/challenges"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<ListBucketResult><IsTruncated>true</IsTruncated><NextContinuationToken>next</NextContinuationToken><Contents><Key>a/chall.yml</Key></Contents></ListBucketResult>",
            ))
            .with_priority(2)
            .mount(&server)
            .await;

        let s3 = store(&server.uri());
        let keys = crate::object_store::list_all(&s3, Bucket::Challenges, "", true)
            .await
            .unwrap();
        assert_eq!(keys, vec!["a/chall.yml", "b/chall.yml"]);
    }
}
