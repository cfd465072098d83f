//! Storage backends.
//!
//! The rest of the crate talks to object storage only through
//! [`StorageBackend`]; [`ClientFactory`] turns a [`ClientSpec`] into a live
//! backend so the binder can try several endpoint/region/style combinations.

pub mod hints;
mod s3_client;

#[cfg(test)]
pub(crate) mod memory;

pub use s3_client::{create_s3_client, S3Backend, S3ClientFactory};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AddressingStyle, ConnectionConfig};
use crate::error::StoreError;

/// Everything needed to build one client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSpec {
    /// Empty means the provider default endpoint
    pub endpoint_url: String,
    /// Signing region, never empty
    pub region: String,
    pub addressing_style: AddressingStyle,
    pub access_key: String,
    pub secret_key: String,
    pub verify_tls: bool,
    pub connect_timeout: Duration,
    pub retries: u32,
    /// Bucket the client is built for; a virtual-style endpoint may already
    /// carry it as its leftmost host label.
    pub bound_bucket: Option<String>,
}

impl ClientSpec {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            endpoint_url: config.endpoint_url.trim().to_string(),
            region: config.signing_region().to_string(),
            addressing_style: config.addressing_style,
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            verify_tls: config.verify_tls,
            connect_timeout: config.connect_timeout(),
            retries: config.retries,
            bound_bucket: None,
        }
    }

    pub fn for_bucket(mut self, bucket: &str) -> Self {
        self.bound_bucket = Some(bucket.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSummary {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectHead {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub content_type: Option<String>,
}

/// One `ListObjectsV2` request.
#[derive(Debug, Clone, PartialEq)]
pub struct ListRequest {
    pub bucket: String,
    pub prefix: String,
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
    pub max_keys: i32,
}

impl ListRequest {
    pub fn new(bucket: &str, prefix: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            delimiter: None,
            continuation_token: None,
            max_keys: 1000,
        }
    }

    pub fn delimiter(mut self, delimiter: &str) -> Self {
        self.delimiter = Some(delimiter.to_string());
        self
    }

    pub fn max_keys(mut self, max_keys: i32) -> Self {
        self.max_keys = max_keys;
        self
    }

    pub fn continuation_token(mut self, token: Option<String>) -> Self {
        self.continuation_token = token;
        self
    }
}

/// One page of a listing. `next_token` is set while the listing is truncated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    pub objects: Vec<ObjectSummary>,
    pub common_prefixes: Vec<String>,
    pub next_token: Option<String>,
}

pub type ByteChunks = BoxStream<'static, Result<Bytes, StoreError>>;

/// Streaming body of a GET.
pub struct ObjectBody {
    pub content_length: Option<u64>,
    pub chunks: ByteChunks,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Parameters this backend was built from.
    fn spec(&self) -> &ClientSpec;

    async fn list_buckets(&self) -> Result<Vec<BucketSummary>, StoreError>;

    async fn list_objects(&self, request: &ListRequest) -> Result<ListPage, StoreError>;

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead, StoreError>;

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError>;

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError>;

    /// Returns the upload id.
    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, StoreError>;

    /// Returns the part ETag.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StoreError>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
    ) -> Result<(), StoreError>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), StoreError>;

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError>;

    /// Apply the canned `public-read` ACL.
    async fn put_public_read_acl(&self, bucket: &str, key: &str) -> Result<(), StoreError>;

    async fn presigned_get_url(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<String, StoreError>;

    async fn create_bucket(&self, bucket: &str, region: Option<&str>) -> Result<(), StoreError>;

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StoreError>;
}

pub trait ClientFactory: Send + Sync {
    fn build(&self, spec: &ClientSpec) -> Result<Arc<dyn StorageBackend>, StoreError>;
}
