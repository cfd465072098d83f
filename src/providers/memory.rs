//! In-memory object store for unit tests.
//!
//! Every request is recorded as a [`Call`] and can be failed on demand with
//! [`MemoryServer::fail_when`], which is how binding and retry paths are
//! exercised without a network.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    BucketSummary, ClientFactory, ClientSpec, ListPage, ListRequest, ObjectBody, ObjectHead, ObjectSummary,
    StorageBackend,
};
use crate::config::{AddressingStyle, ConnectionConfig};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Call {
    pub op: &'static str,
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub endpoint_url: String,
    pub region: String,
    pub style: AddressingStyle,
}

type Rule = Box<dyn Fn(&Call) -> Option<StoreError> + Send + Sync>;

#[derive(Default)]
struct ServerState {
    buckets: BTreeMap<String, BTreeMap<String, Bytes>>,
    uploads: HashMap<String, BTreeMap<i32, Bytes>>,
    next_upload: u64,
    public: Vec<String>,
    calls: Vec<Call>,
}

pub(crate) struct MemoryServer {
    state: Mutex<ServerState>,
    rules: Mutex<Vec<Rule>>,
    chunk_size: usize,
    page_size: i32,
}

impl MemoryServer {
    pub fn new() -> Arc<Self> {
        Self::with_limits(64 * 1024, 1000)
    }

    /// `chunk_size` bounds GET body chunks, `page_size` caps listing pages.
    pub fn with_limits(chunk_size: usize, page_size: i32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState::default()),
            rules: Mutex::new(Vec::new()),
            chunk_size,
            page_size,
        })
    }

    pub fn factory(self: &Arc<Self>) -> Arc<MemoryFactory> {
        Arc::new(MemoryFactory { server: self.clone() })
    }

    /// Client for `bucket` built from the default test profile.
    pub fn client(self: &Arc<Self>, bucket: &str) -> Arc<dyn StorageBackend> {
        Arc::new(MemoryBackend {
            server: self.clone(),
            spec: ClientSpec::from_config(&test_profile()).for_bucket(bucket),
        })
    }

    pub fn create_bucket(&self, name: &str) {
        self.state.lock().unwrap().buckets.entry(name.to_string()).or_default();
    }

    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.state
            .lock()
            .unwrap()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data.into());
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state.lock().unwrap().buckets.get(bucket)?.get(key).cloned()
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.state.lock().unwrap().buckets.contains_key(bucket)
    }

    pub fn is_public(&self, bucket: &str, key: &str) -> bool {
        let path = format!("{}/{}", bucket, key);
        self.state.lock().unwrap().public.contains(&path)
    }

    pub fn open_uploads(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, op: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    /// Fail every matching request with the returned error.
    pub fn fail_when(&self, rule: impl Fn(&Call) -> Option<StoreError> + Send + Sync + 'static) {
        self.rules.lock().unwrap().push(Box::new(rule));
    }

    fn check(&self, spec: &ClientSpec, op: &'static str, bucket: Option<&str>, key: Option<&str>) -> Result<(), StoreError> {
        let call = Call {
            op,
            bucket: bucket.map(str::to_string),
            key: key.map(str::to_string),
            endpoint_url: spec.endpoint_url.clone(),
            region: spec.region.clone(),
            style: spec.addressing_style,
        };
        self.state.lock().unwrap().calls.push(call.clone());
        let rules = self.rules.lock().unwrap();
        for rule in rules.iter() {
            if let Some(err) = rule(&call) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn with_bucket<T>(
        &self,
        bucket: &str,
        f: impl FnOnce(&mut BTreeMap<String, Bytes>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock().unwrap();
        match state.buckets.get_mut(bucket) {
            Some(objects) => f(objects),
            None => Err(no_such_bucket(bucket)),
        }
    }
}

pub(crate) fn no_such_bucket(bucket: &str) -> StoreError {
    StoreError::service("NoSuchBucket", format!("The specified bucket does not exist: {}", bucket)).with_status(404)
}

fn no_such_key(key: &str) -> StoreError {
    StoreError::service("NoSuchKey", format!("The specified key does not exist: {}", key)).with_status(404)
}

/// Profile every memory-backed test starts from.
pub(crate) fn test_profile() -> ConnectionConfig {
    ConnectionConfig::new("https://storage.example.com", None, "test-key", "test-secret")
}

pub(crate) struct MemoryBackend {
    server: Arc<MemoryServer>,
    spec: ClientSpec,
}

enum Entry {
    Object(ObjectSummary),
    Prefix(String),
}

impl Entry {
    fn marker(&self) -> &str {
        match self {
            Entry::Object(o) => &o.key,
            Entry::Prefix(p) => p,
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn spec(&self) -> &ClientSpec {
        &self.spec
    }

    async fn list_buckets(&self) -> Result<Vec<BucketSummary>, StoreError> {
        self.server.check(&self.spec, "list_buckets", None, None)?;
        let state = self.server.state.lock().unwrap();
        Ok(state
            .buckets
            .keys()
            .map(|name| BucketSummary {
                name: name.clone(),
                created: None,
            })
            .collect())
    }

    async fn list_objects(&self, request: &ListRequest) -> Result<ListPage, StoreError> {
        self.server
            .check(&self.spec, "list_objects", Some(&request.bucket), Some(&request.prefix))?;
        let page_size = request.max_keys.max(1).min(self.server.page_size) as usize;

        self.server.with_bucket(&request.bucket, |objects| {
            let mut entries: Vec<Entry> = Vec::new();
            for (key, data) in objects.range(request.prefix.clone()..) {
                if !key.starts_with(&request.prefix) {
                    break;
                }
                let rest = &key[request.prefix.len()..];
                let folded = request
                    .delimiter
                    .as_deref()
                    .and_then(|d| rest.find(d).map(|pos| format!("{}{}", request.prefix, &rest[..pos + d.len()])));
                match folded {
                    Some(prefix) => {
                        if !matches!(entries.last(), Some(Entry::Prefix(p)) if *p == prefix) {
                            entries.push(Entry::Prefix(prefix));
                        }
                    }
                    None => entries.push(Entry::Object(ObjectSummary {
                        key: key.clone(),
                        size: data.len() as u64,
                        last_modified: None,
                    })),
                }
            }

            let start = match &request.continuation_token {
                Some(token) => entries
                    .iter()
                    .position(|e| e.marker() > token.as_str())
                    .unwrap_or(entries.len()),
                None => 0,
            };
            let end = (start + page_size).min(entries.len());
            let next_token = if end < entries.len() {
                Some(entries[end - 1].marker().to_string())
            } else {
                None
            };

            let mut page = ListPage {
                next_token,
                ..Default::default()
            };
            for entry in entries.drain(start..end) {
                match entry {
                    Entry::Object(o) => page.objects.push(o),
                    Entry::Prefix(p) => page.common_prefixes.push(p),
                }
            }
            Ok(page)
        })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead, StoreError> {
        self.server.check(&self.spec, "head_object", Some(bucket), Some(key))?;
        self.server.with_bucket(bucket, |objects| {
            let data = objects.get(key).ok_or_else(|| no_such_key(key))?;
            Ok(ObjectHead {
                key: key.to_string(),
                size: data.len() as u64,
                etag: Some(format!("\"{:x}\"", data.len())),
                last_modified: None,
                content_type: None,
            })
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, StoreError> {
        self.server.check(&self.spec, "get_object", Some(bucket), Some(key))?;
        let data = self
            .server
            .with_bucket(bucket, |objects| objects.get(key).cloned().ok_or_else(|| no_such_key(key)))?;

        let chunk_size = self.server.chunk_size.max(1);
        let chunks: Vec<Result<Bytes, StoreError>> = (0..data.len())
            .step_by(chunk_size)
            .map(|start| Ok(data.slice(start..(start + chunk_size).min(data.len()))))
            .collect();

        Ok(ObjectBody {
            content_length: Some(data.len() as u64),
            chunks: stream::iter(chunks).boxed(),
        })
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.server.check(&self.spec, "put_object", Some(bucket), Some(key))?;
        self.server.with_bucket(bucket, |objects| {
            objects.insert(key.to_string(), body);
            Ok(())
        })
    }

    async fn create_multipart_upload(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        self.server.check(&self.spec, "create_multipart_upload", Some(bucket), Some(key))?;
        self.server.with_bucket(bucket, |_| Ok(()))?;
        let mut state = self.server.state.lock().unwrap();
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(upload_id.clone(), BTreeMap::new());
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, StoreError> {
        self.server.check(&self.spec, "upload_part", Some(bucket), Some(key))?;
        let mut state = self.server.state.lock().unwrap();
        let parts = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::service("NoSuchUpload", upload_id.to_string()))?;
        parts.insert(part_number, body);
        Ok(format!("\"etag-{}\"", part_number))
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<(i32, String)>,
    ) -> Result<(), StoreError> {
        self.server.check(&self.spec, "complete_multipart_upload", Some(bucket), Some(key))?;
        let mut state = self.server.state.lock().unwrap();
        let uploaded = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StoreError::service("NoSuchUpload", upload_id.to_string()))?;
        let mut data = Vec::new();
        for (part_number, _) in &parts {
            let part = uploaded
                .get(part_number)
                .ok_or_else(|| StoreError::service("InvalidPart", part_number.to_string()))?;
            data.extend_from_slice(part);
        }
        state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| no_such_bucket(bucket))?
            .insert(key.to_string(), Bytes::from(data));
        Ok(())
    }

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<(), StoreError> {
        self.server.check(&self.spec, "abort_multipart_upload", Some(bucket), Some(key))?;
        self.server.state.lock().unwrap().uploads.remove(upload_id);
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.server.check(&self.spec, "delete_object", Some(bucket), Some(key))?;
        self.server.with_bucket(bucket, |objects| {
            objects.remove(key);
            Ok(())
        })
    }

    async fn put_public_read_acl(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.server.check(&self.spec, "put_public_read_acl", Some(bucket), Some(key))?;
        self.server.with_bucket(bucket, |objects| {
            if objects.contains_key(key) {
                Ok(())
            } else {
                Err(no_such_key(key))
            }
        })?;
        self.server.state.lock().unwrap().public.push(format!("{}/{}", bucket, key));
        Ok(())
    }

    async fn presigned_get_url(&self, bucket: &str, key: &str, expires_in: Duration) -> Result<String, StoreError> {
        self.server.check(&self.spec, "presigned_get_url", Some(bucket), Some(key))?;
        Ok(format!(
            "{}/{}/{}?X-Amz-Expires={}",
            self.spec.endpoint_url,
            bucket,
            key,
            expires_in.as_secs()
        ))
    }

    async fn create_bucket(&self, bucket: &str, _region: Option<&str>) -> Result<(), StoreError> {
        self.server.check(&self.spec, "create_bucket", Some(bucket), None)?;
        let mut state = self.server.state.lock().unwrap();
        if state.buckets.contains_key(bucket) {
            return Err(StoreError::service("BucketAlreadyOwnedByYou", bucket.to_string()).with_status(409));
        }
        state.buckets.insert(bucket.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        self.server.check(&self.spec, "delete_bucket", Some(bucket), None)?;
        let mut state = self.server.state.lock().unwrap();
        match state.buckets.get(bucket) {
            None => Err(no_such_bucket(bucket)),
            Some(objects) if !objects.is_empty() => {
                Err(StoreError::service("BucketNotEmpty", bucket.to_string()).with_status(409))
            }
            Some(_) => {
                state.buckets.remove(bucket);
                Ok(())
            }
        }
    }
}

pub(crate) struct MemoryFactory {
    server: Arc<MemoryServer>,
}

impl ClientFactory for MemoryFactory {
    fn build(&self, spec: &ClientSpec) -> Result<Arc<dyn StorageBackend>, StoreError> {
        Ok(Arc::new(MemoryBackend {
            server: self.server.clone(),
            spec: spec.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listing_folds_prefixes_and_paginates() {
        let server = MemoryServer::with_limits(1024, 2);
        for key in ["a/1", "a/2", "a/b/c", "a/b/d", "a/e/f", "b"] {
            server.put("bk", key, "x");
        }
        let client = server.client("bk");

        let mut markers = Vec::new();
        let mut token = None;
        loop {
            let page = client
                .list_objects(&ListRequest::new("bk", "a/").delimiter("/").continuation_token(token))
                .await
                .unwrap();
            markers.extend(page.objects.into_iter().map(|o| o.key));
            markers.extend(page.common_prefixes);
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }
        markers.sort();
        assert_eq!(markers, vec!["a/1", "a/2", "a/b/", "a/e/"]);
    }
}
