//! The facade the presentation layer talks to.
//!
//! A [`Model`] owns one connection profile, the binding of the bucket being
//! browsed, the navigation position and the job dispatcher. All state changes
//! go through `&mut self`, so a single owner drives it; long-running work is
//! handed to spawned tasks (transfer jobs, [`Model::spawn_total_size`]).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::binder::{BucketBinding, BucketHandle, ConnectionBinder};
use crate::config::{ConnectionConfig, TransferConfig};
use crate::dispatcher::{JobDispatcher, JobHandle};
use crate::error::{ListError, ModelError, StoreError};
use crate::lister::{self, DELIMITER};
use crate::location::{FsObject, Location};
use crate::providers::{ClientFactory, ListRequest, ObjectHead, S3ClientFactory};
use crate::transfer::{JobEvent, JobKind, TransferJob};

/// Result of [`Model::set_public_read_acl`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AclOutcome {
    Applied,
    /// The backend has no ACL support; not an error for the caller.
    NotSupported { reason: String },
}

/// What the properties dialog shows for a key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectProperties {
    BucketRoot {
        bucket: String,
    },
    /// `size` is the recursive total under the prefix
    Folder {
        key: String,
        size: u64,
    },
    File {
        key: String,
        size: u64,
        etag: Option<String>,
        last_modified: Option<DateTime<Utc>>,
        content_type: Option<String>,
    },
}

impl From<ObjectHead> for ObjectProperties {
    fn from(head: ObjectHead) -> Self {
        ObjectProperties::File {
            key: head.key,
            size: head.size,
            etag: head.etag,
            last_modified: head.last_modified,
            content_type: head.content_type,
        }
    }
}

/// Human reason for a failed check: the backend message when there is one.
fn reason(err: &StoreError) -> String {
    match err {
        StoreError::Service { message, .. } if !message.is_empty() => message.clone(),
        other => other.to_string(),
    }
}

pub struct Model {
    binder: ConnectionBinder,
    dispatcher: JobDispatcher,
    location: Location,
    previous: Location,
}

impl Model {
    /// Model talking to a real S3-compatible endpoint.
    pub fn connect(profile: ConnectionConfig) -> Self {
        Self::new(profile, Arc::new(S3ClientFactory))
    }

    pub fn new(profile: ConnectionConfig, factory: Arc<dyn ClientFactory>) -> Self {
        Self::with_transfer_config(profile, factory, TransferConfig::default())
    }

    pub fn with_transfer_config(
        profile: ConnectionConfig,
        factory: Arc<dyn ClientFactory>,
        config: TransferConfig,
    ) -> Self {
        Self {
            binder: ConnectionBinder::new(profile, factory),
            dispatcher: JobDispatcher::new(config),
            location: Location::root(),
            previous: Location::root(),
        }
    }

    pub fn profile(&self) -> &ConnectionConfig {
        self.binder.profile()
    }

    /// Switch credentials or endpoint. Cached clients are dropped and the
    /// view goes back to the bucket list.
    pub fn set_profile(&mut self, profile: ConnectionConfig) {
        self.binder.set_profile(profile);
        self.location = Location::root();
        self.previous = Location::root();
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn binding(&self) -> Option<&BucketBinding> {
        self.binder.binding()
    }

    pub fn current_region(&self) -> String {
        self.binder.current_region()
    }

    async fn list_at(&mut self, location: &Location) -> Result<Vec<FsObject>, ModelError> {
        if location.is_bucket_list() {
            self.binder.return_to_root_scope();
            let buckets = self
                .binder
                .list_accessible_buckets()
                .await
                .map_err(|e| ListError::new("", "", e))?;
            return Ok(lister::buckets_to_objects(buckets));
        }

        if self.binder.binding_for(location.bucket()).is_none() {
            self.binder.bind_bucket(location.bucket()).await?;
        }
        Ok(lister::list(&mut self.binder, location.bucket(), location.prefix()).await?)
    }

    /// Move to `location` and list it. A failure inside a bucket leaves the
    /// bucket: the binding is dropped and the view is the bucket list again.
    pub async fn navigate(&mut self, location: Location) -> Result<Vec<FsObject>, ModelError> {
        match self.list_at(&location).await {
            Ok(items) => {
                if location != self.location {
                    self.previous = std::mem::replace(&mut self.location, location);
                }
                Ok(items)
            }
            Err(err) => {
                warn!("navigate: {} failed: {}", location, err);
                if !location.is_bucket_list() {
                    self.binder.return_to_root_scope();
                    if !self.location.is_bucket_list() {
                        self.previous = std::mem::replace(&mut self.location, Location::root());
                    }
                }
                Err(err)
            }
        }
    }

    /// Re-list the current location.
    pub async fn list_current(&mut self) -> Result<Vec<FsObject>, ModelError> {
        self.navigate(self.location.clone()).await
    }

    pub async fn enter_bucket(&mut self, bucket: &str) -> Result<Vec<FsObject>, ModelError> {
        self.navigate(Location::bucket_root(bucket)).await
    }

    /// Open the folder `name` of the current level (a bucket, from the list).
    pub async fn enter_folder(&mut self, name: &str) -> Result<Vec<FsObject>, ModelError> {
        self.navigate(self.location.child(name)).await
    }

    pub async fn go_up(&mut self) -> Result<Vec<FsObject>, ModelError> {
        self.navigate(self.location.up()).await
    }

    pub async fn go_back(&mut self) -> Result<Vec<FsObject>, ModelError> {
        self.navigate(self.previous.clone()).await
    }

    /// Root of the current bucket.
    pub async fn go_home(&mut self) -> Result<Vec<FsObject>, ModelError> {
        self.navigate(Location::bucket_root(self.location.bucket())).await
    }

    /// Leave the bucket without listing anything.
    pub fn return_to_root_scope(&mut self) {
        self.binder.return_to_root_scope();
        if !self.location.is_bucket_list() {
            self.previous = std::mem::replace(&mut self.location, Location::root());
        }
    }

    fn handle(&self) -> Result<BucketHandle, ModelError> {
        self.binder
            .binding_for(self.location.bucket())
            .map(BucketBinding::handle)
            .ok_or(ModelError::NoBucketSelected)
    }

    pub async fn head_object(&self, key: &str) -> Result<ObjectHead, ModelError> {
        let handle = self.handle()?;
        Ok(handle.client.head_object(&handle.bucket, key).await?)
    }

    /// Sum of object sizes under `prefix`, across every page.
    pub async fn total_size(&self, prefix: &str) -> Result<u64, ModelError> {
        let handle = self.handle()?;
        Ok(lister::total_size(&handle, prefix).await?)
    }

    /// [`Model::total_size`] on its own task, for bucket-wide totals.
    pub fn spawn_total_size(&self, prefix: &str) -> Result<JoinHandle<Result<u64, StoreError>>, ModelError> {
        let handle = self.handle()?;
        let prefix = prefix.to_string();
        Ok(tokio::spawn(async move { lister::total_size(&handle, &prefix).await }))
    }

    pub async fn presigned_url(&self, key: &str, expires_in: Duration) -> Result<String, ModelError> {
        let handle = self.handle()?;
        Ok(handle.client.presigned_get_url(&handle.bucket, key, expires_in).await?)
    }

    pub async fn set_public_read_acl(&self, key: &str) -> Result<AclOutcome, ModelError> {
        let handle = self.handle()?;
        match handle.client.put_public_read_acl(&handle.bucket, key).await {
            Ok(()) => {
                info!("acl_public_read: s3://{}/{}", handle.bucket, key);
                Ok(AclOutcome::Applied)
            }
            Err(err) if err.is_acl_unsupported() => {
                warn!("acl_public_read: s3://{}/{} not supported: {}", handle.bucket, key, err);
                Ok(AclOutcome::NotSupported { reason: reason(&err) })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Create the placeholder `prefix + name + "/"` at the current level and
    /// return its key.
    pub async fn create_folder(&self, name: &str) -> Result<String, ModelError> {
        let handle = self.handle()?;
        let name = name.trim().trim_matches('/');
        if name.is_empty() {
            return Err(StoreError::InvalidConfig {
                message: "folder name is empty".to_string(),
            }
            .into());
        }
        let key = format!("{}{}", self.location.key_for(name), DELIMITER);
        handle.client.put_object(&handle.bucket, &key, Bytes::new()).await?;
        info!("create_folder: s3://{}/{}", handle.bucket, key);
        Ok(key)
    }

    pub async fn object_properties(&self, key: &str) -> Result<ObjectProperties, ModelError> {
        let handle = self.handle()?;
        if key.is_empty() {
            return Ok(ObjectProperties::BucketRoot { bucket: handle.bucket });
        }
        if key.ends_with(DELIMITER) {
            let size = lister::total_size(&handle, key).await?;
            return Ok(ObjectProperties::Folder {
                key: key.to_string(),
                size,
            });
        }
        Ok(handle.client.head_object(&handle.bucket, key).await?.into())
    }

    /// Verify write access to the current bucket by creating and deleting a
    /// throwaway placeholder. The delete is attempted even if the create fails.
    pub async fn check_profile(&self) -> (bool, Option<String>) {
        let handle = match self.handle() {
            Ok(handle) => handle,
            Err(err) => return (false, Some(err.to_string())),
        };
        let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let key = format!("s3duck-check-{}{}", stamp, DELIMITER);

        let created = handle.client.put_object(&handle.bucket, &key, Bytes::new()).await;
        let deleted = handle.client.delete_object(&handle.bucket, &key).await;
        match created.and(deleted) {
            Ok(()) => (true, None),
            Err(err) => {
                warn!("check_profile: bucket={} failed: {}", handle.bucket, err);
                (false, Some(reason(&err)))
            }
        }
    }

    /// Whether `bucket` shows up in the account's bucket list.
    pub async fn check_bucket(&self, bucket: &str) -> (bool, Option<String>) {
        match self.binder.list_accessible_buckets().await {
            Ok(buckets) if buckets.iter().any(|b| b.name == bucket) => (true, None),
            Ok(_) => (false, Some("bucket not found".to_string())),
            Err(err) => (false, Some(reason(&err))),
        }
    }

    /// Create `bucket` through the root endpoint, constrained to the profile
    /// region when one is configured.
    pub async fn create_bucket(&mut self, bucket: &str) -> Result<(), ModelError> {
        let client = self.binder.root_client()?;
        let region = self.binder.profile().known_region().map(str::to_string);
        client.create_bucket(bucket, region.as_deref()).await?;
        info!("create_bucket: {} region={:?}", bucket, region);
        Ok(())
    }

    async fn delete_bound_bucket(&mut self, bucket: &str) -> Result<(), ModelError> {
        let handle = match self.binder.binding_for(bucket) {
            Some(binding) => binding.handle(),
            None => self.binder.bind_bucket(bucket).await?.handle(),
        };
        let page = handle
            .client
            .list_objects(&ListRequest::new(bucket, "").delimiter(DELIMITER).max_keys(1))
            .await?;
        if !page.objects.is_empty() || !page.common_prefixes.is_empty() {
            return Err(ModelError::NotEmpty {
                bucket: bucket.to_string(),
            });
        }
        handle.client.delete_bucket(bucket).await?;
        info!("delete_bucket: {}", bucket);
        Ok(())
    }

    /// Delete an empty bucket. Whatever the outcome, the view ends up at the
    /// bucket list with no bucket bound.
    pub async fn delete_bucket(&mut self, bucket: &str) -> Result<(), ModelError> {
        let result = self.delete_bound_bucket(bucket).await;
        self.return_to_root_scope();
        result
    }

    /// Run `job` against the current bucket. With `refresh`, a
    /// [`JobEvent::RefreshNeeded`] follows any change to the bucket.
    pub fn submit(&self, kind: JobKind, job: TransferJob, refresh: bool) -> Result<JobHandle, ModelError> {
        let handle = self.handle()?;
        Ok(self.dispatcher.submit(handle, kind, job, refresh))
    }

    pub fn cancel(&self, job: &JobHandle) {
        self.dispatcher.cancel(job);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        self.dispatcher.subscribe()
    }

    pub fn is_job_active(&self, kind: JobKind) -> bool {
        self.dispatcher.is_active(kind)
    }
}
