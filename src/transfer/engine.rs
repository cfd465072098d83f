//! Transfer engine - runs one job under one cancel token

use bytes::Bytes;
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

use super::aggregator::ProgressAggregator;
use super::cancel::CancelToken;
use super::events::{EventSink, JobEvent};
use super::types::{JobKind, JobOutcome, JobState, TransferJob};
use crate::binder::BucketHandle;
use crate::config::TransferConfig;
use crate::error::{StoreError, TransferError};
use crate::lister;
use crate::location::last_segment;
use crate::providers::ObjectSummary;

/// Everything a running job reports through.
pub struct JobContext {
    pub job_id: u64,
    pub token: CancelToken,
    pub sink: Arc<dyn EventSink>,
    pub aggregator: Arc<ProgressAggregator>,
    pub state: watch::Sender<JobState>,
    /// Emit [`JobEvent::RefreshNeeded`] after the batch if anything changed
    pub refresh: bool,
}

impl JobContext {
    pub fn line(&self, text: String) {
        info!("job {}: {}", self.job_id, text);
        self.sink.emit(JobEvent::ProgressLine {
            job_id: self.job_id,
            text,
        });
    }

    fn set_state(&self, state: JobState) {
        debug!("job_state: {} -> {}", self.job_id, state);
        self.state.send_replace(state);
    }
}

/// Download work resolved during Preparing.
enum DownloadStep<'a> {
    Object {
        item: usize,
        key: &'a str,
        local_path: &'a Path,
        size: u64,
    },
    Folder {
        item: usize,
        prefix: String,
        base_dir: PathBuf,
        objects: Vec<ObjectSummary>,
    },
}

/// Placeholder key for folder `key`. The bucket root has no placeholder and
/// maps to the empty prefix.
pub fn placeholder_key(key: &str) -> String {
    let trimmed = key.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Join a key relative to a downloaded prefix under `base`, refusing anything
/// that would land outside it.
pub fn local_target(base: &Path, relative_key: &str) -> Result<PathBuf, StoreError> {
    let mut path = base.to_path_buf();
    for segment in relative_key.split('/').filter(|s| !s.is_empty()) {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => path.push(part),
            _ => {
                return Err(StoreError::Io {
                    path: relative_key.to_string(),
                    message: "key does not map to a path inside the destination".to_string(),
                })
            }
        }
    }
    Ok(path)
}

async fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

pub struct TransferEngine {
    handle: BucketHandle,
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(handle: BucketHandle, config: TransferConfig) -> Self {
        Self { handle, config }
    }

    /// Run `job` to a terminal state. Items go in submission order; the first
    /// failing item stops the batch and earlier items stay as they are.
    pub async fn run(&self, kind: JobKind, job: &TransferJob, ctx: &JobContext) -> JobOutcome {
        ctx.set_state(JobState::Preparing);
        let mut mutated = false;

        let result = match kind {
            JobKind::Download => self.download(job, ctx).await,
            JobKind::Upload => self.upload(job, ctx, &mut mutated).await,
            JobKind::Delete => self.delete(job, ctx, &mut mutated).await,
        };

        let outcome = match result {
            Ok(()) => {
                ctx.aggregator.finish();
                JobOutcome::Completed
            }
            Err(TransferError::Cancelled) => JobOutcome::Cancelled,
            Err(err) => {
                warn!("job {}: {}", ctx.job_id, err);
                JobOutcome::Failed(err.to_string())
            }
        };

        if ctx.refresh && mutated {
            ctx.sink.emit(JobEvent::RefreshNeeded { job_id: ctx.job_id });
        }
        ctx.set_state(outcome.state());
        outcome
    }

    async fn download(&self, job: &TransferJob, ctx: &JobContext) -> Result<(), TransferError> {
        let mut steps = Vec::with_capacity(job.len());
        let mut total = 0u64;

        for (index, item) in job.items().iter().enumerate() {
            ctx.token.check()?;
            match (&item.local_path, &item.destination_dir) {
                (Some(local_path), _) => {
                    let size = match item.known_size {
                        Some(size) => size,
                        None => self.remote_size(&item.remote_key).await,
                    };
                    total += size;
                    steps.push(DownloadStep::Object {
                        item: index,
                        key: item.remote_key.as_str(),
                        local_path: local_path.as_path(),
                        size,
                    });
                }
                (None, Some(destination_dir)) => {
                    let prefix = placeholder_key(&item.remote_key);
                    let objects = lister::list_keys(&self.handle, &prefix)
                        .await
                        .map_err(|e| TransferError::failed(format!("listing {}", prefix), e))?;
                    total += objects.iter().filter(|o| !o.key.ends_with('/')).map(|o| o.size).sum::<u64>();
                    let base_name = match last_segment(&prefix) {
                        "" => self.handle.bucket.as_str(),
                        name => name,
                    };
                    steps.push(DownloadStep::Folder {
                        item: index,
                        base_dir: destination_dir.join(base_name),
                        prefix,
                        objects,
                    });
                }
                (None, None) => {
                    return Err(TransferError::failed(
                        format!("download {}", item.remote_key),
                        StoreError::InvalidConfig {
                            message: "download item needs a local path or a destination directory".to_string(),
                        },
                    ))
                }
            }
        }

        ctx.aggregator.begin(total);
        ctx.set_state(JobState::Running);

        for step in steps {
            ctx.token.check()?;
            match step {
                DownloadStep::Object {
                    item,
                    key,
                    local_path,
                    size,
                } => {
                    ctx.line(format!("downloading {} -> {} ({} bytes)", key, local_path.display(), size));
                    self.fetch(item, key, local_path, ctx).await?;
                }
                DownloadStep::Folder {
                    item,
                    prefix,
                    base_dir,
                    objects,
                } => {
                    ctx.line(format!("downloading directory: {} -> {}", prefix, base_dir.display()));
                    create_dir(&base_dir).await?;
                    for object in objects {
                        ctx.token.check()?;
                        let relative = object.key.strip_prefix(prefix.as_str()).unwrap_or(&object.key);
                        if relative.is_empty() {
                            continue;
                        }
                        let target = local_target(&base_dir, relative)
                            .map_err(|e| TransferError::failed(format!("download {}", object.key), e))?;
                        if object.key.ends_with('/') {
                            create_dir(&target).await?;
                            continue;
                        }
                        if let Some(parent) = target.parent() {
                            create_dir(parent).await?;
                        }
                        ctx.line(format!(
                            "downloading {} -> {} ({} bytes)",
                            object.key,
                            target.display(),
                            object.size
                        ));
                        self.fetch(item, &object.key, &target, ctx).await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Size via HEAD; an unreadable size only costs percentage accuracy, the
    /// GET that follows reports the real error.
    async fn remote_size(&self, key: &str) -> u64 {
        match self.handle.client.head_object(&self.handle.bucket, key).await {
            Ok(head) => head.size,
            Err(e) => {
                debug!("head_object {} failed: {}", key, e);
                0
            }
        }
    }

    /// Stream one object to `local_path`. A cancelled download leaves the
    /// partial file behind.
    async fn fetch(&self, item: usize, key: &str, local_path: &Path, ctx: &JobContext) -> Result<(), TransferError> {
        let operation = || format!("download {}", key);
        let body = self
            .handle
            .client
            .get_object(&self.handle.bucket, key)
            .await
            .map_err(|e| TransferError::failed(operation(), e))?;

        let mut file = File::create(local_path)
            .await
            .map_err(|e| TransferError::failed(operation(), StoreError::io(local_path, e)))?;

        let mut received = 0u64;
        let mut chunks = body.chunks;
        while let Some(chunk) = chunks.next().await {
            ctx.token.check()?;
            let chunk = chunk.map_err(|e| TransferError::failed(operation(), e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::failed(operation(), StoreError::io(local_path, e)))?;
            received += chunk.len() as u64;
            ctx.aggregator.record(item, key, received);
        }

        file.flush()
            .await
            .map_err(|e| TransferError::failed(operation(), StoreError::io(local_path, e)))?;
        Ok(())
    }

    async fn upload(&self, job: &TransferJob, ctx: &JobContext, mutated: &mut bool) -> Result<(), TransferError> {
        let mut sizes = Vec::with_capacity(job.len());
        for item in job.items() {
            ctx.token.check()?;
            let size = match &item.local_path {
                Some(path) => tokio::fs::metadata(path)
                    .await
                    .map_err(|e| TransferError::failed(format!("upload {}", path.display()), StoreError::io(path, e)))?
                    .len(),
                None => 0,
            };
            sizes.push(size);
        }

        ctx.aggregator.begin(sizes.iter().sum());
        ctx.set_state(JobState::Running);

        for (index, (item, size)) in job.items().iter().zip(sizes).enumerate() {
            ctx.token.check()?;
            match &item.local_path {
                None => {
                    let key = placeholder_key(&item.remote_key);
                    if key.is_empty() {
                        debug!("job {}: bucket root needs no placeholder", ctx.job_id);
                        continue;
                    }
                    ctx.line(format!("creating folder {}", key));
                    self.handle
                        .client
                        .put_object(&self.handle.bucket, &key, Bytes::new())
                        .await
                        .map_err(|e| TransferError::failed(format!("create folder {}", key), e))?;
                }
                Some(path) => {
                    ctx.line(format!("uploading {} -> {}", path.display(), item.remote_key));
                    self.send(index, path, &item.remote_key, size, ctx).await?;
                }
            }
            *mutated = true;
        }

        Ok(())
    }

    /// Upload one file. Files that fit in a single part go up with one PUT;
    /// anything larger is sent part by part so progress and cancellation
    /// move with every part.
    async fn send(&self, item: usize, path: &Path, key: &str, size: u64, ctx: &JobContext) -> Result<(), TransferError> {
        let operation = || format!("upload {}", path.display());

        if !self.config.uses_multipart(size) {
            let data = tokio::fs::read(path)
                .await
                .map_err(|e| TransferError::failed(operation(), StoreError::io(path, e)))?;
            ctx.token.check()?;
            self.handle
                .client
                .put_object(&self.handle.bucket, key, Bytes::from(data))
                .await
                .map_err(|e| TransferError::failed(operation(), e))?;
            ctx.aggregator.record(item, key, size);
            return Ok(());
        }

        let upload_id = self
            .handle
            .client
            .create_multipart_upload(&self.handle.bucket, key)
            .await
            .map_err(|e| TransferError::failed(operation(), e))?;

        match self.send_parts(item, path, key, &upload_id, ctx).await {
            Ok(parts) => self
                .handle
                .client
                .complete_multipart_upload(&self.handle.bucket, key, &upload_id, parts)
                .await
                .map_err(|e| TransferError::failed(operation(), e)),
            Err(err) => {
                if let Err(abort_err) = self
                    .handle
                    .client
                    .abort_multipart_upload(&self.handle.bucket, key, &upload_id)
                    .await
                {
                    warn!("abort_multipart_upload {} failed: {}", key, abort_err);
                }
                Err(err)
            }
        }
    }

    async fn send_parts(
        &self,
        item: usize,
        path: &Path,
        key: &str,
        upload_id: &str,
        ctx: &JobContext,
    ) -> Result<Vec<(i32, String)>, TransferError> {
        let operation = || format!("upload {}", path.display());
        let mut file = File::open(path)
            .await
            .map_err(|e| TransferError::failed(operation(), StoreError::io(path, e)))?;

        let mut buffer = vec![0u8; self.config.part_size.max(1) as usize];
        let mut parts = Vec::new();
        let mut sent = 0u64;
        let mut part_number = 1;

        loop {
            let n = read_full(&mut file, &mut buffer)
                .await
                .map_err(|e| TransferError::failed(operation(), StoreError::io(path, e)))?;
            if n == 0 {
                break;
            }
            ctx.token.check()?;

            let etag = self
                .handle
                .client
                .upload_part(
                    &self.handle.bucket,
                    key,
                    upload_id,
                    part_number,
                    Bytes::copy_from_slice(&buffer[..n]),
                )
                .await
                .map_err(|e| TransferError::failed(operation(), e))?;
            parts.push((part_number, etag));

            sent += n as u64;
            ctx.aggregator.record(item, key, sent);
            part_number += 1;
        }

        Ok(parts)
    }

    async fn delete(&self, job: &TransferJob, ctx: &JobContext, mutated: &mut bool) -> Result<(), TransferError> {
        ctx.aggregator.begin(0);
        ctx.set_state(JobState::Running);

        for item in job.items() {
            ctx.token.check()?;
            if item.is_folder_key() {
                ctx.line(format!("deleting folder {}", item.remote_key));
                let objects = lister::list_keys(&self.handle, &item.remote_key)
                    .await
                    .map_err(|e| TransferError::failed(format!("listing {}", item.remote_key), e))?;
                for object in objects {
                    ctx.token.check()?;
                    self.delete_key(&object.key).await?;
                    *mutated = true;
                }
            } else {
                ctx.line(format!("deleting {}", item.remote_key));
                self.delete_key(&item.remote_key).await?;
                *mutated = true;
            }
        }

        Ok(())
    }

    async fn delete_key(&self, key: &str) -> Result<(), TransferError> {
        self.handle
            .client
            .delete_object(&self.handle.bucket, key)
            .await
            .map_err(|e| TransferError::failed(format!("delete {}", key), e))
    }
}

async fn create_dir(path: &Path) -> Result<(), TransferError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| TransferError::failed(format!("create directory {}", path.display()), StoreError::io(path, e)))
}
