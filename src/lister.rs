//! One directory level at a time out of a flat key space.

use log::{debug, warn};

use crate::binder::{BucketHandle, ConnectionBinder};
use crate::error::{ListError, StoreError};
use crate::location::{last_segment, FsObject};
use crate::providers::{BucketSummary, ListRequest, ObjectSummary};

pub const DELIMITER: &str = "/";
const PAGE_SIZE: i32 = 1000;

/// Every page of one listing, concatenated.
async fn list_pages(
    handle: &BucketHandle,
    prefix: &str,
    delimiter: Option<&str>,
) -> Result<(Vec<ObjectSummary>, Vec<String>), StoreError> {
    let mut objects = Vec::new();
    let mut folders = Vec::new();
    let mut continuation_token: Option<String> = None;
    let mut page_count = 0;

    loop {
        let mut request = ListRequest::new(&handle.bucket, prefix)
            .max_keys(PAGE_SIZE)
            .continuation_token(continuation_token.take());
        if let Some(d) = delimiter {
            request = request.delimiter(d);
        }

        let page = handle.client.list_objects(&request).await?;
        page_count += 1;
        objects.extend(page.objects);
        folders.extend(page.common_prefixes);

        match page.next_token {
            Some(token) => continuation_token = Some(token),
            None => break,
        }
    }

    debug!(
        "list_pages: s3://{}/{} pages={} objects={} folders={}",
        handle.bucket,
        prefix,
        page_count,
        objects.len(),
        folders.len()
    );
    Ok((objects, folders))
}

/// Entries directly under `prefix`: one folder per common prefix, one file per
/// key. The placeholder object for `prefix` itself is not a child and is left
/// out.
pub async fn list_level(handle: &BucketHandle, prefix: &str) -> Result<Vec<FsObject>, StoreError> {
    let (objects, folders) = list_pages(handle, prefix, Some(DELIMITER)).await?;

    let mut items = Vec::with_capacity(objects.len() + folders.len());
    for folder in folders {
        let name = last_segment(&folder);
        if name.is_empty() {
            continue;
        }
        items.push(FsObject::Folder { name: name.to_string() });
    }

    for obj in objects {
        if obj.key == prefix {
            continue;
        }
        let name = obj.key.rsplit('/').next().unwrap_or_default();
        if name.is_empty() {
            // A backend that ignored the delimiter; nested placeholders are not files.
            debug!("list_level: skipping placeholder {}", obj.key);
            continue;
        }
        items.push(FsObject::File {
            name: name.to_string(),
            size: obj.size,
            modified: obj.last_modified,
        });
    }

    Ok(items)
}

/// Every key under `prefix`, placeholders included.
pub async fn list_keys(handle: &BucketHandle, prefix: &str) -> Result<Vec<ObjectSummary>, StoreError> {
    let (objects, _) = list_pages(handle, prefix, None).await?;
    Ok(objects)
}

/// Bytes stored under `prefix`, placeholder keys excluded.
pub async fn total_size(handle: &BucketHandle, prefix: &str) -> Result<u64, StoreError> {
    let objects = list_keys(handle, prefix).await?;
    Ok(objects
        .iter()
        .filter(|obj| !obj.key.ends_with(DELIMITER))
        .map(|obj| obj.size)
        .sum())
}

pub fn buckets_to_objects(buckets: Vec<BucketSummary>) -> Vec<FsObject> {
    buckets
        .into_iter()
        .map(|bucket| FsObject::Bucket {
            name: bucket.name,
            created: bucket.created,
        })
        .collect()
}

/// List a level of the bucket `binder` is bound to.
///
/// A failure that names the region the backend expects is retried once with
/// that region; when the retry works the region is promoted into the binding
/// so later calls go straight there.
pub async fn list(binder: &mut ConnectionBinder, bucket: &str, prefix: &str) -> Result<Vec<FsObject>, ListError> {
    let binding = binder.binding_for(bucket).ok_or_else(|| {
        ListError::new(
            bucket,
            prefix,
            StoreError::InvalidConfig {
                message: format!("bucket {} is not bound", bucket),
            },
        )
    })?;
    let current_region = binding.region.clone();

    let err = match list_level(&binding.handle(), prefix).await {
        Ok(items) => return Ok(items),
        Err(err) => err,
    };

    let hinted = err
        .expected_region()
        .filter(|region| *region != current_region)
        .map(str::to_string);
    let Some(region) = hinted else {
        return Err(ListError::new(bucket, prefix, err));
    };

    warn!("list_region_retry: s3://{}/{} {} -> {}", bucket, prefix, current_region, region);
    let candidate = binder
        .rebind_region(&region)
        .map_err(|e| ListError::new(bucket, prefix, e))?;
    match list_level(&candidate.handle(), prefix).await {
        Ok(items) => {
            binder.promote(candidate);
            Ok(items)
        }
        Err(retry_err) => Err(ListError::new(bucket, prefix, retry_err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::memory::{test_profile, MemoryServer};

    fn seeded() -> std::sync::Arc<MemoryServer> {
        let server = MemoryServer::with_limits(1024, 2);
        server.put("bk", "a/", "");
        server.put("bk", "a/one.txt", "12345");
        server.put("bk", "a/two.txt", "123");
        server.put("bk", "a/b/", "");
        server.put("bk", "a/b/c", "1234567");
        server.put("bk", "a/b/d/e", "12");
        server.put("bk", "top.txt", "1");
        server
    }

    fn handle(server: &std::sync::Arc<MemoryServer>) -> BucketHandle {
        BucketHandle {
            bucket: "bk".to_string(),
            client: server.client("bk"),
        }
    }

    fn names(items: &[FsObject]) -> Vec<&str> {
        let mut names: Vec<&str> = items.iter().map(|i| i.name()).collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn level_suppresses_own_placeholder() {
        let server = seeded();
        let items = list_level(&handle(&server), "a/").await.unwrap();
        assert_eq!(names(&items), vec!["b", "one.txt", "two.txt"]);
        assert!(items.iter().all(|i| i.name() != "a/" && !i.name().is_empty()));
    }

    #[tokio::test]
    async fn folders_are_sizeless_and_files_sized() {
        let server = seeded();
        let items = list_level(&handle(&server), "a/").await.unwrap();
        for item in &items {
            match item {
                FsObject::Folder { name } => assert_eq!(name, "b"),
                FsObject::File { name, size, .. } if name == "one.txt" => assert_eq!(*size, 5),
                FsObject::File { .. } => {}
                FsObject::Bucket { .. } => panic!("bucket in folder listing"),
            }
        }
    }

    #[tokio::test]
    async fn bucket_root_lists_top_level() {
        let server = seeded();
        let items = list_level(&handle(&server), "").await.unwrap();
        assert_eq!(names(&items), vec!["a", "top.txt"]);
    }

    #[tokio::test]
    async fn pagination_is_exhausted() {
        let server = MemoryServer::with_limits(1024, 2);
        for i in 0..7 {
            server.put("bk", &format!("f/{}.bin", i), "x");
        }
        let items = list_level(&handle(&server), "f/").await.unwrap();
        assert_eq!(items.len(), 7);
        assert_eq!(server.calls_to("list_objects").len(), 4);
    }

    #[tokio::test]
    async fn total_size_skips_placeholders_and_is_stable() {
        let server = seeded();
        let handle = handle(&server);
        assert_eq!(total_size(&handle, "a/").await.unwrap(), 5 + 3 + 7 + 2);
        assert_eq!(total_size(&handle, "a/").await.unwrap(), 17);
        assert_eq!(total_size(&handle, "").await.unwrap(), 18);
    }

    #[tokio::test]
    async fn list_keys_includes_placeholders() {
        let server = seeded();
        let keys: Vec<String> = list_keys(&handle(&server), "a/b/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["a/b/", "a/b/c", "a/b/d/e"]);
    }

    #[tokio::test]
    async fn region_hint_is_retried_and_promoted() {
        let server = seeded();
        server.fail_when(|call| {
            (call.op == "list_objects" && call.region != "eu-west-2" && call.key.as_deref() == Some("a/")).then(|| {
                StoreError::service("AuthorizationHeaderMalformed", "expecting 'eu-west-2'").with_region_hint("eu-west-2")
            })
        });
        let mut binder = ConnectionBinder::new(test_profile(), server.factory());
        binder.bind_bucket("bk").await.unwrap();

        let items = list(&mut binder, "bk", "a/").await.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(binder.current_region(), "eu-west-2");
    }

    #[tokio::test]
    async fn other_failures_carry_bucket_and_prefix() {
        let server = seeded();
        server.fail_when(|call| {
            (call.op == "list_objects" && call.key.as_deref() == Some("a/"))
                .then(|| StoreError::service("AccessDenied", "Access Denied").with_status(403))
        });
        let mut binder = ConnectionBinder::new(test_profile(), server.factory());
        binder.bind_bucket("bk").await.unwrap();

        let err = list(&mut binder, "bk", "a/").await.unwrap_err();
        assert_eq!(err.bucket, "bk");
        assert_eq!(err.prefix, "a/");
        assert_eq!(err.source.code(), Some("AccessDenied"));
        assert_eq!(binder.current_region(), "us-east-1");
    }

    #[tokio::test]
    async fn unbound_bucket_is_a_list_error() {
        let server = seeded();
        let mut binder = ConnectionBinder::new(test_profile(), server.factory());
        let err = list(&mut binder, "bk", "").await.unwrap_err();
        assert!(matches!(err.source, StoreError::InvalidConfig { .. }));
    }
}
