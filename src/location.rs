//! Where the browser is pointed, and what it shows there.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// A `(bucket, prefix)` pair. An empty bucket means the bucket list; an empty
/// prefix means the bucket root. A non-empty prefix always ends with `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Location {
    bucket: String,
    prefix: String,
}

impl Location {
    pub fn new(bucket: &str, prefix: &str) -> Self {
        let bucket = bucket.trim().trim_matches('/').to_string();
        if bucket.is_empty() {
            return Self::root();
        }
        Self {
            bucket,
            prefix: normalize_prefix(prefix),
        }
    }

    /// The bucket list.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn bucket_root(bucket: &str) -> Self {
        Self::new(bucket, "")
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_bucket_list(&self) -> bool {
        self.bucket.is_empty()
    }

    pub fn is_bucket_root(&self) -> bool {
        !self.bucket.is_empty() && self.prefix.is_empty()
    }

    /// Parent location: one prefix level up, the bucket root, and from the
    /// bucket root the bucket list.
    pub fn up(&self) -> Location {
        if self.is_bucket_list() {
            return Location::root();
        }
        if self.prefix.is_empty() {
            return Location::root();
        }
        Location::new(&self.bucket, parent_prefix(&self.prefix))
    }

    /// Child folder (or bucket, from the bucket list) called `name`.
    pub fn child(&self, name: &str) -> Location {
        if self.is_bucket_list() {
            return Location::bucket_root(name);
        }
        Location::new(&self.bucket, &format!("{}{}", self.prefix, name.trim_matches('/')))
    }

    /// Full object key for an entry called `name` at this level.
    pub fn key_for(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bucket_list() {
            write!(f, "s3://")
        } else {
            write!(f, "s3://{}/{}", self.bucket, self.prefix)
        }
    }
}

/// Drop a leading `/` and make sure a non-empty prefix ends with `/`.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    }
}

/// `a/b/` -> `a/`, `a/` -> ``.
pub fn parent_prefix(prefix: &str) -> &str {
    let trimmed = prefix.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => &prefix[..=pos],
        None => "",
    }
}

/// Last non-empty segment of a key or prefix.
pub fn last_segment(key: &str) -> &str {
    key.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// One entry of a listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FsObject {
    Bucket {
        name: String,
        created: Option<DateTime<Utc>>,
    },
    Folder {
        name: String,
    },
    File {
        name: String,
        size: u64,
        modified: Option<DateTime<Utc>>,
    },
}

impl FsObject {
    pub fn name(&self) -> &str {
        match self {
            FsObject::Bucket { name, .. } | FsObject::Folder { name } | FsObject::File { name, .. } => name,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, FsObject::File { .. })
    }
}
