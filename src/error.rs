//! Error types for binding, listing and transfers.

use std::path::Path;
use thiserror::Error;

/// Error codes a backend uses when the request was signed for the wrong region
const REGION_MISMATCH_CODES: &[&str] = &[
    "AuthorizationHeaderMalformed",
    "IllegalLocationConstraintException",
    "InvalidRegion",
    "IncorrectRegion",
];

/// Error codes meaning "this backend does not do ACLs"
const ACL_UNSUPPORTED_CODES: &[&str] = &[
    "NotImplemented",
    "AccessControlListNotSupported",
    "MethodNotAllowed",
    "XNotImplemented",
];

/// A single failed storage operation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The backend answered with an error; code and message are kept verbatim.
    #[error("{code}: {message}")]
    Service {
        code: String,
        message: String,
        status: Option<u16>,
        /// Host the backend suggested instead (redirect responses)
        endpoint_hint: Option<String>,
        /// Region the backend expects, from headers or the error body
        region_hint: Option<String>,
    },

    /// The request never produced a backend answer (DNS, TLS, timeout...).
    #[error("request failed: {message}")]
    Transport { message: String },

    /// Local file system error.
    #[error("I/O error for {path}: {message}")]
    Io { path: String, message: String },

    /// Operation cancelled by the user.
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl StoreError {
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Service {
            code: code.into(),
            message: message.into(),
            status: None,
            endpoint_hint: None,
            region_hint: None,
        }
    }

    pub fn io(path: &Path, err: std::io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    pub fn with_status(mut self, value: u16) -> Self {
        if let StoreError::Service { status, .. } = &mut self {
            *status = Some(value);
        }
        self
    }

    pub fn with_endpoint_hint(mut self, host: impl Into<String>) -> Self {
        if let StoreError::Service { endpoint_hint, .. } = &mut self {
            *endpoint_hint = Some(host.into());
        }
        self
    }

    pub fn with_region_hint(mut self, region: impl Into<String>) -> Self {
        if let StoreError::Service { region_hint, .. } = &mut self {
            *region_hint = Some(region.into());
        }
        self
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            StoreError::Service { code, .. } => Some(code),
            _ => None,
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            StoreError::Service { status, .. } => *status,
            _ => None,
        }
    }

    fn code_in(&self, codes: &[&str]) -> bool {
        self.code().map(|c| codes.contains(&c)).unwrap_or(false)
    }

    /// The backend says the bucket lives behind another endpoint.
    pub fn is_permanent_redirect(&self) -> bool {
        self.code_in(&["PermanentRedirect", "TemporaryRedirect", "301", "307"])
            || matches!(self.status(), Some(301) | Some(307))
    }

    /// Host suggested by a redirect response.
    pub fn redirect_endpoint(&self) -> Option<&str> {
        match self {
            StoreError::Service {
                endpoint_hint: Some(host),
                ..
            } if !host.trim().is_empty() => Some(host.trim()),
            _ => None,
        }
    }

    /// Region named by the backend as the one it expects.
    pub fn expected_region(&self) -> Option<&str> {
        match self {
            StoreError::Service {
                region_hint: Some(region),
                ..
            } if !region.trim().is_empty() => Some(region.trim()),
            _ => None,
        }
    }

    /// The request was signed for, or sent to, the wrong region.
    pub fn is_region_mismatch(&self) -> bool {
        self.code_in(REGION_MISMATCH_CODES)
    }

    /// Errors that a different endpoint, region or addressing style may fix.
    pub fn is_redirect_class(&self) -> bool {
        self.is_permanent_redirect() || self.is_region_mismatch()
    }

    pub fn is_not_found(&self) -> bool {
        self.code_in(&["NoSuchKey", "NoSuchBucket", "NotFound"]) || self.status() == Some(404)
    }

    pub fn is_acl_unsupported(&self) -> bool {
        self.code_in(ACL_UNSUPPORTED_CODES) || self.status() == Some(501)
    }
}

/// No working client could be established for a bucket.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BindingError {
    /// A suggested endpoint is bound to another bucket than the one requested.
    #[error("bucket `{requested}` redirected to `{endpoint}`, which serves bucket `{found}`")]
    BucketMismatch {
        requested: String,
        found: String,
        endpoint: String,
    },

    /// Every endpoint/style/region candidate failed.
    #[error("cannot bind bucket `{bucket}`: {source}")]
    Exhausted {
        bucket: String,
        #[source]
        source: StoreError,
        suggested_endpoint: Option<String>,
    },

    /// A structural failure (access denied, no such bucket...), propagated as-is.
    #[error(transparent)]
    Backend(#[from] StoreError),
}

/// Listing a folder level failed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("failed to list s3://{bucket}/{prefix}: {source}")]
pub struct ListError {
    pub bucket: String,
    pub prefix: String,
    #[source]
    pub source: StoreError,
}

impl ListError {
    pub fn new(bucket: &str, prefix: &str, source: StoreError) -> Self {
        Self {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            source,
        }
    }
}

/// Outcome of a transfer step that did not complete.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    /// User-initiated cancellation; reported apart from failures.
    #[error("transfer cancelled")]
    Cancelled,

    #[error("{operation} failed: {source}")]
    Failed {
        operation: String,
        #[source]
        source: StoreError,
    },
}

impl TransferError {
    pub fn failed(operation: impl Into<String>, source: StoreError) -> Self {
        match source {
            StoreError::Cancelled => TransferError::Cancelled,
            source => TransferError::Failed {
                operation: operation.into(),
                source,
            },
        }
    }
}

/// Errors of the model facade.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("no bucket selected")]
    NoBucketSelected,

    /// Bucket deletion refused because objects or prefixes remain.
    #[error("bucket `{bucket}` is not empty")]
    NotEmpty { bucket: String },

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    List(#[from] ListError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
