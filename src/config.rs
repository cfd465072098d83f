//! Connection and transfer configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::StoreError;

/// Region used for signing when a profile leaves the region empty
pub const DEFAULT_SIGNING_REGION: &str = "us-east-1";

/// Multipart upload threshold: 8MB
pub const MULTIPART_THRESHOLD: u64 = 8 * 1024 * 1024;
/// Part size: 5MB per chunk (the smallest part S3 accepts)
pub const PART_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AddressingStyle {
    /// Bucket in the URL path: `https://host/bucket/key`
    Path,
    /// Bucket in the hostname: `https://bucket.host/key`
    #[default]
    Virtual,
}

impl AddressingStyle {
    pub fn opposite(self) -> Self {
        match self {
            AddressingStyle::Path => AddressingStyle::Virtual,
            AddressingStyle::Virtual => AddressingStyle::Path,
        }
    }
}

impl fmt::Display for AddressingStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressingStyle::Path => write!(f, "path"),
            AddressingStyle::Virtual => write!(f, "virtual"),
        }
    }
}

fn default_verify_tls() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    3
}

fn default_retries() -> u32 {
    3
}

/// Profile snapshot handed over by the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Empty means the provider's default endpoint (AWS)
    #[serde(default)]
    pub endpoint_url: String,
    /// `None` or empty means "unknown"
    #[serde(default)]
    pub region: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_verify_tls")]
    pub verify_tls: bool,
    #[serde(default)]
    pub addressing_style: AddressingStyle,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

/// Fields that may be swapped over a stored [`ConnectionConfig`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    pub addressing_style: Option<AddressingStyle>,
}

impl ConnectionConfig {
    pub fn new(endpoint_url: &str, region: Option<&str>, access_key: &str, secret_key: &str) -> Self {
        Self {
            endpoint_url: endpoint_url.to_string(),
            region: region.map(|r| r.to_string()),
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            verify_tls: default_verify_tls(),
            addressing_style: AddressingStyle::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            retries: default_retries(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        serde_json::from_str(json).map_err(|e| StoreError::InvalidConfig {
            message: format!("invalid connection profile: {}", e),
        })
    }

    /// Region as configured, with empty strings treated as unknown.
    pub fn known_region(&self) -> Option<&str> {
        self.region.as_deref().map(str::trim).filter(|r| !r.is_empty())
    }

    /// Region to sign with: the configured one, or `us-east-1` when unknown.
    pub fn signing_region(&self) -> &str {
        self.known_region().unwrap_or(DEFAULT_SIGNING_REGION)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn merged(&self, overrides: &ConfigOverrides) -> ConnectionConfig {
        let mut merged = self.clone();
        if let Some(endpoint_url) = &overrides.endpoint_url {
            merged.endpoint_url = endpoint_url.clone();
        }
        if let Some(region) = &overrides.region {
            merged.region = Some(region.clone());
        }
        if let Some(style) = overrides.addressing_style {
            merged.addressing_style = style;
        }
        merged
    }

    /// Scheme of the configured endpoint, `https` when none is set.
    pub fn endpoint_scheme(&self) -> &str {
        match self.endpoint_url.split_once("://") {
            Some((scheme, _)) if !scheme.is_empty() => scheme,
            _ => "https",
        }
    }
}

/// Chunking parameters for uploads and downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Files of at least this size are uploaded with multipart, as is any
    /// file larger than one part
    pub multipart_threshold: u64,
    /// Bytes per multipart part; also the upload progress granularity
    pub part_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            multipart_threshold: MULTIPART_THRESHOLD,
            part_size: PART_SIZE,
        }
    }
}

impl TransferConfig {
    /// Whether a file of `size` bytes goes up in parts. Anything larger than
    /// one part does, so progress and cancellation never wait on more than
    /// one part's worth of bytes.
    pub fn uses_multipart(&self, size: u64) -> bool {
        size >= self.multipart_threshold || size > self.part_size.max(1)
    }
}
