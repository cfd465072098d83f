//! Job, item and state definitions

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "download")]
    Download,
    #[serde(rename = "upload")]
    Upload,
    #[serde(rename = "delete")]
    Delete,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Download => write!(f, "download"),
            JobKind::Upload => write!(f, "upload"),
            JobKind::Delete => write!(f, "delete"),
        }
    }
}

/// One `(remote, local)` pair of a job.
///
/// Download: `local_path` set means a single object; `local_path` empty with
/// `destination_dir` set means everything under the `remote_key` prefix.
/// Upload: an empty `local_path` creates a folder placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItem {
    pub remote_key: String,
    pub local_path: Option<PathBuf>,
    pub known_size: Option<u64>,
    pub destination_dir: Option<PathBuf>,
}

impl TransferItem {
    pub fn download(remote_key: &str, local_path: impl Into<PathBuf>, known_size: Option<u64>) -> Self {
        Self {
            remote_key: remote_key.to_string(),
            local_path: Some(local_path.into()),
            known_size,
            destination_dir: None,
        }
    }

    pub fn download_folder(prefix: &str, destination_dir: impl Into<PathBuf>) -> Self {
        Self {
            remote_key: prefix.to_string(),
            local_path: None,
            known_size: None,
            destination_dir: Some(destination_dir.into()),
        }
    }

    pub fn upload(local_path: impl Into<PathBuf>, remote_key: &str) -> Self {
        Self {
            remote_key: remote_key.to_string(),
            local_path: Some(local_path.into()),
            known_size: None,
            destination_dir: None,
        }
    }

    /// Upload item creating the placeholder for folder `remote_key`.
    pub fn folder(remote_key: &str) -> Self {
        Self {
            remote_key: remote_key.to_string(),
            local_path: None,
            known_size: None,
            destination_dir: None,
        }
    }

    pub fn delete(remote_key: &str) -> Self {
        Self::folder(remote_key)
    }

    pub fn is_folder_key(&self) -> bool {
        self.remote_key.ends_with('/')
    }
}

/// Ordered, immutable list of items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferJob {
    items: Vec<TransferItem>,
}

impl TransferJob {
    pub fn new(items: Vec<TransferItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[TransferItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl From<Vec<TransferItem>> for TransferJob {
    fn from(items: Vec<TransferItem>) -> Self {
        Self::new(items)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobState {
    #[serde(rename = "preparing")]
    Preparing,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "failed")]
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Preparing => write!(f, "preparing"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Cancelled => write!(f, "cancelled"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed => JobState::Completed,
            JobOutcome::Cancelled => JobState::Cancelled,
            JobOutcome::Failed(_) => JobState::Failed,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobOutcome::Cancelled)
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            JobOutcome::Failed(message) => Some(message),
            _ => None,
        }
    }
}
