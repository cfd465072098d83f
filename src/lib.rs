//! Data-access and transfer engine for S3-compatible object storage.
//!
//! [`Model`] is the entry point: it binds buckets across redirecting and
//! region-picky backends, lists them as folders, and runs cancellable
//! download/upload/delete jobs whose progress arrives as [`JobEvent`]s.

pub mod binder;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lister;
pub mod location;
pub mod model;
pub mod providers;
pub mod transfer;

pub use binder::{BucketBinding, BucketHandle, ConnectionBinder};
pub use config::{AddressingStyle, ConfigOverrides, ConnectionConfig, TransferConfig};
pub use dispatcher::{JobDispatcher, JobHandle};
pub use error::{BindingError, ListError, ModelError, StoreError, TransferError};
pub use location::{FsObject, Location};
pub use model::{AclOutcome, Model, ObjectProperties};
pub use providers::{ClientFactory, S3Backend, S3ClientFactory, StorageBackend};
pub use transfer::{JobEvent, JobKind, JobOutcome, JobState, TransferItem, TransferJob};
