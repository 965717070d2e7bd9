//! Storage client capabilities.
//!
//! Every client can connect, upload and disconnect. Clients that can also list
//! and delete files expose that through [`StorageClient::as_listable`]; only
//! those take part in retention.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

use crate::config::StorageTarget;
use crate::error::StorageError;

#[async_trait]
pub trait StorageClient: Send {
    /// Human readable description used in the run log.
    fn describe(&self) -> String;

    async fn connect(&mut self) -> Result<(), StorageError>;

    /// Must be safe to call after a failed or partial `connect`.
    /// Callers log a returned error and carry on.
    async fn disconnect(&mut self) -> Result<(), StorageError>;

    async fn upload(&mut self, path: &Path) -> Result<(), StorageError>;

    /// The listing capability, if this client has one.
    fn as_listable(&mut self) -> Option<&mut dyn ListableStorage> {
        None
    }
}

/// Listing and deletion of remote files.
///
/// `size` and `modified_at` are only ever called for ids returned by a `find`
/// in the same retention pass, so implementations may answer them from data
/// cached while listing.
#[async_trait]
pub trait ListableStorage: Send {
    /// Ids of all files whose name starts with `prefix`.
    async fn find(&mut self, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn size(&mut self, id: &str) -> Result<u64, StorageError>;

    async fn modified_at(&mut self, id: &str) -> Result<DateTime<Utc>, StorageError>;

    async fn delete(&mut self, id: &str) -> Result<(), StorageError>;
}

/// Creates a fresh client for a job's storage target.
pub trait StorageFactory: Send + Sync {
    fn create(&self, target: &StorageTarget) -> Result<Box<dyn StorageClient>, StorageError>;
}

impl<F> StorageFactory for F
where
    F: Fn(&StorageTarget) -> Result<Box<dyn StorageClient>, StorageError> + Send + Sync,
{
    fn create(&self, target: &StorageTarget) -> Result<Box<dyn StorageClient>, StorageError> {
        self(target)
    }
}
