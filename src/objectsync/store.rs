use super::types::{SyncPoint, SyncPointKey};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Sync-point store failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },
    /// The record changed since it was read.
    #[error("conflict updating {name:?}: the object has been modified")]
    Conflict { name: String },
    #[error("{name:?} already exists")]
    AlreadyExists { name: String },
    #[error("invalid sync point: {0}")]
    Invalid(String),
    #[error("store backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(key: &SyncPointKey) -> Self {
        Self::NotFound { kind: key.kind().as_str(), name: key.name.clone() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// CRUD over `ObjectSync` and `ClusterObjectSync` records.
///
/// Writes are optimistic: `update_status` only succeeds while the record's
/// `resource_version` still matches the one passed in.
#[async_trait]
pub trait SyncPointStore: Send + Sync + fmt::Debug {
    async fn get(&self, key: &SyncPointKey) -> Result<SyncPoint, StoreError>;

    /// Create `point`, ignoring its status. Returns the stored record with its revision set.
    async fn create(&self, point: SyncPoint) -> Result<SyncPoint, StoreError>;

    /// Replace the status of `point`, checking its revision.
    async fn update_status(&self, point: &SyncPoint) -> Result<SyncPoint, StoreError>;

    async fn delete(&self, key: &SyncPointKey) -> Result<(), StoreError>;

    /// Every record of both kinds.
    async fn list(&self) -> Result<Vec<SyncPoint>, StoreError>;
}
