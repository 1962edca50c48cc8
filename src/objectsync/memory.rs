//! In-process sync-point store with compare-and-set updates.

use super::store::{StoreError, SyncPointStore};
use super::types::{SyncPoint, SyncPointKey};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct State {
    points: BTreeMap<SyncPointKey, SyncPoint>,
    revision: u64,
    failure: Option<String>,
}

/// Linearizable store kept in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemorySyncStore {
    state: Arc<Mutex<State>>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call fail with a backend error until cleared with `None`.
    pub fn set_failure(&self, failure: Option<&str>) {
        self.state().failure = failure.map(str::to_string);
    }

    /// Snapshot of one record without going through the async API.
    pub fn peek(&self, key: &SyncPointKey) -> Option<SyncPoint> {
        self.state().points.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl State {
    fn check(&self) -> Result<(), StoreError> {
        match &self.failure {
            Some(msg) => Err(StoreError::Backend(msg.clone())),
            None => Ok(()),
        }
    }

    fn bump(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

#[async_trait]
impl SyncPointStore for MemorySyncStore {
    async fn get(&self, key: &SyncPointKey) -> Result<SyncPoint, StoreError> {
        let state = self.state();
        state.check()?;
        state.points.get(key).cloned().ok_or_else(|| StoreError::not_found(key))
    }

    async fn create(&self, mut point: SyncPoint) -> Result<SyncPoint, StoreError> {
        if point.name.is_empty() {
            return Err(StoreError::Invalid("name is required".into()));
        }
        let mut state = self.state();
        state.check()?;
        let key = point.key();
        if state.points.contains_key(&key) {
            return Err(StoreError::AlreadyExists { name: point.name });
        }
        point.resource_version = state.bump();
        point.status = Default::default();
        state.points.insert(key, point.clone());
        Ok(point)
    }

    async fn update_status(&self, point: &SyncPoint) -> Result<SyncPoint, StoreError> {
        let mut state = self.state();
        state.check()?;
        let key = point.key();
        let current = state.points.get(&key).ok_or_else(|| StoreError::not_found(&key))?;
        if current.resource_version != point.resource_version {
            return Err(StoreError::Conflict { name: point.name.clone() });
        }
        let mut updated = current.clone();
        updated.status = point.status.clone();
        updated.resource_version = state.bump();
        state.points.insert(key, updated.clone());
        Ok(updated)
    }

    async fn delete(&self, key: &SyncPointKey) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check()?;
        state.points.remove(key).map(|_| ()).ok_or_else(|| StoreError::not_found(key))
    }

    async fn list(&self) -> Result<Vec<SyncPoint>, StoreError> {
        let state = self.state();
        state.check()?;
        Ok(state.points.values().cloned().collect())
    }
}
