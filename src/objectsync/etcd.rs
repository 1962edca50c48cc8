//! etcd-backed sync-point store (feature `etcd`).
//!
//! Records are stored as JSON under `<prefix>/<kind>/<namespace>/<name>`; cluster-scoped ones
//! under `<prefix>/ClusterObjectSync/<name>`. A record's revision is its etcd `mod_revision`, and
//! every write is a transaction guarded on that revision.

use super::store::{StoreError, SyncPointStore};
use super::types::{SyncPoint, SyncPointKey, SyncPointKind};
use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, GetOptions, KeyValue, Txn, TxnOp};

#[derive(Clone)]
pub struct EtcdSyncStore {
    prefix: String,
    client: Client,
}

impl std::fmt::Debug for EtcdSyncStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdSyncStore")
            .field("prefix", &self.prefix)
            .field("client", &"<etcd_client::Client>")
            .finish()
    }
}

fn backend(err: etcd_client::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl EtcdSyncStore {
    /// Use an existing client; `prefix` is trimmed of trailing slashes and must not be empty.
    pub fn new(prefix: impl Into<String>, client: Client) -> Result<Self, StoreError> {
        let prefix = prefix.into().trim().trim_end_matches('/').to_string();
        if prefix.is_empty() {
            return Err(StoreError::Invalid("etcd prefix cannot be empty".into()));
        }
        Ok(Self { prefix, client })
    }

    fn path(&self, key: &SyncPointKey) -> String {
        match key.kind() {
            SyncPointKind::ClusterObjectSync => {
                format!("{}/{}/{}", self.prefix, SyncPointKind::ClusterObjectSync.as_str(), key.name)
            }
            SyncPointKind::ObjectSync => format!(
                "{}/{}/{}/{}",
                self.prefix,
                SyncPointKind::ObjectSync.as_str(),
                key.namespace,
                key.name
            ),
        }
    }

    fn decode(kv: &KeyValue) -> Result<SyncPoint, StoreError> {
        let mut point: SyncPoint = serde_json::from_slice(kv.value())
            .map_err(|e| StoreError::Backend(format!("corrupt record: {e}")))?;
        point.resource_version = kv.mod_revision().to_string();
        Ok(point)
    }

    fn encode(point: &SyncPoint) -> Result<String, StoreError> {
        serde_json::to_string(point).map_err(|e| StoreError::Invalid(e.to_string()))
    }

    async fn guarded_put(
        &self,
        path: String,
        guard: Compare,
        point: &SyncPoint,
    ) -> Result<Option<String>, StoreError> {
        let txn = Txn::new()
            .when(vec![guard])
            .and_then(vec![TxnOp::put(path, Self::encode(point)?, None)]);
        let resp = self.client.clone().txn(txn).await.map_err(backend)?;
        if !resp.succeeded() {
            return Ok(None);
        }
        Ok(Some(resp.header().map(|h| h.revision()).unwrap_or_default().to_string()))
    }
}

#[async_trait]
impl SyncPointStore for EtcdSyncStore {
    async fn get(&self, key: &SyncPointKey) -> Result<SyncPoint, StoreError> {
        let resp = self.client.clone().get(self.path(key), None).await.map_err(backend)?;
        match resp.kvs().first() {
            Some(kv) => Self::decode(kv),
            None => Err(StoreError::not_found(key)),
        }
    }

    async fn create(&self, mut point: SyncPoint) -> Result<SyncPoint, StoreError> {
        if point.name.is_empty() {
            return Err(StoreError::Invalid("name is required".into()));
        }
        point.status = Default::default();
        let path = self.path(&point.key());
        let guard = Compare::create_revision(path.clone(), CompareOp::Equal, 0);
        match self.guarded_put(path, guard, &point).await? {
            Some(revision) => {
                point.resource_version = revision;
                Ok(point)
            }
            None => Err(StoreError::AlreadyExists { name: point.name }),
        }
    }

    async fn update_status(&self, point: &SyncPoint) -> Result<SyncPoint, StoreError> {
        let key = point.key();
        let revision: i64 = point
            .resource_version
            .parse()
            .map_err(|_| StoreError::Invalid(format!("bad revision {:?}", point.resource_version)))?;
        let current = self.get(&key).await?;
        let mut updated = current;
        updated.status = point.status.clone();
        let path = self.path(&key);
        let guard = Compare::mod_revision(path.clone(), CompareOp::Equal, revision);
        match self.guarded_put(path, guard, &updated).await? {
            Some(next) => {
                updated.resource_version = next;
                Ok(updated)
            }
            None => Err(StoreError::Conflict { name: point.name.clone() }),
        }
    }

    async fn delete(&self, key: &SyncPointKey) -> Result<(), StoreError> {
        let resp = self.client.clone().delete(self.path(key), None).await.map_err(backend)?;
        if resp.deleted() == 0 {
            return Err(StoreError::not_found(key));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SyncPoint>, StoreError> {
        let resp = self
            .client
            .clone()
            .get(format!("{}/", self.prefix), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(backend)?;
        resp.kvs().iter().map(Self::decode).collect()
    }
}
