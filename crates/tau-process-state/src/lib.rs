//! Process snapshot store abstractions and in-memory backend.
//!
//! A snapshot is the named-blob image of a process working directory, keyed
//! by the process instance id. Importing overwrites same-named blobs and never
//! removes others; exporting a process that was never imported reports
//! `false` instead of failing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

mod config;
mod payload;
mod secure;
mod sqlite;
mod workspace;

pub use config::ProcessStateConfig;
pub use payload::{PayloadManager, StagedPayload};
pub use secure::{
    Aes256GcmCodec, HmacSha256Codec, SealedBlob, SecureBlobCodec, SecureFilePolicy, StoredBlob,
    AES_256_GCM, HMAC_SHA256,
};
pub use sqlite::SqliteSnapshotStore;
pub use workspace::{
    collect_workspace, normalize_prefix, normalize_relative, DirectorySink, SnapshotEntry,
    SnapshotSink,
};

/// Result type for snapshot store operations.
pub type StateResult<T> = Result<T, ProcessStateError>;

/// Errors returned by snapshot store implementations.
#[derive(Debug, Error)]
pub enum ProcessStateError {
    /// Raised by fork/resume only; `export` reports a missing snapshot as `false`.
    #[error("no snapshot exists for process '{0}'")]
    SnapshotNotFound(Uuid),
    #[error("integrity check failed for '{path}': {reason}")]
    IntegrityError { path: String, reason: String },
    #[error("invalid state configuration: {0}")]
    Config(String),
    #[error("invalid snapshot path '{0}'")]
    InvalidPath(String),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Summary of one stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub instance_id: Uuid,
    pub items: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Async snapshot store contract.
///
/// Imports and exports of the same process are serialized by the backend, so
/// an export never observes half of an import.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Stores `entries` under the snapshot of `instance_id`, creating the
    /// snapshot on first use. Returns the number of blobs written.
    async fn import_entries(&self, instance_id: Uuid, entries: Vec<SnapshotEntry>)
        -> StateResult<usize>;

    /// Materializes the snapshot into `sink`. Every blob is verified before
    /// the first one is written, so an integrity failure leaves the sink
    /// untouched. Returns `false` when no snapshot exists.
    async fn export(
        &self,
        instance_id: Uuid,
        sink: &mut (dyn SnapshotSink + Send),
    ) -> StateResult<bool>;

    async fn info(&self, instance_id: Uuid) -> StateResult<Option<SnapshotInfo>>;
    async fn list_paths(&self, instance_id: Uuid) -> StateResult<Vec<String>>;

    /// Deletes a snapshot. Returns whether one existed.
    async fn remove(&self, instance_id: Uuid) -> StateResult<bool>;

    /// Deletes snapshots last written before `before`.
    async fn remove_stale(&self, before: DateTime<Utc>) -> StateResult<Vec<Uuid>>;

    /// Walks `source_dir` and imports every file, namespaced under `prefix`.
    async fn import_path(
        &self,
        instance_id: Uuid,
        prefix: Option<&str>,
        source_dir: &Path,
    ) -> StateResult<usize> {
        let entries = collect_workspace(source_dir, prefix)?;
        self.import_entries(instance_id, entries).await
    }

    /// Exports into a directory, creating it only if a snapshot exists.
    async fn export_to_dir(&self, instance_id: Uuid, target_dir: &Path) -> StateResult<bool> {
        let mut sink = DirectorySink::new(target_dir);
        self.export(instance_id, &mut sink).await
    }

    async fn exists(&self, instance_id: Uuid) -> StateResult<bool> {
        Ok(self.info(instance_id).await?.is_some())
    }
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    inner: RwLock<HashMap<Uuid, SnapshotRecord>>,
    policy: SecureFilePolicy,
}

#[derive(Debug, Clone)]
struct SnapshotRecord {
    items: BTreeMap<String, StoredBlob>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: SecureFilePolicy) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            policy,
        }
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    #[instrument(skip(self, entries), fields(instance_id = %instance_id, items = entries.len()))]
    async fn import_entries(
        &self,
        instance_id: Uuid,
        entries: Vec<SnapshotEntry>,
    ) -> StateResult<usize> {
        let mut sealed = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = normalize_relative(&entry.path)?;
            let blob = self.policy.seal(&path, entry.data, entry.mode)?;
            sealed.push((path, blob));
        }

        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let record = inner.entry(instance_id).or_insert_with(|| SnapshotRecord {
            items: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        });
        let written = sealed.len();
        record.items.extend(sealed);
        record.updated_at = now;
        tracing::debug!(written, "imported snapshot entries");
        Ok(written)
    }

    #[instrument(skip(self, sink), fields(instance_id = %instance_id))]
    async fn export(
        &self,
        instance_id: Uuid,
        sink: &mut (dyn SnapshotSink + Send),
    ) -> StateResult<bool> {
        let entries = {
            let inner = self.inner.read().await;
            let Some(record) = inner.get(&instance_id) else {
                return Ok(false);
            };
            let mut entries = Vec::with_capacity(record.items.len());
            for (path, blob) in &record.items {
                entries.push(SnapshotEntry {
                    path: path.clone(),
                    data: self.policy.open(path, blob)?,
                    mode: blob.mode,
                });
            }
            entries
        };

        for entry in entries {
            sink.write_entry(entry)?;
        }
        Ok(true)
    }

    async fn info(&self, instance_id: Uuid) -> StateResult<Option<SnapshotInfo>> {
        let inner = self.inner.read().await;
        Ok(inner.get(&instance_id).map(|record| SnapshotInfo {
            instance_id,
            items: record.items.len(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }))
    }

    async fn list_paths(&self, instance_id: Uuid) -> StateResult<Vec<String>> {
        let inner = self.inner.read().await;
        Ok(inner
            .get(&instance_id)
            .map(|record| record.items.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove(&self, instance_id: Uuid) -> StateResult<bool> {
        Ok(self.inner.write().await.remove(&instance_id).is_some())
    }

    async fn remove_stale(&self, before: DateTime<Utc>) -> StateResult<Vec<Uuid>> {
        let mut inner = self.inner.write().await;
        let stale: Vec<Uuid> = inner
            .iter()
            .filter(|(_, record)| record.updated_at < before)
            .map(|(instance_id, _)| *instance_id)
            .collect();
        for instance_id in &stale {
            inner.remove(instance_id);
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DirectorySink, HmacSha256Codec, InMemorySnapshotStore, ProcessStateError,
        SecureFilePolicy, SnapshotEntry, SnapshotStore, StateResult,
    };
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;
    use uuid::Uuid;

    async fn export_all(
        store: &dyn SnapshotStore,
        instance_id: Uuid,
    ) -> StateResult<Option<Vec<SnapshotEntry>>> {
        let mut sink: Vec<SnapshotEntry> = Vec::new();
        let found = store.export(instance_id, &mut sink).await?;
        Ok(found.then_some(sink))
    }

    #[tokio::test]
    async fn import_then_partial_update_keeps_untouched_names() {
        let store = InMemorySnapshotStore::new();
        let instance_id = Uuid::new_v4();
        let temp = tempdir().expect("create tempdir");
        let first = temp.path().join("first");
        fs::create_dir_all(&first).expect("create first");
        fs::write(first.join("a"), "1").expect("write a");
        fs::write(first.join("b"), "2").expect("write b");

        store
            .import_path(instance_id, None, &first)
            .await
            .expect("first import");

        let second = temp.path().join("second");
        fs::create_dir_all(&second).expect("create second");
        fs::write(second.join("a"), "1-updated").expect("write a");
        store
            .import_path(instance_id, None, &second)
            .await
            .expect("second import");

        let out = temp.path().join("out");
        assert!(store
            .export_to_dir(instance_id, &out)
            .await
            .expect("export"));
        assert_eq!(fs::read_to_string(out.join("a")).expect("read a"), "1-updated");
        assert_eq!(fs::read_to_string(out.join("b")).expect("read b"), "2");
    }

    #[tokio::test]
    async fn export_of_unknown_snapshot_is_not_found_without_side_effects() {
        let store = InMemorySnapshotStore::new();
        let temp = tempdir().expect("create tempdir");
        let target = temp.path().join("never-created");

        let found = store
            .export_to_dir(Uuid::new_v4(), &target)
            .await
            .expect("export");
        assert!(!found);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn prefix_namespaces_imported_subtree() {
        let store = InMemorySnapshotStore::new();
        let instance_id = Uuid::new_v4();
        store
            .import_entries(instance_id, vec![SnapshotEntry::new("root.txt", "r")])
            .await
            .expect("import root");

        let temp = tempdir().expect("create tempdir");
        fs::write(temp.path().join("form.json"), "{}").expect("write form");
        store
            .import_path(instance_id, Some("forms/f1"), temp.path())
            .await
            .expect("import prefixed");

        assert_eq!(
            store.list_paths(instance_id).await.expect("list"),
            vec!["forms/f1/form.json".to_string(), "root.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn tampered_secure_blob_fails_without_partial_output() {
        let codec = HmacSha256Codec::new(b"0123456789abcdef").expect("codec");
        let policy =
            SecureFilePolicy::with_codec(&[r"\.secret$"], Arc::new(codec)).expect("policy");
        let store = InMemorySnapshotStore::with_policy(policy);
        let instance_id = Uuid::new_v4();
        store
            .import_entries(
                instance_id,
                vec![
                    SnapshotEntry::new("a.txt", "plain"),
                    SnapshotEntry::new("z.secret", "token"),
                ],
            )
            .await
            .expect("import");

        assert_eq!(
            export_all(&store, instance_id)
                .await
                .expect("export")
                .expect("snapshot")
                .len(),
            2
        );

        {
            let mut inner = store.inner.write().await;
            let record = inner.get_mut(&instance_id).expect("record");
            record.items.get_mut("z.secret").expect("blob").data = b"forged".to_vec();
        }

        let temp = tempdir().expect("create tempdir");
        let target = temp.path().join("out");
        let mut sink = DirectorySink::new(&target);
        let error = store
            .export(instance_id, &mut sink)
            .await
            .expect_err("tampered export");
        assert!(matches!(error, ProcessStateError::IntegrityError { .. }));
        assert_eq!(sink.written(), 0);
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn remove_and_stale_cleanup() {
        let store = InMemorySnapshotStore::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        for instance_id in [first, second] {
            store
                .import_entries(instance_id, vec![SnapshotEntry::new("f", "x")])
                .await
                .expect("import");
        }

        let removed = store
            .remove_stale(chrono::Utc::now() + chrono::TimeDelta::seconds(1))
            .await
            .expect("remove stale");
        assert_eq!(removed.len(), 2);
        assert!(!store.exists(first).await.expect("exists"));
        assert!(!store.remove(second).await.expect("remove"));
    }
}
