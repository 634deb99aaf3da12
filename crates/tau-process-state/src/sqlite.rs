//! SQLite-backed `SnapshotStore` implementation with durable persistence.

use crate::{
    normalize_relative, ProcessStateConfig, ProcessStateError, SecureFilePolicy, SnapshotEntry,
    SnapshotInfo, SnapshotSink, SnapshotStore, StateResult, StoredBlob,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

/// Persistent SQLite snapshot store.
#[derive(Debug)]
pub struct SqliteSnapshotStore {
    db_path: PathBuf,
    policy: SecureFilePolicy,
}

impl SqliteSnapshotStore {
    /// Creates a store at `path` that keeps every blob as-is.
    pub fn new(path: impl AsRef<Path>) -> StateResult<Self> {
        Self::with_policy(path, SecureFilePolicy::disabled())
    }

    /// Creates a store whose secure-file policy is built from `config`.
    pub fn from_config(path: impl AsRef<Path>, config: &ProcessStateConfig) -> StateResult<Self> {
        Self::with_policy(path, SecureFilePolicy::from_config(config)?)
    }

    pub fn with_policy(path: impl AsRef<Path>, policy: SecureFilePolicy) -> StateResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path, policy };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> StateResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StateResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS process_snapshots (
                instance_id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS process_snapshot_items (
                instance_id TEXT NOT NULL,
                item_path TEXT NOT NULL,
                item_data BLOB NOT NULL,
                unix_mode INTEGER NULL,
                codec TEXT NULL,
                tag BLOB NULL,
                PRIMARY KEY (instance_id, item_path),
                FOREIGN KEY(instance_id) REFERENCES process_snapshots(instance_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_process_snapshots_updated
                ON process_snapshots (updated_at);
            "#,
        )?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
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

        let now = timestamp_to_db(Utc::now());
        let id = instance_id.to_string();
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        transaction.execute(
            r#"
            INSERT INTO process_snapshots (instance_id, created_at, updated_at)
            VALUES (?1, ?2, ?2)
            ON CONFLICT(instance_id) DO UPDATE SET updated_at = excluded.updated_at
            "#,
            params![id, now],
        )?;
        {
            let mut statement = transaction.prepare(
                r#"
                INSERT INTO process_snapshot_items (
                    instance_id, item_path, item_data, unix_mode, codec, tag
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(instance_id, item_path) DO UPDATE SET
                    item_data = excluded.item_data,
                    unix_mode = excluded.unix_mode,
                    codec = excluded.codec,
                    tag = excluded.tag
                "#,
            )?;
            for (path, blob) in &sealed {
                statement.execute(params![
                    id,
                    path,
                    blob.data,
                    blob.mode.map(i64::from),
                    blob.codec,
                    blob.tag,
                ])?;
            }
        }
        transaction.commit()?;

        tracing::debug!(written = sealed.len(), "imported snapshot entries");
        Ok(sealed.len())
    }

    #[instrument(skip(self, sink), fields(instance_id = %instance_id))]
    async fn export(
        &self,
        instance_id: Uuid,
        sink: &mut (dyn SnapshotSink + Send),
    ) -> StateResult<bool> {
        let id = instance_id.to_string();
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;

        let exists = transaction
            .query_row(
                "SELECT 1 FROM process_snapshots WHERE instance_id = ?1",
                params![id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(false);
        }

        let rows = {
            let mut statement = transaction.prepare(
                r#"
                SELECT item_path, item_data, unix_mode, codec, tag
                FROM process_snapshot_items
                WHERE instance_id = ?1
                ORDER BY item_path ASC
                "#,
            )?;
            let mapped = statement.query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<Vec<u8>>>(4)?,
                ))
            })?;
            mapped.collect::<Result<Vec<_>, _>>()?
        };
        transaction.commit()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (path, data, mode, codec, tag) in rows {
            let blob = StoredBlob {
                data,
                mode: mode.map(|value| i64_to_u32("unix_mode", value)).transpose()?,
                codec,
                tag,
            };
            let data = self.policy.open(&path, &blob)?;
            entries.push(SnapshotEntry {
                path,
                data,
                mode: blob.mode,
            });
        }

        for entry in entries {
            sink.write_entry(entry)?;
        }
        Ok(true)
    }

    async fn info(&self, instance_id: Uuid) -> StateResult<Option<SnapshotInfo>> {
        let connection = self.open_connection()?;
        let row = connection
            .query_row(
                r#"
                SELECT s.created_at, s.updated_at,
                       (SELECT COUNT(*) FROM process_snapshot_items i
                        WHERE i.instance_id = s.instance_id)
                FROM process_snapshots s
                WHERE s.instance_id = ?1
                "#,
                params![instance_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(created_at, updated_at, items)| {
            Ok(SnapshotInfo {
                instance_id,
                items: usize::try_from(items).map_err(|_| {
                    ProcessStateError::InvalidPersistedValue {
                        field: "item_count",
                        value: items.to_string(),
                    }
                })?,
                created_at: timestamp_from_db(&created_at)?,
                updated_at: timestamp_from_db(&updated_at)?,
            })
        })
        .transpose()
    }

    async fn list_paths(&self, instance_id: Uuid) -> StateResult<Vec<String>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            r#"
            SELECT item_path FROM process_snapshot_items
            WHERE instance_id = ?1
            ORDER BY item_path
            "#,
        )?;
        let rows = statement.query_map(params![instance_id.to_string()], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    async fn remove(&self, instance_id: Uuid) -> StateResult<bool> {
        let connection = self.open_connection()?;
        let removed = connection.execute(
            "DELETE FROM process_snapshots WHERE instance_id = ?1",
            params![instance_id.to_string()],
        )?;
        Ok(removed > 0)
    }

    async fn remove_stale(&self, before: DateTime<Utc>) -> StateResult<Vec<Uuid>> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let cutoff = timestamp_to_db(before);
        let ids = {
            let mut statement = transaction
                .prepare("SELECT instance_id FROM process_snapshots WHERE updated_at < ?1")?;
            let rows = statement.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        transaction.execute(
            "DELETE FROM process_snapshots WHERE updated_at < ?1",
            params![cutoff],
        )?;
        transaction.commit()?;

        let removed = ids
            .iter()
            .map(|id| uuid_from_db(id))
            .collect::<StateResult<Vec<_>>>()?;
        tracing::debug!(removed = removed.len(), "removed stale snapshots");
        Ok(removed)
    }
}

/// Fixed-width UTC timestamps so lexical order matches time order.
fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp_from_db(value: &str) -> StateResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn uuid_from_db(value: &str) -> StateResult<Uuid> {
    Uuid::parse_str(value).map_err(|_| ProcessStateError::InvalidPersistedValue {
        field: "instance_id",
        value: value.to_string(),
    })
}

fn i64_to_u32(field: &'static str, value: i64) -> StateResult<u32> {
    u32::try_from(value).map_err(|_| ProcessStateError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::SqliteSnapshotStore;
    use crate::{
        ProcessStateConfig, ProcessStateError, SnapshotEntry, SnapshotStore, AES_256_GCM,
    };
    use rusqlite::{params, Connection};
    use std::fs;
    use std::sync::Arc;
    use tempfile::tempdir;
    use uuid::Uuid;

    #[tokio::test]
    async fn persists_snapshot_across_reopen_with_partial_update() {
        let temp = tempdir().expect("create tempdir");
        let db_path = temp.path().join("state.sqlite");
        let instance_id = Uuid::new_v4();

        {
            let store = SqliteSnapshotStore::new(&db_path).expect("create sqlite store");
            store
                .import_entries(
                    instance_id,
                    vec![SnapshotEntry::new("a", "1"), SnapshotEntry::new("b", "2")],
                )
                .await
                .expect("first import");
            store
                .import_entries(instance_id, vec![SnapshotEntry::new("a", "1-updated")])
                .await
                .expect("second import");
        }

        let reopened = SqliteSnapshotStore::new(&db_path).expect("reopen sqlite store");
        let mut sink: Vec<SnapshotEntry> = Vec::new();
        assert!(reopened
            .export(instance_id, &mut sink)
            .await
            .expect("export"));
        assert_eq!(
            sink,
            vec![
                SnapshotEntry::new("a", "1-updated"),
                SnapshotEntry::new("b", "2"),
            ]
        );

        let info = reopened
            .info(instance_id)
            .await
            .expect("info")
            .expect("snapshot exists");
        assert_eq!(info.items, 2);
        assert!(info.updated_at >= info.created_at);
    }

    #[tokio::test]
    async fn export_of_unknown_snapshot_returns_false() {
        let temp = tempdir().expect("create tempdir");
        let store =
            SqliteSnapshotStore::new(temp.path().join("state.sqlite")).expect("create store");
        let target = temp.path().join("out");
        assert!(!store
            .export_to_dir(Uuid::new_v4(), &target)
            .await
            .expect("export"));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn empty_import_still_creates_snapshot() {
        let temp = tempdir().expect("create tempdir");
        let store =
            SqliteSnapshotStore::new(temp.path().join("state.sqlite")).expect("create store");
        let instance_id = Uuid::new_v4();
        store
            .import_entries(instance_id, Vec::new())
            .await
            .expect("import");
        let mut sink: Vec<SnapshotEntry> = Vec::new();
        assert!(store.export(instance_id, &mut sink).await.expect("export"));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn encrypted_blobs_are_opaque_at_rest_and_verified_on_export() {
        let temp = tempdir().expect("create tempdir");
        let key_path = temp.path().join("state.key");
        fs::write(&key_path, "an-operator-provided-key").expect("write key");
        let db_path = temp.path().join("state.sqlite");
        let config = ProcessStateConfig {
            secure_files: vec![r"(^|/)_secrets/".to_string()],
            signing_algorithm: Some(AES_256_GCM.to_string()),
            signing_key_path: Some(key_path),
            max_state_age_secs: None,
        };
        let store = SqliteSnapshotStore::from_config(&db_path, &config).expect("create store");
        let instance_id = Uuid::new_v4();
        store
            .import_entries(
                instance_id,
                vec![SnapshotEntry::new("_secrets/token", "s3cr3t")],
            )
            .await
            .expect("import");

        let connection = Connection::open(&db_path).expect("open raw connection");
        let raw: Vec<u8> = connection
            .query_row(
                "SELECT item_data FROM process_snapshot_items WHERE instance_id = ?1",
                params![instance_id.to_string()],
                |row| row.get(0),
            )
            .expect("raw blob");
        assert_ne!(raw, b"s3cr3t");

        let mut sink: Vec<SnapshotEntry> = Vec::new();
        assert!(store.export(instance_id, &mut sink).await.expect("export"));
        assert_eq!(sink[0].data, b"s3cr3t");

        connection
            .execute(
                "UPDATE process_snapshot_items SET item_data = x'00112233445566778899aabbccdd'",
                [],
            )
            .expect("tamper");
        let mut sink: Vec<SnapshotEntry> = Vec::new();
        let error = store
            .export(instance_id, &mut sink)
            .await
            .expect_err("tampered export");
        assert!(matches!(error, ProcessStateError::IntegrityError { .. }));
        assert!(sink.is_empty());

        let plain = SqliteSnapshotStore::new(&db_path).expect("store without key");
        assert!(plain.export(instance_id, &mut sink).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_imports_of_one_snapshot_do_not_lose_names() {
        let temp = tempdir().expect("create tempdir");
        let store = Arc::new(
            SqliteSnapshotStore::new(temp.path().join("state.sqlite")).expect("create store"),
        );
        let instance_id = Uuid::new_v4();

        let mut handles = Vec::new();
        for index in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .import_entries(
                        instance_id,
                        vec![SnapshotEntry::new(format!("part-{index}"), "x")],
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("import");
        }

        assert_eq!(store.list_paths(instance_id).await.expect("list").len(), 8);
        assert!(store.remove(instance_id).await.expect("remove"));
        assert!(store.list_paths(instance_id).await.expect("list").is_empty());
    }
}
