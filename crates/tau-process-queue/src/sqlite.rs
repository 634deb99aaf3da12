//! SQLite-backed `ProcessQueue` implementation with durable persistence.

use crate::{
    agent_assignment, agent_payload, now_micros, AgentAssignment, ProcessQueue, ProcessQueueError,
    QueueResult,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tau_process_types::{
    AuditEvent, AuditEventKind, ExclusiveGroup, ProcessKey, ProcessKind, ProcessQuery,
    ProcessRecord, ProcessSchedule, ProcessStatus, ValueMap, WaitCondition,
};
use uuid::Uuid;

const RECORD_COLUMNS: &str = r#"
    instance_id, created_at, status, kind, parent_instance_id, project_id, repo_id,
    initiator_id, meta_json, tags_json, start_at, requirements_json, process_timeout,
    handlers_json, imports_json, exclusive_json, exclusive_group, wait_json, agent_id,
    last_updated_at, last_run_at
"#;

/// Persistent SQLite queue backend.
///
/// Every mutation runs in an IMMEDIATE transaction, so reads made inside it
/// and the writes that follow are atomic with respect to other writers.
#[derive(Debug)]
pub struct SqliteProcessQueue {
    db_path: PathBuf,
}

impl SqliteProcessQueue {
    /// Creates a SQLite-backed queue at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> QueueResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let queue = Self { db_path };
        let connection = queue.open_connection()?;
        queue.initialize_schema(&connection)?;
        Ok(queue)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> QueueResult<Connection> {
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

    fn initialize_schema(&self, connection: &Connection) -> QueueResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS processes (
                instance_id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                status TEXT NOT NULL,
                kind TEXT NOT NULL,
                parent_instance_id TEXT NULL,
                project_id TEXT NULL,
                repo_id TEXT NULL,
                initiator_id TEXT NULL,
                meta_json TEXT NOT NULL,
                tags_json TEXT NOT NULL,
                start_at TEXT NULL,
                requirements_json TEXT NULL,
                process_timeout INTEGER NULL,
                handlers_json TEXT NOT NULL,
                imports_json TEXT NOT NULL,
                exclusive_json TEXT NULL,
                exclusive_group TEXT NULL,
                wait_json TEXT NOT NULL,
                agent_id TEXT NULL,
                last_updated_at TEXT NOT NULL,
                last_run_at TEXT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_processes_status
                ON processes(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_processes_parent
                ON processes(parent_instance_id);
            CREATE INDEX IF NOT EXISTS idx_processes_exclusive
                ON processes(project_id, exclusive_group);

            CREATE TABLE IF NOT EXISTS process_events (
                event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_json TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                FOREIGN KEY(instance_id) REFERENCES processes(instance_id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_process_events_instance
                ON process_events(instance_id, event_seq);
            "#,
        )?;
        Ok(())
    }

    /// Runs `mutation` inside one IMMEDIATE transaction; an error rolls back
    /// everything it wrote.
    fn mutate<T>(&self, mutation: impl FnOnce(&Connection) -> QueueResult<T>) -> QueueResult<T> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = mutation(&transaction)?;
        transaction.commit()?;
        Ok(value)
    }
}

#[async_trait]
impl ProcessQueue for SqliteProcessQueue {
    async fn insert(&self, mut record: ProcessRecord) -> QueueResult<()> {
        let now = now_micros();
        record.last_updated_at = now;
        self.mutate(|connection| {
            let exists = connection
                .query_row(
                    "SELECT 1 FROM processes WHERE instance_id = ?1",
                    params![record.key.instance_id.to_string()],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(ProcessQueueError::DuplicateProcess(record.key));
            }

            connection.execute(
                &format!(
                    r#"
                    INSERT INTO processes ({RECORD_COLUMNS})
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                            ?16, ?17, ?18, ?19, ?20, ?21)
                    "#
                ),
                params![
                    record.key.instance_id.to_string(),
                    timestamp_to_db(record.key.created_at),
                    record.status.as_str(),
                    record.kind.as_str(),
                    option_uuid_to_db(record.parent_instance_id),
                    option_uuid_to_db(record.project_id),
                    option_uuid_to_db(record.repo_id),
                    option_uuid_to_db(record.initiator_id),
                    serialize_json(&record.meta)?,
                    serialize_json(&record.tags)?,
                    option_timestamp_to_db(record.start_at),
                    option_json_to_db(record.requirements.as_ref())?,
                    option_u64_to_db("process_timeout", record.process_timeout)?,
                    serialize_json(&record.handlers)?,
                    serialize_json(&record.imports)?,
                    option_json_to_db(record.exclusive.as_ref())?,
                    record.exclusive_group(),
                    serialize_json(&record.wait_condition)?,
                    record.agent_id,
                    timestamp_to_db(record.last_updated_at),
                    option_timestamp_to_db(record.last_run_at),
                ],
            )?;
            append_event(
                connection,
                &record.key,
                &AuditEventKind::Status {
                    status: record.status,
                    payload: ValueMap::new(),
                },
                now,
            )
        })?;
        tracing::debug!(
            instance_id = %record.key.instance_id,
            status = %record.status,
            "inserted process"
        );
        Ok(())
    }

    async fn get(&self, key: &ProcessKey) -> QueueResult<Option<ProcessRecord>> {
        let connection = self.open_connection()?;
        load(&connection, key)
    }

    async fn get_by_id(&self, instance_id: Uuid) -> QueueResult<Option<ProcessRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM processes WHERE instance_id = ?1"
        ))?;
        let mut rows = statement.query(params![instance_id.to_string()])?;
        rows.next()?.map(record_from_row).transpose()
    }

    async fn enqueue(
        &self,
        key: &ProcessKey,
        schedule: &ProcessSchedule,
        hold: WaitCondition,
    ) -> QueueResult<ProcessRecord> {
        self.mutate(|connection| {
            let now = now_micros();
            let mut record = require(connection, key)?;
            if !record.status.can_enqueue() {
                return Err(ProcessQueueError::InvalidStateTransition {
                    from: record.status,
                    to: ProcessStatus::Enqueued,
                });
            }
            let wait_changed = record.wait_condition != hold;
            record.apply_schedule(schedule);
            record.apply_status(ProcessStatus::Enqueued, now);
            record.wait_condition = hold.clone();
            store_record(connection, &record)?;

            append_event(
                connection,
                key,
                &AuditEventKind::Status {
                    status: ProcessStatus::Enqueued,
                    payload: ValueMap::new(),
                },
                now,
            )?;
            if wait_changed {
                append_event(connection, key, &AuditEventKind::Wait { condition: hold }, now)?;
            }
            Ok(record)
        })
    }

    async fn update_status(
        &self,
        key: &ProcessKey,
        status: ProcessStatus,
        payload: ValueMap,
    ) -> QueueResult<ProcessRecord> {
        self.mutate(|connection| {
            let mut record = require(connection, key)?;
            transition(connection, &mut record, status, payload, now_micros())?;
            Ok(record)
        })
    }

    async fn update_expected_status(
        &self,
        key: &ProcessKey,
        expected: ProcessStatus,
        status: ProcessStatus,
        payload: ValueMap,
    ) -> QueueResult<bool> {
        self.mutate(|connection| {
            let mut record = require(connection, key)?;
            if record.status != expected {
                return Ok(false);
            }
            transition(connection, &mut record, status, payload, now_micros())?;
            Ok(true)
        })
    }

    async fn update_expected_status_bulk(
        &self,
        keys: &[ProcessKey],
        expected: &[ProcessStatus],
        status: ProcessStatus,
    ) -> QueueResult<bool> {
        self.mutate(|connection| {
            let mut records = Vec::with_capacity(keys.len());
            for key in keys {
                match load(connection, key)? {
                    Some(record) if expected.contains(&record.status) => records.push(record),
                    _ => return Ok(false),
                }
            }
            let now = now_micros();
            for record in &mut records {
                transition(connection, record, status, ValueMap::new(), now)?;
            }
            Ok(true)
        })
    }

    async fn claim(&self, key: &ProcessKey, agent_id: &str) -> QueueResult<bool> {
        self.mutate(|connection| {
            let mut record = require(connection, key)?;
            if record.status != ProcessStatus::Enqueued {
                return Ok(false);
            }
            record.agent_id = Some(agent_id.to_string());
            transition(
                connection,
                &mut record,
                ProcessStatus::Running,
                agent_payload(agent_id),
                now_micros(),
            )?;
            Ok(true)
        })
    }

    async fn update_agent_id(
        &self,
        key: &ProcessKey,
        agent_id: &str,
        status: ProcessStatus,
    ) -> QueueResult<()> {
        if status != ProcessStatus::Running {
            return Err(ProcessQueueError::InvalidArgument(format!(
                "agent id can only be assigned with status RUNNING, got {status}"
            )));
        }
        self.mutate(|connection| {
            let mut record = require(connection, key)?;
            let now = now_micros();
            match agent_assignment(&record, agent_id)? {
                AgentAssignment::Claim => {
                    record.agent_id = Some(agent_id.to_string());
                    transition(connection, &mut record, status, agent_payload(agent_id), now)
                }
                AgentAssignment::Attach => {
                    record.agent_id = Some(agent_id.to_string());
                    record.last_updated_at = now;
                    store_record(connection, &record)
                }
                AgentAssignment::Unchanged => Ok(()),
            }
        })
    }

    async fn update_wait(&self, key: &ProcessKey, condition: WaitCondition) -> QueueResult<()> {
        self.mutate(|connection| {
            let mut record = require(connection, key)?;
            set_wait(connection, &mut record, condition, now_micros())
        })
    }

    async fn suspend(&self, key: &ProcessKey, condition: WaitCondition) -> QueueResult<bool> {
        self.mutate(|connection| {
            let mut record = require(connection, key)?;
            if record.status != ProcessStatus::Running {
                return Ok(false);
            }
            let now = now_micros();
            set_wait(connection, &mut record, condition, now)?;
            transition(connection, &mut record, ProcessStatus::Suspended, ValueMap::new(), now)?;
            Ok(true)
        })
    }

    async fn update_exclusive(
        &self,
        key: &ProcessKey,
        exclusive: Option<ExclusiveGroup>,
    ) -> QueueResult<()> {
        self.mutate(|connection| {
            let mut record = require(connection, key)?;
            record.exclusive = exclusive;
            record.last_updated_at = now_micros();
            store_record(connection, &record)
        })
    }

    async fn list(&self, query: &ProcessQuery) -> QueueResult<Vec<ProcessRecord>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM processes ORDER BY created_at ASC, instance_id ASC"
        ))?;
        let mut rows = statement.query([])?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let record = record_from_row(row)?;
            if query.matches(&record) {
                records.push(record);
            }
        }
        Ok(query.paginate(records))
    }

    async fn audit_log(&self, key: &ProcessKey) -> QueueResult<Vec<AuditEvent>> {
        let connection = self.open_connection()?;
        require(&connection, key)?;
        let mut statement = connection.prepare(
            r#"
            SELECT event_seq, event_json, recorded_at
            FROM process_events
            WHERE instance_id = ?1
            ORDER BY event_seq ASC
            "#,
        )?;
        let mut rows = statement.query(params![key.instance_id.to_string()])?;

        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(AuditEvent {
                seq: i64_to_u64("event_seq", row.get(0)?)?,
                key: *key,
                event: deserialize_json(&row.get::<_, String>(1)?)?,
                recorded_at: timestamp_from_db(&row.get::<_, String>(2)?)?,
            });
        }
        Ok(events)
    }

    async fn prune_terminal(&self, before: DateTime<Utc>) -> QueueResult<Vec<ProcessKey>> {
        let mut pruned = self.mutate(|connection| {
            let mut statement = connection.prepare(
                r#"
                SELECT instance_id, created_at
                FROM processes
                WHERE status IN ('CANCELLED', 'FAILED', 'FINISHED') AND last_updated_at < ?1
                "#,
            )?;
            let mut rows = statement.query(params![timestamp_to_db(before)])?;
            let mut pruned = Vec::new();
            while let Some(row) = rows.next()? {
                pruned.push(ProcessKey::new(
                    uuid_from_db("instance_id", &row.get::<_, String>(0)?)?,
                    timestamp_from_db(&row.get::<_, String>(1)?)?,
                ));
            }
            drop(rows);
            drop(statement);

            for key in &pruned {
                connection.execute(
                    "DELETE FROM processes WHERE instance_id = ?1",
                    params![key.instance_id.to_string()],
                )?;
            }
            Ok(pruned)
        })?;
        pruned.sort();
        tracing::debug!(pruned = pruned.len(), "pruned terminal processes");
        Ok(pruned)
    }
}

fn load(connection: &Connection, key: &ProcessKey) -> QueueResult<Option<ProcessRecord>> {
    let mut statement = connection.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM processes WHERE instance_id = ?1 AND created_at = ?2"
    ))?;
    let mut rows = statement.query(params![
        key.instance_id.to_string(),
        timestamp_to_db(key.created_at)
    ])?;
    rows.next()?.map(record_from_row).transpose()
}

fn require(connection: &Connection, key: &ProcessKey) -> QueueResult<ProcessRecord> {
    load(connection, key)?.ok_or(ProcessQueueError::ProcessNotFound(*key))
}

fn transition(
    connection: &Connection,
    record: &mut ProcessRecord,
    status: ProcessStatus,
    payload: ValueMap,
    now: DateTime<Utc>,
) -> QueueResult<()> {
    record.apply_status(status, now);
    store_record(connection, record)?;
    append_event(connection, &record.key, &AuditEventKind::Status { status, payload }, now)
}

fn set_wait(
    connection: &Connection,
    record: &mut ProcessRecord,
    condition: WaitCondition,
    now: DateTime<Utc>,
) -> QueueResult<()> {
    record.wait_condition = condition.clone();
    record.last_updated_at = now;
    store_record(connection, record)?;
    append_event(connection, &record.key, &AuditEventKind::Wait { condition }, now)
}

fn store_record(connection: &Connection, record: &ProcessRecord) -> QueueResult<()> {
    connection.execute(
        r#"
        UPDATE processes SET
            status = ?2, meta_json = ?3, tags_json = ?4, start_at = ?5,
            requirements_json = ?6, process_timeout = ?7, handlers_json = ?8,
            imports_json = ?9, exclusive_json = ?10, exclusive_group = ?11,
            wait_json = ?12, agent_id = ?13, last_updated_at = ?14, last_run_at = ?15
        WHERE instance_id = ?1
        "#,
        params![
            record.key.instance_id.to_string(),
            record.status.as_str(),
            serialize_json(&record.meta)?,
            serialize_json(&record.tags)?,
            option_timestamp_to_db(record.start_at),
            option_json_to_db(record.requirements.as_ref())?,
            option_u64_to_db("process_timeout", record.process_timeout)?,
            serialize_json(&record.handlers)?,
            serialize_json(&record.imports)?,
            option_json_to_db(record.exclusive.as_ref())?,
            record.exclusive_group(),
            serialize_json(&record.wait_condition)?,
            record.agent_id,
            timestamp_to_db(record.last_updated_at),
            option_timestamp_to_db(record.last_run_at),
        ],
    )?;
    Ok(())
}

fn append_event(
    connection: &Connection,
    key: &ProcessKey,
    event: &AuditEventKind,
    recorded_at: DateTime<Utc>,
) -> QueueResult<()> {
    connection.execute(
        r#"
        INSERT INTO process_events (instance_id, created_at, event_type, event_json, recorded_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            key.instance_id.to_string(),
            timestamp_to_db(key.created_at),
            event.label(),
            serialize_json(event)?,
            timestamp_to_db(recorded_at),
        ],
    )?;
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> QueueResult<ProcessRecord> {
    let key = ProcessKey::new(
        uuid_from_db("instance_id", &row.get::<_, String>(0)?)?,
        timestamp_from_db(&row.get::<_, String>(1)?)?,
    );
    Ok(ProcessRecord {
        key,
        status: status_from_db(&row.get::<_, String>(2)?)?,
        kind: kind_from_db(&row.get::<_, String>(3)?)?,
        parent_instance_id: option_uuid_from_db("parent_instance_id", row.get(4)?)?,
        project_id: option_uuid_from_db("project_id", row.get(5)?)?,
        repo_id: option_uuid_from_db("repo_id", row.get(6)?)?,
        initiator_id: option_uuid_from_db("initiator_id", row.get(7)?)?,
        meta: deserialize_json(&row.get::<_, String>(8)?)?,
        tags: deserialize_json(&row.get::<_, String>(9)?)?,
        start_at: option_timestamp_from_db(row.get(10)?)?,
        requirements: option_json_from_db(row.get(11)?)?,
        process_timeout: row
            .get::<_, Option<i64>>(12)?
            .map(|value| i64_to_u64("process_timeout", value))
            .transpose()?,
        handlers: deserialize_json(&row.get::<_, String>(13)?)?,
        imports: deserialize_json(&row.get::<_, String>(14)?)?,
        exclusive: option_json_from_db(row.get(15)?)?,
        wait_condition: deserialize_json(&row.get::<_, String>(17)?)?,
        agent_id: row.get(18)?,
        last_updated_at: timestamp_from_db(&row.get::<_, String>(19)?)?,
        last_run_at: option_timestamp_from_db(row.get(20)?)?,
    })
}

fn serialize_json<T: Serialize>(value: &T) -> QueueResult<String> {
    serde_json::to_string(value).map_err(ProcessQueueError::from)
}

fn deserialize_json<T: DeserializeOwned>(value: &str) -> QueueResult<T> {
    serde_json::from_str(value).map_err(ProcessQueueError::from)
}

fn option_json_to_db<T: Serialize>(value: Option<&T>) -> QueueResult<Option<String>> {
    value.map(serialize_json).transpose()
}

fn option_json_from_db<T: DeserializeOwned>(value: Option<String>) -> QueueResult<Option<T>> {
    value.as_deref().map(deserialize_json).transpose()
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn option_timestamp_to_db(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(timestamp_to_db)
}

fn timestamp_from_db(value: &str) -> QueueResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn option_timestamp_from_db(value: Option<String>) -> QueueResult<Option<DateTime<Utc>>> {
    value.as_deref().map(timestamp_from_db).transpose()
}

fn option_uuid_to_db(value: Option<Uuid>) -> Option<String> {
    value.map(|id| id.to_string())
}

fn uuid_from_db(field: &'static str, value: &str) -> QueueResult<Uuid> {
    Uuid::parse_str(value).map_err(|_| ProcessQueueError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

fn option_uuid_from_db(field: &'static str, value: Option<String>) -> QueueResult<Option<Uuid>> {
    value
        .as_deref()
        .map(|item| uuid_from_db(field, item))
        .transpose()
}

fn status_from_db(value: &str) -> QueueResult<ProcessStatus> {
    value
        .parse()
        .map_err(|_| ProcessQueueError::InvalidPersistedValue {
            field: "status",
            value: value.to_string(),
        })
}

fn kind_from_db(value: &str) -> QueueResult<ProcessKind> {
    ProcessKind::parse(value).ok_or_else(|| ProcessQueueError::InvalidPersistedValue {
        field: "kind",
        value: value.to_string(),
    })
}

fn option_u64_to_db(field: &'static str, value: Option<u64>) -> QueueResult<Option<i64>> {
    value
        .map(|item| {
            i64::try_from(item).map_err(|_| {
                ProcessQueueError::InvalidArgument(format!("{field} value {item} is out of range"))
            })
        })
        .transpose()
}

fn i64_to_u64(field: &'static str, value: i64) -> QueueResult<u64> {
    u64::try_from(value).map_err(|_| ProcessQueueError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}
