//! Process queue abstractions, audit log and in-memory backend.
//!
//! [`ProcessQueue`] is the storage contract: every mutation commits together
//! with its audit event or not at all, and conditional updates are atomic
//! compare-and-set operations per key. [`ProcessQueueManager`] layers the
//! state machine, exclusive groups, cascade and fork/resume on top of it.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tau_process_state::ProcessStateError;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

mod cascade;
mod dispatch;
mod exclusive;
mod manager;
mod scheduling;
mod sqlite;

pub use cascade::CascadeReport;
pub use dispatch::requirements_satisfied;
pub use exclusive::EnqueueOutcome;
pub use manager::{ForkRequest, ProcessQueueManager, PruneReport, ResumeResult};
pub use scheduling::{build_schedule, parse_process_timeout, system_meta};
pub use sqlite::SqliteProcessQueue;
pub use tau_process_types::{
    AuditEvent, AuditEventKind, ExclusiveGroup, ExclusiveMode, Payload, ProcessKey, ProcessKind,
    ProcessQuery, ProcessRecord, ProcessSchedule, ProcessStatus, StatusHistoryEntry, ValueMap,
    WaitCondition,
};

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, ProcessQueueError>;

/// Errors returned by queue implementations and the queue manager.
#[derive(Debug, Error)]
pub enum ProcessQueueError {
    #[error("process '{0}' not found")]
    ProcessNotFound(ProcessKey),
    #[error("process '{0}' already exists")]
    DuplicateProcess(ProcessKey),
    #[error("invalid process status transition: {from} -> {to}")]
    InvalidStateTransition {
        from: ProcessStatus,
        to: ProcessStatus,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    State(#[from] ProcessStateError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<tau_process_types::StatusTransitionError> for ProcessQueueError {
    fn from(error: tau_process_types::StatusTransitionError) -> Self {
        Self::InvalidStateTransition {
            from: error.from,
            to: error.to,
        }
    }
}

/// Current time at the precision every backend persists.
pub(crate) fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Status payload written by a claim so the agent survives later clears.
pub(crate) fn agent_payload(agent_id: &str) -> ValueMap {
    ValueMap::from([("agentId".to_string(), Value::String(agent_id.to_string()))])
}

/// How an agent assignment applies to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AgentAssignment {
    /// ENQUEUED -> RUNNING with the agent, one status event.
    Claim,
    /// Already RUNNING through a compare-and-set; attach the agent only.
    Attach,
    /// Already RUNNING under this agent.
    Unchanged,
}

pub(crate) fn agent_assignment(
    record: &ProcessRecord,
    agent_id: &str,
) -> QueueResult<AgentAssignment> {
    match (record.status, record.agent_id.as_deref()) {
        (ProcessStatus::Enqueued, _) => Ok(AgentAssignment::Claim),
        (ProcessStatus::Running, None) => Ok(AgentAssignment::Attach),
        (ProcessStatus::Running, Some(current)) if current == agent_id => {
            Ok(AgentAssignment::Unchanged)
        }
        (from, _) => Err(ProcessQueueError::InvalidStateTransition {
            from,
            to: ProcessStatus::Running,
        }),
    }
}

/// Async queue storage contract used by the queue manager.
///
/// Implementations do not apply the status state machine except where a
/// method says so; that is the manager's job. Every status change appends a
/// `Status` audit event and every wait change a `Wait` event in the same
/// atomic unit.
#[async_trait]
pub trait ProcessQueue: Send + Sync {
    /// Stores a new record and its initial status event.
    async fn insert(&self, record: ProcessRecord) -> QueueResult<()>;
    async fn get(&self, key: &ProcessKey) -> QueueResult<Option<ProcessRecord>>;
    async fn get_by_id(&self, instance_id: Uuid) -> QueueResult<Option<ProcessRecord>>;

    /// Attaches `schedule` and moves the record to ENQUEUED with `hold` as its
    /// wait condition. Fails unless the current status may enqueue.
    async fn enqueue(
        &self,
        key: &ProcessKey,
        schedule: &ProcessSchedule,
        hold: WaitCondition,
    ) -> QueueResult<ProcessRecord>;

    /// Unconditional status write. Returns the updated record.
    async fn update_status(
        &self,
        key: &ProcessKey,
        status: ProcessStatus,
        payload: ValueMap,
    ) -> QueueResult<ProcessRecord>;

    /// Compare-and-set on the status. `Ok(false)` means the current status was
    /// not `expected`.
    async fn update_expected_status(
        &self,
        key: &ProcessKey,
        expected: ProcessStatus,
        status: ProcessStatus,
        payload: ValueMap,
    ) -> QueueResult<bool>;

    /// All-or-nothing compare-and-set over `keys`: every key must exist and be
    /// in one of `expected`, otherwise nothing changes and `false` is returned.
    async fn update_expected_status_bulk(
        &self,
        keys: &[ProcessKey],
        expected: &[ProcessStatus],
        status: ProcessStatus,
    ) -> QueueResult<bool>;

    /// ENQUEUED -> RUNNING compare-and-set that records `agent_id` in the same
    /// transaction.
    async fn claim(&self, key: &ProcessKey, agent_id: &str) -> QueueResult<bool>;

    /// Assigns the agent of a RUNNING process. An ENQUEUED process moves to
    /// RUNNING with it; a RUNNING process claimed through a compare-and-set
    /// gets the agent attached without a second status event. Any other
    /// status, or a different agent, fails with `InvalidStateTransition` and
    /// writes nothing.
    async fn update_agent_id(
        &self,
        key: &ProcessKey,
        agent_id: &str,
        status: ProcessStatus,
    ) -> QueueResult<()>;

    /// Replaces the wait condition. Always appends a wait event.
    async fn update_wait(&self, key: &ProcessKey, condition: WaitCondition) -> QueueResult<()>;

    /// RUNNING -> SUSPENDED compare-and-set that stores `condition` atomically.
    async fn suspend(&self, key: &ProcessKey, condition: WaitCondition) -> QueueResult<bool>;

    async fn update_exclusive(
        &self,
        key: &ProcessKey,
        exclusive: Option<ExclusiveGroup>,
    ) -> QueueResult<()>;

    /// Lists records oldest first.
    async fn list(&self, query: &ProcessQuery) -> QueueResult<Vec<ProcessRecord>>;

    /// Audit events of one process in append order.
    async fn audit_log(&self, key: &ProcessKey) -> QueueResult<Vec<AuditEvent>>;

    /// Deletes terminal records, and their audit events, last updated before
    /// `before`.
    async fn prune_terminal(&self, before: DateTime<Utc>) -> QueueResult<Vec<ProcessKey>>;

    async fn children(&self, parent_instance_id: Uuid) -> QueueResult<Vec<ProcessRecord>> {
        self.list(&ProcessQuery {
            parent_instance_id: Some(parent_instance_id),
            ..ProcessQuery::default()
        })
        .await
    }

    async fn status_history(&self, key: &ProcessKey) -> QueueResult<Vec<StatusHistoryEntry>> {
        Ok(self
            .audit_log(key)
            .await?
            .iter()
            .filter_map(AuditEvent::as_status_entry)
            .collect())
    }

    /// Non-terminal records of the exclusive group `(project_id, group)`.
    async fn group_members(
        &self,
        project_id: Option<Uuid>,
        group: &str,
    ) -> QueueResult<Vec<ProcessRecord>> {
        let records = self
            .list(&ProcessQuery {
                project_id,
                exclusive_group: Some(group.to_string()),
                ..ProcessQuery::default()
            })
            .await?;
        Ok(records
            .into_iter()
            .filter(|record| record.project_id == project_id && !record.status.is_terminal())
            .collect())
    }

    /// RUNNING records whose declared timeout has elapsed at `now`.
    async fn find_timed_out(&self, now: DateTime<Utc>) -> QueueResult<Vec<ProcessRecord>> {
        let running = self
            .list(&ProcessQuery {
                statuses: Some(vec![ProcessStatus::Running]),
                ..ProcessQuery::default()
            })
            .await?;
        Ok(running
            .into_iter()
            .filter(|record| is_timed_out(record, now))
            .collect())
    }
}

pub(crate) fn is_timed_out(record: &ProcessRecord, now: DateTime<Utc>) -> bool {
    let (Some(timeout), Some(started)) = (record.process_timeout, record.last_run_at) else {
        return false;
    };
    let Some(timeout) = i64::try_from(timeout)
        .ok()
        .and_then(chrono::TimeDelta::try_seconds)
    else {
        return false;
    };
    started
        .checked_add_signed(timeout)
        .is_some_and(|deadline| deadline <= now)
}

/// In-memory implementation for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryProcessQueue {
    inner: RwLock<QueueInner>,
}

#[derive(Debug, Default)]
struct QueueInner {
    records: HashMap<Uuid, ProcessRecord>,
    events: Vec<AuditEvent>,
    next_seq: u64,
}

impl QueueInner {
    fn record(&self, key: &ProcessKey) -> Option<&ProcessRecord> {
        self.records
            .get(&key.instance_id)
            .filter(|record| record.key.created_at == key.created_at)
    }

    fn record_mut(&mut self, key: &ProcessKey) -> QueueResult<&mut ProcessRecord> {
        self.records
            .get_mut(&key.instance_id)
            .filter(|record| record.key.created_at == key.created_at)
            .ok_or(ProcessQueueError::ProcessNotFound(*key))
    }

    fn append(&mut self, key: ProcessKey, event: AuditEventKind, recorded_at: DateTime<Utc>) {
        self.next_seq += 1;
        self.events.push(AuditEvent {
            seq: self.next_seq,
            key,
            event,
            recorded_at,
        });
    }

    fn transition(
        &mut self,
        key: &ProcessKey,
        status: ProcessStatus,
        payload: ValueMap,
        now: DateTime<Utc>,
    ) -> QueueResult<ProcessRecord> {
        let record = self.record_mut(key)?;
        record.apply_status(status, now);
        let updated = record.clone();
        self.append(*key, AuditEventKind::Status { status, payload }, now);
        Ok(updated)
    }

    fn set_wait(
        &mut self,
        key: &ProcessKey,
        condition: WaitCondition,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let record = self.record_mut(key)?;
        record.wait_condition = condition.clone();
        record.last_updated_at = now;
        self.append(*key, AuditEventKind::Wait { condition }, now);
        Ok(())
    }
}

impl InMemoryProcessQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessQueue for InMemoryProcessQueue {
    async fn insert(&self, mut record: ProcessRecord) -> QueueResult<()> {
        let mut inner = self.inner.write().await;
        if inner.records.contains_key(&record.key.instance_id) {
            return Err(ProcessQueueError::DuplicateProcess(record.key));
        }
        let now = now_micros();
        record.last_updated_at = now;
        let key = record.key;
        let status = record.status;
        inner.records.insert(key.instance_id, record);
        inner.append(
            key,
            AuditEventKind::Status {
                status,
                payload: ValueMap::new(),
            },
            now,
        );
        tracing::debug!(instance_id = %key.instance_id, %status, "inserted process");
        Ok(())
    }

    async fn get(&self, key: &ProcessKey) -> QueueResult<Option<ProcessRecord>> {
        Ok(self.inner.read().await.record(key).cloned())
    }

    async fn get_by_id(&self, instance_id: Uuid) -> QueueResult<Option<ProcessRecord>> {
        Ok(self.inner.read().await.records.get(&instance_id).cloned())
    }

    async fn enqueue(
        &self,
        key: &ProcessKey,
        schedule: &ProcessSchedule,
        hold: WaitCondition,
    ) -> QueueResult<ProcessRecord> {
        let mut inner = self.inner.write().await;
        let now = now_micros();
        let record = inner.record_mut(key)?;
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
        let updated = record.clone();

        inner.append(
            *key,
            AuditEventKind::Status {
                status: ProcessStatus::Enqueued,
                payload: ValueMap::new(),
            },
            now,
        );
        if wait_changed {
            inner.append(*key, AuditEventKind::Wait { condition: hold }, now);
        }
        Ok(updated)
    }

    async fn update_status(
        &self,
        key: &ProcessKey,
        status: ProcessStatus,
        payload: ValueMap,
    ) -> QueueResult<ProcessRecord> {
        let mut inner = self.inner.write().await;
        inner.transition(key, status, payload, now_micros())
    }

    async fn update_expected_status(
        &self,
        key: &ProcessKey,
        expected: ProcessStatus,
        status: ProcessStatus,
        payload: ValueMap,
    ) -> QueueResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.record_mut(key)?.status != expected {
            return Ok(false);
        }
        inner.transition(key, status, payload, now_micros())?;
        Ok(true)
    }

    async fn update_expected_status_bulk(
        &self,
        keys: &[ProcessKey],
        expected: &[ProcessStatus],
        status: ProcessStatus,
    ) -> QueueResult<bool> {
        let mut inner = self.inner.write().await;
        let all_expected = keys.iter().all(|key| {
            inner
                .record(key)
                .is_some_and(|record| expected.contains(&record.status))
        });
        if !all_expected {
            return Ok(false);
        }
        let now = now_micros();
        for key in keys {
            inner.transition(key, status, ValueMap::new(), now)?;
        }
        Ok(true)
    }

    async fn claim(&self, key: &ProcessKey, agent_id: &str) -> QueueResult<bool> {
        let mut inner = self.inner.write().await;
        let now = now_micros();
        let record = inner.record_mut(key)?;
        if record.status != ProcessStatus::Enqueued {
            return Ok(false);
        }
        record.apply_status(ProcessStatus::Running, now);
        record.agent_id = Some(agent_id.to_string());
        inner.append(
            *key,
            AuditEventKind::Status {
                status: ProcessStatus::Running,
                payload: agent_payload(agent_id),
            },
            now,
        );
        Ok(true)
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
        let mut inner = self.inner.write().await;
        let now = now_micros();
        let record = inner.record_mut(key)?;
        match agent_assignment(record, agent_id)? {
            AgentAssignment::Claim => {
                record.apply_status(status, now);
                record.agent_id = Some(agent_id.to_string());
                inner.append(
                    *key,
                    AuditEventKind::Status {
                        status,
                        payload: agent_payload(agent_id),
                    },
                    now,
                );
            }
            AgentAssignment::Attach => {
                record.agent_id = Some(agent_id.to_string());
                record.last_updated_at = now;
            }
            AgentAssignment::Unchanged => {}
        }
        Ok(())
    }

    async fn update_wait(&self, key: &ProcessKey, condition: WaitCondition) -> QueueResult<()> {
        self.inner
            .write()
            .await
            .set_wait(key, condition, now_micros())
    }

    async fn suspend(&self, key: &ProcessKey, condition: WaitCondition) -> QueueResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.record_mut(key)?.status != ProcessStatus::Running {
            return Ok(false);
        }
        let now = now_micros();
        inner.set_wait(key, condition, now)?;
        inner.transition(key, ProcessStatus::Suspended, ValueMap::new(), now)?;
        Ok(true)
    }

    async fn update_exclusive(
        &self,
        key: &ProcessKey,
        exclusive: Option<ExclusiveGroup>,
    ) -> QueueResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner.record_mut(key)?;
        record.exclusive = exclusive;
        record.last_updated_at = now_micros();
        Ok(())
    }

    async fn list(&self, query: &ProcessQuery) -> QueueResult<Vec<ProcessRecord>> {
        let inner = self.inner.read().await;
        let mut records: Vec<ProcessRecord> = inner
            .records
            .values()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        records.sort_by_key(|record| (record.key.created_at, record.key.instance_id));
        Ok(query.paginate(records))
    }

    async fn audit_log(&self, key: &ProcessKey) -> QueueResult<Vec<AuditEvent>> {
        let inner = self.inner.read().await;
        if inner.record(key).is_none() {
            return Err(ProcessQueueError::ProcessNotFound(*key));
        }
        Ok(inner
            .events
            .iter()
            .filter(|event| event.key == *key)
            .cloned()
            .collect())
    }

    async fn prune_terminal(&self, before: DateTime<Utc>) -> QueueResult<Vec<ProcessKey>> {
        let mut inner = self.inner.write().await;
        let mut pruned: Vec<ProcessKey> = inner
            .records
            .values()
            .filter(|record| record.status.is_terminal() && record.last_updated_at < before)
            .map(|record| record.key)
            .collect();
        pruned.sort();
        for key in &pruned {
            inner.records.remove(&key.instance_id);
        }
        inner.events.retain(|event| !pruned.contains(&event.key));
        Ok(pruned)
    }
}
