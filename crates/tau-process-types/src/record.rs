use crate::{ProcessKey, ProcessStatus, WaitCondition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Schema-less, ordered key-value bag used for configuration, meta and
/// request data.
pub type ValueMap = BTreeMap<String, Value>;

/// Reserved group inside `meta` populated by the engine on every write.
pub const SYSTEM_META_GROUP: &str = "_system";
/// Correlation id entry inside [`SYSTEM_META_GROUP`].
pub const REQUEST_ID_META_KEY: &str = "requestId";

/// Recursively merges `overlay` into `target`. Nested objects merge, every
/// other value in `overlay` replaces the one in `target`.
pub fn merge_values(target: &mut ValueMap, overlay: &ValueMap) {
    for (key, value) in overlay {
        merge_json(target.entry(key.clone()).or_insert(Value::Null), value);
    }
}

fn merge_json(target: &mut Value, overlay: &Value) {
    match (target, overlay) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                merge_json(existing.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

/// Kind of process; handler kinds are forks spawned by a parent's handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessKind {
    #[default]
    Default,
    FailureHandler,
    CancelHandler,
    TimeoutHandler,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::FailureHandler => "FAILURE_HANDLER",
            Self::CancelHandler => "CANCEL_HANDLER",
            Self::TimeoutHandler => "TIMEOUT_HANDLER",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            Self::Default,
            Self::FailureHandler,
            Self::CancelHandler,
            Self::TimeoutHandler,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict policy applied when a process joins an occupied exclusive group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ExclusiveMode {
    #[default]
    CancelOld,
    CancelNew,
    Wait,
}

/// Named mutual-exclusion domain, scoped to a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExclusiveGroup {
    pub group: String,
    #[serde(default)]
    pub mode: ExclusiveMode,
}

impl ExclusiveGroup {
    pub fn new(group: impl Into<String>, mode: ExclusiveMode) -> Self {
        Self {
            group: group.into(),
            mode,
        }
    }
}

/// External resource merged into the workspace before execution. The queue
/// stores and forwards these; it never fetches them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ImportEntry {
    Git {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
    },
    Mvn {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
    },
    Dir {
        src: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dest: Option<String>,
    },
}

/// Scheduling metadata attached to a process when it is enqueued.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSchedule {
    pub tags: BTreeSet<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub requirements: Option<ValueMap>,
    /// Seconds after which a RUNNING process is considered overdue.
    pub process_timeout: Option<u64>,
    pub handlers: BTreeSet<String>,
    pub meta: ValueMap,
    pub imports: Vec<ImportEntry>,
    pub exclusive: Option<ExclusiveGroup>,
}

impl ProcessSchedule {
    /// Fills every unset field from an earlier enqueue of the same process.
    /// `start_at` is never inherited and `meta` merges with new values on top.
    pub fn inherit_from(&mut self, record: &ProcessRecord) {
        if self.tags.is_empty() {
            self.tags = record.tags.clone();
        }
        if self.requirements.is_none() {
            self.requirements = record.requirements.clone();
        }
        if self.process_timeout.is_none() {
            self.process_timeout = record.process_timeout;
        }
        if self.handlers.is_empty() {
            self.handlers = record.handlers.clone();
        }
        if self.imports.is_empty() {
            self.imports = record.imports.clone();
        }
        if self.exclusive.is_none() {
            self.exclusive = record.exclusive.clone();
        }
        let mut meta = record.meta.clone();
        merge_values(&mut meta, &self.meta);
        self.meta = meta;
    }
}

/// The queue's row for one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub key: ProcessKey,
    pub status: ProcessStatus,
    pub kind: ProcessKind,
    pub parent_instance_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub repo_id: Option<Uuid>,
    pub initiator_id: Option<Uuid>,
    #[serde(default)]
    pub meta: ValueMap,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub requirements: Option<ValueMap>,
    pub process_timeout: Option<u64>,
    #[serde(default)]
    pub handlers: BTreeSet<String>,
    #[serde(default)]
    pub imports: Vec<ImportEntry>,
    pub exclusive: Option<ExclusiveGroup>,
    #[serde(default)]
    pub wait_condition: WaitCondition,
    pub agent_id: Option<String>,
    pub last_updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl ProcessRecord {
    /// Creates a bare record with the given status.
    pub fn new(key: ProcessKey, status: ProcessStatus) -> Self {
        Self {
            key,
            status,
            kind: ProcessKind::Default,
            parent_instance_id: None,
            project_id: None,
            repo_id: None,
            initiator_id: None,
            meta: ValueMap::new(),
            tags: BTreeSet::new(),
            start_at: None,
            requirements: None,
            process_timeout: None,
            handlers: BTreeSet::new(),
            imports: Vec::new(),
            exclusive: None,
            wait_condition: WaitCondition::None,
            agent_id: None,
            last_updated_at: Utc::now(),
            last_run_at: None,
        }
    }

    /// Applies a status change and the bookkeeping that goes with it.
    pub fn apply_status(&mut self, status: ProcessStatus, now: DateTime<Utc>) {
        self.status = status;
        self.last_updated_at = now;
        if status == ProcessStatus::Running {
            self.last_run_at = Some(now);
        }
        if status.releases_agent() {
            self.agent_id = None;
        }
    }

    /// Copies scheduling metadata onto the record. The record's system meta
    /// group survives a schedule that does not carry one.
    pub fn apply_schedule(&mut self, schedule: &ProcessSchedule) {
        self.tags = schedule.tags.clone();
        self.start_at = schedule.start_at;
        self.requirements = schedule.requirements.clone();
        self.process_timeout = schedule.process_timeout;
        self.handlers = schedule.handlers.clone();
        let system = self.meta.remove(SYSTEM_META_GROUP);
        self.meta = schedule.meta.clone();
        if let Some(system) = system {
            self.meta.entry(SYSTEM_META_GROUP.to_string()).or_insert(system);
        }
        self.imports = schedule.imports.clone();
        self.exclusive = schedule.exclusive.clone();
    }

    /// Returns the exclusive group name, if any.
    pub fn exclusive_group(&self) -> Option<&str> {
        self.exclusive.as_ref().map(|exclusive| exclusive.group.as_str())
    }

    /// Correlation id recorded under the system meta group.
    pub fn request_id(&self) -> Option<&str> {
        self.meta
            .get(SYSTEM_META_GROUP)?
            .get(REQUEST_ID_META_KEY)?
            .as_str()
    }
}

/// Lifecycle event recorded in a process's audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventKind {
    Status {
        status: ProcessStatus,
        #[serde(default)]
        payload: ValueMap,
    },
    Wait {
        condition: WaitCondition,
    },
}

impl AuditEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Status { .. } => "PROCESS_STATUS",
            Self::Wait { .. } => "PROCESS_WAIT",
        }
    }
}

/// Immutable audit log row. `seq` is monotonic per store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub key: ProcessKey,
    pub event: AuditEventKind,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    /// Projects a status event onto a history entry.
    pub fn as_status_entry(&self) -> Option<StatusHistoryEntry> {
        match &self.event {
            AuditEventKind::Status { status, payload } => Some(StatusHistoryEntry {
                key: self.key,
                status: *status,
                timestamp: self.recorded_at,
                payload: payload.clone(),
            }),
            AuditEventKind::Wait { .. } => None,
        }
    }
}

/// One status transition of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub key: ProcessKey,
    pub status: ProcessStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: ValueMap,
}

/// Filter used when listing processes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessQuery {
    pub project_id: Option<Uuid>,
    /// Every listed tag must be present on the record.
    pub tags: Option<Vec<String>>,
    pub statuses: Option<Vec<ProcessStatus>>,
    pub parent_instance_id: Option<Uuid>,
    pub exclusive_group: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ProcessQuery {
    pub fn matches(&self, record: &ProcessRecord) -> bool {
        let project_match = self
            .project_id
            .is_none_or(|project_id| record.project_id == Some(project_id));
        let tags_match = self
            .tags
            .as_ref()
            .is_none_or(|tags| tags.iter().all(|tag| record.tags.contains(tag)));
        let status_match = self
            .statuses
            .as_ref()
            .is_none_or(|statuses| statuses.contains(&record.status));
        let parent_match = self
            .parent_instance_id
            .is_none_or(|parent| record.parent_instance_id == Some(parent));
        let group_match = self
            .exclusive_group
            .as_deref()
            .is_none_or(|group| record.exclusive_group() == Some(group));

        project_match && tags_match && status_match && parent_match && group_match
    }

    /// Applies `offset`/`limit` to an already sorted result set.
    pub fn paginate<T>(&self, mut rows: Vec<T>) -> Vec<T> {
        let start = self.offset.min(rows.len());
        let mut sliced = rows.split_off(start);
        if let Some(limit) = self.limit {
            sliced.truncate(limit);
        }
        sliced
    }
}
