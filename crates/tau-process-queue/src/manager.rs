use crate::exclusive::GroupLocks;
use crate::scheduling::{build_meta, build_schedule, keep_request_id};
use crate::{EnqueueOutcome, ProcessQueue, ProcessQueueError, QueueResult};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tau_process_state::{PayloadManager, SnapshotStore, StagedPayload};
use tau_process_types::{
    AuditEvent, ExclusiveGroup, Payload, ProcessKey, ProcessKind, ProcessQuery, ProcessRecord,
    ProcessStatus, StatusHistoryEntry, ValueMap, WaitCondition,
};
use tracing::instrument;
use uuid::Uuid;

/// Parameters of a fork from a parent's current snapshot.
#[derive(Debug, Clone)]
pub struct ForkRequest {
    pub child_key: ProcessKey,
    pub kind: ProcessKind,
    /// Defaults to the parent's initiator when unset.
    pub initiator_id: Option<Uuid>,
    pub initiator: Option<String>,
    pub entry_point: Option<String>,
    pub configuration: ValueMap,
    pub request_data: ValueMap,
}

impl ForkRequest {
    pub fn new(kind: ProcessKind) -> Self {
        Self {
            child_key: ProcessKey::generate(),
            kind,
            initiator_id: None,
            initiator: None,
            entry_point: None,
            configuration: ValueMap::new(),
            request_data: ValueMap::new(),
        }
    }

    pub fn with_child_key(mut self, child_key: ProcessKey) -> Self {
        self.child_key = child_key;
        self
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = Some(entry_point.into());
        self
    }

    pub fn with_initiator(
        mut self,
        initiator_id: Option<Uuid>,
        initiator: impl Into<String>,
    ) -> Self {
        self.initiator_id = initiator_id;
        self.initiator = Some(initiator.into());
        self
    }

    pub fn with_configuration(mut self, configuration: ValueMap) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_request_data(mut self, request_data: ValueMap) -> Self {
        self.request_data = request_data;
        self
    }
}

/// A resumed process: its enqueue outcome and the staged workspace the
/// executor continues from.
#[derive(Debug)]
pub struct ResumeResult {
    pub outcome: EnqueueOutcome,
    pub staged: StagedPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub records: Vec<ProcessKey>,
    pub snapshots: usize,
}

/// Lifecycle engine over a [`ProcessQueue`] and a [`SnapshotStore`].
///
/// Applies the status state machine to caller requests, coordinates
/// exclusive groups, and builds fork and resume payloads.
pub struct ProcessQueueManager {
    pub(crate) queue: Arc<dyn ProcessQueue>,
    pub(crate) payloads: PayloadManager,
    pub(crate) group_locks: GroupLocks,
}

impl std::fmt::Debug for ProcessQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessQueueManager")
            .field("payloads", &self.payloads)
            .finish_non_exhaustive()
    }
}

impl ProcessQueueManager {
    pub fn new(queue: Arc<dyn ProcessQueue>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self::with_payload_manager(queue, PayloadManager::new(snapshots))
    }

    pub fn with_payload_manager(queue: Arc<dyn ProcessQueue>, payloads: PayloadManager) -> Self {
        Self {
            queue,
            payloads,
            group_locks: GroupLocks::default(),
        }
    }

    pub fn queue(&self) -> &Arc<dyn ProcessQueue> {
        &self.queue
    }

    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore> {
        self.payloads.store()
    }

    async fn require(&self, key: &ProcessKey) -> QueueResult<ProcessRecord> {
        self.queue
            .get(key)
            .await?
            .ok_or(ProcessQueueError::ProcessNotFound(*key))
    }

    /// Registers a new PREPARING process from the payload headers.
    #[instrument(skip(self, payload), fields(instance_id = %payload.key.instance_id))]
    pub async fn insert(&self, payload: &Payload) -> QueueResult<ProcessRecord> {
        let cfg = payload.effective_configuration();
        let mut record = ProcessRecord::new(payload.key, ProcessStatus::Preparing);
        record.kind = payload.kind;
        record.parent_instance_id = payload.parent_instance_id;
        record.project_id = payload.project_id;
        record.repo_id = payload.repo_id;
        record.initiator_id = payload.initiator_id;
        record.meta = build_meta(payload, &cfg)?;
        record.tags = payload.tags.clone();
        record.handlers = payload.handlers.clone();
        record.imports = payload.imports.clone();

        self.queue.insert(record).await?;
        tracing::debug!(kind = %payload.kind, "registered process");
        self.require(&payload.key).await
    }

    /// Moves a PREPARING, RESUMING or SUSPENDED process to ENQUEUED.
    ///
    /// The schedule is parsed before anything is written, so malformed
    /// reserved keys leave the record untouched. Re-enqueues inherit unset
    /// schedule fields from the record; exclusive coordination only applies
    /// to the first enqueue.
    #[instrument(skip(self, payload), fields(instance_id = %payload.key.instance_id))]
    pub async fn enqueue(&self, payload: &Payload) -> QueueResult<EnqueueOutcome> {
        let mut schedule = build_schedule(payload)?;
        let record = self.require(&payload.key).await?;
        if !record.status.can_enqueue() {
            return Err(ProcessQueueError::InvalidStateTransition {
                from: record.status,
                to: ProcessStatus::Enqueued,
            });
        }
        if payload.request_id().is_none() {
            keep_request_id(&mut schedule, &record);
        }
        if record.status != ProcessStatus::Preparing {
            schedule.inherit_from(&record);
        }

        let outcome = match (record.status, schedule.exclusive.clone()) {
            (ProcessStatus::Preparing, Some(exclusive)) => {
                let (outcome, groups) = self
                    .enqueue_exclusive(&record, &schedule, &exclusive)
                    .await?;
                self.wake_groups(groups).await;
                outcome
            }
            _ => EnqueueOutcome::Enqueued {
                record: self
                    .queue
                    .enqueue(&payload.key, &schedule, WaitCondition::None)
                    .await?,
                cancelled: Vec::new(),
            },
        };
        tracing::debug!(from = %record.status, runnable = outcome.is_runnable(), "enqueue handled");
        Ok(outcome)
    }

    /// Forced status write, bypassing the state machine.
    pub async fn update_status(
        &self,
        key: &ProcessKey,
        status: ProcessStatus,
        payload: ValueMap,
    ) -> QueueResult<ProcessRecord> {
        let record = self.queue.update_status(key, status, payload).await?;
        tracing::debug!(instance_id = %key.instance_id, %status, "forced status update");
        self.wake_after(std::slice::from_ref(&record)).await;
        Ok(record)
    }

    /// Validated compare-and-set. `Ok(false)` means the process was no longer
    /// in `expected`. A winning ENQUEUED -> RUNNING caller pairs it with
    /// [`Self::update_agent_id`], which attaches the agent without a second
    /// RUNNING history entry; [`Self::claim`] does both at once.
    pub async fn update_expected_status(
        &self,
        key: &ProcessKey,
        expected: ProcessStatus,
        status: ProcessStatus,
    ) -> QueueResult<bool> {
        self.update_expected_status_with_payload(key, expected, status, ValueMap::new())
            .await
    }

    pub async fn update_expected_status_with_payload(
        &self,
        key: &ProcessKey,
        expected: ProcessStatus,
        status: ProcessStatus,
        payload: ValueMap,
    ) -> QueueResult<bool> {
        expected.ensure_transition(status)?;
        if !self
            .queue
            .update_expected_status(key, expected, status, payload)
            .await?
        {
            tracing::debug!(
                instance_id = %key.instance_id,
                %expected,
                %status,
                "status changed concurrently"
            );
            return Ok(false);
        }
        if status.is_terminal() {
            if let Some(record) = self.queue.get(key).await? {
                self.wake_after(&[record]).await;
            }
        }
        Ok(true)
    }

    /// All-or-nothing validated compare-and-set over `keys`.
    pub async fn update_expected_status_bulk(
        &self,
        keys: &[ProcessKey],
        expected: &[ProcessStatus],
        status: ProcessStatus,
    ) -> QueueResult<bool> {
        for from in expected {
            from.ensure_transition(status)?;
        }
        if !self
            .queue
            .update_expected_status_bulk(keys, expected, status)
            .await?
        {
            return Ok(false);
        }
        if status.is_terminal() {
            let mut records = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(record) = self.queue.get(key).await? {
                    records.push(record);
                }
            }
            self.wake_after(&records).await;
        }
        Ok(true)
    }

    /// Assigns the agent of an ENQUEUED or freshly claimed RUNNING process.
    /// Terminal and suspended processes fail with `InvalidStateTransition`.
    pub async fn update_agent_id(
        &self,
        key: &ProcessKey,
        agent_id: &str,
        status: ProcessStatus,
    ) -> QueueResult<()> {
        self.queue.update_agent_id(key, agent_id, status).await
    }

    pub async fn update_wait(&self, key: &ProcessKey, condition: WaitCondition) -> QueueResult<()> {
        self.queue.update_wait(key, condition).await
    }

    pub async fn update_exclusive(
        &self,
        key: &ProcessKey,
        exclusive: Option<ExclusiveGroup>,
    ) -> QueueResult<()> {
        self.queue.update_exclusive(key, exclusive).await
    }

    /// RUNNING -> SUSPENDED with the condition the process waits on.
    pub async fn suspend(
        &self,
        key: &ProcessKey,
        condition: WaitCondition,
    ) -> QueueResult<bool> {
        let suspended = self.queue.suspend(key, condition).await?;
        if !suspended {
            tracing::debug!(
                instance_id = %key.instance_id,
                "suspend skipped, process is not running"
            );
        }
        Ok(suspended)
    }

    /// Resumes a SUSPENDED process on `event_name`: SUSPENDED -> RESUMING,
    /// restore its snapshot into a fresh workspace, then re-enqueue. A failure
    /// after the first step puts the process back to SUSPENDED.
    #[instrument(skip(self, request), fields(instance_id = %key.instance_id))]
    pub async fn resume(
        &self,
        key: &ProcessKey,
        event_name: &str,
        request: ValueMap,
    ) -> QueueResult<ResumeResult> {
        let record = self.require(key).await?;
        let marker = ValueMap::from([("resumeEvent".to_string(), json!(event_name))]);
        if !self
            .queue
            .update_expected_status(key, ProcessStatus::Suspended, ProcessStatus::Resuming, marker)
            .await?
        {
            let current = self
                .queue
                .get(key)
                .await?
                .map_or(record.status, |record| record.status);
            return Err(ProcessQueueError::InvalidStateTransition {
                from: current,
                to: ProcessStatus::Resuming,
            });
        }

        let staged = match self
            .payloads
            .create_resume_payload(*key, event_name, request)
            .await
        {
            Ok(staged) => staged,
            Err(error) => {
                let error = ProcessQueueError::from(error);
                self.rollback_resume(key, &error).await?;
                return Err(error);
            }
        };
        let outcome = match self.enqueue(&staged.payload).await {
            Ok(outcome) => outcome,
            Err(error) => {
                self.rollback_resume(key, &error).await?;
                return Err(error);
            }
        };
        tracing::info!(event_name, "resumed process");
        Ok(ResumeResult { outcome, staged })
    }

    async fn rollback_resume(
        &self,
        key: &ProcessKey,
        cause: &ProcessQueueError,
    ) -> QueueResult<()> {
        tracing::warn!(
            instance_id = %key.instance_id,
            error = %cause,
            "resume failed, suspending again"
        );
        let payload = ValueMap::from([("reason".to_string(), json!(cause.to_string()))]);
        self.queue
            .update_expected_status(
                key,
                ProcessStatus::Resuming,
                ProcessStatus::Suspended,
                payload,
            )
            .await?;
        Ok(())
    }

    /// Creates a PREPARING child of `parent` seeded with the parent's current
    /// snapshot. The child inherits the parent's project, repository and,
    /// unless overridden, initiator.
    #[instrument(
        skip(self, request),
        fields(parent = %parent.instance_id, child = %request.child_key.instance_id)
    )]
    pub async fn fork(
        &self,
        parent: &ProcessKey,
        request: ForkRequest,
    ) -> QueueResult<StagedPayload> {
        let parent_record = self.require(parent).await?;
        let mut staged = self
            .payloads
            .create_fork_payload(
                parent.instance_id,
                request.child_key,
                request.kind,
                request.entry_point.as_deref(),
                request.request_data,
            )
            .await?;
        staged.payload.project_id = parent_record.project_id;
        staged.payload.repo_id = parent_record.repo_id;
        staged.payload.initiator_id = request.initiator_id.or(parent_record.initiator_id);
        staged.payload.initiator = request.initiator;
        staged.payload.configuration = request.configuration;

        self.insert(&staged.payload).await?;
        if let Err(error) = self
            .snapshots()
            .import_path(request.child_key.instance_id, None, staged.workspace())
            .await
        {
            let error = ProcessQueueError::from(error);
            let payload = ValueMap::from([("reason".to_string(), json!(error.to_string()))]);
            self.queue
                .update_status(&request.child_key, ProcessStatus::Failed, payload)
                .await?;
            return Err(error);
        }
        tracing::info!(kind = %request.kind, "forked process");
        Ok(staged)
    }

    pub async fn find_timed_out(&self, now: DateTime<Utc>) -> QueueResult<Vec<ProcessRecord>> {
        self.queue.find_timed_out(now).await
    }

    /// Deletes terminal records last updated before `before` and, when asked,
    /// their snapshots.
    #[instrument(skip(self))]
    pub async fn prune(
        &self,
        before: DateTime<Utc>,
        remove_snapshots: bool,
    ) -> QueueResult<PruneReport> {
        let records = self.queue.prune_terminal(before).await?;
        let mut snapshots = 0;
        if remove_snapshots {
            for key in &records {
                if self.snapshots().remove(key.instance_id).await? {
                    snapshots += 1;
                }
            }
        }
        tracing::info!(records = records.len(), snapshots, "pruned terminal processes");
        Ok(PruneReport { records, snapshots })
    }

    pub async fn get(&self, key: &ProcessKey) -> QueueResult<Option<ProcessRecord>> {
        self.queue.get(key).await
    }

    pub async fn get_by_id(&self, instance_id: Uuid) -> QueueResult<Option<ProcessRecord>> {
        self.queue.get_by_id(instance_id).await
    }

    pub async fn list(&self, query: &ProcessQuery) -> QueueResult<Vec<ProcessRecord>> {
        self.queue.list(query).await
    }

    pub async fn children(&self, parent_instance_id: Uuid) -> QueueResult<Vec<ProcessRecord>> {
        self.queue.children(parent_instance_id).await
    }

    pub async fn audit_log(&self, key: &ProcessKey) -> QueueResult<Vec<AuditEvent>> {
        self.queue.audit_log(key).await
    }

    pub async fn status_history(&self, key: &ProcessKey) -> QueueResult<Vec<StatusHistoryEntry>> {
        self.queue.status_history(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::ForkRequest;
    use crate::{
        EnqueueOutcome, InMemoryProcessQueue, Payload, ProcessKey, ProcessKind, ProcessQueueError,
        ProcessQueueManager, ProcessStatus, WaitCondition,
    };
    use chrono::{TimeDelta, Utc};
    use serde_json::json;
    use std::sync::Arc;
    use tau_process_state::{InMemorySnapshotStore, SnapshotEntry, SnapshotStore};
    use tau_process_types::ValueMap;
    use uuid::Uuid;

    fn map(value: serde_json::Value) -> ValueMap {
        serde_json::from_value(value).expect("object literal")
    }

    fn manager() -> (ProcessQueueManager, Arc<InMemorySnapshotStore>) {
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let manager =
            ProcessQueueManager::new(Arc::new(InMemoryProcessQueue::new()), snapshots.clone());
        (manager, snapshots)
    }

    async fn running(manager: &ProcessQueueManager, payload: &Payload) {
        manager.insert(payload).await.expect("insert");
        manager.enqueue(payload).await.expect("enqueue");
        assert!(manager.claim(&payload.key, "agent-1").await.expect("claim"));
    }

    #[tokio::test]
    async fn insert_records_headers_and_system_meta() {
        let (manager, _) = manager();
        let project = Uuid::new_v4();
        let payload = Payload::new(ProcessKey::generate())
            .with_project(project)
            .with_tags(["release"])
            .with_configuration(map(json!({ "meta": { "team": "core" } })))
            .with_request_data(map(json!({ "requestId": "req-1" })));

        let record = manager.insert(&payload).await.expect("insert");
        assert_eq!(record.status, ProcessStatus::Preparing);
        assert_eq!(record.project_id, Some(project));
        assert!(record.tags.contains("release"));
        assert_eq!(record.meta["team"], json!("core"));
        assert_eq!(record.meta["_system"]["requestId"], json!("req-1"));
    }

    #[tokio::test]
    async fn enqueue_keeps_correlation_id_minted_at_insert() {
        let (manager, _) = manager();
        let payload = Payload::new(ProcessKey::generate())
            .with_configuration(map(json!({ "meta": { "team": "core" } })));

        let inserted = manager.insert(&payload).await.expect("insert");
        let request_id = inserted.request_id().expect("minted id").to_string();
        let outcome = manager.enqueue(&payload).await.expect("enqueue");
        let enqueued = outcome.record().expect("record");
        assert_eq!(enqueued.request_id(), Some(request_id.as_str()));
        assert_eq!(enqueued.meta["team"], json!("core"));

        let explicit = Payload::new(ProcessKey::generate())
            .with_request_data(map(json!({ "requestId": "req-9" })));
        manager.insert(&explicit).await.expect("insert explicit");
        let outcome = manager.enqueue(&explicit).await.expect("enqueue explicit");
        assert_eq!(outcome.record().expect("record").request_id(), Some("req-9"));
    }

    #[tokio::test]
    async fn late_agent_cannot_revive_cancelled_process() {
        let (manager, _) = manager();
        let payload = Payload::new(ProcessKey::generate());
        manager.insert(&payload).await.expect("insert");
        manager.enqueue(&payload).await.expect("enqueue");
        manager.kill_cascade(&payload.key).await.expect("kill");

        let error = manager
            .update_agent_id(&payload.key, "stale-agent", ProcessStatus::Running)
            .await
            .expect_err("cancelled process stays cancelled");
        assert!(matches!(
            error,
            ProcessQueueError::InvalidStateTransition {
                from: ProcessStatus::Cancelled,
                to: ProcessStatus::Running,
            }
        ));
        let record = manager.get(&payload.key).await.expect("get").expect("record");
        assert_eq!(record.status, ProcessStatus::Cancelled);
        assert_eq!(record.agent_id, None);
    }

    #[tokio::test]
    async fn malformed_schedule_leaves_process_preparing() {
        let (manager, _) = manager();
        let payload = Payload::new(ProcessKey::generate())
            .with_configuration(map(json!({ "processTimeout": { "minutes": 5 } })));
        manager.insert(&payload).await.expect("insert");

        let error = manager.enqueue(&payload).await.expect_err("bad timeout");
        assert!(matches!(error, ProcessQueueError::InvalidArgument(_)));
        let record = manager.get(&payload.key).await.expect("get").expect("record");
        assert_eq!(record.status, ProcessStatus::Preparing);
        assert_eq!(manager.status_history(&payload.key).await.expect("history").len(), 1);
    }

    #[tokio::test]
    async fn enqueue_requires_known_enqueueable_process() {
        let (manager, _) = manager();
        let payload = Payload::new(ProcessKey::generate());
        assert!(matches!(
            manager.enqueue(&payload).await,
            Err(ProcessQueueError::ProcessNotFound(_))
        ));

        running(&manager, &payload).await;
        assert!(matches!(
            manager.enqueue(&payload).await,
            Err(ProcessQueueError::InvalidStateTransition {
                from: ProcessStatus::Running,
                to: ProcessStatus::Enqueued,
            })
        ));
    }

    #[tokio::test]
    async fn expected_status_updates_follow_the_state_machine() {
        let (manager, _) = manager();
        let payload = Payload::new(ProcessKey::generate());
        running(&manager, &payload).await;

        let error = manager
            .update_expected_status(&payload.key, ProcessStatus::Running, ProcessStatus::Preparing)
            .await
            .expect_err("illegal transition");
        assert!(matches!(error, ProcessQueueError::InvalidStateTransition { .. }));
        assert!(!manager
            .update_expected_status(&payload.key, ProcessStatus::Enqueued, ProcessStatus::Running)
            .await
            .expect("stale expectation"));
        assert!(manager
            .update_expected_status(&payload.key, ProcessStatus::Running, ProcessStatus::Finished)
            .await
            .expect("finish"));
        assert!(!manager.claim(&payload.key, "agent-2").await.expect("claim finished"));
    }

    #[tokio::test]
    async fn resume_restores_snapshot_and_inherits_schedule() {
        let (manager, snapshots) = manager();
        let payload = Payload::new(ProcessKey::generate())
            .with_tags(["nightly"])
            .with_configuration(map(json!({
                "processTimeout": "PT10M",
                "requirements": { "flavor": "gpu" },
            })));
        running(&manager, &payload).await;
        snapshots
            .import_entries(payload.key.instance_id, vec![SnapshotEntry::new("vars.json", "{}")])
            .await
            .expect("snapshot");
        let condition = WaitCondition::ExternalEvent {
            event_name: "approval".to_string(),
        };
        assert!(manager.suspend(&payload.key, condition).await.expect("suspend"));

        let resumed = manager
            .resume(&payload.key, "approval", map(json!({ "approved": true })))
            .await
            .expect("resume");
        let record = resumed.outcome.record().expect("enqueued").clone();
        assert_eq!(record.status, ProcessStatus::Enqueued);
        assert_eq!(record.process_timeout, Some(600));
        assert_eq!(record.requirements, Some(map(json!({ "flavor": "gpu" }))));
        assert!(record.tags.contains("nightly"));
        assert_eq!(record.wait_condition, WaitCondition::None);
        assert!(resumed.staged.workspace().join("vars.json").exists());
        assert_eq!(resumed.staged.payload.resume_event_name.as_deref(), Some("approval"));

        let statuses: Vec<_> = manager
            .status_history(&payload.key)
            .await
            .expect("history")
            .into_iter()
            .map(|entry| entry.status)
            .collect();
        assert_eq!(
            &statuses[statuses.len() - 3..],
            &[ProcessStatus::Suspended, ProcessStatus::Resuming, ProcessStatus::Enqueued]
        );
    }

    #[tokio::test]
    async fn resume_without_snapshot_returns_to_suspended() {
        let (manager, _) = manager();
        let payload = Payload::new(ProcessKey::generate());
        running(&manager, &payload).await;
        let condition = WaitCondition::ExternalEvent {
            event_name: "approval".to_string(),
        };
        assert!(manager.suspend(&payload.key, condition).await.expect("suspend"));

        let error = manager
            .resume(&payload.key, "approval", ValueMap::new())
            .await
            .expect_err("no snapshot");
        assert!(matches!(error, ProcessQueueError::State(_)));
        let record = manager.get(&payload.key).await.expect("get").expect("record");
        assert_eq!(record.status, ProcessStatus::Suspended);

        let other = Payload::new(ProcessKey::generate());
        running(&manager, &other).await;
        assert!(matches!(
            manager.resume(&other.key, "approval", ValueMap::new()).await,
            Err(ProcessQueueError::InvalidStateTransition {
                from: ProcessStatus::Running,
                to: ProcessStatus::Resuming,
            })
        ));
    }

    #[tokio::test]
    async fn fork_seeds_child_with_parent_snapshot() {
        let (manager, snapshots) = manager();
        let project = Uuid::new_v4();
        let parent = Payload::new(ProcessKey::generate()).with_project(project);
        running(&manager, &parent).await;
        snapshots
            .import_entries(
                parent.key.instance_id,
                vec![SnapshotEntry::new("flow/main.yml", "steps")],
            )
            .await
            .expect("parent snapshot");

        let staged = manager
            .fork(
                &parent.key,
                ForkRequest::new(ProcessKind::FailureHandler)
                    .with_entry_point("onFailure")
                    .with_request_data(map(json!({ "error": "boom" }))),
            )
            .await
            .expect("fork");

        let child = manager
            .get(&staged.payload.key)
            .await
            .expect("get")
            .expect("child record");
        assert_eq!(child.status, ProcessStatus::Preparing);
        assert_eq!(child.kind, ProcessKind::FailureHandler);
        assert_eq!(child.parent_instance_id, Some(parent.key.instance_id));
        assert_eq!(child.project_id, Some(project));
        assert_eq!(staged.payload.entry_point.as_deref(), Some("onFailure"));
        assert_eq!(
            snapshots
                .list_paths(child.key.instance_id)
                .await
                .expect("child paths"),
            vec!["flow/main.yml".to_string()]
        );
        assert_eq!(
            manager
                .children(parent.key.instance_id)
                .await
                .expect("children")
                .len(),
            1
        );

        let orphan = manager
            .fork(&ProcessKey::generate(), ForkRequest::new(ProcessKind::Default))
            .await
            .expect_err("unknown parent");
        assert!(matches!(orphan, ProcessQueueError::ProcessNotFound(_)));
    }

    #[tokio::test]
    async fn prune_removes_terminal_records_and_snapshots() {
        let (manager, snapshots) = manager();
        let payload = Payload::new(ProcessKey::generate());
        running(&manager, &payload).await;
        snapshots
            .import_entries(payload.key.instance_id, vec![SnapshotEntry::new("a", "1")])
            .await
            .expect("snapshot");
        manager
            .update_status(&payload.key, ProcessStatus::Finished, ValueMap::new())
            .await
            .expect("finish");

        let report = manager
            .prune(Utc::now() + TimeDelta::seconds(1), true)
            .await
            .expect("prune");
        assert_eq!(report.records, vec![payload.key]);
        assert_eq!(report.snapshots, 1);
        assert!(!snapshots.exists(payload.key.instance_id).await.expect("exists"));
    }

    #[tokio::test]
    async fn rejected_outcome_has_no_record() {
        let outcome = EnqueueOutcome::Rejected { holders: Vec::new() };
        assert!(outcome.record().is_none());
        assert!(!outcome.is_runnable());
    }
}
