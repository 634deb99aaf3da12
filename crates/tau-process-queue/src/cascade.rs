use crate::exclusive::{group_key, GroupKey};
use crate::{ProcessQueueError, ProcessQueueManager, QueueResult};
use std::collections::HashSet;
use tau_process_types::{ProcessKey, ProcessRecord, ProcessStatus, ValueMap};
use tracing::instrument;

/// Statuses a cascade moves to CANCELLED, batched in this order per level.
const CANCELLABLE: [ProcessStatus; 3] = [
    ProcessStatus::Enqueued,
    ProcessStatus::Suspended,
    ProcessStatus::Running,
];

/// Outcome of a kill cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeReport {
    pub root: ProcessKey,
    /// Processes moved to CANCELLED, parents before children.
    pub cancelled: Vec<ProcessKey>,
    /// Non-terminal processes left untouched, either because their status
    /// cannot be cancelled or because they changed concurrently.
    pub skipped: Vec<ProcessKey>,
}

impl CascadeReport {
    fn new(root: ProcessKey) -> Self {
        Self {
            root,
            cancelled: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn root_cancelled(&self) -> bool {
        self.cancelled.contains(&self.root)
    }
}

impl ProcessQueueManager {
    /// Cancels `root` and every non-terminal descendant, top-down.
    ///
    /// Terminal descendants are never touched. A descendant whose status
    /// changes while the cascade runs is skipped, not reported as an error.
    #[instrument(skip(self), fields(root = %root.instance_id))]
    pub async fn kill_cascade(&self, root: &ProcessKey) -> QueueResult<CascadeReport> {
        let (report, groups) = self.cancel_tree(root).await?;
        self.wake_groups(groups).await;
        Ok(report)
    }

    /// Cascade body; returns the exclusive groups that lost a member without
    /// waking them.
    pub(crate) async fn cancel_tree(
        &self,
        root: &ProcessKey,
    ) -> QueueResult<(CascadeReport, Vec<GroupKey>)> {
        let root_record = self
            .queue
            .get(root)
            .await?
            .ok_or(ProcessQueueError::ProcessNotFound(*root))?;

        let mut report = CascadeReport::new(*root);
        let mut groups = Vec::new();
        let mut visited = HashSet::from([root.instance_id]);
        let mut level = vec![root_record];

        while !level.is_empty() {
            self.cancel_level(&level, &mut report, &mut groups).await;

            let mut next = Vec::new();
            for record in &level {
                match self.queue.children(record.key.instance_id).await {
                    Ok(children) => next.extend(
                        children
                            .into_iter()
                            .filter(|child| visited.insert(child.key.instance_id)),
                    ),
                    Err(error) => tracing::warn!(
                        parent = %record.key.instance_id,
                        %error,
                        "failed to list children during cascade"
                    ),
                }
            }
            level = next;
        }

        tracing::info!(
            cancelled = report.cancelled.len(),
            skipped = report.skipped.len(),
            "kill cascade finished"
        );
        Ok((report, groups))
    }

    async fn cancel_level(
        &self,
        level: &[ProcessRecord],
        report: &mut CascadeReport,
        groups: &mut Vec<GroupKey>,
    ) {
        for status in CANCELLABLE {
            let batch: Vec<&ProcessRecord> =
                level.iter().filter(|record| record.status == status).collect();
            if batch.is_empty() {
                continue;
            }
            let keys: Vec<ProcessKey> = batch.iter().map(|record| record.key).collect();

            match self
                .queue
                .update_expected_status_bulk(&keys, &[status], ProcessStatus::Cancelled)
                .await
            {
                Ok(true) => {
                    for record in batch {
                        note_cancelled(record, report, groups);
                    }
                }
                Ok(false) => {
                    tracing::debug!(
                        %status,
                        batch = keys.len(),
                        "batch changed concurrently, cancelling one by one"
                    );
                    for record in batch {
                        self.cancel_one(record, report, groups).await;
                    }
                }
                Err(error) => {
                    tracing::warn!(%status, %error, "batch cancel failed, cancelling one by one");
                    for record in batch {
                        self.cancel_one(record, report, groups).await;
                    }
                }
            }
        }

        report.skipped.extend(
            level
                .iter()
                .filter(|record| {
                    !record.status.is_terminal() && !CANCELLABLE.contains(&record.status)
                })
                .map(|record| record.key),
        );
    }

    async fn cancel_one(
        &self,
        record: &ProcessRecord,
        report: &mut CascadeReport,
        groups: &mut Vec<GroupKey>,
    ) {
        match self
            .queue
            .update_expected_status(
                &record.key,
                record.status,
                ProcessStatus::Cancelled,
                ValueMap::new(),
            )
            .await
        {
            Ok(true) => note_cancelled(record, report, groups),
            Ok(false) => {
                tracing::debug!(
                    instance_id = %record.key.instance_id,
                    expected = %record.status,
                    "process changed status during cascade"
                );
                report.skipped.push(record.key);
            }
            Err(error) => {
                tracing::warn!(
                    instance_id = %record.key.instance_id,
                    %error,
                    "failed to cancel process during cascade"
                );
                report.skipped.push(record.key);
            }
        }
    }
}

fn note_cancelled(record: &ProcessRecord, report: &mut CascadeReport, groups: &mut Vec<GroupKey>) {
    report.cancelled.push(record.key);
    if let Some(group) = group_key(record) {
        groups.push(group);
    }
}
