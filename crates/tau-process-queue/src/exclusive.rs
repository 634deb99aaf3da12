//! Exclusive group coordination.
//!
//! At most one process per `(project, group)` may be runnable. Conflicts are
//! resolved at enqueue time according to the incoming process's mode; WAIT
//! mode parks the newcomer behind an `Exclusive` wait condition which is
//! cleared, oldest waiter first, once the group has no live holder.

use crate::{ProcessQueueManager, QueueResult};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tau_process_types::{
    ExclusiveGroup, ExclusiveMode, ProcessKey, ProcessRecord, ProcessSchedule, ProcessStatus,
    ValueMap, WaitCondition,
};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// `(project_id, group name)`.
pub(crate) type GroupKey = (Option<Uuid>, String);

/// Result of an enqueue request.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    /// The process is ENQUEUED and runnable. Under CANCEL_OLD, `cancelled`
    /// lists the group members cancelled to make room.
    Enqueued {
        record: ProcessRecord,
        cancelled: Vec<ProcessKey>,
    },
    /// The process is ENQUEUED but held until the group is free. Under
    /// CANCEL_OLD, `holders` are the members that could not be cancelled.
    Waiting {
        record: ProcessRecord,
        holders: Vec<ProcessKey>,
    },
    /// The group was occupied under CANCEL_NEW; the process was cancelled.
    Rejected { holders: Vec<ProcessKey> },
}

impl EnqueueOutcome {
    pub fn record(&self) -> Option<&ProcessRecord> {
        match self {
            Self::Enqueued { record, .. } | Self::Waiting { record, .. } => Some(record),
            Self::Rejected { .. } => None,
        }
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }
}

/// Per-group async locks serializing coordination decisions.
#[derive(Debug, Default)]
pub(crate) struct GroupLocks {
    locks: Mutex<HashMap<GroupKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl GroupLocks {
    pub(crate) async fn lock(&self, group: &GroupKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(group.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

pub(crate) fn group_key(record: &ProcessRecord) -> Option<GroupKey> {
    record
        .exclusive_group()
        .map(|group| (record.project_id, group.to_string()))
}

fn is_waiting_on(record: &ProcessRecord, group: &str) -> bool {
    record.status == ProcessStatus::Enqueued
        && record.wait_condition.exclusive_group() == Some(group)
}

impl ProcessQueueManager {
    /// Enqueues a PREPARING process that declares an exclusive group. Returns
    /// the outcome and the groups touched by any cancellation, to be woken
    /// once the group lock is released.
    pub(crate) async fn enqueue_exclusive(
        &self,
        record: &ProcessRecord,
        schedule: &ProcessSchedule,
        exclusive: &ExclusiveGroup,
    ) -> QueueResult<(EnqueueOutcome, Vec<GroupKey>)> {
        let group: GroupKey = (record.project_id, exclusive.group.clone());
        let _guard = self.group_locks.lock(&group).await;

        let holders: Vec<ProcessRecord> = self
            .queue
            .group_members(record.project_id, &exclusive.group)
            .await?
            .into_iter()
            .filter(|member| member.key != record.key && member.status != ProcessStatus::Preparing)
            .collect();

        if holders.is_empty() {
            let record = self
                .queue
                .enqueue(&record.key, schedule, WaitCondition::None)
                .await?;
            return Ok((
                EnqueueOutcome::Enqueued {
                    record,
                    cancelled: Vec::new(),
                },
                Vec::new(),
            ));
        }

        let holder_keys: Vec<ProcessKey> = holders.iter().map(|holder| holder.key).collect();
        match exclusive.mode {
            ExclusiveMode::CancelOld => {
                let mut cancelled = Vec::new();
                let mut touched = Vec::new();
                for holder in &holders {
                    match self.cancel_tree(&holder.key).await {
                        Ok((report, groups)) => {
                            if !report.cancelled.contains(&holder.key) {
                                tracing::warn!(
                                    instance_id = %holder.key.instance_id,
                                    status = %holder.status,
                                    group = %exclusive.group,
                                    "exclusive group holder could not be cancelled"
                                );
                            }
                            cancelled.extend(report.cancelled);
                            touched.extend(groups);
                        }
                        Err(error) => tracing::warn!(
                            instance_id = %holder.key.instance_id,
                            group = %exclusive.group,
                            %error,
                            "failed to cancel exclusive group holder"
                        ),
                    }
                }
                let survivors: Vec<ProcessKey> = holder_keys
                    .iter()
                    .filter(|key| !cancelled.contains(key))
                    .copied()
                    .collect();
                if !survivors.is_empty() {
                    let hold = WaitCondition::Exclusive {
                        group: exclusive.group.clone(),
                    };
                    let enqueued = self.queue.enqueue(&record.key, schedule, hold).await?;
                    tracing::info!(
                        instance_id = %record.key.instance_id,
                        group = %exclusive.group,
                        cancelled = cancelled.len(),
                        survivors = survivors.len(),
                        "holding exclusive process behind holders that were not cancelled"
                    );
                    // Re-checked after the lock drops in case a survivor finished meanwhile.
                    touched.push(group);
                    return Ok((
                        EnqueueOutcome::Waiting {
                            record: enqueued,
                            holders: survivors,
                        },
                        touched,
                    ));
                }

                let enqueued = self
                    .queue
                    .enqueue(&record.key, schedule, WaitCondition::None)
                    .await?;
                tracing::info!(
                    instance_id = %record.key.instance_id,
                    group = %exclusive.group,
                    cancelled = cancelled.len(),
                    "enqueued exclusive process and cancelled previous holders"
                );
                touched.retain(|touched_group| touched_group != &group);
                Ok((
                    EnqueueOutcome::Enqueued {
                        record: enqueued,
                        cancelled,
                    },
                    touched,
                ))
            }
            ExclusiveMode::CancelNew => {
                let payload = rejection_payload(&exclusive.group, &holder_keys);
                self.queue
                    .update_status(&record.key, ProcessStatus::Cancelled, payload)
                    .await?;
                tracing::info!(
                    instance_id = %record.key.instance_id,
                    group = %exclusive.group,
                    holders = holder_keys.len(),
                    "rejected exclusive process because the group is occupied"
                );
                Ok((
                    EnqueueOutcome::Rejected {
                        holders: holder_keys,
                    },
                    Vec::new(),
                ))
            }
            ExclusiveMode::Wait => {
                let hold = WaitCondition::Exclusive {
                    group: exclusive.group.clone(),
                };
                let enqueued = self.queue.enqueue(&record.key, schedule, hold).await?;
                tracing::info!(
                    instance_id = %record.key.instance_id,
                    group = %exclusive.group,
                    holders = holder_keys.len(),
                    "holding exclusive process until the group is free"
                );
                Ok((
                    EnqueueOutcome::Waiting {
                        record: enqueued,
                        holders: holder_keys,
                    },
                    Vec::new(),
                ))
            }
        }
    }

    /// Releases the oldest waiter of `group` if the group has no live holder.
    pub(crate) async fn wake_group(&self, group: &GroupKey) -> QueueResult<Option<ProcessKey>> {
        let _guard = self.group_locks.lock(group).await;
        let (project_id, name) = group;
        let members = self.queue.group_members(*project_id, name).await?;

        let occupied = members.iter().any(|member| {
            member.status != ProcessStatus::Preparing && !is_waiting_on(member, name)
        });
        if occupied {
            return Ok(None);
        }
        let Some(next) = members.iter().find(|member| is_waiting_on(member, name)) else {
            return Ok(None);
        };

        self.queue.update_wait(&next.key, WaitCondition::None).await?;
        tracing::info!(
            instance_id = %next.key.instance_id,
            group = %name,
            "released exclusive group waiter"
        );
        Ok(Some(next.key))
    }

    pub(crate) async fn wake_groups(&self, groups: Vec<GroupKey>) {
        let mut seen = Vec::new();
        for group in groups {
            if seen.contains(&group) {
                continue;
            }
            if let Err(error) = self.wake_group(&group).await {
                tracing::warn!(group = %group.1, %error, "failed to wake exclusive group waiter");
            }
            seen.push(group);
        }
    }

    /// Wakes the groups of records that just reached a terminal status.
    pub(crate) async fn wake_after(&self, records: &[ProcessRecord]) {
        let groups = records
            .iter()
            .filter(|record| record.status.is_terminal())
            .filter_map(group_key)
            .collect();
        self.wake_groups(groups).await;
    }
}

fn rejection_payload(group: &str, holders: &[ProcessKey]) -> ValueMap {
    let holders: Vec<Value> = holders
        .iter()
        .map(|key| Value::String(key.instance_id.to_string()))
        .collect();
    ValueMap::from([
        (
            "reason".to_string(),
            json!(format!("exclusive group '{group}' is occupied")),
        ),
        ("exclusiveGroup".to_string(), json!(group)),
        ("holders".to_string(), Value::Array(holders)),
    ])
}
