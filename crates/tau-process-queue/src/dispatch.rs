use crate::exclusive::{group_key, GroupKey};
use crate::{ProcessQueueManager, QueueResult};
use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use tau_process_types::{ProcessKey, ProcessQuery, ProcessRecord, ProcessStatus, ValueMap};
use tracing::instrument;

/// Returns true when an agent offering `capabilities` satisfies a process's
/// `requirements`.
///
/// Matching is structural: every required key must be offered, objects match
/// recursively, a required array needs each element offered, a scalar
/// requirement against an offered array needs one matching element, and a
/// required string also matches as a whole-value regex.
pub fn requirements_satisfied(requirements: Option<&ValueMap>, capabilities: &ValueMap) -> bool {
    requirements.is_none_or(|requirements| {
        requirements.iter().all(|(key, required)| {
            capabilities
                .get(key)
                .is_some_and(|offered| value_matches(required, offered))
        })
    })
}

fn value_matches(required: &Value, offered: &Value) -> bool {
    match (required, offered) {
        (Value::Object(required), Value::Object(offered)) => required.iter().all(|(key, value)| {
            offered
                .get(key)
                .is_some_and(|offered| value_matches(value, offered))
        }),
        (Value::Array(required), Value::Array(offered)) => required
            .iter()
            .all(|value| offered.iter().any(|item| value_matches(value, item))),
        (_, Value::Array(offered)) if !required.is_object() => {
            offered.iter().any(|item| value_matches(required, item))
        }
        (Value::String(pattern), Value::String(text)) => {
            pattern == text || pattern_matches(pattern, text)
        }
        _ => required == offered,
    }
}

fn pattern_matches(pattern: &str, text: &str) -> bool {
    Regex::new(&format!("^(?:{pattern})$")).is_ok_and(|regex| regex.is_match(text))
}

impl ProcessQueueManager {
    /// ENQUEUED -> RUNNING for one process. `false` means another agent won.
    pub async fn claim(&self, key: &ProcessKey, agent_id: &str) -> QueueResult<bool> {
        let claimed = self.queue.claim(key, agent_id).await?;
        if !claimed {
            tracing::debug!(instance_id = %key.instance_id, agent_id, "claim lost");
        }
        Ok(claimed)
    }

    /// Claims the oldest dispatchable process for `agent_id`.
    ///
    /// A candidate is skipped while it has a wait condition, its start time is
    /// in the future, its requirements are not met, or another member of its
    /// exclusive group is RUNNING.
    #[instrument(skip(self, capabilities))]
    pub async fn claim_next(
        &self,
        agent_id: &str,
        capabilities: &ValueMap,
    ) -> QueueResult<Option<ProcessRecord>> {
        let now = Utc::now();
        let candidates = self
            .queue
            .list(&ProcessQuery {
                statuses: Some(vec![ProcessStatus::Enqueued]),
                ..ProcessQuery::default()
            })
            .await?;
        let mut busy_groups: HashMap<GroupKey, bool> = HashMap::new();

        for candidate in candidates {
            if !candidate.wait_condition.is_none()
                || candidate.start_at.is_some_and(|start_at| start_at > now)
                || !requirements_satisfied(candidate.requirements.as_ref(), capabilities)
            {
                continue;
            }
            if let Some(group) = group_key(&candidate) {
                let busy = match busy_groups.get(&group) {
                    Some(busy) => *busy,
                    None => {
                        let busy = self
                            .queue
                            .group_members(group.0, &group.1)
                            .await?
                            .iter()
                            .any(|member| member.status == ProcessStatus::Running);
                        busy_groups.insert(group, busy);
                        busy
                    }
                };
                if busy {
                    continue;
                }
            }

            if self.queue.claim(&candidate.key, agent_id).await? {
                tracing::debug!(instance_id = %candidate.key.instance_id, "claimed process");
                return self.queue.get(&candidate.key).await;
            }
            tracing::debug!(
                instance_id = %candidate.key.instance_id,
                "lost dispatch race, trying next candidate"
            );
        }
        Ok(None)
    }
}
