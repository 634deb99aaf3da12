use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{TimeDelta, Utc};
use serde_json::{json, Value};
use tau_process_queue::{ProcessQueueManager, ProcessRecord, SqliteProcessQueue};
use tau_process_state::{SnapshotStore, SqliteSnapshotStore};
use tau_process_types::ProcessQuery;
use uuid::Uuid;

use crate::cli_args::ProcCtlCommand;
use crate::config::ProcCtlConfig;

/// Opened stores plus the config they were opened with.
pub(crate) struct ProcCtl {
    manager: ProcessQueueManager,
    config: ProcCtlConfig,
}

impl ProcCtl {
    pub(crate) fn open(config: ProcCtlConfig) -> Result<Self> {
        let queue = SqliteProcessQueue::new(&config.database_path).with_context(|| {
            format!(
                "failed to open process queue '{}'",
                config.database_path.display()
            )
        })?;
        let snapshots = SqliteSnapshotStore::from_config(&config.database_path, &config.state)
            .with_context(|| {
                format!(
                    "failed to open snapshot store '{}'",
                    config.database_path.display()
                )
            })?;
        tracing::debug!(database = %config.database_path.display(), "opened process stores");
        Ok(Self {
            manager: ProcessQueueManager::new(Arc::new(queue), Arc::new(snapshots)),
            config,
        })
    }

    async fn require(&self, instance_id: Uuid) -> Result<ProcessRecord> {
        match self.manager.get_by_id(instance_id).await? {
            Some(record) => Ok(record),
            None => bail!("process '{instance_id}' not found"),
        }
    }

    /// Runs one command and returns its JSON report.
    pub(crate) async fn execute(&self, command: ProcCtlCommand) -> Result<Value> {
        match command {
            ProcCtlCommand::List {
                project,
                statuses,
                tags,
                parent,
                exclusive_group,
                limit,
                offset,
            } => {
                let query = ProcessQuery {
                    project_id: project,
                    tags: (!tags.is_empty()).then_some(tags),
                    statuses: (!statuses.is_empty()).then_some(statuses),
                    parent_instance_id: parent,
                    exclusive_group,
                    limit,
                    offset,
                };
                Ok(serde_json::to_value(self.manager.list(&query).await?)?)
            }
            ProcCtlCommand::Show { instance_id } => {
                let record = self.require(instance_id).await?;
                let snapshot = self.manager.snapshots().info(instance_id).await?;
                Ok(json!({ "process": record, "snapshot": snapshot }))
            }
            ProcCtlCommand::History { instance_id, audit } => {
                let record = self.require(instance_id).await?;
                if audit {
                    Ok(serde_json::to_value(self.manager.audit_log(&record.key).await?)?)
                } else {
                    Ok(serde_json::to_value(
                        self.manager.status_history(&record.key).await?,
                    )?)
                }
            }
            ProcCtlCommand::Kill { instance_id } => {
                let record = self.require(instance_id).await?;
                let report = self.manager.kill_cascade(&record.key).await?;
                Ok(json!({
                    "root": report.root.instance_id,
                    "cancelled": ids(report.cancelled.iter().map(|key| key.instance_id)),
                    "skipped": ids(report.skipped.iter().map(|key| key.instance_id)),
                }))
            }
            ProcCtlCommand::Export {
                instance_id,
                target_dir,
            } => {
                if !self
                    .manager
                    .snapshots()
                    .export_to_dir(instance_id, &target_dir)
                    .await?
                {
                    bail!("process '{instance_id}' has no snapshot");
                }
                Ok(json!({
                    "instance_id": instance_id,
                    "target_dir": target_dir.display().to_string(),
                }))
            }
            ProcCtlCommand::Import {
                instance_id,
                source_dir,
                prefix,
            } => {
                self.require(instance_id).await?;
                let imported = import_dir(
                    self.manager.snapshots().as_ref(),
                    instance_id,
                    prefix.as_deref(),
                    &source_dir,
                )
                .await?;
                Ok(json!({ "instance_id": instance_id, "imported": imported }))
            }
            ProcCtlCommand::Prune {
                older_than_secs,
                keep_snapshots,
            } => self.prune(older_than_secs, keep_snapshots).await,
        }
    }

    async fn prune(&self, older_than_secs: Option<u64>, keep_snapshots: bool) -> Result<Value> {
        let now = Utc::now();
        let max_age = older_than_secs.unwrap_or(self.config.retention.max_age_secs);
        let Some(cutoff) = i64::try_from(max_age)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|age| now.checked_sub_signed(age))
        else {
            bail!("retention age {max_age}s is out of range");
        };

        let remove_snapshots = self.config.retention.prune_snapshots && !keep_snapshots;
        let report = self.manager.prune(cutoff, remove_snapshots).await?;
        let stale = match self.config.state.stale_before(now) {
            Some(before) if !keep_snapshots => self.manager.snapshots().remove_stale(before).await?,
            _ => Vec::new(),
        };
        tracing::info!(
            records = report.records.len(),
            snapshots = report.snapshots,
            stale_snapshots = stale.len(),
            "prune finished"
        );
        Ok(json!({
            "cutoff": cutoff,
            "processes": ids(report.records.iter().map(|key| key.instance_id)),
            "snapshots": report.snapshots,
            "stale_snapshots": ids(stale),
        }))
    }
}

async fn import_dir(
    store: &dyn SnapshotStore,
    instance_id: Uuid,
    prefix: Option<&str>,
    source_dir: &Path,
) -> Result<usize> {
    if !source_dir.is_dir() {
        bail!("'{}' is not a directory", source_dir.display());
    }
    store
        .import_path(instance_id, prefix, source_dir)
        .await
        .with_context(|| format!("failed to import '{}'", source_dir.display()))
}

fn ids(ids: impl IntoIterator<Item = Uuid>) -> Vec<String> {
    ids.into_iter().map(|id| id.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::ProcCtl;
    use crate::cli_args::ProcCtlCommand;
    use crate::config::ProcCtlConfig;
    use tau_process_queue::{Payload, ProcessKey, ProcessStatus};
    use tau_process_types::ValueMap;
    use tempfile::tempdir;

    fn config(root: &std::path::Path) -> ProcCtlConfig {
        ProcCtlConfig {
            database_path: root.join("processes.sqlite"),
            ..ProcCtlConfig::default()
        }
    }

    async fn seed(ctl: &ProcCtl, parent: Option<&ProcessKey>, status: ProcessStatus) -> ProcessKey {
        let mut payload = Payload::new(ProcessKey::generate());
        if let Some(parent) = parent {
            payload = payload.with_parent(parent.instance_id);
        }
        ctl.manager.insert(&payload).await.expect("insert");
        ctl.manager
            .update_status(&payload.key, status, ValueMap::new())
            .await
            .expect("seed status");
        payload.key
    }

    #[tokio::test]
    async fn kill_then_list_and_history() {
        let temp = tempdir().expect("create tempdir");
        let ctl = ProcCtl::open(config(temp.path())).expect("open");
        let root = seed(&ctl, None, ProcessStatus::Running).await;
        let child = seed(&ctl, Some(&root), ProcessStatus::Enqueued).await;
        seed(&ctl, Some(&root), ProcessStatus::Finished).await;

        let report = ctl
            .execute(ProcCtlCommand::Kill {
                instance_id: root.instance_id,
            })
            .await
            .expect("kill");
        let cancelled = report["cancelled"].as_array().expect("cancelled list");
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.contains(&serde_json::json!(child.instance_id.to_string())));

        let listed = ctl
            .execute(ProcCtlCommand::List {
                project: None,
                statuses: vec![ProcessStatus::Cancelled],
                tags: Vec::new(),
                parent: None,
                exclusive_group: None,
                limit: None,
                offset: 0,
            })
            .await
            .expect("list");
        assert_eq!(listed.as_array().expect("records").len(), 2);

        let history = ctl
            .execute(ProcCtlCommand::History {
                instance_id: child.instance_id,
                audit: false,
            })
            .await
            .expect("history");
        let statuses: Vec<&str> = history
            .as_array()
            .expect("entries")
            .iter()
            .filter_map(|entry| entry["status"].as_str())
            .collect();
        assert_eq!(statuses, vec!["PREPARING", "ENQUEUED", "CANCELLED"]);
    }

    #[tokio::test]
    async fn import_export_and_prune_round_trip() {
        let temp = tempdir().expect("create tempdir");
        let ctl = ProcCtl::open(config(temp.path())).expect("open");
        let key = seed(&ctl, None, ProcessStatus::Failed).await;

        let source = temp.path().join("source");
        std::fs::create_dir_all(source.join("flows")).expect("mkdir");
        std::fs::write(source.join("flows/main.yml"), "steps: []").expect("write");
        let imported = ctl
            .execute(ProcCtlCommand::Import {
                instance_id: key.instance_id,
                source_dir: source,
                prefix: None,
            })
            .await
            .expect("import");
        assert_eq!(imported["imported"], 1);

        let target = temp.path().join("target");
        ctl.execute(ProcCtlCommand::Export {
            instance_id: key.instance_id,
            target_dir: target.clone(),
        })
        .await
        .expect("export");
        assert_eq!(
            std::fs::read_to_string(target.join("flows/main.yml")).expect("read"),
            "steps: []"
        );

        let shown = ctl
            .execute(ProcCtlCommand::Show {
                instance_id: key.instance_id,
            })
            .await
            .expect("show");
        assert_eq!(shown["snapshot"]["items"], 1);

        let pruned = ctl
            .execute(ProcCtlCommand::Prune {
                older_than_secs: Some(0),
                keep_snapshots: false,
            })
            .await
            .expect("prune");
        assert_eq!(pruned["processes"].as_array().expect("ids").len(), 1);
        assert_eq!(pruned["snapshots"], 1);
        assert!(ctl
            .execute(ProcCtlCommand::Show {
                instance_id: key.instance_id,
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unknown_process_and_missing_snapshot_are_errors() {
        let temp = tempdir().expect("create tempdir");
        let ctl = ProcCtl::open(config(temp.path())).expect("open");
        let missing = uuid::Uuid::new_v4();
        let error = ctl
            .execute(ProcCtlCommand::Kill {
                instance_id: missing,
            })
            .await
            .expect_err("unknown process");
        assert!(error.to_string().contains("not found"));

        let key = seed(&ctl, None, ProcessStatus::Running).await;
        let error = ctl
            .execute(ProcCtlCommand::Export {
                instance_id: key.instance_id,
                target_dir: temp.path().join("out"),
            })
            .await
            .expect_err("no snapshot");
        assert!(error.to_string().contains("no snapshot"));
    }
}
