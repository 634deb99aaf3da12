use std::{path::Path, sync::Arc};

use chrono::{TimeDelta, Utc};
use serde_json::json;
use tau_process_queue::{
    EnqueueOutcome, ForkRequest, Payload, ProcessKey, ProcessKind, ProcessQueueManager,
    ProcessStatus, SqliteProcessQueue, ValueMap, WaitCondition,
};
use tau_process_state::{ProcessStateConfig, SnapshotEntry, SnapshotStore, SqliteSnapshotStore};
use tempfile::tempdir;
use uuid::Uuid;

fn map(value: serde_json::Value) -> ValueMap {
    serde_json::from_value(value).expect("object literal")
}

fn open_manager(
    root: &Path,
    state: &ProcessStateConfig,
) -> (ProcessQueueManager, Arc<SqliteSnapshotStore>) {
    let db_path = root.join("processes.sqlite");
    let queue = SqliteProcessQueue::new(&db_path).expect("open queue");
    let snapshots =
        Arc::new(SqliteSnapshotStore::from_config(&db_path, state).expect("open snapshot store"));
    let manager = ProcessQueueManager::new(Arc::new(queue), snapshots.clone());
    (manager, snapshots)
}

fn key_at(rank: i64) -> ProcessKey {
    ProcessKey::new(Uuid::new_v4(), Utc::now() + TimeDelta::milliseconds(rank))
}

#[tokio::test]
async fn exclusive_wait_suspend_resume_and_handoff_on_sqlite() {
    let temp = tempdir().expect("create tempdir");
    let (manager, snapshots) = open_manager(temp.path(), &ProcessStateConfig::default());
    let project = Uuid::new_v4();
    let cfg = map(json!({
        "exclusive": { "group": "deploy", "mode": "wait" },
        "processTimeout": "PT15M",
    }));

    let first = Payload::new(key_at(0))
        .with_project(project)
        .with_configuration(cfg.clone());
    let second = Payload::new(key_at(1))
        .with_project(project)
        .with_configuration(cfg);
    manager.insert(&first).await.expect("insert first");
    manager.insert(&second).await.expect("insert second");

    assert!(manager.enqueue(&first).await.expect("enqueue first").is_runnable());
    let capabilities = ValueMap::new();
    let claimed = manager
        .claim_next("agent-a", &capabilities)
        .await
        .expect("claim")
        .expect("first is runnable");
    assert_eq!(claimed.key, first.key);

    let outcome = manager.enqueue(&second).await.expect("enqueue second");
    assert!(matches!(
        outcome,
        EnqueueOutcome::Waiting { ref holders, .. } if holders == &vec![first.key]
    ));

    snapshots
        .import_entries(
            first.key.instance_id,
            vec![SnapshotEntry::new("vars/state.json", r#"{"step":3}"#)],
        )
        .await
        .expect("checkpoint");
    let condition = WaitCondition::ExternalEvent {
        event_name: "approval".to_string(),
    };
    assert!(manager.suspend(&first.key, condition).await.expect("suspend"));
    assert!(manager
        .claim_next("agent-b", &capabilities)
        .await
        .expect("claim while holder suspended")
        .is_none());

    let resumed = manager
        .resume(&first.key, "approval", map(json!({ "approved": true })))
        .await
        .expect("resume");
    assert!(resumed.outcome.is_runnable());
    assert_eq!(
        std::fs::read_to_string(resumed.staged.workspace().join("vars/state.json")).expect("read"),
        r#"{"step":3}"#
    );
    let record = resumed.outcome.record().expect("record");
    assert_eq!(record.process_timeout, Some(900));
    assert_eq!(record.exclusive_group(), Some("deploy"));

    let reclaimed = manager
        .claim_next("agent-a", &capabilities)
        .await
        .expect("reclaim")
        .expect("resumed process is runnable");
    assert_eq!(reclaimed.key, first.key);
    assert!(manager
        .update_expected_status(&first.key, ProcessStatus::Running, ProcessStatus::Finished)
        .await
        .expect("finish"));

    let handed_off = manager
        .claim_next("agent-b", &capabilities)
        .await
        .expect("claim after handoff")
        .expect("waiter released");
    assert_eq!(handed_off.key, second.key);

    let statuses: Vec<ProcessStatus> = manager
        .status_history(&first.key)
        .await
        .expect("history")
        .into_iter()
        .map(|entry| entry.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            ProcessStatus::Preparing,
            ProcessStatus::Enqueued,
            ProcessStatus::Running,
            ProcessStatus::Suspended,
            ProcessStatus::Resuming,
            ProcessStatus::Enqueued,
            ProcessStatus::Running,
            ProcessStatus::Finished,
        ]
    );
}

#[tokio::test]
async fn fork_with_signed_secrets_then_kill_cascade() {
    let temp = tempdir().expect("create tempdir");
    let key_path = temp.path().join("state.key");
    std::fs::write(&key_path, "0123456789abcdef0123456789abcdef").expect("write key");
    let state = ProcessStateConfig {
        secure_files: vec![r"\.secret$".to_string()],
        signing_algorithm: Some("hmac-sha256".to_string()),
        signing_key_path: Some(key_path),
        max_state_age_secs: None,
    };
    let (manager, snapshots) = open_manager(temp.path(), &state);

    let parent = Payload::new(ProcessKey::generate());
    manager.insert(&parent).await.expect("insert parent");
    manager.enqueue(&parent).await.expect("enqueue parent");
    assert!(manager.claim(&parent.key, "agent-a").await.expect("claim parent"));
    snapshots
        .import_entries(
            parent.key.instance_id,
            vec![
                SnapshotEntry::new("flow.yml", "main: []"),
                SnapshotEntry::new("db.secret", "hunter2"),
            ],
        )
        .await
        .expect("parent snapshot");

    let staged = manager
        .fork(
            &parent.key,
            ForkRequest::new(ProcessKind::CancelHandler).with_entry_point("onCancel"),
        )
        .await
        .expect("fork");
    assert_eq!(
        std::fs::read_to_string(staged.workspace().join("db.secret")).expect("read secret"),
        "hunter2"
    );
    let child_key = staged.payload.key;
    manager.enqueue(&staged.payload).await.expect("enqueue child");
    let mut child_paths = snapshots
        .list_paths(child_key.instance_id)
        .await
        .expect("child paths");
    child_paths.sort();
    assert_eq!(child_paths, vec!["db.secret".to_string(), "flow.yml".to_string()]);

    let report = manager.kill_cascade(&parent.key).await.expect("cascade");
    assert_eq!(report.cancelled, vec![parent.key, child_key]);
    for key in [parent.key, child_key] {
        let record = manager.get(&key).await.expect("get").expect("record");
        assert_eq!(record.status, ProcessStatus::Cancelled);
    }

    let error = manager
        .resume(&child_key, "late", ValueMap::new())
        .await
        .expect_err("cancelled process cannot resume");
    assert!(error.to_string().contains("CANCELLED"));

    let missing = manager
        .fork(&ProcessKey::generate(), ForkRequest::new(ProcessKind::Default))
        .await;
    assert!(missing.is_err());
    let orphan_state = snapshots
        .export_to_dir(Uuid::new_v4(), &temp.path().join("nothing"))
        .await
        .expect("export unknown");
    assert!(!orphan_state);
    assert!(!temp.path().join("nothing").exists());
}
