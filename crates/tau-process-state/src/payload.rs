use crate::{ProcessStateError, SnapshotStore, StateResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tau_process_types::{Payload, ProcessKey, ProcessKind, ValueMap};
use tempfile::TempDir;
use tracing::instrument;
use uuid::Uuid;

const WORKSPACE_PREFIX: &str = "tau-process-";

/// A payload whose workspace lives in a temporary directory that is removed
/// when this value is dropped.
#[derive(Debug)]
pub struct StagedPayload {
    pub payload: Payload,
    workspace: TempDir,
}

impl StagedPayload {
    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    /// Keeps the workspace on disk and hands ownership of it to the caller.
    pub fn into_persistent(self) -> (Payload, PathBuf) {
        let path = self.workspace.keep();
        (self.payload, path)
    }
}

/// Builds fork and resume payloads by staging snapshots into fresh
/// workspaces.
#[derive(Clone)]
pub struct PayloadManager {
    store: Arc<dyn SnapshotStore>,
    work_root: Option<PathBuf>,
}

impl std::fmt::Debug for PayloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadManager")
            .field("work_root", &self.work_root)
            .finish_non_exhaustive()
    }
}

impl PayloadManager {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            work_root: None,
        }
    }

    /// Stages workspaces below `work_root` instead of the system temp dir.
    pub fn with_work_root(mut self, work_root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(work_root.into());
        self
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    fn create_workspace(&self) -> StateResult<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKSPACE_PREFIX);
        let dir = match &self.work_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    /// Exports `instance_id` into a fresh workspace; a missing snapshot is an
    /// error here because the caller cannot continue without state.
    async fn stage(&self, instance_id: Uuid) -> StateResult<TempDir> {
        let workspace = self.create_workspace()?;
        if !self.store.export_to_dir(instance_id, workspace.path()).await? {
            return Err(ProcessStateError::SnapshotNotFound(instance_id));
        }
        Ok(workspace)
    }

    /// Restores a suspended process's own snapshot, with the resume event and
    /// request data attached for re-dispatch.
    #[instrument(skip(self, request), fields(instance_id = %key.instance_id, event_name))]
    pub async fn create_resume_payload(
        &self,
        key: ProcessKey,
        event_name: &str,
        request: ValueMap,
    ) -> StateResult<StagedPayload> {
        let workspace = self.stage(key.instance_id).await?;
        let mut payload = Payload::new(key)
            .with_workspace(workspace.path())
            .with_resume_event(event_name)
            .with_request_data(request);
        payload.resolve_entry_point(None);
        Ok(StagedPayload { payload, workspace })
    }

    /// Seeds a child process with the parent's current snapshot.
    #[instrument(
        skip(self, request),
        fields(parent = %parent_instance_id, child = %child_key.instance_id)
    )]
    pub async fn create_fork_payload(
        &self,
        parent_instance_id: Uuid,
        child_key: ProcessKey,
        kind: ProcessKind,
        entry_point: Option<&str>,
        request: ValueMap,
    ) -> StateResult<StagedPayload> {
        let workspace = self.stage(parent_instance_id).await?;
        let mut payload = Payload::new(child_key)
            .with_parent(parent_instance_id)
            .with_kind(kind)
            .with_workspace(workspace.path())
            .with_request_data(request);
        payload.resolve_entry_point(entry_point);
        Ok(StagedPayload { payload, workspace })
    }
}
