use crate::request_keys::{ENTRY_POINT, REQUEST_ID};
use crate::{merge_values, ImportEntry, ProcessKey, ProcessKind, ValueMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Everything a caller hands to the queue when it creates or re-enqueues a
/// process: identity headers, the working directory and the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub key: ProcessKey,
    pub parent_instance_id: Option<Uuid>,
    #[serde(default)]
    pub kind: ProcessKind,
    pub project_id: Option<Uuid>,
    pub repo_id: Option<Uuid>,
    pub initiator_id: Option<Uuid>,
    pub initiator: Option<String>,
    pub entry_point: Option<String>,
    pub workspace_dir: Option<PathBuf>,
    /// Process configuration (arguments, reserved scheduling keys, ...).
    #[serde(default)]
    pub configuration: ValueMap,
    /// Request-time overrides layered on top of `configuration`.
    #[serde(default)]
    pub request_data: ValueMap,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub handlers: BTreeSet<String>,
    #[serde(default)]
    pub imports: Vec<ImportEntry>,
    pub resume_event_name: Option<String>,
}

impl Payload {
    pub fn new(key: ProcessKey) -> Self {
        Self {
            key,
            parent_instance_id: None,
            kind: ProcessKind::Default,
            project_id: None,
            repo_id: None,
            initiator_id: None,
            initiator: None,
            entry_point: None,
            workspace_dir: None,
            configuration: ValueMap::new(),
            request_data: ValueMap::new(),
            tags: BTreeSet::new(),
            handlers: BTreeSet::new(),
            imports: Vec::new(),
            resume_event_name: None,
        }
    }

    pub fn with_parent(mut self, parent_instance_id: Uuid) -> Self {
        self.parent_instance_id = Some(parent_instance_id);
        self
    }

    pub fn with_kind(mut self, kind: ProcessKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_project(mut self, project_id: Uuid) -> Self {
        self.project_id = Some(project_id);
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

    pub fn with_workspace(mut self, workspace_dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = Some(workspace_dir.into());
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

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_handlers<I, S>(mut self, handlers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.handlers = handlers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_imports(mut self, imports: Vec<ImportEntry>) -> Self {
        self.imports = imports;
        self
    }

    pub fn with_resume_event(mut self, event_name: impl Into<String>) -> Self {
        self.resume_event_name = Some(event_name.into());
        self
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace_dir.as_deref()
    }

    /// Configuration with request data merged on top.
    pub fn effective_configuration(&self) -> ValueMap {
        let mut merged = self.configuration.clone();
        merge_values(&mut merged, &self.request_data);
        merged
    }

    /// Caller-supplied correlation id, if the request carries one.
    pub fn request_id(&self) -> Option<&str> {
        self.request_data.get(REQUEST_ID).and_then(Value::as_str)
    }

    /// Resolves the entry point from, in order, `explicit`, the current
    /// header and `request_data["entryPoint"]`, then writes the result back
    /// into both the header and the request data.
    pub fn resolve_entry_point(&mut self, explicit: Option<&str>) -> Option<String> {
        let resolved = explicit
            .map(str::to_string)
            .or_else(|| self.entry_point.clone())
            .or_else(|| {
                self.request_data
                    .get(ENTRY_POINT)
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
        if let Some(entry_point) = &resolved {
            self.entry_point = Some(entry_point.clone());
            self.request_data
                .insert(ENTRY_POINT.to_string(), Value::String(entry_point.clone()));
        }
        resolved
    }
}
