//! Workspace walking and snapshot sinks.

use crate::{ProcessStateError, StateResult};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// One named blob of a snapshot, as read from or written to a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    /// Relative `/`-separated path inside the snapshot.
    pub path: String,
    pub data: Vec<u8>,
    /// Unix permission bits, when the source filesystem has them.
    pub mode: Option<u32>,
}

impl SnapshotEntry {
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
            mode: None,
        }
    }
}

/// Destination an exported snapshot is materialized into.
pub trait SnapshotSink {
    fn write_entry(&mut self, entry: SnapshotEntry) -> StateResult<()>;
}

impl SnapshotSink for Vec<SnapshotEntry> {
    fn write_entry(&mut self, entry: SnapshotEntry) -> StateResult<()> {
        self.push(entry);
        Ok(())
    }
}

/// Writes exported entries below a directory.
///
/// Nothing is created on disk until the first entry arrives, so an export
/// that finds no snapshot leaves the destination untouched.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
    written: usize,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            written: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl SnapshotSink for DirectorySink {
    fn write_entry(&mut self, entry: SnapshotEntry) -> StateResult<()> {
        let relative = normalize_relative(&entry.path)?;
        let target = self.root.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &entry.data)?;
        if let Some(mode) = entry.mode {
            set_mode(&target, mode)?;
        }
        self.written += 1;
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> StateResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> StateResult<()> {
    Ok(())
}

#[cfg(unix)]
fn mode_of(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn mode_of(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

/// Normalizes a snapshot path to `a/b/c` form. Absolute paths and `..`
/// components are rejected.
pub fn normalize_relative(path: &str) -> StateResult<String> {
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(ProcessStateError::InvalidPath(path.to_string()));
    }
    let mut parts = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => return Err(ProcessStateError::InvalidPath(path.to_string())),
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        return Err(ProcessStateError::InvalidPath(path.to_string()));
    }
    Ok(parts.join("/"))
}

/// Normalizes an optional destination prefix; blank prefixes mean none.
pub fn normalize_prefix(prefix: Option<&str>) -> StateResult<Option<String>> {
    match prefix.map(str::trim) {
        None | Some("") | Some("/") => Ok(None),
        Some(prefix) => normalize_relative(prefix.trim_start_matches('/')).map(Some),
    }
}

/// Reads every regular file below `source_dir`, sorted by path, with
/// `prefix` prepended to each relative path. Symlinks are skipped.
pub fn collect_workspace(
    source_dir: &Path,
    prefix: Option<&str>,
) -> StateResult<Vec<SnapshotEntry>> {
    let prefix = normalize_prefix(prefix)?;
    let mut entries = Vec::new();
    let mut pending = vec![source_dir.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for item in fs::read_dir(&dir)? {
            let item = item?;
            let path = item.path();
            let metadata = fs::symlink_metadata(&path)?;
            if metadata.is_dir() {
                pending.push(path);
                continue;
            }
            if !metadata.is_file() {
                continue;
            }

            let relative = relative_name(source_dir, &path)?;
            let name = match &prefix {
                Some(prefix) => format!("{prefix}/{relative}"),
                None => relative,
            };
            entries.push(SnapshotEntry {
                path: name,
                data: fs::read(&path)?,
                mode: mode_of(&metadata),
            });
        }
    }

    entries.sort_by(|left, right| left.path.cmp(&right.path));
    Ok(entries)
}

fn relative_name(root: &Path, path: &Path) -> StateResult<String> {
    let invalid = || ProcessStateError::InvalidPath(path.display().to_string());
    let relative = path.strip_prefix(root).map_err(|_| invalid())?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or_else(invalid)?),
            _ => return Err(invalid()),
        }
    }
    Ok(parts.join("/"))
}
