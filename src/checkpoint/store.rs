//! Checkpoint directory hierarchy: `<root>/<component>/<checkpoint-id>/`
//! with a JSON metadata sidecar per checkpoint.
//!
//! Grounded on `checkpoint.c`'s directory-naming and listing
//! conventions, but the metadata sidecar here is real `serde_json`
//! rather than the original's hand-rolled line format.

use crate::error::CheckpointError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const METADATA_FILE: &str = "metadata.json";

/// Mirrors `checkpoint_metadata_t` in the original `checkpoint.h`:
/// component name, originating pid, wall-clock timestamp, image byte
/// size, provided capabilities at checkpoint time, engine version
/// triple, whether the process was left running, and the preserved-fd
/// policy (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub component: String,
    pub checkpoint_id: u64,
    pub created_unix: u64,
    pub pid: i32,
    pub persistent: bool,
    pub leave_running: bool,
    /// Total byte size of the checkpoint image. Filled in once the
    /// engine has written the image (zero at allocation time).
    pub image_size_bytes: u64,
    /// Comma-joined capability names this component provided at
    /// checkpoint time.
    pub capabilities: String,
    /// Checkpoint engine version triple, e.g. "3.17.1".
    pub engine_version: String,
    /// Comma-joined preserved fd numbers from the component's
    /// checkpoint policy.
    pub preserve_fds: String,
}

#[derive(Debug, Clone)]
pub struct CheckpointEntry {
    pub metadata: CheckpointMetadata,
    pub dir: PathBuf,
}

/// Manages checkpoint directories under an ephemeral (tmpfs, cleared
/// across a kernel transition) root and a persistent (survives a
/// kernel transition) root.
pub struct CheckpointStore {
    ephemeral_root: PathBuf,
    persistent_root: PathBuf,
}

impl CheckpointStore {
    pub fn new(ephemeral_root: impl Into<PathBuf>, persistent_root: impl Into<PathBuf>) -> Self {
        Self {
            ephemeral_root: ephemeral_root.into(),
            persistent_root: persistent_root.into(),
        }
    }

    fn root(&self, persistent: bool) -> &Path {
        if persistent {
            &self.persistent_root
        } else {
            &self.ephemeral_root
        }
    }

    fn component_dir(&self, component: &str, persistent: bool) -> PathBuf {
        self.root(persistent).join(component)
    }

    /// Allocates a fresh checkpoint id and directory for `component`.
    /// Ids are unix timestamps; if a checkpoint with that id already
    /// exists (two calls within the same second) the id is bumped
    /// until it's unique, guaranteeing strictly-increasing ids.
    pub fn allocate(&self, component: &str, pid: i32, persistent: bool, leave_running: bool) -> Result<(PathBuf, CheckpointMetadata), CheckpointError> {
        self.allocate_with_metadata(component, pid, persistent, leave_running, &[], "", &[])
    }

    /// Full form of [`allocate`](Self::allocate) carrying every field
    /// spec.md §3 assigns to a checkpoint's metadata sidecar.
    pub fn allocate_with_metadata(
        &self,
        component: &str,
        pid: i32,
        persistent: bool,
        leave_running: bool,
        capabilities: &[String],
        engine_version: &str,
        preserve_fds: &[i32],
    ) -> Result<(PathBuf, CheckpointMetadata), CheckpointError> {
        let comp_dir = self.component_dir(component, persistent);
        std::fs::create_dir_all(&comp_dir)?;

        let mut id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| CheckpointError::Storage(e.to_string()))?
            .as_secs();

        let dir = loop {
            let candidate = comp_dir.join(id.to_string());
            if !candidate.exists() {
                break candidate;
            }
            id += 1;
        };

        std::fs::create_dir_all(&dir)?;

        let metadata = CheckpointMetadata {
            component: component.to_string(),
            checkpoint_id: id,
            created_unix: id,
            pid,
            persistent,
            leave_running,
            image_size_bytes: 0,
            capabilities: capabilities.join(","),
            engine_version: engine_version.to_string(),
            preserve_fds: preserve_fds.iter().map(|fd| fd.to_string()).collect::<Vec<_>>().join(","),
        };
        self.write_metadata(&dir, &metadata)?;

        Ok((dir, metadata))
    }

    /// Updates `image_size_bytes` to the checkpoint directory's actual
    /// on-disk size, called once the engine has finished writing the
    /// image. A no-op if the directory or its metadata has vanished.
    pub fn record_image_size(&self, dir: &Path) -> Result<(), CheckpointError> {
        let Some(mut metadata) = Self::read_metadata(dir) else { return Ok(()) };
        metadata.image_size_bytes = dir_size(dir);
        self.write_metadata(dir, &metadata)
    }

    fn write_metadata(&self, dir: &Path, metadata: &CheckpointMetadata) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(metadata).map_err(|e| CheckpointError::Storage(e.to_string()))?;
        std::fs::write(dir.join(METADATA_FILE), json)?;
        Ok(())
    }

    fn read_metadata(dir: &Path) -> Option<CheckpointMetadata> {
        let bytes = std::fs::read(dir.join(METADATA_FILE)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Lists checkpoints for `component` across both roots, newest
    /// first. A directory missing its metadata sidecar is included
    /// with metadata reconstructed from its directory name and mtime,
    /// rather than silently skipped.
    pub fn list(&self, component: &str) -> Vec<CheckpointEntry> {
        let mut entries = Vec::new();
        for persistent in [false, true] {
            let comp_dir = self.component_dir(component, persistent);
            let Ok(read_dir) = std::fs::read_dir(&comp_dir) else { continue };
            for entry in read_dir.filter_map(|e| e.ok()) {
                let dir = entry.path();
                if !dir.is_dir() {
                    continue;
                }
                let metadata = Self::read_metadata(&dir).unwrap_or_else(|| {
                    let checkpoint_id = dir
                        .file_name()
                        .and_then(|n| n.to_str())
                        .and_then(|n| n.parse().ok())
                        .unwrap_or_else(|| {
                            entry
                                .metadata()
                                .and_then(|m| m.modified())
                                .ok()
                                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                                .map(|d| d.as_secs())
                                .unwrap_or(0)
                        });
                    CheckpointMetadata {
                        component: component.to_string(),
                        checkpoint_id,
                        created_unix: checkpoint_id,
                        pid: 0,
                        persistent,
                        leave_running: false,
                        image_size_bytes: dir_size(&dir),
                        capabilities: String::new(),
                        engine_version: String::new(),
                        preserve_fds: String::new(),
                    }
                });
                entries.push(CheckpointEntry { metadata, dir });
            }
        }
        entries.sort_by(|a, b| b.metadata.checkpoint_id.cmp(&a.metadata.checkpoint_id));
        entries
    }

    pub fn find_latest(&self, component: &str) -> Option<CheckpointEntry> {
        self.list(component).into_iter().next()
    }

    pub fn find(&self, component: &str, checkpoint_id: u64) -> Option<CheckpointEntry> {
        self.list(component)
            .into_iter()
            .find(|e| e.metadata.checkpoint_id == checkpoint_id)
    }

    pub fn remove(&self, component: &str, checkpoint_id: u64) -> Result<(), CheckpointError> {
        let Some(entry) = self.find(component, checkpoint_id) else {
            return Err(CheckpointError::Storage(format!(
                "no checkpoint {checkpoint_id} for component {component}"
            )));
        };
        std::fs::remove_dir_all(&entry.dir)?;
        Ok(())
    }

    /// Moves an ephemeral checkpoint into the persistent root,
    /// preserving its checkpoint id.
    pub fn migrate_to_persistent(&self, component: &str, checkpoint_id: u64) -> Result<PathBuf, CheckpointError> {
        let entry = self
            .find(component, checkpoint_id)
            .ok_or_else(|| CheckpointError::Storage(format!("no checkpoint {checkpoint_id} for component {component}")))?;
        if entry.metadata.persistent {
            return Ok(entry.dir);
        }

        let dest_dir = self.component_dir(component, true);
        std::fs::create_dir_all(&dest_dir)?;
        let dest = dest_dir.join(checkpoint_id.to_string());

        copy_dir_recursive(&entry.dir, &dest)?;
        std::fs::remove_dir_all(&entry.dir)?;

        let mut metadata = entry.metadata;
        metadata.persistent = true;
        self.write_metadata(&dest, &metadata)?;

        Ok(dest)
    }

    /// Total bytes occupied by all of `component`'s checkpoints across
    /// both roots.
    pub fn storage_usage(&self, component: &str) -> u64 {
        self.list(component)
            .iter()
            .map(|entry| dir_size(&entry.dir))
            .sum()
    }

    /// Enforces a retention policy: keeps at most `keep_count` newest
    /// checkpoints and drops anything older than `max_age_hours` (0
    /// disables the age bound). Returns the number removed.
    pub fn cleanup(&self, component: &str, keep_count: usize, max_age_hours: u64) -> usize {
        let entries = self.list(component);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let max_age_secs = max_age_hours.saturating_mul(3600);

        let mut removed = 0;
        for (idx, entry) in entries.iter().enumerate() {
            let too_old = max_age_hours > 0
                && now.saturating_sub(entry.metadata.created_unix) > max_age_secs;
            let over_quota = idx >= keep_count;
            if too_old || over_quota {
                if std::fs::remove_dir_all(&entry.dir).is_ok() {
                    removed += 1;
                } else {
                    tracing::warn!(dir = %entry.dir.display(), "failed to remove checkpoint during cleanup");
                }
            }
        }
        removed
    }
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(read_dir) = std::fs::read_dir(dir) else { return 0 };
    read_dir
        .filter_map(|e| e.ok())
        .map(|e| {
            if let Ok(metadata) = e.metadata() {
                if metadata.is_dir() {
                    dir_size(&e.path())
                } else {
                    metadata.len()
                }
            } else {
                0
            }
        })
        .sum()
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let dest_path = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &dest_path)?;
        } else {
            std::fs::copy(entry.path(), &dest_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, tempfile::TempDir, CheckpointStore) {
        let ephemeral = tempfile::tempdir().unwrap();
        let persistent = tempfile::tempdir().unwrap();
        let s = CheckpointStore::new(ephemeral.path(), persistent.path());
        (ephemeral, persistent, s)
    }

    #[test]
    fn allocate_creates_unique_directory_with_metadata() {
        let (_e, _p, store) = store();
        let (dir, metadata) = store.allocate("web", 1234, false, false).unwrap();
        assert!(dir.is_dir());
        assert!(dir.join(METADATA_FILE).is_file());
        assert_eq!(metadata.pid, 1234);
        assert!(!metadata.persistent);
    }

    #[test]
    fn list_is_newest_first() {
        let (_e, _p, store) = store();
        let comp_dir = store.component_dir("web", false);
        std::fs::create_dir_all(&comp_dir).unwrap();
        std::fs::create_dir_all(comp_dir.join("100")).unwrap();
        std::fs::create_dir_all(comp_dir.join("200")).unwrap();

        let entries = store.list("web");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].metadata.checkpoint_id, 200);
        assert_eq!(entries[1].metadata.checkpoint_id, 100);
    }

    #[test]
    fn migrate_to_persistent_moves_directory_and_updates_metadata() {
        let (_e, _p, store) = store();
        let (_dir, metadata) = store.allocate("web", 1, false, false).unwrap();

        let dest = store.migrate_to_persistent("web", metadata.checkpoint_id).unwrap();
        assert!(dest.starts_with(&store.persistent_root));

        let entry = store.find("web", metadata.checkpoint_id).unwrap();
        assert!(entry.metadata.persistent);
        assert!(store.ephemeral_root.join("web").join(metadata.checkpoint_id.to_string()).exists() == false);
    }

    #[test]
    fn cleanup_respects_keep_count() {
        let (_e, _p, store) = store();
        for pid in 1..=5 {
            store.allocate("web", pid, false, false).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        // Force distinct ids even if clocks tick slower than our loop.
        let entries_before = store.list("web");
        assert!(entries_before.len() >= 1);

        let removed = store.cleanup("web", 1, 0);
        let entries_after = store.list("web");
        assert_eq!(entries_after.len(), 1);
        assert_eq!(removed, entries_before.len() - 1);
    }

    #[test]
    fn remove_missing_checkpoint_errors() {
        let (_e, _p, store) = store();
        assert!(store.remove("web", 999).is_err());
    }

    #[test]
    fn metadata_save_then_load_is_identity() {
        let (_e, _p, store) = store();
        let (dir, metadata) = store
            .allocate_with_metadata(
                "web",
                4242,
                true,
                true,
                &["http.8080".to_string(), "http.health".to_string()],
                "3.17.1",
                &[3, 4],
            )
            .unwrap();

        let loaded = CheckpointStore::read_metadata(&dir).unwrap();
        assert_eq!(loaded.component, metadata.component);
        assert_eq!(loaded.checkpoint_id, metadata.checkpoint_id);
        assert_eq!(loaded.pid, metadata.pid);
        assert_eq!(loaded.persistent, metadata.persistent);
        assert_eq!(loaded.leave_running, metadata.leave_running);
        assert_eq!(loaded.capabilities, "http.8080,http.health");
        assert_eq!(loaded.engine_version, "3.17.1");
        assert_eq!(loaded.preserve_fds, "3,4");
    }
}
