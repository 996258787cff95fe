//! cgroup v2 resource management — creation, resource limits, OOM
//! polling, and cleanup for component isolation.
//!
//! Grounded on `cgroup.c`: mount detection via
//! `cgroup.controllers`, enabling `+memory +cpu +io +pids` on
//! `cgroup.subtree_control` at both the filesystem root and the
//! graph subtree root, per-component directories under the subtree
//! root, and resource-limit files (`memory.max`, `memory.high`,
//! `cpu.weight`, `cpu.max`, `io.weight`, `pids.max`).

use crate::component::ResourceLimits;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const MOUNT_POINT: &str = "/sys/fs/cgroup";

pub struct CgroupManager {
    root: PathBuf,
}

impl CgroupManager {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn is_mounted(&self) -> bool {
        Path::new(MOUNT_POINT).join("cgroup.controllers").exists()
    }

    /// Mounts cgroup v2 if not already mounted, creates the graph
    /// subtree root, and enables memory/cpu/io/pids controllers both
    /// at the filesystem root and the subtree root. Controller-enable
    /// failures are logged as warnings, not propagated — the original
    /// treats this as best-effort.
    pub fn init(&self) -> Result<()> {
        if !self.is_mounted() {
            std::fs::create_dir_all(MOUNT_POINT).ok();
            nix::mount::mount(
                Some("cgroup2"),
                MOUNT_POINT,
                Some("cgroup2"),
                nix::mount::MsFlags::empty(),
                None::<&str>,
            )
            .context("failed to mount cgroup v2")?;
            tracing::info!(mount_point = MOUNT_POINT, "mounted cgroup v2");
        }

        if !self.root.exists() {
            std::fs::create_dir_all(&self.root)
                .with_context(|| format!("failed to create cgroup root {:?}", self.root))?;
            tracing::info!(root = %self.root.display(), "created cgroup root");
        }

        for path in [
            Path::new(MOUNT_POINT).join("cgroup.subtree_control"),
            self.root.join("cgroup.subtree_control"),
        ] {
            if let Err(err) = std::fs::write(&path, "+memory +cpu +io +pids") {
                tracing::warn!(path = %path.display(), error = %err, "failed to enable cgroup controllers");
            }
        }

        Ok(())
    }

    fn full_path(&self, cgroup_path: &str) -> PathBuf {
        if let Some(stripped) = cgroup_path.strip_prefix('/') {
            self.root.join(stripped)
        } else {
            self.root.join(cgroup_path)
        }
    }

    pub fn exists(&self, cgroup_path: &str) -> bool {
        self.full_path(cgroup_path).is_dir()
    }

    /// Creates a cgroup directory (recursively) for a component.
    pub fn create(&self, component_name: &str, cgroup_path: Option<&str>) -> Result<PathBuf> {
        let sub = cgroup_path.filter(|s| !s.is_empty()).unwrap_or(component_name);
        let full = self.full_path(sub);
        if !full.exists() {
            std::fs::create_dir_all(&full)
                .with_context(|| format!("failed to create cgroup {:?}", full))?;
            tracing::info!(cgroup = %full.display(), "created cgroup");
        }
        Ok(full)
    }

    pub fn add_process(&self, cgroup_path: &str, pid: i32) -> Result<()> {
        let procs = self.full_path(cgroup_path).join("cgroup.procs");
        std::fs::write(&procs, pid.to_string())
            .with_context(|| format!("failed to add pid {pid} to cgroup {:?}", procs))?;
        tracing::info!(pid, cgroup = cgroup_path, "added pid to cgroup");
        Ok(())
    }

    fn write_file(&self, cgroup_path: &str, filename: &str, value: &str) -> Result<()> {
        let path = self.full_path(cgroup_path).join(filename);
        std::fs::write(&path, value)
            .with_context(|| format!("failed to write {value:?} to {:?}", path))?;
        Ok(())
    }

    /// Applies every declared limit, logging (not failing outright)
    /// for any single limit that fails to apply, matching
    /// `cgroup_apply_limits`'s "accumulate errors, keep going" style.
    pub fn apply_limits(&self, cgroup_path: &str, limits: &ResourceLimits) -> Result<()> {
        let mut any_failed = false;

        if let Some(bytes) = limits.memory_max {
            if let Err(err) = self.write_file(cgroup_path, "memory.max", &bytes.to_string()) {
                tracing::error!(%err, "failed to set memory.max");
                any_failed = true;
            }
        }
        if let Some(bytes) = limits.memory_high {
            if let Err(err) = self.write_file(cgroup_path, "memory.high", &bytes.to_string()) {
                tracing::error!(%err, "failed to set memory.high");
                any_failed = true;
            }
        }
        if let Some(weight) = limits.cpu_weight {
            let clamped = weight.clamp(1, 10_000);
            if let Err(err) = self.write_file(cgroup_path, "cpu.weight", &clamped.to_string()) {
                tracing::error!(%err, "failed to set cpu.weight");
                any_failed = true;
            }
        }
        if let Some(cpu_max) = &limits.cpu_max {
            if let Err(err) = self.write_file(cgroup_path, "cpu.max", cpu_max) {
                tracing::error!(%err, "failed to set cpu.max");
                any_failed = true;
            }
        }
        if let Some(weight) = limits.io_weight {
            let clamped = weight.clamp(1, 10_000);
            if let Err(err) = self.write_file(cgroup_path, "io.weight", &clamped.to_string()) {
                tracing::error!(%err, "failed to set io.weight");
                any_failed = true;
            }
        }
        if let Some(limit) = limits.pids_max {
            if let Err(err) = self.write_file(cgroup_path, "pids.max", &limit.to_string()) {
                tracing::error!(%err, "failed to set pids.max");
                any_failed = true;
            }
        }

        if any_failed {
            anyhow::bail!("one or more resource limits failed to apply for {cgroup_path}");
        }
        Ok(())
    }

    /// Returns the OOM-kill count observed since the cgroup's
    /// `memory.events` was last read fresh by the kernel (it's a
    /// cumulative counter, not an edge-triggered one). A missing
    /// controller or file is not an error — it just means nothing to
    /// report.
    pub fn check_oom_events(&self, cgroup_path: &str) -> u64 {
        let events_path = self.full_path(cgroup_path).join("memory.events");
        let Ok(contents) = std::fs::read_to_string(&events_path) else {
            return 0;
        };
        for line in contents.lines() {
            if let Some(count) = line.strip_prefix("oom_kill ") {
                if let Ok(n) = count.trim().parse() {
                    return n;
                }
            }
        }
        0
    }

    /// Best-effort cleanup: removing a non-empty cgroup directory
    /// fails harmlessly (the kernel refuses until it's empty); that's
    /// logged, not propagated.
    pub fn cleanup(&self, cgroup_path: &str) {
        let full = self.full_path(cgroup_path);
        match std::fs::remove_dir(&full) {
            Ok(()) => tracing::info!(cgroup = %full.display(), "cleaned up cgroup"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(cgroup = %full.display(), error = %err, "failed to remove cgroup"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_path_joins_relative_and_absolute() {
        let mgr = CgroupManager::new(PathBuf::from("/sys/fs/cgroup/graphd"));
        assert_eq!(
            mgr.full_path("nginx"),
            PathBuf::from("/sys/fs/cgroup/graphd/nginx")
        );
        assert_eq!(
            mgr.full_path("/custom/path"),
            PathBuf::from("/sys/fs/cgroup/graphd/custom/path")
        );
    }

    #[test]
    fn check_oom_events_parses_counter() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CgroupManager::new(dir.path().to_path_buf());
        let sub = dir.path().join("nginx");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("memory.events"), "low 0\nhigh 3\noom_kill 2\nmax 0\n").unwrap();
        assert_eq!(mgr.check_oom_events("nginx"), 2);
    }

    #[test]
    fn check_oom_events_missing_file_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CgroupManager::new(dir.path().to_path_buf());
        assert_eq!(mgr.check_oom_events("nothing-here"), 0);
    }

    #[test]
    fn create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CgroupManager::new(dir.path().to_path_buf());
        mgr.create("nginx", None).unwrap();
        assert!(mgr.exists("nginx"));
        mgr.create("nginx", None).unwrap();
        assert!(mgr.exists("nginx"));
    }
}
