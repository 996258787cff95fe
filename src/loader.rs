//! TOML declaration loader.
//!
//! Scans the declaration directory non-recursively for `*.toml`
//! files (mirroring `component.c`'s `load_components`, which only
//! reads files directly inside the directory and is tolerant of a
//! missing directory), parses each with `serde`/`toml`, and converts
//! the wire schema into runtime `Component` records.

use crate::component::{
    CheckpointPolicy, Component, ComponentId, ComponentKind, HealthConfig, IsolationConfig,
    Namespace, ReadinessMethod, ResourceLimits, UpgradeHandoff,
};
use crate::error::DeclarationError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct RawDeclaration {
    component: RawComponent,
    #[serde(default)]
    provides: RawCapabilityList,
    #[serde(default)]
    requires: RawCapabilityList,
    #[serde(default)]
    optional: RawCapabilityList,
    #[serde(default)]
    lifecycle: Option<RawLifecycle>,
    #[serde(default)]
    resources: Option<RawResources>,
    #[serde(default)]
    isolation: Option<RawIsolation>,
    #[serde(default)]
    checkpoint: Option<RawCheckpoint>,
}

#[derive(Debug, Deserialize)]
struct RawComponent {
    name: Option<String>,
    binary: Option<String>,
    #[serde(rename = "type", default = "default_type")]
    kind: String,
    #[serde(default)]
    args: Vec<String>,
}

fn default_type() -> String {
    "service".to_string()
}

#[derive(Debug, Deserialize, Default)]
struct RawCapabilityList {
    #[serde(default)]
    capabilities: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawLifecycle {
    #[serde(rename = "reload-signal")]
    reload_signal: Option<String>,
    handoff: Option<String>,
    #[serde(rename = "health-check")]
    health_check: Option<String>,
    #[serde(rename = "health-interval")]
    health_interval: Option<u64>,
    #[serde(rename = "health-timeout")]
    health_timeout: Option<u64>,
    #[serde(rename = "health-failure-threshold")]
    health_failure_threshold: Option<u32>,
    #[serde(rename = "health-restart-threshold")]
    health_restart_threshold: Option<u32>,
    #[serde(rename = "readiness-file")]
    readiness_file: Option<String>,
    #[serde(rename = "readiness-check")]
    readiness_check: Option<String>,
    #[serde(rename = "readiness-signal")]
    readiness_signal: Option<i32>,
    #[serde(rename = "readiness-timeout")]
    readiness_timeout: Option<u64>,
    #[serde(rename = "readiness-interval")]
    readiness_interval: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawResources {
    cgroup: Option<String>,
    #[serde(rename = "memory.max")]
    memory_max: Option<String>,
    #[serde(rename = "memory.high")]
    memory_high: Option<String>,
    #[serde(rename = "cpu.weight")]
    cpu_weight: Option<u32>,
    #[serde(rename = "cpu.max")]
    cpu_max: Option<String>,
    #[serde(rename = "io.weight")]
    io_weight: Option<u32>,
    #[serde(rename = "pids.max")]
    pids_max: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RawIsolation {
    namespaces: Option<String>,
    root: Option<String>,
    hostname: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawCheckpoint {
    #[serde(default)]
    enabled: bool,
    #[serde(rename = "preserve-fds", default)]
    preserve_fds: Vec<i32>,
    #[serde(rename = "leave-running", default)]
    leave_running: bool,
    #[serde(rename = "memory-estimate")]
    memory_estimate: Option<u64>,
    #[serde(rename = "max-age")]
    max_age_hours: Option<u64>,
}

/// Parses memory-limit strings like "64M" into bytes. Grounded on
/// `cgroup.c`'s `parse_memory_limit`. Returns `None` for an
/// unrecognised suffix (spec.md §8 boundary behaviour).
pub fn parse_memory_limit(raw: &str) -> Option<u64> {
    if raw.is_empty() {
        return None;
    }
    let (digits, suffix) = raw.split_at(
        raw.find(|c: char| !c.is_ascii_digit())
            .unwrap_or(raw.len()),
    );
    let value: u64 = digits.parse().ok()?;
    if suffix.is_empty() {
        return Some(value);
    }
    match suffix {
        "K" | "k" => Some(value * 1024),
        "M" | "m" => Some(value * 1024 * 1024),
        "G" | "g" => Some(value * 1024 * 1024 * 1024),
        _ => None,
    }
}

fn parse_namespaces(raw: &str) -> Vec<Namespace> {
    raw.split(',')
        .filter_map(|s| match s.trim() {
            "mount" => Some(Namespace::Mount),
            "pid" => Some(Namespace::Pid),
            "net" => Some(Namespace::Net),
            "uts" => Some(Namespace::Uts),
            "ipc" => Some(Namespace::Ipc),
            "user" => Some(Namespace::User),
            _ => None,
        })
        .collect()
}

fn signal_number(name: &str) -> Option<i32> {
    match name.to_uppercase().as_str() {
        "SIGHUP" => Some(1),
        "SIGINT" => Some(2),
        "SIGUSR1" => Some(10),
        "SIGUSR2" => Some(12),
        "SIGTERM" => Some(15),
        _ => name.parse().ok(),
    }
}

fn convert(raw: RawDeclaration, id: ComponentId, path: &Path) -> Result<Component, DeclarationError> {
    let name = raw
        .component
        .name
        .ok_or_else(|| DeclarationError::MissingName(path.to_path_buf()))?;
    let binary = raw
        .component
        .binary
        .ok_or_else(|| DeclarationError::MissingBinary(path.to_path_buf()))?;

    let kind = match raw.component.kind.as_str() {
        "oneshot" => ComponentKind::Oneshot,
        _ => ComponentKind::Service,
    };

    let mut component = Component::new(id, name, binary);
    component.args = raw.component.args;
    component.kind = kind;
    component.provides = raw.provides.capabilities;
    component.requires = raw.requires.capabilities;
    component.optional = raw.optional.capabilities;

    if let Some(lifecycle) = raw.lifecycle {
        if let Some(sig) = lifecycle.reload_signal.as_deref() {
            component.reload_signal = signal_number(sig);
        }
        component.upgrade_handoff = match lifecycle.handoff.as_deref() {
            Some("fd-passing") => UpgradeHandoff::FdPassing,
            Some("checkpoint") => UpgradeHandoff::Checkpoint,
            _ => UpgradeHandoff::None,
        };

        if let Some(cmd) = lifecycle.health_check {
            component.health = Some(HealthConfig {
                command: cmd,
                interval: Duration::from_secs(lifecycle.health_interval.unwrap_or(60)),
                timeout: Duration::from_secs(lifecycle.health_timeout.unwrap_or(10)),
                failure_threshold: lifecycle.health_failure_threshold.unwrap_or(3),
                restart_threshold: lifecycle.health_restart_threshold.unwrap_or(5),
            });
        }

        component.readiness = if let Some(file) = lifecycle.readiness_file {
            ReadinessMethod::File(file)
        } else if let Some(check) = lifecycle.readiness_check {
            ReadinessMethod::Command {
                check,
                interval: Duration::from_secs(lifecycle.readiness_interval.unwrap_or(1)),
            }
        } else if let Some(sig) = lifecycle.readiness_signal {
            ReadinessMethod::Signal(sig)
        } else {
            ReadinessMethod::None
        };

        // A declared timeout of zero is treated as the default 30s
        // (spec.md §8 boundary behaviour).
        let secs = lifecycle.readiness_timeout.unwrap_or(30);
        component.readiness_timeout = Duration::from_secs(if secs == 0 { 30 } else { secs });
    }

    if let Some(resources) = raw.resources {
        component.resources = ResourceLimits {
            cgroup_subpath: resources.cgroup,
            memory_max: resources.memory_max.as_deref().and_then(parse_memory_limit),
            memory_high: resources.memory_high.as_deref().and_then(parse_memory_limit),
            cpu_weight: resources.cpu_weight.map(|w| w.clamp(1, 10_000)),
            cpu_max: resources.cpu_max,
            io_weight: resources.io_weight.map(|w| w.clamp(1, 10_000)),
            pids_max: resources.pids_max,
        };
    }

    if let Some(isolation) = raw.isolation {
        component.isolation = IsolationConfig {
            namespaces: isolation
                .namespaces
                .as_deref()
                .map(parse_namespaces)
                .unwrap_or_default(),
            root: isolation.root,
            hostname: isolation.hostname,
        };
    }

    if let Some(checkpoint) = raw.checkpoint {
        component.checkpoint_policy = CheckpointPolicy {
            enabled: checkpoint.enabled,
            preserve_fds: checkpoint.preserve_fds,
            leave_running: checkpoint.leave_running,
            memory_estimate_bytes: checkpoint.memory_estimate,
            max_age_hours: checkpoint.max_age_hours.unwrap_or(0),
        };
    }

    Ok(component)
}

/// Loads every `*.toml` declaration directly inside `dir`
/// (non-recursive). A missing directory yields an empty result
/// rather than an error. `next_id` allocates the `ComponentId` for
/// each successfully-parsed declaration. Malformed declarations are
/// logged and skipped; the rest still load (spec.md §7 "reject the
/// affected declaration, keep the rest").
pub fn load_components(
    dir: &Path,
    mut next_id: impl FnMut() -> ComponentId,
) -> Vec<Component> {
    let mut seen_names: std::collections::HashMap<String, PathBuf> = std::collections::HashMap::new();
    let mut components = Vec::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(dir = %dir.display(), error = %err, "declaration directory unreadable, starting with no declared components");
            return components;
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "toml").unwrap_or(false))
        .collect();
    paths.sort();

    for path in paths {
        match load_one(&path, &mut seen_names) {
            Ok(Some(raw)) => {
                let id = next_id();
                match convert(raw, id, &path) {
                    Ok(component) => components.push(component),
                    Err(err) => tracing::error!(path = %path.display(), error = %err, "rejecting declaration"),
                }
            }
            Ok(None) => {}
            Err(err) => tracing::error!(path = %path.display(), error = %err, "rejecting declaration"),
        }
    }

    components
}

fn load_one(
    path: &Path,
    seen_names: &mut std::collections::HashMap<String, PathBuf>,
) -> Result<Option<RawDeclaration>, DeclarationError> {
    let text = std::fs::read_to_string(path)?;
    let raw: RawDeclaration =
        toml::from_str(&text).map_err(|e| DeclarationError::Parse(path.to_path_buf(), e))?;

    if let Some(name) = &raw.component.name {
        if let Some(first_seen) = seen_names.get(name) {
            return Err(DeclarationError::DuplicateName(
                name.clone(),
                first_seen.clone(),
                path.to_path_buf(),
            ));
        }
        seen_names.insert(name.clone(), path.to_path_buf());
    }

    Ok(Some(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_decl(dir: &Path, filename: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(filename)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn missing_directory_yields_empty_not_error() {
        let mut counter = 0u32;
        let components = load_components(Path::new("/nonexistent/decl/dir"), || {
            counter += 1;
            ComponentId(counter)
        });
        assert!(components.is_empty());
    }

    #[test]
    fn loads_minimal_service_declaration() {
        let dir = tempfile::tempdir().unwrap();
        write_decl(
            dir.path(),
            "nginx.toml",
            r#"
            [component]
            name = "nginx"
            binary = "/usr/sbin/nginx"
            type = "service"

            [provides]
            capabilities = ["http.8080"]

            [requires]
            capabilities = ["net.online"]
            "#,
        );

        let mut counter = 0u32;
        let components = load_components(dir.path(), || {
            counter += 1;
            ComponentId(counter)
        });

        assert_eq!(components.len(), 1);
        let nginx = &components[0];
        assert_eq!(nginx.name, "nginx");
        assert_eq!(nginx.kind, ComponentKind::Service);
        assert_eq!(nginx.provides, vec!["http.8080".to_string()]);
        assert_eq!(nginx.requires, vec!["net.online".to_string()]);
    }

    #[test]
    fn non_toml_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_decl(dir.path(), "README.md", "not a declaration");
        let mut counter = 0u32;
        let components = load_components(dir.path(), || {
            counter += 1;
            ComponentId(counter)
        });
        assert!(components.is_empty());
    }

    #[test]
    fn missing_name_is_rejected_but_others_still_load() {
        let dir = tempfile::tempdir().unwrap();
        write_decl(
            dir.path(),
            "broken.toml",
            r#"
            [component]
            binary = "/bin/true"
            "#,
        );
        write_decl(
            dir.path(),
            "ok.toml",
            r#"
            [component]
            name = "ok"
            binary = "/bin/true"
            type = "oneshot"
            "#,
        );

        let mut counter = 0u32;
        let components = load_components(dir.path(), || {
            counter += 1;
            ComponentId(counter)
        });

        assert_eq!(components.len(), 1);
        assert_eq!(components[0].name, "ok");
    }

    #[test]
    fn zero_readiness_timeout_defaults_to_thirty_seconds() {
        let dir = tempfile::tempdir().unwrap();
        write_decl(
            dir.path(),
            "svc.toml",
            r#"
            [component]
            name = "svc"
            binary = "/bin/true"

            [lifecycle]
            readiness-file = "/run/ready"
            readiness-timeout = 0
            "#,
        );
        let mut counter = 0u32;
        let components = load_components(dir.path(), || {
            counter += 1;
            ComponentId(counter)
        });
        assert_eq!(components[0].readiness_timeout, Duration::from_secs(30));
    }

    #[test]
    fn memory_limit_suffixes() {
        assert_eq!(parse_memory_limit("64M"), Some(64 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("512K"), Some(512 * 1024));
        assert_eq!(parse_memory_limit("100"), Some(100));
        assert_eq!(parse_memory_limit("100X"), None);
        assert_eq!(parse_memory_limit(""), None);
    }
}
