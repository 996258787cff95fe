//! Daemon configuration
//!
//! All paths and tunables are environment-overridable, falling back to
//! the filesystem layout fixed by the control protocol and declaration
//! schema.

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for `graphd`, resolved once at startup.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Directory scanned for `*.toml` component declarations.
    pub declaration_dir: PathBuf,

    /// Unix-domain control socket path.
    pub control_socket: PathBuf,

    /// Root cgroup v2 directory for component isolation.
    pub cgroup_root: PathBuf,

    /// Ephemeral checkpoint storage root (tmpfs-backed, cleared across
    /// a plain reboot).
    pub checkpoint_run_dir: PathBuf,

    /// Persistent checkpoint storage root (survives a kernel transition).
    pub checkpoint_var_dir: PathBuf,

    /// Directory holding one append-mode log file per component.
    pub log_dir: PathBuf,

    /// Default readiness timeout applied when a declaration omits one.
    pub default_readiness_timeout: Duration,

    /// Failure threshold before a component is marked DEGRADED.
    pub health_failure_threshold: u32,

    /// Restart threshold before a component is marked FAILED outright.
    pub health_restart_threshold: u32,

    /// Event loop tick interval for readiness/health/OOM polling.
    pub tick_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            declaration_dir: PathBuf::from("/etc/graphd/components.d"),
            control_socket: PathBuf::from("/run/graph-resolver.sock"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/graphd"),
            checkpoint_run_dir: PathBuf::from("/run/graphd/checkpoint"),
            checkpoint_var_dir: PathBuf::from("/var/lib/graphd/checkpoint"),
            log_dir: PathBuf::from("/run/graphd/log"),
            default_readiness_timeout: Duration::from_secs(30),
            health_failure_threshold: 3,
            health_restart_threshold: 5,
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl DaemonConfig {
    /// Build configuration from the environment, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("GRAPHD_DECL_DIR") {
            config.declaration_dir = PathBuf::from(dir);
        }
        if let Ok(sock) = std::env::var("GRAPHD_CONTROL_SOCKET") {
            config.control_socket = PathBuf::from(sock);
        }
        if let Ok(root) = std::env::var("GRAPHD_CGROUP_ROOT") {
            config.cgroup_root = PathBuf::from(root);
        }
        if let Ok(dir) = std::env::var("GRAPHD_CHECKPOINT_RUN_DIR") {
            config.checkpoint_run_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("GRAPHD_CHECKPOINT_VAR_DIR") {
            config.checkpoint_var_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("GRAPHD_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Ok(secs) = std::env::var("GRAPHD_READINESS_TIMEOUT_SECS") {
            if let Ok(val) = secs.parse() {
                config.default_readiness_timeout = Duration::from_secs(val);
            }
        }
        if let Ok(n) = std::env::var("GRAPHD_HEALTH_FAILURE_THRESHOLD") {
            if let Ok(val) = n.parse() {
                config.health_failure_threshold = val;
            }
        }
        if let Ok(n) = std::env::var("GRAPHD_HEALTH_RESTART_THRESHOLD") {
            if let Ok(val) = n.parse() {
                config.health_restart_threshold = val;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_control_protocol_paths() {
        let config = DaemonConfig::default();
        assert_eq!(config.control_socket, PathBuf::from("/run/graph-resolver.sock"));
        assert_eq!(config.default_readiness_timeout, Duration::from_secs(30));
        assert_eq!(config.health_failure_threshold, 3);
        assert_eq!(config.health_restart_threshold, 5);
    }

    #[test]
    fn from_env_overrides_declaration_dir() {
        std::env::set_var("GRAPHD_DECL_DIR", "/tmp/graphd-test-decls");
        let config = DaemonConfig::from_env();
        assert_eq!(config.declaration_dir, PathBuf::from("/tmp/graphd-test-decls"));
        std::env::remove_var("GRAPHD_DECL_DIR");
    }
}
