//! Upgrade Coordinator — live upgrade of a running component without
//! an observable capability outage, falling through three tiers of
//! decreasing cost and increasing disruption.
//!
//! Grounded on `hotswap.c`/`hotswap.h` (the fd-passing state machine
//! and its timeouts) and `checkpoint.c`/`checkpoint-mgmt.c` (the
//! checkpoint/restore pair Tier 1 drives). Tier 3 falls back to the
//! plain Supervisor stop/start path every component already has.
//!
//! A component's `upgrading` flag is held for the duration of the
//! whole attempt (across all tiers it falls through), so the Resolver
//! does not cascade-fail dependents over the capability flicker an
//! in-flight handoff causes — see DESIGN.md's resolution of the
//! cascade-suppression open question.

use crate::capability::CapabilityRegistry;
use crate::checkpoint::{CheckpointEngine, CheckpointStore};
use crate::component::{ComponentState, ComponentTable, ReadinessMethod, UpgradeHandoff};
use crate::error::UpgradeError;
use crate::handoff::HandoffChannel;
use crate::supervisor::Supervisor;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::time::{Duration, Instant};

const FD_PASSING_COMPLETION_TIMEOUT: Duration = Duration::from_secs(10);
const OLD_INSTANCE_GRACE: Duration = Duration::from_secs(1);
const RESTART_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeTier {
    Checkpoint,
    FdPassing,
    Restart,
}

#[derive(Debug, Clone)]
pub struct UpgradeOutcome {
    pub tier: UpgradeTier,
    pub old_pid: Option<i32>,
    pub new_pid: Option<i32>,
}

/// Attempts to live-upgrade `component_name` in place. Tries Tier 1
/// (checkpoint/restore) if declared and the engine is available, then
/// Tier 2 (fd-passing handoff), then Tier 3 (plain restart). Only a
/// Tier 3 failure is returned as an error — the first two tiers fail
/// through silently (logged at `warn`) per spec.md §7.
pub async fn upgrade(
    component_name: &str,
    table: &mut ComponentTable,
    registry: &mut CapabilityRegistry,
    supervisor: &Supervisor,
    engine: &CheckpointEngine,
    store: &CheckpointStore,
) -> Result<UpgradeOutcome, UpgradeError> {
    let component = table
        .get_by_name(component_name)
        .ok_or_else(|| UpgradeError::UnknownComponent(component_name.to_string()))?;
    if component.state != ComponentState::Active {
        return Err(UpgradeError::NotActive(component_name.to_string()));
    }
    let handoff_pref = component.upgrade_handoff;

    if let Some(c) = table.get_by_name_mut(component_name) {
        c.upgrading = true;
    }

    let result = run_tiers(component_name, table, registry, supervisor, engine, store, handoff_pref).await;

    if let Some(c) = table.get_by_name_mut(component_name) {
        c.upgrading = false;
    }

    result
}

async fn run_tiers(
    name: &str,
    table: &mut ComponentTable,
    registry: &mut CapabilityRegistry,
    supervisor: &Supervisor,
    engine: &CheckpointEngine,
    store: &CheckpointStore,
    handoff_pref: UpgradeHandoff,
) -> Result<UpgradeOutcome, UpgradeError> {
    if handoff_pref == UpgradeHandoff::Checkpoint {
        match try_tier_checkpoint(name, table, registry, engine, store).await {
            Ok(outcome) => return Ok(outcome),
            Err(reason) => {
                tracing::warn!(component = name, reason = %reason, "upgrade tier 1 (checkpoint) failed, falling through to tier 2");
            }
        }
    }

    match try_tier_fd_passing(name, table, registry, supervisor).await {
        Ok(outcome) => return Ok(outcome),
        Err(reason) => {
            tracing::warn!(component = name, reason = %reason, "upgrade tier 2 (fd-passing) failed, falling through to tier 3");
        }
    }

    tier_restart(name, table, registry, supervisor).await
}

/// Tier 1: checkpoint the running instance into a scratch (ephemeral,
/// non-persistent) checkpoint, restore it into a fresh pid, and only
/// then tear down the original. Any failure along the way rolls back
/// (old pid kept running, scratch checkpoint destroyed) rather than
/// leaving the component half-migrated.
async fn try_tier_checkpoint(
    name: &str,
    table: &mut ComponentTable,
    registry: &mut CapabilityRegistry,
    engine: &CheckpointEngine,
    store: &CheckpointStore,
) -> Result<UpgradeOutcome, String> {
    if !engine.is_supported() {
        return Err("checkpoint engine not supported on this host".to_string());
    }

    let (old_pid, provides, preserve_fds) = {
        let c = table.get_by_name(name).ok_or("component vanished mid-upgrade")?;
        let pid = c.pid.ok_or("component has no pid")?;
        (pid, c.provides.clone(), c.checkpoint_policy.preserve_fds.clone())
    };

    let version = engine.version().await.map(|v| v.to_string()).unwrap_or_default();

    let (dir, metadata) = store
        .allocate_with_metadata(name, old_pid, false, true, &provides, &version, &preserve_fds)
        .map_err(|e| e.to_string())?;

    if let Err(err) = engine.checkpoint(old_pid, &dir, true).await {
        let _ = store.remove(name, metadata.checkpoint_id);
        return Err(format!("checkpoint failed: {err}"));
    }
    let _ = store.record_image_size(&dir);

    let new_pid = match engine.restore(&dir).await {
        Ok(pid) => pid,
        Err(err) => {
            let _ = store.remove(name, metadata.checkpoint_id);
            return Err(format!("restore failed: {err}"));
        }
    };

    graceful_terminate(old_pid, OLD_INSTANCE_GRACE).await;
    let _ = store.remove(name, metadata.checkpoint_id);

    apply_new_pid(table, registry, name, new_pid);

    Ok(UpgradeOutcome { tier: UpgradeTier::Checkpoint, old_pid: Some(old_pid), new_pid: Some(new_pid) })
}

/// Tier 2: fork a fresh instance with one end of a handoff channel
/// passed on the fixed handoff descriptor, signal the running instance
/// to begin transferring its listening sockets over the other end,
/// and wait for its completion token. The old instance is responsible
/// for transferring fds and exiting on its own once done; we just give
/// it a grace period before reaping what's left.
async fn try_tier_fd_passing(
    name: &str,
    table: &mut ComponentTable,
    registry: &mut CapabilityRegistry,
    supervisor: &Supervisor,
) -> Result<UpgradeOutcome, String> {
    let (old_pid, reload_signal) = {
        let c = table.get_by_name(name).ok_or("component vanished mid-upgrade")?;
        let pid = c.pid.ok_or("component has no pid")?;
        (pid, c.reload_signal)
    };

    let (parent_end, child_end) = HandoffChannel::create_pair().map_err(|e| e.to_string())?;

    let component = table
        .get_by_name(name)
        .ok_or("component vanished mid-upgrade")?
        .clone();
    let new_pid = supervisor
        .fork_for_handoff(&component, child_end.as_raw_fd())
        .map_err(|err| format!("fork failed: {err}"))?;
    drop(child_end);

    let sig = reload_signal
        .and_then(|n| Signal::try_from(n).ok())
        .unwrap_or(Signal::SIGUSR1);
    if nix::sys::signal::kill(Pid::from_raw(old_pid), sig).is_err() {
        let _ = nix::sys::signal::kill(Pid::from_raw(new_pid), Signal::SIGKILL);
        return Err("failed to signal running instance to begin handoff".to_string());
    }

    if let Err(err) = parent_end.wait_complete(FD_PASSING_COMPLETION_TIMEOUT).await {
        let _ = nix::sys::signal::kill(Pid::from_raw(new_pid), Signal::SIGKILL);
        return Err(format!("handoff did not complete: {err}"));
    }

    if nix::sys::signal::kill(Pid::from_raw(new_pid), None).is_err() {
        return Err("new instance died immediately after the handoff token".to_string());
    }

    apply_new_pid(table, registry, name, new_pid);
    graceful_terminate(old_pid, OLD_INSTANCE_GRACE).await;

    Ok(UpgradeOutcome { tier: UpgradeTier::FdPassing, old_pid: Some(old_pid), new_pid: Some(new_pid) })
}

/// Tier 3: withdraw the component's capabilities, stop the old
/// instance (bounded wait, then SIGKILL), and reset it to INACTIVE so
/// the Resolver starts a fresh instance on its next pass. This is the
/// only tier with an observable capability outage, and the only one
/// whose failure is surfaced to an operator.
async fn tier_restart(
    name: &str,
    table: &mut ComponentTable,
    registry: &mut CapabilityRegistry,
    supervisor: &Supervisor,
) -> Result<UpgradeOutcome, UpgradeError> {
    let old_pid = {
        let c = table
            .get_by_name_mut(name)
            .ok_or_else(|| UpgradeError::UnknownComponent(name.to_string()))?;
        for cap in c.provides.clone() {
            registry.withdraw(&cap);
        }
        c.pid
    };

    if let Some(pid) = old_pid {
        supervisor.terminate(table.get_by_name(name).unwrap(), false);
        let deadline = Instant::now() + RESTART_STOP_TIMEOUT;
        loop {
            if nix::sys::signal::kill(Pid::from_raw(pid), None).is_err() {
                break;
            }
            if Instant::now() >= deadline {
                supervisor.terminate(table.get_by_name(name).unwrap(), true);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    let c = table
        .get_by_name_mut(name)
        .ok_or_else(|| UpgradeError::RestartFailed(name.to_string(), "component vanished mid-restart".to_string()))?;
    c.pid = None;
    c.restart_count = 0;
    c.last_restart = None;
    c.state = ComponentState::Inactive;

    Ok(UpgradeOutcome { tier: UpgradeTier::Restart, old_pid, new_pid: None })
}

/// Installs the new pid on the component record and transitions it the
/// same way the Supervisor's start path would: straight to ACTIVE for
/// a none-readiness component, or to READY_WAIT (with capabilities
/// withdrawn until the Readiness Monitor republishes them) otherwise.
fn apply_new_pid(table: &mut ComponentTable, registry: &mut CapabilityRegistry, name: &str, new_pid: i32) {
    let Some(c) = table.get_by_name_mut(name) else { return };
    c.pid = Some(new_pid);
    if matches!(c.readiness, ReadinessMethod::None) {
        c.state = ComponentState::Active;
    } else {
        c.state = ComponentState::ReadyWait;
        c.ready_wait_start = Some(Instant::now());
        let caps = c.provides.clone();
        for cap in caps {
            registry.withdraw(&cap);
        }
    }
}

async fn graceful_terminate(pid: i32, grace: Duration) {
    let _ = nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
    tokio::time::sleep(grace).await;
    if nix::sys::signal::kill(Pid::from_raw(pid), None).is_ok() {
        let _ = nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupManager;
    use crate::component::{Component, ComponentId};
    use std::path::PathBuf;

    fn supervisor() -> Supervisor {
        Supervisor::new(CgroupManager::new(PathBuf::from("/tmp/graphd-test-upgrade-cgroups")))
    }

    fn store() -> (tempfile::TempDir, tempfile::TempDir, CheckpointStore) {
        let ephemeral = tempfile::tempdir().unwrap();
        let persistent = tempfile::tempdir().unwrap();
        let s = CheckpointStore::new(ephemeral.path(), persistent.path());
        (ephemeral, persistent, s)
    }

    #[tokio::test]
    async fn upgrade_unknown_component_errors() {
        let mut table = ComponentTable::new();
        let mut registry = CapabilityRegistry::new();
        let sup = supervisor();
        let engine = CheckpointEngine::unavailable();
        let (_e, _p, store) = store();

        let result = upgrade("nonexistent", &mut table, &mut registry, &sup, &engine, &store).await;
        assert!(matches!(result, Err(UpgradeError::UnknownComponent(_))));
    }

    #[tokio::test]
    async fn upgrade_refuses_component_not_active() {
        let mut table = ComponentTable::new();
        let mut registry = CapabilityRegistry::new();
        let sup = supervisor();
        let engine = CheckpointEngine::unavailable();
        let (_e, _p, store) = store();

        let id = table.allocate_id();
        table.insert(Component::new(id, "web", "/usr/bin/web"));

        let result = upgrade("web", &mut table, &mut registry, &sup, &engine, &store).await;
        assert!(matches!(result, Err(UpgradeError::NotActive(_))));
    }

    #[tokio::test]
    async fn tier_checkpoint_refuses_without_supported_engine_and_leaves_no_trace() {
        let mut table = ComponentTable::new();
        let mut registry = CapabilityRegistry::new();
        let engine = CheckpointEngine::unavailable();
        let (_e, _p, store) = store();

        let id = table.allocate_id();
        let mut comp = Component::new(id, "web", "/usr/bin/web");
        comp.state = ComponentState::Active;
        comp.pid = Some(std::process::id() as i32);
        comp.provides = vec!["http.8080".to_string()];
        comp.upgrade_handoff = UpgradeHandoff::Checkpoint;
        table.insert(comp);

        let result = try_tier_checkpoint("web", &mut table, &mut registry, &engine, &store).await;
        assert!(result.is_err());
        assert!(store.list("web").is_empty());
    }

    #[tokio::test]
    async fn tier_restart_withdraws_capabilities_and_resets_to_inactive() {
        let mut table = ComponentTable::new();
        let mut registry = CapabilityRegistry::new();
        let sup = supervisor();

        let id = table.allocate_id();
        let mut comp = Component::new(id, "web", "/usr/bin/web");
        comp.state = ComponentState::Active;
        comp.pid = Some(999_999); // almost certainly not a live pid
        comp.provides = vec!["http.8080".to_string()];
        comp.restart_count = 3;
        table.insert(comp);
        registry.register("http.8080", id);

        let outcome = tier_restart("web", &mut table, &mut registry, &sup).await.unwrap();
        assert_eq!(outcome.tier, UpgradeTier::Restart);
        assert!(!registry.active("http.8080"));

        let reloaded = table.get_by_name("web").unwrap();
        assert_eq!(reloaded.state, ComponentState::Inactive);
        assert_eq!(reloaded.pid, None);
        assert_eq!(reloaded.restart_count, 0);
    }

    #[test]
    fn apply_new_pid_goes_active_for_none_readiness() {
        let mut table = ComponentTable::new();
        let mut registry = CapabilityRegistry::new();
        let id = table.allocate_id();
        let mut comp = Component::new(id, "web", "/usr/bin/web");
        comp.provides = vec!["http.8080".to_string()];
        table.insert(comp);
        registry.register("http.8080", id);

        apply_new_pid(&mut table, &mut registry, "web", 4242);

        let c = table.get_by_name("web").unwrap();
        assert_eq!(c.state, ComponentState::Active);
        assert_eq!(c.pid, Some(4242));
        assert!(registry.active("http.8080"));
    }

    #[test]
    fn apply_new_pid_gates_on_readiness_and_withdraws_capabilities() {
        let mut table = ComponentTable::new();
        let mut registry = CapabilityRegistry::new();
        let id = table.allocate_id();
        let mut comp = Component::new(id, "web", "/usr/bin/web");
        comp.provides = vec!["http.8080".to_string()];
        comp.readiness = ReadinessMethod::File("/run/web.ready".to_string());
        table.insert(comp);
        registry.register("http.8080", id);

        apply_new_pid(&mut table, &mut registry, "web", 4242);

        let c = table.get_by_name("web").unwrap();
        assert_eq!(c.state, ComponentState::ReadyWait);
        assert!(c.ready_wait_start.is_some());
        assert!(!registry.active("http.8080"));
    }
}
