//! The daemon's main loop — owns every piece of mutable state and is
//! the only place it is mutated. Control-socket connections and
//! per-tick passes all run inline on this task; nothing here ever
//! hands a `&mut ComponentTable` across an `.await` boundary to
//! another task.
//!
//! Grounded on `graph-resolver.c`'s `main()`: self-pipe SIGCHLD plus
//! `waitpid(-1, WNOHANG)` reaping, inotify-driven declaration reload,
//! a control-socket listener, a periodic tick for readiness/health/OOM
//! polling, and the SIGTERM-all/wait/SIGKILL-stragglers shutdown
//! sequence.

use crate::capability::CapabilityRegistry;
use crate::cgroup::CgroupManager;
use crate::checkpoint::{CheckpointEngine, CheckpointStore};
use crate::component::{ComponentId, ComponentState, ComponentTable};
use crate::config::DaemonConfig;
use crate::control::{self, ControlState};
use crate::graph::{self, DependencyGraph};
use crate::health;
use crate::kexec::{self, KexecEngine};
use crate::loader;
use crate::readiness;
use crate::resolver;
use crate::supervisor::Supervisor;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything the daemon owns, for the lifetime of the process.
pub struct Daemon {
    table: ComponentTable,
    registry: CapabilityRegistry,
    supervisor: Supervisor,
    engine: CheckpointEngine,
    store: CheckpointStore,
    kexec_engine: KexecEngine,
    config: DaemonConfig,
    /// Last observed OOM-kill counter per component, so the tick only
    /// reacts to a fresh kill rather than the same cumulative count.
    oom_counts: HashMap<ComponentId, u64>,
}

impl Daemon {
    /// Builds initial state: loads declarations, registers the
    /// synthetic kernel component's capabilities, and runs a first
    /// resolve pass. Fails only if the freshly-loaded graph contains a
    /// cycle — a boot-time configuration error the caller should
    /// escalate rather than run with.
    pub fn new(config: DaemonConfig) -> anyhow::Result<Self> {
        let mut table = ComponentTable::new();
        let mut registry = CapabilityRegistry::new();

        let kernel = table.get_by_name("kernel").expect("synthetic kernel always present");
        for cap in kernel.provides.clone() {
            registry.register(&cap, kernel.id);
        }

        let declared = loader::load_components(&config.declaration_dir, || table.allocate_id());
        for component in declared {
            table.insert(component);
        }

        let graph = DependencyGraph::build(&table);
        if let Some(cycle) = graph::detect_cycle(&graph) {
            anyhow::bail!("dependency cycle at boot: {}", cycle.message());
        }

        let supervisor = Supervisor::new(CgroupManager::new(config.cgroup_root.clone()));
        let engine = CheckpointEngine::discover();
        let store = CheckpointStore::new(config.checkpoint_run_dir.clone(), config.checkpoint_var_dir.clone());
        let kexec_engine = KexecEngine::discover();

        resolver::resolve_full(&mut table, &mut registry, &supervisor);

        Ok(Self {
            table,
            registry,
            supervisor,
            engine,
            store,
            kexec_engine,
            config,
            oom_counts: HashMap::new(),
        })
    }

    /// If a kernel-transition manifest is waiting in the persistent
    /// checkpoint root, restores every entry and resolves the graph
    /// again so republished capabilities cascade. A no-op when no
    /// manifest is present, which is the common case on every boot
    /// that did not arrive via `kexec`.
    pub async fn resume_after_kernel_transition(&mut self) {
        let root = &self.config.checkpoint_var_dir;
        if !kexec::needs_restore(root) {
            return;
        }
        let manifest = match kexec::load_manifest(root) {
            Ok(manifest) => manifest,
            Err(err) => {
                tracing::error!(error = %err, "found kernel transition manifest but failed to parse it");
                return;
            }
        };
        let restored = kexec::resume(&manifest, &mut self.table, &self.engine, &self.store).await;
        tracing::info!(restored, total = manifest.entries.len(), "resumed components after kernel transition");
        kexec::cleanup_after_resume(root);
        resolver::resolve_full(&mut self.table, &mut self.registry, &self.supervisor);
    }

    /// Runs until a shutdown signal is handled to completion. Returns
    /// normally only after every component has been asked to stop.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        let mut sigusr2 = signal(SignalKind::user_defined2())?;
        let mut sigchld = signal(SignalKind::from_raw(nix::libc::SIGCHLD))?;

        let _ = std::fs::remove_file(&self.config.control_socket);
        if let Some(parent) = self.config.control_socket.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let listener = UnixListener::bind(&self.config.control_socket)?;
        tracing::info!(socket = %self.config.control_socket.display(), "control socket listening");

        let mut inotify_fd = setup_inotify(&self.config.declaration_dir).ok();
        if inotify_fd.is_none() {
            tracing::warn!(dir = %self.config.declaration_dir.display(), "failed to watch declaration directory, reload will only run on SIGUSR1");
        }

        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM received, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    tracing::info!("SIGINT received, shutting down");
                    break;
                }
                _ = sigusr1.recv() => {
                    tracing::info!("SIGUSR1 received, reloading declarations");
                    self.reload();
                }
                _ = sigusr2.recv() => {
                    self.dump_status();
                }
                _ = sigchld.recv() => {
                    let changed = self.supervisor.reap_all(&mut self.table, &mut self.registry);
                    if changed > 0 {
                        resolver::resolve_full(&mut self.table, &mut self.registry, &self.supervisor);
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => self.handle_control_connection(stream).await,
                        Err(err) => tracing::warn!(error = %err, "control socket accept failed"),
                    }
                }
                result = wait_inotify_readable(inotify_fd.as_mut()) => {
                    if result {
                        tracing::info!("declaration directory changed, reloading");
                        self.reload();
                    }
                }
                _ = tick.tick() => {
                    self.run_tick().await;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn run_tick(&mut self) {
        readiness::run_pass(&mut self.table, &mut self.registry, &self.supervisor).await;
        health::run_pass(&mut self.table, &mut self.registry).await;
        let reaped = self.supervisor.reap_all(&mut self.table, &mut self.registry);
        let oomed = self.poll_oom();
        if reaped + oomed > 0 {
            // already resolved below unconditionally; the counts are
            // only used for the trace below.
        }
        resolver::resolve_full(&mut self.table, &mut self.registry, &self.supervisor);
    }

    fn poll_oom(&mut self) -> usize {
        let mut changed = 0;
        let snapshot: Vec<(ComponentId, u64)> = self
            .table
            .iter()
            .filter(|c| c.pid.is_some())
            .map(|c| (c.id, self.supervisor.check_oom(c)))
            .collect();

        for (id, count) in snapshot {
            let previous = *self.oom_counts.get(&id).unwrap_or(&0);
            self.oom_counts.insert(id, count);
            if count > previous {
                if let Some(component) = self.table.get_mut(id) {
                    tracing::error!(component = %component.name, oom_kills = count, "OOM kill detected, marking FAILED");
                    component.state = ComponentState::Failed;
                    component.pid = None;
                    let caps = component.provides.clone();
                    for cap in caps {
                        self.registry.withdraw(&cap);
                    }
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Reloads declarations from disk, preserving runtime state for
    /// components whose name survives, then re-registers capabilities
    /// for everything already running so the Resolver doesn't see a
    /// momentary capability gap. Mirrors `graph-resolver.c`'s inotify
    /// handler.
    fn reload(&mut self) {
        let new_components = loader::load_components(&self.config.declaration_dir, || self.table.allocate_id());
        self.table.reload(new_components);

        let carried: Vec<(ComponentId, Vec<String>)> = self
            .table
            .iter()
            .filter(|c| matches!(c.state, ComponentState::Active | ComponentState::OneshotDone))
            .map(|c| (c.id, c.provides.clone()))
            .collect();
        for (id, caps) in carried {
            for cap in caps {
                self.registry.register(&cap, id);
            }
        }

        resolver::resolve_full(&mut self.table, &mut self.registry, &self.supervisor);
    }

    fn dump_status(&self) {
        tracing::info!("-- component status dump (SIGUSR2) --");
        for component in self.table.iter() {
            tracing::info!(
                component = %component.name,
                state = component.state.as_str(),
                pid = component.pid.unwrap_or(-1),
                restarts = component.restart_count,
                "status"
            );
        }
    }

    async fn handle_control_connection(&mut self, mut stream: UnixStream) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut command = String::new();
        if let Err(err) = stream.read_to_string(&mut command).await {
            tracing::warn!(error = %err, "failed to read control command");
            return;
        }

        let mut state = ControlState {
            table: &mut self.table,
            registry: &mut self.registry,
            supervisor: &self.supervisor,
            engine: &self.engine,
            store: &self.store,
            kexec_engine: &self.kexec_engine,
            persistent_checkpoint_root: &self.config.checkpoint_var_dir,
            log_dir: &self.config.log_dir,
        };
        let response = control::dispatch(&command, &mut state).await;

        if let Err(err) = stream.write_all(response.as_bytes()).await {
            tracing::warn!(error = %err, "failed to write control response");
        }
        let _ = stream.shutdown().await;
    }

    /// SIGTERM every non-kernel component, wait out the grace period,
    /// then SIGKILL anything still alive.
    async fn shutdown(&mut self) {
        tracing::info!("sending SIGTERM to all components");
        for component in self.table.iter() {
            if component.name != "kernel" {
                self.supervisor.terminate(component, false);
            }
        }

        tokio::time::sleep(SHUTDOWN_GRACE).await;

        let mut stragglers = 0;
        for component in self.table.iter() {
            if let Some(pid) = component.pid {
                if nix::sys::signal::kill(Pid::from_raw(pid), None).is_ok() {
                    self.supervisor.terminate(component, true);
                    stragglers += 1;
                }
            }
        }
        if stragglers > 0 {
            tracing::warn!(stragglers, "SIGKILLed components that did not exit within the grace period");
        }
    }
}

fn setup_inotify(dir: &std::path::Path) -> nix::Result<AsyncFd<nix::sys::inotify::Inotify>> {
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

    std::fs::create_dir_all(dir).ok();
    let inotify = Inotify::init(InitFlags::IN_NONBLOCK)?;
    inotify.add_watch(
        dir,
        AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_DELETE | AddWatchFlags::IN_MOVED_TO,
    )?;
    AsyncFd::new(inotify).map_err(|_| nix::Error::EIO)
}

/// Awaits one readable event on the inotify fd and drains it, telling
/// the caller whether any declaration-directory event actually fired.
/// Never resolves if `fd` is `None`, so it simply drops out of
/// contention in the `select!` when the watch failed to set up.
async fn wait_inotify_readable(fd: Option<&mut AsyncFd<nix::sys::inotify::Inotify>>) -> bool {
    let Some(fd) = fd else {
        std::future::pending::<()>().await;
        return false;
    };

    match fd.readable().await {
        Ok(mut guard) => {
            let fired = matches!(guard.get_inner().read_events(), Ok(events) if !events.is_empty());
            guard.clear_ready();
            fired
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.declaration_dir = dir.join("decl.d");
        config.control_socket = dir.join("control.sock");
        config.cgroup_root = dir.join("cgroup");
        config.checkpoint_run_dir = dir.join("checkpoint-run");
        config.checkpoint_var_dir = dir.join("checkpoint-var");
        config.log_dir = dir.join("log");
        config.tick_interval = Duration::from_millis(50);
        config
    }

    #[test]
    fn new_with_no_declarations_has_only_kernel_component() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Daemon::new(test_config(dir.path())).unwrap();
        assert_eq!(daemon.table.len(), 1);
        assert!(daemon.registry.active("kernel.syscalls"));
    }

    #[test]
    fn new_rejects_a_boot_time_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let decl_dir = dir.path().join("decl.d");
        std::fs::create_dir_all(&decl_dir).unwrap();
        std::fs::write(
            decl_dir.join("a.toml"),
            r#"
            [component]
            name = "a"
            binary = "/bin/true"

            [provides]
            capabilities = ["cap.a"]

            [requires]
            capabilities = ["cap.a"]
            "#,
        )
        .unwrap();

        let result = Daemon::new(test_config(dir.path()));
        assert!(result.is_err());
    }

    #[test]
    fn reload_carries_runtime_state_forward() {
        let dir = tempfile::tempdir().unwrap();
        let decl_dir = dir.path().join("decl.d");
        std::fs::create_dir_all(&decl_dir).unwrap();
        std::fs::write(
            decl_dir.join("svc.toml"),
            r#"
            [component]
            name = "svc"
            binary = "/bin/true"
            "#,
        )
        .unwrap();

        let mut daemon = Daemon::new(test_config(dir.path())).unwrap();
        let id = daemon.table.get_by_name("svc").unwrap().id;
        if let Some(c) = daemon.table.get_mut(id) {
            c.state = ComponentState::Active;
            c.pid = Some(4242);
        }

        daemon.reload();

        let reloaded = daemon.table.get_by_name("svc").unwrap();
        assert_eq!(reloaded.state, ComponentState::Active);
        assert_eq!(reloaded.pid, Some(4242));
    }

    #[test]
    fn poll_oom_marks_failed_on_fresh_kill_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = Daemon::new(test_config(dir.path())).unwrap();

        let id = daemon.table.allocate_id();
        let mut component = crate::component::Component::new(id, "svc", "/bin/true");
        component.state = ComponentState::Active;
        component.pid = Some(4242);
        component.provides = vec!["svc.ready".to_string()];
        daemon.table.insert(component);
        daemon.registry.register("svc.ready", id);

        let cgroup_dir = daemon.config.cgroup_root.join("svc");
        std::fs::create_dir_all(&cgroup_dir).unwrap();
        std::fs::write(cgroup_dir.join("memory.events"), "oom_kill 1\n").unwrap();

        let changed = daemon.poll_oom();
        assert_eq!(changed, 1);
        assert_eq!(daemon.table.get_by_name("svc").unwrap().state, ComponentState::Failed);
        assert!(!daemon.registry.active("svc.ready"));

        // a second poll at the same count should not re-trigger
        let changed_again = daemon.poll_oom();
        assert_eq!(changed_again, 0);
    }
}
