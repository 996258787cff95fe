//! Component Table — declarative component records plus runtime
//! fields (state, pid, counters, timers).
//!
//! Grounded on `component.c`'s `component_t` and the declaration
//! schema in spec.md §6. A synthetic "kernel" component is always
//! present at slot 0 with state ACTIVE, matching
//! `register_early_capabilities()` in `graph-resolver.c`/`component.c`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Stable index into the Component Table, assigned at load time and
/// never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Service,
    Oneshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Inactive,
    Starting,
    ReadyWait,
    Active,
    Degraded,
    Failed,
    OneshotDone,
}

impl ComponentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentState::Inactive => "INACTIVE",
            ComponentState::Starting => "STARTING",
            ComponentState::ReadyWait => "READY_WAIT",
            ComponentState::Active => "ACTIVE",
            ComponentState::Degraded => "DEGRADED",
            ComponentState::Failed => "FAILED",
            ComponentState::OneshotDone => "ONESHOT_DONE",
        }
    }

    /// True for states in which the Component Table invariant requires
    /// a pid to be set (spec.md §8 universal invariants).
    pub fn expects_pid(&self) -> bool {
        matches!(
            self,
            ComponentState::Starting
                | ComponentState::ReadyWait
                | ComponentState::Active
                | ComponentState::Degraded
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessMethod {
    None,
    File(String),
    Command { check: String, interval: Duration },
    Signal(i32),
}

impl ReadinessMethod {
    pub fn label(&self) -> &'static str {
        match self {
            ReadinessMethod::None => "none",
            ReadinessMethod::File(_) => "file",
            ReadinessMethod::Command { .. } => "command",
            ReadinessMethod::Signal(_) => "signal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    pub command: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
    pub restart_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            failure_threshold: 3,
            restart_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeHandoff {
    None,
    FdPassing,
    Checkpoint,
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointPolicy {
    pub enabled: bool,
    pub preserve_fds: Vec<i32>,
    pub leave_running: bool,
    pub memory_estimate_bytes: Option<u64>,
    pub max_age_hours: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Mount,
    Pid,
    Net,
    Uts,
    Ipc,
    User,
}

#[derive(Debug, Clone, Default)]
pub struct IsolationConfig {
    pub namespaces: Vec<Namespace>,
    pub root: Option<String>,
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    pub cgroup_subpath: Option<String>,
    pub memory_max: Option<u64>,
    pub memory_high: Option<u64>,
    pub cpu_weight: Option<u32>,
    pub cpu_max: Option<String>,
    pub io_weight: Option<u32>,
    pub pids_max: Option<u32>,
}

/// A single component record: declarative fields from its
/// declaration, plus runtime fields mutated by the Supervisor,
/// Resolver, Readiness, and Health subsystems.
#[derive(Debug, Clone)]
pub struct Component {
    pub id: ComponentId,
    // -- declarative --
    pub name: String,
    pub binary: String,
    pub args: Vec<String>,
    pub kind: ComponentKind,
    pub requires: Vec<String>,
    pub provides: Vec<String>,
    pub optional: Vec<String>,
    pub reload_signal: Option<i32>,
    pub readiness: ReadinessMethod,
    pub readiness_timeout: Duration,
    pub health: Option<HealthConfig>,
    pub resources: ResourceLimits,
    pub isolation: IsolationConfig,
    pub upgrade_handoff: UpgradeHandoff,
    pub checkpoint_policy: CheckpointPolicy,

    // -- runtime --
    pub state: ComponentState,
    pub pid: Option<i32>,
    pub restart_count: u32,
    pub last_restart: Option<Instant>,
    pub ready_wait_start: Option<Instant>,
    pub consecutive_health_failures: u32,
    pub last_health_check: Option<Instant>,
    /// Set while an upgrade attempt is in flight for this component, so
    /// the Resolver suppresses cascade failure on capability loss (see
    /// DESIGN.md's resolution of the spec's cascade-suppression open
    /// question).
    pub upgrading: bool,
}

impl Component {
    /// A zero-configured Inactive component, the usual starting point
    /// for both the loader and tests.
    pub fn new(id: ComponentId, name: impl Into<String>, binary: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            binary: binary.into(),
            args: Vec::new(),
            kind: ComponentKind::Service,
            requires: Vec::new(),
            provides: Vec::new(),
            optional: Vec::new(),
            reload_signal: None,
            readiness: ReadinessMethod::None,
            readiness_timeout: Duration::from_secs(30),
            health: None,
            resources: ResourceLimits::default(),
            isolation: IsolationConfig::default(),
            upgrade_handoff: UpgradeHandoff::None,
            checkpoint_policy: CheckpointPolicy::default(),
            state: ComponentState::Inactive,
            pid: None,
            restart_count: 0,
            last_restart: None,
            ready_wait_start: None,
            consecutive_health_failures: 0,
            last_health_check: None,
            upgrading: false,
        }
    }

    /// The synthetic "kernel" component registered at boot, providing
    /// the built-in capability set. Grounded on
    /// `register_early_capabilities()` in the original C sources.
    pub fn synthetic_kernel(id: ComponentId) -> Self {
        let mut comp = Self::new(id, "kernel", "[kernel]");
        comp.kind = ComponentKind::Service;
        comp.state = ComponentState::Active;
        comp.pid = Some(0);
        comp.provides = vec![
            "kernel.syscalls".to_string(),
            "kernel.memory".to_string(),
            "kernel.scheduling".to_string(),
            "filesystem.proc".to_string(),
            "filesystem.sys".to_string(),
            "filesystem.dev".to_string(),
            "filesystem.run".to_string(),
            "filesystem.devpts".to_string(),
        ];
        comp
    }

    /// Copy runtime fields from a prior incarnation of this component
    /// across a declaration reload, per spec.md §4.2: "runtime fields
    /// (pid, state, counters) are copied over for components whose
    /// names survive."
    pub fn carry_runtime_from(&mut self, previous: &Component) {
        self.state = previous.state;
        self.pid = previous.pid;
        self.restart_count = previous.restart_count;
        self.last_restart = previous.last_restart;
        self.ready_wait_start = previous.ready_wait_start;
        self.consecutive_health_failures = previous.consecutive_health_failures;
        self.last_health_check = previous.last_health_check;
        self.upgrading = previous.upgrading;
    }
}

/// Declarative component records in insertion order. At most one
/// record has a given pid at any time; no two records share a name.
#[derive(Debug, Default)]
pub struct ComponentTable {
    components: Vec<Component>,
    by_name: HashMap<String, ComponentId>,
    next_id: u32,
}

impl ComponentTable {
    pub fn new() -> Self {
        let mut table = Self::default();
        let kernel_id = table.next_id();
        table.insert(Component::synthetic_kernel(kernel_id));
        table
    }

    fn next_id(&mut self) -> ComponentId {
        let id = ComponentId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn allocate_id(&mut self) -> ComponentId {
        self.next_id()
    }

    pub fn insert(&mut self, component: Component) {
        self.by_name.insert(component.name.clone(), component.id);
        self.components.push(component);
    }

    pub fn get(&self, id: ComponentId) -> Option<&Component> {
        self.components.iter().find(|c| c.id == id)
    }

    pub fn get_mut(&mut self, id: ComponentId) -> Option<&mut Component> {
        self.components.iter_mut().find(|c| c.id == id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Component> {
        self.by_name.get(name).and_then(|id| self.get(*id))
    }

    pub fn get_by_name_mut(&mut self, name: &str) -> Option<&mut Component> {
        let id = *self.by_name.get(name)?;
        self.get_mut(id)
    }

    pub fn get_by_pid(&self, pid: i32) -> Option<&Component> {
        self.components.iter().find(|c| c.pid == Some(pid))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.components.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Component> {
        self.components.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Rebuild from a freshly-loaded set of declarations, preserving
    /// runtime fields (pid/state/counters) for components whose name
    /// survives, and keeping the synthetic kernel component untouched.
    /// Mirrors `graph-resolver.c`'s inotify reload handler, which
    /// saves pid/state/name per component before reload and restores
    /// them by name match afterward.
    pub fn reload(&mut self, mut new_components: Vec<Component>) {
        let kernel = self.components[0].clone();

        for comp in new_components.iter_mut() {
            if let Some(previous) = self.by_name.get(&comp.name).and_then(|id| self.get(*id)) {
                comp.carry_runtime_from(previous);
            }
        }

        self.components.clear();
        self.by_name.clear();
        self.components.push(kernel.clone());
        self.by_name.insert(kernel.name.clone(), kernel.id);

        for comp in new_components {
            self.by_name.insert(comp.name.clone(), comp.id);
            self.components.push(comp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_table_has_synthetic_kernel_active() {
        let table = ComponentTable::new();
        assert_eq!(table.len(), 1);
        let kernel = table.get_by_name("kernel").unwrap();
        assert_eq!(kernel.state, ComponentState::Active);
        assert!(kernel.provides.contains(&"kernel.syscalls".to_string()));
    }

    #[test]
    fn insert_and_lookup_by_name_and_id() {
        let mut table = ComponentTable::new();
        let id = table.allocate_id();
        table.insert(Component::new(id, "nginx", "/usr/sbin/nginx"));
        assert!(table.get_by_name("nginx").is_some());
        assert!(table.get(id).is_some());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn reload_preserves_runtime_fields_for_surviving_names() {
        let mut table = ComponentTable::new();
        let id = table.allocate_id();
        let mut comp = Component::new(id, "nginx", "/usr/sbin/nginx");
        comp.state = ComponentState::Active;
        comp.pid = Some(1234);
        comp.restart_count = 2;
        table.insert(comp);

        let new_id = ComponentId(99);
        let fresh = Component::new(new_id, "nginx", "/usr/sbin/nginx");
        table.reload(vec![fresh]);

        let reloaded = table.get_by_name("nginx").unwrap();
        assert_eq!(reloaded.state, ComponentState::Active);
        assert_eq!(reloaded.pid, Some(1234));
        assert_eq!(reloaded.restart_count, 2);
    }

    #[test]
    fn reload_drops_components_whose_name_disappeared() {
        let mut table = ComponentTable::new();
        let id = table.allocate_id();
        table.insert(Component::new(id, "old-service", "/bin/old"));
        table.reload(vec![]);
        assert!(table.get_by_name("old-service").is_none());
        assert_eq!(table.len(), 1); // just the kernel component
    }

    #[test]
    fn expects_pid_matches_universal_invariant() {
        assert!(ComponentState::Active.expects_pid());
        assert!(ComponentState::ReadyWait.expects_pid());
        assert!(!ComponentState::Inactive.expects_pid());
        assert!(!ComponentState::Failed.expects_pid());
        assert!(!ComponentState::OneshotDone.expects_pid());
    }
}
