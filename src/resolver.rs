//! Resolver — one-shot and fixed-point graph passes; the idempotent
//! driver of component state transitions.
//!
//! Grounded on `graph.c`'s `graph_resolve`/`graph_resolve_full`. This
//! is the only place INACTIVE -> STARTING is initiated.

use crate::capability::CapabilityRegistry;
use crate::component::{ComponentState, ComponentTable};
use crate::supervisor::Supervisor;
use std::time::{Duration, Instant};

/// Minimum cool-off after a FAILED component's last restart before the
/// Resolver will flip it back to INACTIVE for another attempt.
const FAILED_COOLOFF: Duration = Duration::from_secs(5);

fn requirements_met(registry: &CapabilityRegistry, requires: &[String]) -> bool {
    requires.iter().all(|cap| registry.active(cap))
}

/// True when every requirement that is currently unmet is unmet only
/// because its provider is mid-upgrade. Per DESIGN.md's resolution of
/// the cascade-suppression open question (spec.md §9), a dependent
/// must not be failed over the capability flicker an in-flight
/// checkpoint/fd-passing handoff causes; the cascade resumes normally
/// once the provider's `upgrading` flag clears (Tier 3 settles it).
fn lost_requirements_suppressed_by_upgrade(
    table: &ComponentTable,
    registry: &CapabilityRegistry,
    requires: &[String],
) -> bool {
    let unmet: Vec<&String> = requires.iter().filter(|cap| !registry.active(cap)).collect();
    if unmet.is_empty() {
        return false;
    }
    unmet.iter().all(|cap| {
        registry
            .provider(cap)
            .and_then(|id| table.get(id))
            .map(|provider| provider.upgrading)
            .unwrap_or(false)
    })
}

/// A single pass over the Component Table. Returns the number of
/// components whose state changed.
pub fn resolve(table: &mut ComponentTable, registry: &mut CapabilityRegistry, supervisor: &Supervisor) -> usize {
    let now = Instant::now();
    let ids: Vec<_> = table.iter().map(|c| c.id).collect();
    let mut changed = 0;

    for id in ids {
        // Snapshot the fields this pass needs as owned values first, so
        // no borrow of `table` survives into the branches below that
        // need their own mutable (or, for the suppression check,
        // immutable) borrow of it.
        let Some((state, requires, last_restart)) =
            table.get(id).map(|c| (c.state, c.requires.clone(), c.last_restart))
        else {
            continue;
        };

        match state {
            ComponentState::Inactive => {
                if requirements_met(registry, &requires) {
                    let component = table.get_mut(id).expect("id just snapshotted from this table");
                    supervisor.start(component);
                    changed += 1;
                }
            }
            ComponentState::ReadyWait => {
                if !requirements_met(registry, &requires)
                    && !lost_requirements_suppressed_by_upgrade(table, registry, &requires)
                {
                    let component = table.get_mut(id).expect("id just snapshotted from this table");
                    tracing::warn!(component = %component.name, "requirements lost while READY_WAIT, marking FAILED");
                    component.state = ComponentState::Failed;
                    supervisor.terminate(component, false);
                    component.pid = None;
                    changed += 1;
                }
            }
            ComponentState::Active => {
                if !requirements_met(registry, &requires)
                    && !lost_requirements_suppressed_by_upgrade(table, registry, &requires)
                {
                    let component = table.get_mut(id).expect("id just snapshotted from this table");
                    tracing::warn!(component = %component.name, "requirements lost while ACTIVE, marking FAILED");
                    component.state = ComponentState::Failed;
                    let provides = component.provides.clone();
                    for cap in provides {
                        registry.withdraw(&cap);
                    }
                    changed += 1;
                }
            }
            ComponentState::Failed => {
                let cooled_off = last_restart
                    .map(|last| now.duration_since(last) >= FAILED_COOLOFF)
                    .unwrap_or(true);
                if cooled_off && requirements_met(registry, &requires) {
                    let component = table.get_mut(id).expect("id just snapshotted from this table");
                    component.state = ComponentState::Inactive;
                    changed += 1;
                }
            }
            ComponentState::Starting | ComponentState::Degraded | ComponentState::OneshotDone => {}
        }
    }

    changed
}

/// Calls `resolve()` until a pass reports zero changes, or until the
/// iteration count exceeds 2x the component count (treated as a
/// likely cycle, logged, and aborted).
pub fn resolve_full(table: &mut ComponentTable, registry: &mut CapabilityRegistry, supervisor: &Supervisor) {
    let max_iterations = table.len().saturating_mul(2).max(1);
    let mut iterations = 0;

    loop {
        let changed = resolve(table, registry, supervisor);
        iterations += 1;
        if changed == 0 {
            break;
        }
        if iterations > max_iterations {
            tracing::error!(iterations, "resolve_full exceeded 2x component-count iterations, possible cycle; aborting pass");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupManager;
    use crate::component::{Component, ComponentId};
    use std::path::PathBuf;

    fn supervisor() -> Supervisor {
        Supervisor::new(CgroupManager::new(PathBuf::from("/tmp/graphd-test-cgroups-resolver")))
    }

    #[test]
    fn zero_components_converges_with_no_changes() {
        let mut table = ComponentTable::new();
        let mut registry = CapabilityRegistry::new();
        let sup = supervisor();
        // kernel component is already ACTIVE; nothing should change.
        let changed = resolve(&mut table, &mut registry, &sup);
        assert_eq!(changed, 0);
    }

    #[test]
    fn component_with_unsatisfiable_requirement_stays_inactive_forever() {
        let mut table = ComponentTable::new();
        let id = table.allocate_id();
        let mut comp = Component::new(id, "needs-nothing-provides", "/bin/true");
        comp.requires = vec!["cap.never-provided".to_string()];
        table.insert(comp);

        let mut registry = CapabilityRegistry::new();
        let sup = supervisor();
        resolve_full(&mut table, &mut registry, &sup);

        assert_eq!(table.get_by_name("needs-nothing-provides").unwrap().state, ComponentState::Inactive);
    }

    #[test]
    fn failed_component_does_not_reset_before_cooloff() {
        let mut table = ComponentTable::new();
        let id = table.allocate_id();
        let mut comp = Component::new(id, "recently-failed", "/bin/true");
        comp.state = ComponentState::Failed;
        comp.last_restart = Some(Instant::now());
        table.insert(comp);

        let mut registry = CapabilityRegistry::new();
        let sup = supervisor();
        resolve(&mut table, &mut registry, &sup);

        assert_eq!(table.get_by_name("recently-failed").unwrap().state, ComponentState::Failed);
    }

    #[test]
    fn failed_component_resets_to_inactive_after_cooloff() {
        let mut table = ComponentTable::new();
        let id = table.allocate_id();
        let mut comp = Component::new(id, "cooled-off", "/bin/true");
        comp.state = ComponentState::Failed;
        comp.last_restart = Some(Instant::now() - Duration::from_secs(10));
        table.insert(comp);

        let mut registry = CapabilityRegistry::new();
        let sup = supervisor();
        let changed = resolve(&mut table, &mut registry, &sup);

        assert_eq!(changed, 1);
        assert_eq!(table.get_by_name("cooled-off").unwrap().state, ComponentState::Inactive);
    }

    #[test]
    fn active_component_loses_requirement_and_withdraws() {
        let mut table = ComponentTable::new();
        let id = table.allocate_id();
        let mut comp = Component::new(id, "dependent", "/bin/true");
        comp.state = ComponentState::Active;
        comp.pid = Some(999);
        comp.requires = vec!["cap.gone".to_string()];
        comp.provides = vec!["cap.downstream".to_string()];
        table.insert(comp);

        let mut registry = CapabilityRegistry::new();
        // cap.gone is not registered as active.
        let sup = supervisor();
        let changed = resolve(&mut table, &mut registry, &sup);

        assert_eq!(changed, 1);
        assert_eq!(table.get_by_name("dependent").unwrap().state, ComponentState::Failed);
        assert!(!registry.active("cap.downstream"));
    }

    #[test]
    fn active_dependent_is_not_failed_while_provider_is_upgrading() {
        let mut table = ComponentTable::new();
        let provider_id = table.allocate_id();
        let mut provider = Component::new(provider_id, "provider", "/bin/true");
        provider.state = ComponentState::Active;
        provider.provides = vec!["cap.provided".to_string()];
        provider.upgrading = true;
        table.insert(provider);

        let dependent_id = table.allocate_id();
        let mut dependent = Component::new(dependent_id, "dependent", "/bin/true");
        dependent.state = ComponentState::Active;
        dependent.pid = Some(999);
        dependent.requires = vec!["cap.provided".to_string()];
        table.insert(dependent);

        let mut registry = CapabilityRegistry::new();
        registry.register("cap.provided", provider_id);
        registry.withdraw("cap.provided");

        let sup = supervisor();
        let changed = resolve(&mut table, &mut registry, &sup);

        assert_eq!(changed, 0);
        assert_eq!(table.get_by_name("dependent").unwrap().state, ComponentState::Active);

        // once the upgrade settles, the cascade resumes normally.
        table.get_by_name_mut("provider").unwrap().upgrading = false;
        let changed = resolve(&mut table, &mut registry, &sup);
        assert_eq!(changed, 1);
        assert_eq!(table.get_by_name("dependent").unwrap().state, ComponentState::Failed);
    }
}
