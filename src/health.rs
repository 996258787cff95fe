//! Health Monitor — periodic health probe with DEGRADED/FAILED
//! threshold transitions.
//!
//! Grounded on spec.md §4.5 (the original C conflates health with the
//! restart-rate limiter in `component_start`; this spec splits them,
//! so there is no direct single-function C counterpart for this
//! module). Default thresholds F=3/R=5 and intervals come from
//! spec.md §4.5 directly.

use crate::capability::CapabilityRegistry;
use crate::component::{Component, ComponentState, ComponentTable};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    StayActive,
    BecomeDegraded,
    RecoverToActive,
    BecomeFailed,
    NoChange,
}

/// Applies one health-check result to a component's counters and
/// returns the resulting transition, without touching the
/// registry — callers (tests, `run_pass`) apply registry side effects
/// based on the returned variant.
pub fn apply_result(component: &mut Component, passed: bool) -> HealthTransition {
    let Some(health) = component.health.clone() else {
        return HealthTransition::NoChange;
    };

    match (component.state, passed) {
        (ComponentState::Active, true) => {
            component.consecutive_health_failures = 0;
            HealthTransition::StayActive
        }
        (ComponentState::Active, false) => {
            component.consecutive_health_failures += 1;
            if component.consecutive_health_failures >= health.failure_threshold {
                component.state = ComponentState::Degraded;
                component.consecutive_health_failures = 0;
                HealthTransition::BecomeDegraded
            } else {
                HealthTransition::NoChange
            }
        }
        (ComponentState::Degraded, true) => {
            component.consecutive_health_failures = 0;
            component.state = ComponentState::Active;
            HealthTransition::RecoverToActive
        }
        (ComponentState::Degraded, false) => {
            component.consecutive_health_failures += 1;
            if component.consecutive_health_failures >= health.restart_threshold {
                component.state = ComponentState::Failed;
                component.consecutive_health_failures = 0;
                component.pid = None;
                HealthTransition::BecomeFailed
            } else {
                HealthTransition::NoChange
            }
        }
        _ => HealthTransition::NoChange,
    }
}

async fn run_health_command(command: &str, timeout: std::time::Duration) -> bool {
    let child = tokio::process::Command::new("/bin/sh").arg("-c").arg(command).status();
    match tokio::time::timeout(timeout, child).await {
        Ok(Ok(status)) => status.success(),
        // a timeout on the health command counts as a failure, same as
        // a non-zero exit.
        Ok(Err(_)) | Err(_) => false,
    }
}

/// Runs one health pass over every ACTIVE/DEGRADED component that
/// declares a health command whose interval has elapsed, applying
/// transitions to both the table and the capability registry.
pub async fn run_pass(table: &mut ComponentTable, registry: &mut CapabilityRegistry) -> usize {
    let now = Instant::now();
    let candidates: Vec<_> = table
        .iter()
        .filter(|c| matches!(c.state, ComponentState::Active | ComponentState::Degraded))
        .filter_map(|c| {
            let health = c.health.clone()?;
            let due = c
                .last_health_check
                .map(|last| now.duration_since(last) >= health.interval)
                .unwrap_or(true);
            due.then(|| (c.id, health))
        })
        .collect();

    let mut changed = 0;

    for (id, health) in candidates {
        let passed = run_health_command(&health.command, health.timeout).await;

        let Some(component) = table.get_mut(id) else { continue };
        component.last_health_check = Some(now);
        let provides = component.provides.clone();
        let name = component.name.clone();
        let pid = component.pid;
        let transition = apply_result(component, passed);

        match transition {
            HealthTransition::BecomeDegraded => {
                tracing::warn!(component = %name, "health check failures exceeded threshold, marking DEGRADED");
                for cap in &provides {
                    registry.mark_degraded(cap, true);
                }
                changed += 1;
            }
            HealthTransition::RecoverToActive => {
                tracing::info!(component = %name, "health check recovered, back to ACTIVE");
                for cap in &provides {
                    registry.mark_degraded(cap, false);
                }
                changed += 1;
            }
            HealthTransition::BecomeFailed => {
                tracing::error!(component = %name, "health restart threshold exceeded, marking FAILED");
                for cap in &provides {
                    registry.withdraw(cap);
                }
                if let Some(pid) = pid {
                    let _ = nix::sys::signal::kill(
                        nix::unistd::Pid::from_raw(pid),
                        nix::sys::signal::Signal::SIGTERM,
                    );
                }
                changed += 1;
            }
            HealthTransition::StayActive | HealthTransition::NoChange => {}
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentId, HealthConfig};

    fn active_with_health() -> Component {
        let mut c = Component::new(ComponentId(1), "svc", "/bin/true");
        c.state = ComponentState::Active;
        c.health = Some(HealthConfig::default());
        c
    }

    #[test]
    fn three_failures_degrade() {
        let mut c = active_with_health();
        assert_eq!(apply_result(&mut c, false), HealthTransition::NoChange);
        assert_eq!(apply_result(&mut c, false), HealthTransition::NoChange);
        assert_eq!(apply_result(&mut c, false), HealthTransition::BecomeDegraded);
        assert_eq!(c.state, ComponentState::Degraded);
    }

    #[test]
    fn pass_resets_failure_counter() {
        let mut c = active_with_health();
        apply_result(&mut c, false);
        apply_result(&mut c, false);
        assert_eq!(apply_result(&mut c, true), HealthTransition::StayActive);
        assert_eq!(c.consecutive_health_failures, 0);
    }

    #[test]
    fn degraded_then_five_more_failures_is_failed() {
        let mut c = active_with_health();
        for _ in 0..3 {
            apply_result(&mut c, false);
        }
        assert_eq!(c.state, ComponentState::Degraded);
        for _ in 0..4 {
            assert_eq!(apply_result(&mut c, false), HealthTransition::NoChange);
        }
        assert_eq!(apply_result(&mut c, false), HealthTransition::BecomeFailed);
        assert_eq!(c.state, ComponentState::Failed);
        assert_eq!(c.consecutive_health_failures, 0);
        assert_eq!(c.pid, None);
    }

    #[test]
    fn degraded_recovers_to_active() {
        let mut c = active_with_health();
        for _ in 0..3 {
            apply_result(&mut c, false);
        }
        assert_eq!(apply_result(&mut c, true), HealthTransition::RecoverToActive);
        assert_eq!(c.state, ComponentState::Active);
    }

    #[tokio::test]
    async fn run_health_command_timeout_counts_as_failure() {
        let passed = run_health_command("sleep 5", std::time::Duration::from_millis(50)).await;
        assert!(!passed);
    }
}
