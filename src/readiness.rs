//! Readiness Monitor — polls file/command/signal predicates while
//! components sit in READY_WAIT.
//!
//! Grounded on `component.c`'s `check_readiness_file`,
//! `execute_readiness_check`, and `check_all_readiness`.

use crate::capability::CapabilityRegistry;
use crate::component::{ComponentState, ComponentTable, ReadinessMethod};
use crate::supervisor::Supervisor;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessOutcome {
    StillWaiting,
    TimedOut,
    BecameReady,
}

/// Evaluates the readiness predicate for file/command methods. Signal
/// readiness is not polled here — it's driven by the signal handler
/// in the event loop directly flipping the component to ACTIVE.
async fn evaluate_predicate(method: &ReadinessMethod) -> bool {
    match method {
        ReadinessMethod::None => true,
        ReadinessMethod::File(path) => tokio::fs::metadata(path).await.is_ok(),
        ReadinessMethod::Command { check, interval: _ } => {
            match tokio::process::Command::new("/bin/sh")
                .arg("-c")
                .arg(check)
                .status()
                .await
            {
                Ok(status) => status.success(),
                Err(_) => false,
            }
        }
        ReadinessMethod::Signal(_) => false,
    }
}

/// Evaluates one component currently in READY_WAIT. Returns whether it
/// timed out, became ready, or should keep waiting. Does not mutate
/// the component — callers apply the resulting transition so this
/// stays easily testable without an async table borrow.
pub async fn check_one(
    readiness: &ReadinessMethod,
    timeout: Duration,
    ready_wait_start: Instant,
    now: Instant,
) -> ReadinessOutcome {
    if now.duration_since(ready_wait_start) > timeout {
        return ReadinessOutcome::TimedOut;
    }
    if evaluate_predicate(readiness).await {
        ReadinessOutcome::BecameReady
    } else {
        ReadinessOutcome::StillWaiting
    }
}

/// Runs a readiness pass over every component in READY_WAIT, applying
/// the outcome directly to the table and registry. Returns the number
/// of components whose state changed, for the event loop's
/// changed-since-last-wake bookkeeping.
pub async fn run_pass(
    table: &mut ComponentTable,
    registry: &mut CapabilityRegistry,
    supervisor: &Supervisor,
) -> usize {
    let now = Instant::now();
    let candidates: Vec<_> = table
        .iter()
        .filter(|c| c.state == ComponentState::ReadyWait)
        .map(|c| (c.id, c.readiness.clone(), c.readiness_timeout, c.ready_wait_start))
        .collect();

    let mut changed = 0;

    for (id, method, timeout, ready_wait_start) in candidates {
        let Some(start) = ready_wait_start else { continue };
        let outcome = check_one(&method, timeout, start, now).await;

        match outcome {
            ReadinessOutcome::StillWaiting => {}
            ReadinessOutcome::TimedOut => {
                if let Some(comp) = table.get_mut(id) {
                    tracing::error!(component = %comp.name, "readiness timeout, marking FAILED");
                    supervisor.terminate(comp, false);
                    comp.state = ComponentState::Failed;
                    comp.pid = None;
                }
                changed += 1;
            }
            ReadinessOutcome::BecameReady => {
                if let Some(comp) = table.get_mut(id) {
                    let elapsed = now.duration_since(start);
                    tracing::info!(component = %comp.name, waited = ?elapsed, "component became ready");
                    comp.state = ComponentState::Active;
                    let provides = comp.provides.clone();
                    let comp_id = comp.id;
                    for capability in provides {
                        registry.register(&capability, comp_id);
                    }
                }
                changed += 1;
            }
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityRegistry;
    use crate::cgroup::CgroupManager;
    use crate::component::{Component, ComponentId, ComponentTable};
    use std::path::PathBuf;

    fn supervisor() -> Supervisor {
        Supervisor::new(CgroupManager::new(PathBuf::from("/tmp/graphd-test-cgroups-readiness")))
    }

    #[tokio::test]
    async fn timed_out_component_is_terminated_and_loses_its_pid() {
        let mut table = ComponentTable::new();
        let id = table.allocate_id();
        let mut comp = Component::new(id, "waiting", "/bin/true");
        comp.state = ComponentState::ReadyWait;
        comp.pid = Some(999_999);
        comp.readiness = ReadinessMethod::File("/nonexistent/path/ready".to_string());
        comp.readiness_timeout = Duration::from_secs(30);
        comp.ready_wait_start = Some(Instant::now() - Duration::from_secs(60));
        table.insert(comp);

        let mut registry = CapabilityRegistry::new();
        let sup = supervisor();
        let changed = run_pass(&mut table, &mut registry, &sup).await;

        assert_eq!(changed, 1);
        let comp = table.get_by_name("waiting").unwrap();
        assert_eq!(comp.state, ComponentState::Failed);
        assert_eq!(comp.pid, None);
    }

    #[tokio::test]
    async fn none_method_is_always_ready() {
        let outcome = check_one(
            &ReadinessMethod::None,
            Duration::from_secs(30),
            Instant::now(),
            Instant::now(),
        )
        .await;
        assert_eq!(outcome, ReadinessOutcome::BecameReady);
    }

    #[tokio::test]
    async fn timeout_elapsed_overrides_predicate() {
        let start = Instant::now() - Duration::from_secs(60);
        let outcome = check_one(
            &ReadinessMethod::File("/nonexistent/path/ready".to_string()),
            Duration::from_secs(30),
            start,
            Instant::now(),
        )
        .await;
        assert_eq!(outcome, ReadinessOutcome::TimedOut);
    }

    #[tokio::test]
    async fn missing_file_still_waiting_within_timeout() {
        let outcome = check_one(
            &ReadinessMethod::File("/nonexistent/path/ready".to_string()),
            Duration::from_secs(30),
            Instant::now(),
            Instant::now(),
        )
        .await;
        assert_eq!(outcome, ReadinessOutcome::StillWaiting);
    }

    #[tokio::test]
    async fn existing_file_becomes_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready");
        std::fs::write(&path, b"").unwrap();
        let outcome = check_one(
            &ReadinessMethod::File(path.to_string_lossy().to_string()),
            Duration::from_secs(30),
            Instant::now(),
            Instant::now(),
        )
        .await;
        assert_eq!(outcome, ReadinessOutcome::BecameReady);
    }

    #[tokio::test]
    async fn command_predicate_runs_in_shell() {
        let outcome = check_one(
            &ReadinessMethod::Command { check: "true".to_string(), interval: Duration::from_secs(1) },
            Duration::from_secs(30),
            Instant::now(),
            Instant::now(),
        )
        .await;
        assert_eq!(outcome, ReadinessOutcome::BecameReady);

        let outcome = check_one(
            &ReadinessMethod::Command { check: "false".to_string(), interval: Duration::from_secs(1) },
            Duration::from_secs(30),
            Instant::now(),
            Instant::now(),
        )
        .await;
        assert_eq!(outcome, ReadinessOutcome::StillWaiting);
    }
}
