//! Control-channel command grammar — one newline-terminated text
//! command per connection, a text response, connection closes.
//!
//! Grounded on `control.c`'s `handle_control_command` (the `status`/
//! `readiness`/`check-readiness` formatting below mirrors its output
//! shape closely) and `graphctl.c`'s command list for the rest of the
//! vocabulary it didn't implement. `enhanced-graphctl.c` was treated
//! as non-authoritative polish over the base protocol already
//! specified in full elsewhere, not as a second source of truth.

use crate::capability::CapabilityRegistry;
use crate::checkpoint::{CheckpointEngine, CheckpointStore};
use crate::component::{ComponentState, ComponentTable};
use crate::graph::{self, DependencyGraph};
use crate::kexec::{self, KexecEngine, KexecOptions};
use crate::readiness;
use crate::supervisor::Supervisor;
use crate::upgrade;
use std::path::Path;

/// Everything a command might need. Borrowed for the duration of one
/// dispatch call; the event loop owns all of it.
pub struct ControlState<'a> {
    pub table: &'a mut ComponentTable,
    pub registry: &'a mut CapabilityRegistry,
    pub supervisor: &'a Supervisor,
    pub engine: &'a CheckpointEngine,
    pub store: &'a CheckpointStore,
    pub kexec_engine: &'a KexecEngine,
    pub persistent_checkpoint_root: &'a Path,
    pub log_dir: &'a Path,
}

/// Parses and executes one command line, returning the full response
/// text (always newline-terminated). Unknown commands get a usage
/// hint rather than an error, matching the original's behaviour.
pub async fn dispatch(line: &str, state: &mut ControlState<'_>) -> String {
    let line = line.trim();
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return usage();
    };
    let rest: Vec<&str> = parts.collect();

    match verb {
        "status" => status(state.table),
        "caps" => caps(state.registry),
        "tree" => match rest.first() {
            Some(name) => tree(state.table, name),
            None => "usage: tree <component>\n".to_string(),
        },
        "rdeps" => match rest.first() {
            Some(cap) => rdeps(state.table, cap),
            None => "usage: rdeps <capability>\n".to_string(),
        },
        "simulate" if rest.first() == Some(&"remove") => match rest.get(1) {
            Some(name) => simulate_remove(state.table, name),
            None => "usage: simulate remove <component>\n".to_string(),
        },
        "dot" => dot(state.table),
        "log" => match rest.first() {
            Some(name) => {
                let lines: usize = rest.get(1).and_then(|n| n.parse().ok()).unwrap_or(50);
                tail_log(state.log_dir, name, lines)
            }
            None => "usage: log <component> [lines]\n".to_string(),
        },
        "readiness" => readiness_status(state.table),
        "check-readiness" => {
            check_readiness(state.table, state.registry, state.supervisor, rest.first().copied()).await
        }
        "upgrade" => match rest.first() {
            Some(name) => do_upgrade(name, state).await,
            None => "usage: upgrade <component>\n".to_string(),
        },
        "checkpoint" => match rest.first() {
            Some(name) => do_checkpoint(name, state).await,
            None => "usage: checkpoint <component>\n".to_string(),
        },
        "restore" => match rest.first() {
            Some(name) => {
                let id: Option<u64> = rest.get(1).and_then(|s| s.parse().ok());
                do_restore(name, id, state).await
            }
            None => "usage: restore <component> [id]\n".to_string(),
        },
        "checkpoint-list" => checkpoint_list(state.store, rest.first().copied(), state.table),
        "checkpoint-rm" => match (rest.first(), rest.get(1).and_then(|s| s.parse::<u64>().ok())) {
            (Some(name), Some(id)) => checkpoint_rm(state.store, name, id),
            _ => "usage: checkpoint-rm <component> <id>\n".to_string(),
        },
        "migrate" => match rest.first() {
            Some(name) => migrate(state.store, name),
            None => "usage: migrate <component>\n".to_string(),
        },
        "check-cycles" => check_cycles(state.table),
        "analyze" => analyze(state.table),
        "validate" => validate(state.table),
        "path" => match (rest.first(), rest.get(1)) {
            (Some(from), Some(to)) => path(state.table, from, to),
            _ => "usage: path <cap1> <cap2>\n".to_string(),
        },
        "scc" => scc(state.table),
        "kexec" => do_kexec(&rest, state).await,
        _ => usage(),
    }
}

fn usage() -> String {
    "Unknown command.\nAvailable commands: status, caps, tree <component>, rdeps <capability>, \
     simulate remove <component>, dot, log <component> [lines], readiness, \
     check-readiness [component], upgrade <component>, checkpoint <component>, \
     restore <component> [id], checkpoint-list [component], checkpoint-rm <component> <id>, \
     migrate <component>, check-cycles, analyze, validate, path <cap1> <cap2>, scc, \
     kexec [--dry-run] <kernel> [--initrd <p>] [--append \"<cmdline>\"]\n"
        .to_string()
}

fn status(table: &ComponentTable) -> String {
    let mut out = String::from("graphd status:\n");
    for comp in table.iter() {
        out.push_str(&format!("  {}: {} (pid {})", comp.name, comp.state.as_str(), comp.pid.unwrap_or(-1)));
        if comp.readiness.label() != "none" {
            out.push_str(&format!(" [readiness:{},timeout:{}s]", comp.readiness.label(), comp.readiness_timeout.as_secs()));
            if comp.state == ComponentState::ReadyWait {
                if let Some(start) = comp.ready_wait_start {
                    out.push_str(&format!(" [waiting:{}s]", start.elapsed().as_secs()));
                }
            }
        }
        out.push('\n');
    }
    out
}

fn caps(registry: &CapabilityRegistry) -> String {
    let mut out = String::from("capabilities:\n");
    for entry in registry.iter() {
        let flag = if entry.active { "UP" } else { "DOWN" };
        let degraded = if entry.degraded { " [DEGRADED]" } else { "" };
        out.push_str(&format!("  {}: {}{}\n", entry.name, flag, degraded));
    }
    out
}

fn tree(table: &ComponentTable, name: &str) -> String {
    let Some(root) = table.get_by_name(name) else {
        return format!("unknown component {name:?}\n");
    };
    let mut out = format!("{name}\n");
    render_tree(table, &root.requires, 1, &mut out);
    out
}

fn render_tree(table: &ComponentTable, requires: &[String], depth: usize, out: &mut String) {
    for cap in requires {
        let indent = "  ".repeat(depth);
        match table.iter().find(|c| c.provides.iter().any(|p| p == cap)) {
            Some(provider) => {
                out.push_str(&format!("{indent}{cap} <- {} ({})\n", provider.name, provider.state.as_str()));
                if depth < 16 {
                    render_tree(table, &provider.requires, depth + 1, out);
                }
            }
            None => out.push_str(&format!("{indent}{cap} <- (no provider)\n")),
        }
    }
}

fn rdeps(table: &ComponentTable, capability: &str) -> String {
    let mut out = format!("dependents of {capability}:\n");
    let mut found = false;
    for comp in table.iter() {
        if comp.requires.iter().any(|r| r == capability) {
            out.push_str(&format!("  {}\n", comp.name));
            found = true;
        }
    }
    if !found {
        out.push_str("  (none)\n");
    }
    out
}

/// Reports which ACTIVE components would lose requirements (and
/// therefore go FAILED) if `name` stopped providing its capabilities,
/// without mutating any state — a pure what-if over the current table.
fn simulate_remove(table: &ComponentTable, name: &str) -> String {
    let Some(target) = table.get_by_name(name) else {
        return format!("unknown component {name:?}\n");
    };
    let provides = target.provides.clone();

    let mut affected = Vec::new();
    let mut frontier: Vec<String> = provides;
    let mut seen_components = std::collections::HashSet::new();
    seen_components.insert(name.to_string());

    loop {
        let mut next_frontier = Vec::new();
        for comp in table.iter() {
            if seen_components.contains(&comp.name) {
                continue;
            }
            if comp.requires.iter().any(|r| frontier.contains(r)) {
                affected.push(comp.name.clone());
                seen_components.insert(comp.name.clone());
                next_frontier.extend(comp.provides.clone());
            }
        }
        if next_frontier.is_empty() {
            break;
        }
        frontier = next_frontier;
    }

    if affected.is_empty() {
        format!("removing {name} would affect no other component\n")
    } else {
        format!("removing {name} would cascade-fail: {}\n", affected.join(", "))
    }
}

fn dot(table: &ComponentTable) -> String {
    let mut out = String::from("digraph graphd {\n");
    for comp in table.iter() {
        out.push_str(&format!("  \"{}\" [label=\"{}\\n{}\"];\n", comp.name, comp.name, comp.state.as_str()));
    }
    for comp in table.iter() {
        for requirement in &comp.requires {
            if let Some(provider) = table.iter().find(|c| c.provides.iter().any(|p| p == requirement)) {
                out.push_str(&format!("  \"{}\" -> \"{}\" [label=\"{}\"];\n", comp.name, provider.name, requirement));
            }
        }
    }
    out.push_str("}\n");
    out
}

fn tail_log(log_dir: &Path, component: &str, lines: usize) -> String {
    let path = log_dir.join(format!("{component}.log"));
    let Ok(content) = std::fs::read_to_string(&path) else {
        return format!("no log for {component}\n");
    };
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n") + "\n"
}

fn readiness_status(table: &ComponentTable) -> String {
    let mut out = String::from("readiness status:\n");
    let mut waiting = 0;
    let mut ready = 0;
    let mut failed = 0;

    for comp in table.iter() {
        if comp.readiness.label() == "none" {
            continue;
        }
        out.push_str(&format!("  {}: method={}, timeout={}s", comp.name, comp.readiness.label(), comp.readiness_timeout.as_secs()));
        match comp.state {
            ComponentState::ReadyWait => {
                waiting += 1;
                if let Some(start) = comp.ready_wait_start {
                    out.push_str(&format!(" [WAITING {}s]", start.elapsed().as_secs()));
                } else {
                    out.push_str(" [WAITING]");
                }
            }
            ComponentState::Active => {
                ready += 1;
                out.push_str(" [READY]");
            }
            ComponentState::Failed => {
                failed += 1;
                out.push_str(" [FAILED/TIMEOUT]");
            }
            other => out.push_str(&format!(" [{}]", other.as_str())),
        }
        out.push('\n');
    }

    out.push_str(&format!("\nsummary: {ready} ready, {waiting} waiting, {failed} failed/timeout\n"));
    out
}

/// Triggers a readiness pass over every READY_WAIT component,
/// regardless of `filter`, matching the original's "name is only used
/// for the response text, the trigger is always global" behaviour.
async fn check_readiness(
    table: &mut ComponentTable,
    registry: &mut CapabilityRegistry,
    supervisor: &Supervisor,
    filter: Option<&str>,
) -> String {
    let checked = table.iter().filter(|c| c.state == ComponentState::ReadyWait).count();
    if checked > 0 {
        readiness::run_pass(table, registry, supervisor).await;
    }
    match filter {
        Some(name) => format!("readiness check triggered for component {name:?}\n"),
        None => format!("readiness checks triggered for {checked} component(s)\n"),
    }
}

async fn do_upgrade(name: &str, state: &mut ControlState<'_>) -> String {
    match upgrade::upgrade(name, state.table, state.registry, state.supervisor, state.engine, state.store).await {
        Ok(outcome) => format!(
            "upgrade of {name} succeeded via {:?} (old pid {:?}, new pid {:?})\n",
            outcome.tier, outcome.old_pid, outcome.new_pid
        ),
        Err(err) => format!("upgrade of {name} failed: {err}\n"),
    }
}

async fn do_checkpoint(name: &str, state: &mut ControlState<'_>) -> String {
    let Some(component) = state.table.get_by_name(name) else {
        return format!("unknown component {name:?}\n");
    };
    let Some(pid) = component.pid else {
        return format!("{name} has no running pid to checkpoint\n");
    };
    if !state.engine.is_supported() {
        return "checkpoint engine not available on this system\n".to_string();
    }

    let (dir, metadata) = match state.store.allocate_with_metadata(
        name,
        pid,
        true,
        component.checkpoint_policy.leave_running,
        &component.provides,
        "",
        &component.checkpoint_policy.preserve_fds,
    ) {
        Ok(v) => v,
        Err(err) => return format!("checkpoint allocation failed: {err}\n"),
    };

    match state.engine.checkpoint(pid, &dir, component.checkpoint_policy.leave_running).await {
        Ok(()) => {
            let _ = state.store.record_image_size(&dir);
            format!("checkpoint {} created for {name}\n", metadata.checkpoint_id)
        }
        Err(err) => {
            let _ = state.store.remove(name, metadata.checkpoint_id);
            format!("checkpoint of {name} failed: {err}\n")
        }
    }
}

async fn do_restore(name: &str, id: Option<u64>, state: &mut ControlState<'_>) -> String {
    let entry = match id {
        Some(id) => state.store.find(name, id),
        None => state.store.find_latest(name),
    };
    let Some(entry) = entry else {
        return format!("no checkpoint found for {name}\n");
    };

    match state.engine.restore(&entry.dir).await {
        Ok(new_pid) => {
            if let Some(component) = state.table.get_by_name_mut(name) {
                component.pid = Some(new_pid);
                component.state = ComponentState::Active;
                let provides = component.provides.clone();
                let id = component.id;
                for cap in provides {
                    state.registry.register(&cap, id);
                }
            }
            format!("restored {name} from checkpoint {} as pid {new_pid}\n", entry.metadata.checkpoint_id)
        }
        Err(err) => format!("restore of {name} failed: {err}\n"),
    }
}

fn checkpoint_list(store: &CheckpointStore, filter: Option<&str>, table: &ComponentTable) -> String {
    let names: Vec<String> = match filter {
        Some(name) => vec![name.to_string()],
        None => table.iter().map(|c| c.name.clone()).collect(),
    };

    let mut out = String::from("checkpoints:\n");
    let mut any = false;
    for name in names {
        for entry in store.list(&name) {
            any = true;
            out.push_str(&format!(
                "  {}: id={} persistent={} pid={} size={}\n",
                name, entry.metadata.checkpoint_id, entry.metadata.persistent, entry.metadata.pid, entry.metadata.image_size_bytes
            ));
        }
    }
    if !any {
        out.push_str("  (none)\n");
    }
    out
}

fn checkpoint_rm(store: &CheckpointStore, name: &str, id: u64) -> String {
    match store.remove(name, id) {
        Ok(()) => format!("removed checkpoint {id} for {name}\n"),
        Err(err) => format!("remove failed: {err}\n"),
    }
}

fn migrate(store: &CheckpointStore, name: &str) -> String {
    let Some(entry) = store.find_latest(name) else {
        return format!("no checkpoint found for {name}\n");
    };
    match store.migrate_to_persistent(name, entry.metadata.checkpoint_id) {
        Ok(dir) => format!("migrated checkpoint {} for {name} to {}\n", entry.metadata.checkpoint_id, dir.display()),
        Err(err) => format!("migrate failed: {err}\n"),
    }
}

fn check_cycles(table: &ComponentTable) -> String {
    let graph = DependencyGraph::build(table);
    match graph::detect_cycle(&graph) {
        Some(cycle) => format!("cycle detected: {}\n", cycle.message()),
        None => "no cycles detected\n".to_string(),
    }
}

fn analyze(table: &ComponentTable) -> String {
    let graph = DependencyGraph::build(table);
    let metrics = graph::analyze_metrics(table, &graph);
    format!(
        "components={} capabilities={} edges={} avg_deps_per_component={:.2} max_dependency_depth={} sccs={}\n",
        metrics.total_components,
        metrics.total_capabilities,
        metrics.total_edges,
        metrics.average_dependencies_per_component,
        metrics.max_dependency_depth,
        metrics.strongly_connected_components
    )
}

fn validate(table: &ComponentTable) -> String {
    let graph = DependencyGraph::build(table);
    let mut problems = Vec::new();

    if let Some(cycle) = graph::detect_cycle(&graph) {
        problems.push(format!("cycle: {}", cycle.message()));
    }

    for comp in table.iter() {
        for requirement in &comp.requires {
            if !table.iter().any(|c| c.provides.iter().any(|p| p == requirement)) {
                problems.push(format!("{} requires {:?} which no component provides", comp.name, requirement));
            }
        }
    }

    if problems.is_empty() {
        "graph is valid\n".to_string()
    } else {
        format!("graph has {} problem(s):\n  {}\n", problems.len(), problems.join("\n  "))
    }
}

fn path(table: &ComponentTable, from_capability: &str, to_capability: &str) -> String {
    let graph = DependencyGraph::build(table);
    match graph::find_dependency_path(table, &graph, from_capability, to_capability) {
        Some(path) => format!("{}\n", path.join(" -> ")),
        None => format!("no path from {from_capability} to {to_capability}\n"),
    }
}

fn scc(table: &ComponentTable) -> String {
    let graph = DependencyGraph::build(table);
    let sccs = graph::strongly_connected_components(&graph);
    if sccs.is_empty() {
        "no strongly connected components (no cycles)\n".to_string()
    } else {
        let mut out = String::from("strongly connected components:\n");
        for (i, scc) in sccs.iter().enumerate() {
            out.push_str(&format!("  {}: {}\n", i + 1, scc.join(", ")));
        }
        out
    }
}

/// Parses `[--dry-run] <kernel> [--initrd <p>] [--append "<cmdline>"]`.
/// The cmdline argument may contain spaces, so once `--append` is seen
/// every remaining token is rejoined with single spaces.
fn parse_kexec_args(args: &[&str]) -> Result<KexecOptions, String> {
    let mut dry_run = false;
    let mut kernel = None;
    let mut initrd = None;
    let mut cmdline = None;

    let mut i = 0;
    while i < args.len() {
        match args[i] {
            "--dry-run" => {
                dry_run = true;
                i += 1;
            }
            "--initrd" => {
                initrd = args.get(i + 1).map(|s| std::path::PathBuf::from(s.trim_matches('"')));
                i += 2;
            }
            "--append" => {
                let joined = args[i + 1..].join(" ");
                cmdline = Some(joined.trim_matches('"').to_string());
                break;
            }
            other if kernel.is_none() => {
                kernel = Some(std::path::PathBuf::from(other));
                i += 1;
            }
            _ => i += 1,
        }
    }

    let kernel = kernel.ok_or_else(|| "usage: kexec [--dry-run] <kernel> [--initrd <p>] [--append \"<cmdline>\"]".to_string())?;
    Ok(KexecOptions { kernel, initrd, cmdline, dry_run })
}

async fn do_kexec(args: &[&str], state: &mut ControlState<'_>) -> String {
    let opts = match parse_kexec_args(args) {
        Ok(opts) => opts,
        Err(usage) => return format!("{usage}\n"),
    };

    let dry_run = opts.dry_run;
    let result = kexec::perform_transition(
        &opts,
        state.table,
        state.engine,
        state.store,
        state.kexec_engine,
        state.persistent_checkpoint_root,
    )
    .await;

    match result {
        Ok(()) if dry_run => "kexec dry run successful, system would proceed\n".to_string(),
        // a non-dry-run success never returns (execve of the new kernel
        // replaces this process); reaching here on Ok is unreachable in
        // production but kept for completeness in test builds.
        Ok(()) => "kexec transition initiated\n".to_string(),
        Err(err) => format!("kexec aborted: {err}\n"),
    }
}
