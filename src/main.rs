//! graphd — dependency-graph PID 1 and service supervisor.
//!
//! Mounts the early pseudo-filesystems, brings up the component
//! table from declarations, then runs the event loop until a
//! shutdown signal. Every fallible step here funnels into
//! `emergency_shell` rather than returning: this process is PID 1 and
//! must never exit.

use graphd::config::DaemonConfig;
use graphd::event_loop::Daemon;
use graphd::logging;
use nix::mount::{mount, MsFlags};
use std::os::unix::process::CommandExt;
use std::process::Command;

/// Kernel pseudo-filesystems PID 1 is responsible for mounting before
/// anything else can run. Best-effort: a filesystem already mounted
/// by an initramfs is left alone, logged at debug rather than treated
/// as an error.
fn early_mounts() {
    let targets: &[(&str, &str, &str, MsFlags)] = &[
        ("proc", "/proc", "proc", MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV),
        ("sysfs", "/sys", "sysfs", MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV),
        ("devtmpfs", "/dev", "devtmpfs", MsFlags::MS_NOSUID),
        ("tmpfs", "/run", "tmpfs", MsFlags::MS_NOSUID | MsFlags::MS_NODEV),
        ("devpts", "/dev/pts", "devpts", MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC),
    ];

    for (source, target, fstype, flags) in targets {
        std::fs::create_dir_all(target).ok();
        match mount(Some(*source), *target, Some(*fstype), *flags, None::<&str>) {
            Ok(()) => tracing::debug!(target = %target, "mounted"),
            Err(err) => tracing::debug!(target = %target, error = %err, "mount skipped (already mounted or unprivileged)"),
        }
    }
}

/// The last resort: exec an interactive shell so an operator attached
/// to the console can still do something, or if every shell is
/// missing, park this PID forever. Returning from `main` on PID 1
/// panics the kernel, so this function never returns control.
fn emergency_shell(reason: &str) -> ! {
    tracing::error!(reason, "entering emergency shell, graphd cannot continue");
    for shell in ["/bin/sh", "/bin/bash", "/bin/busybox"] {
        let err = Command::new(shell).arg0("emergency-sh").exec();
        tracing::error!(shell, error = %err, "emergency shell exec failed, trying next");
    }
    tracing::error!("no emergency shell available, sleeping forever");
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}

fn main() {
    logging::init();
    early_mounts();

    let config = DaemonConfig::from_env();

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => emergency_shell(&format!("failed to build async runtime: {err}")),
    };

    let outcome = runtime.block_on(async move {
        let mut daemon = Daemon::new(config)?;
        daemon.resume_after_kernel_transition().await;
        daemon.run().await
    });

    match outcome {
        Ok(()) => {
            tracing::warn!("event loop returned normally, sleeping forever rather than exiting PID 1");
            loop {
                std::thread::sleep(std::time::Duration::from_secs(3600));
            }
        }
        Err(err) => emergency_shell(&format!("event loop failed: {err}")),
    }
}
