//! Last-resort shim killer.
//!
//! When the runtime refuses to remove a container, killing its shim process
//! on the host tears the container down anyway. A miss is not an error; the
//! runtime has usually cleaned the shims up already.

use async_trait::async_trait;
use regex::Regex;

/// Sends SIGKILL to host shim processes supervising a container.
#[async_trait]
pub trait ShimKiller: Send + Sync {
    /// Returns how many shim processes were killed.
    async fn kill_shims(&self, container_id: &str) -> usize;
}

/// Matches both shim binary names seen in the wild: `containerd-shim` (and
/// its v2 variants) and the legacy `docker-containerd-shim`.
fn shim_patterns(container_id: &str) -> Vec<Regex> {
    let short_id = &container_id[..container_id.len().min(12)];
    [
        format!("containerd-shim.*{short_id}"),
        format!("docker-containerd-shim.*{short_id}"),
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
}

/// Select pids whose command line matches any shim pattern.
fn matching_pids<'a>(
    processes: impl Iterator<Item = (i32, &'a str)>,
    patterns: &[Regex],
) -> Vec<i32> {
    processes
        .filter(|(_, cmdline)| patterns.iter().any(|re| re.is_match(cmdline)))
        .map(|(pid, _)| pid)
        .collect()
}

/// The real killer, enumerating the host process table.
pub struct HostShimKiller;

#[async_trait]
impl ShimKiller for HostShimKiller {
    async fn kill_shims(&self, container_id: &str) -> usize {
        // The table scan and the signal syscalls are blocking; keep them off
        // the async worker threads.
        let container_id = container_id.to_string();
        tokio::task::spawn_blocking(move || kill_shims_blocking(&container_id))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Shim kill task failed");
                0
            })
    }
}

fn kill_shims_blocking(container_id: &str) -> usize {
    let patterns = shim_patterns(container_id);

    let procs = match procfs::process::all_processes() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot enumerate processes for shim lookup");
            return 0;
        }
    };

    let candidates: Vec<(i32, String)> = procs
        .flatten()
        .filter_map(|proc| {
            proc.cmdline()
                .ok()
                .map(|parts| (proc.pid(), parts.join(" ")))
        })
        .collect();

    let pids = matching_pids(
        candidates.iter().map(|(pid, cmdline)| (*pid, cmdline.as_str())),
        &patterns,
    );
    if pids.is_empty() {
        tracing::debug!(container_id = %container_id, "No shim processes found");
        return 0;
    }

    let mut killed = 0;
    for pid in pids {
        match nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGKILL,
        ) {
            Ok(()) => {
                tracing::info!(pid = pid, "Killed shim process");
                killed += 1;
            }
            Err(e) => {
                tracing::warn!(pid = pid, error = %e, "Failed to kill shim process");
            }
        }
    }
    killed
}
