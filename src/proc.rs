//! Process-table snapshotting.
//!
//! One snapshot materializes `(pid, ppid, state, cmdline)` for every live
//! process. Entries that vanish mid-scan are skipped; losing that race with
//! the kernel is expected.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ProcError {
    #[error("process table unavailable: {0}")]
    ProcfsUnavailable(String),

    #[error("snapshot cancelled")]
    Cancelled,
}

/// Scheduler state of a process at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Running,
    Sleeping,
    Zombie,
    Other,
}

impl ProcState {
    fn from_stat_char(c: char) -> Self {
        match c {
            'R' => ProcState::Running,
            'S' | 'D' | 'I' => ProcState::Sleeping,
            'Z' => ProcState::Zombie,
            _ => ProcState::Other,
        }
    }
}

/// One row of the process table.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub pid: i32,
    pub ppid: i32,
    pub state: ProcState,
    pub cmdline: String,
}

/// Parent-pid to child-pids index derived from one snapshot.
///
/// Immutable once built; detection workers walk it concurrently without
/// locking.
#[derive(Debug, Default)]
pub struct ProcessIndex {
    children: HashMap<i32, Vec<i32>>,
}

impl ProcessIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ppid: i32, pid: i32) {
        self.children.entry(ppid).or_default().push(pid);
    }

    pub fn children(&self, pid: i32) -> &[i32] {
        self.children.get(&pid).map(Vec::as_slice).unwrap_or(&[])
    }

    #[cfg(test)]
    pub fn build(entries: &[ProcessEntry]) -> Self {
        let mut index = Self::new();
        for e in entries {
            index.insert(e.ppid, e.pid);
        }
        index
    }
}

/// Source of process-table snapshots.
#[async_trait]
pub trait ProcessSource: Send + Sync {
    async fn snapshot(&self, cancel: &CancellationToken) -> Result<Vec<ProcessEntry>, ProcError>;
}

/// The real source, backed by `/proc`.
pub struct ProcfsSource;

#[async_trait]
impl ProcessSource for ProcfsSource {
    async fn snapshot(&self, cancel: &CancellationToken) -> Result<Vec<ProcessEntry>, ProcError> {
        // The whole table read is blocking filesystem work; keep it off the
        // async worker threads.
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || scan_process_table(&cancel))
            .await
            .map_err(|e| ProcError::ProcfsUnavailable(e.to_string()))?
    }
}

fn scan_process_table(cancel: &CancellationToken) -> Result<Vec<ProcessEntry>, ProcError> {
    let procs =
        procfs::process::all_processes().map_err(|e| ProcError::ProcfsUnavailable(e.to_string()))?;

    let mut entries = Vec::new();
    for proc in procs {
        if cancel.is_cancelled() {
            return Err(ProcError::Cancelled);
        }

        // The process may have exited between readdir and stat.
        let proc = match proc {
            Ok(p) => p,
            Err(_) => continue,
        };
        let stat = match proc.stat() {
            Ok(s) => s,
            Err(_) => continue,
        };

        // Zombies have an empty cmdline; fall back to the comm field so
        // reports still carry a name.
        let cmdline = match proc.cmdline() {
            Ok(parts) if !parts.is_empty() => parts.join(" "),
            _ => stat.comm.clone(),
        };

        entries.push(ProcessEntry {
            pid: stat.pid,
            ppid: stat.ppid,
            state: ProcState::from_stat_char(stat.state),
            cmdline,
        });
    }

    Ok(entries)
}
