//! Zombie detection and container attribution.
//!
//! One pass snapshots the process table, collects zombies and a parent→child
//! index in a single traversal, builds each running container's descendant
//! set on a bounded worker pool, and attributes every zombie to a container
//! (or to the host). Descendant sets are cached per root pid with bulk
//! eviction; inspect timeouts reported by the runtime adapter are kept in a
//! ledger so repeatedly-timing-out containers stay visible to operators.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;
use crate::proc::{ProcError, ProcState, ProcessEntry, ProcessIndex, ProcessSource};
use crate::runtime::{ContainerMeta, ContainerRuntime, InspectTimeoutCallback, RuntimeError};

/// kernel.pid_max ceiling; nothing outside [1, PID_MAX] enters a tree.
const PID_MAX: i32 = 4_194_304;

/// Descendant-set cache entries before bulk eviction.
const PID_TREE_CACHE_CAP: usize = 1_000;

/// Worker-pool ceiling for the per-container fan-out.
const MAX_FAN_OUT: usize = 20;

/// Ledger entries older than this are dropped at the start of each pass.
const LEDGER_MAX_AGE: Duration = Duration::from_secs(3_600);

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Process(ProcError),

    #[error(transparent)]
    Runtime(RuntimeError),

    #[error("process snapshot timed out")]
    SnapshotTimeout,

    #[error("detection cancelled")]
    Cancelled,
}

impl From<ProcError> for DetectError {
    fn from(e: ProcError) -> Self {
        match e {
            ProcError::Cancelled => DetectError::Cancelled,
            other => DetectError::Process(other),
        }
    }
}

impl From<RuntimeError> for DetectError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::Cancelled => DetectError::Cancelled,
            other => DetectError::Runtime(other),
        }
    }
}

/// One zombie, attributed or host-side.
#[derive(Debug, Clone)]
pub struct ZombieReport {
    pub pid: i32,
    pub ppid: i32,
    pub cmdline: String,
    pub container: Option<ContainerMeta>,
}

/// Containers whose inspect calls recently exceeded their deadline.
///
/// Entries expire after an hour so a transiently-slow runtime does not stay
/// on the books forever.
#[derive(Default)]
pub struct TimeoutLedger {
    inner: Mutex<HashMap<String, Instant>>,
}

impl TimeoutLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, container_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .insert(container_id.to_string(), Instant::now());
    }

    pub fn contains(&self, container_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(container_id)
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }

    fn prune(&self, max_age: Duration) {
        self.inner
            .lock()
            .unwrap()
            .retain(|_, recorded| recorded.elapsed() < max_age);
    }

    /// Callback handed to the runtime adapter at construction.
    pub fn callback(self: Arc<Self>) -> InspectTimeoutCallback {
        Arc::new(move |container_id: &str| self.record(container_id))
    }
}

pub struct Detector {
    source: Arc<dyn ProcessSource>,
    runtime: Arc<dyn ContainerRuntime>,
    metrics: Arc<Metrics>,
    fan_out: usize,
    process_timeout: Duration,
    pid_tree_cache: Arc<Mutex<HashMap<i32, Arc<HashSet<i32>>>>>,
    timeout_ledger: Arc<TimeoutLedger>,
}

impl Detector {
    pub fn new(
        source: Arc<dyn ProcessSource>,
        runtime: Arc<dyn ContainerRuntime>,
        metrics: Arc<Metrics>,
        max_concurrent_containers: usize,
        process_timeout: Duration,
        timeout_ledger: Arc<TimeoutLedger>,
    ) -> Self {
        Self {
            source,
            runtime,
            metrics,
            fan_out: max_concurrent_containers.min(MAX_FAN_OUT).max(1),
            process_timeout,
            pid_tree_cache: Arc::new(Mutex::new(HashMap::new())),
            timeout_ledger,
        }
    }

    /// Run one detection pass.
    pub async fn detect(&self, cancel: &CancellationToken) -> Result<Vec<ZombieReport>, DetectError> {
        let start = Instant::now();
        let result = self.detect_inner(cancel).await;
        self.metrics.observe_check_duration(start.elapsed());
        result
    }

    async fn detect_inner(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ZombieReport>, DetectError> {
        self.timeout_ledger.prune(LEDGER_MAX_AGE);
        let ledgered = self.timeout_ledger.container_ids();
        if !ledgered.is_empty() {
            tracing::debug!(
                count = ledgered.len(),
                containers = ?ledgered,
                "Containers with recent inspect timeouts"
            );
        }

        let entries =
            match tokio::time::timeout(self.process_timeout, self.source.snapshot(cancel)).await {
                Err(_) => return Err(DetectError::SnapshotTimeout),
                Ok(snapshot) => snapshot?,
            };

        let mut index = ProcessIndex::new();
        let mut zombies: Vec<ProcessEntry> = Vec::new();
        for entry in &entries {
            index.insert(entry.ppid, entry.pid);
            if entry.state == ProcState::Zombie {
                zombies.push(entry.clone());
            }
        }

        self.metrics.set_zombies_found(zombies.len());
        if zombies.is_empty() {
            tracing::debug!("No zombie processes found");
            self.pid_tree_cache.lock().unwrap().clear();
            return Ok(Vec::new());
        }
        tracing::info!(count = zombies.len(), "Found zombie processes");

        let index = Arc::new(index);
        let mut containers = self.runtime.list_containers(cancel).await?;
        self.fill_descendants(&mut containers, &index, cancel).await?;
        self.metrics.set_tracked_containers(containers.len());

        // pid → container position, over every descendant set.
        let mut pid_to_container: HashMap<i32, usize> = HashMap::new();
        for (pos, container) in containers.iter().enumerate() {
            for &pid in &container.descendants {
                pid_to_container.insert(pid, pos);
            }
        }

        let mut reports = Vec::with_capacity(zombies.len());
        for zombie in zombies {
            if cancel.is_cancelled() {
                return Err(DetectError::Cancelled);
            }

            // The zombie itself may already be outside the tree; its parent
            // still identifies the container.
            let container = pid_to_container
                .get(&zombie.pid)
                .or_else(|| pid_to_container.get(&zombie.ppid))
                .map(|&pos| containers[pos].clone());

            match &container {
                Some(c) => tracing::info!(
                    pid = zombie.pid,
                    ppid = zombie.ppid,
                    cmdline = %zombie.cmdline,
                    container_id = %c.id,
                    pod_name = %c.pod_name,
                    namespace = %c.pod_namespace,
                    "Found zombie process in container"
                ),
                None => tracing::info!(
                    pid = zombie.pid,
                    ppid = zombie.ppid,
                    cmdline = %zombie.cmdline,
                    "Found zombie process on host"
                ),
            }

            reports.push(ZombieReport {
                pid: zombie.pid,
                ppid: zombie.ppid,
                cmdline: zombie.cmdline,
                container,
            });
        }

        Ok(reports)
    }

    /// Build every container's descendant set on a bounded worker pool.
    async fn fill_descendants(
        &self,
        containers: &mut [ContainerMeta],
        index: &Arc<ProcessIndex>,
        cancel: &CancellationToken,
    ) -> Result<(), DetectError> {
        let semaphore = Arc::new(Semaphore::new(self.fan_out));
        let mut workers = JoinSet::new();

        for (pos, container) in containers.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let index = Arc::clone(index);
            let cache = Arc::clone(&self.pid_tree_cache);
            let root = container.root_pid;

            workers.spawn(async move {
                // Closing never happens; a failed acquire means the pass is
                // being torn down, and an empty set is harmless then.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (pos, Arc::new(HashSet::new())),
                };
                (pos, cached_descendants(&cache, root, &index))
            });
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    workers.abort_all();
                    return Err(DetectError::Cancelled);
                }
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(Ok((pos, tree))) => containers[pos].descendants = (*tree).clone(),
                    Some(Err(e)) if e.is_panic() => {
                        tracing::warn!(error = %e, "Descendant worker panicked");
                    }
                    Some(Err(_)) => {}
                },
            }
        }

        Ok(())
    }
}

/// Cache-aware descendant walk.
fn cached_descendants(
    cache: &Mutex<HashMap<i32, Arc<HashSet<i32>>>>,
    root: i32,
    index: &ProcessIndex,
) -> Arc<HashSet<i32>> {
    if let Some(hit) = cache.lock().unwrap().get(&root) {
        return Arc::clone(hit);
    }

    let tree = Arc::new(build_descendants(root, index));

    let mut cache = cache.lock().unwrap();
    if cache.len() >= PID_TREE_CACHE_CAP {
        cache.clear();
    }
    cache.insert(root, Arc::clone(&tree));
    tree
}

/// Transitive closure of `root`'s children. Each pid is visited at most
/// once, so pathological ppid loops terminate; pids outside [1, PID_MAX]
/// are never inserted.
fn build_descendants(root: i32, index: &ProcessIndex) -> HashSet<i32> {
    let mut seen = HashSet::new();
    let mut stack = vec![root];

    while let Some(pid) = stack.pop() {
        if !(1..=PID_MAX).contains(&pid) {
            continue;
        }
        if !seen.insert(pid) {
            continue;
        }
        stack.extend_from_slice(index.children(pid));
    }

    seen
}
