//! Controller loop and confirmation state machine.
//!
//! Each tick runs one detection pass, folds the attributed zombies into
//! per-container confirmation state, and dispatches a concurrent cleanup
//! task for every container that has crossed the threshold. Orphan zombies
//! (ppid 1) veto cleanup: they have been reparented to the host init, so
//! removing the container cannot reap them. Whitelisted pods are observed
//! but never actioned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::CleanerConfig;
use crate::detector::{DetectError, Detector, ZombieReport};
use crate::metrics::Metrics;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::shim::ShimKiller;

/// Confirmation state for one container, owned by the controller.
#[derive(Debug)]
struct ContainerState {
    id: String,
    pod_name: String,
    namespace: String,
    confirm_count: u32,
    last_seen: Instant,
    in_progress: bool,
}

/// Everything a cleanup task needs once it leaves the controller lock.
#[derive(Clone)]
struct CleanupJob {
    container_id: String,
    pod_name: String,
    namespace: String,
    zombie_count: usize,
}

pub struct Cleaner {
    config: CleanerConfig,
    detector: Arc<Detector>,
    runtime: Arc<dyn ContainerRuntime>,
    shim_killer: Arc<dyn ShimKiller>,
    metrics: Arc<Metrics>,
    states: RwLock<HashMap<String, ContainerState>>,
    whitelist: Vec<Regex>,
}

/// Compile whitelist patterns, dropping invalid ones with a warning so a
/// single bad pattern does not prevent startup.
fn compile_whitelist(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Invalid whitelist pattern, skipping");
                None
            }
        })
        .collect()
}

impl Cleaner {
    pub fn new(
        config: CleanerConfig,
        detector: Arc<Detector>,
        runtime: Arc<dyn ContainerRuntime>,
        shim_killer: Arc<dyn ShimKiller>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let whitelist = compile_whitelist(&config.whitelist_patterns);
        Arc::new(Self {
            config,
            detector,
            runtime,
            shim_killer,
            metrics,
            states: RwLock::new(HashMap::new()),
            whitelist,
        })
    }

    /// Main loop: one pass immediately, then on the fixed interval, until
    /// cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            check_interval_secs = self.config.check_interval,
            confirm_count = self.config.confirm_count,
            dry_run = self.config.dry_run,
            "Starting zombie cleaner"
        );

        let mut ticker = tokio::time::interval(self.config.check_interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Cleaner loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    Arc::clone(&self).run_check(&cancel).await;
                }
            }
        }
    }

    async fn run_check(self: Arc<Self>, cancel: &CancellationToken) {
        tracing::debug!("Starting detection pass");

        let reports = match self.detector.detect(cancel).await {
            Ok(reports) => reports,
            Err(DetectError::Cancelled) => return,
            Err(e) => {
                tracing::error!(error = %e, "Zombie detection failed");
                self.metrics.inc_cleanup_failure("detection_failed");
                return;
            }
        };

        let mut by_container: HashMap<String, Vec<ZombieReport>> = HashMap::new();
        let mut host_zombies = 0usize;
        for report in reports {
            match report.container.as_ref().map(|c| c.id.clone()) {
                Some(id) => by_container.entry(id).or_default().push(report),
                None => host_zombies += 1,
            }
        }
        if host_zombies > 0 {
            tracing::debug!(
                count = host_zombies,
                "Host zombies observed; the unit of action is the container"
            );
        }

        if !by_container.is_empty() {
            let eligible = self.fold_sightings(by_container).await;
            for job in eligible {
                let cleaner = Arc::clone(&self);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    cleaner.cleanup_container(job, cancel).await;
                });
            }
        }
        self.reap_idle_states().await;
    }

    /// Fold this tick's sightings into the confirmation state machine and
    /// return the containers due for cleanup. Holds the write lock for the
    /// whole fold; cleanup itself runs outside it.
    async fn fold_sightings(
        &self,
        by_container: HashMap<String, Vec<ZombieReport>>,
    ) -> Vec<CleanupJob> {
        let mut eligible = Vec::new();

        {
            let mut states = self.states.write().await;
            for (container_id, zombies) in &by_container {
                // Grouping key came from the report, so the meta is present.
                let Some(meta) = zombies[0].container.as_ref() else {
                    continue;
                };

                let state = states
                    .entry(container_id.clone())
                    .or_insert_with(|| ContainerState {
                        id: container_id.clone(),
                        pod_name: meta.pod_name.clone(),
                        namespace: meta.pod_namespace.clone(),
                        confirm_count: 0,
                        last_seen: Instant::now(),
                        in_progress: false,
                    });

                if state.in_progress {
                    tracing::debug!(
                        container_id = %container_id,
                        "Cleanup already in progress, ignoring sighting"
                    );
                    continue;
                }

                state.confirm_count += 1;
                state.last_seen = Instant::now();

                let zombie_pids: Vec<i32> = zombies.iter().map(|z| z.pid).collect();
                tracing::info!(
                    container_id = %container_id,
                    pod_name = %state.pod_name,
                    namespace = %state.namespace,
                    confirm_count = state.confirm_count,
                    confirm_threshold = self.config.confirm_count,
                    zombie_pids = ?zombie_pids,
                    "Updated container zombie state"
                );

                if state.confirm_count < self.config.confirm_count {
                    continue;
                }

                let orphan_pids: Vec<i32> =
                    zombies.iter().filter(|z| z.ppid == 1).map(|z| z.pid).collect();
                if !orphan_pids.is_empty() {
                    tracing::warn!(
                        container_id = %container_id,
                        pod_name = %state.pod_name,
                        namespace = %state.namespace,
                        zombie_pids = ?orphan_pids,
                        "Zombies reparented to host init; removing the container cannot reap them, skipping cleanup"
                    );
                    state.confirm_count = 0;
                    continue;
                }

                if self.is_whitelisted(&state.pod_name) {
                    tracing::info!(
                        container_id = %container_id,
                        pod_name = %state.pod_name,
                        namespace = %state.namespace,
                        "Pod matches whitelist, skipping cleanup"
                    );
                    continue;
                }

                tracing::warn!(
                    container_id = %container_id,
                    pod_name = %state.pod_name,
                    namespace = %state.namespace,
                    confirm_count = state.confirm_count,
                    "Confirmation threshold reached, scheduling container cleanup"
                );
                state.in_progress = true;
                eligible.push(CleanupJob {
                    container_id: state.id.clone(),
                    pod_name: state.pod_name.clone(),
                    namespace: state.namespace.clone(),
                    zombie_count: zombies.len(),
                });
            }
        }

        eligible
    }

    /// Remove one container, falling back to killing its shims. Runs as its
    /// own task and may outlive the tick that spawned it.
    async fn cleanup_container(self: Arc<Self>, job: CleanupJob, _cancel: CancellationToken) {
        if self.config.dry_run {
            tracing::info!(
                container_id = %job.container_id,
                pod_name = %job.pod_name,
                namespace = %job.namespace,
                zombie_count = job.zombie_count,
                "Dry-run: would remove container"
            );
            self.delete_state(&job.container_id).await;
            return;
        }

        tracing::info!(
            container_id = %job.container_id,
            pod_name = %job.pod_name,
            namespace = %job.namespace,
            zombie_count = job.zombie_count,
            "Cleaning container"
        );

        let removed = match self
            .runtime
            .remove_container(&job.container_id, self.config.container_timeout())
            .await
        {
            Ok(()) => true,
            Err(RuntimeError::Timeout) => {
                tracing::warn!(container_id = %job.container_id, "Container remove timed out");
                self.metrics.inc_operation_timeout("remove");
                false
            }
            Err(e) => {
                tracing::error!(
                    container_id = %job.container_id,
                    error = %e,
                    "Container remove failed, falling back to shim kill"
                );
                false
            }
        };

        if !removed {
            let killed = self.shim_killer.kill_shims(&job.container_id).await;
            if killed == 0 {
                tracing::error!(
                    container_id = %job.container_id,
                    pod_name = %job.pod_name,
                    "Cleanup failed, will retry on a later tick"
                );
                self.metrics.inc_cleanup_failure("cleanup_failed");
                let mut states = self.states.write().await;
                if let Some(state) = states.get_mut(&job.container_id) {
                    state.in_progress = false;
                }
                return;
            }
            tracing::info!(
                container_id = %job.container_id,
                shims_killed = killed,
                "Container torn down via shim kill"
            );
        }

        self.metrics
            .inc_containers_cleaned(&job.namespace, &job.pod_name);
        self.delete_state(&job.container_id).await;
        tracing::info!(
            container_id = %job.container_id,
            pod_name = %job.pod_name,
            namespace = %job.namespace,
            "Container cleanup complete"
        );
    }

    async fn delete_state(&self, container_id: &str) {
        self.states.write().await.remove(container_id);
    }

    /// Drop states not seen for three check intervals and not in progress.
    async fn reap_idle_states(&self) {
        let threshold = self.config.check_interval() * 3;
        let mut states = self.states.write().await;
        states.retain(|container_id, state| {
            let idle = !state.in_progress && state.last_seen.elapsed() > threshold;
            if idle {
                tracing::debug!(container_id = %container_id, "Reaping idle container state");
            }
            !idle
        });
    }

    fn is_whitelisted(&self, pod_name: &str) -> bool {
        self.whitelist.iter().any(|re| re.is_match(pod_name))
    }

    /// Wait for in-flight cleanup up to `deadline`, then release the runtime.
    /// Work past the deadline is not aborted, only no longer waited for.
    pub async fn shutdown(&self, deadline: Duration) {
        tracing::info!("Stopping cleaner");

        let drain = async {
            loop {
                if !self.states.read().await.values().any(|s| s.in_progress) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            tracing::warn!("Timed out waiting for in-flight cleanup to finish");
        }

        self.runtime.close().await;
        tracing::info!("Cleaner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::TimeoutLedger;
    use crate::proc::{ProcError, ProcState, ProcessEntry, ProcessSource};
    use crate::runtime::ContainerMeta;
    use async_trait::async_trait;
    use std::collections::{HashSet, VecDeque};
    use std::sync::Mutex as StdMutex;

    struct ScriptedSource {
        entries: StdMutex<Vec<ProcessEntry>>,
    }

    impl ScriptedSource {
        fn new(entries: Vec<ProcessEntry>) -> Arc<Self> {
            Arc::new(Self {
                entries: StdMutex::new(entries),
            })
        }

        fn set(&self, entries: Vec<ProcessEntry>) {
            *self.entries.lock().unwrap() = entries;
        }
    }

    #[async_trait]
    impl ProcessSource for ScriptedSource {
        async fn snapshot(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<Vec<ProcessEntry>, ProcError> {
            Ok(self.entries.lock().unwrap().clone())
        }
    }

    struct MockRuntime {
        containers: StdMutex<Vec<ContainerMeta>>,
        remove_results: StdMutex<VecDeque<Result<(), RuntimeError>>>,
        remove_calls: StdMutex<Vec<String>>,
        remove_gate: StdMutex<Option<Arc<tokio::sync::Semaphore>>>,
    }

    impl MockRuntime {
        fn new(containers: Vec<ContainerMeta>) -> Arc<Self> {
            Arc::new(Self {
                containers: StdMutex::new(containers),
                remove_results: StdMutex::new(VecDeque::new()),
                remove_calls: StdMutex::new(Vec::new()),
                remove_gate: StdMutex::new(None),
            })
        }

        fn push_remove_result(&self, result: Result<(), RuntimeError>) {
            self.remove_results.lock().unwrap().push_back(result);
        }

        fn gate_removes(&self) -> Arc<tokio::sync::Semaphore> {
            let gate = Arc::new(tokio::sync::Semaphore::new(0));
            *self.remove_gate.lock().unwrap() = Some(gate.clone());
            gate
        }

        fn remove_calls(&self) -> Vec<String> {
            self.remove_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn list_containers(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<Vec<ContainerMeta>, RuntimeError> {
            Ok(self.containers.lock().unwrap().clone())
        }

        async fn remove_container(
            &self,
            id: &str,
            _timeout: Duration,
        ) -> Result<(), RuntimeError> {
            let gate = self.remove_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                let _permit = gate.acquire().await.unwrap();
            }
            self.remove_calls.lock().unwrap().push(id.to_string());
            self.remove_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn close(&self) {}
    }

    struct MockShim {
        kill_result: usize,
        calls: StdMutex<Vec<String>>,
    }

    impl MockShim {
        fn new(kill_result: usize) -> Arc<Self> {
            Arc::new(Self {
                kill_result,
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ShimKiller for MockShim {
        async fn kill_shims(&self, container_id: &str) -> usize {
            self.calls.lock().unwrap().push(container_id.to_string());
            self.kill_result
        }
    }

    fn entry(pid: i32, ppid: i32, state: ProcState) -> ProcessEntry {
        ProcessEntry {
            pid,
            ppid,
            state,
            cmdline: format!("proc-{pid}"),
        }
    }

    fn container(id: &str, root_pid: i32, pod_name: &str) -> ContainerMeta {
        ContainerMeta {
            id: id.to_string(),
            root_pid,
            pod_name: pod_name.to_string(),
            pod_namespace: "default".to_string(),
            cmdline: String::new(),
            created_at: chrono::Utc::now(),
            descendants: HashSet::new(),
        }
    }

    struct Harness {
        cleaner: Arc<Cleaner>,
        source: Arc<ScriptedSource>,
        runtime: Arc<MockRuntime>,
        shim: Arc<MockShim>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    }

    fn harness(
        config: CleanerConfig,
        entries: Vec<ProcessEntry>,
        containers: Vec<ContainerMeta>,
        shim_kills: usize,
    ) -> Harness {
        let source = ScriptedSource::new(entries);
        let runtime = MockRuntime::new(containers);
        let shim = MockShim::new(shim_kills);
        let metrics = Arc::new(Metrics::new().unwrap());
        let detector = Arc::new(Detector::new(
            source.clone(),
            runtime.clone(),
            metrics.clone(),
            config.max_concurrent_containers,
            config.process_timeout(),
            TimeoutLedger::new(),
        ));
        let cleaner = Cleaner::new(
            config,
            detector,
            runtime.clone(),
            shim.clone(),
            metrics.clone(),
        );
        Harness {
            cleaner,
            source,
            runtime,
            shim,
            metrics,
            cancel: CancellationToken::new(),
        }
    }

    fn config(confirm_count: u32) -> CleanerConfig {
        CleanerConfig {
            confirm_count,
            ..CleanerConfig::default()
        }
    }

    async fn tick(h: &Harness) {
        h.cleaner.clone().run_check(&h.cancel).await;
    }

    /// Spawned cleanup tasks settle asynchronously; poll until they have.
    async fn settle<F: Fn() -> bool>(done: F) {
        for _ in 0..100 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cleanup task did not settle");
    }

    async fn confirm_count_of(h: &Harness, id: &str) -> Option<u32> {
        h.cleaner
            .states
            .read()
            .await
            .get(id)
            .map(|s| s.confirm_count)
    }

    #[tokio::test]
    async fn test_host_zombie_creates_no_state() {
        let h = harness(
            config(3),
            vec![
                entry(1, 0, ProcState::Running),
                entry(100, 1, ProcState::Running),
                entry(101, 100, ProcState::Zombie),
            ],
            vec![],
            0,
        );

        tick(&h).await;

        assert!(h.cleaner.states.read().await.is_empty());
        assert!(h.runtime.remove_calls().is_empty());
        assert_eq!(h.metrics.zombies_found_value(), 1);
    }

    #[tokio::test]
    async fn test_single_sighting_confirms_but_does_not_clean() {
        let h = harness(
            config(3),
            vec![
                entry(1, 0, ProcState::Running),
                entry(200, 1, ProcState::Running),
                entry(201, 200, ProcState::Running),
                entry(202, 201, ProcState::Zombie),
            ],
            vec![container("c1", 200, "web-0")],
            0,
        );

        tick(&h).await;

        assert_eq!(confirm_count_of(&h, "c1").await, Some(1));
        assert!(h.runtime.remove_calls().is_empty());
        assert_eq!(h.metrics.zombies_found_value(), 1);
    }

    #[tokio::test]
    async fn test_threshold_triggers_single_cleanup() {
        let h = harness(
            config(3),
            vec![
                entry(1, 0, ProcState::Running),
                entry(200, 1, ProcState::Running),
                entry(201, 200, ProcState::Running),
                entry(202, 201, ProcState::Zombie),
            ],
            vec![container("c1", 200, "web-0")],
            0,
        );

        tick(&h).await;
        tick(&h).await;
        assert!(h.runtime.remove_calls().is_empty());

        tick(&h).await;
        settle(|| h.runtime.remove_calls().len() == 1).await;

        assert_eq!(h.runtime.remove_calls(), vec!["c1"]);
        assert_eq!(h.metrics.containers_cleaned_count("default", "web-0"), 1);
        settle(|| states_empty(&h)).await;
        assert!(h.shim.calls().is_empty());
    }

    fn states_empty(h: &Harness) -> bool {
        h.cleaner
            .states
            .try_read()
            .map(|s| s.is_empty())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_orphan_zombie_blocks_cleanup_and_resets() {
        // Tick 1: the zombie is an ordinary child of the container root.
        let h = harness(
            config(2),
            vec![
                entry(1, 0, ProcState::Running),
                entry(300, 1, ProcState::Running),
                entry(400, 300, ProcState::Zombie),
            ],
            vec![container("c2", 300, "db-0")],
            0,
        );

        tick(&h).await;
        assert_eq!(confirm_count_of(&h, "c2").await, Some(1));

        // The supervising chain dies and the zombie reparents to host init
        // (ppid 1). The cached tree for root 300 still contains pid 400, so
        // it keeps attributing to the container while carrying ppid=1.
        h.source.set(vec![
            entry(1, 0, ProcState::Running),
            entry(300, 1, ProcState::Running),
            entry(400, 1, ProcState::Zombie),
        ]);

        // Tick 2 reaches the threshold with an orphan present: no cleanup,
        // counter resets.
        tick(&h).await;
        assert!(h.runtime.remove_calls().is_empty());
        assert_eq!(confirm_count_of(&h, "c2").await, Some(0));

        // Qualifying again later repeats the reset instead of cleaning.
        tick(&h).await;
        assert_eq!(confirm_count_of(&h, "c2").await, Some(1));
        tick(&h).await;
        assert!(h.runtime.remove_calls().is_empty());
        assert_eq!(confirm_count_of(&h, "c2").await, Some(0));
    }

    #[tokio::test]
    async fn test_whitelisted_pod_never_cleaned() {
        let cfg = CleanerConfig {
            confirm_count: 1,
            whitelist_patterns: vec!["^kube-system-.*".to_string()],
            ..CleanerConfig::default()
        };
        let h = harness(
            cfg,
            vec![
                entry(1, 0, ProcState::Running),
                entry(500, 1, ProcState::Running),
                entry(501, 500, ProcState::Zombie),
            ],
            vec![container("c3", 500, "kube-system-foo")],
            0,
        );

        tick(&h).await;
        tick(&h).await;
        tick(&h).await;

        assert!(h.runtime.remove_calls().is_empty());
        assert!(h.shim.calls().is_empty());
        assert_eq!(h.metrics.cleanup_failure_count("cleanup_failed"), 0);
        // The counter keeps growing past the threshold.
        assert_eq!(confirm_count_of(&h, "c3").await, Some(3));
    }

    #[tokio::test]
    async fn test_remove_timeout_falls_back_to_shim_kill() {
        let h = harness(
            config(1),
            vec![
                entry(1, 0, ProcState::Running),
                entry(600, 1, ProcState::Running),
                entry(601, 600, ProcState::Zombie),
            ],
            vec![container("c4", 600, "api-0")],
            1,
        );
        h.runtime.push_remove_result(Err(RuntimeError::Timeout));

        tick(&h).await;
        settle(|| h.metrics.containers_cleaned_count("default", "api-0") == 1).await;

        assert_eq!(h.metrics.operation_timeout_count("remove"), 1);
        assert_eq!(h.shim.calls(), vec!["c4"]);
        settle(|| states_empty(&h)).await;
    }

    #[tokio::test]
    async fn test_shim_kill_miss_counts_failure_and_keeps_state() {
        let h = harness(
            config(1),
            vec![
                entry(1, 0, ProcState::Running),
                entry(700, 1, ProcState::Running),
                entry(701, 700, ProcState::Zombie),
            ],
            vec![container("c5", 700, "worker-0")],
            0,
        );
        h.runtime
            .push_remove_result(Err(RuntimeError::Backend("boom".to_string())));

        tick(&h).await;
        settle(|| h.metrics.cleanup_failure_count("cleanup_failed") == 1).await;

        assert_eq!(h.shim.calls(), vec!["c5"]);
        assert_eq!(h.metrics.containers_cleaned_count("default", "worker-0"), 0);
        let states = h.cleaner.states.read().await;
        let state = states.get("c5").expect("state must survive for retry");
        assert!(!state.in_progress);
    }

    #[tokio::test]
    async fn test_in_progress_sightings_are_ignored() {
        let h = harness(
            config(1),
            vec![
                entry(1, 0, ProcState::Running),
                entry(800, 1, ProcState::Running),
                entry(801, 800, ProcState::Zombie),
            ],
            vec![container("c6", 800, "slow-0")],
            0,
        );
        let gate = h.runtime.gate_removes();

        tick(&h).await; // dispatches cleanup, which blocks on the gate

        // Further sightings while in progress neither bump the counter nor
        // dispatch again.
        tick(&h).await;
        tick(&h).await;
        {
            let states = h.cleaner.states.read().await;
            let state = states.get("c6").unwrap();
            assert!(state.in_progress);
            assert_eq!(state.confirm_count, 1);
        }

        gate.add_permits(1);
        settle(|| states_empty(&h)).await;
        assert_eq!(h.runtime.remove_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let cfg = CleanerConfig {
            confirm_count: 1,
            dry_run: true,
            ..CleanerConfig::default()
        };
        let h = harness(
            cfg,
            vec![
                entry(1, 0, ProcState::Running),
                entry(900, 1, ProcState::Running),
                entry(901, 900, ProcState::Zombie),
            ],
            vec![container("c7", 900, "canary-0")],
            1,
        );

        tick(&h).await;
        settle(|| states_empty(&h)).await;

        assert!(h.runtime.remove_calls().is_empty());
        assert!(h.shim.calls().is_empty());
        assert_eq!(h.metrics.containers_cleaned_count("default", "canary-0"), 0);
    }

    #[tokio::test]
    async fn test_idle_states_reaped_after_three_intervals() {
        let cfg = CleanerConfig {
            confirm_count: 5,
            check_interval: 1,
            ..CleanerConfig::default()
        };
        let h = harness(
            cfg,
            vec![
                entry(1, 0, ProcState::Running),
                entry(950, 1, ProcState::Running),
                entry(951, 950, ProcState::Zombie),
            ],
            vec![container("c8", 950, "idle-0")],
            0,
        );

        tick(&h).await;
        assert_eq!(confirm_count_of(&h, "c8").await, Some(1));

        // Zombies disappear and the state goes stale.
        h.source.set(vec![entry(1, 0, ProcState::Running)]);
        {
            let mut states = h.cleaner.states.write().await;
            let state = states.get_mut("c8").unwrap();
            state.last_seen = Instant::now()
                .checked_sub(Duration::from_secs(4))
                .expect("clock predates test");
        }

        tick(&h).await;
        assert!(h.cleaner.states.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_detection_failure_counts_and_skips_tick() {
        struct FailingSource;

        #[async_trait]
        impl ProcessSource for FailingSource {
            async fn snapshot(
                &self,
                _cancel: &CancellationToken,
            ) -> Result<Vec<ProcessEntry>, ProcError> {
                Err(ProcError::ProcfsUnavailable("gone".to_string()))
            }
        }

        let runtime = MockRuntime::new(vec![]);
        let shim = MockShim::new(0);
        let metrics = Arc::new(Metrics::new().unwrap());
        let detector = Arc::new(Detector::new(
            Arc::new(FailingSource),
            runtime.clone(),
            metrics.clone(),
            10,
            Duration::from_secs(10),
            TimeoutLedger::new(),
        ));
        let cleaner = Cleaner::new(
            config(1),
            detector,
            runtime.clone(),
            shim,
            metrics.clone(),
        );

        cleaner.clone().run_check(&CancellationToken::new()).await;

        assert_eq!(metrics.cleanup_failure_count("detection_failed"), 1);
        assert!(runtime.remove_calls().is_empty());
    }

    #[test]
    fn test_invalid_whitelist_pattern_skipped() {
        let compiled = compile_whitelist(&[
            "^kube-system-.*".to_string(),
            "(unclosed".to_string(),
            "etcd".to_string(),
        ]);
        assert_eq!(compiled.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_cleanup() {
        let h = harness(
            config(1),
            vec![
                entry(1, 0, ProcState::Running),
                entry(970, 1, ProcState::Running),
                entry(971, 970, ProcState::Zombie),
            ],
            vec![container("c9", 970, "drain-0")],
            0,
        );
        let gate = h.runtime.gate_removes();

        tick(&h).await;
        {
            let states = h.cleaner.states.read().await;
            assert!(states.get("c9").unwrap().in_progress);
        }

        let cleaner = h.cleaner.clone();
        let shutdown = tokio::spawn(async move {
            cleaner.shutdown(Duration::from_secs(5)).await;
        });

        gate.add_permits(1);
        shutdown.await.unwrap();
        assert!(states_empty(&h));
    }
}
