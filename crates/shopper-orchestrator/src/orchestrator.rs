use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use shopper_domain::{CreateSessionRequest, SessionId};
use shopper_lifecycle::LifecycleEngine;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::benchmark::BenchmarkRunner;
use crate::error::OrchestratorError;
use crate::spec::TestSpec;
use crate::worker_log::{read_log_tail, WorkerLog};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Concurrent workers.
    pub max_parallel: usize,
    /// Stop-launching threshold in USD. Active workers run to completion, so
    /// the final total may exceed this by at most the residual cost of
    /// already-running workers.
    pub budget_usd: f64,
    /// Progress-watcher cadence (log tail scan).
    pub progress_interval: Duration,
    /// Timeout-checker cadence.
    pub timeout_check_interval: Duration,
    /// A worker with no log progress for this long is killed.
    pub idle_timeout: Duration,
    /// A worker running longer than this is killed regardless of progress.
    pub total_timeout: Duration,
    /// Bound on the destroy call when killing a timed-out worker.
    pub cleanup_timeout: Duration,
    /// Directory for per-worker rolling logs.
    pub log_dir: PathBuf,
}

impl OrchestratorConfig {
    pub fn new(budget_usd: f64, log_dir: PathBuf) -> Self {
        Self {
            max_parallel: 3,
            budget_usd,
            progress_interval: Duration::from_secs(10),
            timeout_check_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(5 * 60),
            total_timeout: Duration::from_secs(25 * 60),
            cleanup_timeout: Duration::from_secs(30),
            log_dir,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Completed,
    Failed,
    TimedOut,
    /// Dropped in the validate phase: no offer matched the spec.
    SkippedNoInventory,
    /// Never launched: the budget was already spent.
    SkippedBudget,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerOutcome {
    pub spec: String,
    pub status: WorkerStatus,
    pub cost_usd: f64,
    pub tokens_per_second: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorReport {
    pub outcomes: Vec<WorkerOutcome>,
    pub total_cost_usd: f64,
    pub budget_usd: f64,
}

enum WorkerEvent {
    Started {
        index: usize,
        session_id: SessionId,
        price_per_hour: f64,
    },
    Completed {
        index: usize,
        tokens_per_second: Option<f64>,
    },
    Failed {
        index: usize,
        error: String,
    },
}

struct ActiveWorker {
    spec: TestSpec,
    started: Instant,
    last_progress: Instant,
    last_status_line: Option<String>,
    tokens_per_second: Option<f64>,
    session_id: Option<SessionId>,
    price_per_hour: f64,
    log_path: PathBuf,
    handle: JoinHandle<()>,
}

fn cost_usd(price_per_hour: f64, elapsed: Duration) -> f64 {
    price_per_hour * elapsed.as_secs_f64() / 3600.0
}

/// Drives a matrix of benchmark tests through the lifecycle engine.
///
/// One coordinator task owns the ready queue, the active set, and the spend
/// counter; workers run independently and report back over a channel plus
/// their log files. The log files stay authoritative for progress so that
/// out-of-process workers keep working against the same watcher.
pub struct Orchestrator {
    engine: Arc<LifecycleEngine>,
    runner: Arc<dyn BenchmarkRunner>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<LifecycleEngine>,
        runner: Arc<dyn BenchmarkRunner>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            engine,
            runner,
            config,
        }
    }

    pub async fn run(&self, specs: Vec<TestSpec>) -> Result<OrchestratorReport, OrchestratorError> {
        let mut outcomes: Vec<WorkerOutcome> = Vec::new();

        // ── Phase 1: validate against live inventory ──────────────────────────
        let mut ready: Vec<TestSpec> = Vec::new();
        for spec in specs {
            match self.cheapest_price(&spec).await {
                Some(price) => {
                    info!(
                        spec = %spec.worker_name(),
                        cheapest_usd_per_hour = price,
                        "spec validated against inventory"
                    );
                    ready.push(spec);
                }
                None => {
                    warn!(spec = %spec.worker_name(), "no matching offers, dropping spec");
                    outcomes.push(WorkerOutcome {
                        spec: spec.worker_name(),
                        status: WorkerStatus::SkippedNoInventory,
                        cost_usd: 0.0,
                        tokens_per_second: None,
                        error: Some("no matching offers".to_string()),
                    });
                }
            }
        }
        ready.sort_by_key(|s| s.priority);

        // ── Phase 2: run ──────────────────────────────────────────────────────
        let mut queue: VecDeque<TestSpec> = ready.into();
        let mut active: HashMap<usize, ActiveWorker> = HashMap::new();
        let mut spend = 0.0_f64;
        let mut next_index = 0usize;

        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let mut progress_ticker = tokio::time::interval(self.config.progress_interval);
        progress_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut timeout_ticker = tokio::time::interval(self.config.timeout_check_interval);
        timeout_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            // Launch while capacity exists and the budget is not exhausted.
            while active.len() < self.config.max_parallel && spend < self.config.budget_usd {
                let Some(spec) = queue.pop_front() else { break };
                let index = next_index;
                next_index += 1;
                active.insert(index, self.launch_worker(index, spec, tx.clone()));
            }

            if active.is_empty() {
                if queue.is_empty() {
                    break;
                }
                // Budget exhausted with specs still queued.
                for spec in queue.drain(..) {
                    outcomes.push(WorkerOutcome {
                        spec: spec.worker_name(),
                        status: WorkerStatus::SkippedBudget,
                        cost_usd: 0.0,
                        tokens_per_second: None,
                        error: Some("budget exhausted before launch".to_string()),
                    });
                }
                break;
            }

            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event, &mut active, &mut spend, &mut outcomes);
                }
                _ = progress_ticker.tick() => {
                    scan_progress(&mut active);
                }
                _ = timeout_ticker.tick() => {
                    self.kill_timed_out(&mut active, &mut spend, &mut outcomes).await;
                }
            }
        }

        info!(
            total_cost_usd = spend,
            budget_usd = self.config.budget_usd,
            workers = outcomes.len(),
            "benchmark matrix finished"
        );
        Ok(OrchestratorReport {
            outcomes,
            total_cost_usd: spend,
            budget_usd: self.config.budget_usd,
        })
    }

    async fn cheapest_price(&self, spec: &TestSpec) -> Option<f64> {
        let filter = spec.to_filter();
        let mut cheapest: Option<f64> = None;
        for provider in self.engine.registry().all() {
            if let Some(wanted) = &spec.provider {
                if provider.name() != wanted {
                    continue;
                }
            }
            match provider.list_offers(&filter).await {
                Ok(offers) => {
                    for offer in offers {
                        if cheapest.map_or(true, |c| offer.price_per_hour < c) {
                            cheapest = Some(offer.price_per_hour);
                        }
                    }
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "inventory query failed during validation");
                }
            }
        }
        cheapest
    }

    fn launch_worker(
        &self,
        index: usize,
        spec: TestSpec,
        tx: mpsc::UnboundedSender<WorkerEvent>,
    ) -> ActiveWorker {
        let log_path = self.config.log_dir.join(format!("{}.log", spec.worker_name()));
        let handle = tokio::spawn(run_worker(
            self.engine.clone(),
            self.runner.clone(),
            spec.clone(),
            log_path.clone(),
            index,
            tx,
        ));
        let now = Instant::now();
        ActiveWorker {
            spec,
            started: now,
            last_progress: now,
            last_status_line: None,
            tokens_per_second: None,
            session_id: None,
            price_per_hour: 0.0,
            log_path,
            handle,
        }
    }

    fn handle_event(
        &self,
        event: WorkerEvent,
        active: &mut HashMap<usize, ActiveWorker>,
        spend: &mut f64,
        outcomes: &mut Vec<WorkerOutcome>,
    ) {
        match event {
            WorkerEvent::Started {
                index,
                session_id,
                price_per_hour,
            } => {
                if let Some(worker) = active.get_mut(&index) {
                    worker.session_id = Some(session_id);
                    worker.price_per_hour = price_per_hour;
                    worker.last_progress = Instant::now();
                }
            }
            WorkerEvent::Completed {
                index,
                tokens_per_second,
            } => {
                if let Some(worker) = active.remove(&index) {
                    let cost = cost_usd(worker.price_per_hour, worker.started.elapsed());
                    *spend += cost;
                    outcomes.push(WorkerOutcome {
                        spec: worker.spec.worker_name(),
                        status: WorkerStatus::Completed,
                        cost_usd: cost,
                        tokens_per_second: tokens_per_second.or(worker.tokens_per_second),
                        error: None,
                    });
                }
            }
            WorkerEvent::Failed { index, error } => {
                if let Some(worker) = active.remove(&index) {
                    let cost = cost_usd(worker.price_per_hour, worker.started.elapsed());
                    *spend += cost;
                    outcomes.push(WorkerOutcome {
                        spec: worker.spec.worker_name(),
                        status: WorkerStatus::Failed,
                        cost_usd: cost,
                        tokens_per_second: worker.tokens_per_second,
                        error: Some(error),
                    });
                }
            }
        }
    }

    async fn kill_timed_out(
        &self,
        active: &mut HashMap<usize, ActiveWorker>,
        spend: &mut f64,
        outcomes: &mut Vec<WorkerOutcome>,
    ) {
        let now = Instant::now();
        let expired: Vec<usize> = active
            .iter()
            .filter(|(_, w)| {
                now.duration_since(w.last_progress) > self.config.idle_timeout
                    || now.duration_since(w.started) > self.config.total_timeout
            })
            .map(|(i, _)| *i)
            .collect();

        for index in expired {
            let Some(worker) = active.remove(&index) else { continue };
            let idle = now.duration_since(worker.last_progress);
            warn!(
                spec = %worker.spec.worker_name(),
                idle_secs = idle.as_secs(),
                total_secs = now.duration_since(worker.started).as_secs(),
                "worker timed out, destroying"
            );
            worker.handle.abort();

            if let Some(session_id) = &worker.session_id {
                let destroy = self.engine.force_destroy(session_id);
                match tokio::time::timeout(self.config.cleanup_timeout, destroy).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(session_id = %session_id, error = %e, "cleanup destroy failed"),
                    Err(_) => warn!(session_id = %session_id, "cleanup destroy timed out"),
                }
            }

            let cost = cost_usd(worker.price_per_hour, worker.started.elapsed());
            *spend += cost;
            outcomes.push(WorkerOutcome {
                spec: worker.spec.worker_name(),
                status: WorkerStatus::TimedOut,
                cost_usd: cost,
                tokens_per_second: worker.tokens_per_second,
                error: Some("timed out".to_string()),
            });
        }
    }
}

/// Re-scan every active worker's log tail and refresh progress timestamps.
fn scan_progress(active: &mut HashMap<usize, ActiveWorker>) {
    for worker in active.values_mut() {
        let progress = read_log_tail(&worker.log_path);
        if progress.last_status_line.is_some()
            && progress.last_status_line != worker.last_status_line
        {
            worker.last_status_line = progress.last_status_line;
            worker.last_progress = Instant::now();
        }
        if progress.tps.is_some() {
            worker.tokens_per_second = progress.tps;
        }
    }
}

/// One worker: provision a session for the spec, run the benchmark, tear the
/// session down, report. Workers only talk to the coordinator through the
/// event channel and their log file.
async fn run_worker(
    engine: Arc<LifecycleEngine>,
    runner: Arc<dyn BenchmarkRunner>,
    spec: TestSpec,
    log_path: PathBuf,
    index: usize,
    tx: mpsc::UnboundedSender<WorkerEvent>,
) {
    let log = match WorkerLog::create(&log_path) {
        Ok(log) => log,
        Err(e) => {
            let _ = tx.send(WorkerEvent::Failed {
                index,
                error: format!("log create failed: {}", e),
            });
            return;
        }
    };

    log.status("QUERY", &[("gpu", spec.gpu_type.clone())]);
    let request = CreateSessionRequest {
        consumer_id: format!("bench-{}", spec.worker_name()),
        offer_id: None,
        provider: spec.provider.clone(),
        gpu_type: Some(spec.gpu_type.clone()),
        min_vram_gb: spec.min_vram_gb,
        max_price_per_hour: spec.max_price_per_hour,
        min_gpu_count: None,
        location: None,
        workload_type: Some("benchmark".to_string()),
        reservation_hours: 1,
        idle_threshold_minutes: None,
        storage_policy: Default::default(),
        launch_mode: Default::default(),
        image: None,
        env: Default::default(),
        on_start: None,
        entrypoint: vec![],
        exposed_ports: vec![],
        workload: None,
        template_id: None,
        disk_gb: None,
        retry: Default::default(),
        agent_token: None,
    };

    log.status("PROVISION", &[]);
    let created = match engine.create_session(request).await {
        Ok(created) => created,
        Err(e) => {
            log.error("provision", &e.to_string());
            let _ = tx.send(WorkerEvent::Failed {
                index,
                error: e.to_string(),
            });
            return;
        }
    };
    let session_id = created.session.id.clone();
    let _ = tx.send(WorkerEvent::Started {
        index,
        session_id: session_id.clone(),
        price_per_hour: created.session.price_per_hour,
    });
    log.status(
        "SSH_READY",
        &[
            ("host", created.session.ssh_host.clone()),
            ("port", created.session.ssh_port.to_string()),
        ],
    );

    let result = runner.run(&created.session, &spec, &log).await;

    // Normal destroy path, success or not.
    if let Err(e) = engine.signal_done(&session_id).await {
        log.error("cleanup", &e.to_string());
    }

    match result {
        Ok(bench) => {
            let mut fields = Vec::new();
            if let Some(tps) = bench.tokens_per_second {
                fields.push(("tps", format!("{:.1}", tps)));
            }
            log.status("DONE", &fields);
            let _ = tx.send(WorkerEvent::Completed {
                index,
                tokens_per_second: bench.tokens_per_second,
            });
        }
        Err(e) => {
            log.error("benchmark", &e.to_string());
            let _ = tx.send(WorkerEvent::Failed {
                index,
                error: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shopper_domain::Session;
    use shopper_lifecycle::EngineConfig;
    use shopper_provider::{MockProvider, ProviderRegistry};
    use shopper_store::InMemoryStore;

    use crate::benchmark::{BenchResult, SimulatedBenchmark};

    fn engine(provider: Arc<MockProvider>) -> Arc<LifecycleEngine> {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = ProviderRegistry::new();
        registry.register(provider);
        Arc::new(LifecycleEngine::new(
            store,
            Arc::new(registry),
            "dep-bench",
            EngineConfig::default(),
        ))
    }

    fn spec(priority: u32, gpu: &str) -> TestSpec {
        TestSpec {
            priority,
            gpu_type: gpu.to_string(),
            provider: None,
            model: "llama-3.1-8b".to_string(),
            min_vram_gb: None,
            max_price_per_hour: None,
        }
    }

    fn config(budget: f64, dir: &tempfile::TempDir) -> OrchestratorConfig {
        OrchestratorConfig::new(budget, dir.path().to_path_buf())
    }

    #[tokio::test(start_paused = true)]
    async fn matrix_runs_to_completion_and_destroys_sessions() {
        let provider = Arc::new(MockProvider::new());
        provider.seed_offer(MockProvider::offer("mock", "1", "RTX 4090", 24, 0.45));
        provider.seed_offer(MockProvider::offer("mock", "2", "A100", 80, 1.20));
        let engine = engine(provider.clone());
        let dir = tempfile::tempdir().unwrap();

        let orchestrator = Orchestrator::new(
            engine,
            Arc::new(SimulatedBenchmark {
                step_delay: Duration::from_secs(1),
            }),
            config(100.0, &dir),
        );

        let report = orchestrator
            .run(vec![spec(1, "RTX 4090"), spec(2, "A100")])
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 2);
        for outcome in &report.outcomes {
            assert_eq!(outcome.status, WorkerStatus::Completed, "{:?}", outcome);
            assert!(outcome.tokens_per_second.is_some());
        }
        assert_eq!(provider.instance_count(), 0, "all sessions must be destroyed");
        assert!(report.total_cost_usd >= 0.0);
        assert!(report.total_cost_usd <= report.budget_usd);
    }

    #[tokio::test(start_paused = true)]
    async fn specs_without_inventory_are_dropped_in_validation() {
        let provider = Arc::new(MockProvider::new());
        provider.seed_offer(MockProvider::offer("mock", "1", "RTX 4090", 24, 0.45));
        let engine = engine(provider.clone());
        let dir = tempfile::tempdir().unwrap();

        let orchestrator = Orchestrator::new(
            engine,
            Arc::new(SimulatedBenchmark {
                step_delay: Duration::from_millis(10),
            }),
            config(100.0, &dir),
        );

        let report = orchestrator
            .run(vec![spec(1, "RTX 4090"), spec(2, "H100")])
            .await
            .unwrap();

        let skipped: Vec<_> = report
            .outcomes
            .iter()
            .filter(|o| o.status == WorkerStatus::SkippedNoInventory)
            .collect();
        assert_eq!(skipped.len(), 1);
        assert!(skipped[0].spec.contains("h100"));
        assert_eq!(provider.create_calls(), 1, "only the valid spec provisions");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_launches_nothing() {
        let provider = Arc::new(MockProvider::new());
        provider.seed_offer(MockProvider::offer("mock", "1", "RTX 4090", 24, 0.45));
        let engine = engine(provider.clone());
        let dir = tempfile::tempdir().unwrap();

        let orchestrator = Orchestrator::new(
            engine,
            Arc::new(SimulatedBenchmark::default()),
            config(0.0, &dir),
        );

        let report = orchestrator.run(vec![spec(1, "RTX 4090")]).await.unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].status, WorkerStatus::SkippedBudget);
        assert_eq!(provider.create_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_stops_launching_but_lets_active_workers_finish() {
        let provider = Arc::new(MockProvider::new());
        provider.seed_offer(MockProvider::offer("mock", "1", "RTX 4090", 24, 100.0));
        let engine = engine(provider.clone());
        let dir = tempfile::tempdir().unwrap();

        // A long simulated benchmark at 100 USD/h blows a tiny budget during
        // the first worker.
        let mut cfg = config(0.001, &dir);
        cfg.max_parallel = 1;
        let orchestrator = Orchestrator::new(
            engine,
            Arc::new(SimulatedBenchmark {
                step_delay: Duration::from_secs(30),
            }),
            cfg,
        );

        let report = orchestrator
            .run(vec![spec(1, "RTX 4090"), spec(2, "RTX 4090")])
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0].status, WorkerStatus::Completed);
        assert_eq!(report.outcomes[1].status, WorkerStatus::SkippedBudget);
        // Budget is a threshold, not a cap: the overrun is bounded by the
        // single worker that was already running.
        assert!(report.total_cost_usd > report.budget_usd);
        assert_eq!(provider.create_calls(), 1);
    }

    struct StallingBenchmark;

    #[async_trait]
    impl BenchmarkRunner for StallingBenchmark {
        async fn run(
            &self,
            _session: &Session,
            _spec: &TestSpec,
            log: &WorkerLog,
        ) -> Result<BenchResult, OrchestratorError> {
            log.status("LOAD_MODEL", &[]);
            // Never makes progress again.
            tokio::time::sleep(Duration::from_secs(100_000)).await;
            Ok(BenchResult::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_are_timed_out_and_destroyed() {
        let provider = Arc::new(MockProvider::new());
        provider.seed_offer(MockProvider::offer("mock", "1", "RTX 4090", 24, 0.45));
        let engine = engine(provider.clone());
        let dir = tempfile::tempdir().unwrap();

        let orchestrator = Orchestrator::new(
            engine,
            Arc::new(StallingBenchmark),
            config(100.0, &dir),
        );

        let report = orchestrator.run(vec![spec(1, "RTX 4090")]).await.unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].status, WorkerStatus::TimedOut);
        assert_eq!(provider.instance_count(), 0, "timed-out session must be destroyed");
    }

    #[test]
    fn cost_is_price_times_elapsed_hours() {
        let cost = cost_usd(2.0, Duration::from_secs(1800));
        assert!((cost - 1.0).abs() < 1e-9);
    }
}
