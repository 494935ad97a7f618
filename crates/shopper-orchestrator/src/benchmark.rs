use std::time::Duration;

use async_trait::async_trait;
use shopper_domain::Session;

use crate::error::OrchestratorError;
use crate::spec::TestSpec;
use crate::worker_log::WorkerLog;

#[derive(Debug, Clone, Default)]
pub struct BenchResult {
    pub tokens_per_second: Option<f64>,
}

/// Runs the actual benchmark against a running session.
///
/// The control plane does not run workloads itself, so the real runner lives
/// outside this crate; [`SimulatedBenchmark`] stands in for it and exercises
/// the full status-line protocol.
#[async_trait]
pub trait BenchmarkRunner: Send + Sync + 'static {
    async fn run(
        &self,
        session: &Session,
        spec: &TestSpec,
        log: &WorkerLog,
    ) -> Result<BenchResult, OrchestratorError>;
}

/// Walks through the benchmark phases writing plausible status lines without
/// touching the instance.
pub struct SimulatedBenchmark {
    /// Pause between phases, so progress-watcher behavior is observable.
    pub step_delay: Duration,
}

impl Default for SimulatedBenchmark {
    fn default() -> Self {
        Self {
            step_delay: Duration::from_secs(1),
        }
    }
}

#[async_trait]
impl BenchmarkRunner for SimulatedBenchmark {
    async fn run(
        &self,
        session: &Session,
        spec: &TestSpec,
        log: &WorkerLog,
    ) -> Result<BenchResult, OrchestratorError> {
        log.status("LOAD_MODEL", &[("model", spec.model.clone())]);
        tokio::time::sleep(self.step_delay).await;

        log.status("WARMUP", &[("host", session.ssh_host.clone())]);
        tokio::time::sleep(self.step_delay).await;

        // Deterministic synthetic throughput keyed off the GPU class.
        let tps = 50.0 + (session.gpu_count as f64) * 25.0;
        log.status("BENCH", &[("tps", format!("{:.1}", tps))]);
        tokio::time::sleep(self.step_delay).await;

        Ok(BenchResult {
            tokens_per_second: Some(tps),
        })
    }
}
