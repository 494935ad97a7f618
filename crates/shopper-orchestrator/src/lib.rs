pub mod benchmark;
pub mod error;
pub mod orchestrator;
pub mod spec;
pub mod worker_log;

pub use benchmark::{BenchResult, BenchmarkRunner, SimulatedBenchmark};
pub use error::OrchestratorError;
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorReport, WorkerOutcome, WorkerStatus};
pub use spec::{load_specs, TestSpec};
pub use worker_log::{parse_log_tail, WorkerLog, WorkerProgress};
