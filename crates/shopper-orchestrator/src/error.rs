use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] shopper_lifecycle::LifecycleError),

    #[error("provider error: {0}")]
    Provider(#[from] shopper_provider::ProviderError),

    #[error("spec file error: {0}")]
    SpecFile(String),

    #[error("worker log error: {0}")]
    WorkerLog(#[from] std::io::Error),

    #[error("benchmark failed at stage {stage}: {message}")]
    Benchmark { stage: String, message: String },
}
