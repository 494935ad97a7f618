use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] shopper_store::StoreError),

    #[error("provider error: {0}")]
    Provider(#[from] shopper_provider::ProviderError),

    #[error("domain error: {0}")]
    Domain(#[from] shopper_domain::DomainError),

    #[error("internal error: {0}")]
    Internal(String),
}
