use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("domain error: {0}")]
    Domain(#[from] shopper_domain::DomainError),

    #[error("store error: {0}")]
    Store(#[from] shopper_store::StoreError),

    #[error("provider error: {0}")]
    Provider(#[from] shopper_provider::ProviderError),

    #[error("no offers match the requested constraints")]
    NoMatchingOffers,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {session}: provisioning timed out after {secs}s")]
    ProvisioningTimeout { session: String, secs: u64 },

    #[error("session {session}: instance failed before SSH was ready: {reason}")]
    InstanceFailed { session: String, reason: String },

    #[error("session {session}: destroy failed: {reason}")]
    DestroyFailed { session: String, reason: String },

    #[error("SSH key generation failed: {0}")]
    KeyGeneration(String),
}
