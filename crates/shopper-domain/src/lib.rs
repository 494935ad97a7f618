pub mod error;
pub mod gpu;
pub mod request;
pub mod tags;
pub mod types;

pub use error::DomainError;
pub use gpu::normalize_gpu_name;
pub use request::{CreateSessionRequest, RetryPolicy};
pub use tags::{InstanceTags, ProviderInstance, LABEL_PREFIX};
pub use types::{
    ApiEndpoint, GpuOffer, LaunchMode, OfferFilter, OfferId, RetryScope, Session, SessionId,
    SessionStatus, StoragePolicy, WorkloadConfig,
};
