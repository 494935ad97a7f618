pub mod error;
pub mod mock;
pub mod provider;
pub mod rate_limit;
pub mod registry;
pub mod tensordock;
pub mod vastai;

pub use error::ProviderError;
pub use mock::MockProvider;
pub use provider::{
    CreateInstanceRequest, CreatedInstance, Feature, InstanceState, InstanceStatus, Provider,
    Template, TemplateFilter, TemplateProvider,
};
pub use rate_limit::RateLimiter;
pub use registry::ProviderRegistry;
pub use tensordock::{TensorDockConfig, TensorDockProvider};
pub use vastai::{VastAiConfig, VastAiProvider};
