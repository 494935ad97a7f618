pub mod engine;
pub mod error;
pub mod keys;

pub use engine::{CreatedSession, EngineConfig, LifecycleEngine};
pub use error::LifecycleError;
pub use keys::{generate_keypair, SshKeyPair};
