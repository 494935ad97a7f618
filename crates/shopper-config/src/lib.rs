mod raw;
mod loader;
pub mod error;

pub use error::ConfigError;
pub use loader::{load, load_with, Settings, TensorDockSettings, VastAiSettings};
