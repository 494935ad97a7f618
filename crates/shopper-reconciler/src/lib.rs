pub mod error;
pub mod metrics;
pub mod reconcile;
pub mod report;

pub use error::ReconcileError;
pub use metrics::{MetricsSnapshot, ReconcilerMetrics};
pub use reconcile::Reconciler;
pub use report::{EventHandler, ReconcileEvent, ReconcileReport, RecoveredSession};
