use thiserror::Error;

use crate::types::SessionStatus;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid session status: {0}")]
    InvalidStatus(String),

    #[error("session {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("session {id}: provider instance id already set to '{existing}'")]
    ProviderIdImmutable { id: String, existing: String },

    #[error("session {0}: running requires non-empty SSH host and port")]
    MissingSshCoordinates(String),

    #[error("reservation hours must be in [1, 12], got {0}")]
    InvalidReservationHours(u32),

    #[error("session {id}: cannot {action} while {status}")]
    InvalidState {
        id: String,
        status: SessionStatus,
        action: &'static str,
    },

    #[error("invalid instance label: {0}")]
    InvalidLabel(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}
