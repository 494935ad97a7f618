use async_trait::async_trait;
use shopper_domain::{Session, SessionId, SessionStatus};

use crate::error::StoreError;

/// Persistence contract for sessions.
///
/// Implementations must serialize updates per session id: two writers may
/// never observe the same stored version and both overwrite it. Any key-value
/// or relational backend with per-id compare-and-swap semantics qualifies.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Insert a new session. Fails if the id already exists.
    async fn create(&self, session: &Session) -> Result<(), StoreError>;

    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;

    /// Overwrite an existing session. Fails if the id is unknown.
    async fn update(&self, session: &Session) -> Result<(), StoreError>;

    /// All sessions with status in {pending, provisioning, running}.
    async fn get_active_sessions(&self) -> Result<Vec<Session>, StoreError>;

    async fn get_active_sessions_by_provider(
        &self,
        provider: &str,
    ) -> Result<Vec<Session>, StoreError>;

    async fn get_sessions_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<Session>, StoreError>;

    /// Every session, newest first. Used by the API listing and cost rollups.
    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError>;
}
