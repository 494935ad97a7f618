use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use shopper_domain::{Session, SessionId, SessionStatus};

use crate::error::StoreError;
use crate::store::SessionStore;

const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Persistent session store backed by a redb database file.
///
/// All session state survives process restarts; this is what crash recovery
/// and the startup sweep rely on. Writes go through single-writer
/// transactions, which serializes per-session updates.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a redb database at `path`.
    ///
    /// Parent directories are created automatically.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        let db = Database::create(path).map_err(|e| StoreError::Internal(e.to_string()))?;

        // Ensure the table exists
        {
            let wtxn = db
                .begin_write()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            wtxn.open_table(SESSIONS)
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            wtxn.commit().map_err(|e| StoreError::Internal(e.to_string()))?;
        }

        Ok(Self { db: Arc::new(db) })
    }

    fn read_all(&self) -> Result<Vec<Session>, StoreError> {
        let rtxn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let table = rtxn
            .open_table(SESSIONS)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(|e| StoreError::Internal(e.to_string()))? {
            let (_k, v) = entry.map_err(|e| StoreError::Internal(e.to_string()))?;
            let session: Session = serde_json::from_slice(v.value())?;
            results.push(session);
        }
        Ok(results)
    }

    fn write(&self, session: &Session) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(session)?;
        let key = session.id.0.clone();
        let wtxn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        {
            let mut table = wtxn
                .open_table(SESSIONS)
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            table
                .insert(key.as_str(), bytes.as_slice())
                .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        wtxn.commit().map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for RedbStore {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        if self.get(&session.id).await?.is_some() {
            return Err(StoreError::SessionExists(session.id.to_string()));
        }
        self.write(session)
    }

    async fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        let rtxn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let table = rtxn
            .open_table(SESSIONS)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        match table
            .get(id.as_str())
            .map_err(|e| StoreError::Internal(e.to_string()))?
        {
            Some(guard) => {
                let session: Session = serde_json::from_slice(guard.value())?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn update(&self, session: &Session) -> Result<(), StoreError> {
        if self.get(&session.id).await?.is_none() {
            return Err(StoreError::SessionNotFound(session.id.to_string()));
        }
        self.write(session)
    }

    async fn get_active_sessions(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.read_all()?.into_iter().filter(|s| s.is_active()).collect())
    }

    async fn get_active_sessions_by_provider(
        &self,
        provider: &str,
    ) -> Result<Vec<Session>, StoreError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|s| s.is_active() && s.provider == provider)
            .collect())
    }

    async fn get_sessions_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Vec<Session>, StoreError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|s| statuses.contains(&s.status))
            .collect())
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut all = self.read_all()?;
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }
}
