//! Per-entity resume points.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use storysync_shared::{EntityId, EnumerationStrategy, Result};
use storysync_storage::Storage;

/// Last merged ordinal per entity, persisted in the state database.
///
/// `advance` calls for the same id run one at a time; different ids never
/// wait on each other's lock.
pub struct ProgressStore {
    storage: Arc<Storage>,
    locks: std::sync::Mutex<HashMap<EntityId, Arc<Mutex<()>>>>,
}

impl ProgressStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, id: &EntityId) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.entry(id.clone()).or_default().clone()
    }

    /// Ordinal to resume after; 0 for an unseen entity.
    pub async fn resume_from(&self, id: &EntityId) -> Result<u32> {
        self.storage.get_progress(id.as_str()).await
    }

    /// Raise the stored ordinal to `max(current, ordinal)` and return it.
    pub async fn advance(
        &self,
        id: &EntityId,
        ordinal: u32,
        strategy: EnumerationStrategy,
    ) -> Result<u32> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let current = self.storage.get_progress(id.as_str()).await?;
        if ordinal <= current {
            return Ok(current);
        }
        let stored = self
            .storage
            .advance_progress(id.as_str(), ordinal, strategy.as_str())
            .await?;
        debug!(entity_id = %id, from = current, to = stored, "progress advanced");
        Ok(stored)
    }
}
