//! In-memory store of entity records backed by the snapshot file.
//!
//! Each entity lives in its own slot behind an async mutex, so a merge
//! replaces the whole record in one step and merges for different
//! entities never contend. Slot order is first-insertion order, which
//! keeps snapshots stable across runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use storysync_shared::{
    EntityDescriptor, EntityId, EntityRecord, EnumerationStrategy, Result, Snapshot,
    StorySyncError, Unit,
};

use crate::merge::{MergeOutcome, merge};

type Slot = Arc<Mutex<Option<EntityRecord>>>;

#[derive(Default)]
struct Index {
    order: Vec<EntityId>,
    slots: HashMap<EntityId, Slot>,
}

pub struct Store {
    path: PathBuf,
    index: std::sync::Mutex<Index>,
    save_lock: Mutex<()>,
}

impl Store {
    /// Load the snapshot at `path`; a missing file gives an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        let snapshot = Snapshot::load(path)?;
        let mut index = Index::default();
        for record in snapshot.records {
            let id = record.id().clone();
            if index.slots.contains_key(&id) {
                continue;
            }
            index.order.push(id.clone());
            index.slots.insert(id, Arc::new(Mutex::new(Some(record))));
        }
        info!(path = %path.display(), entities = index.order.len(), "store loaded");

        Ok(Self {
            path: path.to_path_buf(),
            index: std::sync::Mutex::new(index),
            save_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn index(&self) -> std::sync::MutexGuard<'_, Index> {
        self.index
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn slot(&self, id: &EntityId) -> Slot {
        let mut index = self.index();
        if let Some(slot) = index.slots.get(id) {
            return slot.clone();
        }
        let slot: Slot = Arc::new(Mutex::new(None));
        index.order.push(id.clone());
        index.slots.insert(id.clone(), slot.clone());
        slot
    }

    pub fn len(&self) -> usize {
        self.index().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn get(&self, id: &EntityId) -> Option<EntityRecord> {
        let slot = self.index().slots.get(id).cloned()?;
        let guard = slot.lock().await;
        guard.clone()
    }

    /// Merge `units` into the entity's record under its slot lock.
    ///
    /// Concurrent merges for the same entity are applied one after the
    /// other, each against the result of the previous one.
    pub async fn merge(
        &self,
        descriptor: &EntityDescriptor,
        units: &[Unit],
        strategy: EnumerationStrategy,
    ) -> MergeOutcome {
        let slot = self.slot(&descriptor.id);
        let mut guard = slot.lock().await;
        let outcome = merge(guard.as_ref(), descriptor, units, strategy);
        if outcome.changed {
            *guard = Some(outcome.record.clone());
        }
        debug!(
            entity_id = %descriptor.id,
            added = outcome.added.len(),
            already_present = outcome.already_present,
            conflicts = outcome.conflicts.len(),
            "merged"
        );
        outcome
    }

    /// Consistent per-entity copy of every record, in slot order.
    pub async fn snapshot(&self) -> Snapshot {
        let slots: Vec<Slot> = {
            let index = self.index();
            index
                .order
                .iter()
                .filter_map(|id| index.slots.get(id).cloned())
                .collect()
        };

        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(record) = slot.lock().await.as_ref() {
                records.push(record.clone());
            }
        }
        Snapshot::new(records)
    }

    /// Persist the current state atomically and return what was written.
    ///
    /// Saves are serialized, so a later save always includes every merge an
    /// earlier one did.
    pub async fn save(&self) -> Result<Snapshot> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.snapshot().await;

        let path = self.path.clone();
        let to_write = snapshot.clone();
        tokio::task::spawn_blocking(move || to_write.write_atomic(&path))
            .await
            .map_err(|e| StorySyncError::Storage(format!("snapshot writer failed: {e}")))??;

        debug!(path = %self.path.display(), entities = snapshot.records.len(), "snapshot saved");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("storysync_store_{}", uuid::Uuid::now_v7()))
            .join("stories.json")
    }

    fn descriptor(id: &str) -> EntityDescriptor {
        EntityDescriptor {
            id: EntityId::new(id),
            title: id.to_uppercase(),
            author: "a".into(),
            description: String::new(),
            thumbnail_url: String::new(),
        }
    }

    fn units(range: std::ops::RangeInclusive<u32>) -> Vec<Unit> {
        range
            .map(|n| Unit {
                ordinal: n,
                name: format!("Chapter {n}"),
                asset_urls: vec![format!("https://img.example.com/{n}.jpg")],
            })
            .collect()
    }

    #[tokio::test]
    async fn save_and_reload_keep_order() {
        let path = temp_path();
        let store = Store::load(&path).unwrap();
        assert!(store.is_empty());

        store
            .merge(&descriptor("b"), &units(1..=2), EnumerationStrategy::ExplicitLinks)
            .await;
        store
            .merge(&descriptor("a"), &units(1..=1), EnumerationStrategy::ExplicitLinks)
            .await;
        let written = store.save().await.unwrap();

        let reloaded = Store::load(&path).unwrap();
        assert_eq!(reloaded.snapshot().await, written);
        let ids: Vec<String> = written
            .records
            .iter()
            .map(|r| r.id().as_str().to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn concurrent_merges_on_one_entity_do_not_interleave() {
        let store = Arc::new(Store::load(&temp_path()).unwrap());
        let batches = vec![units(1..=10), units(5..=15), units(11..=20), units(1..=20)];

        let mut tasks = tokio::task::JoinSet::new();
        for batch in batches {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .merge(&descriptor("x"), &batch, EnumerationStrategy::SynthesizedNumeric)
                    .await
                    .added
                    .len()
            });
        }
        let mut total_added = 0;
        while let Some(res) = tasks.join_next().await {
            total_added += res.unwrap();
        }

        let record = store.get(&EntityId::new("x")).await.unwrap();
        assert!(record.is_well_formed());
        assert_eq!(record.units.len(), 20);
        // Every unit was inserted by exactly one merge.
        assert_eq!(total_added, 20);
    }

    #[tokio::test]
    async fn entity_without_a_merge_is_not_in_the_snapshot() {
        let store = Store::load(&temp_path()).unwrap();
        assert!(store.get(&EntityId::new("nobody")).await.is_none());
        assert!(store.snapshot().await.records.is_empty());
    }
}
