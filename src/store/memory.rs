use super::{IndexPrefix, ProjectionStore, StoreState, WriteBatch, WriterLock};
use crate::error::StorageError;
use crate::models::{CanonicalRecord, CompositeIndexEntry};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

/// Volatile store. Commits are atomic because a batch is applied under one
/// lock acquisition and applying cannot fail.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    lock: WriterLock,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, StoreState>, StorageError> {
        self.state
            .lock()
            .map_err(|e| StorageError::Unavailable(format!("store lock poisoned: {e}")))
    }

    /// Copy of the full state, for comparing stores in tests and tooling.
    pub fn snapshot(&self) -> Result<StoreState, StorageError> {
        Ok(self.state()?.clone())
    }
}

impl ProjectionStore for MemoryStore {
    fn get(&self, id: &str) -> Result<Option<CanonicalRecord>, StorageError> {
        Ok(self.state()?.get(id).cloned())
    }

    fn commit(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        self.state()?.apply(batch);
        Ok(())
    }

    fn index_entries(&self, prefix: &IndexPrefix) -> Result<Vec<CompositeIndexEntry>, StorageError> {
        Ok(self.state()?.index_entries(prefix))
    }

    fn for_each_record(&self, f: &mut dyn FnMut(&CanonicalRecord)) -> Result<(), StorageError> {
        self.state()?.records().for_each(f);
        Ok(())
    }

    fn record_count(&self) -> Result<usize, StorageError> {
        Ok(self.state()?.record_count())
    }

    fn player_counts(&self) -> Result<BTreeMap<String, u64>, StorageError> {
        Ok(self.state()?.player_counts().clone())
    }

    fn aggregate_dirty(&self) -> Result<bool, StorageError> {
        Ok(self.state()?.aggregate_dirty())
    }

    fn replace_derived(
        &self,
        index: BTreeSet<CompositeIndexEntry>,
        counts: BTreeMap<String, u64>,
    ) -> Result<(), StorageError> {
        self.state()?.replace_derived(index, counts);
        Ok(())
    }

    fn writer_lock(&self) -> &WriterLock {
        &self.lock
    }
}
