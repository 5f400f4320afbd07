mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::StorageError;
use crate::models::{CanonicalRecord, CompositeIndexEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateMode {
    /// Maintain player counts inside the same transaction.
    Incremental,
    /// Leave player counts alone and mark them stale.
    Deferred,
}

/// Everything one flush writes. Applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub records: Vec<CanonicalRecord>,
    pub index_entries: Vec<CompositeIndexEntry>,
    pub aggregate: AggregateMode,
}

/// Composite-index query. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexPrefix {
    pub league: Option<String>,
    pub stat: Option<String>,
    pub player_prefix: Option<String>,
}

impl IndexPrefix {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn league(league: &str) -> Self {
        Self {
            league: Some(league.to_string()),
            ..Self::default()
        }
    }

    pub fn with_stat(mut self, stat: &str) -> Self {
        self.stat = Some(stat.to_string());
        self
    }

    pub fn with_player_prefix(mut self, prefix: &str) -> Self {
        self.player_prefix = Some(prefix.to_string());
        self
    }

    fn matches(&self, entry: &CompositeIndexEntry) -> bool {
        self.league.as_ref().is_none_or(|l| &entry.league == l)
            && self.stat.as_ref().is_none_or(|s| &entry.stat == s)
            && self
                .player_prefix
                .as_ref()
                .is_none_or(|p| entry.player_name.starts_with(p.as_str()))
    }
}

/// The only store surface the engine uses: get by primary key, one atomic
/// multi-put spanning records and the composite index, prefix lookups on the
/// composite index, and a full record scan for rebuilds.
pub trait ProjectionStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<CanonicalRecord>, StorageError>;

    /// Atomically applies one batch. On error nothing from the batch is visible.
    fn commit(&self, batch: &WriteBatch) -> Result<(), StorageError>;

    fn index_entries(&self, prefix: &IndexPrefix) -> Result<Vec<CompositeIndexEntry>, StorageError>;

    fn for_each_record(&self, f: &mut dyn FnMut(&CanonicalRecord)) -> Result<(), StorageError>;

    fn record_count(&self) -> Result<usize, StorageError>;

    fn player_counts(&self) -> Result<BTreeMap<String, u64>, StorageError>;

    fn aggregate_dirty(&self) -> Result<bool, StorageError>;

    /// Swaps in a recomputed composite index and player aggregate in one step
    /// and clears the dirty flag.
    fn replace_derived(
        &self,
        index: BTreeSet<CompositeIndexEntry>,
        counts: BTreeMap<String, u64>,
    ) -> Result<(), StorageError>;

    fn writer_lock(&self) -> &WriterLock;
}

/// In-memory image of a store, shared by both implementations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    records: BTreeMap<String, CanonicalRecord>,
    index: BTreeSet<CompositeIndexEntry>,
    player_counts: BTreeMap<String, u64>,
    aggregate_dirty: bool,
}

impl StoreState {
    /// Upserts by id. Re-applying the same batch is a no-op, which keeps
    /// journal replay idempotent.
    pub fn apply(&mut self, batch: &WriteBatch) {
        for record in &batch.records {
            let previous = self.records.insert(record.id.clone(), record.clone());
            if batch.aggregate == AggregateMode::Incremental {
                if let Some(previous) = previous {
                    self.decrement(&previous.player);
                }
                *self.player_counts.entry(record.player.clone()).or_insert(0) += 1;
            }
        }
        if batch.aggregate == AggregateMode::Deferred {
            self.aggregate_dirty = true;
        }
        self.index.extend(batch.index_entries.iter().cloned());
    }

    fn decrement(&mut self, player: &str) {
        if let Some(count) = self.player_counts.get_mut(player) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.player_counts.remove(player);
            }
        }
    }

    pub fn replace_derived(
        &mut self,
        index: BTreeSet<CompositeIndexEntry>,
        counts: BTreeMap<String, u64>,
    ) {
        self.index = index;
        self.player_counts = counts;
        self.aggregate_dirty = false;
    }

    pub fn get(&self, id: &str) -> Option<&CanonicalRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &CanonicalRecord> {
        self.records.values()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn player_counts(&self) -> &BTreeMap<String, u64> {
        &self.player_counts
    }

    pub fn aggregate_dirty(&self) -> bool {
        self.aggregate_dirty
    }

    pub fn index_entries(&self, prefix: &IndexPrefix) -> Vec<CompositeIndexEntry> {
        let Some(league) = prefix.league.as_deref() else {
            return self
                .index
                .iter()
                .filter(|e| prefix.matches(e))
                .cloned()
                .collect();
        };
        let lower = CompositeIndexEntry::new(league, prefix.stat.as_deref().unwrap_or(""), "");
        self.index
            .range(lower..)
            .take_while(|e| {
                e.league == league && prefix.stat.as_ref().is_none_or(|s| &e.stat == s)
            })
            .filter(|e| prefix.matches(e))
            .cloned()
            .collect()
    }
}

/// Single-writer token. An ingestion pass or a rebuild holds it for its whole
/// duration.
#[derive(Debug, Default)]
pub struct WriterLock {
    held: AtomicBool,
}

impl WriterLock {
    pub fn try_acquire(&self) -> Option<WriterGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| WriterGuard { lock: self })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

pub struct WriterGuard<'a> {
    lock: &'a WriterLock,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}
