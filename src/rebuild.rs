use crate::error::{IngestError, IngestResult};
use crate::models::CompositeIndexEntry;
use crate::store::ProjectionStore;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildSummary {
    /// Distinct players with a recomputed record count.
    pub players_rebuilt: u64,
    /// Composite index entries written.
    pub mappings_rebuilt: u64,
}

/// Recomputes the composite index and player counts from the records alone
/// and swaps them in atomically. Clears the dirty flag left by fast imports.
pub fn rebuild_index<S: ProjectionStore + ?Sized>(store: &S) -> IngestResult<RebuildSummary> {
    let _writer = store
        .writer_lock()
        .try_acquire()
        .ok_or(IngestError::StoreBusy)?;
    let start = Instant::now();

    let mut index = BTreeSet::new();
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    store.for_each_record(&mut |record| {
        index.insert(CompositeIndexEntry::from_record(record));
        *counts.entry(record.player.clone()).or_default() += 1;
    })?;

    let summary = RebuildSummary {
        players_rebuilt: counts.len() as u64,
        mappings_rebuilt: index.len() as u64,
    };
    store.replace_derived(index, counts)?;

    info!(
        players = summary.players_rebuilt,
        mappings = summary.mappings_rebuilt,
        duration_secs = start.elapsed().as_secs_f64(),
        "Index rebuild complete"
    );
    Ok(summary)
}
