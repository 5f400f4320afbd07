use crate::error::StorageError;
use crate::models::{CanonicalRecord, CompositeIndexEntry};
use crate::stats::IngestStats;
use crate::store::{AggregateMode, ProjectionStore, WriteBatch};
use rustc_hash::FxHashSet;
use std::mem;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Records per flush for an input of `input_len` bytes: the estimated record
/// count spread over `target_transactions`, clamped to `[min, max]`.
pub fn batch_size_for(
    input_len: usize,
    approx_record_bytes: usize,
    target_transactions: usize,
    min: usize,
    max: usize,
) -> usize {
    let estimated_records = input_len / approx_record_bytes.max(1);
    (estimated_records / target_transactions.max(1))
        .max(min)
        .min(max.max(min))
        .max(1)
}

/// Buffers mapped records and commits them as atomic batches.
pub struct BatchWriter<'s, S: ProjectionStore + ?Sized> {
    store: &'s S,
    batch_size: usize,
    aggregate: AggregateMode,
    retry_backoff: Duration,
    records: Vec<CanonicalRecord>,
    entries: FxHashSet<CompositeIndexEntry>,
}

impl<'s, S: ProjectionStore + ?Sized> BatchWriter<'s, S> {
    pub fn new(
        store: &'s S,
        batch_size: usize,
        aggregate: AggregateMode,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            aggregate,
            retry_backoff,
            records: Vec::with_capacity(batch_size.max(1)),
            entries: FxHashSet::default(),
        }
    }

    pub fn push(&mut self, record: CanonicalRecord) {
        self.entries.insert(CompositeIndexEntry::from_record(&record));
        self.records.push(record);
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.batch_size
    }

    pub fn buffered(&self) -> usize {
        self.records.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Commits the buffer as one transaction, retrying once after the
    /// backoff. Returns the number of records committed.
    pub fn flush(&mut self, stats: &IngestStats) -> Result<u64, StorageError> {
        if self.records.is_empty() {
            return Ok(0);
        }

        let mut index_entries: Vec<_> = self.entries.drain().collect();
        index_entries.sort();
        let batch = WriteBatch {
            records: mem::take(&mut self.records),
            index_entries,
            aggregate: self.aggregate,
        };

        if let Err(e) = self.store.commit(&batch) {
            warn!(
                error = %e,
                records = batch.records.len(),
                backoff_ms = self.retry_backoff.as_millis() as u64,
                "Flush failed, retrying once"
            );
            stats.inc_flush_retries();
            thread::sleep(self.retry_backoff);
            self.store.commit(&batch)?;
        }

        let committed = batch.records.len() as u64;
        stats.inc_flushes();
        stats.add_persisted(committed);
        debug!(
            records = committed,
            index_entries = batch.index_entries.len(),
            "Batch committed"
        );
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IndexPrefix, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(id: &str, player: &str) -> CanonicalRecord {
        CanonicalRecord {
            id: id.to_string(),
            player: player.to_string(),
            team: "BOS".to_string(),
            position: "G".to_string(),
            league: "NBA".to_string(),
            stat: "Assists".to_string(),
            line: 6.5,
            start_time: "2024-01-10T19:30:00Z".to_string(),
            status: "pre_game".to_string(),
            game_id: None,
        }
    }

    /// Fails the first `failures` commits, then delegates.
    struct Failing {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    impl ProjectionStore for Failing {
        fn get(&self, id: &str) -> Result<Option<CanonicalRecord>, StorageError> {
            self.inner.get(id)
        }
        fn commit(&self, batch: &WriteBatch) -> Result<(), StorageError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StorageError::Unavailable("injected".into()));
            }
            self.inner.commit(batch)
        }
        fn index_entries(
            &self,
            prefix: &IndexPrefix,
        ) -> Result<Vec<CompositeIndexEntry>, StorageError> {
            self.inner.index_entries(prefix)
        }
        fn for_each_record(
            &self,
            f: &mut dyn FnMut(&CanonicalRecord),
        ) -> Result<(), StorageError> {
            self.inner.for_each_record(f)
        }
        fn record_count(&self) -> Result<usize, StorageError> {
            self.inner.record_count()
        }
        fn player_counts(
            &self,
        ) -> Result<std::collections::BTreeMap<String, u64>, StorageError> {
            self.inner.player_counts()
        }
        fn aggregate_dirty(&self) -> Result<bool, StorageError> {
            self.inner.aggregate_dirty()
        }
        fn replace_derived(
            &self,
            index: std::collections::BTreeSet<CompositeIndexEntry>,
            counts: std::collections::BTreeMap<String, u64>,
        ) -> Result<(), StorageError> {
            self.inner.replace_derived(index, counts)
        }
        fn writer_lock(&self) -> &crate::store::WriterLock {
            self.inner.writer_lock()
        }
    }

    #[test]
    fn batch_size_scales_with_input_and_is_clamped() {
        assert_eq!(batch_size_for(0, 600, 20, 250, 5000), 250);
        assert_eq!(batch_size_for(600 * 20 * 1000, 600, 20, 250, 5000), 1000);
        assert_eq!(batch_size_for(usize::MAX / 2, 600, 20, 250, 5000), 5000);
        assert_eq!(batch_size_for(100, 0, 0, 0, 0), 1);
    }

    #[test]
    fn flush_commits_buffer_and_dedups_index() {
        let store = MemoryStore::new();
        let stats = IngestStats::new();
        let mut writer = BatchWriter::new(&store, 2, AggregateMode::Incremental, Duration::ZERO);

        writer.push(record("1", "Jayson Tatum"));
        assert!(!writer.is_full());
        writer.push(record("2", "Jayson Tatum"));
        assert!(writer.is_full());

        assert_eq!(writer.flush(&stats).unwrap(), 2);
        assert_eq!(writer.buffered(), 0);
        assert_eq!(store.record_count().unwrap(), 2);
        assert_eq!(store.index_entries(&IndexPrefix::all()).unwrap().len(), 1);
        assert_eq!(store.player_counts().unwrap().get("Jayson Tatum"), Some(&2));
        assert_eq!(stats.flushes(), 1);
        assert_eq!(stats.persisted(), 2);
    }

    #[test]
    fn empty_flush_is_a_noop() {
        let store = MemoryStore::new();
        let stats = IngestStats::new();
        let mut writer = BatchWriter::new(&store, 10, AggregateMode::Incremental, Duration::ZERO);
        assert_eq!(writer.flush(&stats).unwrap(), 0);
        assert_eq!(stats.flushes(), 0);
    }

    #[test]
    fn deferred_mode_skips_aggregate() {
        let store = MemoryStore::new();
        let stats = IngestStats::new();
        let mut writer = BatchWriter::new(&store, 10, AggregateMode::Deferred, Duration::ZERO);
        writer.push(record("1", "Jaylen Brown"));
        writer.flush(&stats).unwrap();
        assert!(store.player_counts().unwrap().is_empty());
        assert!(store.aggregate_dirty().unwrap());
    }

    #[test]
    fn single_failure_is_retried() {
        let store = Failing {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(1),
        };
        let stats = IngestStats::new();
        let mut writer = BatchWriter::new(&store, 10, AggregateMode::Incremental, Duration::ZERO);
        writer.push(record("1", "Derrick White"));
        assert_eq!(writer.flush(&stats).unwrap(), 1);
        assert_eq!(stats.flush_retries(), 1);
        assert_eq!(store.record_count().unwrap(), 1);
    }

    #[test]
    fn second_failure_is_fatal_and_nothing_is_visible() {
        let store = Failing {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(2),
        };
        let stats = IngestStats::new();
        let mut writer = BatchWriter::new(&store, 10, AggregateMode::Incremental, Duration::ZERO);
        writer.push(record("1", "Al Horford"));
        assert!(writer.flush(&stats).is_err());
        assert_eq!(store.record_count().unwrap(), 0);
        assert_eq!(stats.persisted(), 0);
    }
}
