use crate::checkpoint::{CheckpointManager, CheckpointStats};
use crate::config;
use crate::error::{IngestError, IngestResult};
use crate::extract::{locate_envelope, Elements};
use crate::mapper::{map_element, Mapped, SkipReason};
use crate::progress::{EventSink, IngestEvent, ProgressReporter};
use crate::resolver::ReferenceMaps;
use crate::stats::IngestStats;
use crate::store::{AggregateMode, ProjectionStore};
use crate::writer::{batch_size_for, BatchWriter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub approx_record_bytes: usize,
    pub target_transactions: usize,
    pub min_batch: usize,
    pub max_batch: usize,
    pub progress_interval: Duration,
    pub retry_backoff: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            approx_record_bytes: config::APPROX_RECORD_BYTES,
            target_transactions: config::TARGET_TRANSACTIONS,
            min_batch: config::MIN_BATCH_SIZE,
            max_batch: config::MAX_BATCH_SIZE,
            progress_interval: Duration::from_millis(config::PROGRESS_INTERVAL_MS),
            retry_backoff: Duration::from_millis(config::FLUSH_RETRY_BACKOFF_MS),
        }
    }
}

impl IngestConfig {
    pub fn batch_size(&self, input_len: usize) -> usize {
        batch_size_for(
            input_len,
            self.approx_record_bytes,
            self.target_transactions,
            self.min_batch,
            self.max_batch,
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Skip player aggregate maintenance; the store is left marked dirty.
    pub fast_import: bool,
    /// Element boundary in the `data` array to continue from.
    pub resume_from: Option<usize>,
    /// Counters of the interrupted pass being resumed. Reported totals and
    /// saved checkpoints include them. They must come from the same
    /// checkpoint as `resume_from`; both are written together after a commit,
    /// so batches re-committed after a stale checkpoint are counted once.
    pub carried: Option<CheckpointStats>,
    pub config: IngestConfig,
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// ```text
/// Idle -> ParsingSideTable -> StreamingRecords <-> Flushing -> Done
///                 \_____________________\_____________\______> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Idle,
    ParsingSideTable,
    StreamingRecords,
    Flushing,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestSummary {
    /// Records committed by this pass.
    pub total: u64,
    pub elements: u64,
    pub filtered: u64,
    pub malformed: u64,
    pub flushes: u64,
    pub index_dirty: bool,
    pub cancelled: bool,
    /// Boundary after the last committed element; pass it back as
    /// `resume_from` to continue a cancelled pass.
    pub resume_offset: usize,
}

/// Runs a full pass on the current thread. Emits progress chunks and exactly
/// one terminal event (`Done` or `Error`) into `sink`.
///
/// Cancellation is checked after every element. A cancelled pass flushes what
/// it has buffered and ends in `Done`, never mid-flush.
pub fn ingest<S: ProjectionStore + ?Sized>(
    store: &S,
    raw: &str,
    options: &IngestOptions,
    cancel: &CancelToken,
    checkpoint: Option<&CheckpointManager>,
    sink: &mut dyn EventSink,
) -> IngestResult<IngestSummary> {
    let mut pass = IngestPass {
        store,
        options,
        cancel,
        checkpoint,
        stats: options
            .carried
            .as_ref()
            .map(IngestStats::from_checkpoint)
            .unwrap_or_default(),
        state: PassState::Idle,
    };

    match pass.run(raw, sink) {
        Ok(summary) => {
            sink.emit(IngestEvent::Done {
                total: summary.total,
                index_dirty: summary.index_dirty,
                cancelled: summary.cancelled,
            });
            Ok(summary)
        }
        Err(e) => {
            pass.transition(PassState::Failed);
            error!(
                error = %e,
                committed = pass.stats.persisted(),
                "Ingestion pass failed"
            );
            sink.emit(IngestEvent::Error {
                message: e.to_string(),
            });
            Err(e)
        }
    }
}

struct IngestPass<'a, S: ProjectionStore + ?Sized> {
    store: &'a S,
    options: &'a IngestOptions,
    cancel: &'a CancelToken,
    checkpoint: Option<&'a CheckpointManager>,
    stats: IngestStats,
    state: PassState,
}

impl<'a, S: ProjectionStore + ?Sized> IngestPass<'a, S> {
    fn transition(&mut self, next: PassState) {
        trace!(from = ?self.state, to = ?next, "Pass state");
        self.state = next;
    }

    fn run(&mut self, raw: &str, sink: &mut dyn EventSink) -> IngestResult<IngestSummary> {
        let _writer = self
            .store
            .writer_lock()
            .try_acquire()
            .ok_or(IngestError::StoreBusy)?;
        let start = Instant::now();

        self.transition(PassState::ParsingSideTable);
        let envelope = locate_envelope(raw)?;
        let refs = ReferenceMaps::from_side_table(raw, envelope.included)?;

        let elements = match self.options.resume_from {
            Some(offset) => Elements::resume(raw, envelope.data, offset)?,
            None => Elements::new(raw, envelope.data)?,
        };

        let config = &self.options.config;
        let aggregate = if self.options.fast_import {
            AggregateMode::Deferred
        } else {
            AggregateMode::Incremental
        };
        let mut writer = BatchWriter::new(
            self.store,
            config.batch_size(raw.len()),
            aggregate,
            config.retry_backoff,
        );
        let mut reporter = ProgressReporter::new(raw.len(), config.progress_interval);
        let mut last_end = elements.offset();
        let mut cancelled = false;

        info!(
            input_bytes = raw.len(),
            batch_size = writer.batch_size(),
            fast_import = self.options.fast_import,
            resume_from = ?self.options.resume_from,
            "Starting ingestion pass"
        );

        self.transition(PassState::StreamingRecords);
        for element in elements {
            let element = element?;
            self.stats.inc_elements();

            match map_element(element.text, &refs) {
                Mapped::Record(record) => writer.push(record),
                Mapped::Skip(SkipReason::Status(status)) => {
                    self.stats.inc_filtered();
                    trace!(offset = element.start, status = %status, "Skipping non pre-game projection");
                }
                Mapped::Skip(SkipReason::Malformed(e)) => {
                    self.stats.inc_malformed();
                    debug!(offset = element.start, error = %e, "Skipping malformed element");
                }
            }

            last_end = element.end;
            if writer.is_full() {
                self.flush(&mut writer, &mut reporter, element.end, sink)?;
            } else {
                reporter.record(0, element.end, sink);
            }

            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
        }

        if writer.buffered() > 0 {
            self.flush(&mut writer, &mut reporter, last_end, sink)?;
        }

        if cancelled {
            info!(
                committed = self.stats.persisted(),
                offset = last_end,
                "Ingestion pass cancelled"
            );
        } else {
            reporter.finish(sink);
        }

        let index_dirty = self.options.fast_import || self.store.aggregate_dirty()?;
        self.transition(PassState::Done);

        info!(
            records = self.stats.persisted(),
            elements = self.stats.elements(),
            filtered = self.stats.filtered(),
            malformed = self.stats.malformed(),
            flushes = self.stats.flushes(),
            index_dirty,
            duration_secs = start.elapsed().as_secs_f64(),
            "Ingestion pass complete"
        );

        Ok(IngestSummary {
            total: self.stats.persisted(),
            elements: self.stats.elements(),
            filtered: self.stats.filtered(),
            malformed: self.stats.malformed(),
            flushes: self.stats.flushes(),
            index_dirty,
            cancelled,
            resume_offset: last_end,
        })
    }

    fn flush(
        &mut self,
        writer: &mut BatchWriter<'_, S>,
        reporter: &mut ProgressReporter,
        offset: usize,
        sink: &mut dyn EventSink,
    ) -> IngestResult<()> {
        self.transition(PassState::Flushing);
        let committed = writer.flush(&self.stats)?;
        reporter.record(committed, offset, sink);

        if let Some(checkpoint) = self.checkpoint {
            if let Err(e) = checkpoint.maybe_save(offset, &self.stats) {
                warn!(error = %e, "Failed to save checkpoint");
            }
        }

        self.transition(PassState::StreamingRecords);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IndexPrefix, MemoryStore};

    fn feed(statuses: &[&str]) -> String {
        let data: Vec<String> = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                format!(
                    r#"{{"type":"projection","id":"{i}","attributes":{{"stat_type":"Points","line_score":{i}.5,"start_time":"2024-01-10T19:00:00Z","status":"{status}"}},"relationships":{{"new_player":{{"data":{{"type":"new_player","id":"p{}"}}}},"league":{{"data":{{"type":"league","id":"l1"}}}}}}}}"#,
                    i % 3
                )
            })
            .collect();
        format!(
            r#"{{"data":[{}],"included":[{{"type":"new_player","id":"p0","attributes":{{"name":"Nikola Jokic","team":"DEN","position":"C"}}}},{{"type":"new_player","id":"p1","attributes":{{"name":"Jamal Murray","team":"DEN","position":"G"}}}},{{"type":"new_player","id":"p2","attributes":{{"name":"Aaron Gordon","team":"DEN","position":"F"}}}},{{"type":"league","id":"l1","attributes":{{"name":"NBA"}}}}]}}"#,
            data.join(",")
        )
    }

    fn small_batches() -> IngestOptions {
        IngestOptions {
            config: IngestConfig {
                min_batch: 2,
                max_batch: 2,
                progress_interval: Duration::ZERO,
                retry_backoff: Duration::ZERO,
                ..IngestConfig::default()
            },
            ..IngestOptions::default()
        }
    }

    #[test]
    fn persists_only_pre_game_records() {
        let store = MemoryStore::new();
        let raw = feed(&["pre_game", "in_progress", "pre_game", "final", "pre_game"]);
        let mut events = Vec::new();
        let summary = ingest(
            &store,
            &raw,
            &small_batches(),
            &CancelToken::new(),
            None,
            &mut events,
        )
        .unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.filtered, 2);
        assert_eq!(summary.elements, 5);
        assert!(!summary.index_dirty);
        assert_eq!(store.record_count().unwrap(), 3);
        assert_eq!(
            events.last(),
            Some(&IngestEvent::Done {
                total: 3,
                index_dirty: false,
                cancelled: false
            })
        );
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[test]
    fn structural_error_keeps_committed_batches() {
        let store = MemoryStore::new();
        let raw = feed(&["pre_game"; 5]);
        let data_end = raw.find("],\"included\"").unwrap();
        // Tear the last element in half.
        let torn = &raw[..data_end - 10];

        let mut events = Vec::new();
        let result = ingest(
            &store,
            torn,
            &small_batches(),
            &CancelToken::new(),
            None,
            &mut events,
        );

        assert!(matches!(result, Err(IngestError::Structural(_))));
        assert!(matches!(events.last(), Some(IngestEvent::Error { .. })));
        // Four complete elements, batches of two.
        assert_eq!(store.record_count().unwrap(), 4);
    }

    #[test]
    fn cancellation_stops_at_an_element_boundary() {
        let store = MemoryStore::new();
        let raw = feed(&["pre_game"; 6]);
        let cancel = CancelToken::new();
        let mut events = Vec::new();
        let mut sink = |e: IngestEvent| events.push(e);
        let mut seen_chunks = 0;
        let mut cancelling_sink = CancelAfter {
            inner: &mut sink,
            cancel: cancel.clone(),
            after: 1,
            seen: &mut seen_chunks,
        };

        let summary = ingest(
            &store,
            &raw,
            &small_batches(),
            &cancel,
            None,
            &mut cancelling_sink,
        )
        .unwrap();

        assert!(summary.cancelled);
        assert!(summary.total < 6);
        assert_eq!(store.record_count().unwrap() as u64, summary.total);

        let resumed = IngestOptions {
            resume_from: Some(summary.resume_offset),
            carried: Some(CheckpointStats {
                elements_scanned: summary.elements,
                records_persisted: summary.total,
                ..CheckpointStats::default()
            }),
            ..small_batches()
        };
        let rest = ingest(
            &store,
            &raw,
            &resumed,
            &CancelToken::new(),
            None,
            &mut Vec::new(),
        )
        .unwrap();
        assert_eq!(rest.total, 6);
        assert_eq!(rest.elements, 6);
        assert_eq!(store.record_count().unwrap(), 6);
    }

    struct CancelAfter<'a, F: FnMut(IngestEvent)> {
        inner: &'a mut F,
        cancel: CancelToken,
        after: usize,
        seen: &'a mut usize,
    }

    impl<F: FnMut(IngestEvent)> EventSink for CancelAfter<'_, F> {
        fn emit(&mut self, event: IngestEvent) {
            if matches!(event, IngestEvent::Chunk { .. }) {
                *self.seen += 1;
                if *self.seen >= self.after {
                    self.cancel.cancel();
                }
            }
            (self.inner)(event);
        }
    }

    struct StopAfterCommit(CancelToken);

    impl EventSink for StopAfterCommit {
        fn emit(&mut self, event: IngestEvent) {
            if matches!(event, IngestEvent::Chunk { count, .. } if count > 0) {
                self.0.cancel();
            }
        }
    }

    fn stop_after_commit(store: &MemoryStore, raw: &str, options: &IngestOptions) -> IngestSummary {
        let cancel = CancelToken::new();
        ingest(store, raw, options, &cancel, None, &mut StopAfterCommit(cancel.clone())).unwrap()
    }

    #[test]
    fn stale_checkpoint_does_not_overcount_on_resume() {
        let store = MemoryStore::new();
        let raw = feed(&["pre_game"; 6]);

        let first = stop_after_commit(&store, &raw, &small_batches());
        assert_eq!(first.total, 2);
        let saved = IngestOptions {
            resume_from: Some(first.resume_offset),
            carried: Some(CheckpointStats {
                elements_scanned: first.elements,
                records_persisted: first.total,
                ..CheckpointStats::default()
            }),
            ..small_batches()
        };

        // This pass commits another batch but its checkpoint is never written.
        let lost = stop_after_commit(&store, &raw, &saved);
        assert_eq!(lost.total, 4);
        assert_eq!(store.record_count().unwrap(), 4);

        let rest = ingest(&store, &raw, &saved, &CancelToken::new(), None, &mut Vec::new()).unwrap();
        assert!(!rest.cancelled);
        assert_eq!(rest.total, 6);
        assert_eq!(rest.elements, 6);
        assert_eq!(store.record_count().unwrap() as u64, rest.total);
    }

    #[test]
    fn fast_import_marks_index_dirty() {
        let store = MemoryStore::new();
        let raw = feed(&["pre_game"; 3]);
        let options = IngestOptions {
            fast_import: true,
            ..small_batches()
        };
        let mut events = Vec::new();
        let summary = ingest(&store, &raw, &options, &CancelToken::new(), None, &mut events).unwrap();
        assert!(summary.index_dirty);
        assert!(store.player_counts().unwrap().is_empty());
        assert_eq!(
            store
                .index_entries(&IndexPrefix::league("NBA"))
                .unwrap()
                .len(),
            3
        );
    }

    #[test]
    fn busy_store_is_rejected() {
        let store = MemoryStore::new();
        let _held = store.writer_lock().try_acquire().unwrap();
        let mut events = Vec::new();
        let result = ingest(
            &store,
            "[]",
            &IngestOptions::default(),
            &CancelToken::new(),
            None,
            &mut events,
        );
        assert!(matches!(result, Err(IngestError::StoreBusy)));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], IngestEvent::Error { .. }));
    }

    #[test]
    fn empty_array_completes_with_final_progress() {
        let store = MemoryStore::new();
        let mut events = Vec::new();
        ingest(
            &store,
            "[]",
            &IngestOptions::default(),
            &CancelToken::new(),
            None,
            &mut events,
        )
        .unwrap();
        assert_eq!(
            events,
            vec![
                IngestEvent::Chunk {
                    count: 0,
                    progress: 1.0
                },
                IngestEvent::Done {
                    total: 0,
                    index_dirty: false,
                    cancelled: false
                },
            ]
        );
    }
}
