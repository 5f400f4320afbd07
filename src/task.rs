use crate::checkpoint::CheckpointManager;
use crate::error::{IngestError, IngestResult};
use crate::ingest::{ingest, CancelToken, IngestOptions, IngestSummary};
use crate::progress::IngestEvent;
use crate::rebuild::{rebuild_index, RebuildSummary};
use crate::store::ProjectionStore;
use futures::stream::{self, Stream};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;

/// Handle to an ingestion pass running on a worker thread.
pub struct IngestTask {
    events: UnboundedReceiver<IngestEvent>,
    cancel: CancelToken,
    handle: JoinHandle<IngestResult<IngestSummary>>,
}

impl IngestTask {
    /// Requests cancellation. The pass stops at the next element boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next event, or `None` once the worker has finished and every event
    /// has been drained.
    pub async fn next_event(&mut self) -> Option<IngestEvent> {
        self.events.recv().await
    }

    pub fn events(&mut self) -> impl Stream<Item = IngestEvent> + '_ {
        stream::poll_fn(move |cx| self.events.poll_recv(cx))
    }

    pub async fn join(self) -> IngestResult<IngestSummary> {
        self.handle
            .await
            .map_err(|e| IngestError::Worker(e.to_string()))?
    }
}

/// Spawns a pass over `raw` on the blocking pool. Must be called from within
/// a tokio runtime.
pub fn spawn_ingest<S: ProjectionStore + 'static>(
    store: Arc<S>,
    raw: String,
    options: IngestOptions,
    checkpoint: Option<Arc<CheckpointManager>>,
) -> IngestTask {
    let (tx, events) = mpsc::unbounded_channel();
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();

    let handle = tokio::task::spawn_blocking(move || {
        let mut sink = tx;
        ingest(
            store.as_ref(),
            &raw,
            &options,
            &worker_cancel,
            checkpoint.as_deref(),
            &mut sink,
        )
    });

    IngestTask {
        events,
        cancel,
        handle,
    }
}

/// Runs [`rebuild_index`] on the blocking pool.
pub async fn spawn_rebuild<S: ProjectionStore + 'static>(
    store: Arc<S>,
) -> IngestResult<RebuildSummary> {
    tokio::task::spawn_blocking(move || rebuild_index(store.as_ref()))
        .await
        .map_err(|e| IngestError::Worker(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestConfig;
    use crate::store::MemoryStore;
    use futures::StreamExt;
    use std::time::Duration;

    fn feed(count: usize) -> String {
        let data: Vec<String> = (0..count)
            .map(|i| {
                format!(
                    r#"{{"id":"{i}","type":"projection","attributes":{{"stat_type":"Rebounds","line_score":"{i}.5","start_time":"2024-02-01T00:00:00Z","status":"pre_game"}},"relationships":{{"new_player":{{"data":{{"id":"p1"}}}},"league":{{"data":{{"id":"l1"}}}}}}}}"#
                )
            })
            .collect();
        format!(
            r#"{{"data":[{}],"included":[{{"type":"new_player","id":"p1","attributes":{{"name":"Domantas Sabonis","team":"SAC","position":"C"}}}},{{"type":"league","id":"l1","attributes":{{"name":"NBA"}}}}]}}"#,
            data.join(",")
        )
    }

    fn options() -> IngestOptions {
        IngestOptions {
            config: IngestConfig {
                min_batch: 4,
                max_batch: 4,
                progress_interval: Duration::ZERO,
                retry_backoff: Duration::ZERO,
                ..IngestConfig::default()
            },
            ..IngestOptions::default()
        }
    }

    #[tokio::test]
    async fn streams_events_until_done() {
        let store = Arc::new(MemoryStore::new());
        let mut task = spawn_ingest(store.clone(), feed(10), options(), None);

        let events: Vec<IngestEvent> = task.events().collect().await;
        let summary = task.join().await.unwrap();

        assert_eq!(summary.total, 10);
        assert_eq!(store.record_count().unwrap(), 10);

        let chunked: u64 = events
            .iter()
            .map(|e| match e {
                IngestEvent::Chunk { count, .. } => *count,
                _ => 0,
            })
            .sum();
        assert_eq!(chunked, 10);
        assert_eq!(
            events.last(),
            Some(&IngestEvent::Done {
                total: 10,
                index_dirty: false,
                cancelled: false
            })
        );
    }

    #[tokio::test]
    async fn failure_ends_with_error_event() {
        let store = Arc::new(MemoryStore::new());
        let mut task = spawn_ingest(store, "{\"included\":[]}".to_string(), options(), None);

        let mut last = None;
        while let Some(event) = task.next_event().await {
            last = Some(event);
        }
        assert!(matches!(last, Some(IngestEvent::Error { .. })));
        assert!(matches!(task.join().await, Err(IngestError::Structural(_))));
    }

    #[tokio::test]
    async fn cancel_right_after_spawn_leaves_store_consistent() {
        let store = Arc::new(MemoryStore::new());
        let raw = feed(50);
        let task = spawn_ingest(store.clone(), raw, options(), None);
        task.cancel();
        let summary = task.join().await.unwrap();

        // Either the worker saw the flag after its first element, or it had
        // already finished the whole array.
        assert!(summary.cancelled || summary.total == 50);
        assert_eq!(store.record_count().unwrap() as u64, summary.total);
        assert!(!store.writer_lock().is_held());
    }

    #[tokio::test]
    async fn fast_import_then_rebuild_clears_dirty_flag() {
        let store = Arc::new(MemoryStore::new());
        let fast = IngestOptions {
            fast_import: true,
            ..options()
        };
        let summary = spawn_ingest(store.clone(), feed(6), fast, None)
            .join()
            .await
            .unwrap();
        assert!(summary.index_dirty);

        let rebuilt = spawn_rebuild(store.clone()).await.unwrap();
        assert_eq!(rebuilt.players_rebuilt, 1);
        assert!(!store.aggregate_dirty().unwrap());
        assert_eq!(store.player_counts().unwrap().get("Domantas Sabonis"), Some(&6));
    }
}
