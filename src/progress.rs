use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

/// Intermediate progress is capped just below 1.0 so that the final event is
/// the only one that reports a fully consumed input.
const MAX_INTERMEDIATE_PROGRESS: f64 = 0.999_999;

#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    /// `count` records were committed since the previous chunk event.
    Chunk { count: u64, progress: f64 },
    Done {
        total: u64,
        index_dirty: bool,
        cancelled: bool,
    },
    Error { message: String },
}

impl IngestEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestEvent::Done { .. } | IngestEvent::Error { .. })
    }
}

/// Receives events from an ingestion pass.
pub trait EventSink {
    fn emit(&mut self, event: IngestEvent);
}

impl EventSink for Vec<IngestEvent> {
    fn emit(&mut self, event: IngestEvent) {
        self.push(event);
    }
}

impl EventSink for UnboundedSender<IngestEvent> {
    fn emit(&mut self, event: IngestEvent) {
        // A dropped receiver only means nobody is listening any more.
        let _ = self.send(event);
    }
}

/// Coalescing progress throttle. Counts accumulate between emissions; nothing
/// is dropped.
pub struct ProgressReporter {
    interval: Duration,
    input_len: usize,
    last_emit: Option<Instant>,
    pending: u64,
    last_progress: f64,
}

impl ProgressReporter {
    pub fn new(input_len: usize, interval: Duration) -> Self {
        Self {
            interval,
            input_len,
            last_emit: None,
            pending: 0,
            last_progress: 0.0,
        }
    }

    /// Notes `committed` new records with the input consumed up to `offset`,
    /// emitting a chunk if the throttle window has passed.
    pub fn record(&mut self, committed: u64, offset: usize, sink: &mut dyn EventSink) {
        self.pending += committed;
        let progress = self.fraction(offset);
        if progress > self.last_progress {
            self.last_progress = progress;
        }

        let due = self
            .last_emit
            .is_none_or(|at| at.elapsed() >= self.interval);
        if due {
            sink.emit(IngestEvent::Chunk {
                count: self.pending,
                progress: self.last_progress,
            });
            self.pending = 0;
            self.last_emit = Some(Instant::now());
        }
    }

    /// Emits the one event that reports the input as fully consumed.
    pub fn finish(&mut self, sink: &mut dyn EventSink) {
        self.last_progress = 1.0;
        sink.emit(IngestEvent::Chunk {
            count: self.pending,
            progress: 1.0,
        });
        self.pending = 0;
        self.last_emit = Some(Instant::now());
    }

    /// Records counted but not yet reported.
    pub fn pending(&self) -> u64 {
        self.pending
    }

    fn fraction(&self, offset: usize) -> f64 {
        if self.input_len == 0 {
            return 0.0;
        }
        (offset as f64 / self.input_len as f64).min(MAX_INTERMEDIATE_PROGRESS)
    }
}
