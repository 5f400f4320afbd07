use crate::checkpoint::CheckpointStats;
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics collected during one ingestion pass
#[derive(Debug, Default)]
pub struct IngestStats {
    pub elements_scanned: AtomicU64,
    pub records_persisted: AtomicU64,
    pub filtered_status: AtomicU64,
    pub malformed: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_retries: AtomicU64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_elements(&self) {
        self.elements_scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_persisted(&self, count: u64) {
        self.records_persisted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_filtered(&self) {
        self.filtered_status.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flushes(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flush_retries(&self) {
        self.flush_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn elements(&self) -> u64 {
        self.elements_scanned.load(Ordering::Relaxed)
    }

    pub fn persisted(&self) -> u64 {
        self.records_persisted.load(Ordering::Relaxed)
    }

    pub fn filtered(&self) -> u64 {
        self.filtered_status.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn flush_retries(&self) -> u64 {
        self.flush_retries.load(Ordering::Relaxed)
    }

    /// Create stats initialized from a checkpoint
    pub fn from_checkpoint(cp: &CheckpointStats) -> Self {
        Self {
            elements_scanned: AtomicU64::new(cp.elements_scanned),
            records_persisted: AtomicU64::new(cp.records_persisted),
            filtered_status: AtomicU64::new(cp.filtered_status),
            malformed: AtomicU64::new(cp.malformed),
            flushes: AtomicU64::new(cp.flushes),
            flush_retries: AtomicU64::new(cp.flush_retries),
        }
    }

    /// Convert to checkpoint stats for persistence
    pub fn to_checkpoint(&self) -> CheckpointStats {
        CheckpointStats {
            elements_scanned: self.elements(),
            records_persisted: self.persisted(),
            filtered_status: self.filtered(),
            malformed: self.malformed(),
            flushes: self.flushes(),
            flush_retries: self.flush_retries(),
        }
    }
}
