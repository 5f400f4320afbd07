/// Only projections with this status are persisted
pub const ACCEPTED_STATUS: &str = "pre_game";

/// Sentinel for references that cannot be resolved through the side table
pub const UNKNOWN: &str = "Unknown";

/// Rough serialized size of one projection element, used to estimate record count
pub const APPROX_RECORD_BYTES: usize = 600;

/// Number of transactions a full pass is split into
pub const TARGET_TRANSACTIONS: usize = 20;

/// Lower bound on records per flush
pub const MIN_BATCH_SIZE: usize = 250;

/// Upper bound on records per flush (bounds peak buffered memory)
pub const MAX_BATCH_SIZE: usize = 5000;

/// Minimum wall-clock gap between two progress events
pub const PROGRESS_INTERVAL_MS: u64 = 100;

/// Delay before the single retry of a failed flush
pub const FLUSH_RETRY_BACKOFF_MS: u64 = 50;

/// Save a checkpoint every N committed flushes
pub const CHECKPOINT_INTERVAL: u32 = 1;

pub const CHECKPOINT_VERSION: u32 = 1;

pub const STORE_VERSION: u32 = 1;

/// Refuse to decode journal frames larger than this
pub const MAX_JOURNAL_FRAME_BYTES: u64 = 512 * 1024 * 1024;

/// Buffer size for CSV export writers (256KB)
pub const EXPORT_BUFFER_SIZE: usize = 256 * 1024;
