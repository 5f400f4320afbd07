use crate::config::CHECKPOINT_VERSION;
use crate::stats::IngestStats;
use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::SystemTime;
use tracing::{debug, info, warn};

#[derive(Serialize, Deserialize, Clone, Default, Debug, PartialEq, Eq)]
pub struct CheckpointStats {
    pub elements_scanned: u64,
    pub records_persisted: u64,
    pub filtered_status: u64,
    pub malformed: u64,
    pub flushes: u64,
    pub flush_retries: u64,
}

/// Marks how far an interrupted pass got. `resume_offset` is always the
/// element boundary just after the last committed record.
#[derive(Serialize, Deserialize, Debug)]
pub struct Checkpoint {
    pub version: u32,
    pub input_path: String,
    pub input_mtime: u64,
    pub input_size: u64,
    pub store_dir: String,
    pub fast_import: bool,
    pub resume_offset: usize,
    pub stats: CheckpointStats,
}

pub fn checkpoint_path(store_dir: &str) -> PathBuf {
    Path::new(store_dir).join("checkpoint.bin")
}

fn get_input_metadata(input_path: &str) -> Result<(u64, u64)> {
    let metadata = fs::metadata(input_path)
        .with_context(|| format!("Failed to get metadata for: {}", input_path))?;
    let mtime = metadata
        .modified()
        .context("Failed to get modification time")?
        .duration_since(SystemTime::UNIX_EPOCH)
        .context("Invalid modification time")?
        .as_secs();
    Ok((mtime, metadata.len()))
}

pub fn load_if_valid(
    input_path: &str,
    store_dir: &str,
    fast_import: bool,
) -> Result<Option<Checkpoint>> {
    let path = checkpoint_path(store_dir);

    if !path.exists() {
        return Ok(None);
    }

    let file_size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

    let file = File::open(&path).context("Failed to open checkpoint file")?;
    let reader = BufReader::new(file);

    let options = bincode::options().with_limit(file_size.saturating_add(1024));

    let checkpoint: Checkpoint = match options.deserialize_from(reader) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Checkpoint file is corrupt or unreadable");
            return Ok(None);
        }
    };

    if checkpoint.version != CHECKPOINT_VERSION {
        info!(
            cached = checkpoint.version,
            current = CHECKPOINT_VERSION,
            "Checkpoint version mismatch"
        );
        return Ok(None);
    }

    if checkpoint.input_path != input_path {
        info!(
            cached = checkpoint.input_path,
            current = input_path,
            "Checkpoint input path mismatch"
        );
        return Ok(None);
    }

    let (mtime, size) = get_input_metadata(input_path)?;
    if checkpoint.input_mtime != mtime || checkpoint.input_size != size {
        info!(
            cached_mtime = checkpoint.input_mtime,
            current_mtime = mtime,
            cached_size = checkpoint.input_size,
            current_size = size,
            "Input file has changed since checkpoint was created"
        );
        return Ok(None);
    }

    if checkpoint.store_dir != store_dir {
        info!(
            cached = checkpoint.store_dir,
            current = store_dir,
            "Checkpoint store directory mismatch"
        );
        return Ok(None);
    }

    if checkpoint.fast_import != fast_import {
        info!(
            cached = checkpoint.fast_import,
            current = fast_import,
            "Checkpoint import mode mismatch"
        );
        return Ok(None);
    }

    info!(
        offset = checkpoint.resume_offset,
        records = checkpoint.stats.records_persisted,
        "Loaded valid checkpoint"
    );

    Ok(Some(checkpoint))
}

pub fn clear(store_dir: &str) -> Result<()> {
    let path = checkpoint_path(store_dir);
    if path.exists() {
        fs::remove_file(&path)
            .with_context(|| format!("Failed to remove checkpoint file: {:?}", path))?;
        info!("Checkpoint cleared");
    }
    Ok(())
}

pub struct CheckpointManager {
    checkpoint_path: PathBuf,
    input_path: String,
    input_mtime: u64,
    input_size: u64,
    store_dir: String,
    fast_import: bool,
    interval: u32,
    last_saved_offset: AtomicUsize,
    flushes_since_save: AtomicU32,
}

impl CheckpointManager {
    pub fn new(input_path: &str, store_dir: &str, fast_import: bool, interval: u32) -> Result<Self> {
        let (input_mtime, input_size) = get_input_metadata(input_path)?;
        Ok(Self {
            checkpoint_path: checkpoint_path(store_dir),
            input_path: input_path.to_string(),
            input_mtime,
            input_size,
            store_dir: store_dir.to_string(),
            fast_import,
            interval: interval.max(1),
            last_saved_offset: AtomicUsize::new(0),
            flushes_since_save: AtomicU32::new(0),
        })
    }

    pub fn last_saved_offset(&self) -> usize {
        self.last_saved_offset.load(Ordering::Relaxed)
    }

    /// Called after every committed flush; writes a checkpoint every
    /// `interval` flushes. The manager is shared through an `Arc` with the
    /// blocking worker, but a pass calls this from its one flush path only.
    pub fn maybe_save(&self, offset: usize, stats: &IngestStats) -> Result<bool> {
        let count = self.flushes_since_save.fetch_add(1, Ordering::Relaxed) + 1;
        if count < self.interval {
            return Ok(false);
        }

        self.save(offset, stats)?;
        self.flushes_since_save.store(0, Ordering::Relaxed);
        Ok(true)
    }

    pub fn save(&self, offset: usize, stats: &IngestStats) -> Result<()> {
        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            input_path: self.input_path.clone(),
            input_mtime: self.input_mtime,
            input_size: self.input_size,
            store_dir: self.store_dir.clone(),
            fast_import: self.fast_import,
            resume_offset: offset,
            stats: stats.to_checkpoint(),
        };

        if let Some(parent) = self.checkpoint_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let tmp_path = self.checkpoint_path.with_extension("bin.tmp");
        let file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp checkpoint file: {:?}", tmp_path))?;
        let writer = BufWriter::new(file);

        bincode::DefaultOptions::new()
            .serialize_into(writer, &checkpoint)
            .context("Failed to serialize checkpoint")?;

        fs::rename(&tmp_path, &self.checkpoint_path).with_context(|| {
            format!(
                "Failed to rename temp checkpoint: {:?}",
                self.checkpoint_path
            )
        })?;

        self.last_saved_offset.store(offset, Ordering::Relaxed);

        debug!(
            offset,
            records = stats.persisted(),
            "Checkpoint saved"
        );

        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        clear(&self.store_dir)
    }
}
