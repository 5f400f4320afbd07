use crate::config::EXPORT_BUFFER_SIZE;
use crate::store::{IndexPrefix, ProjectionStore};
use anyhow::{Context, Result};
use csv::Writer;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use tracing::info;

pub const RECORDS_FILE: &str = "records.csv";
pub const PLAYER_INDEX_FILE: &str = "player_index.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub records: u64,
    pub index_entries: u64,
}

fn create_writer(path: &Path) -> Result<Writer<BufWriter<File>>> {
    let file =
        File::create(path).with_context(|| format!("Failed to create export file: {:?}", path))?;
    Ok(Writer::from_writer(BufWriter::with_capacity(
        EXPORT_BUFFER_SIZE,
        file,
    )))
}

/// Writes `records.csv` and `player_index.csv` into `output_dir`. Records are
/// in primary-key order, index rows in (league, stat, player) order.
pub fn export_csv<S: ProjectionStore + ?Sized>(store: &S, output_dir: &Path) -> Result<ExportSummary> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;

    let mut records = create_writer(&output_dir.join(RECORDS_FILE))?;
    let mut written = 0u64;
    let mut write_error = None;
    store.for_each_record(&mut |record| {
        if write_error.is_some() {
            return;
        }
        match records.serialize(record) {
            Ok(()) => written += 1,
            Err(e) => write_error = Some(e),
        }
    })?;
    if let Some(e) = write_error {
        return Err(e).context("Failed to write record row");
    }
    records.flush()?;

    let mut index = create_writer(&output_dir.join(PLAYER_INDEX_FILE))?;
    let entries = store.index_entries(&IndexPrefix::all())?;
    for entry in &entries {
        index.serialize(entry)?;
    }
    index.flush()?;

    let summary = ExportSummary {
        records: written,
        index_entries: entries.len() as u64,
    };
    info!(
        records = summary.records,
        index_entries = summary.index_entries,
        dir = %output_dir.display(),
        "Export complete"
    );
    Ok(summary)
}
