use super::{IndexPrefix, ProjectionStore, StoreState, WriteBatch, WriterLock};
use crate::config::{MAX_JOURNAL_FRAME_BYTES, STORE_VERSION};
use crate::error::StorageError;
use crate::models::{CanonicalRecord, CompositeIndexEntry};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

const FRAME_HEADER_BYTES: usize = 8;

#[derive(Deserialize)]
enum JournalEntryDe {
    Batch(WriteBatch),
    ReplaceDerived {
        index: BTreeSet<CompositeIndexEntry>,
        counts: BTreeMap<String, u64>,
    },
}

/// Borrowing twin of `JournalEntryDe`; same variant order, same encoding.
#[derive(Serialize)]
enum JournalEntrySer<'a> {
    Batch(&'a WriteBatch),
    ReplaceDerived {
        index: &'a BTreeSet<CompositeIndexEntry>,
        counts: &'a BTreeMap<String, u64>,
    },
}

#[derive(Deserialize)]
struct SnapshotDe {
    version: u32,
    state: StoreState,
}

#[derive(Serialize)]
struct SnapshotSer<'a> {
    version: u32,
    state: &'a StoreState,
}

struct Inner {
    state: StoreState,
    journal: File,
    journal_len: u64,
}

/// Journaled on-disk store. `snapshot.bin` holds the last compacted state and
/// `journal.bin` one length-prefixed bincode frame per commit.
///
/// A commit appends one frame and syncs it before the in-memory state is
/// touched. A failed append truncates the journal back to its previous
/// length. A frame torn by a crash is dropped on open.
pub struct FileStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
    lock: WriterLock,
}

pub fn snapshot_path(dir: &Path) -> PathBuf {
    dir.join("snapshot.bin")
}

pub fn journal_path(dir: &Path) -> PathBuf {
    dir.join("journal.bin")
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut state = load_snapshot(&snapshot_path(&dir))?;

        let mut journal = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(journal_path(&dir))?;
        let (frames, journal_len) = replay_journal(&mut journal, &mut state)?;

        info!(
            path = ?dir,
            records = state.record_count(),
            frames,
            dirty = state.aggregate_dirty(),
            "Store opened"
        );

        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                state,
                journal,
                journal_len,
            }),
            lock: WriterLock::default(),
        })
    }

    fn inner(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner
            .lock()
            .map_err(|e| StorageError::Unavailable(format!("store lock poisoned: {e}")))
    }

    /// Folds the journal into a fresh snapshot and empties the journal.
    pub fn compact(&self) -> Result<(), StorageError> {
        let mut inner = self.inner()?;
        let path = snapshot_path(&self.dir);
        let tmp_path = path.with_extension("bin.tmp");

        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        bincode::DefaultOptions::new().serialize_into(
            &mut writer,
            &SnapshotSer {
                version: STORE_VERSION,
                state: &inner.state,
            },
        )?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        fs::rename(&tmp_path, &path)?;

        // Replay is idempotent, so crashing before this truncation only
        // re-applies frames the snapshot already contains.
        inner.journal.set_len(0)?;
        inner.journal.sync_all()?;
        inner.journal_len = 0;

        info!(records = inner.state.record_count(), "Store compacted");
        Ok(())
    }

    fn append(&self, inner: &mut Inner, entry: &JournalEntrySer<'_>) -> Result<(), StorageError> {
        let payload = bincode::DefaultOptions::new().serialize(entry)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
        frame.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        frame.extend_from_slice(&payload);

        let start = inner.journal_len;
        let written = inner
            .journal
            .seek(SeekFrom::Start(start))
            .and_then(|_| inner.journal.write_all(&frame))
            .and_then(|_| inner.journal.sync_data());

        if let Err(e) = written {
            if let Err(trunc) = inner.journal.set_len(start) {
                warn!(error = %trunc, "Failed to roll back partial journal frame");
            }
            return Err(e.into());
        }

        inner.journal_len = start + frame.len() as u64;
        debug!(bytes = frame.len(), journal_len = inner.journal_len, "Journal frame synced");
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> Result<StoreState, StorageError> {
    if !path.exists() {
        return Ok(StoreState::default());
    }

    let file_size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let reader = BufReader::with_capacity(256 * 1024, File::open(path)?);
    let options = bincode::options().with_limit(file_size.saturating_add(1024));

    let snapshot: SnapshotDe = options
        .deserialize_from(reader)
        .map_err(|e| StorageError::Corrupt(format!("snapshot {path:?}: {e}")))?;

    if snapshot.version != STORE_VERSION {
        return Err(StorageError::Corrupt(format!(
            "snapshot version {} (expected {STORE_VERSION})",
            snapshot.version
        )));
    }
    Ok(snapshot.state)
}

/// Applies every complete frame and truncates a torn tail. Returns the frame
/// count and the length of the valid prefix.
fn replay_journal(journal: &mut File, state: &mut StoreState) -> Result<(usize, u64), StorageError> {
    let mut bytes = Vec::new();
    journal.seek(SeekFrom::Start(0))?;
    journal.read_to_end(&mut bytes)?;

    let mut pos = 0usize;
    let mut frames = 0usize;
    while pos < bytes.len() {
        let remaining = bytes.len() - pos;
        if remaining < FRAME_HEADER_BYTES {
            break;
        }
        let mut header = [0u8; FRAME_HEADER_BYTES];
        header.copy_from_slice(&bytes[pos..pos + FRAME_HEADER_BYTES]);
        let len = u64::from_le_bytes(header);
        if len > MAX_JOURNAL_FRAME_BYTES || len as usize > remaining - FRAME_HEADER_BYTES {
            break;
        }

        let body = &bytes[pos + FRAME_HEADER_BYTES..pos + FRAME_HEADER_BYTES + len as usize];
        let entry: JournalEntryDe = match bincode::options().with_limit(len).deserialize(body) {
            Ok(entry) => entry,
            Err(e) if pos + FRAME_HEADER_BYTES + len as usize == bytes.len() => {
                warn!(offset = pos, error = %e, "Undecodable final journal frame");
                break;
            }
            Err(e) => {
                return Err(StorageError::Corrupt(format!(
                    "journal frame at offset {pos}: {e}"
                )))
            }
        };

        match entry {
            JournalEntryDe::Batch(batch) => state.apply(&batch),
            JournalEntryDe::ReplaceDerived { index, counts } => state.replace_derived(index, counts),
        }
        pos += FRAME_HEADER_BYTES + len as usize;
        frames += 1;
    }

    if pos < bytes.len() {
        warn!(
            valid = pos,
            discarded = bytes.len() - pos,
            "Discarding torn journal tail"
        );
        journal.set_len(pos as u64)?;
        journal.sync_all()?;
    }

    Ok((frames, pos as u64))
}

impl ProjectionStore for FileStore {
    fn get(&self, id: &str) -> Result<Option<CanonicalRecord>, StorageError> {
        Ok(self.inner()?.state.get(id).cloned())
    }

    fn commit(&self, batch: &WriteBatch) -> Result<(), StorageError> {
        let mut inner = self.inner()?;
        self.append(&mut inner, &JournalEntrySer::Batch(batch))?;
        inner.state.apply(batch);
        Ok(())
    }

    fn index_entries(&self, prefix: &IndexPrefix) -> Result<Vec<CompositeIndexEntry>, StorageError> {
        Ok(self.inner()?.state.index_entries(prefix))
    }

    fn for_each_record(&self, f: &mut dyn FnMut(&CanonicalRecord)) -> Result<(), StorageError> {
        self.inner()?.state.records().for_each(f);
        Ok(())
    }

    fn record_count(&self) -> Result<usize, StorageError> {
        Ok(self.inner()?.state.record_count())
    }

    fn player_counts(&self) -> Result<BTreeMap<String, u64>, StorageError> {
        Ok(self.inner()?.state.player_counts().clone())
    }

    fn aggregate_dirty(&self) -> Result<bool, StorageError> {
        Ok(self.inner()?.state.aggregate_dirty())
    }

    fn replace_derived(
        &self,
        index: BTreeSet<CompositeIndexEntry>,
        counts: BTreeMap<String, u64>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner()?;
        self.append(
            &mut inner,
            &JournalEntrySer::ReplaceDerived {
                index: &index,
                counts: &counts,
            },
        )?;
        inner.state.replace_derived(index, counts);
        Ok(())
    }

    fn writer_lock(&self) -> &WriterLock {
        &self.lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AggregateMode;
    use tempfile::TempDir;

    fn record(id: &str, player: &str) -> CanonicalRecord {
        CanonicalRecord {
            id: id.to_string(),
            player: player.to_string(),
            team: "LAL".to_string(),
            position: "F".to_string(),
            league: "NBA".to_string(),
            stat: "Points".to_string(),
            line: 25.5,
            start_time: "2024-01-10T19:00:00Z".to_string(),
            status: "pre_game".to_string(),
            game_id: Some("g1".to_string()),
        }
    }

    fn batch(ids: &[&str], aggregate: AggregateMode) -> WriteBatch {
        let records: Vec<_> = ids.iter().map(|id| record(id, "LeBron James")).collect();
        WriteBatch {
            index_entries: records.iter().map(CompositeIndexEntry::from_record).collect(),
            records,
            aggregate,
        }
    }

    #[test]
    fn commits_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.commit(&batch(&["1", "2"], AggregateMode::Incremental)).unwrap();
            store.commit(&batch(&["3"], AggregateMode::Incremental)).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.record_count().unwrap(), 3);
        assert_eq!(store.get("2").unwrap().unwrap().line, 25.5);
        assert_eq!(store.player_counts().unwrap().get("LeBron James"), Some(&3));
        assert_eq!(store.index_entries(&IndexPrefix::all()).unwrap().len(), 1);
    }

    #[test]
    fn torn_tail_is_discarded_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.commit(&batch(&["1"], AggregateMode::Incremental)).unwrap();
        }
        let valid_len = fs::metadata(journal_path(dir.path())).unwrap().len();
        {
            let mut journal = OpenOptions::new()
                .append(true)
                .open(journal_path(dir.path()))
                .unwrap();
            journal.write_all(&500u64.to_le_bytes()).unwrap();
            journal.write_all(b"half a frame").unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.record_count().unwrap(), 1);
        assert_eq!(
            fs::metadata(journal_path(dir.path())).unwrap().len(),
            valid_len
        );

        store.commit(&batch(&["2"], AggregateMode::Incremental)).unwrap();
        drop(store);
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.record_count().unwrap(), 2);
    }

    #[test]
    fn compact_folds_journal_into_snapshot() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.commit(&batch(&["1", "2"], AggregateMode::Deferred)).unwrap();
            store.compact().unwrap();
            assert_eq!(fs::metadata(journal_path(dir.path())).unwrap().len(), 0);
            store.commit(&batch(&["3"], AggregateMode::Deferred)).unwrap();
        }
        assert!(snapshot_path(dir.path()).exists());
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.record_count().unwrap(), 3);
        assert!(store.aggregate_dirty().unwrap());
    }

    #[test]
    fn replace_derived_is_journaled() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.commit(&batch(&["1"], AggregateMode::Deferred)).unwrap();
            store
                .replace_derived(
                    BTreeSet::from([CompositeIndexEntry::new("NBA", "Points", "LeBron James")]),
                    BTreeMap::from([("LeBron James".to_string(), 1)]),
                )
                .unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert!(!store.aggregate_dirty().unwrap());
        assert_eq!(store.player_counts().unwrap().get("LeBron James"), Some(&1));
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(snapshot_path(dir.path()), b"definitely not bincode").unwrap();
        assert!(matches!(
            FileStore::open(dir.path()),
            Err(StorageError::Corrupt(_))
        ));
    }
}
