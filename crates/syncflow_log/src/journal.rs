//! Durable journals backing the action log.
//!
//! A journal is an append-only sequence of [`JournalEntry`] values. The log
//! writes every record and edge to its journal before indexing it, and
//! [`crate::ActionLog::recover`] replays a journal to rebuild the indexes.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::edge::ProvenanceEdge;
use crate::error::{LogError, LogResult};
use crate::record::ActionRecord;

/// One journaled fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalEntry {
    /// An appended record.
    Record(ActionRecord),
    /// An appended provenance edge.
    Edge(ProvenanceEdge),
}

/// Append-only store for journal entries.
///
/// # Invariants
///
/// - `write` is all-or-nothing for the batch: after an error no entry of the
///   batch is visible to `read_all`
/// - `read_all` returns entries in write order
pub trait Journal: Send + Sync {
    /// Appends a batch of entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be made durable.
    fn write(&self, entries: &[JournalEntry]) -> LogResult<()>;

    /// Reads every entry in write order.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or decoded.
    fn read_all(&self) -> LogResult<Vec<JournalEntry>>;

    /// Forces written entries to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    fn sync(&self) -> LogResult<()> {
        Ok(())
    }
}

/// In-memory journal for tests and ephemeral engines.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: RwLock<Vec<JournalEntry>>,
}

impl MemoryJournal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Journal for MemoryJournal {
    fn write(&self, entries: &[JournalEntry]) -> LogResult<()> {
        self.entries.write().extend_from_slice(entries);
        Ok(())
    }

    fn read_all(&self) -> LogResult<Vec<JournalEntry>> {
        Ok(self.entries.read().clone())
    }
}

/// File journal of length-prefixed CBOR frames.
///
/// Each frame is a little-endian `u32` length followed by one CBOR-encoded
/// [`JournalEntry`]. A batch is encoded into one buffer and written with a
/// single `write_all`; if that fails the file is truncated back to its
/// previous length. A torn trailing frame left by a crash is cut off when the
/// journal is opened or read, so later frames stay aligned.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
    sync_on_write: bool,
}

impl FileJournal {
    /// Opens or creates a journal file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> LogResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        cut_torn_tail(&file, path, &bytes)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            sync_on_write: false,
        })
    }

    /// Calls `sync_all` after every batch.
    #[must_use]
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Returns the path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(entries: &[JournalEntry]) -> LogResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut frame = Vec::new();
        for entry in entries {
            frame.clear();
            ciborium::into_writer(entry, &mut frame).map_err(|e| LogError::codec(e.to_string()))?;
            let len = u32::try_from(frame.len())
                .map_err(|_| LogError::codec("journal frame exceeds 4 GiB"))?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&frame);
        }
        Ok(out)
    }
}

impl Journal for FileJournal {
    fn write(&self, entries: &[JournalEntry]) -> LogResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let bytes = Self::encode(entries)?;

        let mut file = self.file.lock();
        let start = file.seek(SeekFrom::End(0))?;
        let written = file.write_all(&bytes).and_then(|()| {
            if self.sync_on_write {
                file.sync_data()
            } else {
                file.flush()
            }
        });
        if let Err(err) = written {
            if let Err(rollback) = file.set_len(start) {
                warn!(path = %self.path.display(), error = %rollback, "journal rollback failed");
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn read_all(&self) -> LogResult<Vec<JournalEntry>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut entries = Vec::new();
        for (offset, frame) in Frames::new(&bytes) {
            let entry: JournalEntry = ciborium::from_reader(frame)
                .map_err(|e| LogError::Corrupted(format!("frame at offset {offset}: {e}")))?;
            entries.push(entry);
        }
        cut_torn_tail(&file, &self.path, &bytes)?;
        Ok(entries)
    }

    fn sync(&self) -> LogResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

/// Complete frames of a journal image, with their offsets.
struct Frames<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Frames<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = (usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.bytes[self.offset..];
        if rest.len() < 4 {
            return None;
        }
        let mut len = [0u8; 4];
        len.copy_from_slice(&rest[..4]);
        let len = u32::from_le_bytes(len) as usize;
        if rest.len() - 4 < len {
            return None;
        }
        let start = self.offset;
        self.offset += 4 + len;
        Some((start, &rest[4..4 + len]))
    }
}

/// Truncates `file` to the end of its last complete frame.
fn cut_torn_tail(file: &File, path: &Path, bytes: &[u8]) -> LogResult<()> {
    let end = Frames::new(bytes)
        .last()
        .map_or(0, |(offset, frame)| offset + 4 + frame.len());
    if end < bytes.len() {
        warn!(
            path = %path.display(),
            offset = end,
            dropped = bytes.len() - end,
            "truncating torn journal tail"
        );
        file.set_len(end as u64)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ActionRecord, Fields, FlowId, RecordId};
    use tempfile::tempdir;

    fn sample() -> Vec<JournalEntry> {
        let flow = FlowId::new();
        let inv = ActionRecord::invocation("A", "a", Fields::new(), flow);
        let done = ActionRecord::completes(&inv, "ok", Fields::new());
        let next = ActionRecord::invocation("B", "b", Fields::new(), flow).with_parent(done.id);
        let edge = ProvenanceEdge::new(done.id, next.id, "R");
        vec![
            JournalEntry::Record(inv),
            JournalEntry::Record(done),
            JournalEntry::Record(next),
            JournalEntry::Edge(edge),
        ]
    }

    #[test]
    fn memory_journal_preserves_order() {
        let journal = MemoryJournal::new();
        let entries = sample();
        journal.write(&entries[..2]).unwrap();
        journal.write(&entries[2..]).unwrap();
        assert_eq!(journal.len(), 4);
        assert_eq!(journal.read_all().unwrap(), entries);
    }

    #[test]
    fn file_journal_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flows.journal");
        let entries = sample();
        {
            let journal = FileJournal::open(&path).unwrap();
            journal.write(&entries).unwrap();
            journal.sync().unwrap();
        }
        let journal = FileJournal::open(&path).unwrap();
        assert_eq!(journal.read_all().unwrap(), entries);
    }

    #[test]
    fn file_journal_ignores_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.journal");
        let entries = sample();
        let journal = FileJournal::open(&path).unwrap();
        journal.write(&entries).unwrap();
        drop(journal);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(file);

        let journal = FileJournal::open(&path).unwrap();
        assert_eq!(journal.read_all().unwrap(), entries);
    }

    #[test]
    fn appends_after_a_torn_tail_survive_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn.journal");
        let entries = sample();
        FileJournal::open(&path).unwrap().write(&entries[..1]).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[9, 0]).unwrap();
        drop(file);

        let journal = FileJournal::open(&path).unwrap();
        assert_eq!(journal.read_all().unwrap(), entries[..1]);
        journal.write(&entries[1..2]).unwrap();
        drop(journal);

        let journal = FileJournal::open(&path).unwrap();
        assert_eq!(journal.read_all().unwrap(), entries[..2]);
    }

    #[test]
    fn file_journal_rejects_garbage_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.journal");
        std::fs::write(&path, [3, 0, 0, 0, 0xff, 0xff, 0xff]).unwrap();
        let journal = FileJournal::open(&path).unwrap();
        assert!(matches!(journal.read_all(), Err(LogError::Corrupted(_))));
    }

    #[test]
    fn file_journal_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("log.journal");
        let journal = FileJournal::open(&path).unwrap();
        journal
            .write(&[JournalEntry::Edge(ProvenanceEdge::new(
                RecordId::new(),
                RecordId::new(),
                "R",
            ))])
            .unwrap();
        assert!(path.exists());
        assert_eq!(journal.path(), path.as_path());
    }
}
