//! Journal Module
//!
//! Append-only write-ahead log backing the disk cache index. Every index
//! mutation is recorded as one text line and flushed before the in-memory
//! index changes, so replaying the file after a crash reconstructs exactly
//! the state the index had observed.
//!
//! File layout:
//!
//! ```text
//! edge-node.disk-cache
//! 1
//! <application version>
//! <slot count>
//!
//! DIRTY 3400330d1dfc7f3f7f4b8d4d803dfcf6
//! CLEAN 3400330d1dfc7f3f7f4b8d4d803dfcf6 832 21054
//! READ 3400330d1dfc7f3f7f4b8d4d803dfcf6
//! REMOVE 3400330d1dfc7f3f7f4b8d4d803dfcf6
//! ```

use crate::{NodeError, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const JOURNAL_FILE: &str = "journal";
pub const JOURNAL_FILE_TEMP: &str = "journal.tmp";
pub const JOURNAL_FILE_BACKUP: &str = "journal.bkp";

const MAGIC: &str = "edge-node.disk-cache";
const FORMAT_VERSION: &str = "1";

/// Header written at the top of every journal file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalHeader {
    pub app_version: u32,
    pub value_count: usize,
}

impl JournalHeader {
    pub fn new(app_version: u32, value_count: usize) -> Self {
        Self {
            app_version,
            value_count,
        }
    }

    fn lines(&self) -> Vec<String> {
        vec![
            MAGIC.to_string(),
            FORMAT_VERSION.to_string(),
            self.app_version.to_string(),
            self.value_count.to_string(),
            String::new(),
        ]
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        for line in self.lines() {
            writeln!(writer, "{}", line)?;
        }
        Ok(())
    }

    /// Compare the header lines found on disk against the expected ones.
    fn verify(&self, found: &[&str]) -> Result<()> {
        let expected = self.lines();
        let matches = found.len() == expected.len()
            && found.iter().zip(expected.iter()).all(|(f, e)| f == e);
        if matches {
            Ok(())
        } else {
            Err(NodeError::HeaderMismatch {
                expected: expected.join(", "),
                found: found.join(", "),
            })
        }
    }
}

/// One journal line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// A committed entry and the byte length of each slot
    Clean { key: String, lengths: Vec<u64> },
    /// An edit started
    Dirty(String),
    /// An entry was deleted
    Remove(String),
    /// An entry was read
    Read(String),
}

impl JournalRecord {
    pub fn key(&self) -> &str {
        match self {
            JournalRecord::Clean { key, .. } => key,
            JournalRecord::Dirty(key) | JournalRecord::Remove(key) | JournalRecord::Read(key) => {
                key
            }
        }
    }

    /// Parse one journal line. Returns `None` for anything malformed,
    /// including a CLEAN line whose length count differs from `value_count`.
    pub fn parse(line: &str, value_count: usize) -> Option<Self> {
        let mut parts = line.split(' ');
        let kind = parts.next()?;
        let key = parts.next().filter(|k| !k.is_empty())?.to_string();

        match kind {
            "CLEAN" => {
                let lengths = parts
                    .map(|p| p.parse::<u64>().ok())
                    .collect::<Option<Vec<u64>>>()?;
                if lengths.len() != value_count {
                    return None;
                }
                Some(JournalRecord::Clean { key, lengths })
            }
            "DIRTY" | "REMOVE" | "READ" => {
                if parts.next().is_some() {
                    return None;
                }
                Some(match kind {
                    "DIRTY" => JournalRecord::Dirty(key),
                    "REMOVE" => JournalRecord::Remove(key),
                    _ => JournalRecord::Read(key),
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for JournalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalRecord::Clean { key, lengths } => {
                write!(f, "CLEAN {}", key)?;
                for length in lengths {
                    write!(f, " {}", length)?;
                }
                Ok(())
            }
            JournalRecord::Dirty(key) => write!(f, "DIRTY {}", key),
            JournalRecord::Remove(key) => write!(f, "REMOVE {}", key),
            JournalRecord::Read(key) => write!(f, "READ {}", key),
        }
    }
}

/// Appends records to the live journal file.
pub struct JournalWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JournalWriter {
    /// Open an existing journal for appending.
    pub fn open_append(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().append(true).open(path).map_err(|e| {
            NodeError::JournalError(format!("Failed to open journal {:?}: {}", path, e))
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    /// Append one record and flush it to the OS before returning.
    pub fn append(&mut self, record: &JournalRecord) -> Result<()> {
        writeln!(self.writer, "{}", record)
            .and_then(|_| self.writer.flush())
            .map_err(|e| {
                NodeError::JournalError(format!(
                    "Failed to append to journal {:?}: {}",
                    self.path, e
                ))
            })
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| {
            NodeError::JournalError(format!("Failed to flush journal {:?}: {}", self.path, e))
        })
    }
}

/// An index entry reconstructed from the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedEntry {
    pub key: String,
    pub lengths: Vec<u64>,
    /// A CLEAN record was seen for the current incarnation of the key
    pub readable: bool,
    /// The last DIRTY record has no terminating CLEAN or REMOVE
    pub dirty: bool,
}

/// Result of replaying a journal.
#[derive(Debug, Default)]
pub struct JournalReplay {
    /// Surviving entries, least recently used first
    pub entries: Vec<ReplayedEntry>,
    /// Number of well-formed records read
    pub record_count: usize,
    /// Number of lines that could not be parsed
    pub corrupt_lines: usize,
}

impl JournalReplay {
    /// Records that a compact journal would not need.
    pub fn redundant_count(&self) -> usize {
        self.record_count.saturating_sub(self.entries.len())
    }
}

/// Apply records in order to an empty index.
pub fn replay<I>(records: I, value_count: usize) -> JournalReplay
where
    I: IntoIterator<Item = JournalRecord>,
{
    let mut index: HashMap<String, (ReplayedEntry, u64)> = HashMap::new();
    let mut recency = 0u64;
    let mut record_count = 0usize;

    for record in records {
        record_count += 1;
        recency += 1;

        match record {
            JournalRecord::Remove(key) => {
                index.remove(&key);
            }
            other => {
                let key = other.key().to_string();
                let (entry, last_used) = index.entry(key.clone()).or_insert_with(|| {
                    (
                        ReplayedEntry {
                            key,
                            lengths: vec![0; value_count],
                            readable: false,
                            dirty: false,
                        },
                        0,
                    )
                });
                *last_used = recency;

                match other {
                    JournalRecord::Clean { lengths, .. } => {
                        entry.lengths = lengths;
                        entry.readable = true;
                        entry.dirty = false;
                    }
                    JournalRecord::Dirty(_) => entry.dirty = true,
                    JournalRecord::Read(_) | JournalRecord::Remove(_) => {}
                }
            }
        }
    }

    let mut entries: Vec<(ReplayedEntry, u64)> = index.into_values().collect();
    entries.sort_by_key(|(_, last_used)| *last_used);

    JournalReplay {
        entries: entries.into_iter().map(|(entry, _)| entry).collect(),
        record_count,
        corrupt_lines: 0,
    }
}

/// Read and replay the journal at `path`.
///
/// A header that does not match `header` is fatal. Malformed record lines,
/// including a final line cut short by a crash, are skipped and counted so
/// the caller can rewrite the journal.
pub fn read_journal(path: &Path, header: &JournalHeader) -> Result<JournalReplay> {
    let raw = std::fs::read(path).map_err(|e| {
        NodeError::JournalError(format!("Failed to read journal {:?}: {}", path, e))
    })?;
    let content = String::from_utf8_lossy(&raw);
    let complete = content.ends_with('\n');

    let mut lines: Vec<&str> = content.split('\n').collect();
    // split leaves an empty tail after the final newline
    if complete {
        lines.pop();
    }

    let header_len = header.lines().len();
    if lines.len() < header_len {
        return Err(NodeError::HeaderMismatch {
            expected: header.lines().join(", "),
            found: lines.join(", "),
        });
    }
    header.verify(&lines[..header_len])?;

    let body = &lines[header_len..];
    let mut records = Vec::with_capacity(body.len());
    let mut corrupt_lines = 0usize;

    for (i, line) in body.iter().enumerate() {
        let truncated = !complete && i == body.len() - 1;
        match JournalRecord::parse(line, header.value_count) {
            Some(record) if !truncated => records.push(record),
            _ => {
                corrupt_lines += 1;
                warn!(
                    "Skipping corrupt journal line: path={:?}, line={}, content={:?}",
                    path,
                    header_len + i + 1,
                    line
                );
            }
        }
    }

    let mut replay = replay(records, header.value_count);
    replay.corrupt_lines = corrupt_lines;

    debug!(
        "Journal replayed: path={:?}, records={}, entries={}, corrupt_lines={}",
        path,
        replay.record_count,
        replay.entries.len(),
        replay.corrupt_lines
    );

    Ok(replay)
}

/// Replace the journal in `directory` with a fresh one holding `records`.
///
/// The new journal is written to a temp file and synced, the live journal is
/// moved to a backup, the temp file is renamed over the live name and the
/// backup is deleted. A crash at any point leaves either the old or the new
/// journal recoverable by [`restore_backup`].
pub fn write_compacted(
    directory: &Path,
    header: &JournalHeader,
    records: &[JournalRecord],
) -> Result<()> {
    let journal_path = directory.join(JOURNAL_FILE);
    let temp_path = directory.join(JOURNAL_FILE_TEMP);
    let backup_path = directory.join(JOURNAL_FILE_BACKUP);

    let write_temp = || -> std::io::Result<()> {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        header.write_to(&mut writer)?;
        for record in records {
            writeln!(writer, "{}", record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    };

    write_temp().map_err(|e| {
        let _ = std::fs::remove_file(&temp_path);
        NodeError::JournalError(format!(
            "Failed to write compacted journal {:?}: {}",
            temp_path, e
        ))
    })?;

    if journal_path.exists() {
        std::fs::rename(&journal_path, &backup_path).map_err(|e| {
            NodeError::JournalError(format!("Failed to back up journal: {}", e))
        })?;
    }

    std::fs::rename(&temp_path, &journal_path).map_err(|e| {
        NodeError::JournalError(format!("Failed to install compacted journal: {}", e))
    })?;

    if let Err(e) = std::fs::remove_file(&backup_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to delete journal backup {:?}: {}", backup_path, e);
        }
    }

    info!(
        "Journal compacted: path={:?}, records={}",
        journal_path,
        records.len()
    );

    Ok(())
}

/// Recover from a crash during [`write_compacted`]: a backup with no live
/// journal becomes the live journal, a backup next to a live journal is stale.
pub fn restore_backup(directory: &Path) -> Result<()> {
    let journal_path = directory.join(JOURNAL_FILE);
    let backup_path = directory.join(JOURNAL_FILE_BACKUP);

    if !backup_path.exists() {
        return Ok(());
    }

    if journal_path.exists() {
        debug!("Deleting stale journal backup {:?}", backup_path);
        std::fs::remove_file(&backup_path)?;
    } else {
        info!("Restoring journal from backup {:?}", backup_path);
        std::fs::rename(&backup_path, &journal_path)?;
    }

    Ok(())
}
