//! Disk Cache Module
//!
//! Size-bounded LRU cache of fixed-slot entries stored as plain files. The
//! in-memory index is rebuilt from the journal on open and every index change
//! is journaled before it is applied.
//!
//! Entries move through ABSENT -> PENDING (an [`Editor`] is outstanding) ->
//! CLEAN (committed) -> REMOVED. Readers obtain a [`Snapshot`] holding open
//! slot files, which stays readable even if the entry is replaced or removed
//! afterwards.

use crate::journal::{
    self, JournalHeader, JournalRecord, JournalReplay, JournalWriter, JOURNAL_FILE,
    JOURNAL_FILE_TEMP,
};
use crate::{NodeError, Result};
use fs2::FileExt;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

const LOCK_FILE: &str = ".lock";
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;
const MAX_KEY_LENGTH: usize = 120;

/// Index entry for one key.
#[derive(Debug, Clone)]
struct Entry {
    lengths: Vec<u64>,
    /// A committed value exists on disk
    readable: bool,
    /// An Editor is outstanding
    editing: bool,
    /// Changes on every commit; 0 until the first one
    sequence: u64,
    /// Position in the LRU order, 0 when not yet ordered
    recency: u64,
}

impl Entry {
    fn new(value_count: usize) -> Self {
        Self {
            lengths: vec![0; value_count],
            readable: false,
            editing: false,
            sequence: 0,
            recency: 0,
        }
    }

    fn total_len(&self) -> u64 {
        self.lengths.iter().sum()
    }
}

struct CacheState {
    journal: Option<JournalWriter>,
    /// Set after a journal write fails; the engine refuses further work
    failed: bool,
    entries: HashMap<String, Entry>,
    /// recency -> key, least recently used first
    lru: BTreeMap<u64, String>,
    /// Live snapshot count per key
    pins: HashMap<String, usize>,
    next_recency: u64,
    next_sequence: u64,
    size: u64,
    redundant_op_count: usize,
    _lock_file: File,
}

impl CacheState {
    fn new(lock_file: File) -> Self {
        Self {
            journal: None,
            failed: false,
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            pins: HashMap::new(),
            next_recency: 1,
            next_sequence: 1,
            size: 0,
            redundant_op_count: 0,
            _lock_file: lock_file,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.failed {
            return Err(NodeError::JournalError(
                "journal failed earlier, cache is unusable".to_string(),
            ));
        }
        if self.journal.is_none() {
            return Err(NodeError::CacheClosed);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.failed && self.journal.is_some()
    }

    fn append(&mut self, record: JournalRecord) -> Result<()> {
        self.ensure_open()?;
        let result = match self.journal.as_mut() {
            Some(journal) => journal.append(&record),
            None => Err(NodeError::CacheClosed),
        };
        if let Err(e) = &result {
            error!("Journal append failed, disabling cache: {}", e);
            self.journal = None;
            self.failed = true;
        }
        result
    }

    fn touch(&mut self, key: &str) {
        let recency = self.next_recency;
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.recency != 0 {
                self.lru.remove(&entry.recency);
            }
            entry.recency = recency;
            self.lru.insert(recency, key.to_string());
            self.next_recency += 1;
        }
    }

    fn is_evictable(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.readable && !e.editing)
            && !self.pins.contains_key(key)
    }

    fn journal_rebuild_required(&self) -> bool {
        self.redundant_op_count >= REDUNDANT_OP_COMPACT_THRESHOLD
            && self.redundant_op_count >= self.entries.len()
    }
}

/// Journaled, size-bounded LRU cache on local disk.
pub struct DiskCache {
    directory: PathBuf,
    header: JournalHeader,
    max_size: u64,
    state: Mutex<CacheState>,
}

impl DiskCache {
    /// Open (or create) the cache in `directory`.
    ///
    /// # Arguments
    /// * `value_count` - Number of slots per entry, recorded in the journal header
    /// * `app_version` - Application version, recorded in the journal header
    /// * `max_size` - Byte budget for committed slot data
    ///
    /// # Errors
    /// Returns `HeaderMismatch` if the existing journal was written with a
    /// different format, version or slot count, and an I/O or journal error
    /// if the directory cannot be prepared. Another process holding the
    /// directory lock is reported as a `CacheError`.
    pub fn open(
        directory: impl Into<PathBuf>,
        value_count: usize,
        app_version: u32,
        max_size: u64,
    ) -> Result<Arc<Self>> {
        let directory = directory.into();
        if value_count == 0 {
            return Err(NodeError::ConfigError(
                "value_count must be at least 1".to_string(),
            ));
        }
        if max_size == 0 {
            return Err(NodeError::ConfigError(
                "max_size must be greater than 0".to_string(),
            ));
        }

        std::fs::create_dir_all(&directory).map_err(|e| {
            NodeError::IoError(format!(
                "Failed to create cache directory {:?}: {}",
                directory, e
            ))
        })?;

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(directory.join(LOCK_FILE))?;
        lock_file.try_lock_exclusive().map_err(|e| {
            NodeError::CacheError(format!(
                "Cache directory {:?} is in use by another process: {}",
                directory, e
            ))
        })?;

        journal::restore_backup(&directory)?;

        let cache = Self {
            directory,
            header: JournalHeader::new(app_version, value_count),
            max_size,
            state: Mutex::new(CacheState::new(lock_file)),
        };
        let journal_path = cache.directory.join(JOURNAL_FILE);

        {
            let mut state = cache.lock_state();
            let mut rebuild = cache.directory.join(JOURNAL_FILE_TEMP).exists();

            if journal_path.exists() {
                let replay = journal::read_journal(&journal_path, &cache.header)?;
                state.redundant_op_count = replay.redundant_count();
                if cache.process_replay(&mut state, replay)? > 0 {
                    rebuild = true;
                }
            } else {
                rebuild = true;
            }

            if rebuild || state.journal_rebuild_required() {
                cache.rebuild_journal(&mut state)?;
            } else {
                state.journal = Some(JournalWriter::open_append(&journal_path)?);
            }
            cache.trim_to_size(&mut state, None)?;

            info!(
                "Disk cache opened: directory={:?}, entries={}, size={} bytes, max_size={} bytes",
                cache.directory,
                state.entries.len(),
                state.size,
                cache.max_size
            );
        }

        Ok(Arc::new(cache))
    }

    /// Install replayed entries into `state` after checking their files.
    /// Returns the number of entries dropped as corrupt.
    fn process_replay(&self, state: &mut CacheState, replay: JournalReplay) -> Result<usize> {
        let mut dropped = replay.corrupt_lines;

        for replayed in replay.entries {
            for slot in 0..self.header.value_count {
                remove_if_exists(&self.dirty_path(&replayed.key, slot))?;
            }

            if replayed.dirty || !replayed.readable {
                debug!("Discarding interrupted edit: key={}", replayed.key);
                for slot in 0..self.header.value_count {
                    remove_if_exists(&self.clean_path(&replayed.key, slot))?;
                }
                continue;
            }

            let intact = (0..self.header.value_count).all(|slot| {
                std::fs::metadata(self.clean_path(&replayed.key, slot))
                    .map(|m| m.len() == replayed.lengths[slot])
                    .unwrap_or(false)
            });
            if !intact {
                warn!(
                    "Dropping corrupt cache entry: key={}, expected_lengths={:?}",
                    replayed.key, replayed.lengths
                );
                for slot in 0..self.header.value_count {
                    remove_if_exists(&self.clean_path(&replayed.key, slot))?;
                }
                dropped += 1;
                continue;
            }

            let mut entry = Entry::new(self.header.value_count);
            entry.lengths = replayed.lengths;
            entry.readable = true;
            entry.sequence = state.next_sequence;
            state.next_sequence += 1;
            state.size += entry.total_len();
            state.entries.insert(replayed.key.clone(), entry);
            state.touch(&replayed.key);
        }

        Ok(dropped)
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return a snapshot of the committed value for `key`, if any.
    ///
    /// The entry becomes the most recently used. If its files have vanished
    /// from disk the entry is dropped and `None` is returned.
    pub fn get(self: &Arc<Self>, key: &str) -> Result<Option<Snapshot>> {
        validate_key(key)?;
        let mut state = self.lock_state();
        state.ensure_open()?;

        let (lengths, sequence, editing) = match state.entries.get(key) {
            Some(entry) if entry.readable => {
                (entry.lengths.clone(), entry.sequence, entry.editing)
            }
            _ => return Ok(None),
        };

        let mut files = Vec::with_capacity(self.header.value_count);
        for slot in 0..self.header.value_count {
            match File::open(self.clean_path(key, slot)) {
                Ok(file) => files.push(Some(file)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("Cache entry files missing, dropping entry: key={}", key);
                    if !editing {
                        self.remove_entry(&mut state, key)?;
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }

        state.append(JournalRecord::Read(key.to_string()))?;
        state.redundant_op_count += 1;
        state.touch(key);

        if state.journal_rebuild_required() {
            self.rebuild_journal(&mut state)?;
        }
        *state.pins.entry(key.to_string()).or_insert(0) += 1;

        Ok(Some(Snapshot {
            cache: Arc::clone(self),
            key: key.to_string(),
            sequence,
            files,
            lengths,
        }))
    }

    /// Start editing `key`. Returns `None` if another editor is outstanding.
    pub fn edit(self: &Arc<Self>, key: &str) -> Result<Option<Editor>> {
        self.edit_if_current(key, None)
    }

    fn edit_if_current(
        self: &Arc<Self>,
        key: &str,
        expected_sequence: Option<u64>,
    ) -> Result<Option<Editor>> {
        validate_key(key)?;
        let mut state = self.lock_state();
        state.ensure_open()?;

        if let Some(expected) = expected_sequence {
            match state.entries.get(key) {
                Some(entry) if entry.readable && entry.sequence == expected => {}
                _ => return Ok(None),
            }
        }

        if state.entries.get(key).is_some_and(|e| e.editing) {
            debug!("Edit already in progress: key={}", key);
            return Ok(None);
        }

        state.append(JournalRecord::Dirty(key.to_string()))?;

        let value_count = self.header.value_count;
        let entry = state
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(value_count));
        entry.editing = true;
        state.touch(key);

        Ok(Some(Editor {
            cache: Arc::clone(self),
            key: key.to_string(),
            written: vec![false; value_count],
            resolved: false,
        }))
    }

    fn complete_edit(&self, key: &str, written: &[bool], success: bool) -> Result<()> {
        let mut state = self.lock_state();

        let had_value = match state.entries.get(key) {
            Some(entry) if entry.editing => entry.readable,
            _ => {
                return Err(NodeError::CacheError(format!(
                    "No edit in progress for key {}",
                    key
                )))
            }
        };

        if !success {
            return self.finish_abort(&mut state, key, had_value);
        }

        if !state.is_open() {
            self.finish_abort(&mut state, key, had_value)?;
            return Err(NodeError::CacheClosed);
        }

        if !had_value {
            let missing = (0..self.header.value_count)
                .find(|&slot| !written[slot] || !self.dirty_path(key, slot).exists());
            if let Some(slot) = missing {
                self.finish_abort(&mut state, key, had_value)?;
                return Err(NodeError::CacheError(format!(
                    "Newly created entry {} did not write slot {}",
                    key, slot
                )));
            }
        }

        let mut lengths = state
            .entries
            .get(key)
            .map(|e| e.lengths.clone())
            .unwrap_or_else(|| vec![0; self.header.value_count]);
        let old_len: u64 = lengths.iter().sum();

        for slot in 0..self.header.value_count {
            let dirty = self.dirty_path(key, slot);
            if !written[slot] || !dirty.exists() {
                continue;
            }
            let clean = self.clean_path(key, slot);
            let renamed = std::fs::rename(&dirty, &clean)
                .and_then(|_| std::fs::metadata(&clean).map(|m| m.len()));
            match renamed {
                Ok(len) => lengths[slot] = len,
                Err(e) => {
                    error!("Failed to commit cache slot: key={}, slot={}: {}", key, slot, e);
                    if let Some(entry) = state.entries.get_mut(key) {
                        entry.editing = false;
                        entry.readable = true;
                    }
                    self.remove_entry(&mut state, key)?;
                    return Err(NodeError::IoError(format!(
                        "Failed to commit slot {} of {}: {}",
                        slot, key, e
                    )));
                }
            }
        }

        state.append(JournalRecord::Clean {
            key: key.to_string(),
            lengths: lengths.clone(),
        })?;

        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let new_len: u64 = lengths.iter().sum();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.lengths = lengths;
            entry.readable = true;
            entry.editing = false;
            entry.sequence = sequence;
        }
        state.size = state.size.saturating_sub(old_len) + new_len;
        state.redundant_op_count += 1;
        state.touch(key);

        debug!(
            "Cache entry committed: key={}, bytes={}, total_size={}",
            key, new_len, state.size
        );

        self.trim_to_size(&mut state, Some(key))?;
        if state.journal_rebuild_required() {
            self.rebuild_journal(&mut state)?;
        }
        Ok(())
    }

    fn finish_abort(&self, state: &mut CacheState, key: &str, had_value: bool) -> Result<()> {
        for slot in 0..self.header.value_count {
            remove_if_exists(&self.dirty_path(key, slot))?;
        }

        let lengths = match state.entries.get_mut(key) {
            Some(entry) => {
                entry.editing = false;
                entry.lengths.clone()
            }
            None => return Ok(()),
        };

        if had_value {
            if state.is_open() {
                state.append(JournalRecord::Clean {
                    key: key.to_string(),
                    lengths,
                })?;
                state.redundant_op_count += 1;
            }
        } else {
            if state.is_open() {
                state.append(JournalRecord::Remove(key.to_string()))?;
                state.redundant_op_count += 1;
            }
            if let Some(entry) = state.entries.remove(key) {
                state.lru.remove(&entry.recency);
            }
        }

        debug!("Cache edit aborted: key={}, had_value={}", key, had_value);

        if state.is_open() && state.size > self.max_size {
            self.trim_to_size(state, None)?;
        }
        Ok(())
    }

    /// Delete the committed entry for `key`.
    ///
    /// Returns `false` when there is no committed entry or an edit is in
    /// progress. Live snapshots of the entry remain readable.
    pub fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let mut state = self.lock_state();
        state.ensure_open()?;

        match state.entries.get(key) {
            Some(entry) if entry.readable && !entry.editing => {}
            _ => return Ok(false),
        }

        self.remove_entry(&mut state, key)?;
        if state.journal_rebuild_required() {
            self.rebuild_journal(&mut state)?;
        }
        Ok(true)
    }

    fn remove_entry(&self, state: &mut CacheState, key: &str) -> Result<()> {
        for slot in 0..self.header.value_count {
            remove_if_exists(&self.clean_path(key, slot))?;
        }

        state.append(JournalRecord::Remove(key.to_string()))?;
        state.redundant_op_count += 1;

        if let Some(entry) = state.entries.remove(key) {
            state.lru.remove(&entry.recency);
            state.size = state.size.saturating_sub(entry.total_len());
        }
        Ok(())
    }

    /// Evict least recently used entries until the size fits the budget.
    /// Entries being edited, pinned by a snapshot or named by `protect` are
    /// skipped; if nothing else is evictable the overflow is tolerated.
    fn trim_to_size(&self, state: &mut CacheState, protect: Option<&str>) -> Result<()> {
        while state.size > self.max_size {
            let victim = state
                .lru
                .values()
                .find(|key| Some(key.as_str()) != protect && state.is_evictable(key))
                .cloned();

            match victim {
                Some(key) => {
                    debug!("Evicting cache entry: key={}", key);
                    self.remove_entry(state, &key)?;
                }
                None => {
                    debug!(
                        "Cache over budget with no evictable entries: size={}, max_size={}",
                        state.size, self.max_size
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    fn rebuild_journal(&self, state: &mut CacheState) -> Result<()> {
        if let Some(journal) = state.journal.as_mut() {
            journal.flush()?;
        }
        state.journal = None;

        let records: Vec<JournalRecord> = state
            .lru
            .values()
            .filter_map(|key| {
                let entry = state.entries.get(key)?;
                if entry.editing {
                    Some(JournalRecord::Dirty(key.clone()))
                } else if entry.readable {
                    Some(JournalRecord::Clean {
                        key: key.clone(),
                        lengths: entry.lengths.clone(),
                    })
                } else {
                    None
                }
            })
            .collect();

        let installed = journal::write_compacted(&self.directory, &self.header, &records)
            .and_then(|_| JournalWriter::open_append(&self.directory.join(JOURNAL_FILE)));
        match installed {
            Ok(writer) => {
                state.journal = Some(writer);
                state.redundant_op_count = 0;
                Ok(())
            }
            Err(e) => {
                error!("Journal rebuild failed, disabling cache: {}", e);
                state.failed = true;
                Err(e)
            }
        }
    }

    fn release_pin(&self, key: &str) {
        let mut state = self.lock_state();
        if let Some(count) = state.pins.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                state.pins.remove(key);
            }
        }

        if state.is_open() && state.size > self.max_size {
            if let Err(e) = self.trim_to_size(&mut state, None) {
                warn!("Eviction after snapshot release failed: {}", e);
            }
        }
    }

    /// Rewrite the journal compactly.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.lock_state();
        state.ensure_open()?;
        self.rebuild_journal(&mut state)
    }

    /// Flush buffered journal records to the OS.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.lock_state();
        state.ensure_open()?;
        match state.journal.as_mut() {
            Some(journal) => journal.flush(),
            None => Err(NodeError::CacheClosed),
        }
    }

    /// Flush and close the journal. Later operations fail with `CacheClosed`;
    /// closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock_state();
        if let Some(mut journal) = state.journal.take() {
            journal.flush()?;
            info!(
                "Disk cache closed: directory={:?}, entries={}, size={} bytes",
                self.directory,
                state.entries.len(),
                state.size
            );
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        !self.lock_state().is_open()
    }

    /// Total bytes of committed slot data.
    pub fn size(&self) -> u64 {
        self.lock_state().size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Number of entries with a committed value.
    pub fn entry_count(&self) -> usize {
        self.lock_state()
            .entries
            .values()
            .filter(|e| e.readable)
            .count()
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn value_count(&self) -> usize {
        self.header.value_count
    }

    fn entry_path(&self, key: &str, slot: usize, pending: bool) -> PathBuf {
        let shard = &blake3::hash(key.as_bytes()).to_hex()[..2];
        let name = if pending {
            format!("{}.{}.tmp", key, slot)
        } else {
            format!("{}.{}", key, slot)
        };
        self.directory.join(shard).join(name)
    }

    fn clean_path(&self, key: &str, slot: usize) -> PathBuf {
        self.entry_path(key, slot, false)
    }

    fn dirty_path(&self, key: &str, slot: usize) -> PathBuf {
        self.entry_path(key, slot, true)
    }
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LENGTH
        && key
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(NodeError::InvalidKey(key.to_string()))
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(NodeError::IoError(format!(
            "Failed to delete {:?}: {}",
            path, e
        ))),
    }
}

/// Read-only view of a committed entry.
///
/// Holds the slot files open; the entry cannot be evicted while the snapshot
/// lives.
pub struct Snapshot {
    cache: Arc<DiskCache>,
    key: String,
    sequence: u64,
    files: Vec<Option<File>>,
    lengths: Vec<u64>,
}

impl Snapshot {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Committed byte length of `slot`.
    pub fn length(&self, slot: usize) -> u64 {
        self.lengths.get(slot).copied().unwrap_or(0)
    }

    /// Read the whole of `slot` into memory.
    pub fn read_slot(&mut self, slot: usize) -> Result<Vec<u8>> {
        let file = self
            .files
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                NodeError::CacheError(format!("Slot {} of {} is not available", slot, self.key))
            })?;

        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::with_capacity(self.lengths[slot] as usize);
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Read up to `max` bytes of `slot` starting at `offset`. Returns an
    /// empty buffer at the end of the committed length.
    pub fn read_slot_at(&mut self, slot: usize, offset: u64, max: usize) -> Result<Vec<u8>> {
        let remaining = self.length(slot).saturating_sub(offset);
        let file = self
            .files
            .get_mut(slot)
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                NodeError::CacheError(format!("Slot {} of {} is not available", slot, self.key))
            })?;

        let want = remaining.min(max as u64) as usize;
        let mut buf = vec![0u8; want];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Edit this entry only if it has not been committed again since the
    /// snapshot was taken.
    pub fn edit(&self) -> Result<Option<Editor>> {
        self.cache.edit_if_current(&self.key, Some(self.sequence))
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.cache.release_pin(&self.key);
    }
}

/// Handle to a pending entry. At most one exists per key.
///
/// Dropping an editor without calling [`Editor::commit`] aborts it.
pub struct Editor {
    cache: Arc<DiskCache>,
    key: String,
    written: Vec<bool>,
    resolved: bool,
}

impl Editor {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Create (or truncate) the temp file for `slot` and return it for writing.
    pub fn new_writer(&mut self, slot: usize) -> Result<File> {
        if slot >= self.written.len() {
            return Err(NodeError::CacheError(format!(
                "Slot {} out of range for {} slots",
                slot,
                self.written.len()
            )));
        }

        let path = self.cache.dirty_path(&self.key, slot);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path).map_err(|e| {
            NodeError::IoError(format!("Failed to create temp file {:?}: {}", path, e))
        })?;
        self.written[slot] = true;
        Ok(file)
    }

    /// Write `value` as the whole content of `slot`.
    pub fn set(&mut self, slot: usize, value: &[u8]) -> Result<()> {
        let mut file = self.new_writer(slot)?;
        file.write_all(value)?;
        file.flush()?;
        Ok(())
    }

    /// Bytes currently in the temp file for `slot`.
    pub fn written_len(&self, slot: usize) -> Result<u64> {
        let path = self.cache.dirty_path(&self.key, slot);
        Ok(std::fs::metadata(path)?.len())
    }

    /// Publish the written slots.
    ///
    /// # Errors
    /// Fails, and aborts the edit, if this is a new entry and some slot was
    /// never written, or if the cache has been closed.
    pub fn commit(mut self) -> Result<()> {
        self.resolved = true;
        self.cache.complete_edit(&self.key, &self.written, true)
    }

    /// Discard the written slots.
    pub fn abort(mut self) -> Result<()> {
        self.resolved = true;
        self.cache.complete_edit(&self.key, &self.written, false)
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if !self.resolved {
            if let Err(e) = self.cache.complete_edit(&self.key, &self.written, false) {
                warn!("Failed to abort dropped editor: key={}: {}", self.key, e);
            }
        }
    }
}
