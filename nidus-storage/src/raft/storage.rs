//! Durable storage for the Raft persistent state.
//!
//! `current_term`, `voted_for` and the log must reach stable storage before
//! the node answers a RequestVote or acknowledges an AppendEntries. Every
//! mutating call on a [`LogStore`] is crash-safe once it returns.

use super::log::{LogEntry, RaftLog};
use bytes::{Buf, BufMut, BytesMut};
use nidus_common::error::{NidusError, Result};
use nidus_common::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Everything a node must find again after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,
}

/// Persistent log store owned by a single Raft node.
///
/// All operations are synchronous so the node never observes a mutation
/// before it is on disk.
pub trait LogStore: Send {
    /// Snapshot of the persisted term, vote and log.
    fn load(&self) -> Result<PersistentState>;

    fn set_term_and_vote(&mut self, term: Term, voted_for: Option<&NodeId>) -> Result<()>;

    /// Append entries; the first must directly follow `last_index`.
    fn append(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// Remove the entry at `index` and all that follow.
    fn truncate_from(&mut self, index: LogIndex) -> Result<()>;

    /// In-memory view of the persisted log.
    fn log(&self) -> &RaftLog;

    fn entry_at(&self, index: LogIndex) -> Option<&LogEntry> {
        self.log().get(index)
    }

    fn last_index(&self) -> LogIndex {
        self.log().last_index()
    }

    fn last_term(&self) -> Term {
        self.log().last_term()
    }

    /// Term at `index`, with 0 for the empty prefix at index 0.
    fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.log().term_at(index)
    }

    /// Up to `max` entries starting at `index`.
    fn entries_from(&self, index: LogIndex, max: usize) -> &[LogEntry] {
        self.log().entries_from(index, max)
    }
}

/// Term and vote record stored in the `meta` file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct HardState {
    current_term: Term,
    voted_for: Option<NodeId>,
}

const META_FILE: &str = "meta";
const META_TMP_FILE: &str = "meta.tmp";
const LOG_FILE: &str = "log";
const RECORD_HEADER: usize = 4;

/// File-backed store: one directory per node.
///
/// - `meta`: bincode term + vote, replaced atomically (write tmp, fsync, rename)
/// - `log`: append-only records of `u32 BE length | bincode LogEntry`
pub struct FileLogStore {
    dir: PathBuf,
    hard_state: HardState,
    log: RaftLog,
    log_file: File,
    offsets: Vec<u64>, // offsets[i] = byte offset of entry i + 1
    log_len: u64,
}

impl FileLogStore {
    /// Opens (or creates) the store in `dir`, reloading any persisted state.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let hard_state = Self::read_meta(&dir)?;

        let log_path = dir.join(LOG_FILE);
        let mut log_file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&log_path)?;

        let mut raw = Vec::new();
        log_file.read_to_end(&mut raw)?;
        let (entries, offsets, valid_len) = Self::decode_records(&raw)?;

        if valid_len < raw.len() as u64 {
            warn!(
                path = %log_path.display(),
                discarded = raw.len() as u64 - valid_len,
                "discarding torn record at the end of the log"
            );
            log_file.set_len(valid_len)?;
            log_file.sync_all()?;
        }

        let log = RaftLog::from_entries(entries)?;

        Ok(Self {
            dir,
            hard_state,
            log,
            log_file,
            offsets,
            log_len: valid_len,
        })
    }

    fn read_meta(dir: &Path) -> Result<HardState> {
        let path = dir.join(META_FILE);
        if !path.exists() {
            return Ok(HardState::default());
        }
        let bytes = fs::read(&path)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    /// Splits the raw log file into entries. A trailing partial record is
    /// not an error: it is an append that never returned.
    fn decode_records(raw: &[u8]) -> Result<(Vec<LogEntry>, Vec<u64>, u64)> {
        let mut entries = Vec::new();
        let mut offsets = Vec::new();
        let mut buf = raw;
        let mut offset = 0u64;

        while buf.len() >= RECORD_HEADER {
            let len = (&buf[..RECORD_HEADER]).get_u32() as usize;
            if buf.len() < RECORD_HEADER + len {
                break;
            }
            let record = &buf[RECORD_HEADER..RECORD_HEADER + len];
            let entry: LogEntry = match bincode::deserialize(record) {
                Ok(entry) => entry,
                Err(e) => {
                    return Err(NidusError::Corruption(format!(
                        "undecodable log record at byte {}: {}",
                        offset, e
                    )));
                }
            };
            entries.push(entry);
            offsets.push(offset);
            buf.advance(RECORD_HEADER + len);
            offset += (RECORD_HEADER + len) as u64;
        }

        Ok((entries, offsets, offset))
    }

    fn encode_records(entries: &[LogEntry]) -> Result<(BytesMut, Vec<u64>)> {
        let mut buf = BytesMut::new();
        let mut relative = Vec::with_capacity(entries.len());
        for entry in entries {
            let payload = bincode::serialize(entry)?;
            relative.push(buf.len() as u64);
            buf.put_u32(payload.len() as u32);
            buf.put_slice(&payload);
        }
        Ok((buf, relative))
    }

    fn sync_dir(&self) -> Result<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

impl LogStore for FileLogStore {
    fn load(&self) -> Result<PersistentState> {
        Ok(PersistentState {
            current_term: self.hard_state.current_term,
            voted_for: self.hard_state.voted_for.clone(),
            log: self.log.entries().to_vec(),
        })
    }

    fn set_term_and_vote(&mut self, term: Term, voted_for: Option<&NodeId>) -> Result<()> {
        let next = HardState {
            current_term: term,
            voted_for: voted_for.cloned(),
        };
        let bytes = bincode::serialize(&next)?;

        let tmp = self.dir.join(META_TMP_FILE);
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, self.dir.join(META_FILE))?;
        self.sync_dir()?;

        self.hard_state = next;
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        // refuse gaps before touching the file
        let mut expected = self.log.last_index() + 1;
        for entry in entries {
            if entry.index != expected {
                return Err(NidusError::Consensus(format!(
                    "non-contiguous append: got index {}, expected {}",
                    entry.index, expected
                )));
            }
            expected += 1;
        }

        let (buf, relative) = Self::encode_records(entries)?;
        self.log_file.write_all(&buf)?;
        self.log_file.sync_data()?;

        self.log.append(entries)?;
        let base = self.log_len;
        self.offsets.extend(relative.into_iter().map(|r| base + r));
        self.log_len += buf.len() as u64;
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index == 0 || index > self.log.last_index() {
            return Ok(());
        }
        let cut = self.offsets[index as usize - 1];
        self.log_file.set_len(cut)?;
        self.log_file.sync_all()?;

        self.log.truncate_from(index);
        self.offsets.truncate(index as usize - 1);
        self.log_len = cut;
        Ok(())
    }

    fn log(&self) -> &RaftLog {
        &self.log
    }
}

/// In-memory store with the same contract, for tests and ephemeral nodes.
///
/// Writes fail with an I/O error while the failure switch is set.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    state: HardState,
    log: RaftLog,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store, e.g. to stage a follower with an existing log.
    pub fn with_state(state: PersistentState) -> Result<Self> {
        Ok(Self {
            state: HardState {
                current_term: state.current_term,
                voted_for: state.voted_for,
            },
            log: RaftLog::from_entries(state.log)?,
            fail_writes: Arc::default(),
        })
    }

    /// Shared flag: while `true`, every mutating call fails.
    pub fn failure_switch(&self) -> Arc<AtomicBool> {
        self.fail_writes.clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(NidusError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated storage failure",
            )));
        }
        Ok(())
    }
}

impl LogStore for MemoryLogStore {
    fn load(&self) -> Result<PersistentState> {
        Ok(PersistentState {
            current_term: self.state.current_term,
            voted_for: self.state.voted_for.clone(),
            log: self.log.entries().to_vec(),
        })
    }

    fn set_term_and_vote(&mut self, term: Term, voted_for: Option<&NodeId>) -> Result<()> {
        self.check_writable()?;
        self.state.current_term = term;
        self.state.voted_for = voted_for.cloned();
        Ok(())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.check_writable()?;
        self.log.append(entries)
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        self.check_writable()?;
        self.log.truncate_from(index);
        Ok(())
    }

    fn log(&self) -> &RaftLog {
        &self.log
    }
}
