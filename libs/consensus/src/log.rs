//! Durable log
//!
//! An ordered, append-only sequence of [`LogEntry`] mirrored to a backing
//! file of fixed-size records. Durability is deferred: `append` is in-memory
//! only until `persist` writes the unpersisted suffix and flushes it.
//! Records carry no promise handle (handles are process-local), so the disk
//! form of every operation is its bare command.
//!
//! On startup with bootstrap requested, the whole file is read back and every
//! complete record is reconstructed; a trailing partial record left by an
//! interrupted write is discarded and the file truncated to the recovered
//! length, while a complete record that does not decode fails the open.
//! Fixed-size records mean recovery needs no delimiter scanning.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::op::{Command, Operation};
use crate::types::{LogEntry, ReplicaId, ServerInfo, Term};
use crate::{RaftError, Result};

/// Size of one on-disk record: five little-endian i32 fields plus two
/// fixed-capacity NUL-padded string fields.
pub const RECORD_SIZE: usize = 5 * 4 + STR_CAP * 2;

const STR_CAP: usize = 16;

const KIND_GET: i32 = 0;
const KIND_PUT: i32 = 1;
const KIND_ADD_SERVER: i32 = 2;
const KIND_REMOVE_SERVER: i32 = 3;

fn put_str(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(STR_CAP - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
}

fn get_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn encode_record(entry: &LogEntry) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    let (kind, a1, a2, a3, ip, name) = match &entry.op.command {
        Command::Get { key } => (KIND_GET, *key, 0, 0, "", ""),
        Command::Put { key, value } => (KIND_PUT, *key, *value, 0, "", ""),
        Command::AddServer(info) => (
            KIND_ADD_SERVER,
            info.id.0,
            i32::from(info.raft_port),
            i32::from(info.db_port),
            info.ip.as_str(),
            info.name.as_str(),
        ),
        Command::RemoveServer(id) => (KIND_REMOVE_SERVER, id.0, 0, 0, "", ""),
    };
    buf[0..4].copy_from_slice(&entry.term.0.to_le_bytes());
    buf[4..8].copy_from_slice(&kind.to_le_bytes());
    buf[8..12].copy_from_slice(&a1.to_le_bytes());
    buf[12..16].copy_from_slice(&a2.to_le_bytes());
    buf[16..20].copy_from_slice(&a3.to_le_bytes());
    put_str(&mut buf[20..20 + STR_CAP], ip);
    put_str(&mut buf[20 + STR_CAP..], name);
    buf
}

fn decode_record(buf: &[u8]) -> Option<LogEntry> {
    let read_i32 = |at: usize| i32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    let term = Term(read_i32(0));
    let kind = read_i32(4);
    let a1 = read_i32(8);
    let a2 = read_i32(12);
    let a3 = read_i32(16);

    let command = match kind {
        KIND_GET => Command::Get { key: a1 },
        KIND_PUT => Command::Put { key: a1, value: a2 },
        KIND_ADD_SERVER => Command::AddServer(ServerInfo {
            id: ReplicaId(a1),
            ip: get_str(&buf[20..20 + STR_CAP]),
            raft_port: a2 as u16,
            db_port: a3 as u16,
            name: get_str(&buf[20 + STR_CAP..]),
        }),
        KIND_REMOVE_SERVER => Command::RemoveServer(ReplicaId(a1)),
        _ => return None,
    };
    Some(LogEntry {
        term,
        op: Operation::new(command),
    })
}

fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

pub struct DurableLog {
    entries: Vec<LogEntry>,
    file: File,
    path: PathBuf,
    persisted: usize,
}

impl DurableLog {
    /// Open the backing file. With `bootstrap`, recover every complete record
    /// already on disk; otherwise start from an empty log, truncating any
    /// previous contents.
    pub fn open(path: impl Into<PathBuf>, bootstrap: bool) -> Result<Self> {
        let path = path.into();
        let mut entries = Vec::new();

        if bootstrap {
            if let Ok(bytes) = std::fs::read(&path) {
                let mut at = 0;
                while at + RECORD_SIZE <= bytes.len() {
                    match decode_record(&bytes[at..at + RECORD_SIZE]) {
                        Some(entry) => entries.push(entry),
                        // A torn trailing write leaves an incomplete record,
                        // handled below; a full record that does not decode
                        // means the file is damaged, and silently dropping
                        // committed entries is worse than refusing to start.
                        None => return Err(RaftError::CorruptRecord(at as u64)),
                    }
                    at += RECORD_SIZE;
                }
                if at < bytes.len() {
                    tracing::warn!(
                        dropped = bytes.len() - at,
                        "discarding incomplete trailing bytes from log file"
                    );
                }
            }
            // Drop whatever we did not recover (a torn trailing record, or
            // anything past an unreadable one).
            let keep = File::options().write(true).create(true).open(&path)?;
            keep.set_len((entries.len() * RECORD_SIZE) as u64)?;
        } else {
            let fresh = File::create(&path)?;
            fresh.set_len(0)?;
        }

        let persisted = entries.len();
        let file = open_append(&path)?;
        tracing::info!(path = %path.display(), recovered = persisted, "durable log opened");
        Ok(Self {
            entries,
            file,
            path,
            persisted,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&LogEntry> {
        self.entries.get(index)
    }

    pub fn term_at(&self, index: usize) -> Option<Term> {
        self.entries.get(index).map(|e| e.term)
    }

    /// Position of the last entry: `(index, term)`, both `None` on an empty
    /// log. Used for vote up-to-date comparisons.
    pub fn last_position(&self) -> (Option<usize>, Option<Term>) {
        match self.entries.last() {
            Some(entry) => (Some(self.entries.len() - 1), Some(entry.term)),
            None => (None, None),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LogEntry> {
        self.entries.iter()
    }

    /// In-memory append; durability is deferred to [`persist`](Self::persist).
    pub fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Truncate to `new_len` entries, returning the removed tail so the
    /// caller can abort the promises of discarded operations. When the cut
    /// reaches below the already-persisted prefix the backing file is
    /// truncated too and reopened for append.
    pub fn resize(&mut self, new_len: usize) -> Result<Vec<LogEntry>> {
        if new_len >= self.entries.len() {
            return Ok(Vec::new());
        }
        if new_len < self.persisted {
            // Truncate the file before touching memory so a failure here
            // leaves both views of the log intact.
            let file = File::options().write(true).open(&self.path)?;
            file.set_len((new_len * RECORD_SIZE) as u64)?;
            file.sync_data()?;
            self.file = open_append(&self.path)?;
            self.persisted = new_len;
        }
        Ok(self.entries.split_off(new_len))
    }

    /// Write every entry beyond the persisted prefix to the backing file and
    /// flush to stable storage.
    pub fn persist(&mut self) -> Result<()> {
        debug_assert!(self.persisted <= self.entries.len());
        if self.persisted == self.entries.len() {
            return Ok(());
        }
        for entry in &self.entries[self.persisted..] {
            self.file.write_all(&encode_record(entry))?;
        }
        self.file.sync_data()?;
        self.persisted = self.entries.len();
        Ok(())
    }

    #[cfg(test)]
    fn persisted(&self) -> usize {
        self.persisted
    }

    /// Swap the write handle for a read-only one so the next persist fails.
    #[cfg(test)]
    pub(crate) fn reopen_read_only(&mut self) {
        self.file = File::open(&self.path).unwrap();
    }
}
