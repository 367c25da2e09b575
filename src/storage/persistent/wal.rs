//! Write-ahead log.
//!
//! Every committed [`Transaction`] is appended as one framed record before it is
//! applied in memory, so replay is all-or-nothing per transaction.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [RECORD 1: codec-framed WalEntry]
//! [RECORD 2: codec-framed WalEntry]
//! ...
//! ```
//!
//! A record cut short by a crash (a torn tail) is truncated away on open.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::traits::Transaction;

use super::codec;

/// One logged transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing log sequence.
    pub sequence: u64,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
    /// The committed transaction.
    pub tx: Transaction,
}

struct WalWriter {
    out: BufWriter<File>,
    sequence: u64,
}

/// Append-only transaction log.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    sync_on_write: bool,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

/// Result of scanning a log file on open.
#[derive(Debug)]
pub struct Recovery {
    /// Intact entries in log order.
    pub entries: Vec<WalEntry>,
    /// Bytes dropped from a torn or corrupt tail.
    pub truncated_bytes: u64,
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "poisoned lock: wal.writer")
}

impl WriteAheadLog {
    /// Opens or creates a log file and recovers its intact prefix.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<(Self, Recovery)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let recovery = if file.metadata()?.len() < codec::HEADER_LEN {
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            file.sync_all()?;
            Recovery {
                entries: Vec::new(),
                truncated_bytes: 0,
            }
        } else {
            let (entries, valid_len) = scan(path)?;
            let total = file.metadata()?.len();
            if valid_len < total {
                tracing::warn!(
                    path = %path.display(),
                    valid_len,
                    dropped = total - valid_len,
                    "truncating torn write-ahead log tail"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            Recovery {
                entries,
                truncated_bytes: total - valid_len,
            }
        };
        drop(file);

        let sequence = recovery.entries.last().map_or(0, |e| e.sequence);
        let file = OpenOptions::new().append(true).open(path)?;
        Ok((
            Self {
                path: path.to_path_buf(),
                writer: Mutex::new(WalWriter {
                    out: BufWriter::new(file),
                    sequence,
                }),
                sync_on_write,
            },
            recovery,
        ))
    }

    /// Appends a transaction, returning its log sequence.
    pub fn append(&self, tx: &Transaction) -> IoResult<u64> {
        let mut writer = self.writer.lock().map_err(|_| poisoned())?;
        let sequence = writer.sequence + 1;
        let encoded = codec::encode(&WalEntryRef {
            sequence,
            timestamp: Utc::now(),
            tx,
        })?;

        writer.out.write_all(&encoded)?;
        writer.out.flush()?;
        if self.sync_on_write {
            writer.out.get_ref().sync_data()?;
        }
        writer.sequence = sequence;
        Ok(sequence)
    }

    /// Sequence of the last appended entry.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.writer.lock().map_err(|_| poisoned())?.sequence)
    }

    /// Log file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Borrowing twin of [`WalEntry`] so appends need not clone the transaction.
#[derive(Serialize)]
struct WalEntryRef<'a> {
    sequence: u64,
    timestamp: DateTime<Utc>,
    tx: &'a Transaction,
}

/// Reads intact entries and returns them with the byte length of the intact prefix.
fn scan(path: &Path) -> IoResult<(Vec<WalEntry>, u64)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    codec::read_header(&mut reader)?;

    let mut entries = Vec::new();
    let mut valid_len = reader.stream_position()?;
    loop {
        match codec::decode::<WalEntry>(&mut reader) {
            Ok(entry) => {
                valid_len = reader.stream_position()?;
                entries.push(entry);
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                tracing::warn!(
                    path = %path.display(),
                    after_sequence = entries.last().map_or(0, |e: &WalEntry| e.sequence),
                    error = %e,
                    "corrupt write-ahead log record; replaying intact prefix only"
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok((entries, valid_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Mutation;
    use crate::worker_state::WorkerDelta;
    use tempfile::tempdir;

    fn tx(worker: &str) -> Transaction {
        Transaction::new().touch_worker(worker, WorkerDelta::at(Utc::now()).published(1))
    }

    #[test]
    fn append_and_recover_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("exchange.wal");

        let (wal, recovery) = WriteAheadLog::open(&path, false).unwrap();
        assert!(recovery.entries.is_empty());
        wal.append(&tx("w1")).unwrap();
        wal.append(&tx("w2")).unwrap();
        assert_eq!(wal.current_sequence().unwrap(), 2);
        drop(wal);

        let (wal, recovery) = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(recovery.entries.len(), 2);
        assert!(matches!(
            &recovery.entries[0].tx.mutations[0],
            Mutation::TouchWorker { worker_id, .. } if worker_id == "w1"
        ));
        assert_eq!(recovery.entries[1].sequence, 2);
        assert_eq!(wal.current_sequence().unwrap(), 2);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("exchange.wal");
        {
            let (wal, _) = WriteAheadLog::open(&path, true).unwrap();
            wal.append(&tx("w1")).unwrap();
            wal.append(&tx("w2")).unwrap();
        }
        let full = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 3).unwrap();
        drop(file);

        let (wal, recovery) = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(recovery.entries.len(), 1);
        assert!(recovery.truncated_bytes > 0);
        assert_eq!(wal.current_sequence().unwrap(), 1);

        // Appends after recovery land on a clean boundary.
        wal.append(&tx("w3")).unwrap();
        drop(wal);
        let (_, recovery) = WriteAheadLog::open(&path, false).unwrap();
        assert_eq!(recovery.entries.len(), 2);
        assert_eq!(recovery.truncated_bytes, 0);
    }
}
