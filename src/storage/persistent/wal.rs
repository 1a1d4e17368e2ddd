//! Write-ahead log for the persistent backend.
//!
//! Every mutation is framed and appended here before it is applied in memory.
//! On open, the log is replayed from the start to rebuild state.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec frame of WalEntry]
//! [ENTRY 2: codec frame of WalEntry]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Result as IoResult, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::claim::OwnershipClaim;
use crate::record::{EventRecord, RecordId, RecordStatus};

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The logged mutation.
    pub kind: WalEntryKind,
}

/// The logged mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// A claim became durable.
    ClaimInsert(OwnershipClaim),
    /// A record was appended with its assigned id.
    RecordAppend(EventRecord),
    /// One resolver batch; replayed all-or-nothing.
    StatusBatch {
        /// Status changes in application order.
        changes: Vec<(RecordId, RecordStatus)>,
    },
}

struct WalWriter {
    out: File,
    sequence: u64,
    /// End of the last complete frame.
    len: u64,
    /// Set when a failed append could not be rolled back.
    failed: bool,
}

/// Append-only log, safe to share across threads.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    sync_on_write: bool,
    max_entry_bytes: usize,
    #[cfg(test)]
    fail_next_sync: std::sync::atomic::AtomicBool,
}

impl WriteAheadLog {
    /// Opens or creates the log.
    ///
    /// A torn final entry (crash mid-append) is tolerated; the sequence resumes
    /// after the last complete entry.
    pub fn open(path: &Path, sync_on_write: bool, max_entry_bytes: usize) -> IoResult<Self> {
        let has_header = path.exists() && std::fs::metadata(path)?.len() >= codec::HEADER_LEN;

        let sequence = if has_header {
            Self::last_sequence(path, max_entry_bytes)?
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        };

        // Opened for plain writes so a failed append can be truncated away;
        // every frame is written at the tracked end offset.
        let file = OpenOptions::new().write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                out: file,
                sequence,
                len,
                failed: false,
            }),
            sync_on_write,
            max_entry_bytes,
            #[cfg(test)]
            fail_next_sync: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Appends an entry and returns its sequence number.
    ///
    /// On error the file is cut back to the previous frame boundary, so an
    /// entry whose append failed is never replayed. If that cut fails too the
    /// log refuses every later append.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("poisoned lock: wal.append"))?;
        if writer.failed {
            return Err(std::io::Error::other(
                "WAL is in a failed state after an unrecoverable append error",
            ));
        }

        let entry = WalEntry {
            sequence: writer.sequence + 1,
            timestamp: Utc::now(),
            kind,
        };
        let frame = codec::encode(&entry)?;
        if frame.len() > self.max_entry_bytes {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("entry of {} bytes exceeds maximum {}", frame.len(), self.max_entry_bytes),
            ));
        }

        let start = writer.len;
        if let Err(err) = self.write_frame(&mut writer.out, start, &frame) {
            let valid_end = writer.len;
            match writer.out.set_len(valid_end) {
                Ok(()) => tracing::warn!(
                    sequence = entry.sequence,
                    error = %err,
                    "WAL append failed; rolled back to last complete entry"
                ),
                Err(cut) => {
                    writer.failed = true;
                    tracing::error!(
                        sequence = entry.sequence,
                        error = %err,
                        rollback_error = %cut,
                        "WAL append failed and could not be rolled back"
                    );
                }
            }
            return Err(err);
        }
        writer.len += frame.len() as u64;
        writer.sequence = entry.sequence;
        Ok(entry.sequence)
    }

    fn write_frame(&self, out: &mut File, start: u64, frame: &[u8]) -> IoResult<()> {
        out.seek(SeekFrom::Start(start))?;
        out.write_all(frame)?;
        if self.take_injected_failure() {
            return Err(std::io::Error::other("injected sync failure"));
        }
        if self.sync_on_write {
            out.sync_data()?;
        }
        Ok(())
    }

    /// Makes the next append fail after its frame reached the file.
    #[cfg(test)]
    pub(crate) fn fail_next_sync(&self) {
        self.fail_next_sync
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_injected_failure(&self) -> bool {
        self.fail_next_sync
            .swap(false, std::sync::atomic::Ordering::SeqCst)
    }

    #[cfg(not(test))]
    #[allow(clippy::unused_self)]
    const fn take_injected_failure(&self) -> bool {
        false
    }

    /// Iterates every entry from the start of the log.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path, self.max_entry_bytes)
    }

    /// Sequence number of the last appended entry.
    pub fn current_sequence(&self) -> u64 {
        self.writer.lock().map_or(0, |w| w.sequence)
    }

    /// Size of the log file in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Finds the last complete sequence and cuts off a torn final frame so
    /// later appends stay readable. Corruption in the middle of the log is
    /// left in place for replay to report.
    fn last_sequence(path: &Path, max_entry_bytes: usize) -> IoResult<u64> {
        let mut iter = WalIterator::new(path, max_entry_bytes)?;
        let mut last = 0;
        let mut valid_end = codec::HEADER_LEN;
        loop {
            match iter.next() {
                Some(Ok(entry)) => {
                    last = entry.sequence;
                    valid_end = iter.reader.stream_position()?;
                }
                Some(Err(e)) => {
                    tracing::warn!(after_sequence = last, error = %e, "WAL corruption detected");
                    return Ok(last);
                }
                None => break,
            }
        }

        if valid_end < iter.file_size {
            tracing::warn!(
                after_sequence = last,
                dropped_bytes = iter.file_size - valid_end,
                "truncating torn WAL tail"
            );
            OpenOptions::new().write(true).open(path)?.set_len(valid_end)?;
        }
        Ok(last)
    }
}

/// Iterator over WAL entries.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
    max_entry_bytes: usize,
}

impl WalIterator {
    fn new(path: &Path, max_entry_bytes: usize) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        Ok(Self {
            reader,
            file_size,
            max_entry_bytes,
        })
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.stream_position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }

        match codec::decode(&mut self.reader, self.max_entry_bytes) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}
