//! Append-only event log.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [RECORD 1: codec-framed LogRecord]
//! [RECORD 2: codec-framed LogRecord]
//! ...
//! ```
//!
//! A crash can leave a partially written record at the tail. Opening the log
//! replays every intact record, then truncates the file back to the end of the
//! last one so later appends stay readable.
//!
//! Only a short read counts as a torn tail. A record that is fully present but
//! fails its checksum or does not parse is corruption: `open` refuses the file
//! and leaves it untouched, since every record after it would otherwise be lost.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::StoredEvent;

use super::codec;

/// A single record in the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When the record was written.
    pub written_at: DateTime<Utc>,
    pub event: StoredEvent,
}

struct LogWriter {
    writer: BufWriter<File>,
    sequence: u64,
}

/// Durable append-only log of stored events.
///
/// Thread-safe via an internal mutex.
pub struct EventLog {
    path: PathBuf,
    inner: Mutex<LogWriter>,
    sync_on_write: bool,
}

impl EventLog {
    /// Opens or creates a log, returning it with every intact record.
    ///
    /// # Errors
    /// I/O failures, a file that is not an event log, or `InvalidData` for a
    /// corrupt record anywhere before the tail.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<(Self, Vec<LogRecord>)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let records = if file.metadata()?.len() < codec::HEADER_LEN {
            file.set_len(0)?;
            let mut file = file;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            Vec::new()
        } else {
            let (records, valid_len) = Self::replay(&file)?;
            if valid_len < file.metadata()?.len() {
                tracing::warn!(
                    path = %path.display(),
                    valid_len,
                    "event log has a torn tail; truncating to last intact record"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            records
        };

        let sequence = records.last().map_or(0, |r| r.sequence);
        let file = OpenOptions::new().append(true).open(path)?;

        Ok((
            Self {
                path: path.to_path_buf(),
                inner: Mutex::new(LogWriter {
                    writer: BufWriter::new(file),
                    sequence,
                }),
                sync_on_write,
            },
            records,
        ))
    }

    fn replay(file: &File) -> IoResult<(Vec<LogRecord>, u64)> {
        let mut reader = BufReader::new(file.try_clone()?);
        codec::read_header(&mut reader)?;

        let mut records = Vec::new();
        let mut valid_len = codec::HEADER_LEN;
        loop {
            match codec::decode::<LogRecord>(&mut reader) {
                Ok((record, len)) => {
                    valid_len += len;
                    records.push(record);
                }
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    let after_sequence = records.last().map_or(0, |r: &LogRecord| r.sequence);
                    tracing::error!(
                        error = %e,
                        after_sequence,
                        offset = valid_len,
                        "event log corruption detected; refusing to open"
                    );
                    return Err(std::io::Error::new(
                        ErrorKind::InvalidData,
                        format!("event log corrupt at byte {valid_len} (after sequence {after_sequence}): {e}"),
                    ));
                }
            }
        }
        Ok((records, valid_len))
    }

    /// Appends an event, returning its sequence number.
    ///
    /// # Errors
    /// I/O failures; a poisoned lock is reported as `Other`.
    pub fn append(&self, event: StoredEvent) -> IoResult<u64> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| std::io::Error::new(ErrorKind::Other, "poisoned lock: event_log.append"))?;

        let sequence = inner.sequence + 1;
        let record = LogRecord {
            sequence,
            written_at: Utc::now(),
            event,
        };
        let encoded = codec::encode(&record)?;

        inner.writer.write_all(&encoded)?;
        inner.writer.flush()?;
        if self.sync_on_write {
            inner.writer.get_ref().sync_all()?;
        }
        inner.sequence = sequence;
        Ok(sequence)
    }

    /// Sequence number of the last appended record.
    #[must_use]
    pub fn current_sequence(&self) -> u64 {
        self.inner.lock().map_or(0, |inner| inner.sequence)
    }

    /// Size of the log file in bytes.
    ///
    /// # Errors
    /// Propagates metadata failures.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }
}
