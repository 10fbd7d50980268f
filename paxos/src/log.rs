//! Durable acceptor log.
//!
//! Records are appended as one JSON document per line. An acceptor replays
//! them in write order on startup; no handler replies before its record has
//! been appended, so replay reproduces exactly the state peers have observed.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::LogError;
use crate::types::{Instance, ProposalNumber};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRecord {
    Promise {
        instance: Instance,
        n: ProposalNumber,
    },
    Accept {
        instance: Instance,
        n: ProposalNumber,
        value: String,
    },
    Commit {
        instance: Instance,
        value: String,
    },
}

impl LogRecord {
    pub fn encode(&self) -> Result<String, LogError> {
        serde_json::to_string(self).map_err(LogError::Encode)
    }
}

/// Storage behind an acceptor's log. Owned by exactly one acceptor.
pub trait LogStore: Send {
    /// Appends one record; must be durable when this returns.
    fn append(&mut self, record: &LogRecord) -> Result<(), LogError>;

    /// All records in write order.
    fn records(&self) -> Result<Vec<LogRecord>, LogError>;

    /// The raw log contents.
    fn dump(&self) -> Result<String, LogError>;

    /// Replaces the whole log with `contents` (as produced by `dump`).
    fn restore(&mut self, contents: &str) -> Result<(), LogError>;
}

/// Decodes newline-separated records. A malformed last line is a torn
/// append from a crash and is dropped; malformed lines elsewhere are errors.
pub fn decode_records(contents: &str) -> Result<Vec<LogRecord>, LogError> {
    let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut records = Vec::with_capacity(lines.len());

    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(err) if index + 1 == lines.len() && !contents.ends_with('\n') => {
                log::warn!("Dropping torn log record at line {}: {}", index + 1, err);
            }
            Err(err) => {
                return Err(LogError::Corrupt {
                    line: index + 1,
                    source: err,
                })
            }
        }
    }

    Ok(records)
}

/// One append-only file per acceptor.
pub struct FileLog {
    path: PathBuf,
    file: File,
    /// Length of the file up to the last complete record.
    len: u64,
}

impl FileLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        if path.exists() {
            truncate_torn_tail(&path)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(FileLog { path, file, len })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        self.file.sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogStore for FileLog {
    fn append(&mut self, record: &LogRecord) -> Result<(), LogError> {
        let mut line = record.encode()?;
        line.push('\n');

        // A failed append may have left part of a line behind.
        let actual = self.file.metadata()?.len();
        if actual != self.len {
            log::warn!(
                "Cutting {} back from {} to {} bytes before appending",
                self.path.display(),
                actual,
                self.len
            );
            self.file.set_len(self.len)?;
        }

        match self.write_line(&line) {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(err) => {
                if let Err(cut) = self.file.set_len(self.len) {
                    log::warn!(
                        "Could not cut {} back after a failed append: {}",
                        self.path.display(),
                        cut
                    );
                }
                Err(err.into())
            }
        }
    }

    fn records(&self) -> Result<Vec<LogRecord>, LogError> {
        decode_records(&self.dump()?)
    }

    fn dump(&self) -> Result<String, LogError> {
        Ok(fs::read_to_string(&self.path)?)
    }

    fn restore(&mut self, contents: &str) -> Result<(), LogError> {
        let text = encode_lines(&decode_records(contents)?)?;
        let tmp = self.path.with_extension("restore");
        {
            let mut out = File::create(&tmp)?;
            out.write_all(text.as_bytes())?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.len = text.len() as u64;
        Ok(())
    }
}

/// Cuts a partial last line left by a crash mid-append, so that the next
/// append starts on a fresh line.
fn truncate_torn_tail(path: &Path) -> Result<(), LogError> {
    let bytes = fs::read(path)?;
    if bytes.is_empty() || bytes.ends_with(b"\n") {
        return Ok(());
    }
    let keep = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0);
    log::warn!(
        "Truncating {} torn bytes at the end of {}",
        bytes.len() - keep,
        path.display()
    );
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_all()?;
    Ok(())
}

fn encode_lines(records: &[LogRecord]) -> Result<String, LogError> {
    let mut text = String::new();
    for record in records {
        text.push_str(&record.encode()?);
        text.push('\n');
    }
    Ok(text)
}

/// In-memory log. Clones share the same buffer, so a test can drop an
/// acceptor and reopen a new one from what the old one wrote.
#[derive(Clone, Default)]
pub struct MemoryLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogStore for MemoryLog {
    fn append(&mut self, record: &LogRecord) -> Result<(), LogError> {
        let line = record.encode()?;
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
        Ok(())
    }

    fn records(&self) -> Result<Vec<LogRecord>, LogError> {
        decode_records(&self.dump()?)
    }

    fn dump(&self) -> Result<String, LogError> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(lines.iter().map(|l| format!("{}\n", l)).collect())
    }

    fn restore(&mut self, contents: &str) -> Result<(), LogError> {
        let records = decode_records(contents)?;
        let encoded = records
            .iter()
            .map(LogRecord::encode)
            .collect::<Result<Vec<_>, _>>()?;
        *self.lines.lock().unwrap_or_else(PoisonError::into_inner) = encoded;
        Ok(())
    }
}
