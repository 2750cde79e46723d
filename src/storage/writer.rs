//! Journal writer with fsync enforcement
//!
//! - A transaction is appended as one buffer ending with its commit record
//! - The append is fsynced before it is reported as durable
//! - A failed append truncates the file back to its previous length; if
//!   that fails too, the writer refuses every later append
//! - Compaction rewrites the journal to a temporary file and renames it
//!   over the original, so a crash leaves either the old or the new file

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::errors::{StorageError, StorageResult};
use super::record::JournalRecord;

/// Journal file name inside a database directory
pub const JOURNAL_FILE: &str = "journal.log";

const REWRITE_FILE: &str = "journal.log.compact";

/// Append-only journal writer
pub struct JournalWriter {
    path: PathBuf,
    file: File,
    current_offset: u64,
    /// Set when a partial append could not be rolled back
    unusable: bool,
}

impl JournalWriter {
    /// Opens the journal for append, truncating it to `valid_length`
    ///
    /// `valid_length` comes from replay and drops any torn tail.
    pub fn open(path: &Path, valid_length: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                StorageError::write_failed(format!("Failed to open journal: {}", path.display()), e)
            })?;

        let len = file
            .metadata()
            .map_err(|e| StorageError::io_error("Failed to read journal metadata", e))?
            .len();
        if len != valid_length {
            file.set_len(valid_length)
                .map_err(|e| StorageError::io_error("Failed to truncate torn journal tail", e))?;
            file.sync_all()
                .map_err(|e| StorageError::io_error("Failed to sync truncated journal", e))?;
        }

        let mut writer = Self {
            path: path.to_path_buf(),
            file,
            current_offset: valid_length,
            unusable: false,
        };
        writer.seek_end()?;
        Ok(writer)
    }

    fn seek_end(&mut self) -> StorageResult<()> {
        use std::io::{Seek, SeekFrom};
        self.file
            .seek(SeekFrom::Start(self.current_offset))
            .map_err(|e| StorageError::io_error("Failed to seek journal", e))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length of the journal in bytes
    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    /// Appends records and fsyncs
    ///
    /// Returns the number of bytes written.
    pub fn append(&mut self, records: &[JournalRecord]) -> StorageResult<u64> {
        if self.unusable {
            return Err(StorageError::closed(format!(
                "Journal {} holds a partial append that could not be removed",
                self.path.display()
            )));
        }
        let mut buf = Vec::new();
        for record in records {
            buf.extend_from_slice(&record.serialize());
        }

        let result = self
            .file
            .write_all(&buf)
            .and_then(|_| self.file.sync_data());
        if let Err(e) = result {
            if let Err(rollback) = self.roll_back() {
                self.unusable = true;
                return Err(StorageError::write_failed(
                    format!("Failed to append to journal; rollback failed: {}", rollback),
                    e,
                ));
            }
            return Err(StorageError::write_failed("Failed to append to journal", e));
        }

        self.current_offset += buf.len() as u64;
        Ok(buf.len() as u64)
    }

    /// Drops a partial batch so the next append starts on a frame boundary
    fn roll_back(&mut self) -> StorageResult<()> {
        self.file
            .set_len(self.current_offset)
            .map_err(|e| StorageError::io_error("Failed to truncate partial append", e))?;
        self.seek_end()
    }

    /// Atomically replaces the journal with `records`
    pub fn rewrite(&mut self, records: &[JournalRecord]) -> StorageResult<u64> {
        let dir = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        let temp_path = dir.join(REWRITE_FILE);
        write_file(&temp_path, records)?;

        fs::rename(&temp_path, &self.path)
            .map_err(|e| StorageError::io_error("Failed to replace journal", e))?;
        sync_dir(&dir)?;

        let len = fs::metadata(&self.path)
            .map_err(|e| StorageError::io_error("Failed to read journal metadata", e))?
            .len();
        *self = JournalWriter::open(&self.path, len)?;
        Ok(len)
    }
}

/// Writes `records` to a fresh file at `path` and fsyncs it
pub fn write_file(path: &Path, records: &[JournalRecord]) -> StorageResult<u64> {
    let mut buf = Vec::new();
    for record in records {
        buf.extend_from_slice(&record.serialize());
    }
    let mut file = File::create(path).map_err(|e| {
        StorageError::write_failed(format!("Failed to create journal: {}", path.display()), e)
    })?;
    file.write_all(&buf)
        .and_then(|_| file.sync_all())
        .map_err(|e| StorageError::write_failed("Failed to write journal", e))?;
    Ok(buf.len() as u64)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> StorageResult<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StorageError::io_error("Failed to sync database directory", e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> StorageResult<()> {
    Ok(())
}
