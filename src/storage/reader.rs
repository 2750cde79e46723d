//! Journal reader and replay
//!
//! Every frame's checksum is verified. Replay hands back only batches that
//! reached their `Commit` record; the bytes after the last commit are the
//! torn tail of an interrupted append and are reported so the writer can
//! truncate them.
//!
//! A damaged frame is treated as torn only when nothing follows it in the
//! file. Damage anywhere before that is corruption and fails replay.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::errors::{StorageError, StorageResult};
use super::record::{JournalRecord, FRAME_OVERHEAD};

/// One committed transaction
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedBatch {
    pub commit_id: u64,
    pub last_sequence: u64,
    /// Records of the batch, excluding the commit record
    pub records: Vec<JournalRecord>,
}

/// Result of replaying a journal
#[derive(Debug, Clone, Default)]
pub struct Replay {
    pub database_uuid: Option<Uuid>,
    pub format_version: u32,
    pub batches: Vec<CommittedBatch>,
    /// Length of the journal up to the end of the last commit
    pub valid_length: u64,
    /// Bytes after `valid_length` that belong to no committed batch
    pub discarded_bytes: u64,
}

#[derive(Debug)]
pub enum ReadOutcome {
    Record(JournalRecord),
    End,
    TornTail,
}

/// Sequential journal reader
pub struct JournalReader {
    path: PathBuf,
    reader: BufReader<File>,
    current_offset: u64,
    file_size: u64,
}

impl JournalReader {
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = File::open(path).map_err(|e| {
            StorageError::read_failed(format!("Failed to open journal: {}", path.display()), e)
        })?;
        let file_size = file
            .metadata()
            .map_err(|e| StorageError::read_failed("Failed to read journal metadata", e))?
            .len();
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            current_offset: 0,
            file_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    /// Reads the next frame
    ///
    /// - `Record` for a valid frame
    /// - `End` at the exact end of the file
    /// - `TornTail` for an incomplete or damaged final frame
    /// - `Err(AERO_DATA_CORRUPTION)` for a damaged frame followed by more data
    pub fn read_next(&mut self) -> StorageResult<ReadOutcome> {
        if self.current_offset >= self.file_size {
            return Ok(ReadOutcome::End);
        }
        let remaining = self.file_size - self.current_offset;
        if remaining < 4 {
            return Ok(ReadOutcome::TornTail);
        }

        let mut len_buf = [0u8; 4];
        self.reader.read_exact(&mut len_buf).map_err(|e| {
            StorageError::read_failed(format!("Failed to read record length at {}", self.current_offset), e)
        })?;
        let record_length = u32::from_le_bytes(len_buf) as u64;

        if record_length > remaining {
            return Ok(ReadOutcome::TornTail);
        }
        if record_length < FRAME_OVERHEAD as u64 {
            if record_length == 0 && self.rest_is_zero(remaining - 4)? {
                // preallocated but never written
                return Ok(ReadOutcome::TornTail);
            }
            return Err(StorageError::corruption_at_offset(
                self.current_offset,
                format!("Invalid record length: {}", record_length),
            ));
        }

        let mut frame = vec![0u8; record_length as usize];
        frame[0..4].copy_from_slice(&len_buf);
        self.reader.read_exact(&mut frame[4..]).map_err(|e| {
            StorageError::read_failed(format!("Failed to read record at {}", self.current_offset), e)
        })?;

        match JournalRecord::deserialize(&frame) {
            Ok(record) => {
                self.current_offset += record_length;
                Ok(ReadOutcome::Record(record))
            }
            Err(_) if record_length == remaining => Ok(ReadOutcome::TornTail),
            Err(e) => Err(StorageError::corruption_at_offset(self.current_offset, e.to_string())),
        }
    }

    fn rest_is_zero(&mut self, len: u64) -> StorageResult<bool> {
        let mut rest = Vec::with_capacity(len as usize);
        (&mut self.reader)
            .take(len)
            .read_to_end(&mut rest)
            .map_err(|e| StorageError::read_failed("Failed to read journal tail", e))?;
        Ok(rest.iter().all(|b| *b == 0))
    }
}

/// Replays the journal at `path`
///
/// A missing or empty file replays to an empty `Replay`.
pub fn replay(path: &Path) -> StorageResult<Replay> {
    let mut out = Replay::default();
    match std::fs::metadata(path) {
        Ok(m) if m.len() == 0 => return Ok(out),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(StorageError::read_failed("Failed to read journal metadata", e)),
    }

    let mut reader = JournalReader::open(path)?;
    let file_size = reader.file_size;
    let mut pending: Vec<JournalRecord> = Vec::new();

    loop {
        let offset = reader.current_offset();
        match reader.read_next()? {
            ReadOutcome::End | ReadOutcome::TornTail => break,
            ReadOutcome::Record(record) => match record {
                JournalRecord::Header {
                    database_uuid,
                    format_version,
                } => {
                    if offset != 0 {
                        return Err(StorageError::corruption_at_offset(offset, "Header record after start of journal"));
                    }
                    out.database_uuid = Some(database_uuid);
                    out.format_version = format_version;
                    out.valid_length = reader.current_offset();
                }
                _ if out.database_uuid.is_none() => {
                    return Err(StorageError::corruption_at_offset(offset, "Journal does not start with a header"));
                }
                JournalRecord::Commit {
                    commit_id,
                    last_sequence,
                } => {
                    out.batches.push(CommittedBatch {
                        commit_id,
                        last_sequence,
                        records: std::mem::take(&mut pending),
                    });
                    out.valid_length = reader.current_offset();
                }
                other => pending.push(other),
            },
        }
    }

    out.discarded_bytes = file_size - out.valid_length;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::{RevisionRecord, FORMAT_VERSION};
    use std::io::Write;
    use tempfile::TempDir;

    fn header() -> JournalRecord {
        JournalRecord::Header {
            database_uuid: Uuid::new_v4(),
            format_version: FORMAT_VERSION,
        }
    }

    fn rev(doc: &str, seq: u64) -> JournalRecord {
        JournalRecord::Revision(RevisionRecord {
            doc_id: doc.into(),
            rev_id: format!("1-{:02x}", seq),
            parent: None,
            history: vec![],
            deleted: false,
            sequence: seq,
            from_remote: false,
            body: Some(vec![1, 2, 3]),
        })
    }

    fn commit(id: u64, seq: u64) -> JournalRecord {
        JournalRecord::Commit {
            commit_id: id,
            last_sequence: seq,
        }
    }

    fn write(path: &Path, records: &[JournalRecord]) -> Vec<u64> {
        let mut file = std::fs::File::create(path).unwrap();
        let mut offsets = Vec::new();
        let mut offset = 0u64;
        for r in records {
            offsets.push(offset);
            let bytes = r.serialize();
            offset += bytes.len() as u64;
            file.write_all(&bytes).unwrap();
        }
        offsets
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let replay = replay(&temp.path().join("journal.log")).unwrap();
        assert!(replay.database_uuid.is_none());
        assert!(replay.batches.is_empty());
    }

    #[test]
    fn test_committed_batches() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("journal.log");
        write(&path, &[header(), rev("a", 1), commit(1, 1), rev("b", 2), rev("c", 3), commit(2, 3)]);

        let replay = replay(&path).unwrap();
        assert_eq!(replay.batches.len(), 2);
        assert_eq!(replay.batches[1].records.len(), 2);
        assert_eq!(replay.batches[1].last_sequence, 3);
        assert_eq!(replay.discarded_bytes, 0);
    }

    #[test]
    fn test_uncommitted_tail_discarded() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("journal.log");
        write(&path, &[header(), rev("a", 1), commit(1, 1), rev("b", 2)]);

        let replay = replay(&path).unwrap();
        assert_eq!(replay.batches.len(), 1);
        assert!(replay.discarded_bytes > 0);
    }

    #[test]
    fn test_truncated_frame_is_torn() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("journal.log");
        write(&path, &[header(), rev("a", 1), commit(1, 1), rev("b", 2), commit(2, 2)]);
        let len = std::fs::metadata(&path).unwrap().len();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let replay = replay(&path).unwrap();
        assert_eq!(replay.batches.len(), 1);
    }

    #[test]
    fn test_damaged_committed_record_is_fatal() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("journal.log");
        let offsets = write(&path, &[header(), rev("a", 1), commit(1, 1)]);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[offsets[1] as usize + 8] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = replay(&path).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.code().code(), "AERO_DATA_CORRUPTION");
    }

    #[test]
    fn test_missing_header_is_fatal() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("journal.log");
        write(&path, &[rev("a", 1), commit(1, 1)]);
        assert!(replay(&path).unwrap_err().is_fatal());
    }
}
