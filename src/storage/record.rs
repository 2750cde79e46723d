//! Journal record types
//!
//! Every record is framed as:
//!
//! ```text
//! +------------------+
//! | Record Length    | (u32 LE, whole frame including this field)
//! +------------------+
//! | Record Type      | (u8)
//! +------------------+
//! | Payload          | (type specific)
//! +------------------+
//! | Checksum         | (u32 LE, CRC32 of length + type + payload)
//! +------------------+
//! ```
//!
//! Strings and byte arrays inside payloads are u32 length-prefixed.
//! Transactions are written as a run of records closed by a `Commit`.

use std::io;

use uuid::Uuid;

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Length + type + checksum
pub const FRAME_OVERHEAD: usize = 4 + 1 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Header = 0,
    Revision = 1,
    Purge = 2,
    Expiration = 3,
    IndexCreate = 4,
    IndexDelete = 5,
    Checkpoint = 6,
    Commit = 7,
}

impl RecordType {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => RecordType::Header,
            1 => RecordType::Revision,
            2 => RecordType::Purge,
            3 => RecordType::Expiration,
            4 => RecordType::IndexCreate,
            5 => RecordType::IndexDelete,
            6 => RecordType::Checkpoint,
            7 => RecordType::Commit,
            _ => return None,
        })
    }
}

/// Why a document was purged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeReason {
    /// Explicit purge by the application
    Manual,
    /// Expired, never touched by replication
    Expired,
    /// Expired, and at least one revision came from a pull
    ExpiredPulled,
}

impl PurgeReason {
    fn to_u8(self) -> u8 {
        match self {
            PurgeReason::Manual => 0,
            PurgeReason::Expired => 1,
            PurgeReason::ExpiredPulled => 2,
        }
    }

    fn from_u8(value: u8) -> io::Result<Self> {
        match value {
            0 => Ok(PurgeReason::Manual),
            1 => Ok(PurgeReason::Expired),
            2 => Ok(PurgeReason::ExpiredPulled),
            other => Err(invalid(format!("unknown purge reason {}", other))),
        }
    }
}

/// A stored revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRecord {
    pub doc_id: String,
    pub rev_id: String,
    pub parent: Option<String>,
    /// Ancestors newest first, only for revisions that arrived with history
    pub history: Vec<String>,
    pub deleted: bool,
    pub sequence: u64,
    pub from_remote: bool,
    /// `None` for body-less revisions kept after compaction
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    Header {
        database_uuid: Uuid,
        format_version: u32,
    },
    Revision(RevisionRecord),
    Purge {
        doc_id: String,
        reason: PurgeReason,
    },
    Expiration {
        doc_id: String,
        /// Milliseconds since the Unix epoch; `None` clears the expiration
        expires_at: Option<i64>,
    },
    IndexCreate {
        name: String,
        definition: String,
    },
    IndexDelete {
        name: String,
    },
    Checkpoint {
        checkpoint_id: String,
        body: String,
    },
    Commit {
        commit_id: u64,
        last_sequence: u64,
    },
}

impl JournalRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            JournalRecord::Header { .. } => RecordType::Header,
            JournalRecord::Revision(_) => RecordType::Revision,
            JournalRecord::Purge { .. } => RecordType::Purge,
            JournalRecord::Expiration { .. } => RecordType::Expiration,
            JournalRecord::IndexCreate { .. } => RecordType::IndexCreate,
            JournalRecord::IndexDelete { .. } => RecordType::IndexDelete,
            JournalRecord::Checkpoint { .. } => RecordType::Checkpoint,
            JournalRecord::Commit { .. } => RecordType::Commit,
        }
    }

    /// Serializes the complete frame
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = FieldWriter::default();
        match self {
            JournalRecord::Header {
                database_uuid,
                format_version,
            } => {
                w.raw(database_uuid.as_bytes());
                w.u32(*format_version);
            }
            JournalRecord::Revision(rev) => {
                w.str(&rev.doc_id);
                w.str(&rev.rev_id);
                w.opt_str(rev.parent.as_deref());
                w.u32(rev.history.len() as u32);
                for ancestor in &rev.history {
                    w.str(ancestor);
                }
                w.bool(rev.deleted);
                w.u64(rev.sequence);
                w.bool(rev.from_remote);
                match &rev.body {
                    Some(body) => {
                        w.bool(true);
                        w.bytes(body);
                    }
                    None => w.bool(false),
                }
            }
            JournalRecord::Purge { doc_id, reason } => {
                w.str(doc_id);
                w.raw(&[reason.to_u8()]);
            }
            JournalRecord::Expiration { doc_id, expires_at } => {
                w.str(doc_id);
                match expires_at {
                    Some(ts) => {
                        w.bool(true);
                        w.u64(*ts as u64);
                    }
                    None => w.bool(false),
                }
            }
            JournalRecord::IndexCreate { name, definition } => {
                w.str(name);
                w.str(definition);
            }
            JournalRecord::IndexDelete { name } => w.str(name),
            JournalRecord::Checkpoint {
                checkpoint_id,
                body,
            } => {
                w.str(checkpoint_id);
                w.str(body);
            }
            JournalRecord::Commit {
                commit_id,
                last_sequence,
            } => {
                w.u64(*commit_id);
                w.u64(*last_sequence);
            }
        }

        let payload = w.0;
        let record_length = (FRAME_OVERHEAD + payload.len()) as u32;
        let mut frame = Vec::with_capacity(record_length as usize);
        frame.extend_from_slice(&record_length.to_le_bytes());
        frame.push(self.record_type() as u8);
        frame.extend_from_slice(&payload);
        let checksum = crc32fast::hash(&frame);
        frame.extend_from_slice(&checksum.to_le_bytes());
        frame
    }

    /// Parses one complete frame, verifying its checksum
    ///
    /// `frame` must be exactly the bytes announced by the length prefix.
    pub fn deserialize(frame: &[u8]) -> io::Result<Self> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(invalid("record shorter than frame overhead"));
        }
        let checksum_offset = frame.len() - 4;
        let stored = u32::from_le_bytes([
            frame[checksum_offset],
            frame[checksum_offset + 1],
            frame[checksum_offset + 2],
            frame[checksum_offset + 3],
        ]);
        let computed = crc32fast::hash(&frame[..checksum_offset]);
        if computed != stored {
            return Err(invalid(format!(
                "checksum mismatch: computed {:08x}, stored {:08x}",
                computed, stored
            )));
        }

        let record_type = RecordType::from_u8(frame[4])
            .ok_or_else(|| invalid(format!("unknown record type {}", frame[4])))?;
        let mut r = FieldReader {
            data: &frame[5..checksum_offset],
            pos: 0,
        };

        let record = match record_type {
            RecordType::Header => {
                let uuid = r.raw(16)?;
                let database_uuid = Uuid::from_slice(uuid).map_err(|e| invalid(e.to_string()))?;
                JournalRecord::Header {
                    database_uuid,
                    format_version: r.u32()?,
                }
            }
            RecordType::Revision => {
                let doc_id = r.str()?;
                let rev_id = r.str()?;
                let parent = r.opt_str()?;
                let count = r.u32()? as usize;
                let mut history = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    history.push(r.str()?);
                }
                let deleted = r.bool()?;
                let sequence = r.u64()?;
                let from_remote = r.bool()?;
                let body = if r.bool()? { Some(r.bytes()?) } else { None };
                JournalRecord::Revision(RevisionRecord {
                    doc_id,
                    rev_id,
                    parent,
                    history,
                    deleted,
                    sequence,
                    from_remote,
                    body,
                })
            }
            RecordType::Purge => JournalRecord::Purge {
                doc_id: r.str()?,
                reason: PurgeReason::from_u8(r.raw(1)?[0])?,
            },
            RecordType::Expiration => {
                let doc_id = r.str()?;
                let expires_at = if r.bool()? { Some(r.u64()? as i64) } else { None };
                JournalRecord::Expiration { doc_id, expires_at }
            }
            RecordType::IndexCreate => JournalRecord::IndexCreate {
                name: r.str()?,
                definition: r.str()?,
            },
            RecordType::IndexDelete => JournalRecord::IndexDelete { name: r.str()? },
            RecordType::Checkpoint => JournalRecord::Checkpoint {
                checkpoint_id: r.str()?,
                body: r.str()?,
            },
            RecordType::Commit => JournalRecord::Commit {
                commit_id: r.u64()?,
                last_sequence: r.u64()?,
            },
        };

        if r.pos != r.data.len() {
            return Err(invalid("trailing bytes in record payload"));
        }
        Ok(record)
    }
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

#[derive(Default)]
struct FieldWriter(Vec<u8>);

impl FieldWriter {
    fn raw(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn bool(&mut self, v: bool) {
        self.0.push(v as u8);
    }

    fn bytes(&mut self, v: &[u8]) {
        self.u32(v.len() as u32);
        self.raw(v);
    }

    fn str(&mut self, v: &str) {
        self.bytes(v.as_bytes());
    }

    fn opt_str(&mut self, v: Option<&str>) {
        match v {
            Some(s) => {
                self.bool(true);
                self.str(s);
            }
            None => self.bool(false),
        }
    }
}

struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn raw(&mut self, len: usize) -> io::Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "record payload truncated"))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> io::Result<u32> {
        let b = self.raw(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> io::Result<u64> {
        let b = self.raw(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(b);
        Ok(u64::from_le_bytes(out))
    }

    fn bool(&mut self) -> io::Result<bool> {
        match self.raw(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(invalid(format!("invalid flag byte {}", other))),
        }
    }

    fn bytes(&mut self) -> io::Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.raw(len)?.to_vec())
    }

    fn str(&mut self) -> io::Result<String> {
        String::from_utf8(self.bytes()?).map_err(|e| invalid(format!("invalid UTF-8: {}", e)))
    }

    fn opt_str(&mut self) -> io::Result<Option<String>> {
        if self.bool()? {
            Ok(Some(self.str()?))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn revision() -> JournalRecord {
        JournalRecord::Revision(RevisionRecord {
            doc_id: "doc1".into(),
            rev_id: "2-bb".into(),
            parent: Some("1-aa".into()),
            history: vec!["1-aa".into()],
            deleted: false,
            sequence: 7,
            from_remote: true,
            body: Some(vec![0xAE, 0x01, 0x00]),
        })
    }

    #[test]
    fn test_frame_length_prefix() {
        let frame = revision().serialize();
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len());
        assert_eq!(frame[4], RecordType::Revision as u8);
    }

    #[test]
    fn test_all_record_types_parse_back() {
        let records = vec![
            JournalRecord::Header {
                database_uuid: Uuid::new_v4(),
                format_version: FORMAT_VERSION,
            },
            revision(),
            JournalRecord::Purge {
                doc_id: "gone".into(),
                reason: PurgeReason::ExpiredPulled,
            },
            JournalRecord::Expiration {
                doc_id: "e".into(),
                expires_at: Some(1_700_000_000_000),
            },
            JournalRecord::Expiration {
                doc_id: "e".into(),
                expires_at: None,
            },
            JournalRecord::IndexCreate {
                name: "by_name".into(),
                definition: "{\"expressions\":[\"name\"]}".into(),
            },
            JournalRecord::IndexDelete { name: "by_name".into() },
            JournalRecord::Checkpoint {
                checkpoint_id: "cp-1".into(),
                body: "{\"local\":3}".into(),
            },
            JournalRecord::Commit {
                commit_id: 4,
                last_sequence: 9,
            },
        ];
        for record in records {
            let parsed = JournalRecord::deserialize(&record.serialize()).unwrap();
            assert_eq!(parsed, record);
        }
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let mut frame = revision().serialize();
        frame[10] ^= 0xFF;
        let err = JournalRecord::deserialize(&frame).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut frame = revision().serialize();
        frame[4] = 99;
        let end = frame.len() - 4;
        let checksum = crc32fast::hash(&frame[..end]);
        frame[end..].copy_from_slice(&checksum.to_le_bytes());
        assert!(JournalRecord::deserialize(&frame).is_err());
    }
}
