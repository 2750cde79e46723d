//! Canonical encoder
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! slice     := MAGIC(2) value
//! value     := tag(1) payload
//! Null      := (empty)            False/True := (empty)
//! Int       := i64(8)             Float      := f64 bits(8)
//! String    := len(4) utf8        Binary     := len(4) bytes
//! Array     := count(4) body_len(4) offsets(count*4) items
//! Dict      := count(4) body_len(4) offsets(count*4) entries
//! entry     := key_len(4) key value
//! ```
//!
//! `body_len` covers the offset table and the items. Offsets are relative to
//! the first item and strictly increasing. Dict entries are sorted by key
//! bytes, which makes the encoding of a given value unique.

use super::errors::{CodecError, CodecResult};
use super::value::Value;
use super::MAX_DEPTH;

/// Header that starts every encoded slice
pub const FORMAT_MAGIC: [u8; 2] = [0xAE, 0x01];

pub(crate) mod tag {
    pub const NULL: u8 = 0;
    pub const FALSE: u8 = 1;
    pub const TRUE: u8 = 2;
    pub const INT: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const STRING: u8 = 5;
    pub const BINARY: u8 = 6;
    pub const ARRAY: u8 = 7;
    pub const DICT: u8 = 8;
}

/// Size of the container header: tag, count, body_len
pub(crate) const CONTAINER_HEADER: usize = 9;

/// Encodes a value tree to its canonical byte form
pub fn encode(value: &Value) -> CodecResult<Vec<u8>> {
    let mut encoder = Encoder {
        buf: Vec::with_capacity(64),
    };
    encoder.buf.extend_from_slice(&FORMAT_MAGIC);
    encoder.write_value(value, 0)?;
    Ok(encoder.buf)
}

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn write_value(&mut self, value: &Value, depth: usize) -> CodecResult<()> {
        if depth > MAX_DEPTH {
            return Err(CodecError::depth_exceeded(MAX_DEPTH));
        }
        match value {
            Value::Null => self.buf.push(tag::NULL),
            Value::Bool(false) => self.buf.push(tag::FALSE),
            Value::Bool(true) => self.buf.push(tag::TRUE),
            Value::Int(i) => {
                self.buf.push(tag::INT);
                self.buf.extend_from_slice(&i.to_le_bytes());
            }
            Value::Float(f) => {
                self.buf.push(tag::FLOAT);
                self.buf.extend_from_slice(&f.to_bits().to_le_bytes());
            }
            Value::String(s) => {
                self.buf.push(tag::STRING);
                self.write_bytes(s.as_bytes())?;
            }
            Value::Binary(b) => {
                self.buf.push(tag::BINARY);
                self.write_bytes(b)?;
            }
            Value::Array(items) => {
                let header = self.begin_container(tag::ARRAY, items.len())?;
                for (i, item) in items.iter().enumerate() {
                    self.mark_item(&header, i)?;
                    self.write_value(item, depth + 1)?;
                }
                self.finish_container(&header)?;
            }
            Value::Dict(dict) => {
                let header = self.begin_container(tag::DICT, dict.len())?;
                // BTreeMap<String, _> iterates in byte order of the keys
                for (i, (key, item)) in dict.iter().enumerate() {
                    self.mark_item(&header, i)?;
                    self.write_bytes(key.as_bytes())?;
                    self.write_value(item, depth + 1)?;
                }
                self.finish_container(&header)?;
            }
        }
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> CodecResult<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| CodecError::too_large(format!("{} bytes exceeds u32 length", bytes.len())))?;
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn begin_container(&mut self, tag: u8, count: usize) -> CodecResult<ContainerHeader> {
        let count32 = u32::try_from(count)
            .map_err(|_| CodecError::too_large(format!("{} items exceeds u32 count", count)))?;
        let start = self.buf.len();
        self.buf.push(tag);
        self.buf.extend_from_slice(&count32.to_le_bytes());
        self.buf.extend_from_slice(&0u32.to_le_bytes());
        let table = self.buf.len();
        self.buf.resize(table + count * 4, 0);
        Ok(ContainerHeader {
            start,
            table,
            items: table + count * 4,
        })
    }

    fn mark_item(&mut self, header: &ContainerHeader, index: usize) -> CodecResult<()> {
        let offset = to_u32(self.buf.len() - header.items)?;
        let slot = header.table + index * 4;
        self.buf[slot..slot + 4].copy_from_slice(&offset.to_le_bytes());
        Ok(())
    }

    fn finish_container(&mut self, header: &ContainerHeader) -> CodecResult<()> {
        let body_len = to_u32(self.buf.len() - header.table)?;
        let slot = header.start + 5;
        self.buf[slot..slot + 4].copy_from_slice(&body_len.to_le_bytes());
        Ok(())
    }
}

struct ContainerHeader {
    start: usize,
    table: usize,
    items: usize,
}

fn to_u32(n: usize) -> CodecResult<u32> {
    u32::try_from(n).map_err(|_| CodecError::too_large(format!("container of {} bytes", n)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Dict;

    #[test]
    fn test_scalar_layout() {
        assert_eq!(encode(&Value::Null).unwrap(), vec![0xAE, 0x01, tag::NULL]);
        assert_eq!(encode(&Value::Bool(true)).unwrap(), vec![0xAE, 0x01, tag::TRUE]);

        let bytes = encode(&Value::Int(-2)).unwrap();
        assert_eq!(bytes[2], tag::INT);
        assert_eq!(&bytes[3..], &(-2i64).to_le_bytes());
    }

    #[test]
    fn test_string_layout() {
        let bytes = encode(&Value::from("hi")).unwrap();
        assert_eq!(bytes, vec![0xAE, 0x01, tag::STRING, 2, 0, 0, 0, b'h', b'i']);
    }

    #[test]
    fn test_dict_encoding_is_canonical() {
        let mut a = Dict::new();
        a.insert("zeta".into(), Value::Int(1));
        a.insert("alpha".into(), Value::Int(2));

        let mut b = Dict::new();
        b.insert("alpha".into(), Value::Int(2));
        b.insert("zeta".into(), Value::Int(1));

        assert_eq!(encode(&Value::Dict(a)).unwrap(), encode(&Value::Dict(b)).unwrap());
    }

    #[test]
    fn test_container_header() {
        let bytes = encode(&Value::Array(vec![Value::Null, Value::Bool(false)])).unwrap();
        assert_eq!(bytes[2], tag::ARRAY);
        assert_eq!(u32::from_le_bytes(bytes[3..7].try_into().unwrap()), 2);
        // body = 2 offsets + 2 one-byte items
        assert_eq!(u32::from_le_bytes(bytes[7..11].try_into().unwrap()), 10);
        assert_eq!(u32::from_le_bytes(bytes[11..15].try_into().unwrap()), 0);
        assert_eq!(u32::from_le_bytes(bytes[15..19].try_into().unwrap()), 1);
    }

    #[test]
    fn test_depth_limit() {
        let mut v = Value::Null;
        for _ in 0..(MAX_DEPTH + 2) {
            v = Value::Array(vec![v]);
        }
        let err = encode(&v).unwrap_err();
        assert_eq!(err.code().code(), "AERO_CODEC_DEPTH_EXCEEDED");
    }
}
