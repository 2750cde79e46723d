//! Lazy, bounds-checked decoding
//!
//! A `Slice` wraps encoded bytes without materializing them. `ValueRef`
//! points at one value inside the slice; dict lookups binary-search the
//! sorted entry table and array access jumps through the offset table, so
//! reading one field of a large document touches only that field.
//!
//! # Invariants
//!
//! - Every read is bounds-checked; malformed input yields `CorruptData`
//! - A child `ValueRef` can never read past the end of its slot
//! - Nesting is limited to `MAX_DEPTH`

use std::cmp::Ordering;

use super::encoder::{tag, CONTAINER_HEADER, FORMAT_MAGIC};
use super::errors::{CodecError, CodecResult};
use super::value::{Dict, Value, ValueKind};
use super::MAX_DEPTH;

/// Validated view over an encoded value
#[derive(Debug, Clone, Copy)]
pub struct Slice<'a> {
    root: ValueRef<'a>,
}

impl<'a> Slice<'a> {
    /// Checks the header and the extent of the root value
    pub fn new(buf: &'a [u8]) -> CodecResult<Self> {
        if buf.len() < FORMAT_MAGIC.len() + 1 {
            return Err(CodecError::corrupt_at(0, "slice too short"));
        }
        if buf[..FORMAT_MAGIC.len()] != FORMAT_MAGIC {
            return Err(CodecError::corrupt_at(0, "missing slice header"));
        }
        let root = ValueRef {
            buf,
            pos: FORMAT_MAGIC.len(),
            depth: 0,
        };
        let end = root.end()?;
        if end != buf.len() {
            return Err(CodecError::corrupt_at(end, "trailing bytes after root value"));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> ValueRef<'a> {
        self.root
    }
}

/// Decodes bytes into an owned value tree
///
/// The whole structure is validated first, so a value that lazy reads
/// would see differently (unsorted keys, overlapping slots) is rejected.
pub fn decode(bytes: &[u8]) -> CodecResult<Value> {
    let root = Slice::new(bytes)?.root();
    root.validate()?;
    root.to_value()
}

/// Reference to one encoded value
#[derive(Debug, Clone, Copy)]
pub struct ValueRef<'a> {
    /// Bytes up to the end of this value's slot
    buf: &'a [u8],
    pos: usize,
    depth: usize,
}

#[derive(Debug, Clone, Copy)]
struct Container {
    count: usize,
    table: usize,
    items: usize,
    end: usize,
}

impl<'a> ValueRef<'a> {
    pub fn kind(&self) -> CodecResult<ValueKind> {
        Ok(match self.tag()? {
            tag::NULL => ValueKind::Null,
            tag::FALSE | tag::TRUE => ValueKind::Bool,
            tag::INT => ValueKind::Int,
            tag::FLOAT => ValueKind::Float,
            tag::STRING => ValueKind::String,
            tag::BINARY => ValueKind::Binary,
            tag::ARRAY => ValueKind::Array,
            tag::DICT => ValueKind::Dict,
            other => {
                return Err(CodecError::corrupt_at(
                    self.pos,
                    format!("unknown value tag {}", other),
                ))
            }
        })
    }

    pub fn is_null(&self) -> CodecResult<bool> {
        Ok(self.kind()? == ValueKind::Null)
    }

    pub fn as_bool(&self) -> CodecResult<bool> {
        match self.tag()? {
            tag::FALSE => Ok(false),
            tag::TRUE => Ok(true),
            _ => Err(CodecError::type_mismatch("bool", self.kind()?)),
        }
    }

    pub fn as_i64(&self) -> CodecResult<i64> {
        match self.tag()? {
            tag::INT => Ok(i64::from_le_bytes(self.array8(self.pos + 1)?)),
            _ => Err(CodecError::type_mismatch("int", self.kind()?)),
        }
    }

    /// Numeric value as a float (integers are widened)
    pub fn as_f64(&self) -> CodecResult<f64> {
        match self.tag()? {
            tag::INT => Ok(i64::from_le_bytes(self.array8(self.pos + 1)?) as f64),
            tag::FLOAT => Ok(f64::from_bits(u64::from_le_bytes(self.array8(self.pos + 1)?))),
            _ => Err(CodecError::type_mismatch("number", self.kind()?)),
        }
    }

    pub fn as_str(&self) -> CodecResult<&'a str> {
        match self.tag()? {
            tag::STRING => self.utf8(self.pos + 1),
            _ => Err(CodecError::type_mismatch("string", self.kind()?)),
        }
    }

    pub fn as_binary(&self) -> CodecResult<&'a [u8]> {
        match self.tag()? {
            tag::BINARY => {
                let len = self.u32_at(self.pos + 1)?;
                self.bytes(self.pos + 5, len)
            }
            _ => Err(CodecError::type_mismatch("binary", self.kind()?)),
        }
    }

    /// Number of items in an array or entries in a dict
    pub fn len(&self) -> CodecResult<usize> {
        Ok(self.container()?.count)
    }

    pub fn is_empty(&self) -> CodecResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Array element at `index`
    pub fn index(&self, index: usize) -> CodecResult<Option<ValueRef<'a>>> {
        if self.tag()? != tag::ARRAY {
            return Err(CodecError::type_mismatch("array", self.kind()?));
        }
        let c = self.container()?;
        if index >= c.count {
            return Ok(None);
        }
        let (start, limit) = self.slot(&c, index)?;
        self.child(start, limit).map(Some)
    }

    /// Dict lookup by key (binary search over the sorted entries)
    pub fn get(&self, key: &str) -> CodecResult<Option<ValueRef<'a>>> {
        if self.tag()? != tag::DICT {
            return Err(CodecError::type_mismatch("dict", self.kind()?));
        }
        let c = self.container()?;
        let (mut lo, mut hi) = (0usize, c.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (entry_key, value_pos, limit) = self.entry(&c, mid)?;
            match entry_key.as_bytes().cmp(key.as_bytes()) {
                Ordering::Equal => return self.child(value_pos, limit).map(Some),
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }

    /// Follows a dotted property path through nested dicts
    ///
    /// Returns `None` if a segment is missing or a non-dict is reached.
    pub fn get_path(&self, path: &str) -> CodecResult<Option<ValueRef<'a>>> {
        let mut current = *self;
        for segment in path.split('.') {
            if current.kind()? != ValueKind::Dict {
                return Ok(None);
            }
            match current.get(segment)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Keys of a dict in stored order
    pub fn keys(&self) -> CodecResult<Vec<&'a str>> {
        Ok(self.entries()?.into_iter().map(|(k, _)| k).collect())
    }

    /// Key/value pairs of a dict in stored order
    pub fn entries(&self) -> CodecResult<Vec<(&'a str, ValueRef<'a>)>> {
        if self.tag()? != tag::DICT {
            return Err(CodecError::type_mismatch("dict", self.kind()?));
        }
        let c = self.container()?;
        (0..c.count)
            .map(|i| {
                let (key, value_pos, limit) = self.entry(&c, i)?;
                Ok((key, self.child(value_pos, limit)?))
            })
            .collect()
    }

    /// Elements of an array in order
    pub fn items(&self) -> CodecResult<Vec<ValueRef<'a>>> {
        if self.tag()? != tag::ARRAY {
            return Err(CodecError::type_mismatch("array", self.kind()?));
        }
        let c = self.container()?;
        (0..c.count)
            .map(|i| {
                let (start, limit) = self.slot(&c, i)?;
                self.child(start, limit)
            })
            .collect()
    }

    /// Materializes this value and everything below it
    pub fn to_value(&self) -> CodecResult<Value> {
        Ok(match self.kind()? {
            ValueKind::Null => Value::Null,
            ValueKind::Bool => Value::Bool(self.as_bool()?),
            ValueKind::Int => Value::Int(self.as_i64()?),
            ValueKind::Float => Value::Float(self.as_f64()?),
            ValueKind::String => Value::String(self.as_str()?.to_string()),
            ValueKind::Binary => Value::Binary(self.as_binary()?.to_vec()),
            ValueKind::Array => Value::Array(
                self.items()?
                    .iter()
                    .map(ValueRef::to_value)
                    .collect::<CodecResult<Vec<_>>>()?,
            ),
            ValueKind::Dict => {
                let mut dict = Dict::new();
                for (key, value) in self.entries()? {
                    dict.insert(key.to_string(), value.to_value()?);
                }
                Value::Dict(dict)
            }
        })
    }

    /// Converts to a plain JSON structure, failing past `max_depth` levels
    pub fn to_plain(&self, max_depth: usize) -> CodecResult<serde_json::Value> {
        self.to_value()?.to_plain(max_depth)
    }

    /// Full structural check of this value and its descendants
    ///
    /// Verifies UTF-8 strings, strictly increasing offsets with no gaps,
    /// and strictly ascending dict keys.
    pub fn validate(&self) -> CodecResult<()> {
        match self.kind()? {
            ValueKind::Null | ValueKind::Bool | ValueKind::Int | ValueKind::Float => {
                self.end()?;
            }
            ValueKind::String => {
                self.as_str()?;
            }
            ValueKind::Binary => {
                self.as_binary()?;
            }
            ValueKind::Array => {
                let c = self.container()?;
                for i in 0..c.count {
                    let (start, limit) = self.slot(&c, i)?;
                    let child = self.child(start, limit)?;
                    if child.end()? != limit {
                        return Err(CodecError::corrupt_at(start, "array item does not fill its slot"));
                    }
                    child.validate()?;
                }
            }
            ValueKind::Dict => {
                let c = self.container()?;
                let mut previous: Option<&str> = None;
                for i in 0..c.count {
                    let (key, value_pos, limit) = self.entry(&c, i)?;
                    if let Some(prev) = previous {
                        if prev.as_bytes() >= key.as_bytes() {
                            return Err(CodecError::corrupt_at(
                                value_pos,
                                "dict keys are not strictly ascending",
                            ));
                        }
                    }
                    previous = Some(key);
                    let child = self.child(value_pos, limit)?;
                    if child.end()? != limit {
                        return Err(CodecError::corrupt_at(value_pos, "dict value does not fill its slot"));
                    }
                    child.validate()?;
                }
            }
        }
        Ok(())
    }

    // ==================
    // Raw access
    // ==================

    fn tag(&self) -> CodecResult<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| CodecError::corrupt_at(self.pos, "unexpected end of data"))
    }

    fn bytes(&self, at: usize, len: usize) -> CodecResult<&'a [u8]> {
        let end = at
            .checked_add(len)
            .ok_or_else(|| CodecError::corrupt_at(at, "length overflow"))?;
        self.buf
            .get(at..end)
            .ok_or_else(|| CodecError::corrupt_at(at, "value extends past end of data"))
    }

    fn array8(&self, at: usize) -> CodecResult<[u8; 8]> {
        let b = self.bytes(at, 8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(b);
        Ok(out)
    }

    fn u32_at(&self, at: usize) -> CodecResult<usize> {
        let b = self.bytes(at, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }

    fn utf8(&self, at: usize) -> CodecResult<&'a str> {
        let len = self.u32_at(at)?;
        let raw = self.bytes(at + 4, len)?;
        std::str::from_utf8(raw).map_err(|_| CodecError::corrupt_at(at + 4, "invalid UTF-8 in string"))
    }

    /// Offset one past the end of this value
    fn end(&self) -> CodecResult<usize> {
        match self.kind()? {
            ValueKind::Null | ValueKind::Bool => Ok(self.pos + 1),
            ValueKind::Int | ValueKind::Float => {
                self.bytes(self.pos + 1, 8)?;
                Ok(self.pos + 9)
            }
            ValueKind::String | ValueKind::Binary => {
                let len = self.u32_at(self.pos + 1)?;
                self.bytes(self.pos + 5, len)?;
                Ok(self.pos + 5 + len)
            }
            ValueKind::Array | ValueKind::Dict => Ok(self.container()?.end),
        }
    }

    fn container(&self) -> CodecResult<Container> {
        match self.tag()? {
            tag::ARRAY | tag::DICT => {}
            _ => return Err(CodecError::type_mismatch("array or dict", self.kind()?)),
        }
        let count = self.u32_at(self.pos + 1)?;
        let body_len = self.u32_at(self.pos + 5)?;
        let table = self.pos + CONTAINER_HEADER;
        let end = table
            .checked_add(body_len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| CodecError::corrupt_at(self.pos, "container extends past end of data"))?;
        let table_len = count
            .checked_mul(4)
            .filter(|len| *len <= body_len)
            .ok_or_else(|| CodecError::corrupt_at(self.pos, "offset table exceeds container body"))?;
        Ok(Container {
            count,
            table,
            items: table + table_len,
            end,
        })
    }

    /// Start and limit of item `index`; offsets must be strictly increasing
    fn slot(&self, c: &Container, index: usize) -> CodecResult<(usize, usize)> {
        let start = self.item_start(c, index)?;
        let limit = if index + 1 < c.count {
            self.item_start(c, index + 1)?
        } else {
            c.end
        };
        if limit <= start {
            return Err(CodecError::corrupt_at(start, "container offsets are not increasing"));
        }
        Ok((start, limit))
    }

    fn item_start(&self, c: &Container, index: usize) -> CodecResult<usize> {
        let offset = self.u32_at(c.table + index * 4)?;
        let start = c.items + offset;
        if start >= c.end {
            return Err(CodecError::corrupt_at(c.table + index * 4, "item offset outside container"));
        }
        Ok(start)
    }

    /// Key, value position and slot limit of dict entry `index`
    fn entry(&self, c: &Container, index: usize) -> CodecResult<(&'a str, usize, usize)> {
        let (start, limit) = self.slot(c, index)?;
        let bounded = ValueRef {
            buf: &self.buf[..limit],
            pos: start,
            depth: self.depth,
        };
        let key = bounded.utf8(start)?;
        let value_pos = start + 4 + key.len();
        if value_pos >= limit {
            return Err(CodecError::corrupt_at(start, "dict entry has no value"));
        }
        Ok((key, value_pos, limit))
    }

    fn child(&self, pos: usize, limit: usize) -> CodecResult<ValueRef<'a>> {
        if self.depth + 1 > MAX_DEPTH {
            return Err(CodecError::corrupt_at(pos, "nesting exceeds maximum depth"));
        }
        Ok(ValueRef {
            buf: &self.buf[..limit],
            pos,
            depth: self.depth + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use serde_json::json;

    fn sample() -> Vec<u8> {
        let v = Value::from_json(&json!({
            "name": "Alice",
            "age": 41,
            "score": 9.5,
            "tags": ["a", "b", "c"],
            "address": {"city": "Oslo", "zip": null},
            "active": true
        }));
        encode(&v).unwrap()
    }

    #[test]
    fn test_lazy_field_access() {
        let bytes = sample();
        let slice = Slice::new(&bytes).unwrap();
        let root = slice.root();
        assert_eq!(root.get("name").unwrap().unwrap().as_str().unwrap(), "Alice");
        assert_eq!(root.get("age").unwrap().unwrap().as_i64().unwrap(), 41);
        assert_eq!(root.get("score").unwrap().unwrap().as_f64().unwrap(), 9.5);
        assert!(root.get("active").unwrap().unwrap().as_bool().unwrap());
        assert!(root.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_array_index_and_path() {
        let bytes = sample();
        let root = Slice::new(&bytes).unwrap().root();
        let tags = root.get("tags").unwrap().unwrap();
        assert_eq!(tags.len().unwrap(), 3);
        assert_eq!(tags.index(2).unwrap().unwrap().as_str().unwrap(), "c");
        assert!(tags.index(3).unwrap().is_none());

        let city = root.get_path("address.city").unwrap().unwrap();
        assert_eq!(city.as_str().unwrap(), "Oslo");
        assert!(root.get_path("name.first").unwrap().is_none());
        assert!(root.get_path("address.zip").unwrap().unwrap().is_null().unwrap());
    }

    #[test]
    fn test_keys_are_sorted() {
        let bytes = sample();
        let root = Slice::new(&bytes).unwrap().root();
        assert_eq!(
            root.keys().unwrap(),
            vec!["active", "address", "age", "name", "score", "tags"]
        );
    }

    #[test]
    fn test_type_mismatch() {
        let bytes = sample();
        let root = Slice::new(&bytes).unwrap().root();
        let err = root.get("name").unwrap().unwrap().as_i64().unwrap_err();
        assert!(!err.is_fatal());
        assert!(root.index(0).is_err());
    }

    #[test]
    fn test_validate_accepts_encoder_output() {
        let bytes = sample();
        Slice::new(&bytes).unwrap().root().validate().unwrap();
    }

    #[test]
    fn test_rejects_missing_header() {
        let err = Slice::new(&[0x00, 0x01, 0x00]).unwrap_err();
        assert!(err.is_corruption());
        assert!(Slice::new(&[]).unwrap_err().is_corruption());
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = encode(&Value::Int(5)).unwrap();
        bytes.push(0);
        assert!(Slice::new(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn test_rejects_unknown_tag() {
        let err = Slice::new(&[0xAE, 0x01, 0x7F]).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_rejects_oversized_string_length() {
        let mut bytes = encode(&Value::from("hello")).unwrap();
        bytes[3] = 0xFF;
        assert!(Slice::new(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn test_rejects_bad_offset() {
        let mut bytes = encode(&Value::Array(vec![Value::Int(1), Value::Int(2)])).unwrap();
        // second offset points outside the body
        bytes[15..19].copy_from_slice(&500u32.to_le_bytes());
        let slice = Slice::new(&bytes).unwrap();
        assert!(slice.root().index(1).unwrap_err().is_corruption());
        assert!(decode(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn test_validate_detects_unsorted_keys() {
        let v = Value::from_json(&json!({"a": 1, "b": 2}));
        let mut bytes = encode(&v).unwrap();
        // swap the single-letter keys in place
        let a = bytes.iter().position(|b| *b == b'a').unwrap();
        let b = bytes.iter().position(|b| *b == b'b').unwrap();
        bytes.swap(a, b);
        let slice = Slice::new(&bytes).unwrap();
        assert!(slice.root().validate().unwrap_err().is_corruption());
        assert!(decode(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn test_decode_restores_every_value_kind() {
        let mut inner = Dict::new();
        inner.insert("ключ".to_string(), Value::from("значение"));
        inner.insert("empty".to_string(), Value::Dict(Dict::new()));
        let mut root = Dict::new();
        root.insert("null".to_string(), Value::Null);
        root.insert("yes".to_string(), Value::Bool(true));
        root.insert("no".to_string(), Value::Bool(false));
        root.insert("min".to_string(), Value::Int(i64::MIN));
        root.insert("max".to_string(), Value::Int(i64::MAX));
        root.insert("zero".to_string(), Value::Int(0));
        root.insert("neg_zero".to_string(), Value::Float(-0.0));
        root.insert("inf".to_string(), Value::Float(f64::INFINITY));
        root.insert("pi".to_string(), Value::Float(3.25));
        root.insert("text".to_string(), Value::from(""));
        root.insert("bytes".to_string(), Value::Binary(Vec::new()));
        root.insert("blob".to_string(), Value::Binary(vec![0, 255, 7]));
        root.insert("list".to_string(), Value::Array(Vec::new()));
        root.insert(
            "nested".to_string(),
            Value::Array(vec![Value::Int(-1), Value::Dict(inner), Value::Array(vec![Value::Null])]),
        );
        let values = [
            Value::Null,
            Value::Int(i64::MIN),
            Value::from("solo"),
            Value::Array(Vec::new()),
            Value::Dict(Dict::new()),
            Value::Dict(root),
        ];
        for value in values {
            let decoded = decode(&encode(&value).unwrap()).unwrap();
            assert_eq!(decoded, value);
        }

        let decoded = decode(&encode(&Value::Float(-0.0)).unwrap()).unwrap();
        match decoded {
            Value::Float(f) => assert!(f == 0.0 && f.is_sign_negative()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
