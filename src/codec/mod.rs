//! Slice/Value codec
//!
//! A compact, self-describing binary encoding for document bodies, used
//! both in the journal and on the wire.
//!
//! # Design Principles
//!
//! 1. Canonical: one value has exactly one encoding (dict keys sorted)
//! 2. Lazy: fields are located through offset tables, not parsed eagerly
//! 3. Defensive: malformed bytes fail with `AERO_CORRUPT_DATA`, never panic
//! 4. Bounded: nesting is limited to `MAX_DEPTH`

mod encoder;
mod errors;
mod slice;
mod value;

pub use encoder::{encode, FORMAT_MAGIC};
pub use errors::{CodecError, CodecErrorCode, CodecResult};
pub use slice::{decode, Slice, ValueRef};
pub use value::{Dict, Value, ValueKind};

/// Maximum nesting depth accepted by the encoder and decoder
pub const MAX_DEPTH: usize = 64;

/// Encodes an empty dict, the body of a tombstone
pub fn empty_dict() -> Vec<u8> {
    let mut bytes = FORMAT_MAGIC.to_vec();
    bytes.push(8);
    bytes.extend_from_slice(&[0; 8]);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_dict_matches_encoder() {
        assert_eq!(empty_dict(), encode(&Value::Dict(Dict::new())).unwrap());
    }
}
